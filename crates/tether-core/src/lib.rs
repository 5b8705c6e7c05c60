//! # tether-core
//!
//! Shared foundation of the tether controller runtime: resource kind
//! triples, untyped declarative objects, the envelope codec, and the framed
//! wire protocol spoken between reconcilers and providers.
//!
//! The runtime manages declarative resources whose schemas are unknown at
//! build time. A reconciler process hosts one controller per kind and
//! forwards all provider-specific work over the protocol defined here; the
//! provider side routes each session to a registered handler for the
//! session's pinned kind.
//!
//! ## Modules
//!
//! - [`kind`]: `(group, version, kind)` identifiers
//! - [`resource`]: untyped declarative objects and metadata accessors
//! - [`codec`]: object ↔ payload conversion (the only translation point)
//! - [`outcome`]: operation outcome types shared by client and provider
//! - [`proto`]: framing, handshake, and message types
//! - [`session`]: the session phase machine

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod kind;
pub mod outcome;
pub mod proto;
pub mod resource;
pub mod session;

pub use codec::CodecError;
pub use kind::{Kind, KindError};
pub use outcome::{AdditionalDetails, ConnectionDetails, Creation, Deletion, Observation, Update};
pub use resource::{Condition, ObjectKey, Resource, ResourceError};
pub use session::{PhaseError, SessionPhase};
