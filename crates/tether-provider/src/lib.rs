//! # tether-provider
//!
//! Provider-side session router for the tether controller runtime.
//!
//! A provider process registers one external-connector factory per resource
//! kind, then serves the wire protocol: inbound session streams are routed
//! to the handler for their pinned kind, discovery enumerates the
//! registered kinds, and the legacy unary service answers one CRUD
//! operation per call. Per-session state stays on the session task; the
//! registry is the only shared structure on the hot path.
//!
//! ## Modules
//!
//! - [`external`]: the traits provider handlers implement
//! - [`registry`]: kind → handler factory registry
//! - [`server`]: the accept loop and stream router
//! - [`builder`]: setup helpers and the `GRPC_SERVER_*` env surface

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod builder;
pub mod external;
mod legacy;
pub mod registry;
pub mod server;
mod session;

pub use builder::{ProviderBuilder, SetupError, TlsPaths, DEFAULT_ADDRESS};
pub use external::{ExternalClient, ExternalConnector, ExternalError};
pub use registry::{HandlerRegistry, RegisterError};
pub use server::{ProviderServer, ServeError, ServerConfig};
