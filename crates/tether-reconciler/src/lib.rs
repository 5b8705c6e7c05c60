//! # tether-reconciler
//!
//! Client side of the tether controller runtime: the connector/session
//! layer that talks to providers, and the dynamic controller engine that
//! hosts one reconcile loop per configured resource kind.
//!
//! A reconcile is one pass of observe → create/update/delete → status
//! update for one object, with the provider-specific work forwarded over
//! a session. The engine wires store watches into per-controller
//! workqueues; queues coalesce by key and guarantee at most one in-flight
//! reconcile per object.
//!
//! ## Modules
//!
//! - [`connector`]: shared transports, connectors, and one-shot sessions
//! - [`store`]: external collaborator seams (object store, publisher,
//!   recorder) and in-memory implementations
//! - [`queue`]: the per-controller workqueue
//! - [`reconcile`]: the reconcile algorithm
//! - [`controller`]: controller records and worker pools
//! - [`engine`]: startup, discovery merging, and shutdown
//! - [`config`]: the JSON configuration schema
//! - [`leader`]: leader election seam
//! - [`metrics`]: Prometheus metric families

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connector;
pub mod controller;
pub mod engine;
pub mod leader;
pub mod metrics;
pub mod queue;
pub mod reconcile;
pub mod store;

pub use config::{ConfigError, ProviderEntry, ResourceTypeConfig, RuntimeConfig};
pub use connector::{
    Connector, ConnectorError, ConnectorManager, Session, SessionError, Transport, TransportError,
};
pub use controller::Controller;
pub use engine::{Engine, EngineError, EngineOptions};
pub use queue::WorkQueue;
pub use reconcile::{ReconcileOutcome, Reconciler, FINALIZER};
