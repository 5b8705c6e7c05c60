//! Provider setup helpers.
//!
//! [`ProviderBuilder`] wraps handler registration and server startup for
//! provider processes. [`ProviderBuilder::from_env`] reads the standard
//! environment surface so embedding a server in an existing provider is a
//! one-liner:
//!
//! - `GRPC_SERVER_ENABLED`: `"true"` enables the server (default off)
//! - `GRPC_SERVER_ADDRESS`: listen address (default `0.0.0.0:50051`)
//! - `GRPC_SERVER_TLS_CERT` / `GRPC_SERVER_TLS_KEY`: paths to TLS material
//!
//! TLS material loading itself is the deployment's concern; the paths are
//! surfaced so the embedding process can terminate TLS around the
//! listener. Transport credentials are injected, not managed here.

use std::path::PathBuf;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::external::ExternalConnector;
use crate::registry::{HandlerRegistry, RegisterError};
use crate::server::{ProviderServer, ServeError, ServerConfig};

/// Default listen address when the environment does not set one.
pub const DEFAULT_ADDRESS: &str = "0.0.0.0:50051";

/// Paths to TLS material supplied by the deployment.
#[derive(Debug, Clone)]
pub struct TlsPaths {
    /// Certificate path.
    pub cert: PathBuf,
    /// Private key path.
    pub key: PathBuf,
}

/// Errors raised while reading the environment surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SetupError {
    /// Only one of the two TLS variables was set.
    #[error("GRPC_SERVER_TLS_CERT and GRPC_SERVER_TLS_KEY must be set together")]
    PartialTls,
}

/// Builder wiring handlers into a runnable provider server.
pub struct ProviderBuilder {
    registry: Arc<HandlerRegistry>,
    address: String,
    tls: Option<TlsPaths>,
    config: ServerConfig,
}

impl Default for ProviderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderBuilder {
    /// Creates a builder with the default address and an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Arc::new(HandlerRegistry::new()),
            address: DEFAULT_ADDRESS.to_string(),
            tls: None,
            config: ServerConfig::default(),
        }
    }

    /// Builds from the `GRPC_SERVER_*` environment surface.
    ///
    /// Returns `None` when `GRPC_SERVER_ENABLED` is unset or not `"true"`.
    ///
    /// # Errors
    ///
    /// Returns [`SetupError::PartialTls`] when only one TLS path is set.
    pub fn from_env() -> Result<Option<Self>, SetupError> {
        let enabled = std::env::var("GRPC_SERVER_ENABLED")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        if !enabled {
            info!("provider server is disabled");
            return Ok(None);
        }

        let mut builder = Self::new();
        if let Ok(address) = std::env::var("GRPC_SERVER_ADDRESS") {
            if !address.is_empty() {
                builder.address = normalize_address(&address);
            }
        }

        let cert = std::env::var("GRPC_SERVER_TLS_CERT").ok().filter(|v| !v.is_empty());
        let key = std::env::var("GRPC_SERVER_TLS_KEY").ok().filter(|v| !v.is_empty());
        builder.tls = match (cert, key) {
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: PathBuf::from(cert),
                key: PathBuf::from(key),
            }),
            (None, None) => None,
            _ => return Err(SetupError::PartialTls),
        };

        Ok(Some(builder))
    }

    /// Registers a connector for a kind.
    ///
    /// # Errors
    ///
    /// Returns [`RegisterError`] for empty or duplicate kinds.
    pub fn register(
        &self,
        kind: tether_core::Kind,
        connector: Arc<dyn ExternalConnector>,
    ) -> Result<(), RegisterError> {
        self.registry.register(kind, connector)
    }

    /// Overrides the listen address.
    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = normalize_address(&address.into());
        self
    }

    /// The configured listen address.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The configured TLS paths, if any.
    #[must_use]
    pub fn tls(&self) -> Option<&TlsPaths> {
        self.tls.as_ref()
    }

    /// Binds the address and serves until cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ServeError`] on bind or accept failure.
    pub async fn serve(self, cancel: CancellationToken) -> Result<(), ServeError> {
        if let Some(tls) = &self.tls {
            info!(cert = ?tls.cert, key = ?tls.key, "TLS material paths supplied by deployment");
        }
        let listener = ProviderServer::bind(&self.address).await?;
        let server = Arc::new(ProviderServer::with_config(self.registry, self.config));
        server.serve(listener, cancel).await
    }

    /// Spawns [`serve`](Self::serve) on the runtime.
    pub fn spawn(
        self,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<Result<(), ServeError>> {
        tokio::spawn(self.serve(cancel))
    }
}

// Accepts the `:50051` shorthand by binding all interfaces.
fn normalize_address(address: &str) -> String {
    if let Some(port) = address.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_bare_port_addresses() {
        assert_eq!(normalize_address(":50051"), "0.0.0.0:50051");
        assert_eq!(normalize_address("127.0.0.1:9000"), "127.0.0.1:9000");
    }

    #[test]
    fn builder_defaults() {
        let builder = ProviderBuilder::new();
        assert_eq!(builder.address(), DEFAULT_ADDRESS);
        assert!(builder.tls().is_none());
    }
}
