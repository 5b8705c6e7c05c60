//! The dynamic controller engine.
//!
//! Given a configuration enumerating provider endpoints and resource
//! kinds, the engine builds one connector per endpoint, optionally merges
//! provider-discovered kinds into the configured set, and spins up one
//! controller (workqueue + worker pool + reconciler) per kind. Store
//! watches feed the queues; existing objects are seeded at startup so
//! nothing waits for its next change.
//!
//! Ownership flows one way: the engine holds controllers, controllers
//! hold reconcilers, reconcilers hold references to connectors the engine
//! owns through its manager. Shutdown tears down top-down: cancel the
//! root token, stop every controller, then close the connectors.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tether_core::Kind;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ConfigError, RuntimeConfig};
use crate::connector::ConnectorManager;
use crate::controller::Controller;
use crate::metrics::EngineMetrics;
use crate::queue::WorkQueue;
use crate::reconcile::{Reconciler, DEFAULT_POLL_INTERVAL};
use crate::store::{
    ConnectionPublisher, EventRecorder, NopPublisher, NopRecorder, ObjectStore, StoreError,
};

/// Default workers per controller.
pub const DEFAULT_MAX_RECONCILE_RATE: usize = 10;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Workers per controller.
    pub max_reconcile_rate: usize,
    /// Steady-state re-observe cadence (jittered ±10% on use).
    pub poll_interval: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_reconcile_rate: DEFAULT_MAX_RECONCILE_RATE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Errors raised during engine startup.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Two controllers resolved to the same name.
    #[error("controller name {name} is not unique")]
    DuplicateController {
        /// The contested name.
        name: String,
    },

    /// The store rejected a watch or list during startup.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Hosts one controller per configured (or discovered) kind.
pub struct Engine {
    config: RuntimeConfig,
    options: EngineOptions,
    store: Arc<dyn ObjectStore>,
    publisher: Arc<dyn ConnectionPublisher>,
    recorder: Arc<dyn EventRecorder>,
    manager: Arc<ConnectorManager>,
    metrics: Option<EngineMetrics>,
    cancel: CancellationToken,
    controllers: tokio::sync::Mutex<Vec<Controller>>,
}

impl Engine {
    /// Creates an engine over a store with default collaborators.
    pub fn new(config: RuntimeConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            options: EngineOptions::default(),
            store,
            publisher: Arc::new(NopPublisher),
            recorder: Arc::new(NopRecorder),
            manager: Arc::new(ConnectorManager::new()),
            metrics: None,
            cancel: CancellationToken::new(),
            controllers: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Overrides the tuning knobs.
    #[must_use]
    pub fn with_options(mut self, options: EngineOptions) -> Self {
        self.options = options;
        self
    }

    /// Sets the connection-detail publish target.
    #[must_use]
    pub fn with_publisher(mut self, publisher: Arc<dyn ConnectionPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    /// Sets the event recorder.
    #[must_use]
    pub fn with_recorder(mut self, recorder: Arc<dyn EventRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    /// Attaches reconcile metrics.
    #[must_use]
    pub fn with_metrics(mut self, metrics: EngineMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// The connector manager, mainly for tests and diagnostics.
    #[must_use]
    pub fn connector_manager(&self) -> Arc<ConnectorManager> {
        self.manager.clone()
    }

    /// Validates the configuration and starts every controller.
    ///
    /// Discovery failures are non-fatal: the provider's configured kinds
    /// are used as-is.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError`] on invalid configuration, duplicate
    /// controller names, or store failures while installing watches.
    pub async fn start(&self) -> Result<(), EngineError> {
        self.config.validate()?;

        let mut names = HashSet::new();
        let mut started = 0usize;

        for provider in &self.config.providers {
            let configured = provider.kinds()?;
            let connector = self
                .manager
                .get_or_create(&provider.endpoint, configured.clone());

            let mut kinds = configured;
            match connector.discover().await {
                Ok(discovered) => {
                    for kind in discovered {
                        if !kinds.contains(&kind) {
                            info!(provider = %provider.name, kind = %kind, "adopting discovered kind");
                            connector.allow_kind(kind.clone());
                            kinds.push(kind);
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        provider = %provider.name,
                        endpoint = %provider.endpoint,
                        error = %e,
                        "discovery failed, proceeding with configured kinds"
                    );
                }
            }

            if kinds.is_empty() {
                warn!(provider = %provider.name, "provider has no configured or discovered kinds");
                continue;
            }

            for kind in kinds {
                let name = controller_name(&kind, &provider.name);
                if !names.insert(name.clone()) {
                    return Err(EngineError::DuplicateController { name });
                }

                let queue = WorkQueue::new();
                {
                    let queue = queue.clone();
                    self.store.add_watch(
                        &kind,
                        Box::new(move |resource| queue.add(resource.object_key())),
                    )?;
                }
                // Objects that existed before the watch still reconcile.
                for resource in self.store.list(&kind).await? {
                    queue.add(resource.object_key());
                }

                let reconciler = Arc::new(
                    Reconciler::new(kind.clone(), connector.clone(), self.store.clone())
                        .with_publisher(self.publisher.clone())
                        .with_recorder(self.recorder.clone())
                        .with_poll_interval(self.options.poll_interval),
                );

                let controller = Controller::start(
                    name,
                    kind,
                    queue,
                    reconciler,
                    self.options.max_reconcile_rate,
                    self.cancel.child_token(),
                    self.metrics.clone(),
                );
                self.controllers.lock().await.push(controller);
                started += 1;
            }
        }

        info!(controllers = started, "engine started");
        Ok(())
    }

    /// Names of the running controllers.
    pub async fn controller_names(&self) -> Vec<String> {
        self.controllers
            .lock()
            .await
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Stops every controller, drains their queues, and closes all
    /// provider connectors.
    pub async fn shutdown(&self) {
        info!("engine shutting down");
        self.cancel.cancel();

        let controllers = std::mem::take(&mut *self.controllers.lock().await);
        for controller in &controllers {
            controller.stop().await;
        }
        self.manager.close_all();
        info!("engine shut down");
    }
}

// Mirrors the kind triple plus the provider that owns the controller.
fn controller_name(kind: &Kind, provider: &str) -> String {
    format!("{}.{}.{}", kind.kind, kind.group, provider)
}
