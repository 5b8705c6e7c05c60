//! The managed-resource reconcile loop.
//!
//! One [`Reconciler`] is bound to one kind and one provider connector. For
//! every dequeued key it fetches the object, opens a session, observes the
//! external resource, and converges:
//!
//! - deletion pending → delete externally, then clear the finalizer,
//! - absent → create,
//! - present but drifted → update,
//! - otherwise → no-op.
//!
//! Connection details from any operation go to the publish target; status
//! conditions and events record the outcome. The session is always
//! disconnected, on success and error paths alike, and the whole reconcile
//! runs under a deadline.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tether_core::{Condition, Kind, ObjectKey, Observation, Resource};
use tracing::{debug, error, warn};

use crate::connector::{Connector, ConnectorError, Session};
use crate::store::{ConnectionPublisher, Event, EventRecorder, ObjectStore};

/// Finalizer owned by the runtime: it pins objects with live external
/// resources until deletion has been carried out remotely.
pub const FINALIZER: &str = "tether.io/external-resource";

/// Default reconcile deadline.
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default steady-state re-observe cadence.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// What the worker should do with the key after a reconcile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Done with this key until the store changes again.
    Forget,
    /// Re-observe after the given delay.
    RequeueAfter(Duration),
    /// Something failed; retry with exponential backoff.
    RequeueWithBackoff,
}

/// Reconciles objects of one kind through one provider connector.
pub struct Reconciler {
    kind: Kind,
    connector: Arc<Connector>,
    store: Arc<dyn ObjectStore>,
    publisher: Arc<dyn ConnectionPublisher>,
    recorder: Arc<dyn EventRecorder>,
    poll_interval: Duration,
    timeout: Duration,
}

impl Reconciler {
    /// Creates a reconciler with default publisher, recorder, and timings.
    pub fn new(kind: Kind, connector: Arc<Connector>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            kind,
            connector,
            store,
            publisher: Arc::new(crate::store::NopPublisher),
            recorder: Arc::new(crate::store::NopRecorder),
            poll_interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_RECONCILE_TIMEOUT,
        }
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

    /// Sets the steady-state poll interval (jittered ±10% on use).
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the per-reconcile deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The kind this reconciler serves.
    #[must_use]
    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// Runs one reconcile for a key, under the configured deadline.
    pub async fn reconcile(&self, key: &ObjectKey) -> ReconcileOutcome {
        match tokio::time::timeout(self.timeout, self.reconcile_inner(key)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(kind = %self.kind, %key, timeout = ?self.timeout, "reconcile deadline exceeded");
                ReconcileOutcome::RequeueWithBackoff
            }
        }
    }

    async fn reconcile_inner(&self, key: &ObjectKey) -> ReconcileOutcome {
        let mut resource = match self.store.get(&self.kind, key).await {
            Ok(Some(resource)) => resource,
            Ok(None) => {
                debug!(kind = %self.kind, %key, "object gone, dropping key");
                return ReconcileOutcome::Forget;
            }
            Err(e) => {
                warn!(kind = %self.kind, %key, error = %e, "cannot get object");
                return ReconcileOutcome::RequeueWithBackoff;
            }
        };

        let deleting = resource.deletion_timestamp().is_some();

        // The finalizer must hold before anything external exists,
        // otherwise a delete racing the first create could orphan the
        // external resource.
        if !deleting && resource.add_finalizer(FINALIZER) {
            if let Err(e) = self.store.update(&resource).await {
                warn!(kind = %self.kind, %key, error = %e, "cannot add finalizer");
                return ReconcileOutcome::RequeueWithBackoff;
            }
        }

        let mut session = match self.connector.connect(&mut resource).await {
            Ok(session) => session,
            Err(e @ ConnectorError::UnsupportedKind { .. }) => {
                // Misconfiguration; retrying cannot help this controller.
                error!(kind = %self.kind, %key, error = %e, "connector rejected kind");
                self.recorder.record(
                    &resource,
                    Event::warning("UnsupportedResourceKind", e.to_string()),
                );
                return ReconcileOutcome::Forget;
            }
            Err(e) => {
                self.recorder.record(
                    &resource,
                    Event::warning("CannotConnectToProvider", e.to_string()),
                );
                debug!(kind = %self.kind, %key, error = %e, "cannot connect to provider");
                return ReconcileOutcome::RequeueWithBackoff;
            }
        };

        let outcome = self.converge(&mut session, &mut resource, deleting).await;
        // Always, on success and error paths alike; disconnect is
        // idempotent and logs rather than fails.
        session.disconnect().await;
        outcome
    }

    async fn converge(
        &self,
        session: &mut Session,
        resource: &mut Resource,
        deleting: bool,
    ) -> ReconcileOutcome {
        let observation = match session.observe(resource).await {
            Ok(observation) => observation,
            Err(e) => {
                self.recorder.record(
                    resource,
                    Event::warning("CannotObserveExternalResource", e.to_string()),
                );
                debug!(kind = %self.kind, error = %e, "observe failed");
                return ReconcileOutcome::RequeueWithBackoff;
            }
        };

        if !self
            .publish_details(resource, &observation.connection_details)
            .await
        {
            return ReconcileOutcome::RequeueWithBackoff;
        }

        if deleting {
            return self.converge_deletion(session, resource, &observation).await;
        }

        if !observation.exists {
            return self.converge_create(session, resource).await;
        }

        if !observation.up_to_date {
            return self.converge_update(session, resource).await;
        }

        // Steady state: nothing to change externally.
        if observation.late_initialized {
            if let Err(e) = self.store.update(resource).await {
                warn!(kind = %self.kind, error = %e, "cannot persist late-initialized fields");
                return ReconcileOutcome::RequeueWithBackoff;
            }
        }

        resource.set_condition(Condition::ok("Synced", "ReconcileSuccess"));
        resource.set_condition(Condition::ok("Ready", "Available"));
        if let Err(e) = self.store.update_status(resource).await {
            warn!(kind = %self.kind, error = %e, "cannot update status");
            return ReconcileOutcome::RequeueWithBackoff;
        }

        ReconcileOutcome::RequeueAfter(self.jittered_poll_interval())
    }

    async fn converge_deletion(
        &self,
        session: &mut Session,
        resource: &mut Resource,
        observation: &Observation,
    ) -> ReconcileOutcome {
        if observation.exists {
            match session.delete(resource).await {
                Ok(deletion) => {
                    self.recorder.record(
                        resource,
                        Event::normal(
                            "DeletedExternalResource",
                            details_message("deleted external resource", &deletion.additional_details),
                        ),
                    );
                }
                Err(e) => {
                    self.recorder.record(
                        resource,
                        Event::warning("CannotDeleteExternalResource", e.to_string()),
                    );
                    debug!(kind = %self.kind, error = %e, "delete failed");
                    return ReconcileOutcome::RequeueWithBackoff;
                }
            }
        }

        resource.remove_finalizer(FINALIZER);
        if let Err(e) = self.store.update(resource).await {
            warn!(kind = %self.kind, error = %e, "cannot clear finalizer");
            return ReconcileOutcome::RequeueWithBackoff;
        }

        // The store releases the object once the finalizer clears; the
        // next watch event finds nothing and the key is dropped.
        ReconcileOutcome::Forget
    }

    async fn converge_create(
        &self,
        session: &mut Session,
        resource: &mut Resource,
    ) -> ReconcileOutcome {
        match session.create(resource).await {
            Ok(creation) => {
                if !self
                    .publish_details(resource, &creation.connection_details)
                    .await
                {
                    return ReconcileOutcome::RequeueWithBackoff;
                }
                self.recorder.record(
                    resource,
                    Event::normal(
                        "CreatedExternalResource",
                        details_message("created external resource", &creation.additional_details),
                    ),
                );
                resource.set_condition(Condition::ok("Synced", "ReconcileSuccess"));
                resource.set_condition(Condition::not_ok("Ready", "Creating"));
                if let Err(e) = self.store.update_status(resource).await {
                    warn!(kind = %self.kind, error = %e, "cannot update status");
                    return ReconcileOutcome::RequeueWithBackoff;
                }
                ReconcileOutcome::RequeueAfter(self.jittered_poll_interval())
            }
            Err(e) => {
                self.recorder.record(
                    resource,
                    Event::warning("CannotCreateExternalResource", e.to_string()),
                );
                resource.set_condition(Condition::not_ok("Synced", "ReconcileError"));
                let _ = self.store.update_status(resource).await;
                ReconcileOutcome::RequeueWithBackoff
            }
        }
    }

    async fn converge_update(
        &self,
        session: &mut Session,
        resource: &mut Resource,
    ) -> ReconcileOutcome {
        match session.update(resource).await {
            Ok(update) => {
                if !self
                    .publish_details(resource, &update.connection_details)
                    .await
                {
                    return ReconcileOutcome::RequeueWithBackoff;
                }
                self.recorder.record(
                    resource,
                    Event::normal(
                        "UpdatedExternalResource",
                        details_message("updated external resource", &update.additional_details),
                    ),
                );
                resource.set_condition(Condition::ok("Synced", "ReconcileSuccess"));
                resource.set_condition(Condition::ok("Ready", "Available"));
                if let Err(e) = self.store.update_status(resource).await {
                    warn!(kind = %self.kind, error = %e, "cannot update status");
                    return ReconcileOutcome::RequeueWithBackoff;
                }
                ReconcileOutcome::RequeueAfter(self.jittered_poll_interval())
            }
            Err(e) => {
                self.recorder.record(
                    resource,
                    Event::warning("CannotUpdateExternalResource", e.to_string()),
                );
                resource.set_condition(Condition::not_ok("Synced", "ReconcileError"));
                let _ = self.store.update_status(resource).await;
                ReconcileOutcome::RequeueWithBackoff
            }
        }
    }

    async fn publish_details(
        &self,
        resource: &Resource,
        details: &tether_core::ConnectionDetails,
    ) -> bool {
        if details.is_empty() {
            return true;
        }
        match self.publisher.publish(resource, details).await {
            Ok(()) => true,
            Err(e) => {
                self.recorder.record(
                    resource,
                    Event::warning("CannotPublishConnectionDetails", e.to_string()),
                );
                warn!(kind = %self.kind, error = %e, "cannot publish connection details");
                false
            }
        }
    }

    // The documented ±10% spread keeps a fleet of objects created together
    // from re-observing in lockstep.
    fn jittered_poll_interval(&self) -> Duration {
        let factor = rand::thread_rng().gen_range(0.9..=1.1);
        self.poll_interval.mul_f64(factor)
    }
}

fn details_message(
    prefix: &str,
    details: &tether_core::AdditionalDetails,
) -> String {
    if details.is_empty() {
        return prefix.to_string();
    }
    let rendered: Vec<String> = details.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{prefix} ({})", rendered.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_message_renders_pairs() {
        let mut details = tether_core::AdditionalDetails::new();
        details.insert("more".to_string(), "call me back".to_string());
        assert_eq!(
            details_message("created external resource", &details),
            "created external resource (more=call me back)"
        );
        assert_eq!(
            details_message("deleted", &tether_core::AdditionalDetails::new()),
            "deleted"
        );
    }

    #[tokio::test]
    async fn jitter_stays_within_ten_percent() {
        let connector = Arc::new(Connector::new("127.0.0.1:1"));
        let store = Arc::new(crate::store::memory::MemoryStore::new());
        let reconciler = Reconciler::new(
            Kind::new("example.org", "v1", "Widget"),
            connector,
            store,
        )
        .with_poll_interval(Duration::from_secs(60));

        for _ in 0..100 {
            let jittered = reconciler.jittered_poll_interval();
            assert!(jittered >= Duration::from_secs(54));
            assert!(jittered <= Duration::from_secs(66));
        }
    }
}
