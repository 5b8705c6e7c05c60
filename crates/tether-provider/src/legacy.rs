//! Legacy unary service.
//!
//! The same logical CRUD as the session stream, one RPC per operation.
//! Each call decodes the resource, resolves the handler for its kind, and
//! drives a short-lived external client. A connection cache keyed by
//! `kind + namespace/name` amortizes connect cost across successive
//! operations on the same resource; cached clients are closed on `Delete`
//! and at shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use tether_core::proto::{
    request, response, CreateResponse, DeleteResponse, Method, ObserveResponse, Request, Response,
    StatusCode, UpdateResponse,
};
use tether_core::{Kind, Resource};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::external::ExternalClient;
use crate::registry::HandlerRegistry;
use crate::session::{decode_resource, encode_back, Abort};

pub(crate) struct LegacyService {
    registry: Arc<HandlerRegistry>,
    connections: Mutex<HashMap<String, Arc<dyn ExternalClient>>>,
}

impl LegacyService {
    pub(crate) fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self {
            registry,
            connections: Mutex::new(HashMap::new()),
        }
    }

    /// Handles one unary operation.
    pub(crate) async fn handle(
        &self,
        method: Method,
        request: &Request,
    ) -> Result<Response, Abort> {
        if !op_matches_method(request, method) {
            return Err(Abort::new(
                StatusCode::InvalidArgument,
                format!(
                    "stream opened for {method:?} carried a {} request",
                    request.op_name()
                ),
            ));
        }

        let (mut resource, kind) = decode_resource(request)?;
        let cache_key = cache_key(&kind, &resource);
        let client = self.client_for(&cache_key, &kind, &mut resource).await?;

        let op = match method {
            Method::Observe => {
                let obs = client
                    .observe(&mut resource)
                    .await
                    .map_err(|e| Abort::new(StatusCode::Internal, e.to_string()))?;
                response::Op::Observe(ObserveResponse {
                    resource: Some(encode_back(&resource)?),
                    connection_details: obs.connection_details,
                    resource_exists: obs.exists,
                    resource_up_to_date: obs.up_to_date,
                    resource_late_initialized: obs.late_initialized,
                })
            }
            Method::Create => {
                let creation = client
                    .create(&mut resource)
                    .await
                    .map_err(|e| Abort::new(StatusCode::Internal, e.to_string()))?;
                response::Op::Create(CreateResponse {
                    resource: Some(encode_back(&resource)?),
                    connection_details: creation.connection_details,
                    additional_details: creation.additional_details,
                })
            }
            Method::Update => {
                let update = client
                    .update(&mut resource)
                    .await
                    .map_err(|e| Abort::new(StatusCode::Internal, e.to_string()))?;
                response::Op::Update(UpdateResponse {
                    resource: Some(encode_back(&resource)?),
                    connection_details: update.connection_details,
                    additional_details: update.additional_details,
                })
            }
            Method::Delete => {
                let deletion = client
                    .delete(&mut resource)
                    .await
                    .map_err(|e| Abort::new(StatusCode::Internal, e.to_string()))?;
                self.evict(&cache_key).await;
                response::Op::Delete(DeleteResponse {
                    resource: Some(encode_back(&resource)?),
                    additional_details: deletion.additional_details,
                })
            }
            Method::Session | Method::Discover | Method::Unspecified => {
                return Err(Abort::new(
                    StatusCode::InvalidArgument,
                    format!("{method:?} is not a legacy unary method"),
                ));
            }
        };

        Ok(Response { op: Some(op) })
    }

    async fn client_for(
        &self,
        cache_key: &str,
        kind: &Kind,
        resource: &mut Resource,
    ) -> Result<Arc<dyn ExternalClient>, Abort> {
        let mut connections = self.connections.lock().await;
        if let Some(client) = connections.get(cache_key) {
            return Ok(client.clone());
        }

        let connector = self.registry.lookup(kind).ok_or_else(|| {
            Abort::new(
                StatusCode::NotFound,
                format!("no matching resource type handler found for {kind}"),
            )
        })?;

        let client: Arc<dyn ExternalClient> = Arc::from(
            connector
                .connect(resource)
                .await
                .map_err(|e| Abort::new(StatusCode::Internal, e.to_string()))?,
        );
        debug!(key = %cache_key, "cached legacy external client");
        connections.insert(cache_key.to_string(), client.clone());
        Ok(client)
    }

    async fn evict(&self, cache_key: &str) {
        let client = self.connections.lock().await.remove(cache_key);
        if let Some(client) = client {
            if let Err(e) = client.close().await {
                warn!(key = %cache_key, error = %e, "error closing cached client");
            }
        }
    }

    /// Closes every cached client. Called once at server shutdown.
    pub(crate) async fn shutdown(&self) {
        let drained: Vec<_> = self.connections.lock().await.drain().collect();
        for (key, client) in drained {
            if let Err(e) = client.close().await {
                warn!(key = %key, error = %e, "error closing cached client at shutdown");
            }
        }
    }
}

// Stable across reconciles, unlike an address-derived key: two calls for
// the same declarative object always land on the same cache entry.
fn cache_key(kind: &Kind, resource: &Resource) -> String {
    format!("{kind}/{}", resource.object_key())
}

fn op_matches_method(request: &Request, method: Method) -> bool {
    matches!(
        (&request.op, method),
        (Some(request::Op::Observe(_)), Method::Observe)
            | (Some(request::Op::Create(_)), Method::Create)
            | (Some(request::Op::Update(_)), Method::Update)
            | (Some(request::Op::Delete(_)), Method::Delete)
    )
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::json;
    use tether_core::proto::{CreateRequest, DeleteRequest, ObserveRequest};
    use tether_core::{codec, Creation, Deletion, Observation, Update};

    use super::*;
    use crate::external::{ExternalConnector, ExternalError};

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        closes: AtomicUsize,
    }

    struct CountingConnector(Arc<Counters>);

    #[async_trait]
    impl ExternalConnector for CountingConnector {
        async fn connect(
            &self,
            _resource: &mut Resource,
        ) -> Result<Box<dyn ExternalClient>, ExternalError> {
            self.0.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(CountingClient(self.0.clone())))
        }
    }

    struct CountingClient(Arc<Counters>);

    #[async_trait]
    impl ExternalClient for CountingClient {
        async fn observe(&self, _r: &mut Resource) -> Result<Observation, ExternalError> {
            Ok(Observation {
                exists: true,
                ..Default::default()
            })
        }
        async fn create(&self, _r: &mut Resource) -> Result<Creation, ExternalError> {
            Ok(Default::default())
        }
        async fn update(&self, _r: &mut Resource) -> Result<Update, ExternalError> {
            Ok(Default::default())
        }
        async fn delete(&self, _r: &mut Resource) -> Result<Deletion, ExternalError> {
            Ok(Default::default())
        }
        async fn close(&self) -> Result<(), ExternalError> {
            self.0.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn service(counters: &Arc<Counters>) -> LegacyService {
        let registry = Arc::new(HandlerRegistry::new());
        registry
            .register(
                Kind::new("example.org", "v1", "Widget"),
                Arc::new(CountingConnector(counters.clone())),
            )
            .unwrap();
        LegacyService::new(registry)
    }

    fn payload(name: &str) -> prost_types::Struct {
        codec::encode(
            &Resource::from_value(json!({
                "apiVersion": "example.org/v1",
                "kind": "Widget",
                "metadata": { "name": name, "namespace": "default" },
            }))
            .unwrap(),
        )
        .unwrap()
    }

    fn observe(name: &str) -> Request {
        Request {
            op: Some(request::Op::Observe(ObserveRequest {
                resource: Some(payload(name)),
            })),
        }
    }

    #[tokio::test]
    async fn cache_amortizes_connects_per_resource() {
        let counters = Arc::new(Counters::default());
        let service = service(&counters);

        service.handle(Method::Observe, &observe("w1")).await.unwrap();
        service.handle(Method::Observe, &observe("w1")).await.unwrap();
        assert_eq!(counters.connects.load(Ordering::SeqCst), 1);

        // A different resource gets its own client.
        service.handle(Method::Observe, &observe("w2")).await.unwrap();
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn delete_evicts_and_closes_the_cached_client() {
        let counters = Arc::new(Counters::default());
        let service = service(&counters);

        service.handle(Method::Observe, &observe("w1")).await.unwrap();
        let delete = Request {
            op: Some(request::Op::Delete(DeleteRequest {
                resource: Some(payload("w1")),
            })),
        };
        service.handle(Method::Delete, &delete).await.unwrap();
        assert_eq!(counters.closes.load(Ordering::SeqCst), 1);

        // The next op reconnects.
        service.handle(Method::Observe, &observe("w1")).await.unwrap();
        assert_eq!(counters.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn shutdown_closes_all_cached_clients() {
        let counters = Arc::new(Counters::default());
        let service = service(&counters);
        service.handle(Method::Observe, &observe("w1")).await.unwrap();
        service.handle(Method::Observe, &observe("w2")).await.unwrap();
        service.shutdown().await;
        assert_eq!(counters.closes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn mismatched_op_is_rejected() {
        let counters = Arc::new(Counters::default());
        let service = service(&counters);
        let create = Request {
            op: Some(request::Op::Create(CreateRequest {
                resource: Some(payload("w1")),
            })),
        };
        let err = service.handle(Method::Observe, &create).await.unwrap_err();
        assert_eq!(err.status().code(), StatusCode::InvalidArgument);
    }
}
