//! Built-in routes registered by [`crate::node::Node::new`].

use std::any::TypeId;
use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use brypt_await::AggregatedEntry;
use brypt_identifier::NodeId;
use brypt_message::{ApplicationParcel, Destination};
use brypt_peer::Next;
use brypt_route::{Handler, ServiceProvider};
use serde_json::json;
use tracing::debug;

use crate::node::PeerRegistry;

pub const INFO_NODE_ROUTE: &str = "/info/node";
pub const FETCH_NODE_ROUTE: &str = "/info/fetch/node";

/// The fan-out deadline an aggregated `/info/fetch/node` request waits on
/// before finalizing with whatever responses have arrived.
const AGGREGATE_DEADLINE: Duration = Duration::from_secs(3);

fn designation(coordinator: bool) -> &'static str {
    if coordinator {
        "coordinator"
    } else {
        "node"
    }
}

/// Builds the JSON object described in spec scenario 1: `cluster`,
/// `neighbor_count`, `designation`, `protocols`, `update_timestamp`.
fn node_info_payload(cluster: u32, coordinator: bool, registry: &PeerRegistry) -> Vec<u8> {
    let payload = json!({
        "cluster": cluster,
        "neighbor_count": registry.len() as u32,
        "designation": designation(coordinator),
        "protocols": ["tcp"],
        "update_timestamp": registry.updated_at(),
    });
    payload.to_string().into_bytes()
}

/// Replies to `/info/node` with this node's cluster, peer count, designation,
/// active transport protocols, and the last time its peer cache changed.
pub struct InfoNodeHandler {
    cluster: u32,
    coordinator: bool,
    registry: OnceLock<Arc<PeerRegistry>>,
}

impl InfoNodeHandler {
    pub fn new(cluster: u32, coordinator: bool) -> Self {
        Self { cluster, coordinator, registry: OnceLock::new() }
    }
}

impl Handler for InfoNodeHandler {
    fn on_fetch_services(&self, provider: &dyn ServiceProvider) -> bool {
        let Some(registry) = provider.fetch(TypeId::of::<PeerRegistry>()) else {
            return false;
        };
        let Ok(registry) = registry.downcast::<PeerRegistry>() else {
            return false;
        };
        self.registry.set(registry).is_ok()
    }

    fn on_message(&self, next: &Next<'_>) -> bool {
        let Some(registry) = self.registry.get() else {
            return false;
        };
        let payload = node_info_payload(self.cluster, self.coordinator, registry);
        next.respond(payload, Some(200))
    }
}

/// Fans out `/info/node` to every known peer and replies with a JSON map from
/// responder identifier (hex) to their info payload, per spec scenario 5.
pub struct FetchNodeHandler {
    local_identifier: NodeId,
    registry: OnceLock<Arc<PeerRegistry>>,
}

impl FetchNodeHandler {
    pub fn new(local_identifier: NodeId) -> Self {
        Self { local_identifier, registry: OnceLock::new() }
    }
}

impl Handler for FetchNodeHandler {
    fn on_fetch_services(&self, provider: &dyn ServiceProvider) -> bool {
        let Some(registry) = provider.fetch(TypeId::of::<PeerRegistry>()) else {
            return false;
        };
        let Ok(registry) = registry.downcast::<PeerRegistry>() else {
            return false;
        };
        self.registry.set(registry).is_ok()
    }

    fn on_message(&self, next: &Next<'_>) -> bool {
        let Some(registry) = self.registry.get().cloned() else {
            return false;
        };

        let expected: Vec<NodeId> = registry.all().iter().map(|peer| peer.identifier().clone()).collect();
        if expected.is_empty() {
            return next.respond(b"{}".to_vec(), Some(200));
        }

        let Ok(notice) = ApplicationParcel::builder()
            .source(self.local_identifier.clone())
            .destination(Destination::Cluster)
            .route(INFO_NODE_ROUTE)
            .build()
        else {
            return false;
        };

        let finalize_local_identifier = self.local_identifier.clone();
        let send_registry = registry.clone();
        next.defer(
            notice,
            expected,
            Instant::now() + AGGREGATE_DEADLINE,
            Box::new(move |responses: BTreeMap<NodeId, AggregatedEntry>| {
                let mut aggregate = serde_json::Map::new();
                for (responder, entry) in responses {
                    let value = match entry {
                        AggregatedEntry::Payload(bytes) => serde_json::from_slice(&bytes)
                            .unwrap_or_else(|_| json!(String::from_utf8_lossy(&bytes).into_owned())),
                        AggregatedEntry::StatusCode(code) => json!({ "status_code": code }),
                    };
                    aggregate.insert(responder.to_hex(), value);
                }
                ApplicationParcel::builder()
                    .source(finalize_local_identifier.clone())
                    .route(FETCH_NODE_ROUTE)
                    .payload(serde_json::Value::Object(aggregate).to_string().into_bytes())
                    .build()
                    .unwrap_or_else(|_| {
                        ApplicationParcel::builder()
                            .source(finalize_local_identifier.clone())
                            .route(FETCH_NODE_ROUTE)
                            .build()
                            .expect("route-only parcel always builds")
                    })
            }),
            Box::new(move |id, parcel| {
                if let Some(peer) = send_registry.get(id) {
                    if !peer.send_application(&parcel) {
                        debug!(peer = %id, "failed to send fetch-node notice");
                    }
                }
            }),
        );
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_provider::NodeServiceProvider;
    use brypt_peer::{ExchangeProcessor, MessageSink, PeerProxy};
    use brypt_security::ExchangeRole;
    use parking_lot::Mutex;

    fn node_id(byte: u8) -> NodeId {
        NodeId::new(vec![byte; 20]).unwrap()
    }

    fn peer(identifier: NodeId) -> Arc<PeerProxy> {
        let exchange = ExchangeProcessor::new(identifier.clone(), ExchangeRole::Acceptor);
        PeerProxy::new(identifier, MessageSink::Exchange(Mutex::new(exchange)))
    }

    #[test]
    fn designation_maps_coordinator_flag_to_the_original_labels() {
        assert_eq!(designation(true), "coordinator");
        assert_eq!(designation(false), "node");
    }

    #[test]
    fn node_info_payload_carries_exactly_the_five_fields() {
        let registry = PeerRegistry::new();
        registry.insert(peer(node_id(2)));
        let bytes = node_info_payload(7, true, &registry);
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        let object = value.as_object().unwrap();
        assert_eq!(object.len(), 5);
        assert_eq!(object["cluster"], json!(7));
        assert_eq!(object["neighbor_count"], json!(1));
        assert_eq!(object["designation"], json!("coordinator"));
        assert_eq!(object["protocols"], json!(["tcp"]));
        assert_eq!(object["update_timestamp"], json!(registry.updated_at()));
    }

    #[test]
    fn info_node_handler_rejects_initialization_without_a_registered_registry() {
        let handler = InfoNodeHandler::new(0, false);
        let provider = NodeServiceProvider::new();
        assert!(!handler.on_fetch_services(&provider));
    }

    #[test]
    fn info_node_handler_accepts_initialization_once_the_registry_is_registered() {
        let handler = InfoNodeHandler::new(0, false);
        let provider = NodeServiceProvider::new();
        let registry = Arc::new(PeerRegistry::new());
        provider.register(registry.clone());
        assert!(handler.on_fetch_services(&provider));
    }

    #[test]
    fn fetch_node_handler_rejects_initialization_without_a_registered_registry() {
        let handler = FetchNodeHandler::new(node_id(1));
        let provider = NodeServiceProvider::new();
        assert!(!handler.on_fetch_services(&provider));
    }
}
