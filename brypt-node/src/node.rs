//! Wires the Router, Authorized Processor, Tracking Service, and Scheduler
//! into one process-root owner, matching the original's `BryptNode`/
//! `ServiceProvider` wiring role.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use brypt_await::TrackingService;
use brypt_identifier::NodeId;
use brypt_peer::{AuthorizedDelegate, AuthorizedProcessor, PeerProxy};
use brypt_route::Router;
use brypt_scheduler::{DelegateHost, Registrar};
use parking_lot::Mutex;
use tracing::info;

use crate::bootstrap::BootstrapService;
use crate::service_provider::NodeServiceProvider;

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Known peers keyed by identifier. Endpoint drivers insert on first contact;
/// entries are never evicted here (peer-proxy lifecycle/eviction is an
/// endpoint-driver concern the minimal TCP driver does not yet implement).
///
/// Doubles as this node's network state: `updated_at` tracks the last time the
/// peer cache's membership changed, mirroring the original's
/// `NetworkState::GetUpdatedTimepoint`.
pub struct PeerRegistry {
    peers: Mutex<HashMap<NodeId, Arc<PeerProxy>>>,
    updated_at: AtomicU64,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self { peers: Mutex::new(HashMap::new()), updated_at: AtomicU64::new(now_millis()) }
    }
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, identifier: &NodeId) -> Option<Arc<PeerProxy>> {
        self.peers.lock().get(identifier).cloned()
    }

    pub fn insert(&self, proxy: Arc<PeerProxy>) {
        self.peers.lock().insert(proxy.identifier().clone(), proxy);
        self.updated_at.store(now_millis(), Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every currently known peer, for fan-out routes such as fetch-node.
    pub fn all(&self) -> Vec<Arc<PeerProxy>> {
        self.peers.lock().values().cloned().collect()
    }

    /// Epoch milliseconds the peer cache's membership last changed.
    pub fn updated_at(&self) -> u64 {
        self.updated_at.load(Ordering::Relaxed)
    }
}

/// Wraps the Tracking Service so its `execute(Instant::now())` fits the
/// scheduler's parameterless `DelegateHost::execute`.
struct TrackingDelegate(Arc<TrackingService>);

impl DelegateHost for TrackingDelegate {
    fn owner(&self) -> TypeId {
        TypeId::of::<TrackingService>()
    }

    fn ready(&self) -> bool {
        self.0.ready() > 0
    }

    fn execute(&self) -> usize {
        self.0.execute(Instant::now())
    }
}

pub struct Node {
    pub local_identifier: NodeId,
    pub router: Arc<Router>,
    pub authorized: Arc<AuthorizedProcessor>,
    pub tracking_service: Arc<TrackingService>,
    pub registrar: Arc<Registrar>,
    pub service_provider: Arc<NodeServiceProvider>,
    pub bootstrap: Arc<BootstrapService>,
    pub registry: Arc<PeerRegistry>,
}

impl Node {
    /// Builds every core component and registers the two scheduler delegates.
    /// `build_router` is handed the freshly constructed router before it is
    /// shared, so the caller can register its handlers.
    pub fn new(
        local_identifier: NodeId,
        bootstrap: BootstrapService,
        build_router: impl FnOnce(&mut Router),
    ) -> Arc<Self> {
        let tracking_service = Arc::new(TrackingService::new());
        let mut router = Router::new(local_identifier.clone(), tracking_service.clone());
        build_router(&mut router);
        let router = Arc::new(router);

        let authorized = AuthorizedProcessor::new(local_identifier.clone(), tracking_service.clone(), router.clone());

        let service_provider = Arc::new(NodeServiceProvider::new());
        let bootstrap = Arc::new(bootstrap);
        service_provider.register(bootstrap.clone());
        let registry = Arc::new(PeerRegistry::new());
        service_provider.register(registry.clone());

        let registrar = Arc::new(Registrar::new());
        registrar
            .register(Box::new(AuthorizedDelegate(authorized.clone())))
            .depends_on(TypeId::of::<BootstrapService>())
            .finish();
        registrar.register(Box::new(TrackingDelegate(tracking_service.clone()))).finish();

        Arc::new(Self {
            local_identifier,
            router,
            authorized,
            tracking_service,
            registrar,
            service_provider,
            bootstrap,
            registry,
        })
    }

    /// Resolves every registered handler's service dependencies. Must run
    /// once before the first `run_cycle`.
    pub fn initialize(&self) -> bool {
        let ready = self.router.initialize(self.service_provider.as_ref());
        if !ready {
            tracing::warn!("a route handler rejected service initialization");
        }
        info!(node = %self.local_identifier, known_peers = self.bootstrap.known_identifiers().len(), "node initialized");
        ready
    }

    /// Drains one scheduler cycle (Authorized Processor, then Tracking Service).
    pub fn run_cycle(&self) -> usize {
        self.registrar.run_once()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_node_initializes_with_no_registered_handlers() {
        let identifier = NodeId::new(vec![1u8; 20]).unwrap();
        let node = Node::new(identifier, BootstrapService::empty(), |_router| {});
        assert!(node.initialize());
        assert_eq!(node.run_cycle(), 0);
    }

    #[test]
    fn peer_registry_inserts_and_looks_up_by_identifier() {
        let registry = PeerRegistry::new();
        assert!(registry.is_empty());
        let identifier = NodeId::new(vec![9u8; 20]).unwrap();
        let exchange = brypt_peer::ExchangeProcessor::new(identifier.clone(), brypt_security::ExchangeRole::Acceptor);
        let proxy = PeerProxy::new(identifier.clone(), brypt_peer::MessageSink::Exchange(Mutex::new(exchange)));
        registry.insert(proxy);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&identifier).is_some());
    }
}
