//! Process-root crate: wires every collaborator crate into a running mesh
//! node and drives its main loop. See [`run`] for the entry point `main.rs`
//! calls after parsing configuration.

pub mod bootstrap;
pub mod connect;
pub mod endpoint;
pub mod handlers;
pub mod identity;
pub mod node;
pub mod service_provider;

use std::sync::Arc;
use std::time::Duration;

use brypt_config::Settings;
use tracing::{error, info, warn};

use crate::bootstrap::BootstrapService;
use crate::connect::NodeConnectProtocol;
use crate::endpoint::Shared;
use crate::handlers::{FetchNodeHandler, InfoNodeHandler, FETCH_NODE_ROUTE, INFO_NODE_ROUTE};
use crate::node::Node;

/// Loads/mints identity, loads the bootstrap cache, builds the [`Node`],
/// spawns the listener and every configured outbound connection, and drives
/// the scheduler on a fixed tick until the process is killed.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let local_identifier = identity::load_or_create(&settings.identity_seed_path)?;
    info!(node = %local_identifier, "starting brypt node");

    let bootstrap = match BootstrapService::load(&settings.bootstrap_cache_path) {
        Ok(service) => service,
        Err(error) => {
            warn!(%error, "no usable bootstrap cache, starting with an empty one");
            BootstrapService::empty()
        }
    };

    let handler_identifier = local_identifier.clone();
    let cluster = settings.cluster;
    let coordinator = settings.coordinator;
    let node = Node::new(local_identifier.clone(), bootstrap, move |router| {
        router
            .register(INFO_NODE_ROUTE, Arc::new(InfoNodeHandler::new(cluster, coordinator)))
            .expect("/info/node is a valid route");
        router
            .register(FETCH_NODE_ROUTE, Arc::new(FetchNodeHandler::new(handler_identifier.clone())))
            .expect("/info/fetch/node is a valid route");
    });
    if !node.initialize() {
        anyhow::bail!("a route handler rejected service initialization");
    }

    let shared = Arc::new(Shared {
        local_identifier: node.local_identifier.clone(),
        registry: node.registry.clone(),
        authorized: node.authorized.clone(),
        connect: Arc::new(NodeConnectProtocol::new(node.local_identifier.clone())),
    });

    for address in &settings.connect_addresses {
        let shared = shared.clone();
        let address = *address;
        tokio::spawn(async move {
            if let Err(error) = endpoint::connect(address, shared).await {
                error!(%address, %error, "failed to connect to peer");
            }
        });
    }

    let scheduler_node = node.clone();
    tokio::spawn(async move {
        let mut ticks = tokio::time::interval(Duration::from_millis(100));
        loop {
            ticks.tick().await;
            scheduler_node.run_cycle();
        }
    });

    endpoint::listen(settings.bind_address, shared).await?;
    Ok(())
}
