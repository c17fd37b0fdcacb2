//! The Connect Protocol follow-up: the Initiator side of a just-finished
//! handshake immediately sends a fresh authenticated Application request,
//! establishing the application session the way the original synchronizer's
//! `IConnectProtocol::SendRequest` does right after `Finalize()`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use brypt_identifier::NodeId;
use brypt_message::{ApplicationParcel, Destination};
use brypt_peer::{AuthorizedProcessor, ConnectProtocol, PeerProxy};
use tracing::{debug, warn};

use crate::handlers::INFO_NODE_ROUTE;

const FOLLOW_UP_DEADLINE: Duration = Duration::from_secs(5);

/// Sends a `/info/node` request to a peer as soon as its handshake completes.
pub struct NodeConnectProtocol {
    local_identifier: NodeId,
}

impl NodeConnectProtocol {
    pub fn new(local_identifier: NodeId) -> Self {
        Self { local_identifier }
    }
}

impl ConnectProtocol for NodeConnectProtocol {
    fn send_request(&self, peer: &Arc<PeerProxy>, authorized: &Arc<AuthorizedProcessor>) -> bool {
        let Ok(request) = ApplicationParcel::builder()
            .source(self.local_identifier.clone())
            .destination(Destination::Node(peer.identifier().clone()))
            .route(INFO_NODE_ROUTE)
            .build()
        else {
            return false;
        };

        let peer_identifier = peer.identifier().clone();
        let (_key, stamped) = authorized.tracking_service().stage_request(
            request,
            Instant::now() + FOLLOW_UP_DEADLINE,
            Box::new(move |_response| {
                debug!(peer = %peer_identifier, "connect protocol follow-up request answered");
            }),
            Box::new({
                let peer_identifier = peer.identifier().clone();
                move |error| {
                    warn!(peer = %peer_identifier, %error, "connect protocol follow-up request failed");
                }
            }),
        );

        peer.send_application(&stamped)
    }
}
