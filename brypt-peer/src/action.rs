//! The `Next` action handed to route handlers, and the `RouteDispatcher` seam
//! that lets the Authorized Processor (C5) reach the route trie (C6) without
//! `brypt-peer` depending on `brypt-route` — `brypt-route` depends on this
//! crate and implements `RouteDispatcher` instead.

use std::sync::{Arc, Weak};
use std::time::Instant;

use brypt_await::{AggregatedEntry, TrackerKey, TrackingService};
use brypt_identifier::NodeId;
use brypt_message::{ApplicationParcel, AwaitableBinding, Destination, Extension};

use crate::context::EndpointId;
use crate::proxy::PeerProxy;

type Finalizer = Box<dyn FnOnce(std::collections::BTreeMap<NodeId, AggregatedEntry>) -> ApplicationParcel + Send>;
type NoticeSink = Box<dyn Fn(&NodeId, ApplicationParcel) + Send>;

/// Implemented by the route trie so the Authorized Processor can dispatch a decoded
/// parcel without a compile-time dependency on it.
pub trait RouteDispatcher: Send + Sync {
    /// Matches `parcel.route`, invokes the handler with a fresh `Next`, and returns
    /// the handler's reported success.
    fn dispatch(&self, peer: Weak<PeerProxy>, endpoint_id: EndpointId, parcel: ApplicationParcel) -> bool;
}

/// Carries everything a handler needs to respond to, or fan out from, one dispatch.
pub struct Next<'a> {
    peer: Weak<PeerProxy>,
    endpoint_id: EndpointId,
    local_identifier: NodeId,
    parcel: &'a ApplicationParcel,
    tracking_service: Arc<TrackingService>,
}

impl<'a> Next<'a> {
    pub fn new(
        peer: Weak<PeerProxy>,
        endpoint_id: EndpointId,
        local_identifier: NodeId,
        parcel: &'a ApplicationParcel,
        tracking_service: Arc<TrackingService>,
    ) -> Self {
        Self {
            peer,
            endpoint_id,
            local_identifier,
            parcel,
            tracking_service,
        }
    }

    pub fn parcel(&self) -> &ApplicationParcel {
        self.parcel
    }

    fn send(&self, built: ApplicationParcel) -> bool {
        let Some(peer) = self.peer.upgrade() else {
            return false;
        };
        let Some(context) = peer.get_message_context(self.endpoint_id) else {
            return false;
        };
        let packed = built.pack_encrypted(
            |body, nonce| context.encrypt(body, nonce).unwrap_or_default(),
            |buffer| context.sign(buffer),
        );
        peer.schedule_send(self.endpoint_id, &packed)
    }

    /// Fire-and-forget to the same peer.
    pub fn dispatch(&self, route: impl Into<String>, payload: Vec<u8>) -> bool {
        let Some(peer) = self.peer.upgrade() else {
            return false;
        };
        let built = ApplicationParcel::builder()
            .source(self.local_identifier.clone())
            .destination(Destination::Node(peer.identifier().clone()))
            .route(route)
            .payload(payload)
            .build();
        match built {
            Ok(parcel) => self.send(parcel),
            Err(_) => false,
        }
    }

    /// Builds and sends a response whose Awaitable extension binds to the incoming
    /// request's tracker key in Response mode, if the incoming parcel carried one.
    pub fn respond(&self, payload: Vec<u8>, status_code: Option<u32>) -> bool {
        let Some(peer) = self.peer.upgrade() else {
            return false;
        };
        let mut builder = ApplicationParcel::builder()
            .source(self.local_identifier.clone())
            .destination(Destination::Node(peer.identifier().clone()))
            .route(self.parcel.route.clone())
            .payload(payload);

        if let Some((tracker_key, AwaitableBinding::Request)) = self.parcel.awaitable() {
            builder = builder.extension(Extension::Awaitable {
                tracker_key: *tracker_key,
                binding: AwaitableBinding::Response,
            });
        }
        if let Some(code) = status_code {
            builder = builder.extension(Extension::Status { code });
        }

        match builder.build() {
            Ok(parcel) => self.send(parcel),
            Err(_) => false,
        }
    }

    /// Registers an aggregated tracker for a "fan-out then reply" route such as
    /// fetch-node, returning its key. `notice` is actually transmitted (addressed
    /// and stamped per recipient) to every member of `expected` via `send_notice`,
    /// which the caller supplies since only it (holding the peer cache) knows how
    /// to resolve a `NodeId` to a sendable peer.
    pub fn defer(
        &self,
        notice: ApplicationParcel,
        expected: Vec<NodeId>,
        deadline: Instant,
        finalize: Finalizer,
        send_notice: NoticeSink,
    ) -> TrackerKey {
        let peer = self.peer.clone();
        let endpoint_id = self.endpoint_id;
        self.tracking_service.defer(
            notice,
            expected,
            deadline,
            finalize,
            send_notice,
            Box::new(move |response| {
                if let Some(peer) = peer.upgrade() {
                    if let Some(context) = peer.get_message_context(endpoint_id) {
                        let packed = response.pack_encrypted(
                            |body, nonce| context.encrypt(body, nonce).unwrap_or_default(),
                            |buffer| context.sign(buffer),
                        );
                        peer.schedule_send(endpoint_id, &packed);
                    }
                }
            }),
        )
    }
}
