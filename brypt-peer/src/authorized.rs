//! The sole entry point for bytes from an authorized peer (C5).

use std::any::TypeId;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use brypt_await::TrackingService;
use brypt_identifier::NodeId;
use brypt_message::{
    ApplicationParcel, AwaitableBinding, Destination, MessageError, PlatformParcel, PlatformType, Protocol,
};
use brypt_scheduler::DelegateHost;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::action::RouteDispatcher;
use crate::context::EndpointId;
use crate::proxy::PeerProxy;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthorizedError {
    #[error("parcel failed to parse or verify")]
    Format(#[from] MessageError),
    #[error("non-handshake destination addressed to a different node")]
    DestinationMismatch,
    #[error("dropped silently: a heartbeat response carries no further action")]
    HeartbeatResponseDropped,
    #[error("application parcel failed signature verification")]
    VerificationFailure,
}

pub struct AuthorizedProcessor {
    local_identifier: NodeId,
    queue: Mutex<VecDeque<(Weak<PeerProxy>, EndpointId, ApplicationParcel)>>,
    invalid_count: AtomicU64,
    tracking_service: Arc<TrackingService>,
    route_dispatcher: Arc<dyn RouteDispatcher>,
}

impl AuthorizedProcessor {
    pub fn new(
        local_identifier: NodeId,
        tracking_service: Arc<TrackingService>,
        route_dispatcher: Arc<dyn RouteDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_identifier,
            queue: Mutex::new(VecDeque::new()),
            invalid_count: AtomicU64::new(0),
            tracking_service,
            route_dispatcher,
        })
    }

    pub fn message_count(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn invalid_count(&self) -> u64 {
        self.invalid_count.load(Ordering::Relaxed)
    }

    /// The tracking service this processor feeds arriving `Awaitable(Response, _)`
    /// parcels to. Exposed so a `ConnectProtocol` can stage a deferred request
    /// against the same table on promotion.
    pub fn tracking_service(&self) -> &Arc<TrackingService> {
        &self.tracking_service
    }

    /// Decodes and classifies one inbound buffer, handling Platform traffic inline
    /// and queueing Application traffic (except awaitable responses, routed straight
    /// to the Tracking Service).
    pub fn collect_message(
        &self,
        peer: Weak<PeerProxy>,
        buffer: &[u8],
    ) -> Result<(), AuthorizedError> {
        self.collect_message_on(peer, 0, buffer)
    }

    pub fn collect_message_on(
        &self,
        peer: Weak<PeerProxy>,
        endpoint_id: EndpointId,
        buffer: &[u8],
    ) -> Result<(), AuthorizedError> {
        let text = std::str::from_utf8(buffer).map_err(|_| AuthorizedError::Format(MessageError::InvalidEncoding))?;
        let decoded = brypt_message::z85_decode(text).ok_or(AuthorizedError::Format(MessageError::InvalidEncoding))?;

        match brypt_message::peek_protocol(&decoded) {
            Some(Protocol::Platform) => self.handle_platform(peer, endpoint_id, &decoded),
            Some(Protocol::Application) => self.handle_application(peer, endpoint_id, &decoded),
            None => Err(AuthorizedError::Format(MessageError::HeaderTooShort)),
        }
    }

    fn handle_platform(
        &self,
        peer: Weak<PeerProxy>,
        endpoint_id: EndpointId,
        decoded: &[u8],
    ) -> Result<(), AuthorizedError> {
        let parcel = PlatformParcel::from_decoded_pack(decoded)?;

        let destination_tolerated_missing = parcel.platform_type == PlatformType::Handshake;
        if let Destination::Node(destination) = &parcel.header.destination {
            if destination != &self.local_identifier {
                return Err(AuthorizedError::DestinationMismatch);
            }
        } else if !destination_tolerated_missing {
            return Err(AuthorizedError::DestinationMismatch);
        }

        match parcel.platform_type {
            PlatformType::HeartbeatRequest => {
                self.reply_platform(&peer, endpoint_id, &parcel.header.source, PlatformType::HeartbeatResponse, Vec::new());
                Ok(())
            }
            PlatformType::HeartbeatResponse => {
                debug!("heartbeat response dropped silently");
                Err(AuthorizedError::HeartbeatResponseDropped)
            }
            PlatformType::Handshake => {
                debug!("handshake replay after authorization, signalling with a heartbeat request instead of renegotiating");
                self.reply_platform(&peer, endpoint_id, &parcel.header.source, PlatformType::HeartbeatRequest, Vec::new());
                Ok(())
            }
        }
    }

    fn reply_platform(
        &self,
        peer: &Weak<PeerProxy>,
        endpoint_id: EndpointId,
        destination: &NodeId,
        platform_type: PlatformType,
        payload: Vec<u8>,
    ) {
        let Some(peer) = peer.upgrade() else {
            return;
        };
        let Ok(reply) = PlatformParcel::builder()
            .source(self.local_identifier.clone())
            .destination(Destination::Node(destination.clone()))
            .platform_type(platform_type)
            .payload(payload)
            .build()
        else {
            return;
        };
        peer.schedule_send(endpoint_id, &reply.pack());
    }

    fn handle_application(
        &self,
        peer: Weak<PeerProxy>,
        endpoint_id: EndpointId,
        decoded: &[u8],
    ) -> Result<(), AuthorizedError> {
        let Some(strong_peer) = peer.upgrade() else {
            return Err(AuthorizedError::Format(MessageError::HeaderTooShort));
        };
        let Some(context) = strong_peer.get_message_context(endpoint_id) else {
            return Err(AuthorizedError::Format(MessageError::HeaderTooShort));
        };

        if !context.verify(decoded) {
            self.invalid_count.fetch_add(1, Ordering::Relaxed);
            strong_peer.tear_down_session();
            warn!(peer = %strong_peer.identifier(), "application parcel failed verification, session torn down");
            return Err(AuthorizedError::VerificationFailure);
        }

        let parcel = ApplicationParcel::from_decoded_pack(decoded, |ciphertext, nonce| {
            context
                .decrypt(ciphertext, nonce)
                .ok_or(MessageError::InvalidEncoding)
        });

        let parcel = match parcel {
            Ok(parcel) => parcel,
            Err(error) => {
                self.invalid_count.fetch_add(1, Ordering::Relaxed);
                return Err(AuthorizedError::Format(error));
            }
        };

        if let Some((_, AwaitableBinding::Response)) = parcel.awaitable() {
            self.tracking_service.on_response_arrived(&parcel);
            return Ok(());
        }

        self.queue.lock().push_back((peer, endpoint_id, parcel));
        Ok(())
    }

    /// Pops at most one queued parcel and resolves its route through the dispatcher.
    pub fn execute(&self) -> usize {
        let popped = self.queue.lock().pop_front();
        match popped {
            Some((peer, endpoint_id, parcel)) => {
                if !self.route_dispatcher.dispatch(peer, endpoint_id, parcel) {
                    warn!("route dispatch reported failure");
                }
                1
            }
            None => 0,
        }
    }
}

/// Wraps a shared `AuthorizedProcessor` so it can be registered with the scheduler,
/// which requires an owned `Box<dyn DelegateHost>` (the orphan rule forbids
/// implementing the scheduler's trait directly on the foreign `Arc`).
pub struct AuthorizedDelegate(pub Arc<AuthorizedProcessor>);

impl DelegateHost for AuthorizedDelegate {
    fn owner(&self) -> TypeId {
        TypeId::of::<AuthorizedProcessor>()
    }

    fn ready(&self) -> bool {
        self.0.message_count() > 0
    }

    fn execute(&self) -> usize {
        self.0.execute()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::ExchangeProcessor;
    use crate::proxy::MessageSink;
    use brypt_security::ExchangeRole;
    use std::sync::Arc;

    struct AlwaysSucceeds;
    impl RouteDispatcher for AlwaysSucceeds {
        fn dispatch(&self, _peer: Weak<PeerProxy>, _endpoint_id: EndpointId, _parcel: ApplicationParcel) -> bool {
            true
        }
    }

    fn local_identifier() -> NodeId {
        NodeId::new(vec![1u8; 20]).unwrap()
    }

    fn make_authorized() -> Arc<AuthorizedProcessor> {
        AuthorizedProcessor::new(
            local_identifier(),
            Arc::new(TrackingService::new()),
            Arc::new(AlwaysSucceeds),
        )
    }

    fn make_peer(identifier: NodeId) -> Arc<PeerProxy> {
        let exchange = ExchangeProcessor::new(identifier.clone(), ExchangeRole::Acceptor);
        let peer = PeerProxy::new(identifier, MessageSink::Exchange(Mutex::new(exchange)));
        peer.register_endpoint(0, |_pack| true);
        peer
    }

    #[test]
    fn heartbeat_request_replies_inline_without_queueing() {
        let authorized = make_authorized();
        let peer = make_peer(NodeId::new(vec![2u8; 20]).unwrap());

        let request = PlatformParcel::builder()
            .source(peer.identifier().clone())
            .destination(Destination::Node(authorized.local_identifier.clone()))
            .platform_type(PlatformType::HeartbeatRequest)
            .build()
            .unwrap();

        authorized
            .collect_message_on(Arc::downgrade(&peer), 0, request.pack().as_bytes())
            .unwrap();
        assert_eq!(authorized.message_count(), 0);
        assert_eq!(peer.sent_count(), 1);
    }

    #[test]
    fn heartbeat_response_is_dropped_silently() {
        let authorized = make_authorized();
        let peer = make_peer(NodeId::new(vec![3u8; 20]).unwrap());

        let response = PlatformParcel::builder()
            .source(peer.identifier().clone())
            .destination(Destination::Node(authorized.local_identifier.clone()))
            .platform_type(PlatformType::HeartbeatResponse)
            .build()
            .unwrap();

        let result = authorized.collect_message_on(Arc::downgrade(&peer), 0, response.pack().as_bytes());
        assert_eq!(result, Err(AuthorizedError::HeartbeatResponseDropped));
        assert_eq!(authorized.message_count(), 0);
    }

    #[test]
    fn handshake_replay_after_authorization_gets_heartbeat_request_not_renegotiation() {
        let authorized = make_authorized();
        let peer = make_peer(NodeId::new(vec![4u8; 20]).unwrap());

        let replay = PlatformParcel::builder()
            .source(peer.identifier().clone())
            .destination(Destination::Node(authorized.local_identifier.clone()))
            .platform_type(PlatformType::Handshake)
            .payload(vec![9, 9])
            .build()
            .unwrap();

        authorized
            .collect_message_on(Arc::downgrade(&peer), 0, replay.pack().as_bytes())
            .unwrap();
        assert_eq!(peer.sent_count(), 1);
    }

    #[test]
    fn application_parcel_with_malformed_crypto_increments_invalid_count() {
        let authorized = make_authorized();
        let peer = make_peer(NodeId::new(vec![5u8; 20]).unwrap());

        let parcel = ApplicationParcel::builder()
            .source(peer.identifier().clone())
            .destination(Destination::Node(authorized.local_identifier.clone()))
            .route("/info/node")
            .build()
            .unwrap();
        // No security context installed on this registration, so decrypt fails.
        let packed = parcel.pack_encrypted(|body, _| body.to_vec(), |_| {});

        let result = authorized.collect_message_on(Arc::downgrade(&peer), 0, packed.as_bytes());
        assert!(result.is_err());
        assert_eq!(authorized.invalid_count(), 1);
    }

    #[test]
    fn execute_pops_at_most_one_parcel_per_cycle() {
        let authorized = make_authorized();
        assert_eq!(authorized.execute(), 0);
    }

    fn completed_security() -> brypt_security::SecurityContext {
        let mut initiator = brypt_security::Synchronizer::new(ExchangeRole::Initiator);
        let mut acceptor = brypt_security::Synchronizer::new(ExchangeRole::Acceptor);
        let (_, message_1) = initiator.initialize();
        let (_, message_2) = acceptor.synchronize(&message_1).unwrap();
        initiator.synchronize(&message_2).unwrap();
        initiator.finalize().unwrap()
    }

    #[test]
    fn tampered_signature_is_rejected_and_tears_down_the_session() {
        let authorized = make_authorized();
        let peer = make_peer(NodeId::new(vec![6u8; 20]).unwrap());
        peer.install_security(Arc::new(completed_security()));

        let parcel = ApplicationParcel::builder()
            .source(peer.identifier().clone())
            .destination(Destination::Node(authorized.local_identifier.clone()))
            .route("/info/node")
            .build()
            .unwrap();
        let context = peer.get_message_context(0).unwrap();
        let mut packed = parcel.pack_encrypted(
            |body, timestamp| context.encrypt(body, timestamp).unwrap(),
            |buffer| context.sign(buffer),
        );
        let last = packed.len() - 1;
        let replacement = if packed.ends_with('0') { "1" } else { "0" };
        packed.replace_range(last..packed.len(), replacement);

        let result = authorized.collect_message_on(Arc::downgrade(&peer), 0, packed.as_bytes());
        assert_eq!(result, Err(AuthorizedError::VerificationFailure));
        assert_eq!(authorized.invalid_count(), 1);
        assert!(!peer.get_message_context(0).unwrap().is_authorized());
    }
}
