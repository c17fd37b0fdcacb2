//! The stable handle for a known peer across endpoint churn (C4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use brypt_identifier::NodeId;
use brypt_message::ApplicationParcel;
use parking_lot::Mutex;
use tracing::warn;

use crate::authorized::AuthorizedProcessor;
use crate::context::{EndpointId, MessageContext};
use crate::exchange::ExchangeProcessor;

/// Invoked when a handshake reaches `Ready` on the Initiator side: sends a
/// fresh authenticated Application request that establishes the application
/// session, mirroring the original synchronizer's `IConnectProtocol::SendRequest`
/// hook.
pub trait ConnectProtocol: Send + Sync {
    fn send_request(&self, peer: &Arc<PeerProxy>, authorized: &Arc<AuthorizedProcessor>) -> bool;
}

/// A `ConnectProtocol` that does nothing, for callers (and tests) that don't
/// need the Initiator-side follow-up request.
pub struct NoopConnectProtocol;

impl ConnectProtocol for NoopConnectProtocol {
    fn send_request(&self, _peer: &Arc<PeerProxy>, _authorized: &Arc<AuthorizedProcessor>) -> bool {
        true
    }
}

/// A registered transport endpoint: its message context plus the closure that
/// actually puts bytes on the wire.
pub struct Registration {
    pub context: MessageContext,
    send: Box<dyn Fn(&str) -> bool + Send + Sync>,
}

/// The sink currently receiving bytes delivered to this peer. Starts as the Exchange
/// Processor and is atomically replaced with the Authorized Processor on
/// `on_exchange_close(Success)`.
pub enum MessageSink {
    Exchange(Mutex<ExchangeProcessor>),
    Authorized(Arc<AuthorizedProcessor>),
}

/// One per known peer identifier.
pub struct PeerProxy {
    identifier: NodeId,
    registrations: Mutex<HashMap<EndpointId, Registration>>,
    sink: Mutex<Option<MessageSink>>,
    sent: AtomicU64,
    received: AtomicU64,
}

impl PeerProxy {
    pub fn new(identifier: NodeId, initial_sink: MessageSink) -> Arc<Self> {
        Arc::new(Self {
            identifier,
            registrations: Mutex::new(HashMap::new()),
            sink: Mutex::new(Some(initial_sink)),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
        })
    }

    pub fn identifier(&self) -> &NodeId {
        &self.identifier
    }

    pub fn register_endpoint(
        &self,
        endpoint_id: EndpointId,
        send: impl Fn(&str) -> bool + Send + Sync + 'static,
    ) {
        self.registrations.lock().insert(
            endpoint_id,
            Registration {
                context: MessageContext::new(endpoint_id),
                send: Box::new(send),
            },
        );
    }

    /// Returns a clone of the context used to build outgoing parcels on `endpoint_id`.
    pub fn get_message_context(&self, endpoint_id: EndpointId) -> Option<MessageContext> {
        self.registrations.lock().get(&endpoint_id).map(|registration| registration.context.clone())
    }

    /// Installs the finalized session crypto on every registration, called once the
    /// handshake completes (all endpoints for a peer share one synchronized session).
    pub fn install_security(&self, security: Arc<brypt_security::SecurityContext>) {
        for registration in self.registrations.lock().values_mut() {
            registration.context.install(security.clone());
        }
    }

    /// Invokes the registered send closure; increments the sent counter. Returns
    /// `false` if the endpoint is unknown or the closure rejects the message — in
    /// either case proxy state besides the attempted send is untouched.
    pub fn schedule_send(&self, endpoint_id: EndpointId, pack: &str) -> bool {
        let sent = match self.registrations.lock().get(&endpoint_id) {
            Some(registration) => (registration.send)(pack),
            None => {
                warn!(endpoint_id, "schedule_send targeted an unknown endpoint");
                false
            }
        };
        if sent {
            self.sent.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    /// Sends on the first registered endpoint. A peer with exactly one active
    /// transport — the common case — needs no further addressing.
    pub fn schedule_send_any(&self, pack: &str) -> bool {
        let endpoint_id = match self.registrations.lock().keys().next().copied() {
            Some(id) => id,
            None => return false,
        };
        self.schedule_send(endpoint_id, pack)
    }

    /// Encrypts, signs, and sends `parcel` on the first registered endpoint.
    /// Used for traffic this proxy originates itself rather than in reply to
    /// an inbound dispatch (the Connect Protocol follow-up, aggregated fetch
    /// notices) where there is no `Next` carrying a bound endpoint already.
    pub fn send_application(&self, parcel: &ApplicationParcel) -> bool {
        let endpoint_id = match self.registrations.lock().keys().next().copied() {
            Some(id) => id,
            None => return false,
        };
        let Some(context) = self.get_message_context(endpoint_id) else {
            return false;
        };
        let packed = parcel.pack_encrypted(
            |body, nonce| context.encrypt(body, nonce).unwrap_or_default(),
            |buffer| context.sign(buffer),
        );
        self.schedule_send(endpoint_id, &packed)
    }

    /// Passes bytes to the current sink. Returns `false` if no sink is bound (should
    /// not happen in practice: a proxy is always created with one).
    pub fn schedule_receive(self: &Arc<Self>, buffer: &[u8]) -> bool {
        self.received.fetch_add(1, Ordering::Relaxed);
        let sink_guard = self.sink.lock();
        match sink_guard.as_ref() {
            Some(MessageSink::Exchange(exchange)) => {
                let mut exchange = exchange.lock();
                let observer = ExchangeCloseSwap { proxy: self.clone() };
                match exchange.collect_message(buffer, &observer) {
                    Ok(Some(outgoing)) => self.schedule_send_any(&outgoing.pack),
                    Ok(None) => true,
                    Err(_) => false,
                }
            }
            Some(MessageSink::Authorized(authorized)) => {
                authorized.collect_message(Arc::downgrade(self), buffer).is_ok()
            }
            None => false,
        }
    }

    /// Atomically swaps the sink to `Authorized`, consuming the exchange processor
    /// that drove the handshake. Serializes against concurrent `schedule_receive`.
    pub fn promote_to_authorized(&self, authorized: Arc<AuthorizedProcessor>) {
        *self.sink.lock() = Some(MessageSink::Authorized(authorized));
    }

    pub fn is_authorized(&self) -> bool {
        matches!(self.sink.lock().as_ref(), Some(MessageSink::Authorized(_)))
    }

    /// Revokes the session crypto on every registration, per the recovery policy for
    /// verification/exchange errors: the peer is flagged and the session torn down
    /// rather than kept alive on unverified trust.
    pub fn tear_down_session(&self) {
        for registration in self.registrations.lock().values_mut() {
            registration.context.revoke();
        }
    }

    /// If the handshake has reached `Ready`, finalizes its session crypto, installs
    /// it on every registration, and swaps the sink to `Authorized`. Returns whether
    /// a promotion happened; a no-op (not an error) if the exchange isn't Ready yet
    /// or the sink is already Authorized.
    ///
    /// On the Initiator side, promotion also invokes `connect`'s Connect Protocol
    /// follow-up, sending a fresh authenticated request that establishes the
    /// application session (the original synchronizer's role-gated
    /// `IConnectProtocol::SendRequest` call).
    pub fn try_promote(
        self: &Arc<Self>,
        authorized: Arc<AuthorizedProcessor>,
        connect: &dyn ConnectProtocol,
    ) -> bool {
        let role = {
            let mut sink_guard = self.sink.lock();
            let Some(MessageSink::Exchange(exchange)) = sink_guard.as_mut() else {
                return false;
            };
            if exchange.get_mut().stage() != crate::exchange::ProcessStage::Ready {
                return false;
            }
            let Some(security) = exchange.get_mut().finalize() else {
                return false;
            };
            let role = exchange.get_mut().role();
            let security = Arc::new(security);
            for registration in self.registrations.lock().values_mut() {
                registration.context.install(security.clone());
            }
            *sink_guard = Some(MessageSink::Authorized(authorized.clone()));
            role
        };

        if role == brypt_security::ExchangeRole::Initiator {
            connect.send_request(self, &authorized);
        }
        true
    }

    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    pub fn received_count(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

/// An `ExchangeObserver` that promotes the owning proxy on success. Promotion itself
/// is left to the caller wiring the processors together (it needs the finalized
/// `AuthorizedProcessor`, which this observer does not own), so this only logs.
struct ExchangeCloseSwap {
    proxy: Arc<PeerProxy>,
}

impl crate::exchange::ExchangeObserver for ExchangeCloseSwap {
    fn on_exchange_close(&self, success: bool) {
        if success {
            tracing::info!(peer = %self.proxy.identifier(), "exchange closed successfully, awaiting promotion");
        } else {
            tracing::warn!(peer = %self.proxy.identifier(), "exchange closed with failure");
        }
    }
}
