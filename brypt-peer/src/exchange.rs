//! The handshake state machine that lives between a Peer Proxy's creation and
//! its promotion to authorized (C3).

use std::time::{Duration, Instant};

use brypt_identifier::NodeId;
use brypt_message::{Destination, MessageError, PlatformParcel, PlatformType, Protocol};
use brypt_security::{ExchangeRole, SecurityContext, Status as SynchronizerStatus, Synchronizer};
use thiserror::Error;
use tracing::{debug, warn};

/// ~1500ms, matching the original synchronizer's handshake budget.
pub const EXPIRATION_PERIOD: Duration = Duration::from_millis(1500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStage {
    Initialization,
    Synchronization,
    Ready,
    Failure,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("processor is not accepting handshake messages in its current stage")]
    NotSynchronizing,
    #[error("handshake-only channel received a non-platform message")]
    NonPlatformMessage,
    #[error("handshake message failed to parse")]
    Format(#[from] MessageError),
    #[error("received a non-handshake platform message during synchronization")]
    NotAHandshake,
    #[error("destination rule violated: message addressed to a different node")]
    DestinationMismatch,
    #[error("synchronizer rejected the handshake message")]
    SynchronizerRejected,
    #[error("handshake exceeded its expiration period")]
    Expired,
}

/// What the caller should do with a `Prepare`/`collect_message` outcome.
#[derive(Debug, PartialEq, Eq)]
pub struct Outgoing {
    pub pack: String,
}

/// Notified of handshake milestones. Mirrors the original's `IExchangeObserver`.
pub trait ExchangeObserver: Send + Sync {
    fn on_exchange_close(&self, success: bool);
}

pub struct ExchangeProcessor {
    local_identifier: NodeId,
    role: ExchangeRole,
    peer_identifier: Option<NodeId>,
    synchronizer: Option<Synchronizer>,
    stage: ProcessStage,
    deadline: Instant,
}

impl ExchangeProcessor {
    pub fn new(local_identifier: NodeId, role: ExchangeRole) -> Self {
        Self {
            local_identifier,
            role,
            peer_identifier: None,
            synchronizer: Some(Synchronizer::new(role)),
            stage: ProcessStage::Initialization,
            deadline: Instant::now() + EXPIRATION_PERIOD,
        }
    }

    pub fn stage(&self) -> ProcessStage {
        self.stage
    }

    pub fn role(&self) -> ExchangeRole {
        self.role
    }

    /// Runs the synchronizer's `initialize`. If it produced handshake bytes, wraps them
    /// as a Handshake parcel with no destination (the peer may not be known yet).
    pub fn prepare(&mut self) -> Option<Outgoing> {
        let synchronizer = self.synchronizer.as_mut()?;
        let (status, buffer) = synchronizer.initialize();
        self.stage = match status {
            SynchronizerStatus::Processing => ProcessStage::Synchronization,
            SynchronizerStatus::Ready => ProcessStage::Ready,
            SynchronizerStatus::Error => ProcessStage::Failure,
        };

        if buffer.is_empty() {
            return None;
        }

        let parcel = PlatformParcel::builder()
            .source(self.local_identifier.clone())
            .destination(Destination::Cluster)
            .platform_type(PlatformType::Handshake)
            .payload(buffer)
            .build()
            .ok()?;

        Some(Outgoing { pack: parcel.pack() })
    }

    /// Feeds one inbound buffer through the handshake state machine.
    pub fn collect_message(
        &mut self,
        buffer: &[u8],
        observer: &dyn ExchangeObserver,
    ) -> Result<Option<Outgoing>, ExchangeError> {
        if Instant::now() > self.deadline {
            self.stage = ProcessStage::Failure;
            observer.on_exchange_close(false);
            return Err(ExchangeError::Expired);
        }

        if self.stage != ProcessStage::Synchronization {
            return Err(ExchangeError::NotSynchronizing);
        }

        let decoded = brypt_message::z85_decode(
            std::str::from_utf8(buffer).map_err(|_| ExchangeError::Format(MessageError::InvalidEncoding))?,
        )
        .ok_or(ExchangeError::Format(MessageError::InvalidEncoding))?;

        if brypt_message::peek_protocol(&decoded) != Some(Protocol::Platform) {
            self.stage = ProcessStage::Failure;
            observer.on_exchange_close(false);
            return Err(ExchangeError::NonPlatformMessage);
        }

        let parcel = PlatformParcel::from_decoded_pack(&decoded)?;
        if parcel.platform_type != PlatformType::Handshake {
            self.stage = ProcessStage::Failure;
            observer.on_exchange_close(false);
            return Err(ExchangeError::NotAHandshake);
        }

        if let Destination::Node(destination) = &parcel.header.destination {
            if destination != &self.local_identifier {
                self.stage = ProcessStage::Failure;
                observer.on_exchange_close(false);
                return Err(ExchangeError::DestinationMismatch);
            }
        }

        self.peer_identifier.get_or_insert_with(|| parcel.header.source.clone());

        let synchronizer = self.synchronizer.as_mut().ok_or(ExchangeError::SynchronizerRejected)?;
        let (status, outgoing_bytes) = synchronizer
            .synchronize(&parcel.payload)
            .map_err(|_| ExchangeError::SynchronizerRejected)?;

        let outgoing = if outgoing_bytes.is_empty() {
            None
        } else {
            let outgoing_parcel = PlatformParcel::builder()
                .source(self.local_identifier.clone())
                .destination(Destination::Node(parcel.header.source.clone()))
                .platform_type(PlatformType::Handshake)
                .payload(outgoing_bytes)
                .build()?;
            Some(Outgoing { pack: outgoing_parcel.pack() })
        };

        match status {
            SynchronizerStatus::Processing => {
                debug!("handshake still in progress");
            }
            SynchronizerStatus::Ready => {
                self.stage = ProcessStage::Ready;
                observer.on_exchange_close(true);
            }
            SynchronizerStatus::Error => {
                self.stage = ProcessStage::Failure;
                observer.on_exchange_close(false);
            }
        }

        Ok(outgoing)
    }

    /// Hands back the finalized session crypto on success. Idempotent in the sense
    /// that a second call returns `None` (the synchronizer was already taken), so
    /// callers may poll `stage()` then `finalize()` without double-installing security.
    pub fn finalize(&mut self) -> Option<SecurityContext> {
        if self.stage != ProcessStage::Ready {
            warn!("finalize called before the exchange reached Ready");
            return None;
        }
        self.synchronizer.take()?.finalize()
    }

    pub fn peer_identifier(&self) -> Option<&NodeId> {
        self.peer_identifier.as_ref()
    }
}
