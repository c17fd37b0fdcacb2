//! Post-quantum handshake synchronizer and per-session security context.
//!
//! The synchronizer runs a two-message Kyber768 KEM exchange: the Initiator
//! sends an ephemeral encapsulation key, the Acceptor encapsulates against it
//! and replies, and both sides derive the same session key with a BLAKE3 KDF
//! that mixes in both nonces so every session is cryptographically unique
//! even between the same two static identities (Context=Unique).

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use pqcrypto_kyber::kyber768::{
    decapsulate, encapsulate, keypair, Ciphertext, PublicKey, SecretKey,
};
use pqcrypto_traits::kem::{Ciphertext as _, PublicKey as _, SharedSecret as _};
use rand::RngCore;
use thiserror::Error;
use zeroize::Zeroize;

const NONCE_LEN: usize = 16;
const SESSION_KEY_LEN: usize = 32;
/// Length of the keyed-BLAKE3 MAC appended by `sign` and checked by `verify`.
pub const SIGNATURE_SIZE: usize = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SynchronizerError {
    #[error("handshake message received out of sequence for the current stage")]
    UnexpectedStage,
    #[error("handshake message is malformed or truncated")]
    MalformedMessage,
    #[error("key encapsulation failed")]
    EncapsulationFailure,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SecurityError {
    #[error("AEAD decryption failed")]
    DecryptionFailure,
    #[error("signature or verification mismatch")]
    VerificationFailure,
}

/// Role a synchronizer plays in the handshake. Only the Initiator generates
/// the first message; both roles finish with an identical session key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeRole {
    Initiator,
    Acceptor,
}

/// Progress/outcome of a synchronizer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Processing,
    Ready,
    Error,
}

enum Stage {
    /// Initiator: waiting to emit its ephemeral public key. Acceptor: waiting for it.
    AwaitingInitiation,
    /// Initiator: sent pk, waiting for the acceptor's ciphertext.
    /// Acceptor: already derived the session key.
    AwaitingCompletion { ephemeral_secret: SecretKey, local_nonce: [u8; NONCE_LEN] },
    Ready { session_key: [u8; SESSION_KEY_LEN] },
    Failed,
}

/// Drives the handshake state machine for one peer. Not `Clone`: a synchronizer
/// is consumed by the handshake it drives and discarded once `Ready` or `Failed`.
pub struct Synchronizer {
    role: ExchangeRole,
    stage: Stage,
}

impl Synchronizer {
    pub fn new(role: ExchangeRole) -> Self {
        Self {
            role,
            stage: Stage::AwaitingInitiation,
        }
    }

    /// Total number of handshake messages exchanged before `Ready`, so callers
    /// can bound retries: one from the Initiator, one reply from the Acceptor.
    pub fn stage_count(&self) -> usize {
        2
    }

    /// Initiator produces the first handshake message; Acceptor has nothing to send yet.
    pub fn initialize(&mut self) -> (Status, Vec<u8>) {
        match self.role {
            ExchangeRole::Acceptor => (Status::Processing, Vec::new()),
            ExchangeRole::Initiator => {
                let (ephemeral_public, ephemeral_secret) = keypair();
                let mut local_nonce = [0u8; NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut local_nonce);

                let mut message = Vec::with_capacity(ephemeral_public.as_bytes().len() + NONCE_LEN);
                message.extend_from_slice(ephemeral_public.as_bytes());
                message.extend_from_slice(&local_nonce);

                self.stage = Stage::AwaitingCompletion {
                    ephemeral_secret,
                    local_nonce,
                };
                (Status::Processing, message)
            }
        }
    }

    /// Consumes the peer's last handshake message and either emits the next one or
    /// signals completion.
    pub fn synchronize(&mut self, incoming: &[u8]) -> Result<(Status, Vec<u8>), SynchronizerError> {
        match (self.role, std::mem::replace(&mut self.stage, Stage::Failed)) {
            (ExchangeRole::Acceptor, Stage::AwaitingInitiation) => {
                let public_key_len = pqcrypto_kyber::kyber768::public_key_bytes();
                if incoming.len() != public_key_len + NONCE_LEN {
                    self.stage = Stage::Failed;
                    return Err(SynchronizerError::MalformedMessage);
                }
                let (public_key_bytes, remote_nonce_bytes) = incoming.split_at(public_key_len);
                let remote_public = PublicKey::from_bytes(public_key_bytes)
                    .map_err(|_| SynchronizerError::MalformedMessage)?;

                let (shared_secret, ciphertext) = encapsulate(&remote_public);
                let mut local_nonce = [0u8; NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut local_nonce);

                let session_key = derive_session_key(
                    shared_secret.as_bytes(),
                    remote_nonce_bytes,
                    &local_nonce,
                );

                let mut message = Vec::with_capacity(ciphertext.as_bytes().len() + NONCE_LEN);
                message.extend_from_slice(ciphertext.as_bytes());
                message.extend_from_slice(&local_nonce);

                self.stage = Stage::Ready { session_key };
                Ok((Status::Ready, message))
            }
            (ExchangeRole::Initiator, Stage::AwaitingCompletion { ephemeral_secret, local_nonce }) => {
                let ciphertext_len = pqcrypto_kyber::kyber768::ciphertext_bytes();
                if incoming.len() != ciphertext_len + NONCE_LEN {
                    self.stage = Stage::Failed;
                    return Err(SynchronizerError::MalformedMessage);
                }
                let (ciphertext_bytes, remote_nonce_bytes) = incoming.split_at(ciphertext_len);
                let ciphertext = Ciphertext::from_bytes(ciphertext_bytes)
                    .map_err(|_| SynchronizerError::MalformedMessage)?;

                let shared_secret = decapsulate(&ciphertext, &ephemeral_secret);
                let session_key = derive_session_key(
                    shared_secret.as_bytes(),
                    &local_nonce,
                    remote_nonce_bytes,
                );

                self.stage = Stage::Ready { session_key };
                Ok((Status::Ready, Vec::new()))
            }
            (_, Stage::Ready { session_key }) => {
                self.stage = Stage::Ready { session_key };
                Err(SynchronizerError::UnexpectedStage)
            }
            (_, Stage::Failed) => Err(SynchronizerError::UnexpectedStage),
            (_, other) => {
                self.stage = other;
                Err(SynchronizerError::UnexpectedStage)
            }
        }
    }

    /// Yields the per-direction closures once the session key is established.
    pub fn finalize(self) -> Option<SecurityContext> {
        match self.stage {
            Stage::Ready { session_key } => Some(SecurityContext::new(session_key)),
            _ => None,
        }
    }
}

/// Mixes the KEM shared secret with both nonces (initiator-then-acceptor order) through
/// BLAKE3 so every session key is unique even across repeated handshakes between the
/// same two static identities.
fn derive_session_key(shared_secret: &[u8], initiator_nonce: &[u8], acceptor_nonce: &[u8]) -> [u8; SESSION_KEY_LEN] {
    let mut hasher = blake3::Hasher::new_keyed(&[0u8; 32]);
    hasher.update(shared_secret);
    hasher.update(initiator_nonce);
    hasher.update(acceptor_nonce);
    *hasher.finalize().as_bytes()
}

/// Per-session bound operations installed on a Message Context once the handshake
/// finishes. Encrypt/decrypt take the parcel timestamp as a 64-bit nonce; sign/verify
/// operate on the full padded buffer.
pub struct SecurityContext {
    session_key: [u8; SESSION_KEY_LEN],
}

impl SecurityContext {
    fn new(session_key: [u8; SESSION_KEY_LEN]) -> Self {
        Self { session_key }
    }

    fn cipher(&self) -> ChaCha20Poly1305 {
        ChaCha20Poly1305::new(Key::from_slice(&self.session_key))
    }

    fn nonce_from_timestamp(timestamp: u64) -> Nonce {
        let mut bytes = [0u8; 12];
        bytes[..8].copy_from_slice(&timestamp.to_le_bytes());
        *Nonce::from_slice(&bytes)
    }

    /// Encrypts `plaintext`, binding `timestamp` as AAD so replay across sessions is
    /// rejected by verification even if the ciphertext bytes are replayed.
    pub fn encrypt(&self, plaintext: &[u8], timestamp: u64) -> Vec<u8> {
        self.cipher()
            .encrypt(
                &Self::nonce_from_timestamp(timestamp),
                Payload {
                    msg: plaintext,
                    aad: &timestamp.to_le_bytes(),
                },
            )
            .expect("chacha20poly1305 encryption does not fail for bounded plaintext")
    }

    pub fn decrypt(&self, ciphertext: &[u8], timestamp: u64) -> Result<Vec<u8>, SecurityError> {
        self.cipher()
            .decrypt(
                &Self::nonce_from_timestamp(timestamp),
                Payload {
                    msg: ciphertext,
                    aad: &timestamp.to_le_bytes(),
                },
            )
            .map_err(|_| SecurityError::DecryptionFailure)
    }

    /// Appends a keyed-BLAKE3 MAC to `buffer` in place, covering everything already there.
    pub fn sign(&self, buffer: &mut Vec<u8>) {
        let mac = blake3::keyed_hash(&self.session_key, buffer);
        buffer.extend_from_slice(mac.as_bytes());
    }

    /// Verifies the trailing [`SIGNATURE_SIZE`] bytes of `buffer` against the rest.
    pub fn verify(&self, buffer: &[u8]) -> bool {
        if buffer.len() < SIGNATURE_SIZE {
            return false;
        }
        let (body, tag) = buffer.split_at(buffer.len() - SIGNATURE_SIZE);
        let expected = blake3::keyed_hash(&self.session_key, body);
        expected.as_bytes() == tag
    }

    pub fn signature_size(&self) -> usize {
        SIGNATURE_SIZE
    }
}

impl Drop for SecurityContext {
    fn drop(&mut self) {
        self.session_key.zeroize();
    }
}
