//! Per-endpoint message context: the bound crypto operations a Peer Proxy
//! installs once its Exchange Processor finishes the handshake.

use std::sync::Arc;

use brypt_security::SecurityContext;

/// Identifies one registered transport endpoint for a peer (e.g. a TCP socket handle).
pub type EndpointId = u64;

/// Per-endpoint state needed to encrypt/decrypt/sign/verify a parcel on behalf of a
/// specific peer. Created with no crypto closures bound; mutated in place once the
/// synchronizer finalizes.
#[derive(Clone)]
pub struct MessageContext {
    pub endpoint_id: EndpointId,
    security: Option<Arc<SecurityContext>>,
}

impl MessageContext {
    pub fn new(endpoint_id: EndpointId) -> Self {
        Self {
            endpoint_id,
            security: None,
        }
    }

    /// Installs the finalized session crypto. Called once, when the handshake completes.
    pub fn install(&mut self, security: Arc<SecurityContext>) {
        self.security = Some(security);
    }

    pub fn is_authorized(&self) -> bool {
        self.security.is_some()
    }

    pub fn encrypt(&self, plaintext: &[u8], timestamp: u64) -> Option<Vec<u8>> {
        self.security.as_ref().map(|security| security.encrypt(plaintext, timestamp))
    }

    pub fn decrypt(&self, ciphertext: &[u8], timestamp: u64) -> Option<Vec<u8>> {
        self.security
            .as_ref()
            .and_then(|security| security.decrypt(ciphertext, timestamp).ok())
    }

    pub fn sign(&self, buffer: &mut Vec<u8>) {
        if let Some(security) = &self.security {
            security.sign(buffer);
        }
    }

    pub fn verify(&self, buffer: &[u8]) -> bool {
        self.security.as_ref().map(|security| security.verify(buffer)).unwrap_or(false)
    }

    /// Uninstalls the session crypto, requiring a fresh handshake before any further
    /// parcel can be encrypted, decrypted, signed, or verified on this endpoint.
    pub fn revoke(&mut self) {
        self.security = None;
    }

    pub fn signature_size(&self) -> usize {
        self.security.as_ref().map(|security| security.signature_size()).unwrap_or(0)
    }
}
