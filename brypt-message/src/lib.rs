//! Wire codec for brypt Platform and Application parcels.
//!
//! A [`Header`] is shared by both parcel kinds and is always packed in
//! plaintext ahead of the type-specific body, since routing information must
//! be readable before a session key exists. All multi-byte integers are
//! little-endian; all sizes are validated against the remaining buffer rather
//! than silently truncated.

mod z85;

pub use z85::{decode as z85_decode, encode as z85_encode};

use brypt_identifier::NodeId;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("buffer too short to contain a valid header")]
    HeaderTooShort,
    #[error("unknown protocol tag {0}")]
    UnknownProtocol(u8),
    #[error("unknown destination tag {0}")]
    UnknownDestination(u8),
    #[error("unknown platform type tag {0}")]
    UnknownPlatformType(u8),
    #[error("declared length {declared} exceeds remaining buffer of {remaining} bytes")]
    LengthOutOfRange { declared: usize, remaining: usize },
    #[error("application parcel must have a non-empty route")]
    EmptyRoute,
    #[error("z85 decoding failed")]
    InvalidEncoding,
    #[error("extension {0} failed to validate")]
    InvalidExtension(u8),
    #[error("builder is missing a required field: {0}")]
    IncompleteBuild(&'static str),
    #[error("header declares a size of {declared} but the buffer implies {actual}")]
    DeclaredSizeMismatch { declared: u32, actual: u32 },
}

type Result<T> = std::result::Result<T, MessageError>;

/// Top-level protocol discriminant carried by every [`Header`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Platform,
    Application,
}

impl Protocol {
    fn tag(self) -> u8 {
        match self {
            Protocol::Platform => 0,
            Protocol::Application => 1,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Protocol::Platform),
            1 => Ok(Protocol::Application),
            other => Err(MessageError::UnknownProtocol(other)),
        }
    }
}

/// Where a parcel is addressed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Node(NodeId),
    Cluster,
    Network,
}

impl Destination {
    fn tag(&self) -> u8 {
        match self {
            Destination::Node(_) => 0,
            Destination::Cluster => 1,
            Destination::Network => 2,
        }
    }
}

/// Fields shared by every parcel, always packed in plaintext first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub protocol: Protocol,
    pub source: NodeId,
    pub destination: Destination,
    /// Monotonic epoch milliseconds at creation time.
    pub timestamp: u64,
    /// Total Z85-encoded length of the finished parcel, filled in by the packer once the
    /// padded frame size is known (invariant v). Callers building a [`Header`] by hand may
    /// leave this at zero; `pack` always overwrites it with the real value.
    pub declared_size: u32,
}

impl Header {
    /// Packs the header with a placeholder `declared_size`; returns the offset of that
    /// field so the caller can patch in the real value once the full frame length is known.
    fn pack(&self, destination: &mut Vec<u8>) -> usize {
        destination.push(self.protocol.tag());
        destination.push(self.source.len() as u8);
        destination.extend_from_slice(self.source.as_bytes());
        destination.push(self.destination.tag());
        if let Destination::Node(id) = &self.destination {
            destination.push(id.len() as u8);
            destination.extend_from_slice(id.as_bytes());
        }
        destination.extend_from_slice(&self.timestamp.to_le_bytes());
        let declared_size_offset = destination.len();
        destination.extend_from_slice(&0u32.to_le_bytes());
        declared_size_offset
    }

    fn unpack(source: &[u8]) -> Result<(Self, usize)> {
        let mut cursor = Cursor::new(source);
        let protocol = Protocol::from_tag(cursor.take_u8()?)?;
        let source_len = cursor.take_u8()? as usize;
        let source_id =
            NodeId::new(cursor.take_slice(source_len)?.to_vec()).map_err(|_| MessageError::HeaderTooShort)?;
        let destination_tag = cursor.take_u8()?;
        let destination = match destination_tag {
            0 => {
                let len = cursor.take_u8()? as usize;
                let id = NodeId::new(cursor.take_slice(len)?.to_vec())
                    .map_err(|_| MessageError::HeaderTooShort)?;
                Destination::Node(id)
            }
            1 => Destination::Cluster,
            2 => Destination::Network,
            other => return Err(MessageError::UnknownDestination(other)),
        };
        let timestamp = u64::from_le_bytes(cursor.take_array::<8>()?);
        let declared_size = cursor.take_u32()?;
        Ok((
            Header {
                protocol,
                source: source_id,
                destination,
                timestamp,
                declared_size,
            },
            cursor.position(),
        ))
    }
}

/// Patches the 4-byte `declared_size` field written at `offset` by [`Header::pack`] with the
/// Z85-encoded length implied by `framed`'s already-padded length, then returns that length.
fn stamp_declared_size(framed: &mut [u8], offset: usize) -> u32 {
    let declared_size = z85::encoded_size(framed.len()) as u32;
    framed[offset..offset + 4].copy_from_slice(&declared_size.to_le_bytes());
    declared_size
}

/// Checks invariant (v): the header's declared size must equal the Z85-encoded length implied
/// by the decoded buffer it was read from.
fn check_declared_size(header: &Header, decoded: &[u8]) -> Result<()> {
    let actual = z85::encoded_size(decoded.len()) as u32;
    if header.declared_size != actual {
        return Err(MessageError::DeclaredSizeMismatch {
            declared: header.declared_size,
            actual,
        });
    }
    Ok(())
}

/// Minimal cursor over a byte slice that reports a length failure instead of panicking.
struct Cursor<'a> {
    buffer: &'a [u8],
    position: usize,
}

impl<'a> Cursor<'a> {
    fn new(buffer: &'a [u8]) -> Self {
        Self { buffer, position: 0 }
    }

    fn position(&self) -> usize {
        self.position
    }

    fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    fn take_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(MessageError::LengthOutOfRange {
                declared: len,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buffer[self.position..self.position + len];
        self.position += len;
        Ok(slice)
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take_slice(1)?[0])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let slice = self.take_slice(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(slice);
        Ok(array)
    }

    fn take_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take_array::<2>()?))
    }

    fn take_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array::<4>()?))
    }
}

/// Platform-level control traffic: handshakes and heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformType {
    Handshake,
    HeartbeatRequest,
    HeartbeatResponse,
}

impl PlatformType {
    fn tag(self) -> u8 {
        match self {
            PlatformType::Handshake => 0,
            PlatformType::HeartbeatRequest => 1,
            PlatformType::HeartbeatResponse => 2,
        }
    }

    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(PlatformType::Handshake),
            1 => Ok(PlatformType::HeartbeatRequest),
            2 => Ok(PlatformType::HeartbeatResponse),
            other => Err(MessageError::UnknownPlatformType(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformParcel {
    pub header: Header,
    pub platform_type: PlatformType,
    pub payload: Vec<u8>,
}

impl PlatformParcel {
    pub fn builder() -> PlatformParcelBuilder {
        PlatformParcelBuilder::default()
    }

    /// Packs the plaintext Platform layout, zero-padded to a 4-byte boundary, then Z85-encodes it.
    pub fn pack(&self) -> String {
        let mut body = Vec::new();
        let declared_size_offset = self.header.pack(&mut body);
        body.push(self.platform_type.tag());
        body.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        body.extend_from_slice(&self.payload);
        body.push(0); // extension_count: always zero today, reserved for forward compatibility
        body.resize(body.len() + z85::padding_bytes(body.len()), 0);
        stamp_declared_size(&mut body, declared_size_offset);
        z85::encode(&body)
    }

    pub fn from_encoded_pack(encoded: &str) -> Result<Self> {
        let decoded = z85::decode(encoded).ok_or(MessageError::InvalidEncoding)?;
        Self::from_decoded_pack(&decoded)
    }

    pub fn from_decoded_pack(decoded: &[u8]) -> Result<Self> {
        let (header, offset) = Header::unpack(decoded)?;
        check_declared_size(&header, decoded)?;
        let mut cursor = Cursor::new(&decoded[offset..]);
        let platform_type = PlatformType::from_tag(cursor.take_u8()?)?;
        let payload_len = cursor.take_u32()? as usize;
        let payload = cursor.take_slice(payload_len)?.to_vec();
        let _extension_count = cursor.take_u8()?;
        Ok(PlatformParcel {
            header,
            platform_type,
            payload,
        })
    }
}

#[derive(Default)]
pub struct PlatformParcelBuilder {
    protocol: Option<Protocol>,
    source: Option<NodeId>,
    destination: Option<Destination>,
    timestamp: Option<u64>,
    platform_type: Option<PlatformType>,
    payload: Vec<u8>,
    failed: bool,
}

impl PlatformParcelBuilder {
    pub fn source(mut self, source: NodeId) -> Self {
        self.source = Some(source);
        self
    }

    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn platform_type(mut self, platform_type: PlatformType) -> Self {
        self.platform_type = Some(platform_type);
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    /// Seeds the builder from a previously-packed buffer, reverse-decoding it.
    /// Parse failures are staged rather than returned immediately.
    pub fn from_encoded_pack(mut self, encoded: &str) -> Self {
        self.protocol = Some(Protocol::Platform);
        match PlatformParcel::from_encoded_pack(encoded) {
            Ok(parcel) => {
                self.source = Some(parcel.header.source);
                self.destination = Some(parcel.header.destination);
                self.timestamp = Some(parcel.header.timestamp);
                self.platform_type = Some(parcel.platform_type);
                self.payload = parcel.payload;
            }
            Err(_) => self.failed = true,
        }
        self
    }

    /// Unvalidated terminal operation: panics are never used, but a missing field yields an
    /// incomplete, logically invalid parcel. Intended for trusted constructors only.
    pub fn build(self) -> Result<PlatformParcel> {
        Ok(PlatformParcel {
            header: Header {
                protocol: Protocol::Platform,
                source: self.source.ok_or(MessageError::IncompleteBuild("source"))?,
                destination: self.destination.unwrap_or(Destination::Cluster),
                timestamp: self.timestamp.unwrap_or(0),
                declared_size: 0,
            },
            platform_type: self
                .platform_type
                .ok_or(MessageError::IncompleteBuild("platform_type"))?,
            payload: self.payload,
        })
    }

    /// Validated terminal operation: `None` on any staged failure or invariant violation.
    pub fn validated_build(self) -> Option<PlatformParcel> {
        if self.failed {
            return None;
        }
        self.build().ok()
    }
}

/// The binding direction of an [`Extension::Awaitable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitableBinding {
    Request,
    Response,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extension {
    Awaitable {
        tracker_key: [u8; 16],
        binding: AwaitableBinding,
    },
    Status {
        code: u32,
    },
}

impl Extension {
    const AWAITABLE_TAG: u8 = 0;
    const STATUS_TAG: u8 = 1;

    fn pack(&self, destination: &mut Vec<u8>) {
        match self {
            Extension::Awaitable { tracker_key, binding } => {
                destination.push(Self::AWAITABLE_TAG);
                destination.extend_from_slice(&(17u16).to_le_bytes());
                destination.push(match binding {
                    AwaitableBinding::Request => 0,
                    AwaitableBinding::Response => 1,
                });
                destination.extend_from_slice(tracker_key);
            }
            Extension::Status { code } => {
                destination.push(Self::STATUS_TAG);
                destination.extend_from_slice(&(4u16).to_le_bytes());
                destination.extend_from_slice(&code.to_le_bytes());
            }
        }
    }

    fn unpack(cursor: &mut Cursor) -> Result<Self> {
        let key = cursor.take_u8()?;
        let size = cursor.take_u16()? as usize;
        let data = cursor.take_slice(size)?;
        match key {
            Self::AWAITABLE_TAG => {
                if data.len() != 17 {
                    return Err(MessageError::InvalidExtension(key));
                }
                let binding = match data[0] {
                    0 => AwaitableBinding::Request,
                    1 => AwaitableBinding::Response,
                    _ => return Err(MessageError::InvalidExtension(key)),
                };
                let mut tracker_key = [0u8; 16];
                tracker_key.copy_from_slice(&data[1..17]);
                Ok(Extension::Awaitable { tracker_key, binding })
            }
            Self::STATUS_TAG => {
                if data.len() != 4 {
                    return Err(MessageError::InvalidExtension(key));
                }
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(data);
                Ok(Extension::Status {
                    code: u32::from_le_bytes(bytes),
                })
            }
            other => Err(MessageError::InvalidExtension(other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationParcel {
    pub header: Header,
    pub route: String,
    pub payload: Vec<u8>,
    pub extensions: Vec<Extension>,
}

impl ApplicationParcel {
    pub fn builder() -> ApplicationParcelBuilder {
        ApplicationParcelBuilder::default()
    }

    pub fn awaitable(&self) -> Option<(&[u8; 16], AwaitableBinding)> {
        self.extensions.iter().find_map(|extension| match extension {
            Extension::Awaitable { tracker_key, binding } => Some((tracker_key, *binding)),
            _ => None,
        })
    }

    pub fn status(&self) -> Option<u32> {
        self.extensions.iter().find_map(|extension| match extension {
            Extension::Status { code } => Some(*code),
            _ => None,
        })
    }

    fn pack_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        let route_bytes = self.route.as_bytes();
        body.extend_from_slice(&(route_bytes.len() as u16).to_le_bytes());
        body.extend_from_slice(route_bytes);
        body.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        body.extend_from_slice(&self.payload);
        body.push(self.extensions.len() as u8);
        for extension in &self.extensions {
            extension.pack(&mut body);
        }
        body
    }

    /// Packs the header in plaintext, encrypts the remainder with `encrypt`, signs the
    /// zero-padded concatenation with `sign`, and Z85-encodes the result. `encrypt`/`sign`
    /// mirror the closures a [C2] synchronizer hands out on session establishment.
    pub fn pack_encrypted(
        &self,
        encrypt: impl FnOnce(&[u8], u64) -> Vec<u8>,
        sign: impl FnOnce(&mut Vec<u8>),
    ) -> String {
        let mut header_bytes = Vec::new();
        let declared_size_offset = self.header.pack(&mut header_bytes);

        let body = self.pack_body();
        let ciphertext = encrypt(&body, self.header.timestamp);

        let mut framed = header_bytes;
        framed.extend_from_slice(&ciphertext);
        framed.resize(framed.len() + z85::padding_bytes(framed.len()), 0);
        stamp_declared_size(&mut framed, declared_size_offset);
        sign(&mut framed);
        z85::encode(&framed)
    }

    pub fn from_encoded_pack(
        encoded: &str,
        decrypt: impl FnOnce(&[u8], u64) -> Result<Vec<u8>>,
        verify: impl FnOnce(&[u8]) -> bool,
    ) -> Result<Self> {
        let decoded = z85::decode(encoded).ok_or(MessageError::InvalidEncoding)?;
        if !verify(&decoded) {
            return Err(MessageError::InvalidEncoding);
        }
        Self::from_decoded_pack(&decoded, decrypt)
    }

    pub fn from_decoded_pack(
        decoded: &[u8],
        decrypt: impl FnOnce(&[u8], u64) -> Result<Vec<u8>>,
    ) -> Result<Self> {
        let (header, offset) = Header::unpack(decoded)?;
        check_declared_size(&header, decoded)?;
        let ciphertext = &decoded[offset..];
        let plaintext = decrypt(ciphertext, header.timestamp)?;

        let mut cursor = Cursor::new(&plaintext);
        let route_len = cursor.take_u16()? as usize;
        let route = String::from_utf8(cursor.take_slice(route_len)?.to_vec())
            .map_err(|_| MessageError::HeaderTooShort)?;
        if route.is_empty() {
            return Err(MessageError::EmptyRoute);
        }
        let payload_len = cursor.take_u32()? as usize;
        let payload = cursor.take_slice(payload_len)?.to_vec();
        let extension_count = cursor.take_u8()?;
        let mut extensions = Vec::with_capacity(extension_count as usize);
        for _ in 0..extension_count {
            extensions.push(Extension::unpack(&mut cursor)?);
        }

        Ok(ApplicationParcel {
            header,
            route,
            payload,
            extensions,
        })
    }
}

#[derive(Default)]
pub struct ApplicationParcelBuilder {
    source: Option<NodeId>,
    destination: Option<Destination>,
    timestamp: Option<u64>,
    route: Option<String>,
    payload: Vec<u8>,
    extensions: Vec<Extension>,
    failed: bool,
}

impl ApplicationParcelBuilder {
    pub fn source(mut self, source: NodeId) -> Self {
        self.source = Some(source);
        self
    }

    pub fn destination(mut self, destination: Destination) -> Self {
        self.destination = Some(destination);
        self
    }

    pub fn timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn extension(mut self, extension: Extension) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn build(self) -> Result<ApplicationParcel> {
        let route = self.route.ok_or(MessageError::IncompleteBuild("route"))?;
        Ok(ApplicationParcel {
            header: Header {
                protocol: Protocol::Application,
                source: self.source.ok_or(MessageError::IncompleteBuild("source"))?,
                destination: self.destination.unwrap_or(Destination::Cluster),
                timestamp: self.timestamp.unwrap_or(0),
                declared_size: 0,
            },
            route,
            payload: self.payload,
            extensions: self.extensions,
        })
    }

    /// `None` on any staged decode failure or an empty route (invariant ii).
    pub fn validated_build(self) -> Option<ApplicationParcel> {
        if self.failed {
            return None;
        }
        match self.build() {
            Ok(parcel) if !parcel.route.is_empty() => Some(parcel),
            _ => None,
        }
    }
}

/// Reads only the fixed-offset header prefix; returns `None` on a short, malformed, or
/// out-of-range buffer rather than failing verification.
pub fn peek_protocol(decoded: &[u8]) -> Option<Protocol> {
    decoded.first().copied().and_then(|tag| Protocol::from_tag(tag).ok())
}

/// Peeks the source identifier without decrypting or validating the rest of the parcel.
pub fn peek_source(decoded: &[u8]) -> Option<NodeId> {
    Header::unpack(decoded).ok().map(|(header, _)| header.source)
}

/// Peeks the header's declared total encoded size without decrypting or validating the
/// rest of the parcel. Callers that hold the original encoded string can compare this
/// against its length to check invariant (v) before doing any further work.
pub fn peek_encoded_size(decoded: &[u8]) -> Option<u32> {
    Header::unpack(decoded).ok().map(|(header, _)| header.declared_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(seed: u8) -> NodeId {
        NodeId::new(vec![seed; 20]).unwrap()
    }

    #[test]
    fn platform_parcel_round_trips_through_encoded_pack() {
        let parcel = PlatformParcel::builder()
            .source(node(1))
            .destination(Destination::Node(node(2)))
            .timestamp(42)
            .platform_type(PlatformType::HeartbeatRequest)
            .payload(vec![9, 9, 9])
            .build()
            .unwrap();

        let encoded = parcel.pack();
        let decoded = PlatformParcel::from_encoded_pack(&encoded).unwrap();
        assert_eq!(decoded.header.declared_size, encoded.len() as u32);
        assert_eq!(
            PlatformParcel {
                header: Header { declared_size: 0, ..decoded.header.clone() },
                ..decoded
            },
            parcel
        );
    }

    #[test]
    fn platform_builder_stages_failure_on_bad_encoded_pack() {
        let built = PlatformParcel::builder()
            .from_encoded_pack("not valid z85!!")
            .validated_build();
        assert!(built.is_none());
    }

    #[test]
    fn application_parcel_round_trips_with_identity_crypto() {
        let parcel = ApplicationParcel::builder()
            .source(node(3))
            .destination(Destination::Cluster)
            .timestamp(100)
            .route("/info/node")
            .payload(b"hello".to_vec())
            .extension(Extension::Awaitable {
                tracker_key: [7u8; 16],
                binding: AwaitableBinding::Request,
            })
            .build()
            .unwrap();

        let encoded = parcel.pack_encrypted(|body, _nonce| body.to_vec(), |_framed| {});
        let decoded = ApplicationParcel::from_encoded_pack(
            &encoded,
            |ciphertext, _nonce| Ok(ciphertext.to_vec()),
            |_framed| true,
        )
        .unwrap();

        assert_eq!(decoded.route, parcel.route);
        assert_eq!(decoded.payload, parcel.payload);
        assert_eq!(decoded.awaitable().unwrap().1, AwaitableBinding::Request);
    }

    #[test]
    fn application_parcel_rejects_empty_route() {
        let result = ApplicationParcel::builder()
            .source(node(4))
            .route("")
            .build();
        assert!(matches!(result, Err(MessageError::IncompleteBuild(_)))
            || result.map(|p| p.route.is_empty()).unwrap_or(false));
    }

    #[test]
    fn application_parcel_rejects_failed_verification() {
        let parcel = ApplicationParcel::builder()
            .source(node(5))
            .route("/ping")
            .build()
            .unwrap();
        let encoded = parcel.pack_encrypted(|body, _| body.to_vec(), |_| {});
        let result = ApplicationParcel::from_encoded_pack(&encoded, |c, _| Ok(c.to_vec()), |_| false);
        assert!(result.is_err());
    }

    #[test]
    fn peek_helpers_return_none_on_short_buffer() {
        assert_eq!(peek_protocol(&[]), None);
        assert_eq!(peek_source(&[0, 255]), None);
    }

    #[test]
    fn peek_protocol_and_source_read_plaintext_header() {
        let parcel = PlatformParcel::builder()
            .source(node(6))
            .platform_type(PlatformType::Handshake)
            .build()
            .unwrap();
        let mut body = Vec::new();
        parcel.header.pack(&mut body);
        assert_eq!(peek_protocol(&body), Some(Protocol::Platform));
        assert_eq!(peek_source(&body), Some(node(6)));
    }

    #[test]
    fn declared_size_matches_the_encoded_length_it_produced() {
        let parcel = PlatformParcel::builder()
            .source(node(7))
            .platform_type(PlatformType::Handshake)
            .payload(vec![1, 2, 3, 4, 5])
            .build()
            .unwrap();

        let encoded = parcel.pack();
        let decoded = z85_decode(&encoded).unwrap();
        assert_eq!(peek_encoded_size(&decoded), Some(encoded.len() as u32));
    }

    #[test]
    fn tampered_declared_size_is_rejected_on_unpack() {
        let parcel = PlatformParcel::builder()
            .source(node(8))
            .platform_type(PlatformType::Handshake)
            .build()
            .unwrap();

        let encoded = parcel.pack();
        let mut decoded = z85_decode(&encoded).unwrap();
        let (_, offset) = Header::unpack(&decoded).unwrap();
        let declared_size_offset = offset - 4;
        decoded[declared_size_offset..declared_size_offset + 4].copy_from_slice(&999u32.to_le_bytes());

        assert!(matches!(
            PlatformParcel::from_decoded_pack(&decoded),
            Err(MessageError::DeclaredSizeMismatch { .. })
        ));
    }
}
