//! Minimal TCP endpoint driver (C2's single concrete transport). Frames are
//! Z85-encoded strings, one per line — Z85's alphabet excludes `\n`, so
//! newline-delimited framing is exact with no further escaping.
//!
//! A [`PeerProxy`] is keyed by the remote's [`NodeId`], which isn't known
//! until its first handshake buffer arrives. So a connection starts as a bare
//! [`ExchangeProcessor`] talking directly to the socket; only once
//! `brypt_message::peek_source` reveals the remote identity does a
//! `PeerProxy` get constructed and registered.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use brypt_identifier::NodeId;
use brypt_peer::{AuthorizedProcessor, ConnectProtocol, ExchangeProcessor, MessageSink, PeerProxy};
use brypt_security::ExchangeRole;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::node::PeerRegistry;

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// State every connection handler needs, shared across the whole node.
pub struct Shared {
    pub local_identifier: NodeId,
    pub registry: Arc<PeerRegistry>,
    pub authorized: Arc<AuthorizedProcessor>,
    pub connect: Arc<dyn ConnectProtocol>,
}

/// Accepts inbound connections until the listener errors or is dropped.
pub async fn listen(bind_address: SocketAddr, shared: Arc<Shared>) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_address).await?;
    info!(%bind_address, "listening for inbound peer connections");
    loop {
        let (stream, remote) = listener.accept().await?;
        let shared = shared.clone();
        tokio::spawn(async move {
            if let Err(error) = handle_connection(stream, shared, ExchangeRole::Acceptor).await {
                warn!(%remote, %error, "inbound peer connection ended");
            }
        });
    }
}

/// Dials one bootstrap/CLI-provided peer address.
pub async fn connect(address: SocketAddr, shared: Arc<Shared>) -> std::io::Result<()> {
    let stream = TcpStream::connect(address).await?;
    info!(%address, "connected to peer");
    handle_connection(stream, shared, ExchangeRole::Initiator).await
}

/// Drives the handshake directly over the socket (no `PeerProxy` exists yet, since
/// the remote identity is unknown), then constructs and registers the proxy once
/// the first buffer reveals it, then hands the rest of the stream to the proxy.
async fn handle_connection(stream: TcpStream, shared: Arc<Shared>, role: ExchangeRole) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half).lines();

    let mut exchange = ExchangeProcessor::new(shared.local_identifier.clone(), role);
    if let Some(outgoing) = exchange.prepare() {
        write_half.write_all(outgoing.pack.as_bytes()).await?;
        write_half.write_all(b"\n").await?;
    }

    let Some(first_line) = reader.next_line().await? else {
        return Ok(());
    };
    let decoded = brypt_message::z85_decode(&first_line).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidData, "malformed first handshake frame")
    })?;
    let remote_identifier = brypt_message::peek_source(&decoded)
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidData, "handshake frame carries no source"))?;

    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(pack) = outbox_rx.recv().await {
            if write_half.write_all(pack.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let endpoint_id = NEXT_ENDPOINT_ID.fetch_add(1, Ordering::Relaxed);
    let proxy = PeerProxy::new(remote_identifier.clone(), MessageSink::Exchange(parking_lot::Mutex::new(exchange)));
    proxy.register_endpoint(endpoint_id, move |pack| outbox_tx.send(pack.to_string()).is_ok());
    shared.registry.insert(proxy.clone());

    if !proxy.schedule_receive(first_line.as_bytes()) {
        warn!(peer = %remote_identifier, "handshake rejected the first frame");
    }
    proxy.try_promote(shared.authorized.clone(), shared.connect.as_ref());

    while let Some(line) = reader.next_line().await? {
        if !proxy.schedule_receive(line.as_bytes()) {
            warn!(peer = %remote_identifier, "dropped an unreadable frame");
            continue;
        }
        proxy.try_promote(shared.authorized.clone(), shared.connect.as_ref());
    }

    info!(peer = %remote_identifier, "peer connection closed");
    Ok(())
}
