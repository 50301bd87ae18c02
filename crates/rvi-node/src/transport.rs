//! Framed transport over one TLS stream.
//!
//! Each session gets two tasks:
//!   - reader: fills the per-connection partial-read buffer, cuts frames and
//!     forwards decoded messages to the node as `(id, Inbound)` events
//!   - writer: drains the outbound channel, encodes and writes frames
//!
//! Neither task touches the registry. The reader never holds a lock across
//! a network wait.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsStream;

use rvi_core::wire::{encode_frame, FrameDecoder};
use rvi_core::{ConnectionId, RviError, WireMessage};
use rvi_services::{Inbound, SessionHandle};

use crate::tls::fingerprint;

/// Transport events for the node's dispatch loop.
pub type EventSender = mpsc::UnboundedSender<(ConnectionId, Inbound)>;

const READ_CHUNK: usize = 8 * 1024;

/// Start reader and writer tasks for an established TLS stream.
pub fn spawn_session(
    id: ConnectionId,
    stream: TlsStream<TcpStream>,
    peer_addr: SocketAddr,
    events: EventSender,
) -> SessionHandle {
    let fp = {
        let (_, state) = stream.get_ref();
        state
            .peer_certificates()
            .and_then(|chain| chain.first())
            .map(fingerprint)
    };
    let (reader, writer) = tokio::io::split(stream);
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(write_loop(id, writer, rx));
    let reader = tokio::spawn(read_loop(id, reader, events));

    tracing::debug!(
        connection = %id,
        peer = %peer_addr,
        fingerprint = fp.as_deref().unwrap_or("-"),
        "session tasks started"
    );
    SessionHandle::new(tx)
        .with_peer(peer_addr, fp)
        .with_reader(reader.abort_handle())
}

async fn read_loop(id: ConnectionId, mut reader: ReadHalf<TlsStream<TcpStream>>, events: EventSender) {
    let mut decoder = FrameDecoder::new();
    let reason = loop {
        decoder.buffer_mut().reserve(READ_CHUNK);
        match reader.read_buf(decoder.buffer_mut()).await {
            Ok(0) => break RviError::TransportFailure("peer closed the connection".into()),
            Ok(n) => tracing::trace!(connection = %id, bytes = n, "read"),
            Err(e) => break RviError::from(e),
        }

        let mut failed = None;
        loop {
            match decoder.decode() {
                Ok(Some(msg)) => {
                    if events.send((id, Inbound::Message(msg))).is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            break e;
        }
    };

    tracing::debug!(connection = %id, error = %reason, "reader stopped");
    let _ = events.send((id, Inbound::Closed(reason)));
}

async fn write_loop(
    id: ConnectionId,
    mut writer: WriteHalf<TlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<WireMessage>,
) {
    let mut buf = BytesMut::new();
    while let Some(msg) = outbound.recv().await {
        buf.clear();
        if let Err(e) = encode_frame(&msg, &mut buf) {
            tracing::warn!(connection = %id, command = msg.command(), error = %e, "dropping unencodable message");
            continue;
        }
        if let Err(e) = writer.write_all(&buf).await {
            tracing::debug!(connection = %id, error = %e, "write failed");
            return;
        }
        if let Err(e) = writer.flush().await {
            tracing::debug!(connection = %id, error = %e, "flush failed");
            return;
        }
        tracing::trace!(connection = %id, command = msg.command(), "message sent");
    }
    // Handle dropped: send close_notify and shut the socket.
    let _ = writer.shutdown().await;
}
