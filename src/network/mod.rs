//! # Network Transport
//!
//! Peers are indexed by location-specifier string (`tcp:<host>:<port>`).
//! Each live peer owns a reader task and a writer task; the reader
//! decodes the wire protocol's `NameLen -> Name -> TupleLen -> Tuple`
//! cycle and forwards each completed message to the router's work queue
//! as [`WorkItem::RawTuple`], the writer drains an outbound byte queue.
//!
//! Tokio's cooperative scheduler stands in for a hand-rolled non-blocking
//! state machine (`Idle -> Header -> Tuple` on send, `NameLen -> Name ->
//! TupleLen -> Tuple` on receive): each `read_exact`/`write_all` await
//! point *is* a suspension point in that state machine, so the explicit
//! states collapse into a straight-line async function.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::router::WorkItem;
use crate::wire;

struct PeerHandle {
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

/// Process-wide peer table for one runtime instance, plus the sender
/// every reader task uses to hand decoded frames back to the router.
pub struct PeerRegistry {
    peers: Mutex<HashMap<String, PeerHandle>>,
    work_tx: mpsc::Sender<WorkItem>,
}

impl PeerRegistry {
    pub fn new(work_tx: mpsc::Sender<WorkItem>) -> Arc<Self> {
        Arc::new(PeerRegistry { peers: Mutex::new(HashMap::new()), work_tx })
    }

    /// Looks up or establishes the outbound connection for `peer_addr`
    /// and ships `(table, tuple)` over it.
    pub async fn send(self: &Arc<Self>, peer_addr: &str, table: &str, tuple: &crate::value::Tuple) {
        let Some(tx) = self.get_or_connect(peer_addr).await else { return };
        let body = wire::encode_tuple_body(tuple);
        let msg = wire::encode_message(table, &body);
        let _ = tx.send(msg);
    }

    async fn get_or_connect(self: &Arc<Self>, peer_addr: &str) -> Option<mpsc::UnboundedSender<Vec<u8>>> {
        if let Some(tx) = self.peers.lock().get(peer_addr).map(|h| h.outbound.clone()) {
            return Some(tx);
        }
        let addr = parse_loc_spec(peer_addr).await?;
        match TcpStream::connect(addr).await {
            Ok(stream) => Some(self.register_outbound(peer_addr.to_string(), stream)),
            Err(e) => {
                tracing::warn!(error = %e, peer = %peer_addr, "failed to connect to peer");
                None
            }
        }
    }

    /// We initiated this connection because no entry existed (checked
    /// under the lock in `get_or_connect`); a fresh entry always wins
    /// here, there is no concurrent inbound race to preserve.
    fn register_outbound(self: &Arc<Self>, key: String, stream: TcpStream) -> mpsc::UnboundedSender<Vec<u8>> {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(write_half, rx));
        tokio::spawn(reader_task(read_half, Arc::clone(self), key.clone()));
        self.peers.lock().insert(key, PeerHandle { outbound: tx.clone() });
        tx
    }

    /// An inbound connection is always serviced for receive, but a
    /// pre-existing entry for the same key is left in place — the new
    /// socket's outbound sender is simply never registered for sends.
    fn register_inbound(self: &Arc<Self>, key: String, stream: TcpStream) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_task(write_half, rx));
        tokio::spawn(reader_task(read_half, Arc::clone(self), key.clone()));
        match self.peers.lock().entry(key) {
            Entry::Occupied(_) => {
                // Pre-existing entry kept; this socket's writer queue
                // (`tx`) has no registered sender and is dropped once
                // the reader task's clone of it goes away.
                drop(tx);
            }
            Entry::Vacant(slot) => {
                slot.insert(PeerHandle { outbound: tx });
            }
        }
    }

    fn remove(&self, key: &str) {
        self.peers.lock().remove(key);
    }
}

async fn parse_loc_spec(loc: &str) -> Option<SocketAddr> {
    let rest = loc.strip_prefix("tcp:")?;
    tokio::net::lookup_host(rest).await.ok()?.next()
}

async fn writer_task(mut write_half: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(msg) = rx.recv().await {
        if let Err(e) = write_half.write_all(&msg).await {
            tracing::warn!(error = %e, "peer write failed, tearing down writer");
            break;
        }
    }
}

/// Walks the receive state machine once per message:
/// `NameLen -> Name -> TupleLen -> Tuple`, then loops. A clean EOF right
/// at `NameLen` ends the peer silently; anything else mid-record is a
/// warning-logged teardown.
async fn reader_task(mut read_half: tokio::net::tcp::OwnedReadHalf, registry: Arc<PeerRegistry>, key: String) {
    loop {
        let mut name_len_buf = [0u8; 2];
        match read_half.read_exact(&mut name_len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                tracing::warn!(error = %e, peer = %key, "peer read failed at message boundary");
                break;
            }
        }
        let name_len = u16::from_be_bytes(name_len_buf) as usize;

        let mut name_buf = vec![0u8; name_len];
        if let Err(e) = read_half.read_exact(&mut name_buf).await {
            tracing::warn!(error = %e, peer = %key, "peer disconnected mid-record reading table name");
            break;
        }
        let table = match String::from_utf8(name_buf) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, peer = %key, "peer sent non-utf8 table name, tearing down");
                break;
            }
        };

        let mut tuple_len_buf = [0u8; 4];
        if let Err(e) = read_half.read_exact(&mut tuple_len_buf).await {
            tracing::warn!(error = %e, peer = %key, "peer disconnected mid-record reading tuple length");
            break;
        }
        let tuple_len = u32::from_be_bytes(tuple_len_buf) as usize;

        let mut body = vec![0u8; tuple_len];
        if let Err(e) = read_half.read_exact(&mut body).await {
            tracing::warn!(error = %e, peer = %key, "peer disconnected mid-record reading tuple body");
            break;
        }

        if registry.work_tx.send(WorkItem::RawTuple { table, body }).await.is_err() {
            break;
        }
    }
    registry.remove(&key);
}

/// Accepts inbound connections for the lifetime of the runtime thread.
pub async fn run_accept_loop(listener: TcpListener, registry: Arc<PeerRegistry>) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let key = format!("tcp:{}:{}", addr.ip(), addr.port());
                registry.register_inbound(key, stream);
            }
            Err(e) => tracing::warn!(error = %e, "accept failed"),
        }
    }
}

/// Drains `net_rx` for the lifetime of the runtime thread, shipping each
/// outbound tuple over (or establishing) the addressed peer's
/// connection.
pub async fn run_outbound_loop(mut net_rx: mpsc::UnboundedReceiver<crate::router::NetOutbound>, registry: Arc<PeerRegistry>) {
    while let Some(out) = net_rx.recv().await {
        registry.send(&out.peer_addr, &out.table, &out.tuple).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn parses_tcp_loc_spec() {
        let addr = parse_loc_spec("tcp:127.0.0.1:9999").await;
        assert_eq!(addr, Some("127.0.0.1:9999".parse().unwrap()));
    }

    #[tokio::test]
    async fn rejects_non_tcp_scheme() {
        assert!(parse_loc_spec("udp:127.0.0.1:9999").await.is_none());
    }
}
