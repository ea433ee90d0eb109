//! A single peer connection: framed IO and misbehavior accounting.

use crate::core::params::MAX_MESSAGE_BYTES;
use crate::network::message::Message;
use crate::warn;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

/// Score at which a peer is disconnected and banned.
pub const MISBEHAVIOR_THRESHOLD: u32 = 100;

/// Penalty for an unparseable or oversized frame.
pub const PENALTY_MALFORMED: u32 = 20;
/// Penalty for a transaction that fails validation.
pub const PENALTY_INVALID_TX: u32 = 10;
/// Penalty for a block that fails validation.
pub const PENALTY_INVALID_BLOCK: u32 = 50;
/// Penalty for out-of-order or unexpected protocol messages.
pub const PENALTY_UNEXPECTED: u32 = 10;

/// Seconds allowed for a single frame write.
const SEND_TIMEOUT: Duration = Duration::from_secs(20);

/// Write half and bookkeeping for one connected peer.
///
/// The read half stays inside the per-peer task loop; everything that other
/// tasks need (sending, scoring, the advertised height) lives here.
pub struct Peer {
    /// Remote socket address of the connection.
    pub addr: SocketAddr,
    writer: Mutex<OwnedWriteHalf>,
    score: AtomicU32,
    height: AtomicU64,
    closed: AtomicBool,
    /// True for connections we dialed.
    pub outbound: bool,
}

impl Peer {
    pub fn new(addr: SocketAddr, writer: OwnedWriteHalf, outbound: bool) -> Self {
        Self {
            addr,
            writer: Mutex::new(writer),
            score: AtomicU32::new(0),
            height: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            outbound,
        }
    }

    /// Sends one framed message; marks the peer closed on failure.
    pub async fn send(&self, msg: &Message) -> bool {
        if self.is_closed() {
            return false;
        }
        let frame = match msg.encode_frame() {
            Ok(frame) => frame,
            Err(err) => {
                warn!("refusing to send malformed frame to {}: {err}", self.addr);
                return false;
            }
        };
        let mut writer = self.writer.lock().await;
        let write = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        };
        match timeout(SEND_TIMEOUT, write).await {
            Ok(Ok(())) => true,
            _ => {
                self.close();
                false
            }
        }
    }

    /// Raises the misbehavior score; true when the threshold is crossed.
    pub fn penalize(&self, penalty: u32) -> bool {
        let score = self.score.fetch_add(penalty, Ordering::Relaxed) + penalty;
        score >= MISBEHAVIOR_THRESHOLD
    }

    pub fn score(&self) -> u32 {
        self.score.load(Ordering::Relaxed)
    }

    pub fn set_height(&self, height: u64) {
        self.height.store(height, Ordering::Relaxed);
    }

    pub fn height(&self) -> u64 {
        self.height.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }
}

/// Reads one length-prefixed frame and decodes it.
///
/// Returns `Ok(None)` on clean EOF, and an error for oversized frames,
/// truncated reads, or undecodable bodies.
pub async fn read_message(reader: &mut OwnedReadHalf) -> std::io::Result<Option<Message>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len == 0 || len > MAX_MESSAGE_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame length {len} out of bounds"),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;

    Message::decode_body(&body)
        .map(Some)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::message::{Handshake, TxAnnounce};
    use crate::types::hash::Hash;
    use tokio::net::{TcpListener, TcpStream};

    async fn pair() -> (Peer, OwnedReadHalf) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, (server, _)) =
            tokio::join!(TcpStream::connect(addr), async { listener.accept().await.unwrap() });
        let (_, client_writer) = client.unwrap().into_split();
        let (server_reader, _server_writer) = server.into_split();
        (Peer::new(addr, client_writer, true), server_reader)
    }

    #[tokio::test]
    async fn send_and_receive_roundtrip() {
        let (peer, mut reader) = pair().await;

        let msg = Message::Handshake(Handshake {
            version: 1,
            height: 3,
            genesis_hash: Hash::sha256(b"g"),
        });
        assert!(peer.send(&msg).await);

        let received = read_message(&mut reader).await.unwrap().unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn multiple_frames_in_order() {
        let (peer, mut reader) = pair().await;

        for i in 0..3u8 {
            let msg = Message::TxAnnounce(TxAnnounce {
                tx_hash: Hash::sha256(&[i]),
            });
            assert!(peer.send(&msg).await);
        }
        for i in 0..3u8 {
            let received = read_message(&mut reader).await.unwrap().unwrap();
            assert_eq!(
                received,
                Message::TxAnnounce(TxAnnounce {
                    tx_hash: Hash::sha256(&[i]),
                })
            );
        }
    }

    #[tokio::test]
    async fn eof_reads_as_none() {
        let (peer, mut reader) = pair().await;
        drop(peer);
        assert!(read_message(&mut reader).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, (server, _)) =
            tokio::join!(TcpStream::connect(addr), async { listener.accept().await.unwrap() });
        let mut client = client.unwrap();
        let (mut server_reader, _w) = server.into_split();

        let bogus_len = (MAX_MESSAGE_BYTES as u32 + 1).to_be_bytes();
        client.write_all(&bogus_len).await.unwrap();
        client.flush().await.unwrap();

        assert!(read_message(&mut server_reader).await.is_err());
    }

    #[test]
    fn penalize_crosses_threshold() {
        // Scores accumulate without a connection
        let score = AtomicU32::new(0);
        let mut crossed = false;
        for _ in 0..10 {
            let s = score.fetch_add(PENALTY_INVALID_TX, Ordering::Relaxed) + PENALTY_INVALID_TX;
            crossed = s >= MISBEHAVIOR_THRESHOLD;
        }
        assert!(crossed);
    }
}
