//! P2P server: peer lifecycle, gossip, and bulk sync.
//!
//! Every connection starts with a handshake from both sides; a version or
//! genesis mismatch disconnects immediately. Announcements are
//! deduplicated by content hash through bounded recent-seen caches, and a
//! node relays a given transaction or block to a peer at most once.
//! Invalid messages raise the sender's misbehavior score; past the
//! threshold the peer is disconnected and its address banned for a while.

use crate::core::params::{
    HANDSHAKE_TIMEOUT_SECS, MAX_PEERS, PEER_EXCHANGE_INTERVAL_SECS, PROTOCOL_VERSION,
    SEEN_CACHE_CAPACITY, SYNC_BATCH,
};
use crate::core::validator::ValidationError;
use crate::network::message::{
    BlockAnnounce, BlockRequest, BlockResponse, Handshake, Message, PeerAddr, PeersResponse,
    SyncRequest, SyncResponse, TxAnnounce, TxRequest, TxResponse,
};
use crate::network::peer::{
    read_message, Peer, PENALTY_INVALID_BLOCK, PENALTY_INVALID_TX, PENALTY_MALFORMED,
    PENALTY_UNEXPECTED,
};
use crate::node::{Node, NodeError, NodeEvent};
use crate::types::hash::Hash;
use crate::{info, warn};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{interval, timeout};

/// Seconds a misbehaving peer's address stays banned.
const BAN_SECS: u64 = 600;
/// Handshake must complete within this window.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(HANDSHAKE_TIMEOUT_SECS);
/// Minimum spacing between PEERS_REQUESTs from one peer.
const PEERS_REQUEST_MIN_INTERVAL: Duration = Duration::from_secs(10);
/// Maximum addresses returned per PEERS_RESPONSE.
const MAX_ADDRS_PER_RESPONSE: usize = 32;

/// Bounded set remembering recently seen announcement hashes.
struct SeenCache {
    inner: Mutex<(HashSet<Hash>, VecDeque<Hash>)>,
    capacity: usize,
}

impl SeenCache {
    fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new((HashSet::new(), VecDeque::new())),
            capacity,
        }
    }

    /// Records a hash; true when it was not seen before.
    fn insert(&self, hash: Hash) -> bool {
        let (set, order) = &mut *self.inner.lock().unwrap();
        if !set.insert(hash) {
            return false;
        }
        order.push_back(hash);
        while order.len() > self.capacity {
            if let Some(evicted) = order.pop_front() {
                set.remove(&evicted);
            }
        }
        true
    }
}

/// Per-connection rate limiting state.
#[derive(Default)]
struct PeerMeta {
    last_peers_request: Option<Instant>,
}

pub struct P2pServer {
    node: Arc<Node>,
    peers: DashMap<SocketAddr, Arc<Peer>>,
    peer_meta: DashMap<SocketAddr, PeerMeta>,
    known_addrs: Mutex<HashSet<SocketAddr>>,
    banned: Mutex<HashMap<IpAddr, Instant>>,
    seen_txs: SeenCache,
    seen_blocks: SeenCache,
    syncing: AtomicBool,
    max_peers: usize,
}

impl P2pServer {
    pub fn new(node: Arc<Node>) -> Arc<Self> {
        Arc::new(Self {
            node,
            peers: DashMap::new(),
            peer_meta: DashMap::new(),
            known_addrs: Mutex::new(HashSet::new()),
            banned: Mutex::new(HashMap::new()),
            seen_txs: SeenCache::new(SEEN_CACHE_CAPACITY),
            seen_blocks: SeenCache::new(SEEN_CACHE_CAPACITY),
            syncing: AtomicBool::new(false),
            max_peers: MAX_PEERS,
        })
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// True while a bulk catch-up is in flight.
    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Relaxed)
    }

    /// Binds the listener and spawns the accept, event-forwarding, and
    /// peer-exchange tasks. Returns the bound address.
    pub async fn start(self: &Arc<Self>, listen: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(listen).await?;
        let local = listener.local_addr()?;
        info!("p2p listening on {local}");

        let server = self.clone();
        tokio::spawn(async move {
            server.accept_loop(listener).await;
        });

        let server = self.clone();
        tokio::spawn(async move {
            server.forward_node_events().await;
        });

        let server = self.clone();
        tokio::spawn(async move {
            server.peer_exchange_loop().await;
        });

        Ok(local)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let Ok((stream, addr)) = listener.accept().await else {
                continue;
            };
            if self.is_banned(addr.ip()) || self.peers.len() >= self.max_peers {
                continue;
            }
            let server = self.clone();
            tokio::spawn(async move {
                server.establish(stream, addr, false).await;
            });
        }
    }

    /// Dials a peer and performs the handshake.
    pub async fn connect(self: &Arc<Self>, addr: SocketAddr) -> bool {
        if self.peers.contains_key(&addr) {
            return true;
        }
        if self.is_banned(addr.ip()) || self.peers.len() >= self.max_peers {
            return false;
        }
        match timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => self.clone().establish(stream, addr, true).await,
            _ => false,
        }
    }

    /// Runs the bidirectional handshake and registers the peer.
    async fn establish(self: Arc<Self>, stream: TcpStream, addr: SocketAddr, outbound: bool) -> bool {
        let (mut reader, writer) = stream.into_split();
        let peer = Arc::new(Peer::new(addr, writer, outbound));

        let ours = Message::Handshake(Handshake {
            version: PROTOCOL_VERSION,
            height: self.node.tip_info().1,
            genesis_hash: self.node.genesis_hash(),
        });
        if !peer.send(&ours).await {
            return false;
        }

        let theirs = match timeout(HANDSHAKE_TIMEOUT, read_message(&mut reader)).await {
            Ok(Ok(Some(Message::Handshake(handshake)))) => handshake,
            _ => {
                warn!("handshake with {addr} failed");
                return false;
            }
        };

        if theirs.version != PROTOCOL_VERSION {
            warn!("peer {addr} speaks version {}, disconnecting", theirs.version);
            return false;
        }
        if theirs.genesis_hash != self.node.genesis_hash() {
            warn!("peer {addr} is on a different network, disconnecting");
            return false;
        }

        peer.set_height(theirs.height);
        self.peers.insert(addr, peer.clone());
        self.peer_meta.insert(addr, PeerMeta::default());
        info!(
            "{} peer connected: {addr} (height {})",
            if peer.outbound { "outbound" } else { "inbound" },
            theirs.height
        );

        if theirs.height > self.node.tip_info().1 {
            self.start_sync(&peer).await;
        }

        let server = self.clone();
        tokio::spawn(async move {
            server.peer_loop(reader, peer).await;
        });
        true
    }

    async fn peer_loop(self: Arc<Self>, mut reader: OwnedReadHalf, peer: Arc<Peer>) {
        while !peer.is_closed() {
            match read_message(&mut reader).await {
                Ok(Some(message)) => self.handle_message(&peer, message).await,
                Ok(None) => break,
                Err(err) => {
                    warn!("bad frame from {}: {err}", peer.addr);
                    self.penalize(&peer, PENALTY_MALFORMED);
                    break;
                }
            }
        }
        self.peers.remove(&peer.addr);
        self.peer_meta.remove(&peer.addr);
        peer.close();
        // A sync in flight against this peer will never finish
        self.syncing.store(false, Ordering::Relaxed);
        info!("peer disconnected: {}", peer.addr);
    }

    fn penalize(&self, peer: &Arc<Peer>, penalty: u32) {
        if peer.penalize(penalty) {
            warn!(
                "peer {} crossed misbehavior threshold (score {}), banning",
                peer.addr,
                peer.score()
            );
            self.banned
                .lock()
                .unwrap()
                .insert(peer.addr.ip(), Instant::now() + Duration::from_secs(BAN_SECS));
            peer.close();
        }
    }

    fn is_banned(&self, ip: IpAddr) -> bool {
        let mut banned = self.banned.lock().unwrap();
        match banned.get(&ip) {
            Some(until) if *until > Instant::now() => true,
            Some(_) => {
                banned.remove(&ip);
                false
            }
            None => false,
        }
    }

    async fn handle_message(self: &Arc<Self>, peer: &Arc<Peer>, message: Message) {
        match message {
            Message::Handshake(_) => {
                // Only valid as the first message of a connection
                self.penalize(peer, PENALTY_UNEXPECTED);
            }
            Message::PeersRequest => self.on_peers_request(peer).await,
            Message::PeersResponse(msg) => self.on_peers_response(msg),
            Message::TxAnnounce(msg) => self.on_tx_announce(peer, msg).await,
            Message::TxRequest(msg) => self.on_tx_request(peer, msg).await,
            Message::TxResponse(msg) => self.on_tx_response(peer, msg).await,
            Message::BlockAnnounce(msg) => self.on_block_announce(peer, msg).await,
            Message::BlockRequest(msg) => self.on_block_request(peer, msg).await,
            Message::BlockResponse(msg) => self.on_block_response(peer, msg).await,
            Message::SyncRequest(msg) => self.on_sync_request(peer, msg).await,
            Message::SyncResponse(msg) => self.on_sync_response(peer, msg).await,
        }
    }

    async fn on_peers_request(&self, peer: &Arc<Peer>) {
        {
            let mut meta = self.peer_meta.entry(peer.addr).or_default();
            if let Some(last) = meta.last_peers_request {
                if last.elapsed() < PEERS_REQUEST_MIN_INTERVAL {
                    self.penalize(peer, PENALTY_UNEXPECTED);
                    return;
                }
            }
            meta.last_peers_request = Some(Instant::now());
        }

        let peers = self
            .peers
            .iter()
            .filter(|entry| *entry.key() != peer.addr)
            .take(MAX_ADDRS_PER_RESPONSE)
            .map(|entry| PeerAddr {
                host: entry.key().ip().to_string(),
                port: entry.key().port(),
            })
            .collect();
        peer.send(&Message::PeersResponse(PeersResponse { peers })).await;
    }

    fn on_peers_response(&self, msg: PeersResponse) {
        let mut known = self.known_addrs.lock().unwrap();
        for addr in msg.peers {
            if let Ok(ip) = addr.host.parse::<IpAddr>() {
                known.insert(SocketAddr::new(ip, addr.port));
            }
        }
    }

    async fn on_tx_announce(&self, peer: &Arc<Peer>, msg: TxAnnounce) {
        if !self.seen_txs.insert(msg.tx_hash) {
            return;
        }
        let unknown = !self.node.mempool().contains(&msg.tx_hash)
            && self.node.get_transaction(&msg.tx_hash).is_none();
        if unknown {
            peer.send(&Message::TxRequest(TxRequest {
                tx_hash: msg.tx_hash,
            }))
            .await;
        }
    }

    async fn on_tx_request(&self, peer: &Arc<Peer>, msg: TxRequest) {
        let transaction = self
            .node
            .get_transaction(&msg.tx_hash)
            .map(|(tx, _)| tx);
        peer.send(&Message::TxResponse(TxResponse { transaction }))
            .await;
    }

    async fn on_tx_response(&self, peer: &Arc<Peer>, msg: TxResponse) {
        let Some(tx) = msg.transaction else {
            return;
        };
        match self.node.submit_transaction(tx, Some(peer.addr)) {
            Ok(hash) => {
                self.seen_txs.insert(hash);
            }
            Err(err) => {
                warn!("rejected tx from {}: {err}", peer.addr);
                self.penalize(peer, PENALTY_INVALID_TX);
            }
        }
    }

    async fn on_block_announce(&self, peer: &Arc<Peer>, msg: BlockAnnounce) {
        peer.set_height(msg.height.max(peer.height()));
        if !self.seen_blocks.insert(msg.block_hash) {
            return;
        }
        if self.node.get_block_by_hash(&msg.block_hash).is_some() {
            return;
        }
        let our_height = self.node.tip_info().1;
        if msg.height <= our_height + 1 {
            peer.send(&Message::BlockRequest(BlockRequest {
                block_hash: Some(msg.block_hash),
                height: None,
            }))
            .await;
        } else {
            self.start_sync(peer).await;
        }
    }

    async fn on_block_request(&self, peer: &Arc<Peer>, msg: BlockRequest) {
        let block = match (msg.block_hash, msg.height) {
            (Some(hash), _) => self.node.get_block_by_hash(&hash),
            (None, Some(height)) => self.node.get_block_by_height(height),
            (None, None) => {
                self.penalize(peer, PENALTY_UNEXPECTED);
                return;
            }
        };
        peer.send(&Message::BlockResponse(BlockResponse {
            block: block.map(|b| (*b).clone()),
        }))
        .await;
    }

    async fn on_block_response(&self, peer: &Arc<Peer>, msg: BlockResponse) {
        let Some(block) = msg.block else {
            return;
        };
        self.ingest_block(peer, block).await;
    }

    /// Shared block intake for gossip and sync paths.
    ///
    /// Returns false when the peer should stop being drained (invalid data).
    async fn ingest_block(&self, peer: &Arc<Peer>, block: crate::core::block::Block) -> bool {
        let hash = block.block_hash();
        self.seen_blocks.insert(hash);
        match self.node.submit_block(block, Some(peer.addr)) {
            Ok(_) => true,
            Err(NodeError::Validation(ValidationError::UnknownParent(_))) => {
                // A gap, not misbehavior; catch up from this peer
                self.start_sync(peer).await;
                false
            }
            Err(err) => {
                warn!("rejected block {hash} from {}: {err}", peer.addr);
                self.penalize(peer, PENALTY_INVALID_BLOCK);
                false
            }
        }
    }

    async fn on_sync_request(&self, peer: &Arc<Peer>, msg: SyncRequest) {
        if msg.to_height < msg.from_height {
            self.penalize(peer, PENALTY_UNEXPECTED);
            return;
        }
        let to_height = msg
            .to_height
            .min(msg.from_height.saturating_add(SYNC_BATCH - 1));
        // Stay well under the frame limit even with near-maximum blocks
        let byte_budget = crate::core::params::MAX_MESSAGE_BYTES * 3 / 4;
        let mut blocks = Vec::new();
        let mut bytes = 0;
        for height in msg.from_height..=to_height {
            match self.node.get_block_by_height(height) {
                Some(block) => {
                    bytes += block.serialized_size();
                    if !blocks.is_empty() && bytes > byte_budget {
                        break;
                    }
                    blocks.push((*block).clone());
                }
                None => break,
            }
        }
        peer.send(&Message::SyncResponse(SyncResponse { blocks }))
            .await;
    }

    async fn on_sync_response(&self, peer: &Arc<Peer>, msg: SyncResponse) {
        let mut last_height = None;
        for block in msg.blocks {
            let height = block.header.height;
            if !self.ingest_block(peer, block).await {
                self.syncing.store(false, Ordering::Relaxed);
                return;
            }
            last_height = Some(height);
        }

        // Keep draining while the peer advertises more; an empty response
        // ends the round regardless
        if let Some(last) = last_height {
            if last < peer.height() {
                peer.send(&Message::SyncRequest(SyncRequest {
                    from_height: last + 1,
                    to_height: last + SYNC_BATCH,
                }))
                .await;
                return;
            }
        }
        self.syncing.store(false, Ordering::Relaxed);
    }

    async fn start_sync(&self, peer: &Arc<Peer>) {
        if self.syncing.swap(true, Ordering::Relaxed) {
            return;
        }
        let from_height = self.node.tip_info().1 + 1;
        info!(
            "syncing from {} starting at height {from_height}",
            peer.addr
        );
        peer.send(&Message::SyncRequest(SyncRequest {
            from_height,
            to_height: from_height + SYNC_BATCH - 1,
        }))
        .await;
    }

    /// Relays locally admitted transactions and stored blocks, skipping the
    /// peer they came from.
    async fn forward_node_events(self: Arc<Self>) {
        let mut events = self.node.subscribe();
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("event forwarder lagged, skipped {skipped} events");
                    continue;
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            };
            match event {
                NodeEvent::TxAdmitted { hash, origin } => {
                    self.seen_txs.insert(hash);
                    self.broadcast(Message::TxAnnounce(TxAnnounce { tx_hash: hash }), origin)
                        .await;
                }
                NodeEvent::BlockStored {
                    hash,
                    height,
                    origin,
                } => {
                    self.seen_blocks.insert(hash);
                    self.broadcast(
                        Message::BlockAnnounce(BlockAnnounce {
                            block_hash: hash,
                            height,
                        }),
                        origin,
                    )
                    .await;
                }
                NodeEvent::TipChanged { .. } => {}
            }
        }
    }

    async fn broadcast(&self, message: Message, exclude: Option<SocketAddr>) {
        let targets: Vec<Arc<Peer>> = self
            .peers
            .iter()
            .filter(|entry| Some(*entry.key()) != exclude)
            .map(|entry| entry.value().clone())
            .collect();
        for peer in targets {
            peer.send(&message).await;
        }
    }

    /// Periodically exchanges addresses and dials new peers.
    async fn peer_exchange_loop(self: Arc<Self>) {
        let mut ticker = interval(Duration::from_secs(PEER_EXCHANGE_INTERVAL_SECS));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            self.broadcast(Message::PeersRequest, None).await;

            let candidates: Vec<SocketAddr> = {
                let known = self.known_addrs.lock().unwrap();
                known
                    .iter()
                    .filter(|addr| !self.peers.contains_key(addr))
                    .copied()
                    .collect()
            };
            for addr in candidates {
                if self.peers.len() >= self.max_peers {
                    break;
                }
                self.connect(addr).await;
            }
        }
    }
}
