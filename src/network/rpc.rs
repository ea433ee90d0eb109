//! JSON-RPC 2.0 front-end over a minimal HTTP/1.1 server.
//!
//! Consumed by wallets and indexers; validation failures surface their
//! categorical error kind in the JSON-RPC error message with code
//! `-32000`. The transport intentionally implements just enough HTTP for
//! a `POST` with `Content-Length`.

use crate::core::transaction::Transaction;
use crate::crypto::key_pair::PublicKey;
use crate::info;
use crate::node::Node;
use crate::types::hash::Hash;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};

/// Per-request IO timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;

pub struct RpcServer {
    node: Arc<Node>,
}

impl RpcServer {
    pub fn new(node: Arc<Node>) -> Arc<Self> {
        Arc::new(Self { node })
    }

    /// Binds the RPC listener and spawns the accept loop.
    pub async fn start(self: &Arc<Self>, listen: SocketAddr) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind(listen).await?;
        let local = listener.local_addr()?;
        info!("rpc listening on {local}");

        let server = self.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    continue;
                };
                let server = server.clone();
                tokio::spawn(async move {
                    let _ = timeout(REQUEST_TIMEOUT, server.handle_connection(stream)).await;
                });
            }
        });
        Ok(local)
    }

    async fn handle_connection(&self, mut stream: TcpStream) {
        let Some(body) = read_http_body(&mut stream).await else {
            return;
        };

        let response = match serde_json::from_slice::<Value>(&body) {
            Ok(request) => self.dispatch(request),
            Err(_) => error_response(Value::Null, -32700, "Parse error"),
        };
        let _ = write_http_response(&mut stream, &response).await;
    }

    fn dispatch(&self, request: Value) -> Value {
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");
        let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

        let result = match method {
            "submit_transaction" => self.submit_transaction(&params),
            "get_block" => self.get_block(&params),
            "get_transaction" => self.get_transaction(&params),
            "get_account" => self.get_account(&params),
            "get_latest_block" => self.get_latest_block(),
            "get_mempool" => self.get_mempool(),
            "get_merkle_proof" => self.get_merkle_proof(&params),
            "get_state_proof" => self.get_state_proof(&params),
            "get_node_info" => self.get_node_info(),
            _ => {
                return error_response(id, -32601, &format!("Method not found: {method}"));
            }
        };

        match result {
            Ok(value) => json!({"jsonrpc": "2.0", "id": id, "result": value}),
            Err(message) => error_response(id, -32000, &message),
        }
    }

    fn submit_transaction(&self, params: &Value) -> Result<Value, String> {
        let tx_value = params
            .get("transaction")
            .ok_or("missing 'transaction' parameter")?;
        let tx: Transaction = serde_json::from_value(tx_value.clone())
            .map_err(|e| format!("malformed encoding: {e}"))?;
        let hash = self
            .node
            .submit_transaction(tx, None)
            .map_err(|e| e.to_string())?;
        Ok(json!({"tx_hash": hash}))
    }

    fn get_block(&self, params: &Value) -> Result<Value, String> {
        let block = if let Some(height) = params.get("height").and_then(Value::as_u64) {
            self.node.get_block_by_height(height)
        } else if let Some(hash) = params.get("hash").and_then(Value::as_str) {
            let hash = Hash::from_hex(hash).ok_or("invalid block hash")?;
            self.node.get_block_by_hash(&hash)
        } else {
            return Err("must specify 'height' or 'hash'".into());
        };
        let block = block.ok_or("block not found")?;
        Ok(serde_json::to_value(&*block).expect("blocks serialize"))
    }

    fn get_transaction(&self, params: &Value) -> Result<Value, String> {
        let hash = parse_hash(params, "tx_hash")?;
        let (tx, location) = self.node.get_transaction(&hash).ok_or("transaction not found")?;

        let mut result = json!({"transaction": tx, "confirmed": location.is_some()});
        if let Some(location) = location {
            result["block_hash"] = json!(location.block_hash);
            result["block_height"] = json!(location.height);
            result["index"] = json!(location.index);
            if let Some(proof) = self.node.merkle_proof(&hash) {
                result["proof"] = json!(proof.proof);
                result["root"] = json!(proof.root);
            }
        }
        Ok(result)
    }

    fn get_account(&self, params: &Value) -> Result<Value, String> {
        let pubkey = parse_pubkey(params)?;
        let account = self.node.get_account(&pubkey);
        Ok(json!({"balance": account.balance, "nonce": account.nonce}))
    }

    fn get_latest_block(&self) -> Result<Value, String> {
        Ok(serde_json::to_value(self.node.latest_header()).expect("headers serialize"))
    }

    fn get_mempool(&self) -> Result<Value, String> {
        Ok(json!({"transactions": self.node.mempool().hashes_by_fee()}))
    }

    fn get_merkle_proof(&self, params: &Value) -> Result<Value, String> {
        let hash = parse_hash(params, "tx_hash")?;
        let proof = self
            .node
            .merkle_proof(&hash)
            .ok_or("transaction not in any confirmed block")?;
        Ok(json!({
            "tx_hash": hash,
            "block_hash": proof.block_hash,
            "block_height": proof.height,
            "index": proof.index,
            "proof": proof.proof,
            "root": proof.root,
        }))
    }

    fn get_state_proof(&self, params: &Value) -> Result<Value, String> {
        let pubkey = parse_pubkey(params)?;
        let (leaf, root, proof) = self
            .node
            .state_proof(&pubkey)
            .ok_or("account not materialized")?;
        Ok(json!({
            "pubkey": pubkey,
            "leaf": leaf,
            "proof": proof,
            "root": root,
        }))
    }

    fn get_node_info(&self) -> Result<Value, String> {
        let (tip, height) = self.node.tip_info();
        Ok(json!({
            "height": height,
            "tip": tip,
            "mempool_size": self.node.mempool().len(),
        }))
    }
}

fn parse_hash(params: &Value, field: &str) -> Result<Hash, String> {
    params
        .get(field)
        .and_then(Value::as_str)
        .and_then(Hash::from_hex)
        .ok_or_else(|| format!("invalid or missing '{field}'"))
}

fn parse_pubkey(params: &Value) -> Result<PublicKey, String> {
    params
        .get("pubkey")
        .and_then(Value::as_str)
        .and_then(PublicKey::from_hex)
        .ok_or_else(|| "invalid or missing 'pubkey'".into())
}

fn error_response(id: Value, code: i64, message: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message},
    })
}

/// Reads HTTP headers plus a `Content-Length` body.
async fn read_http_body(stream: &mut TcpStream) -> Option<Vec<u8>> {
    let mut raw = Vec::new();
    let mut buf = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        raw.extend_from_slice(&buf[..n]);
        if let Some(pos) = find_header_end(&raw) {
            break pos;
        }
        if raw.len() > MAX_BODY_BYTES {
            return None;
        }
    };

    let headers = String::from_utf8_lossy(&raw[..header_end]);
    let content_length = headers
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);
    if content_length > MAX_BODY_BYTES {
        return None;
    }

    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);
    Some(body)
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn write_http_response(stream: &mut TcpStream, body: &Value) -> std::io::Result<()> {
    let body_bytes = serde_json::to_vec(body).expect("responses serialize");
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body_bytes.len()
    );
    stream.write_all(header.as_bytes()).await?;
    stream.write_all(&body_bytes).await?;
    stream.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::params::ChainParams;
    use crate::core::transaction::Post;
    use crate::miner::{build_template, solve};
    use crate::utils::test_utils::{key, GENESIS_KEY_SEED};

    fn dev_node() -> Arc<Node> {
        Node::open(ChainParams::dev(key(GENESIS_KEY_SEED).public_key()), None).unwrap()
    }

    fn mine_one(node: &Arc<Node>) {
        let mut block = build_template(node, key(GENESIS_KEY_SEED).public_key());
        assert!(solve(&mut block, u64::MAX));
        node.submit_block(block, None).unwrap();
    }

    async fn call(addr: SocketAddr, method: &str, params: Value) -> Value {
        let request = json!({"jsonrpc": "2.0", "id": 1, "method": method, "params": params});
        let body = serde_json::to_vec(&request).unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let header = format!(
            "POST / HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        stream.write_all(header.as_bytes()).await.unwrap();
        stream.write_all(&body).await.unwrap();

        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        let pos = find_header_end(&response).unwrap();
        serde_json::from_slice(&response[pos + 4..]).unwrap()
    }

    #[tokio::test]
    async fn node_info_and_latest_block() {
        let node = dev_node();
        mine_one(&node);
        let rpc = RpcServer::new(node.clone());
        let addr = rpc.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let info = call(addr, "get_node_info", json!({})).await;
        assert_eq!(info["result"]["height"], 1);

        let latest = call(addr, "get_latest_block", json!({})).await;
        assert_eq!(latest["result"]["height"], 1);
    }

    #[tokio::test]
    async fn account_and_block_queries() {
        let node = dev_node();
        mine_one(&node);
        let rpc = RpcServer::new(node.clone());
        let addr = rpc.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let miner = key(GENESIS_KEY_SEED).public_key();
        let account = call(addr, "get_account", json!({"pubkey": miner.to_string()})).await;
        assert_eq!(account["result"]["balance"], 100);
        assert_eq!(account["result"]["nonce"], 0);

        // Unknown accounts read as zero
        let nobody = call(
            addr,
            "get_account",
            json!({"pubkey": key(77).public_key().to_string()}),
        )
        .await;
        assert_eq!(nobody["result"]["balance"], 0);

        let by_height = call(addr, "get_block", json!({"height": 1})).await;
        let hash = by_height["result"]["header"]["height"].clone();
        assert_eq!(hash, 1);

        let missing = call(addr, "get_block", json!({"height": 99})).await;
        assert_eq!(missing["error"]["code"], -32000);
    }

    #[tokio::test]
    async fn submit_transaction_roundtrip() {
        let node = dev_node();
        mine_one(&node);
        let rpc = RpcServer::new(node.clone());
        let addr = rpc.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let post = Post::signed(&key(GENESIS_KEY_SEED), 0, 5_000, "via rpc", None, 1);
        let expected_hash = post.hash();

        let response = call(
            addr,
            "submit_transaction",
            json!({"transaction": serde_json::to_value(&post).unwrap()}),
        )
        .await;
        assert_eq!(
            response["result"]["tx_hash"],
            json!(expected_hash)
        );
        assert!(node.mempool().contains(&expected_hash));
    }

    #[tokio::test]
    async fn submit_rejects_oversized_body_with_limit_error() {
        let node = dev_node();
        mine_one(&node);
        let rpc = RpcServer::new(node.clone());
        let addr = rpc.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let post = Post::signed(&key(GENESIS_KEY_SEED), 0, 5_000, "z".repeat(301), None, 1);
        let response = call(
            addr,
            "submit_transaction",
            json!({"transaction": serde_json::to_value(&post).unwrap()}),
        )
        .await;
        assert_eq!(response["error"]["code"], -32000);
        let message = response["error"]["message"].as_str().unwrap();
        assert!(message.contains("limit exceeded"), "got: {message}");
        assert!(node.mempool().is_empty());
    }

    #[tokio::test]
    async fn merkle_proof_for_confirmed_transaction() {
        let node = dev_node();
        mine_one(&node);

        let post = Post::signed(&key(GENESIS_KEY_SEED), 0, 5_000, "prove me", None, 1);
        let hash = node.submit_transaction(post, None).unwrap();
        mine_one(&node);

        let rpc = RpcServer::new(node.clone());
        let addr = rpc.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let proof = call(addr, "get_merkle_proof", json!({"tx_hash": hash.to_string()})).await;
        assert_eq!(proof["result"]["block_height"], 2);
        assert!(proof["result"]["proof"].is_array());

        let tx = call(addr, "get_transaction", json!({"tx_hash": hash.to_string()})).await;
        assert_eq!(tx["result"]["confirmed"], true);
        assert_eq!(tx["result"]["block_height"], 2);
    }

    #[tokio::test]
    async fn state_proof_for_materialized_account() {
        let node = dev_node();
        mine_one(&node);
        let rpc = RpcServer::new(node.clone());
        let addr = rpc.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let miner = key(GENESIS_KEY_SEED).public_key();
        let proof = call(addr, "get_state_proof", json!({"pubkey": miner.to_string()})).await;
        assert!(proof["result"]["leaf"].is_string());
        assert!(proof["result"]["proof"].is_array());
    }

    #[tokio::test]
    async fn unknown_method_and_parse_errors() {
        let node = dev_node();
        let rpc = RpcServer::new(node);
        let addr = rpc.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let response = call(addr, "no_such_method", json!({})).await;
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn mempool_listing_orders_by_fee() {
        let node = dev_node();
        mine_one(&node);

        let cheap = Post::signed(&key(GENESIS_KEY_SEED), 0, 5_000, "cheap", None, 1);
        let rich = Post::signed(&key(GENESIS_KEY_SEED), 1, 5_000, "rich", None, 9);
        node.submit_transaction(cheap.clone(), None).unwrap();
        node.submit_transaction(rich.clone(), None).unwrap();

        let rpc = RpcServer::new(node);
        let addr = rpc.start("127.0.0.1:0".parse().unwrap()).await.unwrap();

        let listing = call(addr, "get_mempool", json!({})).await;
        let txs = listing["result"]["transactions"].as_array().unwrap();
        assert_eq!(txs.len(), 2);
        // Note: rich has a later nonce; fee ordering is what the RPC shows
        assert_eq!(txs[0], json!(rich.hash()));
        assert_eq!(txs[1], json!(cheap.hash()));
    }
}
