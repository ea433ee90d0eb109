//! agora node binary.
//!
//! # Usage
//! ```text
//! agora [OPTIONS]
//! ```
//!
//! # Options
//! - `--data-dir <path>`: Node data directory (default `./agora-data`)
//! - `--listen <addr>`: P2P listen address (default `0.0.0.0:9333`)
//! - `--rpc <addr>`: RPC listen address (default `127.0.0.1:9332`)
//! - `--peer <addr>`: Bootstrap peer to dial on startup (repeatable)
//! - `--mine`: Enable mining with this node's key
//!
//! # Identity
//! The node keypair is stored encrypted at `<data-dir>/node.key`. The
//! passphrase is read from `AGORA_PASSPHRASE`, or prompted if not set.

use agora::core::params::{ChainParams, DEFAULT_P2P_PORT, DEFAULT_RPC_PORT};
use agora::crypto::key_pair::load_or_generate_key;
use agora::miner::Miner;
use agora::network::rpc::RpcServer;
use agora::network::server::P2pServer;
use agora::node::Node;
use agora::storage::disk::DiskStore;
use agora::{error, info};
use rpassword::prompt_password;
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use tokio::signal;
use tokio::sync::watch;
use zeroize::Zeroizing;

struct Args {
    data_dir: PathBuf,
    listen: SocketAddr,
    rpc: SocketAddr,
    peers: Vec<SocketAddr>,
    mine: bool,
}

fn print_usage(program: &str) {
    eprintln!(
        "Usage: {program} [--data-dir <path>] [--listen <addr>] [--rpc <addr>] \
         [--peer <addr>]... [--mine]"
    );
}

fn parse_args() -> Args {
    let argv: Vec<String> = env::args().collect();
    let mut args = Args {
        data_dir: PathBuf::from("./agora-data"),
        listen: SocketAddr::from(([0, 0, 0, 0], DEFAULT_P2P_PORT)),
        rpc: SocketAddr::from(([127, 0, 0, 1], DEFAULT_RPC_PORT)),
        peers: Vec::new(),
        mine: false,
    };

    let mut i = 1;
    while i < argv.len() {
        let take_value = |i: &mut usize| -> String {
            *i += 1;
            if *i >= argv.len() {
                eprintln!("{} requires an argument", argv[*i - 1]);
                process::exit(1);
            }
            argv[*i].clone()
        };

        match argv[i].as_str() {
            "--help" | "-h" => {
                print_usage(&argv[0]);
                process::exit(0);
            }
            "--data-dir" => args.data_dir = PathBuf::from(take_value(&mut i)),
            "--listen" => {
                args.listen = parse_addr(&take_value(&mut i));
            }
            "--rpc" => {
                args.rpc = parse_addr(&take_value(&mut i));
            }
            "--peer" => {
                args.peers.push(parse_addr(&take_value(&mut i)));
            }
            "--mine" => args.mine = true,
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage(&argv[0]);
                process::exit(1);
            }
        }
        i += 1;
    }
    args
}

fn parse_addr(value: &str) -> SocketAddr {
    match value.parse() {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!("Invalid address: {value}");
            process::exit(1);
        }
    }
}

fn read_passphrase() -> Zeroizing<Vec<u8>> {
    if let Ok(passphrase) = env::var("AGORA_PASSPHRASE") {
        return Zeroizing::new(passphrase.into_bytes());
    }
    match prompt_password("Node key passphrase: ") {
        Ok(passphrase) => Zeroizing::new(passphrase.into_bytes()),
        Err(e) => {
            eprintln!("Could not read passphrase: {e}");
            process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let args = parse_args();

    let passphrase = read_passphrase();
    let key = match load_or_generate_key(&args.data_dir.join("node.key"), &passphrase) {
        Ok(key) => key,
        Err(e) => {
            error!("failed to load node key: {e}");
            process::exit(1);
        }
    };
    info!("node identity: {}", key.public_key());

    let disk = match DiskStore::open(&args.data_dir) {
        Ok(disk) => disk,
        Err(e) => {
            error!("failed to open data directory: {e}");
            process::exit(1);
        }
    };

    let node = match Node::open(ChainParams::mainnet(), Some(disk)) {
        Ok(node) => node,
        Err(e) => {
            error!("failed to open chain: {e}");
            process::exit(1);
        }
    };
    let (tip, height) = node.tip_info();
    info!("chain ready: height={height} tip={tip}");

    let p2p = P2pServer::new(node.clone());
    if let Err(e) = p2p.start(args.listen).await {
        error!("failed to start p2p server: {e}");
        process::exit(1);
    }

    let rpc = RpcServer::new(node.clone());
    if let Err(e) = rpc.start(args.rpc).await {
        error!("failed to start rpc server: {e}");
        process::exit(1);
    }

    for peer in &args.peers {
        let p2p = p2p.clone();
        let peer = *peer;
        tokio::spawn(async move {
            if !p2p.connect(peer).await {
                agora::warn!("could not connect to bootstrap peer {peer}");
            }
        });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut miner_task = None;
    if args.mine {
        let miner = Miner::new(node.clone(), key.public_key());
        let p2p = p2p.clone();
        miner_task = Some(tokio::spawn(async move {
            // Reach the network tip before producing blocks of our own
            while p2p.is_syncing() {
                tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            }
            miner.run(shutdown_rx).await;
        }));
    }

    if let Err(e) = signal::ctrl_c().await {
        error!("failed to wait for shutdown signal: {e}");
    }
    info!("shutting down");

    let _ = shutdown_tx.send(true);
    if let Some(task) = miner_task {
        let _ = task.await;
    }
}
