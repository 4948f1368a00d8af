// Copyright (c) 2026 Arbor Contributors. MIT License.
// See LICENSE for details.

//! # Arbor Node
//!
//! Entry point for the `arbor-node` binary. Parses CLI arguments, initializes
//! logging and metrics, restores the block tree from disk, starts the chain
//! service and serves the HTTP API.
//!
//! The binary supports four subcommands:
//!
//! - `run`     — start the node
//! - `init`    — load a genesis file into a data directory
//! - `status`  — query a running node's status endpoint
//! - `version` — print build version information

mod api;
mod cli;
mod logging;
mod metrics;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{broadcast, mpsc, watch};

use arbor_protocol::config::{
    EVENT_CHANNEL_CAPACITY, MESSAGE_CHANNEL_CAPACITY, MIN_SUPPORTED_VERSION, PROTOCOL_VERSION,
    ROLE_FULL,
};
use arbor_protocol::genesis::{self, Genesis};
use arbor_protocol::network::{
    restore_tree, ChainService, NetworkMessage, PeerManager, ServiceConfig, StatusMessage,
};
use arbor_protocol::storage::ChainDb;

use cli::{ArborNodeCli, Commands};
use metrics::NodeMetrics;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = ArborNodeCli::parse();
    logging::init_logging(&cli.log_level, cli.log_format.into());

    match cli.command {
        Commands::Run(args) => run_node(args).await,
        Commands::Init(args) => init_node(args),
        Commands::Status(args) => query_status(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

fn open_db(data_dir: &Path) -> Result<ChainDb> {
    let db_path = data_dir.join("db");
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("failed to create database directory: {}", db_path.display()))?;
    let db = ChainDb::open(&db_path)
        .with_context(|| format!("failed to open database at {}", db_path.display()))?;
    tracing::info!(path = %db_path.display(), "database opened");
    Ok(db)
}

/// Starts the node: chain service, API server and metrics endpoint.
async fn run_node(args: cli::RunArgs) -> Result<()> {
    tracing::info!(
        rpc_port = args.rpc_port,
        metrics_port = args.metrics_port,
        data_dir = %args.data_dir.display(),
        "starting arbor-node"
    );

    // --- Persistent storage ---
    let db = open_db(&args.data_dir)?;
    if db.genesis_hash()?.is_none() {
        let path = args
            .genesis
            .as_deref()
            .context("data directory is empty; pass --genesis or run `arbor-node init`")?;
        let spec = genesis::load_genesis(path)?;
        let block = genesis::initialize_genesis(&db, &spec)?;
        tracing::info!(chain = %spec.name, hash = %block.hash(), "genesis written");
    }
    if let Some(raw) = db.genesis_data()? {
        if let Ok(spec) = serde_json::from_slice::<Genesis>(&raw) {
            tracing::info!(
                chain = %spec.name,
                id = %spec.id,
                bootnodes = spec.bootnodes.len(),
                "chain spec loaded"
            );
        }
    }
    let db = Arc::new(db);

    // --- Block tree ---
    let tree = restore_tree(&db).context("failed to restore block tree")?;
    let genesis_hash = db
        .genesis_hash()?
        .context("genesis hash missing after initialization")?;

    // --- Peers ---
    let best = tree.deepest_leaf();
    let (peer_manager, peers) = PeerManager::new(StatusMessage {
        protocol_version: PROTOCOL_VERSION,
        min_supported_version: MIN_SUPPORTED_VERSION,
        roles: ROLE_FULL,
        best_block_number: best.number(),
        best_block_hash: best.hash(),
        genesis_hash,
    });
    let peer_task = tokio::spawn(peer_manager.run());

    // --- Chain service ---
    // No transport is attached yet: the inbound sender is held open so the
    // service keeps running, and outbound traffic is logged and dropped.
    let (inbound_tx, inbound_rx) = mpsc::channel::<NetworkMessage>(MESSAGE_CHANNEL_CAPACITY);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<NetworkMessage>(MESSAGE_CHANNEL_CAPACITY);
    let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
    let service = Arc::new(
        ChainService::new(
            ServiceConfig::default(),
            tree,
            Arc::clone(&db),
            peers,
            outbound_tx,
            event_tx,
        )
        .with_genesis_hash(genesis_hash),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let service_task = tokio::spawn(Arc::clone(&service).run(inbound_rx, shutdown_rx));

    let outbound_task = tokio::spawn(async move {
        while let Some(msg) = outbound_rx.recv().await {
            tracing::debug!(
                peer = %msg.peer,
                kind = ?msg.message.message_type(),
                "no transport attached, dropping outbound message"
            );
        }
    });

    // --- Metrics ---
    let node_metrics = Arc::new(NodeMetrics::new().context("failed to register metrics")?);
    node_metrics.sample(&service);
    let metrics_task = {
        let metrics = Arc::clone(&node_metrics);
        let service = Arc::clone(&service);
        let mut events = service.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => metrics.record(&event, &service),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "metrics fell behind chain events");
                        metrics.sample(&service);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    // --- Application state ---
    let app_state = api::AppState {
        version: format!("{} (protocol {})", env!("CARGO_PKG_VERSION"), PROTOCOL_VERSION),
        service: Arc::clone(&service),
    };

    // --- API server ---
    let api_router = api::create_router(app_state);
    let api_addr = format!("0.0.0.0:{}", args.rpc_port);
    let api_listener = tokio::net::TcpListener::bind(&api_addr)
        .await
        .with_context(|| format!("failed to bind RPC listener on {}", api_addr))?;
    tracing::info!("API server listening on {}", api_addr);

    // --- Metrics server ---
    let metrics_router = axum::Router::new()
        .route("/metrics", axum::routing::get(metrics::metrics_handler))
        .with_state(Arc::clone(&node_metrics));
    let metrics_addr = format!("0.0.0.0:{}", args.metrics_port);
    let metrics_listener = tokio::net::TcpListener::bind(&metrics_addr)
        .await
        .with_context(|| format!("failed to bind metrics listener on {}", metrics_addr))?;
    tracing::info!("Metrics server listening on {}", metrics_addr);

    // --- Serve ---
    tokio::select! {
        res = axum::serve(api_listener, api_router) => {
            if let Err(e) = res {
                tracing::error!("API server error: {}", e);
            }
        }
        res = axum::serve(metrics_listener, metrics_router) => {
            if let Err(e) = res {
                tracing::error!("Metrics server error: {}", e);
            }
        }
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    if let Err(e) = service_task.await {
        tracing::error!("chain service task failed: {}", e);
    }
    drop(inbound_tx);
    metrics_task.abort();
    outbound_task.abort();
    peer_task.abort();

    let best = service.tree().deepest_leaf();
    tracing::info!(best = best.number(), hash = %best.hash(), "arbor-node stopped");
    Ok(())
}

/// Loads a genesis file into a data directory.
fn init_node(args: cli::InitArgs) -> Result<()> {
    let data_dir = &args.data_dir;
    tracing::info!(
        data_dir = %data_dir.display(),
        genesis = %args.genesis.display(),
        "initializing node"
    );

    let spec = genesis::load_genesis(&args.genesis)?;
    let db = open_db(data_dir)?;
    let block = genesis::initialize_genesis(&db, &spec)?;
    db.flush().context("failed to flush database")?;

    println!("Node initialized successfully.");
    println!("  Data directory : {}", data_dir.display());
    println!("  Chain          : {} ({})", spec.name, spec.id);
    println!("  Protocol id    : {}", spec.protocol_id);
    println!("  Genesis hash   : {}", block.hash());
    println!("  Bootnodes      : {}", spec.bootnodes.len());

    Ok(())
}

/// Queries a running node's status endpoint and prints the result.
async fn query_status(args: cli::StatusArgs) -> Result<()> {
    let url = format!("{}/status", args.rpc_url.trim_end_matches('/'));
    let body = http_get(&url).await?;
    println!("{}", body);
    Ok(())
}

/// Minimal HTTP/1.1 GET over a raw tokio TCP stream.
async fn http_get(url: &str) -> Result<String> {
    let parsed: url::Url = url
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid URL: {}", e))?;

    let host = parsed.host_str();
    let addr = format!("{}:{}", host, parsed.port().unwrap_or(80));
    let mut stream = tokio::net::TcpStream::connect(&addr)
        .await
        .with_context(|| format!("failed to connect to {}", addr))?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
        parsed.path(),
        host,
    );

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    stream.write_all(request.as_bytes()).await?;
    stream.shutdown().await?;

    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).await?;
    let response = String::from_utf8_lossy(&buf);

    // Everything after the first blank line is the body.
    let body = response
        .split_once("\r\n\r\n")
        .map(|(_, b)| b.to_string())
        .unwrap_or_else(|| response.to_string());

    Ok(body)
}

/// Prints version information to stdout.
fn print_version() {
    println!("arbor-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol   {}", PROTOCOL_VERSION);
    println!("rustc      {}", rustc_version());
}

fn rustc_version() -> &'static str {
    option_env!("RUSTC_VERSION").unwrap_or("unknown")
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Just enough URL parsing to pull out host, port and path.
mod url {
    #[derive(Debug)]
    pub struct Url {
        host: String,
        port: Option<u16>,
        path: String,
    }

    impl Url {
        pub fn host_str(&self) -> &str {
            &self.host
        }

        pub fn port(&self) -> Option<u16> {
            self.port
        }

        pub fn path(&self) -> &str {
            &self.path
        }
    }

    impl std::str::FromStr for Url {
        type Err = String;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            let rest = s.strip_prefix("http://").unwrap_or(s);
            if rest.starts_with("https://") {
                return Err("https is not supported".into());
            }

            let (authority, path) = match rest.find('/') {
                Some(i) => (&rest[..i], &rest[i..]),
                None => (rest, "/"),
            };
            if authority.is_empty() {
                return Err("missing host".into());
            }

            let (host, port) = match authority.rfind(':') {
                Some(i) => {
                    let p = authority[i + 1..]
                        .parse::<u16>()
                        .map_err(|e| format!("bad port: {}", e))?;
                    (authority[..i].to_string(), Some(p))
                }
                None => (authority.to_string(), None),
            };

            Ok(Url {
                host,
                port,
                path: path.to_string(),
            })
        }
    }

}
