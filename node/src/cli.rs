//! # CLI Interface
//!
//! Command-line arguments for `arbor-node`, via `clap` derive. Every flag
//! that matters in a deployment also reads an `ARBOR_*` environment variable.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use arbor_protocol::config::{
    DEFAULT_DATA_DIR, DEFAULT_GENESIS_PATH, DEFAULT_METRICS_PORT, DEFAULT_RPC_PORT,
};

use crate::logging::LogFormat;

/// Arbor chain-following node.
///
/// Keeps a block tree of everything it has seen, picks the best chain,
/// and serves it over HTTP.
#[derive(Parser, Debug)]
#[command(
    name = "arbor-node",
    about = "Arbor chain-following node",
    version,
    propagate_version = true
)]
pub struct ArborNodeCli {
    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, global = true, env = "ARBOR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(
        long,
        global = true,
        env = "ARBOR_LOG_FORMAT",
        value_enum,
        default_value_t = LogFormatArg::Pretty
    )]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the node.
    Run(RunArgs),
    /// Load a genesis file into a fresh data directory.
    Init(InitArgs),
    /// Query a running node over HTTP.
    Status(StatusArgs),
    /// Print version information and exit.
    Version,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(arg: LogFormatArg) -> Self {
        match arg {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Directory holding the block database.
    #[arg(long, short = 'd', env = "ARBOR_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Genesis file used when the data directory is empty.
    ///
    /// Ignored once the database holds a genesis block.
    #[arg(long, short = 'g', env = "ARBOR_GENESIS")]
    pub genesis: Option<PathBuf>,

    /// Port for the HTTP API.
    #[arg(long, env = "ARBOR_RPC_PORT", default_value_t = DEFAULT_RPC_PORT)]
    pub rpc_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "ARBOR_METRICS_PORT", default_value_t = DEFAULT_METRICS_PORT)]
    pub metrics_port: u16,
}

#[derive(Parser, Debug)]
pub struct InitArgs {
    /// Directory to initialize.
    #[arg(long, short = 'd', env = "ARBOR_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// Chain spec JSON to load.
    #[arg(long, short = 'g', env = "ARBOR_GENESIS", default_value = DEFAULT_GENESIS_PATH)]
    pub genesis: PathBuf,
}

#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// HTTP endpoint of the running node.
    #[arg(long, env = "ARBOR_RPC_URL", default_value = "http://127.0.0.1:9933")]
    pub rpc_url: String,
}
