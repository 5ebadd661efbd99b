use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Parser)]
#[command(name = "cachet", about = "Cachet caching forward proxy")]
pub struct Cli {
    /// Path to the runtime configuration file (defaults to ./cachet.toml if present).
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// The address to listen on, in the form host:port.
    #[arg(long)]
    pub listen_addr: Option<SocketAddr>,

    /// An upstream proxy to forward requests to instead of contacting origins directly.
    #[arg(long)]
    pub upstream_proxy: Option<String>,

    /// Directory for the persistent cache. Caching is disabled when absent.
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum)]
    pub log: Option<LogFormat>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Text,
}
