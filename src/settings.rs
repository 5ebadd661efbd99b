use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Result, ensure};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::cli::{Cli, LogFormat};

fn default_listen() -> SocketAddr {
    "0.0.0.0:8080".parse().expect("static listen address")
}

fn default_shared() -> bool {
    true
}

fn default_dns_resolve_timeout() -> u64 {
    5
}

fn default_upstream_connect_timeout() -> u64 {
    10
}

fn default_response_header_timeout() -> u64 {
    10
}

fn default_max_request_header_size() -> usize {
    32 * 1024
}

fn default_max_response_header_size() -> usize {
    32 * 1024
}

fn default_cache_low_water() -> i64 {
    48 * 1024 * 1024
}

fn default_cache_high_water() -> i64 {
    49 * 1024 * 1024
}

fn default_cache_prune_chunk_size() -> usize {
    1000
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// The proxy's own authority. Requests addressed to this host are routed
    /// to the admin pages; the name is also used as the Via pseudonym.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub upstream_proxy: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default = "default_shared")]
    pub shared: bool,
    #[serde(default = "default_log_format")]
    pub log: LogFormat,
    #[serde(default = "default_dns_resolve_timeout")]
    pub dns_resolve_timeout: u64,
    #[serde(default = "default_upstream_connect_timeout")]
    pub upstream_connect_timeout: u64,
    #[serde(default = "default_response_header_timeout")]
    pub response_header_timeout: u64,
    #[serde(default = "default_max_request_header_size")]
    pub max_request_header_size: usize,
    #[serde(default = "default_max_response_header_size")]
    pub max_response_header_size: usize,
    #[serde(default = "default_cache_low_water")]
    pub cache_low_water: i64,
    #[serde(default = "default_cache_high_water")]
    pub cache_high_water: i64,
    #[serde(default = "default_cache_prune_chunk_size")]
    pub cache_prune_chunk_size: usize,
}

impl Settings {
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut builder = Config::builder();

        if let Some(config_path) = resolve_config_path(cli) {
            builder = builder.add_source(File::from(config_path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("CACHET")
                .separator("__")
                .try_parsing(true),
        );

        let cfg = builder.build().map_err(to_anyhow)?;
        let mut settings: Settings = cfg.try_deserialize().map_err(to_anyhow)?;
        settings.apply_cli(cli);
        settings.validate()?;
        Ok(settings)
    }

    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(listen) = cli.listen_addr {
            self.listen = listen;
        }
        if let Some(upstream) = &cli.upstream_proxy {
            self.upstream_proxy = Some(upstream.clone());
        }
        if let Some(cache_dir) = &cli.cache_dir {
            self.cache_dir = Some(cache_dir.clone());
        }
        if let Some(log) = cli.log {
            self.log = log;
        }
    }

    fn validate(&self) -> Result<()> {
        ensure!(
            self.cache_low_water > 0,
            "cache_low_water must be greater than zero"
        );
        ensure!(
            self.cache_low_water < self.cache_high_water,
            "cache_low_water must be below cache_high_water"
        );
        ensure!(
            self.cache_prune_chunk_size > 0,
            "cache_prune_chunk_size must be greater than zero"
        );
        ensure!(
            self.max_request_header_size > 0 && self.max_response_header_size > 0,
            "header size limits must be greater than zero"
        );
        if let Some(upstream) = &self.upstream_proxy {
            ensure!(!upstream.trim().is_empty(), "upstream_proxy must not be empty");
        }
        Ok(())
    }

    /// The proxy's pseudonym for Via headers and admin routing.
    pub fn proxy_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.listen.to_string())
    }

    pub fn dns_resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_resolve_timeout)
    }

    pub fn upstream_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_connect_timeout)
    }

    pub fn response_header_timeout(&self) -> Duration {
        Duration::from_secs(self.response_header_timeout)
    }
}

fn resolve_config_path(cli: &Cli) -> Option<PathBuf> {
    if let Some(path) = &cli.config {
        return Some(path.clone());
    }
    let fallback = Path::new("cachet.toml");
    if fallback.exists() {
        return Some(fallback.to_path_buf());
    }
    None
}

fn to_anyhow(err: ConfigError) -> anyhow::Error {
    anyhow::anyhow!(err)
}
