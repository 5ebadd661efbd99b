#![allow(dead_code)]

pub mod upstream;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use cachet::cli::LogFormat;
use cachet::proxy::cache::{Cache, DiskCache, EvictionConfig, NullCache};
use cachet::proxy::{self, AppContext};
use cachet::settings::Settings;

pub fn test_settings(cache_dir: Option<PathBuf>) -> Settings {
    Settings {
        listen: "127.0.0.1:0".parse().expect("static addr"),
        name: None,
        upstream_proxy: None,
        cache_dir,
        shared: true,
        log: LogFormat::Text,
        dns_resolve_timeout: 2,
        upstream_connect_timeout: 2,
        response_header_timeout: 5,
        max_request_header_size: 32 * 1024,
        max_response_header_size: 32 * 1024,
        cache_low_water: 48 * 1024 * 1024,
        cache_high_water: 49 * 1024 * 1024,
        cache_prune_chunk_size: 1000,
    }
}

pub struct TestProxy {
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TestProxy {
    pub async fn spawn(settings: Settings) -> Result<Self> {
        let settings = Arc::new(settings);
        let cache: Arc<dyn Cache> = match &settings.cache_dir {
            Some(dir) => Arc::new(DiskCache::open(
                dir,
                EvictionConfig {
                    low_water: settings.cache_low_water,
                    high_water: settings.cache_high_water,
                    prune_chunk_size: settings.cache_prune_chunk_size,
                },
            )?),
            None => Arc::new(NullCache),
        };
        let app = AppContext::new(settings.clone(), cache)?;

        let listener = proxy::listener::bind(settings.listen).await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = proxy::listener::serve(listener, app).await;
        });
        Ok(Self { addr, handle })
    }
}

impl Drop for TestProxy {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A parsed HTTP/1.1 response as read off the wire.
#[derive(Debug)]
pub struct RawResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RawResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).to_string()
    }
}

/// Sends one raw request over a fresh connection and reads until the server
/// closes. Requests should carry `Connection: close`.
pub async fn roundtrip(proxy: SocketAddr, request: &str) -> Result<RawResponse> {
    let mut stream = TcpStream::connect(proxy)
        .await
        .context("connect to proxy")?;
    stream.write_all(request.as_bytes()).await?;

    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).await?;
    parse_response(&raw)
}

pub fn parse_response(raw: &[u8]) -> Result<RawResponse> {
    let header_end = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("response has no header terminator"))?;
    let head = std::str::from_utf8(&raw[..header_end]).context("response head not UTF-8")?;
    let mut lines = head.split("\r\n");

    let status_line = lines.next().ok_or_else(|| anyhow!("empty response"))?;
    let status: u16 = status_line
        .split(' ')
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| anyhow!("malformed status line '{status_line}'"))?;

    let mut headers = Vec::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    let mut body = raw[header_end + 4..].to_vec();
    // Bodies in tests are Content-Length framed; trim in case the server
    // sent fewer bytes than the connection carried.
    if let Some(length) = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.parse::<usize>().ok())
        && body.len() > length
    {
        body.truncate(length);
    }

    Ok(RawResponse {
        status,
        headers,
        body,
    })
}

pub fn get_request(host_port: &str, path: &str, extra_headers: &[&str]) -> String {
    let mut request = format!("GET http://{host_port}{path} HTTP/1.1\r\nHost: {host_port}\r\n");
    for header in extra_headers {
        request.push_str(header);
        request.push_str("\r\n");
    }
    request.push_str("Connection: close\r\n\r\n");
    request
}
