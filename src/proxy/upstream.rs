use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, anyhow, bail};
use http::{HeaderMap, Method, StatusCode};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::settings::Settings;
use crate::util::timeout_with_context;

use super::codec::{
    BodyPlan, BodyReader, encode_request_head, read_response_head, response_body_plan,
};

const DEFAULT_HTTP_PORT: u16 = 80;

/// The outbound leg of one request, ready to stream its body.
pub(crate) struct UpstreamResponse {
    pub status: StatusCode,
    pub version: String,
    pub headers: HeaderMap,
    pub request_time: SystemTime,
    pub response_time: SystemTime,
    reader: BufReader<TcpStream>,
    body: BodyReader,
}

impl UpstreamResponse {
    /// Reads the next slice of the response body; zero means end of body.
    pub(crate) async fn read_body(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.body.read(&mut self.reader, buf).await
    }

    pub(crate) fn response_delay(&self) -> Duration {
        self.response_time
            .duration_since(self.request_time)
            .unwrap_or(Duration::ZERO)
    }
}

/// Everything the pipeline needs to send one upstream request.
pub(crate) struct UpstreamRequest<'a> {
    pub method: &'a Method,
    pub host: &'a str,
    pub port: Option<u16>,
    pub path: &'a str,
    /// The absolute-form target as the client sent it; forwarded verbatim
    /// when an upstream proxy is configured.
    pub raw_target: &'a str,
    pub headers: HeaderMap,
    pub body: Option<UpstreamRequestBody<'a>>,
}

/// A client request body to relay upstream.
pub(crate) struct UpstreamRequestBody<'a> {
    pub reader: &'a mut BufReader<TcpStream>,
    pub body: BodyReader,
    pub plan: BodyPlan,
}

/// Plain HTTP/1.1 transport to origins, optionally via a next-hop proxy.
/// One connection per request; TLS never terminates here (HTTPS rides the
/// CONNECT tunnel).
pub(crate) struct UpstreamTransport {
    next_proxy: Option<String>,
    dns_resolve_timeout: Duration,
    connect_timeout: Duration,
    response_header_timeout: Duration,
    max_response_header_size: usize,
}

impl UpstreamTransport {
    pub(crate) fn new(settings: &Settings) -> Result<Self> {
        let next_proxy = match &settings.upstream_proxy {
            Some(raw) => Some(normalize_proxy_address(raw)?),
            None => None,
        };
        Ok(Self {
            next_proxy,
            dns_resolve_timeout: settings.dns_resolve_timeout(),
            connect_timeout: settings.upstream_connect_timeout(),
            response_header_timeout: settings.response_header_timeout(),
            max_response_header_size: settings.max_response_header_size,
        })
    }

    pub(crate) async fn round_trip(
        &self,
        mut request: UpstreamRequest<'_>,
    ) -> Result<UpstreamResponse> {
        let port = request.port.unwrap_or(DEFAULT_HTTP_PORT);
        let (connect_host, connect_port, target) = match &self.next_proxy {
            Some(proxy) => {
                let (host, port) = split_host_port(proxy)?;
                (host.to_string(), port, request.raw_target.to_string())
            }
            None => (
                request.host.to_string(),
                port,
                request.path.to_string(),
            ),
        };

        let stream = self.connect(&connect_host, connect_port).await?;
        let mut reader = BufReader::new(stream);

        set_host_header(&mut request.headers, request.host, request.port);
        let head = encode_request_head(request.method, &target, &request.headers);

        let request_time = SystemTime::now();
        reader
            .get_mut()
            .write_all(&head)
            .await
            .context("failed to send request to upstream")?;

        if let Some(body) = request.body.as_mut() {
            relay_request_body(reader.get_mut(), body)
                .await
                .context("failed to relay request body to upstream")?;
        }
        reader
            .get_mut()
            .flush()
            .await
            .context("failed to flush request to upstream")?;

        let peer = reader
            .get_ref()
            .peer_addr()
            .unwrap_or_else(|_| "0.0.0.0:0".parse().expect("static addr"));
        let head = self.read_final_head(&mut reader, peer).await?;
        let response_time = SystemTime::now();

        let plan = response_body_plan(request.method, head.status, &head.headers);
        Ok(UpstreamResponse {
            status: head.status,
            version: head.version,
            headers: head.headers,
            request_time,
            response_time,
            reader,
            body: BodyReader::new(plan),
        })
    }

    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let addresses: Vec<SocketAddr> = timeout_with_context(
            self.dns_resolve_timeout,
            tokio::net::lookup_host((host, port)),
            format!("resolving upstream host '{host}'"),
        )
        .await?
        .collect();
        if addresses.is_empty() {
            bail!("upstream host '{host}' did not resolve to any address");
        }

        let mut last_error = None;
        for address in &addresses {
            match timeout_with_context(
                self.connect_timeout,
                TcpStream::connect(address),
                format!("connecting to upstream {address}"),
            )
            .await
            {
                Ok(stream) => {
                    stream.set_nodelay(true).ok();
                    return Ok(stream);
                }
                Err(err) => {
                    debug!(error = %err, address = %address, "upstream connect failed");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| anyhow!("no upstream address to connect to")))
    }

    /// Reads past interim 1xx responses to the final response head.
    async fn read_final_head(
        &self,
        reader: &mut BufReader<TcpStream>,
        peer: SocketAddr,
    ) -> Result<super::codec::ResponseHead> {
        loop {
            let head = read_response_head(
                reader,
                self.response_header_timeout,
                peer,
                self.max_response_header_size,
            )
            .await?;
            if head.status.is_informational() {
                continue;
            }
            return Ok(head);
        }
    }
}

async fn relay_request_body(
    upstream: &mut TcpStream,
    body: &mut UpstreamRequestBody<'_>,
) -> std::io::Result<()> {
    let mut buf = [0u8; 32 * 1024];
    let chunked = body.plan == BodyPlan::Chunked;
    loop {
        let n = body.body.read(body.reader, &mut buf).await?;
        if n == 0 {
            break;
        }
        if chunked {
            upstream
                .write_all(format!("{n:x}\r\n").as_bytes())
                .await?;
            upstream.write_all(&buf[..n]).await?;
            upstream.write_all(b"\r\n").await?;
        } else {
            upstream.write_all(&buf[..n]).await?;
        }
    }
    if chunked {
        upstream.write_all(b"0\r\n\r\n").await?;
    }
    Ok(())
}

fn set_host_header(headers: &mut HeaderMap, host: &str, port: Option<u16>) {
    let value = match port {
        Some(port) if port != DEFAULT_HTTP_PORT => format!("{host}:{port}"),
        _ => host.to_string(),
    };
    if let Ok(value) = http::HeaderValue::from_str(&value) {
        headers.insert(http::header::HOST, value);
    }
}

fn normalize_proxy_address(raw: &str) -> Result<String> {
    let trimmed = raw.trim();
    let without_scheme = trimmed.strip_prefix("http://").unwrap_or(trimmed);
    let without_slash = without_scheme.trim_end_matches('/');
    if without_slash.is_empty() || without_slash.contains("://") {
        bail!("invalid upstream proxy address '{raw}'");
    }
    Ok(without_slash.to_string())
}

fn split_host_port(address: &str) -> Result<(&str, u16)> {
    match address.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid upstream proxy port in '{address}'"))?;
            Ok((host, port))
        }
        None => Ok((address, DEFAULT_HTTP_PORT)),
    }
}
