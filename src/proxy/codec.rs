use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail, ensure};
use http::{HeaderMap, Method, StatusCode};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::util::timeout_with_context;

const MAX_LINE_LENGTH: usize = 16 * 1024;

pub(crate) async fn read_line_with_timeout<S>(
    reader: &mut BufReader<S>,
    buf: &mut String,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_len: usize,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    ensure!(max_len > 0, "line length limit must be greater than zero");
    buf.clear();
    let mut collected = Vec::new();

    loop {
        let available = timeout_with_context(
            timeout_dur,
            reader.fill_buf(),
            format!("reading line from {peer}"),
        )
        .await?;

        if available.is_empty() {
            if collected.is_empty() {
                return Ok(0);
            }
            bail!("connection closed while reading line from {peer}");
        }

        let newline_pos = available.iter().position(|byte| *byte == b'\n');
        let consume = newline_pos.map(|idx| idx + 1).unwrap_or(available.len());

        if collected
            .len()
            .checked_add(consume)
            .ok_or_else(|| anyhow!("line length overflow for {peer}"))?
            > max_len
        {
            bail!("line from {peer} exceeds configured limit of {max_len} bytes");
        }

        collected.extend_from_slice(&available[..consume]);
        reader.consume(consume);

        if newline_pos.is_some() {
            break;
        }
    }

    let string = String::from_utf8(collected)
        .map_err(|_| anyhow!("line from {peer} contained invalid bytes"))?;
    let len = string.len();
    *buf = string;
    Ok(len)
}

/// The target of a proxied request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum RequestTarget {
    /// Origin-form (`/path`); only the proxy's own admin pages use this.
    Origin(String),
    /// Absolute-form as sent to a forward proxy.
    Absolute {
        host: String,
        port: Option<u16>,
        path: String,
        /// The target exactly as the client sent it; the cache key uses
        /// these bytes so equal requests collide reliably.
        raw: String,
    },
    /// Authority-form for CONNECT.
    Authority { host: String, port: u16 },
}

#[derive(Debug)]
pub(crate) struct RequestHead {
    pub method: Method,
    pub target: RequestTarget,
    pub version: String,
    pub headers: HeaderMap,
}

impl RequestHead {
    pub(crate) fn wants_close(&self) -> bool {
        connection_has_token(&self.headers, "close")
    }
}

#[derive(Debug)]
pub(crate) struct ResponseHead {
    pub version: String,
    pub status: StatusCode,
    pub headers: HeaderMap,
}

pub(crate) fn connection_has_token(headers: &HeaderMap, token: &str) -> bool {
    headers.get_all(http::header::CONNECTION).iter().any(|value| {
        value
            .to_str()
            .map(|text| {
                text.split(',')
                    .any(|item| item.trim().eq_ignore_ascii_case(token))
            })
            .unwrap_or(false)
    })
}

fn parse_request_target(method: &Method, target: &str) -> Result<RequestTarget> {
    if method == Method::CONNECT {
        let (host, port) = target
            .rsplit_once(':')
            .ok_or_else(|| anyhow!("CONNECT target '{target}' missing port"))?;
        let port: u16 = port
            .parse()
            .with_context(|| format!("invalid CONNECT port in '{target}'"))?;
        ensure!(!host.is_empty(), "CONNECT target must include a host");
        return Ok(RequestTarget::Authority {
            host: host.to_string(),
            port,
        });
    }

    if target.starts_with('/') {
        return Ok(RequestTarget::Origin(target.to_string()));
    }

    let rest = target
        .strip_prefix("http://")
        .ok_or_else(|| anyhow!("unsupported request target '{target}'"))?;
    let (authority, path) = match rest.find('/') {
        Some(index) => (&rest[..index], &rest[index..]),
        None => (rest, "/"),
    };
    ensure!(!authority.is_empty(), "request target must include a host");

    let (host, port) = match authority.rsplit_once(':') {
        Some((host, port)) => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid port in request target '{target}'"))?;
            (host.to_string(), Some(port))
        }
        None => (authority.to_string(), None),
    };

    Ok(RequestTarget::Absolute {
        host: host.to_ascii_lowercase(),
        port,
        path: path.to_string(),
        raw: target.to_string(),
    })
}

/// Reads one request head. Returns `Ok(None)` when the client closed the
/// connection cleanly before sending a request line.
pub(crate) async fn read_request_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let request_line_len =
        read_line_with_timeout(reader, &mut line, timeout_dur, peer, MAX_LINE_LENGTH).await?;
    if request_line_len == 0 {
        return Ok(None);
    }

    let trimmed = line.trim_end_matches(['\r', '\n']);
    let mut parts = trimmed.split(' ');
    let method = parts
        .next()
        .filter(|part| !part.is_empty())
        .ok_or_else(|| anyhow!("empty request line from {peer}"))?;
    let target = parts
        .next()
        .ok_or_else(|| anyhow!("request line from {peer} missing target"))?;
    let version = parts
        .next()
        .ok_or_else(|| anyhow!("request line from {peer} missing protocol version"))?;
    ensure!(
        parts.next().is_none(),
        "malformed request line from {peer}"
    );
    ensure!(
        version == "HTTP/1.1" || version == "HTTP/1.0",
        "unsupported protocol version '{version}' from {peer}"
    );

    let method = Method::from_bytes(method.as_bytes())
        .with_context(|| format!("invalid method in request from {peer}"))?;
    let target = parse_request_target(&method, target)?;
    let headers = read_header_block(reader, timeout_dur, peer, max_header_bytes).await?;

    Ok(Some(RequestHead {
        method,
        target,
        version: version.to_string(),
        headers,
    }))
}

pub(crate) async fn read_response_head<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<ResponseHead>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let len =
        read_line_with_timeout(reader, &mut line, timeout_dur, peer, MAX_LINE_LENGTH).await?;
    ensure!(len > 0, "upstream {peer} closed before sending a response");

    let trimmed = line.trim_end_matches(['\r', '\n']);
    let mut parts = trimmed.splitn(3, ' ');
    let version = parts
        .next()
        .filter(|part| part.starts_with("HTTP/"))
        .ok_or_else(|| anyhow!("malformed status line from {peer}"))?;
    let status = parts
        .next()
        .ok_or_else(|| anyhow!("status line from {peer} missing status code"))?;
    let status = status
        .parse::<u16>()
        .ok()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| anyhow!("invalid status code in response from {peer}"))?;

    let headers = read_header_block(reader, timeout_dur, peer, max_header_bytes).await?;
    Ok(ResponseHead {
        version: version.to_string(),
        status,
        headers,
    })
}

async fn read_header_block<S>(
    reader: &mut BufReader<S>,
    timeout_dur: Duration,
    peer: SocketAddr,
    max_header_bytes: usize,
) -> Result<HeaderMap>
where
    S: AsyncRead + Unpin,
{
    let mut headers = HeaderMap::new();
    let mut consumed = 0usize;
    let mut line = String::new();

    loop {
        let len =
            read_line_with_timeout(reader, &mut line, timeout_dur, peer, MAX_LINE_LENGTH).await?;
        ensure!(len > 0, "connection closed inside header block from {peer}");
        consumed += len;
        ensure!(
            consumed <= max_header_bytes,
            "header section from {peer} exceeds configured limit"
        );

        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            return Ok(headers);
        }

        let (name, value) = trimmed
            .split_once(':')
            .ok_or_else(|| anyhow!("header from {peer} missing ':' separator"))?;
        let name = name.trim();
        let value = value.trim();
        ensure!(!name.is_empty(), "empty header name from {peer}");
        let name = http::header::HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| anyhow!("invalid header name '{name}' from {peer}"))?;
        let value = http::HeaderValue::from_str(value)
            .map_err(|_| anyhow!("invalid header value from {peer}"))?;
        headers.append(name, value);
    }
}

/// How a message body is framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BodyPlan {
    Empty,
    Fixed(u64),
    Chunked,
    UntilClose,
}

pub(crate) fn request_body_plan(headers: &HeaderMap) -> Result<BodyPlan> {
    let chunked = headers
        .get_all(http::header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        ensure!(
            !headers.contains_key(http::header::CONTENT_LENGTH),
            "request must not include both Content-Length and Transfer-Encoding"
        );
        return Ok(BodyPlan::Chunked);
    }

    match headers.get(http::header::CONTENT_LENGTH) {
        Some(value) => {
            let length: u64 = value
                .to_str()
                .ok()
                .and_then(|text| text.trim().parse().ok())
                .ok_or_else(|| anyhow!("invalid Content-Length in request"))?;
            if length == 0 {
                Ok(BodyPlan::Empty)
            } else {
                Ok(BodyPlan::Fixed(length))
            }
        }
        None => Ok(BodyPlan::Empty),
    }
}

pub(crate) fn response_body_plan(
    method: &Method,
    status: StatusCode,
    headers: &HeaderMap,
) -> BodyPlan {
    if method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return BodyPlan::Empty;
    }

    let chunked = headers
        .get_all(http::header::TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|item| item.trim().eq_ignore_ascii_case("chunked"));
    if chunked {
        return BodyPlan::Chunked;
    }

    if let Some(length) = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|text| text.trim().parse::<u64>().ok())
    {
        return if length == 0 {
            BodyPlan::Empty
        } else {
            BodyPlan::Fixed(length)
        };
    }

    BodyPlan::UntilClose
}

/// Incremental body reader for one framed message. `read` returns zero at
/// end of body; for `UntilClose` that is the peer closing the stream.
#[derive(Debug)]
pub(crate) struct BodyReader {
    plan: BodyPlan,
    remaining: u64,
    chunk_started: bool,
    done: bool,
}

impl BodyReader {
    pub(crate) fn new(plan: BodyPlan) -> Self {
        let remaining = match plan {
            BodyPlan::Fixed(length) => length,
            _ => 0,
        };
        Self {
            plan,
            remaining,
            chunk_started: false,
            done: matches!(plan, BodyPlan::Empty),
        }
    }

    pub(crate) async fn read<S>(
        &mut self,
        reader: &mut BufReader<S>,
        buf: &mut [u8],
    ) -> std::io::Result<usize>
    where
        S: AsyncRead + Unpin,
    {
        use tokio::io::AsyncReadExt;

        if self.done || buf.is_empty() {
            return Ok(0);
        }

        match self.plan {
            BodyPlan::Empty => Ok(0),
            BodyPlan::UntilClose => {
                let n = reader.read(buf).await?;
                if n == 0 {
                    self.done = true;
                }
                Ok(n)
            }
            BodyPlan::Fixed(_) => {
                if self.remaining == 0 {
                    self.done = true;
                    return Ok(0);
                }
                let limit = buf.len().min(self.remaining as usize);
                let n = reader.read(&mut buf[..limit]).await?;
                if n == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "body ended before declared Content-Length",
                    ));
                }
                self.remaining -= n as u64;
                if self.remaining == 0 {
                    self.done = true;
                }
                Ok(n)
            }
            BodyPlan::Chunked => self.read_chunked(reader, buf).await,
        }
    }

    async fn read_chunked<S>(
        &mut self,
        reader: &mut BufReader<S>,
        buf: &mut [u8],
    ) -> std::io::Result<usize>
    where
        S: AsyncRead + Unpin,
    {
        use tokio::io::AsyncReadExt;

        if self.remaining == 0 {
            if self.chunk_started {
                // Trailing CRLF of the previous chunk.
                read_crlf_line(reader).await?;
            }
            let size_line = read_crlf_line(reader).await?;
            let size_field = size_line
                .split(';')
                .next()
                .unwrap_or_default()
                .trim();
            let size = u64::from_str_radix(size_field, 16).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "invalid chunk size")
            })?;
            self.chunk_started = true;

            if size == 0 {
                // Discard trailers up to the blank line.
                loop {
                    let trailer = read_crlf_line(reader).await?;
                    if trailer.is_empty() {
                        break;
                    }
                }
                self.done = true;
                return Ok(0);
            }
            self.remaining = size;
        }

        let limit = buf.len().min(self.remaining as usize);
        let n = reader.read(&mut buf[..limit]).await?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "body ended inside a chunk",
            ));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}

async fn read_crlf_line<S>(reader: &mut BufReader<S>) -> std::io::Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "connection closed inside chunked framing",
        ));
    }
    if line.len() > MAX_LINE_LENGTH {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "chunked framing line too long",
        ));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

pub(crate) fn encode_response_head(
    status: StatusCode,
    headers: &HeaderMap,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("Unknown")
        )
        .as_bytes(),
    );
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

pub(crate) fn encode_request_head(
    method: &Method,
    target: &str,
    headers: &HeaderMap,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(format!("{method} {target} HTTP/1.1\r\n").as_bytes());
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}
