use std::net::SocketAddr;
use std::time::{Instant, SystemTime};

use anyhow::{Context, Result};
use http::header::{
    CONTENT_LENGTH, CONTENT_TYPE, ETAG, EXPECT, HOST, IF_MODIFIED_SINCE, IF_NONE_MATCH,
};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error};

use crate::logging::AccessLogBuilder;
use crate::proxy::cache::{BodySink, CacheBody, CacheEntry, StoredMeta};
use crate::proxy::{decision, headers, revalidate};

use super::AppContext;
use super::codec::{
    BodyPlan, BodyReader, RequestHead, RequestTarget, encode_response_head, request_body_plan,
};
use super::upstream::{UpstreamRequest, UpstreamRequestBody, UpstreamResponse};

const STREAM_BUF_SIZE: usize = 32 * 1024;

/// Synthesised when the upstream transport fails outright.
const UPSTREAM_ERROR_STATUS: u16 = 555;

pub(crate) enum ClientDisposition {
    Continue,
    Close,
}

/// What the request resolved to after consulting cache and upstream.
enum Resolved {
    Hit(CacheEntry, CacheBody),
    Upstream(UpstreamResponse),
    Synthesized(StatusCode, String),
}

/// Drives one caching-path request end to end: decision, lookup,
/// revalidation, upstream fetch, streaming tee, access log.
pub(crate) async fn handle_request(
    reader: &mut BufReader<TcpStream>,
    peer: SocketAddr,
    app: &AppContext,
    head: RequestHead,
) -> Result<ClientDisposition> {
    let start = Instant::now();
    let (host, port, path, url) = match &head.target {
        RequestTarget::Absolute {
            host,
            port,
            path,
            raw,
        } => (host.clone(), *port, path.clone(), raw.clone()),
        _ => unreachable!("pipeline only handles absolute-form targets"),
    };

    let method = head.method.clone();
    let request_headers = head.headers.clone();
    let shared = app.settings.shared;
    let proxy_name = app.settings.proxy_name();

    let request_body = match request_body_plan(&request_headers) {
        Ok(plan) => plan,
        Err(err) => {
            debug!(peer = %peer, error = %err, "unframeable request body");
            respond_simple(
                reader.get_mut(),
                StatusCode::BAD_REQUEST,
                "invalid request framing\n",
            )
            .await?;
            return Ok(ClientDisposition::Close);
        }
    };
    let mut request_body_pending = request_body != BodyPlan::Empty;

    let mut cache_result = String::new();
    let mut decision = decision::request_phase(&method, &request_headers, shared);

    // Step 1: every stored variant for this URL, newest first.
    let mut candidates = if decision.can_serve {
        app.cache.retrieve(&url, &request_headers).await
    } else {
        Vec::new()
    };
    revalidate::sort_by_date_desc(&mut candidates);
    let mut picked: Option<CacheEntry> = candidates.first().cloned();
    let mut resolved: Option<Resolved> = None;

    // Step 2: stale entries and forced revalidations go upstream with the
    // stored validators attached.
    let needs_revalidation = picked
        .as_ref()
        .map(|entry| {
            !revalidate::entry_is_fresh(entry, shared, SystemTime::now())
                || decision.must_revalidate
        })
        .unwrap_or(false);
    if needs_revalidation {
        cache_result.push_str("REVALIDATE,");
        crate::metrics::record_revalidation();

        let mut upstream_headers =
            forward_headers(&request_headers, peer, &head.version, &proxy_name);
        let conditional = attach_validators(&mut upstream_headers, &candidates, &method);

        let request = UpstreamRequest {
            method: &method,
            host: &host,
            port,
            path: &path,
            raw_target: &url,
            headers: upstream_headers,
            body: None,
        };
        match app.transport.round_trip(request).await {
            Ok(response) if conditional && response.status == StatusCode::NOT_MODIFIED => {
                let mut response_headers = response.headers.clone();
                headers::strip_per_hop(&mut response_headers);
                headers::append_via(&mut response_headers, &response.version, &proxy_name);
                headers::ensure_date(&mut response_headers, response.response_time);

                picked = revalidate::apply_not_modified(
                    app.cache.as_ref(),
                    &response_headers,
                    response.response_time,
                    response.response_delay(),
                    &candidates,
                )
                .await;
            }
            Ok(response) => {
                picked = None;
                resolved = Some(Resolved::Upstream(response));
            }
            Err(err) => {
                debug!(peer = %peer, url = %url, error = %err, "upstream revalidation failed");
                picked = None;
                resolved = Some(Resolved::Synthesized(
                    StatusCode::from_u16(UPSTREAM_ERROR_STATUS)
                        .unwrap_or(StatusCode::BAD_GATEWAY),
                    format!("error: {err:#}"),
                ));
            }
        }
    }

    // Step 3: a selected entry is only usable while its blob survives; a
    // lost race with eviction falls through to an unconditional fetch.
    if resolved.is_none()
        && let Some(entry) = picked.take()
    {
        match app.cache.open_body(&entry).await {
            Ok(body) => {
                resolved = Some(Resolved::Hit(entry, body));
            }
            Err(err) => {
                debug!(peer = %peer, url = %url, error = %err, "cached body unavailable");
                cache_result.push_str("DROPPED,");
            }
        }
    }

    // Step 4: nothing served so far means one unconditional upstream fetch.
    let resolved = if let Some(resolved) = resolved {
        if matches!(resolved, Resolved::Hit(..)) {
            cache_result.push_str("HIT");
            crate::metrics::record_cache_lookup(true);
            decision.can_store = false;
        } else {
            cache_result.push_str("MISS");
            crate::metrics::record_cache_lookup(false);
        }
        resolved
    } else {
        cache_result.push_str("MISS");
        crate::metrics::record_cache_lookup(false);

        let mut upstream_headers =
            forward_headers(&request_headers, peer, &head.version, &proxy_name);
        let body = if request_body_pending {
            request_body_pending = false;
            if request_body == BodyPlan::Chunked {
                upstream_headers.insert(
                    http::header::TRANSFER_ENCODING,
                    HeaderValue::from_static("chunked"),
                );
            }
            Some(UpstreamRequestBody {
                reader: &mut *reader,
                body: BodyReader::new(request_body),
                plan: request_body,
            })
        } else {
            None
        };

        let forwarding_body = body.is_some();
        let request = UpstreamRequest {
            method: &method,
            host: &host,
            port,
            path: &path,
            raw_target: &url,
            headers: upstream_headers,
            body,
        };
        match app.transport.round_trip(request).await {
            Ok(response) => Resolved::Upstream(response),
            Err(err) => {
                debug!(peer = %peer, url = %url, error = %err, "upstream request failed");
                if forwarding_body {
                    // The client body may be half-consumed.
                    request_body_pending = true;
                }
                Resolved::Synthesized(
                    StatusCode::from_u16(UPSTREAM_ERROR_STATUS)
                        .unwrap_or(StatusCode::BAD_GATEWAY),
                    format!("error: {err:#}"),
                )
            }
        }
    };

    let response_received = start.elapsed();

    let outcome = match resolved {
        Resolved::Hit(entry, body) => {
            serve_hit(reader.get_mut(), &method, &entry, body).await?
        }
        Resolved::Upstream(response) => {
            serve_upstream(
                reader.get_mut(),
                peer,
                app,
                &method,
                &url,
                &request_headers,
                &mut decision,
                &mut cache_result,
                response,
            )
            .await?
        }
        Resolved::Synthesized(status, message) => {
            serve_synthesized(reader.get_mut(), &method, status, &message).await?
        }
    };

    AccessLogBuilder::new(peer)
        .method(method.as_str())
        .uri(&url)
        .status(outcome.status)
        .content_length(outcome.body_bytes as i64)
        .cache_result(cache_result)
        .comments(decision.trace.clone())
        .response_received(response_received)
        .elapsed(start.elapsed())
        .log();

    if outcome.client_gone
        || request_body_pending
        || head.wants_close()
        || head.version == "HTTP/1.0"
        || !outcome.keep_alive
    {
        Ok(ClientDisposition::Close)
    } else {
        Ok(ClientDisposition::Continue)
    }
}

struct ServeOutcome {
    status: StatusCode,
    body_bytes: u64,
    keep_alive: bool,
    client_gone: bool,
}

async fn serve_hit(
    client: &mut TcpStream,
    method: &Method,
    entry: &CacheEntry,
    mut body: CacheBody,
) -> Result<ServeOutcome> {
    let mut response_headers = entry.meta.header_map();
    // The stored Content-Length may describe the original transfer; the
    // blob's size is authoritative.
    if let Ok(value) = HeaderValue::from_str(&body.size.to_string()) {
        response_headers.insert(CONTENT_LENGTH, value);
    }

    let status = entry.meta.status();
    let head = encode_response_head(status, &response_headers);
    if client.write_all(&head).await.is_err() {
        return Ok(gone(status));
    }

    let mut sent = 0u64;
    if method != Method::HEAD {
        let mut buf = [0u8; STREAM_BUF_SIZE];
        loop {
            let n = tokio::io::AsyncReadExt::read(&mut body.file, &mut buf)
                .await
                .context("failed to read cached body")?;
            if n == 0 {
                break;
            }
            if client.write_all(&buf[..n]).await.is_err() {
                return Ok(gone(status));
            }
            sent += n as u64;
        }
    }
    client.flush().await.ok();

    Ok(ServeOutcome {
        status,
        body_bytes: sent,
        keep_alive: true,
        client_gone: false,
    })
}

#[allow(clippy::too_many_arguments)]
async fn serve_upstream(
    client: &mut TcpStream,
    peer: SocketAddr,
    app: &AppContext,
    method: &Method,
    url: &str,
    request_headers: &HeaderMap,
    decision: &mut decision::Decision,
    cache_result: &mut String,
    mut response: UpstreamResponse,
) -> Result<ServeOutcome> {
    let proxy_name = app.settings.proxy_name();
    let mut response_headers = response.headers.clone();
    headers::strip_per_hop(&mut response_headers);
    headers::append_via(&mut response_headers, &response.version, &proxy_name);
    headers::ensure_date(&mut response_headers, response.response_time);

    decision::response_phase(decision, response.status, &response_headers, app.settings.shared);

    // Bodies of non-GET requests are never admitted; a HEAD response would
    // poison the URL's variants with an empty body.
    let mut writer: Option<Box<dyn BodySink>> = None;
    if decision.can_store && method == Method::GET {
        let meta = StoredMeta::new(
            response.status,
            &response_headers,
            response.response_time,
            response.response_delay(),
        );
        match app
            .cache
            .open_writer(url, request_headers, meta)
            .await
        {
            Ok(sink) => writer = Some(sink),
            Err(err) => {
                error!(peer = %peer, url = %url, error = %err, "cannot open cache writer");
            }
        }
    }
    cache_result.push_str(if writer.is_some() { ",STORE" } else { ",NOSTORE" });

    // Client-side framing: a known length keeps the connection reusable;
    // anything else streams until EOF and closes.
    let known_length = response_headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|text| text.trim().parse::<u64>().ok());
    let keep_alive = known_length.is_some();
    if !keep_alive {
        response_headers.insert(
            http::header::CONNECTION,
            HeaderValue::from_static("close"),
        );
    }

    let head = encode_response_head(response.status, &response_headers);
    if client.write_all(&head).await.is_err() {
        if let Some(sink) = writer.take() {
            sink.discard().await;
        }
        return Ok(gone(response.status));
    }

    let mut sent = 0u64;
    let mut buf = [0u8; STREAM_BUF_SIZE];
    loop {
        let n = match response.read_body(&mut buf).await {
            Ok(n) => n,
            Err(err) => {
                debug!(peer = %peer, url = %url, error = %err, "upstream body failed mid-stream");
                if let Some(sink) = writer.take() {
                    sink.discard().await;
                }
                return Ok(gone(response.status));
            }
        };
        if n == 0 {
            break;
        }

        if client.write_all(&buf[..n]).await.is_err() {
            // Client disconnect aborts the admission; partial bodies are
            // never committed.
            if let Some(sink) = writer.take() {
                sink.discard().await;
            }
            return Ok(gone(response.status));
        }
        sent += n as u64;

        let mut admission_failed = false;
        if let Some(sink) = writer.as_mut()
            && let Err(err) = sink.write_all(&buf[..n]).await
        {
            error!(peer = %peer, url = %url, error = %err, "cache admission failed; continuing uncached");
            admission_failed = true;
        }
        if admission_failed && let Some(sink) = writer.take() {
            sink.discard().await;
        }
    }
    client.flush().await.ok();

    if let Some(sink) = writer.take() {
        if let Err(err) = sink.commit().await {
            error!(peer = %peer, url = %url, error = %err, "cache commit failed");
        }
    }

    Ok(ServeOutcome {
        status: response.status,
        body_bytes: sent,
        keep_alive,
        client_gone: false,
    })
}

async fn serve_synthesized(
    client: &mut TcpStream,
    method: &Method,
    status: StatusCode,
    message: &str,
) -> Result<ServeOutcome> {
    let mut response_headers = HeaderMap::new();
    response_headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    if let Ok(value) = HeaderValue::from_str(&message.len().to_string()) {
        response_headers.insert(CONTENT_LENGTH, value);
    }

    let head = encode_response_head(status, &response_headers);
    if client.write_all(&head).await.is_err() {
        return Ok(gone(status));
    }
    let mut sent = 0u64;
    if method != Method::HEAD && client.write_all(message.as_bytes()).await.is_ok() {
        sent = message.len() as u64;
    }
    client.flush().await.ok();

    Ok(ServeOutcome {
        status,
        body_bytes: sent,
        keep_alive: true,
        client_gone: false,
    })
}

pub(crate) async fn respond_simple(
    client: &mut TcpStream,
    status: StatusCode,
    body: &str,
) -> Result<()> {
    let mut response_headers = HeaderMap::new();
    response_headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    if let Ok(value) = HeaderValue::from_str(&body.len().to_string()) {
        response_headers.insert(CONTENT_LENGTH, value);
    }
    let head = encode_response_head(status, &response_headers);
    client.write_all(&head).await.ok();
    client.write_all(body.as_bytes()).await.ok();
    client.flush().await.ok();
    Ok(())
}

fn gone(status: StatusCode) -> ServeOutcome {
    ServeOutcome {
        status,
        body_bytes: 0,
        keep_alive: false,
        client_gone: true,
    }
}

/// The header set forwarded upstream: per-hop fields dropped, forwarding
/// metadata appended.
fn forward_headers(
    request_headers: &HeaderMap,
    peer: SocketAddr,
    proto: &str,
    proxy_name: &str,
) -> HeaderMap {
    let mut forwarded = request_headers.clone();
    headers::strip_per_hop(&mut forwarded);
    forwarded.remove(HOST);
    forwarded.remove(EXPECT);
    forwarded.remove("proxy-connection");
    headers::append_forwarded_for(&mut forwarded, peer.ip());
    headers::append_via(&mut forwarded, proto, proxy_name);
    forwarded
}

/// Adds the stored validators to a conditional request: every candidate's
/// ETag under If-None-Match, the newest Last-Modified under
/// If-Modified-Since (GET and HEAD only). Returns whether the request
/// became conditional.
fn attach_validators(
    upstream_headers: &mut HeaderMap,
    candidates: &[CacheEntry],
    method: &Method,
) -> bool {
    let mut conditional = false;
    let mut newest_modified: Option<SystemTime> = None;

    for entry in candidates {
        let entry_headers = entry.meta.header_map();
        if let Some(etag) = entry_headers.get(ETAG) {
            upstream_headers.append(IF_NONE_MATCH, etag.clone());
            conditional = true;
        }
        if let Some(modified) = crate::util::parse_date_header(&entry_headers, "last-modified") {
            if newest_modified.is_none_or(|current| modified > current) {
                newest_modified = Some(modified);
            }
        }
    }

    if (method == Method::GET || method == Method::HEAD)
        && let Some(modified) = newest_modified
    {
        let formatted = httpdate::fmt_http_date(modified);
        if let Ok(value) = HeaderValue::from_str(&formatted) {
            upstream_headers.insert(IF_MODIFIED_SINCE, value);
            conditional = true;
        }
    }

    conditional
}
