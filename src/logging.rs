use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use time::OffsetDateTime;
use tracing_subscriber::{EnvFilter, fmt};

use crate::cli::LogFormat;

const DEFAULT_FILTER: &str = "info";

pub fn init_logger(format: LogFormat) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Json => fmt::fmt()
            .with_env_filter(filter)
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .try_init()
            .map_err(|err| anyhow!(err))?,
        LogFormat::Text => fmt::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .compact()
            .try_init()
            .map_err(|err| anyhow!(err))?,
    }

    Ok(())
}

/// One record per handled request, consumed by the access-log sink.
#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub client_ip: String,
    pub client_port: u16,
    pub method: String,
    pub uri: String,
    pub status: u16,
    pub content_length: i64,
    pub cache_result: String,
    pub comments: Vec<String>,
    pub response_received_ms: u128,
    pub elapsed_ms: u128,
}

#[derive(Debug)]
pub struct AccessLogBuilder {
    event: AccessLogEvent,
}

impl AccessLogBuilder {
    pub fn new(peer: SocketAddr) -> Self {
        Self {
            event: AccessLogEvent {
                client_ip: peer.ip().to_string(),
                client_port: peer.port(),
                method: String::new(),
                uri: String::new(),
                status: 0,
                content_length: -1,
                cache_result: String::new(),
                comments: Vec::new(),
                response_received_ms: 0,
                elapsed_ms: 0,
            },
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.event.method = method.into();
        self
    }

    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.event.uri = uri.into();
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.event.status = status.as_u16();
        self
    }

    pub fn content_length(mut self, length: i64) -> Self {
        self.event.content_length = length;
        self
    }

    pub fn cache_result(mut self, result: impl Into<String>) -> Self {
        self.event.cache_result = result.into();
        self
    }

    pub fn comments(mut self, comments: Vec<String>) -> Self {
        self.event.comments = comments;
        self
    }

    pub fn response_received(mut self, elapsed: Duration) -> Self {
        self.event.response_received_ms = elapsed.as_millis();
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn build(self) -> AccessLogEvent {
        self.event
    }

    pub fn log(self) {
        log_access(self.build());
    }
}

pub fn log_access(event: AccessLogEvent) {
    let AccessLogEvent {
        client_ip,
        client_port,
        method,
        uri,
        status,
        content_length,
        cache_result,
        comments,
        response_received_ms,
        elapsed_ms,
    } = event;

    let now = OffsetDateTime::now_utc();
    let (year, month, day) = now.to_calendar_date();
    let (hour, minute, second) = now.to_hms();
    let millisecond = now.millisecond();
    let month_number: u8 = month.into();
    let ts = format!(
        "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{millisecond:03}Z",
        month = month_number
    );
    let comments_field = comments.join(" ");

    tracing::info!(
        target = "access_log",
        ts,
        client_ip,
        client_port,
        method,
        uri,
        status,
        content_length,
        cache_result,
        comments = comments_field,
        response_received_ms,
        elapsed_ms,
    );

    crate::metrics::record_request(
        &method,
        StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        &cache_result,
    );
}
