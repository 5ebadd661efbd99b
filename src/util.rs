use std::{future::Future, time::Duration, time::SystemTime, time::UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use http::HeaderMap;
use tokio::time::timeout;

/// Wraps `tokio::time::timeout`, converting elapsed deadlines and inner errors into contextual
/// `anyhow::Error` values for consistent diagnostics.
pub async fn timeout_with_context<F, T, E>(
    duration: Duration,
    future: F,
    context: impl Into<String>,
) -> Result<T>
where
    F: Future<Output = Result<T, E>>,
    E: std::error::Error + Send + Sync + 'static,
{
    let context = context.into();
    timeout(duration, future)
        .await
        .map_err(|_| anyhow!("timed out {context}"))?
        .with_context(|| format!("failed while {context}"))
}

pub fn unix_seconds(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(delta) => delta.as_secs() as i64,
        Err(err) => -(err.duration().as_secs() as i64),
    }
}

pub fn unix_nanos(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(delta) => delta.as_nanos() as i64,
        Err(err) => -(err.duration().as_nanos() as i64),
    }
}

pub fn system_time_from_nanos(nanos: i64) -> SystemTime {
    if nanos >= 0 {
        UNIX_EPOCH + Duration::from_nanos(nanos as u64)
    } else {
        UNIX_EPOCH - Duration::from_nanos(nanos.unsigned_abs())
    }
}

/// Parses the first value of an HTTP date header. Unparseable or absent
/// values yield `None`; callers treat that as "no date".
pub fn parse_date_header(headers: &HeaderMap, name: &str) -> Option<SystemTime> {
    let value = headers.get(name)?.to_str().ok()?;
    httpdate::parse_http_date(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn unix_conversions_round_trip() {
        let now = SystemTime::now();
        let nanos = unix_nanos(now);
        let back = system_time_from_nanos(nanos);
        let drift = now
            .duration_since(back)
            .unwrap_or_else(|err| err.duration());
        assert!(drift < Duration::from_micros(1));
    }

    #[test]
    fn parses_rfc1123_dates() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "date",
            HeaderValue::from_static("Sun, 06 Nov 1994 08:49:37 GMT"),
        );
        let parsed = parse_date_header(&headers, "date").expect("date parses");
        assert_eq!(unix_seconds(parsed), 784111777);
    }

    #[test]
    fn rejects_garbage_dates() {
        let mut headers = HeaderMap::new();
        headers.insert("date", HeaderValue::from_static("not a date"));
        assert!(parse_date_header(&headers, "date").is_none());
    }
}
