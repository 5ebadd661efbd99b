use std::time::{Duration, SystemTime};

use http::HeaderMap;
use http::header::{ETAG, LAST_MODIFIED, WARNING};

use crate::proxy::cache::{Cache, CacheEntry};

/// Sorts entries newest-first by their Date header; entries without a
/// parseable Date sort last.
pub fn sort_by_date_desc(entries: &mut [CacheEntry]) {
    entries.sort_by_key(|entry| std::cmp::Reverse(entry.date().unwrap_or(SystemTime::UNIX_EPOCH)));
}

fn header_value<'a>(headers: &'a HeaderMap, name: &http::header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn entry_header(entry: &CacheEntry, name: &http::header::HeaderName) -> Option<String> {
    let lower = name.as_str();
    entry
        .meta
        .headers
        .iter()
        .find(|(header, _)| header.eq_ignore_ascii_case(lower))
        .map(|(_, value)| value.clone())
}

/// Selects the stored entries a `304 Not Modified` applies to, per RFC 7234
/// section 4.3.4. `candidates` must be ordered newest-first by Date; the
/// rules that pick "the most recent" match rely on that order.
fn select_for_update(response_headers: &HeaderMap, candidates: &[CacheEntry]) -> Vec<usize> {
    let etag = header_value(response_headers, &ETAG).unwrap_or("");
    let last_modified = header_value(response_headers, &LAST_MODIFIED)
        .and_then(|value| httpdate::parse_http_date(value).ok());

    // A strong ETag identifies the selected representation outright. When
    // nothing stored carries the same strong validator, the 304 must not be
    // used to update anything.
    if !etag.is_empty() && !etag.starts_with("W/") {
        return candidates
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry_header(entry, &ETAG).as_deref() == Some(etag))
            .map(|(index, _)| index)
            .collect();
    }

    // A Last-Modified value acts as a strong validator for entries whose
    // Date is at least 60 seconds later.
    if let Some(last_modified) = last_modified {
        let selected: Vec<usize> = candidates
            .iter()
            .enumerate()
            .filter(|(_, entry)| {
                entry.date().is_some_and(|date| {
                    date.duration_since(last_modified)
                        .map(|delta| delta >= Duration::from_secs(60))
                        .unwrap_or(false)
                })
            })
            .map(|(index, _)| index)
            .collect();
        if !selected.is_empty() {
            return selected;
        }
    }

    // Weak ETag: compare with the prefix stripped from both sides and take
    // at most the most recent match.
    if let Some(weak) = etag.strip_prefix("W/") {
        let matched = candidates.iter().position(|entry| {
            let stored = entry_header(entry, &ETAG).unwrap_or_default();
            stored.strip_prefix("W/").unwrap_or(&stored) == weak
        });
        if let Some(index) = matched {
            return vec![index];
        }
    }

    // Byte-identical Last-Modified, most recent only.
    if let Some(raw) = header_value(response_headers, &LAST_MODIFIED) {
        let matched = candidates
            .iter()
            .position(|entry| entry_header(entry, &LAST_MODIFIED).as_deref() == Some(raw));
        if let Some(index) = matched {
            return vec![index];
        }
    }

    // No validator on either side, a single stored response without a
    // Last-Modified of its own: that lone entry is selected.
    if etag.is_empty()
        && header_value(response_headers, &LAST_MODIFIED).is_none()
        && candidates.len() == 1
        && entry_header(&candidates[0], &LAST_MODIFIED).is_none()
    {
        return vec![0];
    }

    Vec::new()
}

/// Applies a `304 Not Modified` to the stored candidates: selected entries
/// drop their 1xx Warning values, take every header the 304 carries, and
/// record the revalidation time. Returns the newest updated entry to serve
/// downstream, or `None` when the 304 selected nothing.
pub async fn apply_not_modified(
    cache: &dyn Cache,
    response_headers: &HeaderMap,
    response_time: SystemTime,
    response_delay: Duration,
    candidates: &[CacheEntry],
) -> Option<CacheEntry> {
    let selected = select_for_update(response_headers, candidates);
    if selected.is_empty() {
        return None;
    }

    let mut updated = Vec::with_capacity(selected.len());
    for index in selected {
        let mut entry = candidates[index].clone();
        let mut headers = entry.meta.header_map();

        let retained: Vec<String> = headers
            .get_all(WARNING)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .filter(|value| !value.starts_with('1'))
            .map(String::from)
            .collect();
        headers.remove(WARNING);
        for value in retained {
            if let Ok(value) = http::HeaderValue::from_str(&value) {
                headers.append(WARNING, value);
            }
        }

        for name in header_names(response_headers) {
            headers.remove(&name);
            for value in response_headers.get_all(&name) {
                headers.append(&name, value.clone());
            }
        }

        entry.meta.set_headers(&headers);
        entry.meta.response_time_unix_nanos = crate::util::unix_nanos(response_time);
        entry.meta.response_delay_nanos = response_delay.as_nanos() as i64;
        cache.update(&entry).await;
        updated.push(entry);
    }

    sort_by_date_desc(&mut updated);
    updated.into_iter().next()
}

fn header_names(headers: &HeaderMap) -> Vec<http::header::HeaderName> {
    let mut names = Vec::new();
    for name in headers.keys() {
        names.push(name.clone());
    }
    names
}

/// The freshness inputs of a stored entry, shared by the pipeline.
pub fn entry_is_fresh(entry: &CacheEntry, shared: bool, now: SystemTime) -> bool {
    let headers = entry.meta.header_map();
    crate::proxy::freshness::is_fresh(
        &headers,
        entry.meta.response_time(),
        entry.meta.response_delay_secs(),
        shared,
        now,
    )
}
