use http::HeaderMap;
use http::header::VARY;

use crate::proxy::directives::normalize;

/// Combined Vary field-name lists longer than this disable caching for the
/// response (the `["*"]` sentinel).
pub const MAX_VARY_BYTES: usize = 65_535;

/// Extracts the Vary field names of a response: comma-joined across header
/// repetitions, whitespace stripped, canonicalised, sorted ascending. A `*`
/// member or an oversized list yields the `["*"]` sentinel, which never
/// matches any request.
pub fn vary_fields(headers: &HeaderMap) -> Vec<String> {
    let mut combined = String::new();
    for value in headers.get_all(VARY) {
        if let Ok(text) = value.to_str() {
            if !combined.is_empty() {
                combined.push(',');
            }
            combined.push_str(text);
        }
    }
    combined.retain(|ch| ch != ' ');

    if combined.contains('*') || combined.len() > MAX_VARY_BYTES {
        return vec!["*".to_string()];
    }
    if combined.is_empty() {
        return Vec::new();
    }

    let mut fields: Vec<String> = combined.split(',').map(canonical_field_name).collect();
    fields.sort();
    fields
}

/// Canonical MIME header casing: first letter and every letter following a
/// hyphen upper-cased, the rest lowered.
fn canonical_field_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if ch == '-' {
            out.push(ch);
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.extend(ch.to_lowercase());
        }
    }
    out
}

/// Joins every value of `name` with `,` and canonicalises token spacing, so
/// requests that differ only in header whitespace produce identical keys.
pub fn normalized_value(name: &str, headers: &HeaderMap) -> String {
    let mut combined = String::new();
    for value in headers.get_all(name) {
        if let Ok(text) = value.to_str() {
            if !combined.is_empty() {
                combined.push(',');
            }
            combined.push_str(text);
        }
    }
    normalize(&combined)
}

/// The normalised request-header values for a sorted Vary field list.
pub fn normalized_values(fields: &[String], headers: &HeaderMap) -> Vec<String> {
    fields
        .iter()
        .map(|field| normalized_value(field, headers))
        .collect()
}

/// Serialises `(url, vary pairs)` into the index key: URL bytes, NUL, a
/// two-byte big-endian pair count, then `field NUL value` pairs separated by
/// NUL. The final value runs to the end of the buffer. The layout keeps all
/// variants of one URL in a contiguous key range.
pub fn encode_key(url: &str, fields: &[String], values: &[String]) -> Vec<u8> {
    debug_assert_eq!(fields.len(), values.len());
    let mut key = Vec::with_capacity(url.len() + 3);
    key.extend_from_slice(url.as_bytes());
    key.push(0);

    let count = fields.len();
    key.push((count / 256) as u8);
    key.push((count % 256) as u8);
    for (index, field) in fields.iter().enumerate() {
        key.extend_from_slice(field.as_bytes());
        key.push(0);
        key.extend_from_slice(values[index].as_bytes());
        if index + 1 < count {
            key.push(0);
        }
    }
    key
}

/// Computes the request key for storing a response: field names come from
/// the response's Vary header, field values from the request headers that
/// selected the representation.
pub fn request_key(url: &str, response_headers: &HeaderMap, request_headers: &HeaderMap) -> Vec<u8> {
    let fields = vary_fields(response_headers);
    let values = normalized_values(&fields, request_headers);
    encode_key(url, &fields, &values)
}

/// The lower bound of the key range holding every variant of `url`.
pub fn url_prefix(url: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(url.len() + 1);
    prefix.extend_from_slice(url.as_bytes());
    prefix.push(0);
    prefix
}

/// Reverses `encode_key`. Returns `None` for malformed keys.
pub fn decode_key(key: &[u8]) -> Option<(String, Vec<String>, Vec<String>)> {
    let nul = key.iter().position(|byte| *byte == 0)?;
    let url = String::from_utf8(key[..nul].to_vec()).ok()?;
    let mut rest = &key[nul + 1..];

    if rest.len() < 2 {
        return None;
    }
    let count = rest[0] as usize * 256 + rest[1] as usize;
    rest = &rest[2..];

    let mut fields = Vec::with_capacity(count);
    let mut values = Vec::with_capacity(count);
    for index in 0..count {
        let nul = rest.iter().position(|byte| *byte == 0)?;
        fields.push(String::from_utf8(rest[..nul].to_vec()).ok()?);
        rest = &rest[nul + 1..];

        let value = if index + 1 < count {
            let nul = rest.iter().position(|byte| *byte == 0)?;
            let value = &rest[..nul];
            let parsed = String::from_utf8(value.to_vec()).ok()?;
            rest = &rest[nul + 1..];
            parsed
        } else {
            let parsed = String::from_utf8(rest.to_vec()).ok()?;
            rest = &[];
            parsed
        };
        values.push(value);
    }

    if !rest.is_empty() {
        return None;
    }
    Some((url, fields, values))
}

/// A stored variant matches a request when every stored Vary value equals
/// the request's normalised value for that field. The `*` sentinel never
/// matches: a `Vary: *` response is useless to every later request.
pub fn vary_match(fields: &[String], values: &[String], request_headers: &HeaderMap) -> bool {
    if fields.iter().any(|field| field == "*") {
        return false;
    }
    fields
        .iter()
        .zip(values)
        .all(|(field, value)| normalized_value(field, request_headers) == *value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                http::header::HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn vary_fields_are_canonicalised_and_sorted() {
        let headers = headers(&[("vary", "user-agent, accept-encoding")]);
        assert_eq!(
            vary_fields(&headers),
            vec!["Accept-Encoding".to_string(), "User-Agent".to_string()]
        );
    }

    #[test]
    fn vary_fields_fold_repeated_headers() {
        let mut map = HeaderMap::new();
        map.append("vary", "accept-encoding".parse().unwrap());
        map.append("vary", "accept-language".parse().unwrap());
        assert_eq!(
            vary_fields(&map),
            vec!["Accept-Encoding".to_string(), "Accept-Language".to_string()]
        );
    }

    #[test]
    fn vary_star_collapses_to_sentinel() {
        let headers = headers(&[("vary", "accept-encoding, *")]);
        assert_eq!(vary_fields(&headers), vec!["*".to_string()]);
    }

    #[test]
    fn sentinel_never_matches() {
        let fields = vec!["*".to_string()];
        let values = vec![String::new()];
        assert!(!vary_match(&fields, &values, &HeaderMap::new()));
    }

    #[test]
    fn key_round_trips() {
        let cases: &[(&str, &[&str], &[&str])] = &[
            ("http://example.com/", &[], &[]),
            ("http://example.com/a", &["Accept-Encoding"], &["gzip"]),
            (
                "http://example.com/a?q=1",
                &["Accept-Encoding", "User-Agent"],
                &["gzip,br", "test agent"],
            ),
            ("http://example.com/empty", &["Accept"], &[""]),
        ];
        for (url, fields, values) in cases {
            let fields: Vec<String> = fields.iter().map(|s| s.to_string()).collect();
            let values: Vec<String> = values.iter().map(|s| s.to_string()).collect();
            let key = encode_key(url, &fields, &values);
            let (decoded_url, decoded_fields, decoded_values) =
                decode_key(&key).expect("key decodes");
            assert_eq!(decoded_url, *url);
            assert_eq!(decoded_fields, fields);
            assert_eq!(decoded_values, values);
        }
    }

    #[test]
    fn keys_share_the_url_prefix() {
        let plain = encode_key("http://example.com/x", &[], &[]);
        let varied = encode_key(
            "http://example.com/x",
            &["Accept-Encoding".to_string()],
            &["gzip".to_string()],
        );
        let prefix = url_prefix("http://example.com/x");
        assert!(plain.starts_with(&prefix));
        assert!(varied.starts_with(&prefix));
    }

    #[test]
    fn request_key_takes_values_from_the_request() {
        let response = headers(&[("vary", "Accept-Encoding")]);
        let request = headers(&[("accept-encoding", "gzip")]);
        let key = request_key("http://example.com/", &response, &request);
        let (_, fields, values) = decode_key(&key).expect("decodes");
        assert_eq!(fields, vec!["Accept-Encoding".to_string()]);
        assert_eq!(values, vec!["gzip".to_string()]);
    }

    #[test]
    fn match_is_reflexive_for_storing_request() {
        let response = headers(&[("vary", "Accept-Encoding")]);
        let request = headers(&[("accept-encoding", " gzip ,  br")]);
        let fields = vary_fields(&response);
        let values = normalized_values(&fields, &request);
        assert!(vary_match(&fields, &values, &request));

        // Equivalent whitespace still matches.
        let equivalent = headers(&[("accept-encoding", "gzip,br")]);
        assert!(vary_match(&fields, &values, &equivalent));

        // A different value does not.
        let other = headers(&[("accept-encoding", "identity")]);
        assert!(!vary_match(&fields, &values, &other));
    }

    #[test]
    fn decode_rejects_truncated_keys() {
        assert!(decode_key(b"no-terminator").is_none());
        assert!(decode_key(b"url\0\x00").is_none());
        // Count claims a pair but none follows.
        assert!(decode_key(b"url\0\x00\x01").is_none());
    }
}
