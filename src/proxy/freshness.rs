use std::time::SystemTime;

use http::HeaderMap;
use http::header::CACHE_CONTROL;

use crate::proxy::directives::directive_map;
use crate::util::{parse_date_header, unix_seconds};

/// Sentinel freshness lifetime for responses without any freshness
/// information: one year in the past, so the entry is always stale.
pub const ALWAYS_STALE_SECS: i64 = -(365 * 24 * 3600);

/// Sentinel current age for entries without a usable Date header: one year,
/// so the entry is always considered stale.
pub const UNKNOWN_AGE_SECS: i64 = 365 * 24 * 3600;

/// Computes the freshness lifetime of a stored response in seconds, per
/// RFC 7234 section 4.2.1: `s-maxage` (shared caches), then `max-age`, then
/// `Expires - Date`.
pub fn freshness_lifetime(headers: &HeaderMap, shared: bool) -> i64 {
    let cc = directive_map(headers, CACHE_CONTROL);

    if shared && let Some(s_maxage) = cc.get("s-maxage") {
        if let Ok(secs) = s_maxage.parse::<i64>() {
            return secs;
        }
    } else if let Some(max_age) = cc.get("max-age") {
        if let Ok(secs) = max_age.parse::<i64>() {
            return secs;
        }
    } else if headers.get_all("expires").iter().count() == 1
        && headers.get_all("date").iter().count() == 1
    {
        if let (Some(expires), Some(date)) = (
            parse_date_header(headers, "expires"),
            parse_date_header(headers, "date"),
        ) {
            return unix_seconds(expires) - unix_seconds(date);
        }
    }

    ALWAYS_STALE_SECS
}

/// Computes the current age of a stored response in seconds, per RFC 7234
/// section 4.2.3.
pub fn current_age(
    headers: &HeaderMap,
    response_time: SystemTime,
    response_delay_secs: i64,
    now: SystemTime,
) -> i64 {
    let date = match parse_date_header(headers, "date") {
        Some(date) => date,
        None => return UNKNOWN_AGE_SECS,
    };

    let age_value = headers
        .get("age")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<i64>().ok())
        .unwrap_or(0);

    let apparent_age = (unix_seconds(response_time) - unix_seconds(date)).max(0);
    let corrected_initial_age = apparent_age.max(age_value + response_delay_secs);
    let resident_time = unix_seconds(now) - unix_seconds(response_time);

    corrected_initial_age + resident_time
}

/// An entry is fresh while its current age is below its freshness lifetime.
pub fn is_fresh(
    headers: &HeaderMap,
    response_time: SystemTime,
    response_delay_secs: i64,
    shared: bool,
    now: SystemTime,
) -> bool {
    current_age(headers, response_time, response_delay_secs, now)
        < freshness_lifetime(headers, shared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(
                http::header::HeaderName::try_from(*name).unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn s_maxage_wins_in_shared_caches() {
        let headers = headers(&[("cache-control", "s-maxage=30, max-age=600")]);
        assert_eq!(freshness_lifetime(&headers, true), 30);
        assert_eq!(freshness_lifetime(&headers, false), 600);
    }

    #[test]
    fn expires_minus_date_used_as_fallback() {
        let headers = headers(&[
            ("date", "Sun, 06 Nov 1994 08:49:37 GMT"),
            ("expires", "Sun, 06 Nov 1994 09:49:37 GMT"),
        ]);
        assert_eq!(freshness_lifetime(&headers, true), 3600);
    }

    #[test]
    fn malformed_max_age_does_not_fall_through_to_expires() {
        let headers = headers(&[
            ("cache-control", "max-age=soon"),
            ("date", "Sun, 06 Nov 1994 08:49:37 GMT"),
            ("expires", "Sun, 06 Nov 1994 09:49:37 GMT"),
        ]);
        assert_eq!(freshness_lifetime(&headers, true), ALWAYS_STALE_SECS);
    }

    #[test]
    fn missing_freshness_information_is_always_stale() {
        assert_eq!(freshness_lifetime(&HeaderMap::new(), true), ALWAYS_STALE_SECS);
    }

    #[test]
    fn duplicate_expires_is_ignored() {
        let headers = headers(&[
            ("date", "Sun, 06 Nov 1994 08:49:37 GMT"),
            ("expires", "Sun, 06 Nov 1994 09:49:37 GMT"),
            ("expires", "Sun, 06 Nov 1994 10:49:37 GMT"),
        ]);
        assert_eq!(freshness_lifetime(&headers, true), ALWAYS_STALE_SECS);
    }

    #[test]
    fn current_age_accounts_for_age_header_and_delay() {
        let date = "Sun, 06 Nov 1994 08:49:37 GMT";
        let date_time = httpdate::parse_http_date(date).unwrap();
        let headers = headers(&[("date", date), ("age", "100")]);

        // Response received ten seconds after the origin's Date, with a
        // two-second round trip.
        let response_time = date_time + Duration::from_secs(10);
        let now = response_time + Duration::from_secs(5);
        let age = current_age(&headers, response_time, 2, now);
        // corrected initial age = max(10, 100 + 2) = 102; plus 5 resident.
        assert_eq!(age, 107);
    }

    #[test]
    fn current_age_without_date_is_sentinel() {
        let now = SystemTime::now();
        assert_eq!(
            current_age(&HeaderMap::new(), now, 0, now),
            UNKNOWN_AGE_SECS
        );
    }

    #[test]
    fn current_age_is_monotonic_in_wall_time() {
        let date = "Sun, 06 Nov 1994 08:49:37 GMT";
        let date_time = httpdate::parse_http_date(date).unwrap();
        let headers = headers(&[("date", date)]);
        let response_time = date_time + Duration::from_secs(1);

        let mut previous = i64::MIN;
        for offset in [0u64, 1, 10, 3600, 86_400] {
            let age = current_age(
                &headers,
                response_time,
                0,
                response_time + Duration::from_secs(offset),
            );
            assert!(age >= previous);
            previous = age;
        }
    }

    #[test]
    fn fresh_entry_goes_stale_after_lifetime() {
        let date = "Sun, 06 Nov 1994 08:49:37 GMT";
        let date_time = httpdate::parse_http_date(date).unwrap();
        let headers = headers(&[("date", date), ("cache-control", "max-age=60")]);

        assert!(is_fresh(&headers, date_time, 0, true, date_time));
        assert!(!is_fresh(
            &headers,
            date_time,
            0,
            true,
            date_time + Duration::from_secs(61),
        ));
    }
}
