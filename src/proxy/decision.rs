use http::header::{AUTHORIZATION, CACHE_CONTROL, EXPIRES, PRAGMA};
use http::{HeaderMap, Method, StatusCode};

use crate::proxy::directives::directive_map;

/// The cacheability verdict for one request, per RFC 7234 sections 3 and 4.
/// Trace reasons record which rule fired; they end up in the access log.
#[derive(Debug, Clone)]
pub struct Decision {
    pub can_serve: bool,
    pub can_store: bool,
    pub has_authorization: bool,
    pub must_revalidate: bool,
    pub trace: Vec<String>,
}

/// Status codes this proxy understands well enough to store.
const STORABLE_STATUS: [u16; 10] = [200, 203, 204, 300, 301, 404, 405, 410, 414, 501];

/// Status codes cacheable by default per RFC 7231 section 6.1. Note 206 is
/// listed here but excluded from `STORABLE_STATUS`; the stricter exclusion
/// wins and partial content is never stored.
const DEFAULT_CACHEABLE_STATUS: [u16; 11] =
    [200, 203, 204, 206, 300, 301, 404, 405, 410, 414, 501];

/// Evaluates the request-phase rules. The response-phase rules run once the
/// upstream status and headers are known.
pub fn request_phase(method: &Method, headers: &HeaderMap, shared: bool) -> Decision {
    let mut decision = Decision {
        can_serve: true,
        can_store: true,
        has_authorization: false,
        must_revalidate: false,
        trace: Vec::new(),
    };

    let cc = directive_map(headers, CACHE_CONTROL);

    if method != Method::GET && method != Method::HEAD {
        decision.can_store = false;
        decision.trace.push(format!("req:method={method}"));
    }

    if cc.contains_key("no-store") {
        decision.can_store = false;
        decision.trace.push("req:CC=NS".into());
    }

    if shared && headers.contains_key(AUTHORIZATION) {
        // The final verdict depends on the response's Cache-Control and is
        // taken in `response_phase`.
        decision.has_authorization = true;
    }

    let pragma = directive_map(headers, PRAGMA);
    if pragma.contains_key("no-cache") {
        decision.must_revalidate = true;
        decision.trace.push("req:P=NC".into());
    }
    if cc.contains_key("no-cache") {
        decision.must_revalidate = true;
        decision.trace.push("req:CC=NC".into());
    }

    decision
}

/// Applies the response-phase rules, narrowing `can_store` now that the
/// upstream status and headers are known.
pub fn response_phase(
    decision: &mut Decision,
    status: StatusCode,
    headers: &HeaderMap,
    shared: bool,
) {
    if !decision.can_store {
        return;
    }

    let cc = directive_map(headers, CACHE_CONTROL);

    if !STORABLE_STATUS.contains(&status.as_u16()) {
        decision.can_store = false;
        decision.trace.push(format!("resp:code={}", status.as_u16()));
    }

    if cc.contains_key("no-store") {
        decision.can_store = false;
        decision.trace.push("resp:CC=NS".into());
    }

    if shared && cc.contains_key("private") {
        decision.can_store = false;
        decision.trace.push("resp:CC=P".into());
    }

    if decision.has_authorization
        && !(cc.contains_key("must-revalidate")
            || cc.contains_key("public")
            || cc.contains_key("s-maxage"))
    {
        decision.can_store = false;
        decision.trace.push("resp:Auth".into());
    }

    let cacheable = headers.contains_key(EXPIRES)
        || cc.contains_key("max-age")
        || (shared && cc.contains_key("s-maxage"))
        || DEFAULT_CACHEABLE_STATUS.contains(&status.as_u16())
        || cc.contains_key("public");
    if !cacheable {
        decision.can_store = false;
        decision.trace.push("resp:default".into());
    }
}
