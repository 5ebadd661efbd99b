use std::time::Instant;

use http::{Method, StatusCode};
use once_cell::sync::Lazy;

static STARTED: Lazy<Instant> = Lazy::new(Instant::now);

pub(super) struct AdminResponse {
    pub status: StatusCode,
    pub content_type: &'static str,
    pub body: String,
}

/// Routes requests addressed to the proxy itself. A plain status page and
/// the metrics exposition; everything else is a 404.
pub(super) fn route(method: &Method, path: &str, proxy_name: &str) -> AdminResponse {
    if method != Method::GET && method != Method::HEAD {
        return AdminResponse {
            status: StatusCode::METHOD_NOT_ALLOWED,
            content_type: "text/plain; charset=utf-8",
            body: "method not allowed\n".to_string(),
        };
    }

    let path = path.split('?').next().unwrap_or(path);
    match path {
        "/" | "/index" => AdminResponse {
            status: StatusCode::OK,
            content_type: "text/html; charset=utf-8",
            body: status_page(proxy_name),
        },
        "/metrics" => AdminResponse {
            status: StatusCode::OK,
            content_type: "text/plain; version=0.0.4",
            body: crate::metrics::render(),
        },
        _ => AdminResponse {
            status: StatusCode::NOT_FOUND,
            content_type: "text/plain; charset=utf-8",
            body: "not found\n".to_string(),
        },
    }
}

fn status_page(proxy_name: &str) -> String {
    let uptime = STARTED.elapsed().as_secs();
    format!(
        "<!DOCTYPE html>\n<html>\n<head><title>cachet</title></head>\n<body>\n\
         <h1>cachet</h1>\n\
         <p>proxy name: {proxy_name}</p>\n\
         <p>uptime: {uptime}s</p>\n\
         <p><a href=\"/metrics\">metrics</a></p>\n\
         </body>\n</html>\n"
    )
}

/// True when a request addresses the proxy itself rather than an origin.
pub(super) fn is_admin_target(host: Option<&str>, proxy_name: &str) -> bool {
    match host {
        None => true,
        Some(host) => host.eq_ignore_ascii_case(proxy_name),
    }
}
