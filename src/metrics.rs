use http::StatusCode;
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder, opts, register_int_counter_vec_with_registry,
    register_int_counter_with_registry, register_int_gauge_with_registry,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        opts!("cachet_requests_total", "Handled proxy requests"),
        &["method", "status", "cache_result"],
        REGISTRY
    )
    .expect("register cachet_requests_total")
});

static CACHE_LOOKUPS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec_with_registry!(
        opts!("cachet_cache_lookups_total", "Cache lookups by outcome"),
        &["outcome"],
        REGISTRY
    )
    .expect("register cachet_cache_lookups_total")
});

static CACHE_STORES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter_with_registry!(
        opts!("cachet_cache_stores_total", "Response bodies committed to the cache"),
        REGISTRY
    )
    .expect("register cachet_cache_stores_total")
});

static CACHE_EVICTIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter_with_registry!(
        opts!("cachet_cache_evictions_total", "Blobs removed by the eviction loop"),
        REGISTRY
    )
    .expect("register cachet_cache_evictions_total")
});

static REVALIDATIONS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter_with_registry!(
        opts!("cachet_revalidations_total", "Conditional upstream revalidations"),
        REGISTRY
    )
    .expect("register cachet_revalidations_total")
});

static CACHE_BYTES: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge_with_registry!(
        opts!("cachet_cache_bytes", "Accounted bytes in the content store"),
        REGISTRY
    )
    .expect("register cachet_cache_bytes")
});

pub fn record_request(method: &str, status: StatusCode, cache_result: &str) {
    REQUESTS
        .with_label_values(&[method, status.as_str(), cache_result])
        .inc();
}

pub fn record_cache_lookup(hit: bool) {
    let outcome = if hit { "hit" } else { "miss" };
    CACHE_LOOKUPS.with_label_values(&[outcome]).inc();
}

pub fn record_cache_store() {
    CACHE_STORES.inc();
}

pub fn record_cache_eviction() {
    CACHE_EVICTIONS.inc();
}

pub fn record_revalidation() {
    REVALIDATIONS.inc();
}

pub fn set_cache_bytes(bytes: i64) {
    CACHE_BYTES.set(bytes);
}

/// Renders the registry in the Prometheus text exposition format.
pub fn render() -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&REGISTRY.gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}
