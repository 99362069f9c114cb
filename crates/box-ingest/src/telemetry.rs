use crate::config::LogFormat;
use axum::{http::StatusCode, response::IntoResponse};
use once_cell::sync::Lazy;
use prometheus::{opts, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Registry, TextEncoder};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);
pub static HTTP_REQUESTS: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("http_requests_total", "HTTP request count"), &["method", "path", "status"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static UPLOAD_BYTES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("upload_bytes_total", "Bytes received by completed upload requests").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static UPLOAD_OUTCOMES: Lazy<IntCounterVec> = Lazy::new(|| {
    let c = IntCounterVec::new(opts!("upload_outcomes_total", "Upload request outcomes"), &["outcome"]).unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});
pub static UPLOAD_DURATION: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(HistogramOpts::new("upload_duration_seconds", "Upload request duration")
        .buckets(vec![0.05, 0.25, 1.0, 5.0, 30.0, 120.0, 600.0])).unwrap();
    REGISTRY.register(Box::new(h.clone())).ok();
    h
});
pub static UPLOADS_IN_PROGRESS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("uploads_in_progress", "Upload requests currently being handled").unwrap();
    REGISTRY.register(Box::new(g.clone())).ok();
    g
});
pub static CHUNK_MERGES: Lazy<IntCounter> = Lazy::new(|| {
    let c = IntCounter::new("chunk_merges_total", "Chunk sets merged into a staged artifact").unwrap();
    REGISTRY.register(Box::new(c.clone())).ok();
    c
});

/// `RUST_LOG` wins over the default `info` filter.
pub fn init_tracing(format: LogFormat) {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let base = fmt::layer().with_target(false);
    match format {
        LogFormat::Json => { tracing_subscriber::registry().with(env).with(base.json()).try_init().ok(); }
        LogFormat::Compact => { tracing_subscriber::registry().with(env).with(base.compact()).try_init().ok(); }
    }
}

/// Collapse upload target segments so the path label stays low-cardinality.
pub fn normalize_path(path: &str) -> String {
    let segs: Vec<&str> = path.trim_matches('/').split('/').collect();
    if segs.first() != Some(&"api") || segs.get(1) != Some(&"organization") { return path.to_string(); }
    let mut out = String::new();
    for (i, seg) in segs.iter().enumerate() {
        out.push('/');
        // names sit at indices 2, 4, 6, 8 and 10: organization/<x>/box/<x>/...
        if i >= 2 && i % 2 == 0 && i <= 10 { out.push_str(":param"); } else { out.push_str(seg); }
    }
    out
}

pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&metric_families, &mut buf).is_err() { return StatusCode::INTERNAL_SERVER_ERROR.into_response(); }
    ([("Content-Type", "text/plain; version=0.0.4")], buf).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upload_paths_are_normalized() {
        assert_eq!(
            normalize_path("/api/organization/acme/box/ubuntu/version/1.0.0/provider/virtualbox/architecture/amd64/file/upload"),
            "/api/organization/:param/box/:param/version/:param/provider/:param/architecture/:param/file/upload"
        );
        assert_eq!(normalize_path("/metrics"), "/metrics");
    }
}
