use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter},
    KeyValue,
};
use serde::Serialize;
use std::sync::LazyLock;
use tracing::debug;

#[derive(Serialize, Debug)]
pub struct AttentionCallMetrics {
    pub backend: &'static str,
    pub num_sequences: usize,
    pub num_heads: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub num_tokens: usize,
    pub num_blocks: usize,
    pub block_size: usize,
    pub max_context_len: usize,
    pub softmax_scale: f32,
    pub is_multi_token_forward: bool,
}

#[derive(Serialize, Debug)]
pub struct CacheUpdateMetrics {
    pub num_tokens: usize,
    pub num_kv_heads: usize,
    pub head_dim: usize,
    pub block_size: usize,
}

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("kvserve_paged_attention"));

static ATTENTION_CALLS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("attention_calls")
        .with_description("Number of backend attention forward calls")
        .with_unit("calls")
        .build()
});

static ATTENTION_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("attention_duration_ms")
        .with_description("Duration of backend attention forward calls")
        .with_unit("ms")
        .build()
});

static CACHE_UPDATE_CALLS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("cache_update_calls")
        .with_description("Number of KV cache write operations")
        .with_unit("calls")
        .build()
});

static TILING_UPLOADS: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("tiling_uploads")
        .with_description("Number of slice tilings copied to a device")
        .with_unit("uploads")
        .build()
});

pub fn record_attention_call(metrics: &AttentionCallMetrics) {
    let attributes = vec![
        KeyValue::new("backend", metrics.backend),
        KeyValue::new("num_sequences", metrics.num_sequences as i64),
        KeyValue::new("num_heads", metrics.num_heads as i64),
        KeyValue::new("multi_token", metrics.is_multi_token_forward),
    ];

    ATTENTION_CALLS.add(1, &attributes);

    debug!(
        target: "attention_metrics",
        "{}",
        serde_json::to_string(metrics).unwrap_or_default()
    );
}

pub fn record_attention_duration(backend: &'static str, duration_ms: f64) {
    let attributes = vec![KeyValue::new("backend", backend)];
    ATTENTION_DURATION.record(duration_ms, &attributes);
}

pub fn record_cache_update(metrics: &CacheUpdateMetrics) {
    let attributes = vec![
        KeyValue::new("num_tokens", metrics.num_tokens as i64),
        KeyValue::new("num_kv_heads", metrics.num_kv_heads as i64),
    ];

    CACHE_UPDATE_CALLS.add(1, &attributes);

    debug!(
        target: "cache_update_metrics",
        "{}",
        serde_json::to_string(metrics).unwrap_or_default()
    );
}

pub fn record_tiling_upload(rank: usize, size_bytes: u64) {
    TILING_UPLOADS.add(1, &[KeyValue::new("rank", rank as i64)]);

    debug!(
        target: "tiling_metrics",
        "{}",
        serde_json::json!({
            "rank": rank,
            "size_bytes": size_bytes
        })
    );
}
