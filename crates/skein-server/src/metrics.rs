//! Shuffle-server metrics.

use std::sync::LazyLock;

use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static RECEIVED_DATA_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "skein_server_received_bytes_total",
        "Block bytes accepted into buffers",
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

pub static REQUIRE_BUFFER_FAILED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "skein_server_require_buffer_failed_total",
        "Write batches rejected with NO_BUFFER",
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

pub static USED_MEMORY: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new("skein_server_used_memory_bytes", "Bytes held in buffers")
        .expect("valid metric");
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

pub static APP_NUMBER: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new("skein_server_app_number", "Live applications").expect("valid metric");
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

pub static READ_DATA_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "skein_server_read_bytes_total",
        "Block bytes served to readers",
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

/// Renders all metrics in the Prometheus text format.
pub fn render() -> String {
    TextEncoder::new()
        .encode_to_string(&REGISTRY.gather())
        .unwrap_or_default()
}
