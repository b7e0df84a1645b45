//! Coordinator metrics.

use std::sync::LazyLock;

use prometheus::{IntCounter, IntGauge, Registry, TextEncoder};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static LIVE_SERVERS: LazyLock<IntGauge> = LazyLock::new(|| {
    let gauge = IntGauge::new("skein_coordinator_live_servers", "Live shuffle servers")
        .expect("valid metric");
    REGISTRY.register(Box::new(gauge.clone())).ok();
    gauge
});

pub static ACCESS_DENIED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "skein_coordinator_access_denied_total",
        "Applications denied by the access pipeline",
    )
    .expect("valid metric");
    REGISTRY.register(Box::new(counter.clone())).ok();
    counter
});

pub static ASSIGNMENTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    let counter = IntCounter::new(
        "skein_coordinator_assignments_total",
        "Shuffle assignment requests served",
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_render_in_text_format() {
        LIVE_SERVERS.set(3);
        ACCESS_DENIED_TOTAL.inc();
        let text = render();
        assert!(text.contains("skein_coordinator_live_servers"));
    }
}
