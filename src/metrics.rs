//! Process-wide telemetry counters exposed on the internal listener.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub probes_total: IntCounter,
    pub probe_failures_total: IntCounter,
    pub index_entries: IntGauge,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();
        let probes_total = IntCounter::new(
            "snapfleet_probes_total",
            "Probe results consumed by the collector",
        )
        .expect("probes_total");
        let probe_failures_total = IntCounter::new(
            "snapfleet_probe_failures_total",
            "Probe results that carried an error",
        )
        .expect("probe_failures_total");
        let index_entries = IntGauge::new(
            "snapfleet_index_entries",
            "Snapshot entries currently held in the index",
        )
        .expect("index_entries");

        registry
            .register(Box::new(probes_total.clone()))
            .expect("register probes_total");
        registry
            .register(Box::new(probe_failures_total.clone()))
            .expect("register probe_failures_total");
        registry
            .register(Box::new(index_entries.clone()))
            .expect("register index_entries");

        Metrics {
            registry,
            probes_total,
            probe_failures_total,
            index_entries,
        }
    }

    /// Renders the registry in the Prometheus text format.
    pub fn render(&self) -> String {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics::new()
    }
}
