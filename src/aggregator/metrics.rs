use prometheus::{IntCounter, IntGauge, Registry};

/// Ambient observability for the aggregator, in the same shape the teacher
/// wires up a private `prometheus::Registry` per component.
pub struct Metrics {
    registry: Registry,

    pub results_received_total: IntCounter,
    pub results_failed_total: IntCounter,
    pub duplicates_rejected_total: IntCounter,
    pub forbidden_rejections_total: IntCounter,
    pub expected_count: IntGauge,
    pub received_count: IntGauge,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let results_received_total = IntCounter::new(
            "aggregator_results_received_total",
            "Total number of results successfully persisted",
        )
        .expect("metric creation failed");
        let results_failed_total = IntCounter::new(
            "aggregator_results_failed_total",
            "Total number of persistence failures recorded in the failed map",
        )
        .expect("metric creation failed");
        let duplicates_rejected_total = IntCounter::new(
            "aggregator_duplicates_rejected_total",
            "Total number of duplicate PUTs rejected with 409",
        )
        .expect("metric creation failed");
        let forbidden_rejections_total = IntCounter::new(
            "aggregator_forbidden_rejections_total",
            "Total number of PUT/POST for keys outside the expected set",
        )
        .expect("metric creation failed");
        let expected_count = IntGauge::new(
            "aggregator_expected_count",
            "Number of entries in the expected-result registry",
        )
        .expect("metric creation failed");
        let received_count = IntGauge::new(
            "aggregator_received_count",
            "Number of expected keys with a persisted result",
        )
        .expect("metric creation failed");

        registry
            .register(Box::new(results_received_total.clone()))
            .unwrap();
        registry
            .register(Box::new(results_failed_total.clone()))
            .unwrap();
        registry
            .register(Box::new(duplicates_rejected_total.clone()))
            .unwrap();
        registry
            .register(Box::new(forbidden_rejections_total.clone()))
            .unwrap();
        registry.register(Box::new(expected_count.clone())).unwrap();
        registry.register(Box::new(received_count.clone())).unwrap();

        Self {
            registry,
            results_received_total,
            results_failed_total,
            duplicates_rejected_total,
            forbidden_rejections_total,
            expected_count,
            received_count,
        }
    }

    pub fn record_received(&self) {
        self.results_received_total.inc();
        self.received_count.inc();
    }

    pub fn record_failed(&self) {
        self.results_failed_total.inc();
    }

    pub fn record_duplicate(&self) {
        self.duplicates_rejected_total.inc();
    }

    pub fn record_forbidden(&self) {
        self.forbidden_rejections_total.inc();
    }

    pub fn set_expected_count(&self, n: i64) {
        self.expected_count.set(n);
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}
