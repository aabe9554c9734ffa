use prometheus::{
    Encoder, GaugeVec, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub dispatch_attempts_total: IntCounterVec,
    pub dispatch_latency_seconds: HistogramVec,
    pub orders_in_queue: IntGauge,
    pub offers_total: IntCounterVec,
    pub order_transitions_total: IntCounterVec,
    pub ws_sessions: IntGauge,
    pub rider_utilization: GaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let dispatch_attempts_total = IntCounterVec::new(
            Opts::new("dispatch_attempts_total", "Dispatch attempts by outcome"),
            &["outcome"],
        )
        .expect("valid dispatch_attempts_total metric");

        let dispatch_latency_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "dispatch_latency_seconds",
                "Latency of a dispatch attempt in seconds",
            ),
            &["outcome"],
        )
        .expect("valid dispatch_latency_seconds metric");

        let orders_in_queue = IntGauge::new("orders_in_queue", "Orders waiting for dispatch")
            .expect("valid orders_in_queue metric");

        let offers_total = IntCounterVec::new(
            Opts::new("offers_total", "Resolved assignment offers by outcome"),
            &["outcome"],
        )
        .expect("valid offers_total metric");

        let order_transitions_total = IntCounterVec::new(
            Opts::new("order_transitions_total", "Committed order transitions by target status"),
            &["status"],
        )
        .expect("valid order_transitions_total metric");

        let ws_sessions = IntGauge::new("ws_sessions", "Open device channel sessions")
            .expect("valid ws_sessions metric");

        let rider_utilization = GaugeVec::new(
            Opts::new("rider_utilization", "Rider utilization ratio [0..1]"),
            &["rider_id"],
        )
        .expect("valid rider_utilization metric");

        registry
            .register(Box::new(dispatch_attempts_total.clone()))
            .expect("register dispatch_attempts_total");
        registry
            .register(Box::new(dispatch_latency_seconds.clone()))
            .expect("register dispatch_latency_seconds");
        registry
            .register(Box::new(orders_in_queue.clone()))
            .expect("register orders_in_queue");
        registry
            .register(Box::new(offers_total.clone()))
            .expect("register offers_total");
        registry
            .register(Box::new(order_transitions_total.clone()))
            .expect("register order_transitions_total");
        registry
            .register(Box::new(ws_sessions.clone()))
            .expect("register ws_sessions");
        registry
            .register(Box::new(rider_utilization.clone()))
            .expect("register rider_utilization");

        Self {
            registry,
            dispatch_attempts_total,
            dispatch_latency_seconds,
            orders_in_queue,
            offers_total,
            order_transitions_total,
            ws_sessions,
            rider_utilization,
        }
    }

    pub fn encode(&self) -> Result<String, String> {
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        TextEncoder::new()
            .encode(&metric_families, &mut buffer)
            .map_err(|err| format!("failed to encode metrics: {err}"))?;

        String::from_utf8(buffer).map_err(|err| format!("metrics are not valid utf8: {err}"))
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
