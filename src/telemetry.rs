use opentelemetry::{
    global,
    metrics::{Counter, Histogram, MeterProvider},
    KeyValue,
};
use prometheus::Registry;

/// Upper bounds (ms) of the inference latency buckets. A CPU forward pass on
/// the 71x71 input takes tens of ms, a Grad-CAM pass a few hundred.
const INFERENCE_BOUNDARIES_MS: [f64; 12] = [
    5.0, 10.0, 25.0, 50.0, 75.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
];

pub struct Metrics {
    request_counter: Counter<u64>,
    error_counter: Counter<u64>,
    inference_duration: Histogram<u64>,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();
        let exporter = opentelemetry_prometheus::exporter()
            .with_registry(registry.clone())
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build prometheus exporter: {}", e))?;

        let provider = opentelemetry_sdk::metrics::SdkMeterProvider::builder()
            .with_reader(exporter)
            .build();

        let meter = provider.meter("lesion_prediction");
        global::set_meter_provider(provider);

        let request_counter = meter
            .u64_counter("requests_total")
            .with_description("Total number of prediction and explanation requests")
            .build();

        let error_counter = meter
            .u64_counter("request_errors_total")
            .with_description("Requests answered with an error payload")
            .build();

        let inference_duration = meter
            .u64_histogram("inference_duration_ms")
            .with_boundaries(INFERENCE_BOUNDARIES_MS.to_vec())
            .with_description("Duration of engine calls in milliseconds")
            .build();

        Ok(Metrics {
            request_counter,
            error_counter,
            inference_duration,
            registry,
        })
    }

    pub fn record_request(&self, route: &str) {
        let attributes = [KeyValue::new("route", route.to_string())];
        self.request_counter.add(1, &attributes);
    }

    pub fn record_error(&self, route: &str, kind: &'static str) {
        let attributes = [
            KeyValue::new("route", route.to_string()),
            KeyValue::new("kind", kind),
        ];
        self.error_counter.add(1, &attributes);
    }

    pub fn record_inference_duration(&self, duration_ms: u64, route: &str) {
        let attributes = [KeyValue::new("route", route.to_string())];
        self.inference_duration.record(duration_ms, &attributes);
    }
}
