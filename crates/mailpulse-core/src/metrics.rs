//! Prometheus metrics for watchers and the publisher

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::OnceLock;
use tracing::warn;

/// Process-wide metric handles
pub struct Metrics {
    pub registry: Registry,
    pub events_emitted: IntCounterVec,
    pub watcher_errors: IntCounterVec,
    pub active_watchers: IntGauge,
    pub events_published: IntCounter,
    pub events_degraded: IntCounter,
    pub publish_failures: IntCounter,
}

impl Metrics {
    fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("mailpulse".to_string()), None)?;

        let events_emitted = IntCounterVec::new(
            Opts::new("events_emitted_total", "Change events emitted by watchers"),
            &["kind"],
        )?;
        let watcher_errors = IntCounterVec::new(
            Opts::new("watcher_errors_total", "Failed watcher cycles"),
            &["code"],
        )?;
        let active_watchers = IntGauge::new("active_watchers", "Running account watchers")?;
        let events_published =
            IntCounter::new("events_published_total", "Events written to the bus")?;
        let events_degraded = IntCounter::new(
            "events_degraded_total",
            "Queued events replaced by a refresh because the queue was full",
        )?;
        let publish_failures =
            IntCounter::new("publish_failures_total", "Bus batches rolled back")?;

        registry.register(Box::new(events_emitted.clone()))?;
        registry.register(Box::new(watcher_errors.clone()))?;
        registry.register(Box::new(active_watchers.clone()))?;
        registry.register(Box::new(events_published.clone()))?;
        registry.register(Box::new(events_degraded.clone()))?;
        registry.register(Box::new(publish_failures.clone()))?;

        Ok(Self {
            registry,
            events_emitted,
            watcher_errors,
            active_watchers,
            events_published,
            events_degraded,
            publish_failures,
        })
    }

    /// Render all metrics in the text exposition format
    pub fn render(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        match encoder.encode_to_string(&self.registry.gather()) {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode metrics: {}", e);
                String::new()
            }
        }
    }
}

/// Global metrics, or `None` if registration failed
pub fn metrics() -> Option<&'static Metrics> {
    static METRICS: OnceLock<Option<Metrics>> = OnceLock::new();
    METRICS
        .get_or_init(|| match Metrics::new() {
            Ok(m) => Some(m),
            Err(e) => {
                warn!("Metrics disabled: {}", e);
                None
            }
        })
        .as_ref()
}
