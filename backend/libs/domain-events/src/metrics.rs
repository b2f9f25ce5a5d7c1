use prometheus::{IntCounter, Opts};
use tracing::warn;

/// Counters for the outbound producer and the inbound subscriber.
#[derive(Clone)]
pub struct PipelineMetrics {
    pub enqueued: IntCounter,
    pub dropped: IntCounter,
    pub delivery_failed: IntCounter,
    pub decode_errors: IntCounter,
    pub handler_errors: IntCounter,
}

impl PipelineMetrics {
    pub fn new(service: &str) -> Self {
        let registry = prometheus::default_registry();

        let enqueued = counter(
            service,
            "domain_events_enqueued_total",
            "Total number of envelopes accepted into the producer buffer",
        );
        let dropped = counter(
            service,
            "domain_events_dropped_total",
            "Total number of envelopes dropped on a full buffer or at shutdown",
        );
        let delivery_failed = counter(
            service,
            "domain_events_delivery_failed_total",
            "Total number of envelopes the broker rejected after retries",
        );
        let decode_errors = counter(
            service,
            "domain_events_decode_errors_total",
            "Total number of consumed messages that failed to decode",
        );
        let handler_errors = counter(
            service,
            "domain_events_handler_errors_total",
            "Total number of handler invocations that failed or panicked",
        );

        for metric in [
            Box::new(enqueued.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(dropped.clone()),
            Box::new(delivery_failed.clone()),
            Box::new(decode_errors.clone()),
            Box::new(handler_errors.clone()),
        ] {
            if let Err(e) = registry.register(metric) {
                warn!("Failed to register domain event metric: {}", e);
            }
        }

        Self {
            enqueued,
            dropped,
            delivery_failed,
            decode_errors,
            handler_errors,
        }
    }
}

fn counter(service: &str, name: &str, help: &str) -> IntCounter {
    IntCounter::with_opts(Opts::new(name, help).const_label("service", service.to_string()))
        .expect("valid metric opts for domain event counter")
}
