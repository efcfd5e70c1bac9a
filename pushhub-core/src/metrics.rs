//! Prometheus metrics collection
//!
//! All metrics are registered in one registry and exposed via the /metrics endpoint.

use prometheus::{
    register_int_counter_vec_with_registry, register_int_counter_with_registry,
    register_int_gauge_with_registry, Encoder, IntCounter, IntCounterVec, IntGauge, Registry,
    TextEncoder,
};

/// Global metrics registry
pub static REGISTRY: std::sync::LazyLock<Registry> = std::sync::LazyLock::new(Registry::new);

/// Live stream connections on this instance
pub static ACTIVE_CONNECTIONS: std::sync::LazyLock<IntGauge> = std::sync::LazyLock::new(|| {
    register_int_gauge_with_registry!(
        "active_connections",
        "Current number of active stream connections",
        REGISTRY.clone()
    )
    .expect("Failed to register ACTIVE_CONNECTIONS")
});

/// Notifications handed to a connection's outbound queue
pub static NOTIFICATIONS_DELIVERED: std::sync::LazyLock<IntCounter> =
    std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "notifications_delivered_total",
            "Notifications queued for delivery to a connection",
            REGISTRY.clone()
        )
        .expect("Failed to register NOTIFICATIONS_DELIVERED")
    });

/// Notifications dropped because a connection's queue was full
pub static NOTIFICATIONS_DROPPED: std::sync::LazyLock<IntCounter> =
    std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "notifications_dropped_total",
            "Notifications dropped for lagging connections",
            REGISTRY.clone()
        )
        .expect("Failed to register NOTIFICATIONS_DROPPED")
    });

/// Broker traffic, labelled by direction ("published" / "received")
pub static BROKER_MESSAGES: std::sync::LazyLock<IntCounterVec> = std::sync::LazyLock::new(|| {
    register_int_counter_vec_with_registry!(
        "broker_messages_total",
        "Envelopes exchanged through the message broker",
        &["direction"],
        REGISTRY.clone()
    )
    .expect("Failed to register BROKER_MESSAGES")
});

/// Broker payloads that could not be decoded
pub static BROKER_DECODE_ERRORS: std::sync::LazyLock<IntCounter> =
    std::sync::LazyLock::new(|| {
        register_int_counter_with_registry!(
            "broker_decode_errors_total",
            "Malformed broker payloads that were discarded",
            REGISTRY.clone()
        )
        .expect("Failed to register BROKER_DECODE_ERRORS")
    });

/// Gather all metrics in Prometheus text format
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|_| prometheus::Error::Msg("Invalid UTF-8".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_touched_metrics() {
        ACTIVE_CONNECTIONS.inc();
        ACTIVE_CONNECTIONS.dec();
        BROKER_MESSAGES.with_label_values(&["published"]).inc();

        let output = gather_metrics().unwrap();
        assert!(output.contains("active_connections"));
        assert!(output.contains("broker_messages_total"));
    }
}
