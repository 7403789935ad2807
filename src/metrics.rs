use anyhow::Result;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::thread;

/// Relay counters. Clones share the same underlying values, so a single set
/// can be handed to every connection.
#[derive(Clone)]
pub struct RelayMetrics {
    pub connections: IntGauge,
    pub disconnects: IntCounter,
    pub messages_sent: IntCounter,
    pub bytes_sent: IntCounter,
    pub throttled_sends: IntCounter,
    pub duplicates_suppressed: IntCounter,
    pub messages_dropped: IntCounter,
}

impl RelayMetrics {
    fn build() -> prometheus::Result<Self> {
        // Prefix metrics with `relay_` for namespacing.
        Ok(Self {
            connections: IntGauge::new("relay_connections", "Live relay connections")?,
            disconnects: IntCounter::new("relay_disconnects_total", "Disconnect diagnostics printed")?,
            messages_sent: IntCounter::new("relay_messages_sent_total", "Outbound messages fully sent")?,
            bytes_sent: IntCounter::new("relay_bytes_sent_total", "Outbound payload bytes sent")?,
            throttled_sends: IntCounter::new(
                "relay_throttled_sends_total",
                "Send cycles delayed by the initial outbound throttle",
            )?,
            duplicates_suppressed: IntCounter::new(
                "relay_duplicates_suppressed_total",
                "Payloads not relayed because they were already seen",
            )?,
            messages_dropped: IntCounter::new(
                "relay_messages_dropped_total",
                "Messages discarded because the connection was shutting down",
            )?,
        })
    }

    pub fn register(registry: &Registry) -> Result<Self> {
        let m = Self::build()?;
        registry.register(Box::new(m.connections.clone()))?;
        registry.register(Box::new(m.disconnects.clone()))?;
        registry.register(Box::new(m.messages_sent.clone()))?;
        registry.register(Box::new(m.bytes_sent.clone()))?;
        registry.register(Box::new(m.throttled_sends.clone()))?;
        registry.register(Box::new(m.duplicates_suppressed.clone()))?;
        registry.register(Box::new(m.messages_dropped.clone()))?;
        Ok(m)
    }
}

impl Default for RelayMetrics {
    /// Unregistered metrics, for connections nobody scrapes.
    fn default() -> Self {
        Self::build().expect("static metric descriptors are valid")
    }
}

pub fn serve(cfg: crate::config::Metrics, registry: Registry) -> Result<()> {
    let bind_addr = cfg.bind.clone();
    let server = tiny_http::Server::http(&bind_addr)
        .map_err(|e| anyhow::anyhow!("could not start metrics server on {}: {}", bind_addr, e))?;
    let content_type: tiny_http::Header = "Content-Type: text/plain; version=0.0.4; charset=utf-8"
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid metrics content type header"))?;

    thread::Builder::new().name("relay-metrics".into()).spawn(move || {
        for request in server.incoming_requests() {
            let mut buffer = vec![];
            let encoder = TextEncoder::new();
            let metric_families = registry.gather();
            if encoder.encode(&metric_families, &mut buffer).is_err() {
                eprintln!("🔥 Could not encode metrics");
                continue;
            }

            let response = tiny_http::Response::from_data(buffer).with_header(content_type.clone());
            let _ = request.respond(response);
        }
    })?;

    Ok(())
}
