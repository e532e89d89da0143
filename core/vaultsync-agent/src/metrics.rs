//! Prometheus metrics for the agent.

use std::time::{SystemTime, UNIX_EPOCH};

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

/// Counters and gauges describing server communication health.
pub struct AgentMetrics {
    registry: Registry,
    requests: IntCounter,
    consecutive_failures: IntGauge,
    last_success: IntGauge,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> AgentMetrics {
        let registry = Registry::new();

        let requests = IntCounter::new(
            "vaultsync_server_requests_total",
            "Total requests made to the secrets server",
        )
        .expect("valid metric definition");
        let consecutive_failures = IntGauge::new(
            "vaultsync_server_consecutive_failures",
            "Consecutive failed requests to the secrets server",
        )
        .expect("valid metric definition");
        let last_success = IntGauge::new(
            "vaultsync_server_last_success_timestamp_seconds",
            "Unix time of the last successful server response",
        )
        .expect("valid metric definition");

        registry
            .register(Box::new(requests.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(consecutive_failures.clone()))
            .expect("metric registration");
        registry
            .register(Box::new(last_success.clone()))
            .expect("metric registration");

        AgentMetrics {
            registry,
            requests,
            consecutive_failures,
            last_success,
        }
    }

    pub fn mark_request(&self) {
        self.requests.inc();
    }

    pub fn mark_success(&self) {
        self.consecutive_failures.set(0);
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        self.last_success.set(now);
    }

    pub fn mark_failure(&self) {
        self.consecutive_failures.inc();
    }

    pub fn consecutive_failures(&self) -> i64 {
        self.consecutive_failures.get()
    }

    /// Renders the registry in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_resets_failure_streak() {
        let metrics = AgentMetrics::new();
        metrics.mark_failure();
        metrics.mark_failure();
        assert_eq!(metrics.consecutive_failures(), 2);

        metrics.mark_success();
        assert_eq!(metrics.consecutive_failures(), 0);
    }

    #[test]
    fn encode_includes_metric_names() {
        let metrics = AgentMetrics::new();
        metrics.mark_request();
        let text = metrics.encode();
        assert!(text.contains("vaultsync_server_requests_total"));
    }
}
