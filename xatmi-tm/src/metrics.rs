//! Prometheus metrics for the transaction manager.
//!
//! Gauges are refreshed from an [`AdminSnapshot`](crate::manager::AdminSnapshot)
//! on whatever cadence the embedder scrapes; counters are bumped by the
//! embedder as decisions land.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

use crate::manager::AdminSnapshot;

/// Metric family for one manager process.
pub struct ManagerMetrics {
    registry: Registry,
    transactions_active: IntGauge,
    transactions_committed: IntCounter,
    transactions_rolled_back: IntCounter,
    transactions_in_doubt: IntGauge,
    instances_connected: IntGauge,
}

impl ManagerMetrics {
    /// Creates and registers the metric family.
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let transactions_active = IntGauge::new(
            "xatmi_transactions_active",
            "Transactions currently in flight",
        )?;
        let transactions_committed = IntCounter::new(
            "xatmi_transactions_committed_total",
            "Transactions decided committed",
        )?;
        let transactions_rolled_back = IntCounter::new(
            "xatmi_transactions_rolled_back_total",
            "Transactions decided rolled back",
        )?;
        let transactions_in_doubt = IntGauge::new(
            "xatmi_transactions_in_doubt",
            "Logged transactions whose outcome is not fully acknowledged",
        )?;
        let instances_connected = IntGauge::new(
            "xatmi_resource_instances_connected",
            "Resource proxy instances currently serving",
        )?;

        registry.register(Box::new(transactions_active.clone()))?;
        registry.register(Box::new(transactions_committed.clone()))?;
        registry.register(Box::new(transactions_rolled_back.clone()))?;
        registry.register(Box::new(transactions_in_doubt.clone()))?;
        registry.register(Box::new(instances_connected.clone()))?;

        Ok(Self {
            registry,
            transactions_active,
            transactions_committed,
            transactions_rolled_back,
            transactions_in_doubt,
            instances_connected,
        })
    }

    /// The registry the family is registered in.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Refreshes the gauges from a manager snapshot.
    pub fn observe(&self, snapshot: &AdminSnapshot) {
        self.transactions_active
            .set(snapshot.transactions.len() as i64);
        self.transactions_in_doubt.set(snapshot.in_doubt as i64);
        let connected = snapshot
            .resources
            .iter()
            .flat_map(|r| r.instances.iter())
            .filter(|i| i.state == "Idle" || i.state == "Busy")
            .count();
        self.instances_connected.set(connected as i64);
    }

    /// Counts one committed decision.
    pub fn committed(&self) {
        self.transactions_committed.inc();
    }

    /// Counts one rollback decision.
    pub fn rolled_back(&self) {
        self.transactions_rolled_back.inc();
    }

    /// Renders the family in the Prometheus text exposition format.
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
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
    fn test_metrics_register_and_render() {
        let metrics = ManagerMetrics::new().unwrap();
        metrics.committed();
        metrics.committed();
        metrics.rolled_back();

        let text = metrics.gather();
        assert!(text.contains("xatmi_transactions_committed_total 2"));
        assert!(text.contains("xatmi_transactions_rolled_back_total 1"));
    }

    #[test]
    fn test_observe_snapshot() {
        let metrics = ManagerMetrics::new().unwrap();
        let snapshot = AdminSnapshot {
            transactions: Vec::new(),
            resources: Vec::new(),
            in_doubt: 3,
        };
        metrics.observe(&snapshot);

        assert!(metrics.gather().contains("xatmi_transactions_in_doubt 3"));
    }
}
