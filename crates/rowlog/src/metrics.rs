use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// Prometheus metrics for a row log processor.
pub struct RowLogMetrics {
    /// 1 while this processor holds leadership, 0 otherwise.
    pub leader: IntGauge,
    /// Number of running subscription workers.
    pub workers: IntGauge,
    /// Number of shard scans performed.
    pub scans: IntCounter,
    /// Number of messages returned by shard scans.
    pub scanned_messages: IntCounter,
    /// Number of messages marked done for a subscription.
    pub delivered: IntCounter,
    /// Number of failed delivery attempts.
    pub failed_attempts: IntCounter,
    /// Number of messages escalated to a problematic set.
    pub problematic: IntCounter,
    /// Number of wake-up signals received.
    pub wakeups: IntCounter,
}

impl RowLogMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let leader = IntGauge::with_opts(Opts::new(
            "rowlog_processor_leader",
            "Whether this processor is the row log leader",
        ))?;
        let workers = IntGauge::with_opts(Opts::new(
            "rowlog_workers",
            "Number of running subscription workers",
        ))?;
        let scans = IntCounter::with_opts(Opts::new(
            "rowlog_scans_total",
            "Number of shard scans performed",
        ))?;
        let scanned_messages = IntCounter::with_opts(Opts::new(
            "rowlog_scanned_messages_total",
            "Number of messages returned by shard scans",
        ))?;
        let delivered = IntCounter::with_opts(Opts::new(
            "rowlog_delivered_total",
            "Number of messages marked done for a subscription",
        ))?;
        let failed_attempts = IntCounter::with_opts(Opts::new(
            "rowlog_failed_attempts_total",
            "Number of failed delivery attempts",
        ))?;
        let problematic = IntCounter::with_opts(Opts::new(
            "rowlog_problematic_total",
            "Number of messages escalated to a problematic set",
        ))?;
        let wakeups = IntCounter::with_opts(Opts::new(
            "rowlog_wakeups_total",
            "Number of wake-up signals received",
        ))?;

        registry.register(Box::new(leader.clone()))?;
        registry.register(Box::new(workers.clone()))?;
        registry.register(Box::new(scans.clone()))?;
        registry.register(Box::new(scanned_messages.clone()))?;
        registry.register(Box::new(delivered.clone()))?;
        registry.register(Box::new(failed_attempts.clone()))?;
        registry.register(Box::new(problematic.clone()))?;
        registry.register(Box::new(wakeups.clone()))?;

        Ok(Self {
            leader,
            workers,
            scans,
            scanned_messages,
            delivered,
            failed_attempts,
            problematic,
            wakeups,
        })
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self {
            leader: IntGauge::new("rowlog_processor_leader", "leader").expect("valid metric name"),
            workers: IntGauge::new("rowlog_workers", "workers").expect("valid metric name"),
            scans: IntCounter::new("rowlog_scans_total", "scans").expect("valid metric name"),
            scanned_messages: IntCounter::new("rowlog_scanned_messages_total", "scanned")
                .expect("valid metric name"),
            delivered: IntCounter::new("rowlog_delivered_total", "delivered")
                .expect("valid metric name"),
            failed_attempts: IntCounter::new("rowlog_failed_attempts_total", "failed")
                .expect("valid metric name"),
            problematic: IntCounter::new("rowlog_problematic_total", "problematic")
                .expect("valid metric name"),
            wakeups: IntCounter::new("rowlog_wakeups_total", "wakeups")
                .expect("valid metric name"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_metrics_work() {
        let m = RowLogMetrics::unregistered();
        m.workers.set(2);
        m.delivered.inc();
        assert_eq!(m.workers.get(), 2);
        assert_eq!(m.delivered.get(), 1);
    }

    #[test]
    fn registered_metrics_work() {
        let r = Registry::new();
        let m = RowLogMetrics::new(&r).unwrap();
        m.leader.set(1);
        assert_eq!(m.leader.get(), 1);
        assert!(r
            .gather()
            .iter()
            .any(|family| family.get_name() == "rowlog_processor_leader"));
    }

    #[test]
    fn double_registration_fails() {
        let r = Registry::new();
        RowLogMetrics::new(&r).unwrap();
        assert!(RowLogMetrics::new(&r).is_err());
    }
}
