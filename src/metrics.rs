use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters, injected as an explicit `Arc<Metrics>` rather
/// than resolved by name, so tests can give each case an isolated
/// registry (spec §9 "Global state"). Prometheus wiring itself is an
/// external collaborator (spec §1); this is just the counter storage it
/// would scrape.
#[derive(Debug, Default)]
pub struct Metrics {
    pub segments_flushed: AtomicU64,
    pub segments_committed: AtomicU64,
    pub failed_segments: AtomicU64,
    pub claims_attempted: AtomicU64,
    pub claims_empty: AtomicU64,
    pub consumer_errors: AtomicU64,
    pub compactions_retain: AtomicU64,
    pub compactions_overlap: AtomicU64,
    pub compactions_sequential: AtomicU64,
    pub compactions_purge: AtomicU64,
    pub compaction_failures: AtomicU64,
    pub replication_ingress: AtomicU64,
    pub replication_egress: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_start_at_zero_and_increment_independently() {
        let metrics = Metrics::new();
        assert_eq!(Metrics::get(&metrics.segments_flushed), 0);
        Metrics::inc(&metrics.segments_flushed);
        Metrics::inc(&metrics.segments_flushed);
        Metrics::inc(&metrics.failed_segments);
        assert_eq!(Metrics::get(&metrics.segments_flushed), 2);
        assert_eq!(Metrics::get(&metrics.failed_segments), 1);
    }
}
