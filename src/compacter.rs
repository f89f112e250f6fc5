//! Background store-side compaction: retain, compact-overlapping,
//! compact-sequential, purge (spec §4.6).

use std::sync::Arc;
use std::time::{Duration, Instant};

use ledgerd_core::{record_ulid, split_records, Ulid};
use tokio::sync::watch;

use crate::metrics::Metrics;
use crate::store::{Segment, StoreLog};

#[derive(Debug, Default, Clone, Copy)]
pub struct CycleReport {
    pub retained: usize,
    pub overlap_groups: usize,
    pub sequential_groups: usize,
    pub purged: usize,
}

pub struct Compacter {
    store: Arc<StoreLog>,
    metrics: Arc<Metrics>,
    retention: Duration,
    cycle_budget: Duration,
}

impl Compacter {
    pub fn new(store: Arc<StoreLog>, metrics: Arc<Metrics>, retention: Duration, cycle_budget: Duration) -> Self {
        Compacter {
            store,
            metrics,
            retention,
            cycle_budget,
        }
    }

    fn now_ms() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Any flushed segment whose `highULID` time component is older than
    /// retention is trashed.
    async fn retain(&self, deadline: Instant) -> anyhow::Result<usize> {
        let mut retained = 0;
        let cutoff = Self::now_ms().saturating_sub(self.retention.as_millis() as u64);
        for seg in self.store.flushed_segments().await? {
            if Instant::now() >= deadline {
                log::warn!("retain phase hit cycle budget, carrying remainder to next cycle");
                break;
            }
            if seg.high.timestamp_ms() < cutoff {
                self.store.trash(&seg).await?;
                retained += 1;
            }
        }
        if retained > 0 {
            Metrics::add(&self.metrics.compactions_retain, retained as u64);
        }
        Ok(retained)
    }

    /// Merges the records of every mutually-overlapping group of segments
    /// into one new segment, sorted and deduplicated by exact record
    /// bytes, then trashes the inputs.
    async fn compact_overlapping(&self, deadline: Instant) -> anyhow::Result<usize> {
        let groups = self.store.overlapping_groups().await?;
        let mut merged = 0;
        for group in groups {
            if Instant::now() >= deadline {
                log::warn!("compact-overlapping hit cycle budget, carrying remainder to next cycle");
                break;
            }
            match self.merge_group(&group, true).await {
                Ok(()) => merged += 1,
                Err(e) => {
                    Metrics::inc(&self.metrics.compaction_failures);
                    log::error!("overlap compaction failed: {e}");
                }
            }
        }
        if merged > 0 {
            Metrics::add(&self.metrics.compactions_overlap, merged as u64);
        }
        Ok(merged)
    }

    /// Concatenates groups of small, contiguous, non-overlapping segments
    /// into one new segment, then trashes the inputs.
    async fn compact_sequential(&self, deadline: Instant) -> anyhow::Result<usize> {
        let groups = self.store.sequential_groups().await?;
        let mut merged = 0;
        for group in groups {
            if Instant::now() >= deadline {
                log::warn!("compact-sequential hit cycle budget, carrying remainder to next cycle");
                break;
            }
            match self.merge_group(&group, false).await {
                Ok(()) => merged += 1,
                Err(e) => {
                    Metrics::inc(&self.metrics.compaction_failures);
                    log::error!("sequential compaction failed: {e}");
                }
            }
        }
        if merged > 0 {
            Metrics::add(&self.metrics.compactions_sequential, merged as u64);
        }
        Ok(merged)
    }

    /// Reads every segment in `group`, optionally sorts by ULID and drops
    /// exact duplicates, writes the result as one new segment, and trashes
    /// the inputs only after the new segment is durably in place -- a
    /// reader racing this call may briefly see both (spec §4.6 step 2).
    async fn merge_group(&self, group: &[Segment], dedup_and_sort: bool) -> anyhow::Result<()> {
        let mut records: Vec<Vec<u8>> = Vec::new();
        for seg in group {
            let bytes = self.store.read(seg).await?;
            let (recs, _) = split_records(&bytes);
            records.extend(recs.into_iter().map(|r| r.to_vec()));
        }

        if dedup_and_sort {
            records.sort_by_key(|r| record_ulid(r).unwrap_or(Ulid::nil()));
            records.dedup();
        }

        let mut merged = Vec::new();
        for record in &records {
            merged.extend_from_slice(record);
            merged.push(b'\n');
        }

        self.store.append(&merged).await?;
        for seg in group {
            self.store.trash(seg).await?;
        }
        Ok(())
    }

    /// Deletes trashed files older than the purge age.
    async fn purge(&self) -> anyhow::Result<usize> {
        let purged = self.store.purge().await?;
        if purged > 0 {
            Metrics::add(&self.metrics.compactions_purge, purged as u64);
        }
        Ok(purged)
    }

    /// Runs one cycle: retain, compact-overlapping, compact-sequential,
    /// purge, each counted and bounded by `cycle_budget` wall-time.
    pub async fn run_once(&self) -> anyhow::Result<CycleReport> {
        let start = Instant::now();
        let deadline = start + self.cycle_budget;

        let retained = self.retain(deadline).await?;
        let overlap_groups = self.compact_overlapping(deadline).await?;
        let sequential_groups = self.compact_sequential(deadline).await?;
        let purged = self.purge().await?;

        log::info!(
            "compaction cycle done in {:?}: retained={} overlap_groups={} sequential_groups={} purged={}",
            start.elapsed(),
            retained,
            overlap_groups,
            sequential_groups,
            purged
        );

        Ok(CycleReport {
            retained,
            overlap_groups,
            sequential_groups,
            purged,
        })
    }

    /// Runs cycles every `interval` until cancelled.
    pub async fn run(self: Arc<Self>, interval: Duration, mut cancel: watch::Receiver<bool>) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    log::info!("compacter stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_once().await {
                        Metrics::inc(&self.metrics.compaction_failures);
                        log::error!("compaction cycle failed: {e}");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_core::{Filesystem, MemFilesystem};
    use std::path::PathBuf;

    async fn setup(target_size: u64) -> (StoreLog, Arc<Metrics>) {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFilesystem::new());
        let store = StoreLog::open(PathBuf::from("/store"), fs, target_size, Duration::from_secs(1))
            .await
            .unwrap();
        (store, Arc::new(Metrics::new()))
    }

    fn record(id: Ulid, body: &str) -> String {
        format!("{id} {body}\n")
    }

    #[tokio::test]
    async fn compact_overlapping_merges_and_trashes_inputs() {
        let (store, metrics) = setup(u64::MAX).await;
        let a = Ulid::new();
        let c = Ulid::from_parts(a.timestamp_ms() + 100, a.random());
        let b = Ulid::from_parts(a.timestamp_ms() + 10, a.random());
        let d = Ulid::from_parts(a.timestamp_ms() + 110, a.random());
        store
            .append(format!("{}{}", record(a, "a"), record(c, "c")).as_bytes())
            .await
            .unwrap();
        store
            .append(format!("{}{}", record(b, "b"), record(d, "d")).as_bytes())
            .await
            .unwrap();

        let compacter = Compacter::new(Arc::new(store), metrics.clone(), Duration::from_secs(3600), Duration::from_secs(60));
        let report = compacter.run_once().await.unwrap();
        assert_eq!(report.overlap_groups, 1);

        let remaining = compacter.store.flushed_segments().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].low, a);
        assert_eq!(remaining[0].high, d);
        assert_eq!(Metrics::get(&metrics.compactions_overlap), 1);
    }

    #[tokio::test]
    async fn retain_trashes_old_segments_and_purge_removes_them() {
        let (store, metrics) = setup(u64::MAX).await;
        let old = Ulid::from_parts(Compacter::now_ms() - Duration::from_secs(8 * 24 * 3600).as_millis() as u64, 0);
        store.append(record(old, "ancient").as_bytes()).await.unwrap();

        let compacter = Compacter::new(
            Arc::new(store),
            metrics.clone(),
            Duration::from_secs(7 * 24 * 3600),
            Duration::from_secs(60),
        );
        let report = compacter.run_once().await.unwrap();
        assert_eq!(report.retained, 1);
        assert_eq!(compacter.store.flushed_segments().await.unwrap().len(), 0);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        let report2 = compacter.run_once().await.unwrap();
        assert_eq!(report2.purged, 1);
    }

    #[tokio::test]
    async fn sequential_groups_concatenate_preserving_order() {
        let (store, metrics) = setup(100).await;
        let a = Ulid::new();
        let b = Ulid::from_parts(a.timestamp_ms() + 1000, a.random());
        store.append(record(a, "x").as_bytes()).await.unwrap();
        store.append(record(b, "y").as_bytes()).await.unwrap();

        let compacter = Compacter::new(Arc::new(store), metrics, Duration::from_secs(3600), Duration::from_secs(60));
        let report = compacter.run_once().await.unwrap();
        assert_eq!(report.sequential_groups, 1);
        let remaining = compacter.store.flushed_segments().await.unwrap();
        assert_eq!(remaining.len(), 1);
        let bytes = compacter.store.read(&remaining[0]).await.unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.find("x").unwrap() < text.find("y").unwrap());
    }
}
