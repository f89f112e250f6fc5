//! Ingest-side segment store: the active→flushed→pending→committed/failed
//! state machine and its concurrency-safe claim protocol (spec §4.2).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ledgerd_core::{Error, ErrorKind, Filesystem, FileHandle, IngestName, LockGuard, Result, Ulid};
use tokio::sync::Mutex;

use crate::metrics::Metrics;

/// A segment past the point of being actively written; informational only
/// (the file itself has already been renamed to `.flushed`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushedSegment {
    pub id: Ulid,
    pub path: PathBuf,
}

/// A flushed segment claimed by a consumer. `token` must be presented to
/// `commit`/`fail` and is reaped by `sweep` after `pending_timeout`.
#[derive(Debug, Clone)]
pub struct PendingClaim {
    pub id: Ulid,
    pub token: String,
    pub path: PathBuf,
}

/// The single currently-open file receiving records from one writer
/// session (spec §3 "Active segment"). Dropping without calling `close`
/// leaves the `.active` file on disk for the next startup sweep to
/// reconcile (spec §7).
pub struct ActiveSegment {
    id: Ulid,
    writer_id: String,
    dir: PathBuf,
    path: PathBuf,
    handle: Box<dyn FileHandle>,
    bytes_written: u64,
    created_at: Instant,
    fs: Arc<dyn Filesystem>,
    active_writers: Arc<Mutex<HashSet<String>>>,
    metrics: Arc<Metrics>,
}

impl ActiveSegment {
    pub fn id(&self) -> Ulid {
        self.id
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Appends one newline-framed record.
    pub async fn write_record(&mut self, record: &[u8]) -> Result<()> {
        self.handle.write_all(record).await?;
        self.handle.write_all(b"\n").await?;
        self.bytes_written += record.len() as u64 + 1;
        Ok(())
    }

    /// fsync without a state change.
    pub async fn sync(&mut self) -> Result<()> {
        self.handle.sync().await
    }

    /// Closes the segment, renaming it to `.flushed`. An empty segment is
    /// a no-op: the file is removed and `None` is returned (spec §8
    /// "Rotation idempotence").
    pub async fn close(mut self, reason: &str) -> Result<Option<FlushedSegment>> {
        self.handle.sync().await?;
        self.active_writers.lock().await.remove(&self.writer_id);

        if self.bytes_written == 0 {
            self.fs.remove(&self.path).await?;
            log::info!("writer {} closed empty active segment {}", self.writer_id, self.id);
            return Ok(None);
        }

        let flushed_path = self.dir.join(IngestName::Flushed(self.id).to_string());
        self.fs.rename(&self.path, &flushed_path).await?;
        Metrics::inc(&self.metrics.segments_flushed);
        log::info!(
            "flushed segment {} reason={} bytes={} age={:?}",
            self.id,
            reason,
            self.bytes_written,
            self.created_at.elapsed()
        );
        Ok(Some(FlushedSegment {
            id: self.id,
            path: flushed_path,
        }))
    }
}

/// Directory of ingest segments, owned exclusively by one process via an
/// advisory lock taken at startup (spec §5 "Shared resources").
pub struct IngestLog {
    dir: PathBuf,
    fs: Arc<dyn Filesystem>,
    metrics: Arc<Metrics>,
    pending_timeout: Duration,
    active_writers: Arc<Mutex<HashSet<String>>>,
    _lock: Box<dyn LockGuard>,
}

impl IngestLog {
    pub async fn open(
        dir: PathBuf,
        fs: Arc<dyn Filesystem>,
        metrics: Arc<Metrics>,
        pending_timeout: Duration,
    ) -> Result<Self> {
        fs.create_dir_all(&dir).await?;
        let lock = fs.lock(&dir.join(".lock")).await?;
        let log = IngestLog {
            dir,
            fs,
            metrics,
            pending_timeout,
            active_writers: Arc::new(Mutex::new(HashSet::new())),
            _lock: lock,
        };
        log.startup_sweep().await?;
        Ok(log)
    }

    /// Reconciles `.active` files left behind by a crash: non-empty ones
    /// are promoted to `.flushed`, empty ones are removed (spec §7).
    async fn startup_sweep(&self) -> Result<()> {
        for entry in self.fs.walk(&self.dir).await? {
            if let Some(IngestName::Active(id)) = IngestName::parse(&entry.name) {
                let path = self.dir.join(&entry.name);
                if entry.len == 0 {
                    self.fs.remove(&path).await?;
                } else {
                    let flushed = self.dir.join(IngestName::Flushed(id).to_string());
                    self.fs.rename(&path, &flushed).await?;
                    log::warn!("startup sweep promoted orphaned active segment {id} to flushed");
                }
            }
        }
        Ok(())
    }

    /// Allocates a new active segment for `writer_id`. Fails with
    /// `Conflict` if that writer already holds one open.
    pub async fn create(&self, writer_id: &str) -> Result<ActiveSegment> {
        let mut writers = self.active_writers.lock().await;
        if !writers.insert(writer_id.to_string()) {
            return Err(Error::new(
                ErrorKind::Conflict,
                format!("writer {writer_id} already holds an active segment"),
            ));
        }
        let id = Ulid::new();
        let path = self.dir.join(IngestName::Active(id).to_string());
        let handle = match self.fs.create(&path).await {
            Ok(h) => h,
            Err(e) => {
                writers.remove(writer_id);
                return Err(e);
            }
        };
        Ok(ActiveSegment {
            id,
            writer_id: writer_id.to_string(),
            dir: self.dir.clone(),
            path,
            handle,
            bytes_written: 0,
            created_at: Instant::now(),
            fs: self.fs.clone(),
            active_writers: self.active_writers.clone(),
            metrics: self.metrics.clone(),
        })
    }

    /// Returns the flushed segment with the smallest (oldest) id,
    /// atomically claiming it as `.pending.<token>`.
    pub async fn oldest(&self) -> Result<Option<PendingClaim>> {
        let mut flushed: Vec<(Ulid, String)> = self
            .fs
            .walk(&self.dir)
            .await?
            .into_iter()
            .filter_map(|e| match IngestName::parse(&e.name) {
                Some(IngestName::Flushed(id)) => Some((id, e.name)),
                _ => None,
            })
            .collect();
        flushed.sort_by_key(|(id, _)| *id);

        let Some((id, name)) = flushed.into_iter().next() else {
            return Ok(None);
        };

        let token = Ulid::new().to_string();
        let from = self.dir.join(&name);
        let to_name = IngestName::Pending(id, token.clone());
        let to = self.dir.join(to_name.to_string());
        match self.fs.rename(&from, &to).await {
            Ok(()) => Ok(Some(PendingClaim { id, token, path: to })),
            Err(e) => Err(e),
        }
    }

    fn find_pending(&self, entries: &[ledgerd_core::Entry], token: &str) -> Option<(Ulid, String)> {
        entries.iter().find_map(|e| match IngestName::parse(&e.name) {
            Some(IngestName::Pending(id, t)) if t == token => Some((id, e.name.clone())),
            _ => None,
        })
    }

    /// Deletes the pending segment. Fails with `NoSuchToken` if it has
    /// already timed out (or been committed/failed).
    pub async fn commit(&self, token: &str) -> Result<()> {
        let entries = self.fs.walk(&self.dir).await?;
        let (_, name) = self
            .find_pending(&entries, token)
            .ok_or_else(|| Error::new(ErrorKind::NoSuchToken, format!("no pending segment for token {token}")))?;
        self.fs.remove(&self.dir.join(name)).await?;
        Metrics::inc(&self.metrics.segments_committed);
        Ok(())
    }

    /// Re-opens the pending segment to `.flushed`. Fails with
    /// `NoSuchToken` under the same conditions as `commit`.
    pub async fn fail(&self, token: &str) -> Result<()> {
        let entries = self.fs.walk(&self.dir).await?;
        let (id, name) = self
            .find_pending(&entries, token)
            .ok_or_else(|| Error::new(ErrorKind::NoSuchToken, format!("no pending segment for token {token}")))?;
        let from = self.dir.join(&name);
        let to = self.dir.join(IngestName::Flushed(id).to_string());
        self.fs.rename(&from, &to).await?;
        Ok(())
    }

    /// Reopens pending segments whose mtime exceeds `now - pending_timeout`
    /// to `.flushed`, as if the consumer had failed them (spec §4.2).
    /// Returns the count reopened.
    pub async fn sweep(&self) -> Result<usize> {
        let now = std::time::SystemTime::now();
        let mut reopened = 0;
        for entry in self.fs.walk(&self.dir).await? {
            let Some(IngestName::Pending(id, _)) = IngestName::parse(&entry.name) else {
                continue;
            };
            let age = now.duration_since(entry.modified).unwrap_or(Duration::ZERO);
            if age <= self.pending_timeout {
                continue;
            }
            let from = self.dir.join(&entry.name);
            let to = self.dir.join(IngestName::Flushed(id).to_string());
            if self.fs.rename(&from, &to).await.is_ok() {
                Metrics::inc(&self.metrics.failed_segments);
                reopened += 1;
                log::warn!("swept timed-out pending segment {id} back to flushed");
            }
        }
        Ok(reopened)
    }

    /// Reads the bytes of a claimed segment for streaming to a consumer.
    pub async fn read_claim(&self, claim: &PendingClaim) -> Result<Vec<u8>> {
        self.fs.open(&claim.path).await?.read_to_end().await
    }

    /// Read-only inspection of flushed segment ids in `[from, to]` --
    /// not the primary egress path (spec §4.2 `Query`).
    pub async fn query(&self, from: Ulid, to: Ulid) -> Result<Vec<Ulid>> {
        let mut ids: Vec<Ulid> = self
            .fs
            .walk(&self.dir)
            .await?
            .into_iter()
            .filter_map(|e| match IngestName::parse(&e.name) {
                Some(IngestName::Flushed(id)) if id >= from && id <= to => Some(id),
                _ => None,
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_core::MemFilesystem;

    async fn setup() -> IngestLog {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFilesystem::new());
        IngestLog::open(
            PathBuf::from("/ingest"),
            fs,
            Arc::new(Metrics::new()),
            Duration::from_millis(50),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn create_then_close_yields_flushed_segment() {
        let log = setup().await;
        let mut seg = log.create("writer-1").await.unwrap();
        seg.write_record(b"hello").await.unwrap();
        let flushed = seg.close("size").await.unwrap();
        assert!(flushed.is_some());
        let claim = log.oldest().await.unwrap().unwrap();
        assert_eq!(claim.id, flushed.unwrap().id);
    }

    #[tokio::test]
    async fn empty_close_is_a_no_op() {
        let log = setup().await;
        let seg = log.create("writer-1").await.unwrap();
        let flushed = seg.close("close").await.unwrap();
        assert!(flushed.is_none());
        assert!(log.oldest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_create_same_writer_conflicts() {
        let log = setup().await;
        let _seg = log.create("writer-1").await.unwrap();
        let err = log.create("writer-1").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[tokio::test]
    async fn writer_can_create_again_after_close() {
        let log = setup().await;
        let seg = log.create("writer-1").await.unwrap();
        seg.close("close").await.unwrap();
        assert!(log.create("writer-1").await.is_ok());
    }

    #[tokio::test]
    async fn oldest_returns_ascending_by_creation() {
        let log = setup().await;
        for i in 0..3 {
            let mut seg = log.create(&format!("w{i}")).await.unwrap();
            seg.write_record(b"x").await.unwrap();
            seg.close("close").await.unwrap();
        }
        let first = log.oldest().await.unwrap().unwrap();
        log.commit(&first.token).await.unwrap();
        let second = log.oldest().await.unwrap().unwrap();
        assert_ne!(first.id, second.id);
        assert!(first.id < second.id);
    }

    #[tokio::test]
    async fn commit_then_fail_on_same_token_is_no_such_token() {
        let log = setup().await;
        let mut seg = log.create("writer-1").await.unwrap();
        seg.write_record(b"x").await.unwrap();
        seg.close("close").await.unwrap();
        let claim = log.oldest().await.unwrap().unwrap();
        log.commit(&claim.token).await.unwrap();
        let err = log.fail(&claim.token).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchToken);
    }

    #[tokio::test]
    async fn fail_reverts_to_flushed_and_reclaimable() {
        let log = setup().await;
        let mut seg = log.create("writer-1").await.unwrap();
        seg.write_record(b"x").await.unwrap();
        seg.close("close").await.unwrap();
        let claim = log.oldest().await.unwrap().unwrap();
        log.fail(&claim.token).await.unwrap();
        let reclaim = log.oldest().await.unwrap().unwrap();
        assert_eq!(reclaim.id, claim.id);
    }

    #[tokio::test]
    async fn sweep_reopens_timed_out_pending_segments() {
        let log = setup().await;
        let mut seg = log.create("writer-1").await.unwrap();
        seg.write_record(b"x").await.unwrap();
        seg.close("close").await.unwrap();
        let claim = log.oldest().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;
        let reopened = log.sweep().await.unwrap();
        assert_eq!(reopened, 1);
        assert_eq!(Metrics::get(&log.metrics.failed_segments), 1);
        let err = log.commit(&claim.token).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoSuchToken);
    }

    #[tokio::test]
    async fn startup_sweep_promotes_leftover_active_segment() {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFilesystem::new());
        let metrics = Arc::new(Metrics::new());
        {
            let log = IngestLog::open(PathBuf::from("/ingest"), fs.clone(), metrics.clone(), Duration::from_secs(60))
                .await
                .unwrap();
            let mut seg = log.create("writer-1").await.unwrap();
            seg.write_record(b"crash-before-close").await.unwrap();
            seg.sync().await.unwrap();
            // IngestLog (and its directory lock) dropped here without closing the segment.
        }
        let log = IngestLog::open(PathBuf::from("/ingest"), fs, metrics, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(log.oldest().await.unwrap().is_some());
    }
}
