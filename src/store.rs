//! Store-side segment directory: committed, range-named segments with
//! size-targeted merging and trash (spec §4.3).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ledgerd_core::{split_records, Error, ErrorKind, Filesystem, LockGuard, Result, StoreName, Ulid};

/// A committed segment. `low`/`high` are the filename-encoded ULID range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub low: Ulid,
    pub high: Ulid,
    pub path: PathBuf,
    pub len: u64,
}

impl Segment {
    fn overlaps(&self, other: &Segment) -> bool {
        self.low <= other.high && other.low <= self.high
    }
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct Statistics {
    pub count: usize,
    pub bytes: u64,
    pub oldest: Option<Ulid>,
    pub newest: Option<Ulid>,
}

/// Directory of store segments, owned exclusively by one process (advisory
/// lock at startup, same as `IngestLog`).
pub struct StoreLog {
    dir: PathBuf,
    fs: Arc<dyn Filesystem>,
    segment_target_size: u64,
    purge_age: Duration,
    _lock: Box<dyn LockGuard>,
}

impl StoreLog {
    pub async fn open(
        dir: PathBuf,
        fs: Arc<dyn Filesystem>,
        segment_target_size: u64,
        purge_age: Duration,
    ) -> Result<Self> {
        fs.create_dir_all(&dir).await?;
        let lock = fs.lock(&dir.join(".lock")).await?;
        Ok(StoreLog {
            dir,
            fs,
            segment_target_size,
            purge_age,
            _lock: lock,
        })
    }

    /// Drains `data` (already fully read off the wire/claim body) into a
    /// temp file, computes the low/high ULID range by scanning records,
    /// then renames into its final `.flushed` name. Fails with
    /// `MalformedRecord` on unterminated or prefix-less records.
    pub async fn append(&self, data: &[u8]) -> Result<Segment> {
        let (records, tail) = split_records(data);
        if !tail.is_empty() {
            return Err(Error::new(ErrorKind::MalformedRecord, "unterminated trailing record"));
        }
        if records.is_empty() {
            return Err(Error::new(ErrorKind::MalformedRecord, "segment has no records"));
        }

        let mut low: Option<Ulid> = None;
        let mut high: Option<Ulid> = None;
        for record in &records {
            let id = ledgerd_core::record_ulid(record)?;
            low = Some(low.map_or(id, |l| l.min(id)));
            high = Some(high.map_or(id, |h| h.max(id)));
        }
        let low = low.unwrap();
        let high = high.unwrap();

        let tmp_path = self.dir.join(format!("{}.tmp", Ulid::new()));
        let mut handle = self.fs.create(&tmp_path).await?;
        if let Err(e) = handle.write_all(data).await {
            let _ = self.fs.remove(&tmp_path).await;
            return Err(e);
        }
        handle.sync().await?;

        let final_path = self.dir.join(StoreName::Flushed(low, high).to_string());
        self.fs.rename(&tmp_path, &final_path).await?;
        Ok(Segment {
            low,
            high,
            path: final_path,
            len: data.len() as u64,
        })
    }

    async fn list(&self) -> Result<Vec<(StoreName, ledgerd_core::Entry)>> {
        let entries = self.fs.walk(&self.dir).await?;
        Ok(entries
            .into_iter()
            .filter_map(|e| StoreName::parse(&e.name).map(|n| (n, e)))
            .collect())
    }

    pub async fn flushed_segments(&self) -> Result<Vec<Segment>> {
        let mut segs: Vec<Segment> = self
            .list()
            .await?
            .into_iter()
            .filter_map(|(name, entry)| match name {
                StoreName::Flushed(low, high) => Some(Segment {
                    low,
                    high,
                    path: self.dir.join(&entry.name),
                    len: entry.len,
                }),
                StoreName::Trashed(..) => None,
            })
            .collect();
        segs.sort_by_key(|s| s.low);
        Ok(segs)
    }

    /// All flushed segments whose range overlaps `target`'s.
    pub async fn overlapping(&self, target: &Segment) -> Result<Vec<Segment>> {
        Ok(self
            .flushed_segments()
            .await?
            .into_iter()
            .filter(|s| s.path != target.path && s.overlaps(target))
            .collect())
    }

    /// Maximal clusters of mutually overlapping flushed segments (spec
    /// §4.6 "for each group of overlapping segments").
    pub async fn overlapping_groups(&self) -> Result<Vec<Vec<Segment>>> {
        let segs = self.flushed_segments().await?;
        let mut groups: Vec<Vec<Segment>> = Vec::new();
        'outer: for seg in segs {
            for group in groups.iter_mut() {
                if group.iter().any(|g| g.overlaps(&seg)) {
                    group.push(seg);
                    continue 'outer;
                }
            }
            groups.push(vec![seg]);
        }
        groups.retain(|g| g.len() > 1);
        Ok(groups)
    }

    /// Groups of contiguous, non-overlapping flushed segments whose
    /// combined size is below the segment target size.
    pub async fn sequential_groups(&self) -> Result<Vec<Vec<Segment>>> {
        let segs = self.flushed_segments().await?;
        let mut groups: Vec<Vec<Segment>> = Vec::new();
        let mut current: Vec<Segment> = Vec::new();
        let mut current_size: u64 = 0;

        for seg in segs {
            let fits_after_prev = current.last().map(|prev| prev.high < seg.low).unwrap_or(true);
            if fits_after_prev && current_size + seg.len <= self.segment_target_size {
                current_size += seg.len;
                current.push(seg);
            } else {
                if current.len() > 1 {
                    groups.push(std::mem::take(&mut current));
                } else {
                    current.clear();
                }
                current_size = seg.len;
                current.push(seg);
            }
        }
        if current.len() > 1 {
            groups.push(current);
        }
        Ok(groups)
    }

    pub async fn read(&self, segment: &Segment) -> Result<Vec<u8>> {
        self.fs.open(&segment.path).await?.read_to_end().await
    }

    /// Renames a flushed segment to `.trashed`.
    pub async fn trash(&self, segment: &Segment) -> Result<()> {
        let to = self.dir.join(StoreName::Trashed(segment.low, segment.high).to_string());
        self.fs.rename(&segment.path, &to).await
    }

    /// Removes trashed files older than the purge age. Returns the count removed.
    pub async fn purge(&self) -> Result<usize> {
        let now = std::time::SystemTime::now();
        let mut purged = 0;
        for (name, entry) in self.list().await? {
            if let StoreName::Trashed(..) = name {
                let age = now.duration_since(entry.modified).unwrap_or(Duration::ZERO);
                if age >= self.purge_age {
                    self.fs.remove(&self.dir.join(&entry.name)).await?;
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }

    pub async fn statistics(&self) -> Result<Statistics> {
        let segs = self.flushed_segments().await?;
        Ok(Statistics {
            count: segs.len(),
            bytes: segs.iter().map(|s| s.len).sum(),
            oldest: segs.iter().map(|s| s.low).min(),
            newest: segs.iter().map(|s| s.high).max(),
        })
    }

    /// Concatenates every record in `[from, to]` across all overlapping
    /// flushed segments, in segment-low order.
    pub async fn query(&self, from: Ulid, to: Ulid) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for seg in self.flushed_segments().await? {
            if seg.high < from || seg.low > to {
                continue;
            }
            let bytes = self.read(&seg).await?;
            let (records, _) = split_records(&bytes);
            for record in records {
                if let Ok(id) = ledgerd_core::record_ulid(record) {
                    if id >= from && id <= to {
                        out.extend_from_slice(record);
                        out.push(b'\n');
                    }
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledgerd_core::MemFilesystem;

    async fn setup(target_size: u64) -> StoreLog {
        let fs: Arc<dyn Filesystem> = Arc::new(MemFilesystem::new());
        StoreLog::open(PathBuf::from("/store"), fs, target_size, Duration::from_millis(50))
            .await
            .unwrap()
    }

    fn record(id: Ulid, body: &str) -> String {
        format!("{id} {body}\n")
    }

    #[tokio::test]
    async fn append_computes_range_from_records() {
        let log = setup(u64::MAX).await;
        let a = Ulid::new();
        let b = Ulid::from_parts(a.timestamp_ms() + 10, a.random());
        let data = format!("{}{}", record(a, "x"), record(b, "y"));
        let seg = log.append(data.as_bytes()).await.unwrap();
        assert_eq!(seg.low, a);
        assert_eq!(seg.high, b);
    }

    #[tokio::test]
    async fn append_rejects_unterminated_record() {
        let log = setup(u64::MAX).await;
        let err = log.append(b"no newline here").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedRecord);
    }

    #[tokio::test]
    async fn append_rejects_missing_ulid_prefix() {
        let log = setup(u64::MAX).await;
        let err = log.append(b"not a ulid at all\n").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::MalformedRecord);
    }

    #[tokio::test]
    async fn overlapping_groups_finds_overlapping_ranges() {
        let log = setup(u64::MAX).await;
        let a = Ulid::new();
        let c = Ulid::from_parts(a.timestamp_ms() + 100, a.random());
        let b = Ulid::from_parts(a.timestamp_ms() + 10, a.random());
        let d = Ulid::from_parts(a.timestamp_ms() + 110, a.random());
        log.append(format!("{}{}", record(a, "a"), record(c, "c")).as_bytes())
            .await
            .unwrap();
        log.append(format!("{}{}", record(b, "b"), record(d, "d")).as_bytes())
            .await
            .unwrap();
        let groups = log.overlapping_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[tokio::test]
    async fn sequential_groups_respects_target_size() {
        let log = setup(20).await;
        let a = Ulid::new();
        let b = Ulid::from_parts(a.timestamp_ms() + 1000, a.random());
        log.append(record(a, "x").as_bytes()).await.unwrap();
        log.append(record(b, "y").as_bytes()).await.unwrap();
        let groups = log.sequential_groups().await.unwrap();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[tokio::test]
    async fn trash_then_purge_removes_after_age() {
        let log = setup(u64::MAX).await;
        let a = Ulid::new();
        let seg = log.append(record(a, "x").as_bytes()).await.unwrap();
        log.trash(&seg).await.unwrap();
        assert_eq!(log.purge().await.unwrap(), 0);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(log.purge().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_filters_to_requested_range() {
        let log = setup(u64::MAX).await;
        let a = Ulid::new();
        let b = Ulid::from_parts(a.timestamp_ms() + 1000, a.random());
        log.append(format!("{}{}", record(a, "in"), record(b, "out")).as_bytes())
            .await
            .unwrap();
        let result = log.query(a, a).await.unwrap();
        assert!(String::from_utf8_lossy(&result).contains("in"));
        assert!(!String::from_utf8_lossy(&result).contains("out"));
    }

    #[tokio::test]
    async fn statistics_report_count_and_range() {
        let log = setup(u64::MAX).await;
        let a = Ulid::new();
        let b = Ulid::from_parts(a.timestamp_ms() + 1000, a.random());
        log.append(record(a, "x").as_bytes()).await.unwrap();
        log.append(record(b, "y").as_bytes()).await.unwrap();
        let stats = log.statistics().await.unwrap();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.oldest, Some(a));
        assert_eq!(stats.newest, Some(b));
    }
}
