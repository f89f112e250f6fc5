use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::{Error, ErrorKind, Result};

/// A directory entry as seen by [`Filesystem::walk`].
#[derive(Debug, Clone)]
pub struct Entry {
    pub name: String,
    pub len: u64,
    pub modified: SystemTime,
}

/// A handle to an open file, returned by [`Filesystem::create`]/[`Filesystem::open`].
///
/// Supports the streaming-write + explicit-fsync pattern the ingest writers
/// need (spec §4.2 `ActiveSegment`).
#[async_trait]
pub trait FileHandle: Send + Sync {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()>;
    async fn read_to_end(&mut self) -> Result<Vec<u8>>;
    async fn sync(&mut self) -> Result<()>;
    async fn len(&self) -> Result<u64>;
}

/// An advisory exclusive lock, held for the lifetime of the guard.
pub trait LockGuard: Send + Sync {}

/// Pluggable file operations, the only path through which segment state is
/// ever mutated (spec §4.1). `Rename` is the sole state-transition
/// primitive and must be atomic within a directory.
#[async_trait]
pub trait Filesystem: Send + Sync + fmt::Debug {
    async fn create_dir_all(&self, dir: &Path) -> Result<()>;
    /// Creates a new file, failing with `Exists` if one is already present.
    async fn create(&self, path: &Path) -> Result<Box<dyn FileHandle>>;
    async fn open(&self, path: &Path) -> Result<Box<dyn FileHandle>>;
    async fn remove(&self, path: &Path) -> Result<()>;
    /// Atomic rename within the same directory.
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;
    async fn walk(&self, dir: &Path) -> Result<Vec<Entry>>;
    async fn lock(&self, path: &Path) -> Result<Box<dyn LockGuard>>;
}

// ---------------------------------------------------------------------
// Real backing: tokio::fs
// ---------------------------------------------------------------------

#[derive(Debug)]
pub struct RealFilesystem;

impl RealFilesystem {
    pub fn new() -> Self {
        RealFilesystem
    }
}

impl Default for RealFilesystem {
    fn default() -> Self {
        Self::new()
    }
}

struct RealFileHandle(tokio::fs::File);

#[async_trait]
impl FileHandle for RealFileHandle {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;
        self.0.write_all(buf).await?;
        Ok(())
    }

    async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        self.0.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    async fn sync(&mut self) -> Result<()> {
        self.0.sync_all().await?;
        Ok(())
    }

    async fn len(&self) -> Result<u64> {
        Ok(self.0.metadata().await?.len())
    }
}

struct RealLockGuard(PathBuf);

impl LockGuard for RealLockGuard {}

impl Drop for RealLockGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[async_trait]
impl Filesystem for RealFilesystem {
    async fn create_dir_all(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        Ok(())
    }

    async fn create(&self, path: &Path) -> Result<Box<dyn FileHandle>> {
        let file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .await?;
        Ok(Box::new(RealFileHandle(file)))
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn FileHandle>> {
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await?;
        Ok(Box::new(RealFileHandle(file)))
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_file(path).await?;
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        tokio::fs::rename(from, to).await?;
        Ok(())
    }

    async fn walk(&self, dir: &Path) -> Result<Vec<Entry>> {
        let mut out = Vec::new();
        let mut rd = match tokio::fs::read_dir(dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = rd.next_entry().await? {
            let meta = entry.metadata().await?;
            if !meta.is_file() {
                continue;
            }
            out.push(Entry {
                name: entry.file_name().to_string_lossy().to_string(),
                len: meta.len(),
                modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }
        Ok(out)
    }

    async fn lock(&self, path: &Path) -> Result<Box<dyn LockGuard>> {
        tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(path)
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::new(ErrorKind::Conflict, "directory already locked")
                } else {
                    Error::from(e)
                }
            })?;
        Ok(Box::new(RealLockGuard(path.to_path_buf())))
    }
}

// ---------------------------------------------------------------------
// In-memory backing: for tests. Preserves atomic-rename semantics.
// ---------------------------------------------------------------------

#[derive(Clone)]
struct MemFile {
    data: Vec<u8>,
    modified: SystemTime,
}

#[derive(Debug, Default)]
pub struct MemFilesystem {
    files: Arc<Mutex<HashMap<PathBuf, MemFile>>>,
}

impl MemFilesystem {
    pub fn new() -> Self {
        Self::default()
    }
}

struct MemFileHandle {
    path: PathBuf,
    files: Arc<Mutex<HashMap<PathBuf, MemFile>>>,
    buf: Vec<u8>,
}

#[async_trait]
impl FileHandle for MemFileHandle {
    async fn write_all(&mut self, buf: &[u8]) -> Result<()> {
        self.buf.extend_from_slice(buf);
        Ok(())
    }

    async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let files = self.files.lock().await;
        Ok(files.get(&self.path).map(|f| f.data.clone()).unwrap_or_default())
    }

    async fn sync(&mut self) -> Result<()> {
        let mut files = self.files.lock().await;
        let entry = files.entry(self.path.clone()).or_insert(MemFile {
            data: Vec::new(),
            modified: SystemTime::now(),
        });
        entry.data.extend_from_slice(&self.buf);
        entry.modified = SystemTime::now();
        self.buf.clear();
        Ok(())
    }

    async fn len(&self) -> Result<u64> {
        let files = self.files.lock().await;
        Ok(files.get(&self.path).map(|f| f.data.len() as u64).unwrap_or(0) + self.buf.len() as u64)
    }
}

#[async_trait]
impl Filesystem for MemFilesystem {
    async fn create_dir_all(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    async fn create(&self, path: &Path) -> Result<Box<dyn FileHandle>> {
        let mut files = self.files.lock().await;
        if files.contains_key(path) {
            return Err(Error::new(ErrorKind::Exists, format!("{path:?} already exists")));
        }
        files.insert(
            path.to_path_buf(),
            MemFile {
                data: Vec::new(),
                modified: SystemTime::now(),
            },
        );
        drop(files);
        Ok(Box::new(MemFileHandle {
            path: path.to_path_buf(),
            files: self.files.clone(),
            buf: Vec::new(),
        }))
    }

    async fn open(&self, path: &Path) -> Result<Box<dyn FileHandle>> {
        let files = self.files.lock().await;
        if !files.contains_key(path) {
            return Err(Error::new(ErrorKind::NotExist, format!("{path:?} not found")));
        }
        drop(files);
        Ok(Box::new(MemFileHandle {
            path: path.to_path_buf(),
            files: self.files.clone(),
            buf: Vec::new(),
        }))
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let mut files = self.files.lock().await;
        files
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| Error::new(ErrorKind::NotExist, format!("{path:?} not found")))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let mut files = self.files.lock().await;
        let file = files
            .remove(from)
            .ok_or_else(|| Error::new(ErrorKind::NotExist, format!("{from:?} not found")))?;
        files.insert(to.to_path_buf(), file);
        Ok(())
    }

    async fn walk(&self, dir: &Path) -> Result<Vec<Entry>> {
        let files = self.files.lock().await;
        let mut out = Vec::new();
        for (path, file) in files.iter() {
            if path.parent() == Some(dir) {
                out.push(Entry {
                    name: path.file_name().unwrap().to_string_lossy().to_string(),
                    len: file.data.len() as u64,
                    modified: file.modified,
                });
            }
        }
        Ok(out)
    }

    async fn lock(&self, path: &Path) -> Result<Box<dyn LockGuard>> {
        let mut files = self.files.lock().await;
        if files.contains_key(path) {
            return Err(Error::new(ErrorKind::Conflict, "directory already locked"));
        }
        files.insert(
            path.to_path_buf(),
            MemFile {
                data: Vec::new(),
                modified: SystemTime::now(),
            },
        );
        drop(files);
        Ok(Box::new(MemLockGuard {
            path: path.to_path_buf(),
            files: self.files.clone(),
        }))
    }
}

struct MemLockGuard {
    path: PathBuf,
    files: Arc<Mutex<HashMap<PathBuf, MemFile>>>,
}

impl LockGuard for MemLockGuard {}

impl Drop for MemLockGuard {
    fn drop(&mut self) {
        if let Ok(mut files) = self.files.try_lock() {
            files.remove(&self.path);
        }
    }
}

// ---------------------------------------------------------------------
// Nop backing: discards all writes. Useful for load-shedding / dry runs.
// ---------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct NopFilesystem;

struct NopFileHandle;

#[async_trait]
impl FileHandle for NopFileHandle {
    async fn write_all(&mut self, _buf: &[u8]) -> Result<()> {
        Ok(())
    }

    async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    async fn sync(&mut self) -> Result<()> {
        Ok(())
    }

    async fn len(&self) -> Result<u64> {
        Ok(0)
    }
}

struct NopLockGuard;
impl LockGuard for NopLockGuard {}

#[async_trait]
impl Filesystem for NopFilesystem {
    async fn create_dir_all(&self, _dir: &Path) -> Result<()> {
        Ok(())
    }

    async fn create(&self, _path: &Path) -> Result<Box<dyn FileHandle>> {
        Ok(Box::new(NopFileHandle))
    }

    async fn open(&self, _path: &Path) -> Result<Box<dyn FileHandle>> {
        Ok(Box::new(NopFileHandle))
    }

    async fn remove(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    async fn rename(&self, _from: &Path, _to: &Path) -> Result<()> {
        Ok(())
    }

    async fn walk(&self, _dir: &Path) -> Result<Vec<Entry>> {
        Ok(Vec::new())
    }

    async fn lock(&self, _path: &Path) -> Result<Box<dyn LockGuard>> {
        Ok(Box::new(NopLockGuard))
    }
}
