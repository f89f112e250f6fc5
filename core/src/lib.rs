pub mod error;
pub mod fs;
pub mod names;
pub mod record;

pub use error::{Error, ErrorKind, Result};
pub use fs::{Entry, FileHandle, Filesystem, LockGuard, MemFilesystem, NopFilesystem, RealFilesystem};
pub use names::{IngestName, StoreName};
pub use record::{record_ulid, split_records};
pub use ulid::Ulid;
