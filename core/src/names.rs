//! Segment filename encoding. The extension is the only place segment
//! state lives on disk (spec §3); these types are the single source of
//! truth for parsing and formatting it so `ingest`/`store` never hand-roll
//! string splitting.

use std::fmt;

use ulid::Ulid;

/// Ingest-side segment state, encoded as a filename extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestName {
    Active(Ulid),
    Flushed(Ulid),
    Pending(Ulid, String),
}

impl IngestName {
    pub fn id(&self) -> Ulid {
        match self {
            IngestName::Active(id) | IngestName::Flushed(id) | IngestName::Pending(id, _) => *id,
        }
    }

    pub fn parse(filename: &str) -> Option<IngestName> {
        let (stem, rest) = filename.split_once('.')?;
        let id = stem.parse::<Ulid>().ok()?;
        if rest == "active" {
            return Some(IngestName::Active(id));
        }
        if rest == "flushed" {
            return Some(IngestName::Flushed(id));
        }
        let token = rest.strip_prefix("pending.")?;
        if token.is_empty() {
            return None;
        }
        Some(IngestName::Pending(id, token.to_string()))
    }
}

impl fmt::Display for IngestName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestName::Active(id) => write!(f, "{id}.active"),
            IngestName::Flushed(id) => write!(f, "{id}.flushed"),
            IngestName::Pending(id, token) => write!(f, "{id}.pending.{token}"),
        }
    }
}

/// Store-side segment state: filename encodes the inclusive ULID range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreName {
    Flushed(Ulid, Ulid),
    Trashed(Ulid, Ulid),
}

impl StoreName {
    pub fn range(&self) -> (Ulid, Ulid) {
        match self {
            StoreName::Flushed(low, high) | StoreName::Trashed(low, high) => (*low, *high),
        }
    }

    pub fn parse(filename: &str) -> Option<StoreName> {
        let (stem, ext) = filename.split_once('.')?;
        let (low, high) = stem.split_once('-')?;
        let low = low.parse::<Ulid>().ok()?;
        let high = high.parse::<Ulid>().ok()?;
        match ext {
            "flushed" => Some(StoreName::Flushed(low, high)),
            "trashed" => Some(StoreName::Trashed(low, high)),
            _ => None,
        }
    }

    /// Whether this segment's range overlaps `other`'s (spec §4.3 `Overlapping`).
    pub fn overlaps(&self, other: &StoreName) -> bool {
        let (a_low, a_high) = self.range();
        let (b_low, b_high) = other.range();
        a_low <= b_high && b_low <= a_high
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreName::Flushed(low, high) => write!(f, "{low}-{high}.flushed"),
            StoreName::Trashed(low, high) => write!(f, "{low}-{high}.trashed"),
        }
    }
}
