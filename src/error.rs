//! Error types for burrowdb

use std::borrow::Cow;
use std::fmt;
use std::io;
use thiserror::Error;

/// The main error type for burrowdb operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(String),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Unsupported combination of flags
    #[error("Incompatible flags: {0}")]
    IncompatibleFlags(&'static str),

    /// Operation attempted on a finished transaction
    #[error("Transaction already finished")]
    TxnFinished,

    /// Write transaction is in the error state and must be aborted
    #[error("Transaction poisoned by a previous error")]
    TxnPoisoned,

    /// Invalid or closed table handle
    #[error("Bad table handle (dbi {0})")]
    BadDbi(u32),

    /// Table handle was created or dirtied by an unfinished write transaction
    #[error("Dangling table handle (dbi {0}): created/dirtied by an unfinished transaction")]
    DanglingDbi(u32),

    /// Reader slot is stale or owned by another thread
    #[error("Bad reader slot")]
    BadReaderSlot,

    /// Cursor was invalidated by a table drop/clear (the "poor" state)
    #[error("Bad cursor: the table was dropped or cleared")]
    BadCursor,

    /// Transaction used from a thread other than its owner
    #[error("Transaction is bound to a different thread")]
    ThreadMismatch,

    /// Resource is busy (writer mutex held in try mode, or env in exclusive use)
    #[error("Resource busy")]
    Busy,

    /// Key not found in table
    #[error("Key not found")]
    NotFound,

    /// Key already exists and overwrite was not requested
    #[error("Key already exists")]
    KeyExists,

    /// Append ordering violated (key not greater than the last one)
    #[error("Key mismatch: append ordering violated")]
    KeyMismatch,

    /// Database map is full (geometry upper bound reached, GC empty)
    #[error("Map full: upper geometry limit of {upper} pages reached")]
    MapFull {
        /// Upper geometry limit in pages
        upper: u64,
    },

    /// Write transaction has too many dirty pages
    #[error("Transaction full: {dirty} dirty pages")]
    TxnFull {
        /// Number of dirty pages at failure
        dirty: usize,
    },

    /// Reader table has no free slot
    #[error("Reader table full")]
    ReadersFull,

    /// Cursor stack exceeded the maximum tree depth
    #[error("Cursor stack full")]
    CursorFull,

    /// Page has no room for the node (internal; consumed by the split path)
    #[error("Page full")]
    PageFull,

    /// Corruption detected
    #[error("Corruption detected: {details}")]
    Corruption {
        /// Description of the corruption
        details: Cow<'static, str>,
        /// Page where corruption was detected
        pgno: Option<PageId>,
    },

    /// On-disk format version mismatch
    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch {
        /// Expected format version
        expected: u32,
        /// Found format version
        found: u32,
    },

    /// No valid meta page found
    #[error("Invalid meta pages: not a burrowdb file or all metas torn")]
    InvalidMeta,

    /// File geometry is incompatible with the build (e.g. page size)
    #[error("Incompatible geometry: {0}")]
    IncompatibleGeometry(&'static str),

    /// Invariant violation; the environment must be closed
    #[error("Panic: {0}")]
    Panic(Cow<'static, str>),

    /// Coherency check against the map failed and the retry budget ran out
    #[error("Page/buffer cache incoherence did not clear for page {0}")]
    Incoherent(PageId),

    /// Custom error
    #[error("{0}")]
    Custom(Cow<'static, str>),
}

/// Page number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId(pub u64);

impl PageId {
    /// Convert to byte offset in file
    pub fn to_offset(self, page_size: usize) -> u64 {
        self.0 * page_size as u64
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TxnId(pub u64);

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result type alias for burrowdb operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}

impl Error {
    /// Whether this error poisons a write transaction (forces the ERROR state)
    pub fn poisons_txn(&self) -> bool {
        !matches!(
            self,
            Error::NotFound
                | Error::KeyExists
                | Error::KeyMismatch
                | Error::InvalidParameter(_)
                | Error::IncompatibleFlags(_)
                | Error::Busy
                | Error::PageFull
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_poison_classification() {
        assert!(!Error::NotFound.poisons_txn());
        assert!(!Error::KeyExists.poisons_txn());
        assert!(!Error::KeyMismatch.poisons_txn());
        assert!(Error::MapFull { upper: 100 }.poisons_txn());
        assert!(Error::Io("disk".into()).poisons_txn());
        assert!(Error::Corruption { details: "bad node".into(), pgno: Some(PageId(7)) }
            .poisons_txn());
    }

    #[test]
    fn test_display() {
        let e = Error::MapFull { upper: 42 };
        assert!(e.to_string().contains("42"));
        assert_eq!(PageId(9).to_offset(4096), 9 * 4096);
    }
}
