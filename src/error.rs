//! Error taxonomy for the codec. Every failure surfaces the file it happened
//! in and, where one exists, the byte offset.

use crate::io::WritePhase;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{}: I/O error at offset {}: {}", path.display(), offset, source)]
    Io {
        path: PathBuf,
        offset: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("{}: invalid header: {}", path.display(), reason)]
    InvalidHeader { path: PathBuf, reason: String },

    #[error("{}: unsupported version {} (supported: {})", path.display(), found, supported)]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("{}: invalid marker at offset {}: expected {:#04x}, found {:#04x}", path.display(), offset, expected, found)]
    InvalidMarker {
        path: PathBuf,
        offset: u64,
        expected: u32,
        found: u32,
    },

    #[error("{}: corrupt metadata at offset {}: {}", path.display(), offset, reason)]
    CorruptMetadata {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("{}: {} called in write phase {:?}", path.display(), op, phase)]
    InvalidWritePhase {
        path: PathBuf,
        op: &'static str,
        phase: WritePhase,
    },

    #[error("{}: out-of-order timestamp {}us (last written {}us since epoch)", path.display(), ts_us, last_us)]
    OutOfOrderTimestamp {
        path: PathBuf,
        ts_us: i64,
        last_us: i64,
    },

    #[error("{}: price level count bids={} asks={} exceeds max depth {}", path.display(), bids, asks, max_depth)]
    InvalidPriceLevelCount {
        path: PathBuf,
        bids: usize,
        asks: usize,
        max_depth: u8,
    },

    #[error("undefined price unit code {0}")]
    UndefinedPriceUnit(u8),
}

impl Error {
    pub(crate) fn io(path: impl Into<PathBuf>, offset: u64, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            offset,
            source,
        }
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, offset: u64, reason: impl Into<String>) -> Self {
        Error::CorruptMetadata {
            path: path.into(),
            offset,
            reason: reason.into(),
        }
    }
}
