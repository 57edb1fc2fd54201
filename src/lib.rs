//! Single-file, append-friendly binary storage for one instrument's trading
//! day: order-book snapshots and trades interleaved with coarse time
//! markers, plus a precomputed OHLCV candle index for random-access
//! summarization.
//!
//! This crate provides the file-format codec used by the `sdbdump`
//! introspection tool:
//!
//! - `varint`: LEB128 varints and little-endian fixed-width primitives
//! - `header`: the human-readable ASCII file header
//! - `meta`: streams/candles metadata blocks with back-patched offsets
//! - `sample`: per-record codecs (Seconds, Quote, Trade) with delta
//!   compression across time and price
//! - `io`: the two-phase [`Writer`] state machine and the visitor-driven
//!   [`Reader`]
//!
//! Records within a second are delta-coded: the first quote and trade of a
//! second carry full prices and an absolute microsecond offset, later ones
//! carry differences. On close the writer back-patches every candle into the
//! slot reserved for it in the metadata section, so a finished file supports
//! candle lookups without scanning the record stream.

pub mod error;
pub mod header;
pub mod io;
pub mod meta;
pub mod sample;
pub mod varint;

/// Canonical on-disk price representation: a signed count of price steps.
pub type PriceT = i32;

pub use error::{Error, Result};
pub use header::{derive_px, FixedTz, Header, TzInfo, TzResolver, MIN_FILE_SIZE, VERSION};
pub use io::{
    filename, BookLevel, Instrument, PriceUnit, Reader, Sample, WritePhase, Writer, MAX_DEPTH,
};
pub use meta::{
    Candle, CandleHeader, CandlesMeta, Compression, StreamType, StreamsMeta, BEGIN_STREAM_DATA,
};
pub use sample::{Aggressor, PxLevel, QuoteSample, SecondsSample, Side, TradeSample};
