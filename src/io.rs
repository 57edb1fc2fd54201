//! File I/O: the two-phase writer state machine and the reader visitor loop.
//!
//! A writer moves through `Init → WrHeader → WrStreamsMeta → WrCandlesMeta →
//! WrData`; each transition is driven by the corresponding write call and any
//! out-of-order call fails with [`Error::InvalidWritePhase`]. Appending a
//! record emits a Seconds marker whenever the wall-clock second advances,
//! delta-codes prices and microsecond offsets within the second, and folds
//! trades into every candle resolution. Closing the writer back-patches the
//! candle arrays reserved in the metadata section.
//!
//! A reader parses the header and metadata blocks, verifies the begin-data
//! marker at the recorded data offset, then decodes records from a rolling
//! buffer, invoking a visitor for each one.

use crate::error::{Error, Result};
use crate::header::{Header, TzInfo, MIN_FILE_SIZE};
use crate::meta::{CandlesMeta, StreamType, StreamsMeta, BEGIN_STREAM_DATA};
use crate::sample::{
    encode_quote, encode_trade, Aggressor, FieldMask, PxLevel, QuoteSample, SecondsSample, Side,
    TradeSample, DELTA_BIT, STREAM_TYPE_MASK,
};
use crate::PriceT;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use time::{Date, Duration, OffsetDateTime};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Hard cap on book depth per side, dictated by the count-nibble encoding.
pub const MAX_DEPTH: u8 = 15;

/// Writer phases. `WrData` is terminal until close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WritePhase {
    Init,
    WrHeader,
    WrStreamsMeta,
    WrCandlesMeta,
    WrData,
}

/// Input price encoding, selected per write call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PriceUnit {
    /// Decimal price, divided by the price step (e.g. 1.10 with step 0.01).
    Double,
    /// Pre-scaled integer, divided by the price scale.
    Precision,
    /// Already counted in price steps; passed through.
    Steps,
}

impl PriceUnit {
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(PriceUnit::Double),
            1 => Ok(PriceUnit::Precision),
            2 => Ok(PriceUnit::Steps),
            c => Err(Error::UndefinedPriceUnit(c)),
        }
    }
}

/// One side level as supplied to [`Writer::write_quotes`], in the price unit
/// of the call.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BookLevel {
    pub px: f64,
    pub qty: i32,
}

/// Identity of the instrument a file records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instrument {
    pub exchange: String,
    pub symbol: String,
    pub instrument: String,
    pub secid: i64,
}

/// A decoded record handed to the read visitor. Quote and trade times are
/// absolute UTC, reconstructed from the current Seconds marker plus the
/// accumulated microsecond offsets.
#[derive(Debug, Clone, Serialize)]
pub enum Sample {
    Seconds(SecondsSample),
    Quote {
        time: OffsetDateTime,
        quote: QuoteSample,
    },
    Trade {
        time: OffsetDateTime,
        trade: TradeSample,
    },
}

/// Conventional path of a daily file: flat
/// `dir/YYYYMMDD.<xchg>.<symbol>.<instr>.sdb`, or nested
/// `dir/<xchg>/<symbol>/YYYY/MM/<instr>.YYYYMMDD.sdb`. Slashes in the
/// instrument segment are replaced with dashes.
pub fn filename(dir: impl AsRef<Path>, nested: bool, instr: &Instrument, date: Date) -> PathBuf {
    let safe = instr.instrument.replace('/', "-");
    let (y, m, d) = (date.year(), u8::from(date.month()), date.day());
    if nested {
        dir.as_ref()
            .join(&instr.exchange)
            .join(&instr.symbol)
            .join(format!("{y:04}"))
            .join(format!("{m:02}"))
            .join(format!("{safe}.{y:04}{m:02}{d:02}.sdb"))
    } else {
        dir.as_ref().join(format!(
            "{y:04}{m:02}{d:02}.{}.{}.{safe}.sdb",
            instr.exchange, instr.symbol
        ))
    }
}

fn pos_of<S: Seek>(s: &mut S) -> u64 {
    s.stream_position().unwrap_or(u64::MAX)
}

/// Appends one day of records for one instrument to a fresh file.
#[derive(Debug)]
pub struct Writer {
    file: File,
    path: PathBuf,
    header: Header,
    streams_meta: StreamsMeta,
    candles_meta: CandlesMeta,
    phase: WritePhase,
    /// Microseconds since epoch of the last written record.
    last_ts_us: i64,
    /// Seconds since midnight of the last written record.
    last_sec: i32,
    /// Microseconds within `last_sec` of the last written record.
    last_usec: i32,
    /// Next second that requires a Seconds marker; zero before the first.
    next_second: i32,
    last_quote_px: Option<PriceT>,
    last_trade_px: Option<PriceT>,
    committed: bool,
}

impl Writer {
    /// Create a new file and write its header. Fails if the file exists.
    /// A fresh v4 UUID is generated when none is supplied.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        path: impl Into<PathBuf>,
        instr: Instrument,
        date: Date,
        tz: TzInfo,
        depth: u8,
        px_step: f64,
        uuid: Option<Uuid>,
    ) -> Result<Writer> {
        let path = path.into();
        let uuid = uuid.unwrap_or_else(Uuid::new_v4);
        if depth > MAX_DEPTH {
            return Err(Error::InvalidHeader {
                path,
                reason: format!("depth {depth} exceeds the nibble limit of {MAX_DEPTH}"),
            });
        }
        if !(px_step > 0.0) {
            return Err(Error::InvalidHeader {
                path,
                reason: format!("px-step must be positive, got {px_step}"),
            });
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| Error::io(&path, 0, e))?;
            }
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| Error::io(&path, 0, e))?;

        let header = Header::new(
            instr.exchange,
            instr.symbol,
            instr.instrument,
            instr.secid,
            date,
            tz,
            depth,
            px_step,
            uuid,
        );
        header
            .write_to(&mut file)
            .map_err(|e| Error::io(&path, 0, e))?;

        info!(path = %path.display(), symbol = %header.symbol, "created sdb file");
        Ok(Writer {
            file,
            path,
            header,
            streams_meta: StreamsMeta::new(Vec::new()),
            candles_meta: CandlesMeta::default(),
            phase: WritePhase::WrHeader,
            last_ts_us: i64::MIN,
            last_sec: 0,
            last_usec: 0,
            next_second: 0,
            last_quote_px: None,
            last_trade_px: None,
            committed: false,
        })
    }

    /// Create a file at its conventional location under `dir`.
    #[allow(clippy::too_many_arguments)]
    pub fn create_in(
        dir: impl AsRef<Path>,
        nested: bool,
        instr: Instrument,
        date: Date,
        tz: TzInfo,
        depth: u8,
        px_step: f64,
        uuid: Option<Uuid>,
    ) -> Result<Writer> {
        let path = filename(dir, nested, &instr, date);
        Writer::create(path, instr, date, tz, depth, px_step, uuid)
    }

    pub fn info(&self) -> &Header {
        &self.header
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_phase(&self, op: &'static str, want: WritePhase) -> Result<()> {
        if self.phase != want {
            return Err(Error::InvalidWritePhase {
                path: self.path.clone(),
                op,
                phase: self.phase,
            });
        }
        Ok(())
    }

    /// Write the stream list, reserving the begin-data offset slot.
    pub fn write_streams_meta(&mut self, streams: Vec<StreamType>) -> Result<()> {
        self.ensure_phase("write_streams_meta", WritePhase::WrHeader)?;
        let mut meta = StreamsMeta::new(streams);
        meta.write_to(&mut self.file, &self.path)?;
        self.streams_meta = meta;
        self.phase = WritePhase::WrStreamsMeta;
        Ok(())
    }

    /// Write the candle index (empty arrays reserved for back-patching on
    /// close), patch the begin-data offset, and emit the begin-data marker.
    pub fn write_candles_meta(&mut self, mut meta: CandlesMeta) -> Result<()> {
        self.ensure_phase("write_candles_meta", WritePhase::WrStreamsMeta)?;
        meta.write_to(&mut self.file, &self.path)?;
        self.candles_meta = meta;
        self.phase = WritePhase::WrCandlesMeta;

        let data_offset = self
            .file
            .stream_position()
            .map_err(|e| Error::io(&self.path, u64::MAX, e))?;
        self.streams_meta
            .patch_data_offset(&mut self.file, data_offset as u32, &self.path)?;
        self.file
            .write_all(&BEGIN_STREAM_DATA.to_le_bytes())
            .map_err(|e| Error::io(&self.path, data_offset, e))?;

        debug!(data_offset, "begin-data marker written");
        self.phase = WritePhase::WrData;
        Ok(())
    }

    /// Append a book snapshot. `bids` and `asks` are both best-first in the
    /// unit given; an empty book is a no-op.
    pub fn write_quotes(
        &mut self,
        ts: OffsetDateTime,
        unit: PriceUnit,
        bids: &[BookLevel],
        asks: &[BookLevel],
    ) -> Result<()> {
        if bids.is_empty() && asks.is_empty() {
            return Ok(());
        }
        self.ensure_phase("write_quotes", WritePhase::WrData)?;

        let max_depth = self.header.depth.min(MAX_DEPTH);
        if bids.len() > max_depth as usize || asks.len() > max_depth as usize {
            return Err(Error::InvalidPriceLevelCount {
                path: self.path.clone(),
                bids: bids.len(),
                asks: asks.len(),
                max_depth,
            });
        }

        let (ts_us, sec, usec) = self.split_ts(ts);
        self.check_order(ts_us)?;
        let prev_usec = self.last_usec;
        self.write_seconds(sec, usec, ts_us)?;

        let delta = self.last_quote_px.is_some();
        let time_field = (if delta { usec - prev_usec } else { usec }) as u32;

        // storage order: bids worst to best, then asks best to worst; the
        // first level is absolute (or baseline-relative), the rest are
        // diffs off the previous level
        let mut levels = Vec::with_capacity(bids.len() + asks.len());
        let mut prev_px: Option<PriceT> = None;
        let mut first_abs: PriceT = 0;
        for l in bids.iter().rev().chain(asks.iter()) {
            let px = self.normalize_px(unit, l.px);
            let coded = match prev_px {
                Some(p) => px - p,
                None => {
                    first_abs = px;
                    match self.last_quote_px {
                        Some(base) => px - base,
                        None => px,
                    }
                }
            };
            prev_px = Some(px);
            levels.push(PxLevel {
                px: coded,
                qty: l.qty,
            });
        }

        let mut buf = Vec::with_capacity(8 + levels.len() * 10);
        encode_quote(&mut buf, delta, time_field, &levels, bids.len(), asks.len());
        let at = pos_of(&mut self.file);
        self.file
            .write_all(&buf)
            .map_err(|e| Error::io(&self.path, at, e))?;
        self.last_quote_px = Some(first_abs);
        Ok(())
    }

    /// Append a trade and fold it into every candle resolution.
    #[allow(clippy::too_many_arguments)]
    pub fn write_trade(
        &mut self,
        ts: OffsetDateTime,
        unit: PriceUnit,
        side: Side,
        px: f64,
        qty: i32,
        aggr: Aggressor,
        order_id: Option<u64>,
        trade_id: Option<u64>,
    ) -> Result<()> {
        self.ensure_phase("write_trade", WritePhase::WrData)?;

        let (ts_us, sec, usec) = self.split_ts(ts);
        self.check_order(ts_us)?;
        let prev_usec = self.last_usec;
        self.write_seconds(sec, usec, ts_us)?;

        let px_abs = self.normalize_px(unit, px);
        let delta = self.last_trade_px.is_some();
        let coded = match self.last_trade_px {
            Some(base) => px_abs - base,
            None => px_abs,
        };
        let time_field = (if delta { usec - prev_usec } else { usec }) as u32;

        let mask = FieldMask::new(
            false,
            aggr,
            side,
            qty != 0,
            trade_id.is_some(),
            order_id.is_some(),
        );
        let mut buf = Vec::with_capacity(24);
        encode_trade(
            &mut buf,
            delta,
            time_field,
            mask,
            coded,
            qty,
            trade_id.unwrap_or(0),
            order_id.unwrap_or(0),
        );
        let at = pos_of(&mut self.file);
        self.file
            .write_all(&buf)
            .map_err(|e| Error::io(&self.path, at, e))?;
        self.last_trade_px = Some(px_abs);

        let signed_qty = if side == Side::Sell { -qty } else { qty };
        self.candles_meta
            .update_candles(self.last_sec, px_abs, signed_qty);
        Ok(())
    }

    /// Finalize: flush every candle's contents into its reserved slot.
    pub fn close(mut self) -> Result<()> {
        self.commit()
    }

    fn commit(&mut self) -> Result<()> {
        if self.committed {
            return Ok(());
        }
        self.candles_meta.commit(&mut self.file, &self.path)?;
        self.file
            .flush()
            .map_err(|e| Error::io(&self.path, u64::MAX, e))?;
        self.committed = true;
        info!(path = %self.path.display(), "sdb file closed, candles committed");
        Ok(())
    }

    /// Emit a Seconds marker if `sec` starts a new wall-clock second.
    ///
    /// Stamps candle data offsets before the marker byte so the offset points
    /// at the first record of the candle, and invalidates both delta-price
    /// baselines. Returns whether a marker was written.
    fn write_seconds(&mut self, sec: i32, usec: i32, ts_us: i64) -> Result<bool> {
        self.last_ts_us = ts_us;
        self.last_sec = sec;
        self.last_usec = usec;

        if self.next_second != 0 && sec < self.next_second {
            return Ok(false);
        }

        let at = self
            .file
            .stream_position()
            .map_err(|e| Error::io(&self.path, u64::MAX, e))?;
        self.candles_meta.update_data_offset(sec, at);

        let mut buf = Vec::with_capacity(8);
        SecondsSample { time: sec }.encode(&mut buf);
        self.file
            .write_all(&buf)
            .map_err(|e| Error::io(&self.path, at, e))?;

        self.next_second = sec + 1;
        self.last_quote_px = None;
        self.last_trade_px = None;
        Ok(true)
    }

    fn normalize_px(&self, unit: PriceUnit, px: f64) -> PriceT {
        match unit {
            PriceUnit::Double => (px / self.header.px_step).round() as PriceT,
            PriceUnit::Precision => (px / self.header.px_scale.max(1) as f64).round() as PriceT,
            PriceUnit::Steps => px.round() as PriceT,
        }
    }

    /// `(microseconds since epoch, seconds since midnight, microseconds
    /// within the second)`.
    fn split_ts(&self, ts: OffsetDateTime) -> (i64, i32, i32) {
        let ts_us = ts.unix_timestamp() * 1_000_000 + ts.microsecond() as i64;
        let mid_us = self.header.midnight().unix_timestamp() * 1_000_000;
        let rel = ts_us - mid_us;
        (
            ts_us,
            rel.div_euclid(1_000_000) as i32,
            rel.rem_euclid(1_000_000) as i32,
        )
    }

    fn check_order(&self, ts_us: i64) -> Result<()> {
        if ts_us < self.last_ts_us {
            return Err(Error::OutOfOrderTimestamp {
                path: self.path.clone(),
                ts_us,
                last_us: self.last_ts_us,
            });
        }
        Ok(())
    }
}

impl Drop for Writer {
    fn drop(&mut self) {
        // best effort for abandoned writers; close() reports errors properly
        if let Err(e) = self.commit() {
            warn!(path = %self.path.display(), error = %e, "candle commit failed on drop");
        }
    }
}

const READ_CHUNK: usize = 64 * 1024;
/// Upper bound on a single encoded record; a buffer this full that still
/// cannot decode is corrupt rather than short.
const MAX_RECORD: usize = 4096;

/// Sequential reader over a finished file.
#[derive(Debug)]
pub struct Reader {
    file: File,
    path: PathBuf,
    header: Header,
    streams_meta: StreamsMeta,
    candles_meta: CandlesMeta,
}

impl Reader {
    pub fn open(path: impl Into<PathBuf>) -> Result<Reader> {
        let path = path.into();
        let file = File::open(&path).map_err(|e| Error::io(&path, 0, e))?;
        let size = file
            .metadata()
            .map_err(|e| Error::io(&path, 0, e))?
            .len();
        if size < MIN_FILE_SIZE {
            return Err(Error::InvalidHeader {
                path,
                reason: format!("file size {size} below minimum {MIN_FILE_SIZE}"),
            });
        }

        let mut br = BufReader::new(file);
        let header = Header::read_from(&mut br, &path)?;
        let streams_meta = StreamsMeta::read_from(&mut br, &path)?;
        let candles_meta = CandlesMeta::read_from(&mut br, &path)?;
        let file = br.into_inner();

        info!(
            path = %path.display(),
            symbol = %header.symbol,
            streams = streams_meta.streams.len(),
            resolutions = candles_meta.headers.len(),
            "opened sdb file"
        );
        Ok(Reader {
            file,
            path,
            header,
            streams_meta,
            candles_meta,
        })
    }

    pub fn info(&self) -> &Header {
        &self.header
    }

    pub fn streams(&self) -> &[StreamType] {
        &self.streams_meta.streams
    }

    pub fn candles(&self) -> &CandlesMeta {
        &self.candles_meta
    }

    /// File position of the begin-data marker, as back-patched on write.
    pub fn data_offset(&self) -> u32 {
        self.streams_meta.data_offset
    }

    /// Decode the record stream, invoking `visitor` for every record in file
    /// order. The visitor returns `false` to stop early. Can be called again
    /// to replay from the start of the data section.
    pub fn read(&mut self, mut visitor: impl FnMut(Sample) -> bool) -> Result<()> {
        let data_off = self.streams_meta.data_offset as u64;
        self.file
            .seek(SeekFrom::Start(data_off))
            .map_err(|e| Error::io(&self.path, data_off, e))?;

        let mut marker = [0u8; 4];
        self.file
            .read_exact(&mut marker)
            .map_err(|e| Error::io(&self.path, data_off, e))?;
        let marker = u32::from_le_bytes(marker);
        if marker != BEGIN_STREAM_DATA {
            return Err(Error::InvalidMarker {
                path: self.path.clone(),
                offset: data_off,
                expected: BEGIN_STREAM_DATA,
                found: marker,
            });
        }

        let midnight = self.header.midnight();
        let mut cur_sec = 0i32;
        let mut cur_usec = 0i32;
        let mut last_quote_px: Option<PriceT> = None;
        let mut last_trade_px: Option<PriceT> = None;

        let mut buf: Vec<u8> = Vec::with_capacity(READ_CHUNK);
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut start = 0usize;
        let mut offset = data_off + 4; // file offset of buf[start]
        let mut eof = false;

        loop {
            let avail = &buf[start..];
            let consumed = if avail.is_empty() {
                None
            } else {
                let hdr = avail[0];
                let delta = hdr & DELTA_BIT != 0;
                let code = hdr & STREAM_TYPE_MASK;
                match StreamType::from_code(code) {
                    None => {
                        return Err(Error::corrupt(
                            &self.path,
                            offset,
                            format!("unknown stream type {code}"),
                        ))
                    }
                    Some(StreamType::Seconds) => match SecondsSample::decode(avail) {
                        Some((s, n)) => {
                            cur_sec = s.time;
                            cur_usec = 0;
                            last_quote_px = None;
                            last_trade_px = None;
                            if !visitor(Sample::Seconds(s)) {
                                return Ok(());
                            }
                            Some(n)
                        }
                        None => None,
                    },
                    Some(StreamType::Quotes) => {
                        match QuoteSample::decode(
                            avail,
                            delta,
                            self.header.depth,
                            &mut last_quote_px,
                            &self.path,
                            offset,
                        )? {
                            Some((quote, n)) => {
                                if delta {
                                    cur_usec += quote.time as i32;
                                } else {
                                    cur_usec = quote.time as i32;
                                }
                                let time = midnight
                                    + Duration::seconds(cur_sec as i64)
                                    + Duration::microseconds(cur_usec as i64);
                                if !visitor(Sample::Quote { time, quote }) {
                                    return Ok(());
                                }
                                Some(n)
                            }
                            None => None,
                        }
                    }
                    Some(StreamType::Trade) => {
                        match TradeSample::decode(
                            avail,
                            delta,
                            &mut last_trade_px,
                            &self.path,
                            offset,
                        )? {
                            Some((trade, n)) => {
                                if delta {
                                    cur_usec += trade.time as i32;
                                } else {
                                    cur_usec = trade.time as i32;
                                }
                                let time = midnight
                                    + Duration::seconds(cur_sec as i64)
                                    + Duration::microseconds(cur_usec as i64);
                                if !visitor(Sample::Trade { time, trade }) {
                                    return Ok(());
                                }
                                Some(n)
                            }
                            None => None,
                        }
                    }
                    Some(other) => {
                        return Err(Error::corrupt(
                            &self.path,
                            offset,
                            format!("unsupported stream type {other:?}"),
                        ))
                    }
                }
            };

            match consumed {
                Some(n) => {
                    start += n;
                    offset += n as u64;
                }
                None => {
                    // need more bytes
                    if eof {
                        if start < buf.len() {
                            return Err(Error::corrupt(
                                &self.path,
                                offset,
                                "truncated record at end of file",
                            ));
                        }
                        return Ok(());
                    }
                    if buf.len() - start > MAX_RECORD {
                        return Err(Error::corrupt(
                            &self.path,
                            offset,
                            "record exceeds maximum encoded size",
                        ));
                    }
                    buf.drain(..start);
                    start = 0;
                    let n = self
                        .file
                        .read(&mut chunk)
                        .map_err(|e| Error::io(&self.path, offset, e))?;
                    if n == 0 {
                        eof = true;
                    } else {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
    }
}
