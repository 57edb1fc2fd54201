//! Binary metadata blocks: stream list, candle index, and the bookmark
//! primitive used to back-patch reserved offset slots.
//!
//! Layout after the ASCII header:
//! - `StreamsMeta`: tag `0x01`, compression byte, `u32` data offset
//!   (back-patched), stream count, `{0x02, type}` per stream
//! - `CandlesMeta`: tag `0x03`, filler, `u16` resolution count, one 16-byte
//!   `CandleHeader` block per resolution (offset slot back-patched), then the
//!   candle arrays themselves
//! - begin-data marker `0xABBABABA`
//!
//! All integers are little-endian. Candle records are 32 bytes.

use crate::error::{Error, Result};
use crate::varint::{put_u16_le, put_u32_le, put_u64_le};
use crate::PriceT;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::{Deref, DerefMut};
use std::path::Path;

/// Marker written immediately before the record stream.
pub const BEGIN_STREAM_DATA: u32 = 0xABBA_BABA;

/// Scoped save/restore of a stream position.
///
/// Seeks to the requested position on construction and restores the saved
/// position when dropped, so back-patching never disturbs the append cursor
/// regardless of how the patching scope exits.
pub(crate) struct Bookmark<'f, F: Seek> {
    file: &'f mut F,
    saved: u64,
}

impl<'f, F: Seek> Bookmark<'f, F> {
    pub fn seek_to(file: &'f mut F, pos: u64) -> std::io::Result<Self> {
        let saved = file.stream_position()?;
        file.seek(SeekFrom::Start(pos))?;
        Ok(Self { file, saved })
    }
}

impl<F: Seek> Deref for Bookmark<'_, F> {
    type Target = F;
    fn deref(&self) -> &F {
        self.file
    }
}

impl<F: Seek> DerefMut for Bookmark<'_, F> {
    fn deref_mut(&mut self) -> &mut F {
        self.file
    }
}

impl<F: Seek> Drop for Bookmark<'_, F> {
    fn drop(&mut self) {
        let _ = self.file.seek(SeekFrom::Start(self.saved));
    }
}

fn pos_of<S: Seek>(s: &mut S) -> u64 {
    s.stream_position().unwrap_or(u64::MAX)
}

/// Stream kinds a file may carry. `Order`, `Summary` and `Message` are
/// reserved by the format; this codec refuses to decode their bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum StreamType {
    Seconds = 0,
    Quotes = 1,
    Trade = 2,
    Order = 3,
    Summary = 4,
    Message = 5,
}

impl StreamType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(StreamType::Seconds),
            1 => Some(StreamType::Quotes),
            2 => Some(StreamType::Trade),
            3 => Some(StreamType::Order),
            4 => Some(StreamType::Summary),
            5 => Some(StreamType::Message),
            _ => None,
        }
    }
}

/// Declared compression of the data section. Only `None` is ever written;
/// `GZip` is a reserved value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum Compression {
    None = 0,
    GZip = 1,
}

/// Stream metadata block, first binary block after the ASCII header.
#[derive(Debug, Clone)]
pub struct StreamsMeta {
    pub compression: Compression,
    /// File position of the begin-data marker; zero until back-patched.
    pub data_offset: u32,
    /// Position of the `data_offset` slot itself, remembered for patching.
    data_offset_pos: u64,
    pub streams: Vec<StreamType>,
}

impl StreamsMeta {
    pub const CODE: u8 = 0x01;
    pub const STREAM_CODE: u8 = 0x02;

    pub fn new(streams: Vec<StreamType>) -> Self {
        Self {
            compression: Compression::None,
            data_offset: 0,
            data_offset_pos: 0,
            streams,
        }
    }

    pub fn write_to<W: Write + Seek>(&mut self, w: &mut W, path: &Path) -> Result<()> {
        let head = [Self::CODE, self.compression as u8];
        w.write_all(&head)
            .map_err(|e| Error::io(path, pos_of(w), e))?;

        self.data_offset_pos = w
            .stream_position()
            .map_err(|e| Error::io(path, u64::MAX, e))?;

        let mut buf = Vec::with_capacity(5 + self.streams.len() * 2);
        put_u32_le(&mut buf, 0); // data offset, patched after CandlesMeta
        buf.push(self.streams.len() as u8);
        for st in &self.streams {
            buf.push(Self::STREAM_CODE);
            buf.push(*st as u8);
        }
        w.write_all(&buf)
            .map_err(|e| Error::io(path, pos_of(w), e))
    }

    /// Back-patch the reserved data-offset slot, leaving the cursor intact.
    pub fn patch_data_offset<W: Write + Seek>(
        &mut self,
        w: &mut W,
        data_offset: u32,
        path: &Path,
    ) -> Result<()> {
        self.data_offset = data_offset;
        let mut bm = Bookmark::seek_to(w, self.data_offset_pos)
            .map_err(|e| Error::io(path, self.data_offset_pos, e))?;
        bm.write_all(&data_offset.to_le_bytes())
            .map_err(|e| Error::io(path, self.data_offset_pos, e))
    }

    pub fn read_from<R: Read + Seek>(r: &mut R, path: &Path) -> Result<Self> {
        let start = pos_of(r);
        let mut head = [0u8; 7];
        r.read_exact(&mut head)
            .map_err(|e| Error::io(path, start, e))?;

        if head[0] != Self::CODE {
            return Err(Error::InvalidMarker {
                path: path.to_path_buf(),
                offset: start,
                expected: Self::CODE as u32,
                found: head[0] as u32,
            });
        }
        let compression = match head[1] {
            0 => Compression::None,
            1 => Compression::GZip,
            c => return Err(Error::corrupt(path, start + 1, format!("bad compression byte {c}"))),
        };
        let data_offset = u32::from_le_bytes([head[2], head[3], head[4], head[5]]);
        let count = head[6] as usize;

        let mut entries = vec![0u8; count * 2];
        r.read_exact(&mut entries)
            .map_err(|e| Error::io(path, pos_of(r), e))?;

        let mut streams = Vec::with_capacity(count);
        for (i, pair) in entries.chunks_exact(2).enumerate() {
            let off = start + 7 + (i as u64) * 2;
            if pair[0] != Self::STREAM_CODE {
                return Err(Error::InvalidMarker {
                    path: path.to_path_buf(),
                    offset: off,
                    expected: Self::STREAM_CODE as u32,
                    found: pair[0] as u32,
                });
            }
            let st = StreamType::from_code(pair[1])
                .ok_or_else(|| Error::corrupt(path, off + 1, format!("bad stream type {}", pair[1])))?;
            streams.push(st);
        }

        Ok(Self {
            compression,
            data_offset,
            data_offset_pos: start + 2,
            streams,
        })
    }
}

/// One aggregation window: OHLC in price steps, buy/sell volumes, and the
/// file position of the first record inside the window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candle {
    pub open: PriceT,
    pub high: PriceT,
    pub low: PriceT,
    pub close: PriceT,
    pub buy_vol: u32,
    pub sell_vol: u32,
    pub data_offset: u64,
}

impl Candle {
    /// On-disk size: six 32-bit fields plus the 64-bit data offset.
    pub const DISK_SIZE: usize = 32;

    pub fn volume(&self) -> u64 {
        self.buy_vol as u64 + self.sell_vol as u64
    }

    pub fn is_empty(&self) -> bool {
        *self == Candle::default()
    }

    fn encode(&self, out: &mut Vec<u8>) {
        put_u32_le(out, self.open as u32);
        put_u32_le(out, self.high as u32);
        put_u32_le(out, self.low as u32);
        put_u32_le(out, self.close as u32);
        put_u32_le(out, self.buy_vol);
        put_u32_le(out, self.sell_vol);
        put_u64_le(out, self.data_offset);
    }

    fn decode(buf: &[u8; Self::DISK_SIZE]) -> Self {
        let u32_at = |i: usize| u32::from_le_bytes([buf[i], buf[i + 1], buf[i + 2], buf[i + 3]]);
        Candle {
            open: u32_at(0) as PriceT,
            high: u32_at(4) as PriceT,
            low: u32_at(8) as PriceT,
            close: u32_at(12) as PriceT,
            buy_vol: u32_at(16),
            sell_vol: u32_at(20),
            data_offset: u64::from_le_bytes([
                buf[24], buf[25], buf[26], buf[27], buf[28], buf[29], buf[30], buf[31],
            ]),
        }
    }
}

/// Candle index for one resolution.
#[derive(Debug, Clone)]
pub struct CandleHeader {
    /// Seconds per candle.
    pub resolution: u16,
    /// Start of the indexed range, seconds since UTC midnight.
    pub start_time: u32,
    /// File position of this resolution's candle array; zero until the
    /// metadata block is written.
    data_offset: u64,
    last_updated: Option<usize>,
    candles: Vec<Candle>,
}

impl CandleHeader {
    pub const CODE: u8 = 0x04;

    /// `start_time`/`end_time` in seconds since midnight; the candle array
    /// holds `ceil((end - start) / resolution)` entries.
    pub fn new(resolution: u16, start_time: u32, end_time: u32) -> Self {
        assert!(resolution > 0, "candle resolution must be positive");
        assert!(end_time > start_time, "candle range must not be empty");
        let count = (end_time - start_time).div_ceil(resolution as u32) as usize;
        Self {
            resolution,
            start_time,
            data_offset: 0,
            last_updated: None,
            candles: vec![Candle::default(); count],
        }
    }

    fn from_parts(resolution: u16, start_time: u32, count: usize, data_offset: u64) -> Self {
        Self {
            resolution,
            start_time,
            data_offset,
            last_updated: None,
            candles: vec![Candle::default(); count],
        }
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    /// Position of this resolution's candle array in the file.
    pub fn candle_data_offset(&self) -> u64 {
        self.data_offset
    }

    /// Start time of the candle at `idx`, seconds since midnight.
    pub fn candle_to_time(&self, idx: usize) -> u32 {
        self.start_time + self.resolution as u32 * idx as u32
    }

    /// Index of the candle covering `ts` (seconds since midnight).
    pub fn time_to_idx(&self, ts: i32) -> Option<usize> {
        if ts < self.start_time as i32 {
            return None;
        }
        let idx = (ts - self.start_time as i32) as usize / self.resolution as usize;
        (idx < self.candles.len()).then_some(idx)
    }

    /// Fold a trade into the covering candle. Returns false when `ts` is
    /// outside the indexed range.
    pub fn update_candle(&mut self, ts: i32, px: PriceT, qty: i32) -> bool {
        let Some(idx) = self.time_to_idx(ts) else {
            return false;
        };
        let c = &mut self.candles[idx];
        if c.open == 0 {
            c.open = px;
        }
        if c.high < px {
            c.high = px;
        }
        if c.low > px || c.low == 0 {
            c.low = px;
        }
        c.close = px;
        if qty > 0 {
            c.buy_vol += qty as u32;
        } else if qty < 0 {
            c.sell_vol += (-qty) as u32;
        }
        self.last_updated = Some(idx);
        true
    }

    /// Stamp the covering candle's data offset if `ts` starts a new candle.
    pub fn update_data_offset(&mut self, ts: i32, data_offset: u64) {
        let Some(idx) = self.time_to_idx(ts) else {
            return;
        };
        if self.last_updated == Some(idx) {
            return;
        }
        self.candles[idx].data_offset = data_offset;
        self.last_updated = Some(idx);
    }

    /// Rewrite this resolution's candle array into its reserved slot.
    pub fn commit<W: Write + Seek>(&self, w: &mut W, path: &Path) -> Result<()> {
        let mut buf = Vec::with_capacity(self.candles.len() * Candle::DISK_SIZE);
        for c in &self.candles {
            c.encode(&mut buf);
        }
        let mut bm = Bookmark::seek_to(w, self.data_offset)
            .map_err(|e| Error::io(path, self.data_offset, e))?;
        bm.write_all(&buf)
            .map_err(|e| Error::io(path, self.data_offset, e))
    }
}

/// The candle index: one [`CandleHeader`] per resolution, all updated from
/// the same trade stream.
#[derive(Debug, Clone, Default)]
pub struct CandlesMeta {
    pub headers: Vec<CandleHeader>,
}

impl CandlesMeta {
    pub const CODE: u8 = 0x03;

    pub fn new(headers: Vec<CandleHeader>) -> Self {
        Self { headers }
    }

    /// Write the candle metadata and the (still empty) candle arrays,
    /// back-patching each header's array-offset slot as the array position
    /// becomes known.
    pub fn write_to<W: Write + Seek>(&mut self, w: &mut W, path: &Path) -> Result<()> {
        let mut buf = Vec::with_capacity(4);
        buf.push(Self::CODE);
        buf.push(0); // filler
        put_u16_le(&mut buf, self.headers.len() as u16);
        w.write_all(&buf)
            .map_err(|e| Error::io(path, pos_of(w), e))?;

        // 16-byte header blocks; remember where each data-offset slot sits
        let mut slots = Vec::with_capacity(self.headers.len());
        for hdr in &self.headers {
            let at = w
                .stream_position()
                .map_err(|e| Error::io(path, u64::MAX, e))?;
            slots.push(at + 12);

            buf.clear();
            buf.push(CandleHeader::CODE);
            buf.push(0); // filler
            put_u16_le(&mut buf, hdr.resolution);
            put_u32_le(&mut buf, hdr.start_time);
            put_u32_le(&mut buf, hdr.candles.len() as u32);
            put_u32_le(&mut buf, 0); // array offset, patched below
            w.write_all(&buf)
                .map_err(|e| Error::io(path, pos_of(w), e))?;
        }

        for (hdr, slot) in self.headers.iter_mut().zip(slots) {
            let at = w
                .stream_position()
                .map_err(|e| Error::io(path, u64::MAX, e))?;
            hdr.data_offset = at;
            {
                let mut bm =
                    Bookmark::seek_to(w, slot).map_err(|e| Error::io(path, slot, e))?;
                bm.write_all(&(at as u32).to_le_bytes())
                    .map_err(|e| Error::io(path, slot, e))?;
            }

            buf.clear();
            for c in &hdr.candles {
                c.encode(&mut buf);
            }
            w.write_all(&buf)
                .map_err(|e| Error::io(path, pos_of(w), e))?;
        }
        Ok(())
    }

    pub fn read_from<R: Read + Seek>(r: &mut R, path: &Path) -> Result<Self> {
        let start = pos_of(r);
        let mut head = [0u8; 4];
        r.read_exact(&mut head)
            .map_err(|e| Error::io(path, start, e))?;
        if head[0] != Self::CODE {
            return Err(Error::InvalidMarker {
                path: path.to_path_buf(),
                offset: start,
                expected: Self::CODE as u32,
                found: head[0] as u32,
            });
        }
        if head[1] != 0 {
            return Err(Error::corrupt(path, start + 1, format!("bad filler byte {}", head[1])));
        }
        let count = u16::from_le_bytes([head[2], head[3]]) as usize;

        let mut headers = Vec::with_capacity(count);
        for i in 0..count {
            let at = start + 4 + (i as u64) * 16;
            let mut block = [0u8; 16];
            r.read_exact(&mut block)
                .map_err(|e| Error::io(path, at, e))?;
            if block[0] != CandleHeader::CODE {
                return Err(Error::InvalidMarker {
                    path: path.to_path_buf(),
                    offset: at,
                    expected: CandleHeader::CODE as u32,
                    found: block[0] as u32,
                });
            }
            if block[1] != 0 {
                return Err(Error::corrupt(path, at + 1, format!("bad filler byte {}", block[1])));
            }
            let resolution = u16::from_le_bytes([block[2], block[3]]);
            let start_time = u32::from_le_bytes([block[4], block[5], block[6], block[7]]);
            let candle_cnt = u32::from_le_bytes([block[8], block[9], block[10], block[11]]);
            let data_offset = u32::from_le_bytes([block[12], block[13], block[14], block[15]]);
            if resolution == 0 {
                return Err(Error::corrupt(path, at + 2, "zero candle resolution"));
            }
            headers.push(CandleHeader::from_parts(
                resolution,
                start_time,
                candle_cnt as usize,
                data_offset as u64,
            ));
        }

        for hdr in &mut headers {
            let mut raw = vec![0u8; hdr.candles.len() * Candle::DISK_SIZE];
            r.read_exact(&mut raw)
                .map_err(|e| Error::io(path, hdr.data_offset, e))?;
            for (c, chunk) in hdr
                .candles
                .iter_mut()
                .zip(raw.chunks_exact(Candle::DISK_SIZE))
            {
                let mut arr = [0u8; Candle::DISK_SIZE];
                arr.copy_from_slice(chunk);
                *c = Candle::decode(&arr);
            }
        }

        Ok(Self { headers })
    }

    /// Stamp the data offset of every resolution whose candle at `ts` is new.
    pub fn update_data_offset(&mut self, ts: i32, data_offset: u64) {
        for hdr in &mut self.headers {
            hdr.update_data_offset(ts, data_offset);
        }
    }

    /// Fold a trade into every resolution.
    pub fn update_candles(&mut self, ts: i32, px: PriceT, qty: i32) {
        for hdr in &mut self.headers {
            hdr.update_candle(ts, px, qty);
        }
    }

    /// Flush all candle arrays back into their reserved slots.
    pub fn commit<W: Write + Seek>(&self, w: &mut W, path: &Path) -> Result<()> {
        for hdr in &self.headers {
            hdr.commit(w, path)?;
        }
        Ok(())
    }
}
