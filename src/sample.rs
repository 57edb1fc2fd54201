//! Per-record codecs for the three implemented streams: Seconds markers,
//! Quote snapshots and Trade events.
//!
//! Every record starts with one stream-header byte: the low 7 bits carry the
//! [`StreamType`], the high bit is the delta flag. Decoders work on byte
//! slices and return `Ok(None)` when the slice ends mid-record so the caller
//! can refill and retry; prices come back already resolved to absolute
//! price-step units.

use crate::error::{Error, Result};
use crate::meta::StreamType;
use crate::varint::{decode_sleb128, decode_uleb128, encode_sleb128, encode_uleb128};
use crate::PriceT;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Low 7 bits of the stream-header byte.
pub const STREAM_TYPE_MASK: u8 = 0x7F;
/// High bit of the stream-header byte.
pub const DELTA_BIT: u8 = 0x80;

pub(crate) fn stream_header(delta: bool, tp: StreamType) -> u8 {
    (tp as u8) | if delta { DELTA_BIT } else { 0 }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn to_char(self) -> char {
        match self {
            Side::Buy => 'B',
            Side::Sell => 'S',
        }
    }
}

/// Aggressor role of a trade, when the venue reports one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggressor {
    Undefined = 0,
    Aggressor = 1,
    Passive = 2,
}

impl Aggressor {
    pub fn to_char(self) -> char {
        match self {
            Aggressor::Undefined => ' ',
            Aggressor::Aggressor => 'A',
            Aggressor::Passive => 'P',
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            1 => Aggressor::Aggressor,
            2 => Aggressor::Passive,
            _ => Aggressor::Undefined,
        }
    }
}

/// Trade field mask, LSB first:
/// `{internal:1, aggr:2, side:1, has_qty:1, has_trade_id:1, has_order_id:1}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldMask(pub u8);

impl FieldMask {
    pub fn new(
        internal: bool,
        aggr: Aggressor,
        side: Side,
        has_qty: bool,
        has_trade_id: bool,
        has_order_id: bool,
    ) -> Self {
        let mut m = 0u8;
        if internal {
            m |= 1;
        }
        m |= (aggr as u8) << 1;
        if side == Side::Sell {
            m |= 1 << 3;
        }
        if has_qty {
            m |= 1 << 4;
        }
        if has_trade_id {
            m |= 1 << 5;
        }
        if has_order_id {
            m |= 1 << 6;
        }
        FieldMask(m)
    }

    pub fn internal(self) -> bool {
        self.0 & 1 != 0
    }
    pub fn aggr(self) -> Aggressor {
        Aggressor::from_bits(self.0 >> 1)
    }
    pub fn side(self) -> Side {
        if self.0 & (1 << 3) != 0 {
            Side::Sell
        } else {
            Side::Buy
        }
    }
    pub fn has_qty(self) -> bool {
        self.0 & (1 << 4) != 0
    }
    pub fn has_trade_id(self) -> bool {
        self.0 & (1 << 5) != 0
    }
    pub fn has_order_id(self) -> bool {
        self.0 & (1 << 6) != 0
    }
}

/// One price level: price in steps, signed quantity as stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PxLevel {
    pub px: PriceT,
    pub qty: i32,
}

/// Advances the reader's current second; resets the microsecond baseline and
/// both delta-price baselines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecondsSample {
    /// Seconds since UTC midnight.
    pub time: i32,
}

impl SecondsSample {
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.push(stream_header(false, StreamType::Seconds));
        encode_sleb128(self.time as i64, out);
    }

    /// `buf[0]` must be a Seconds stream-header byte.
    pub(crate) fn decode(buf: &[u8]) -> Option<(Self, usize)> {
        let (time, n) = decode_sleb128(buf.get(1..)?)?;
        Some((Self { time: time as i32 }, 1 + n))
    }
}

/// A decoded order-book snapshot. Levels are kept in storage order: bids in
/// ascending price up to the best bid, then asks ascending from the best ask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuoteSample {
    /// Microsecond field as stored: absolute within the current second for a
    /// full quote, difference from the previous record for a delta quote.
    pub time: u32,
    pub delta: bool,
    pub bid_cnt: usize,
    pub ask_cnt: usize,
    pub levels: Vec<PxLevel>,
}

impl QuoteSample {
    /// Bid levels, best first.
    pub fn bids(&self) -> impl Iterator<Item = &PxLevel> {
        self.levels[..self.bid_cnt].iter().rev()
    }

    /// Ask levels, best first.
    pub fn asks(&self) -> impl Iterator<Item = &PxLevel> {
        self.levels[self.bid_cnt..self.bid_cnt + self.ask_cnt].iter()
    }

    pub fn best_bid(&self) -> Option<&PxLevel> {
        self.bid_cnt.checked_sub(1).map(|i| &self.levels[i])
    }

    pub fn best_ask(&self) -> Option<&PxLevel> {
        if self.ask_cnt == 0 {
            None
        } else {
            self.levels.get(self.bid_cnt)
        }
    }

    /// Decode one quote record from `buf` (whose first byte is the stream
    /// header). `last_px` is the running quote-price baseline; it is updated
    /// to this record's first absolute price on success.
    pub(crate) fn decode(
        buf: &[u8],
        delta: bool,
        max_depth: u8,
        last_px: &mut Option<PriceT>,
        path: &Path,
        offset: u64,
    ) -> Result<Option<(Self, usize)>> {
        let mut at = 1usize;
        let Some((time, n)) = decode_uleb128(&buf[at.min(buf.len())..]) else {
            return Ok(None);
        };
        at += n;
        let Some(&cnt) = buf.get(at) else {
            return Ok(None);
        };
        at += 1;

        let bid_cnt = (cnt & 0x0F) as usize;
        let ask_cnt = ((cnt >> 4) & 0x0F) as usize;
        if bid_cnt > max_depth as usize || ask_cnt > max_depth as usize {
            return Err(Error::InvalidPriceLevelCount {
                path: path.to_path_buf(),
                bids: bid_cnt,
                asks: ask_cnt,
                max_depth,
            });
        }

        let total = bid_cnt + ask_cnt;
        let mut levels = Vec::with_capacity(total);
        let mut prev: Option<PriceT> = None;
        for _ in 0..total {
            let Some((px, n)) = decode_sleb128(&buf[at.min(buf.len())..]) else {
                return Ok(None);
            };
            at += n;
            let Some((qty, n)) = decode_sleb128(&buf[at.min(buf.len())..]) else {
                return Ok(None);
            };
            at += n;

            // first level is absolute (or baseline + delta); the rest are
            // running sums off the previous level
            let abs = match prev {
                Some(p) => p + px as PriceT,
                None if delta => {
                    let Some(base) = *last_px else {
                        return Err(Error::corrupt(path, offset, "delta quote without a price baseline"));
                    };
                    base + px as PriceT
                }
                None => px as PriceT,
            };
            prev = Some(abs);
            levels.push(PxLevel {
                px: abs,
                qty: qty as i32,
            });
        }

        if let Some(first) = levels.first() {
            *last_px = Some(first.px);
        }
        Ok(Some((
            QuoteSample {
                time: time as u32,
                delta,
                bid_cnt,
                ask_cnt,
                levels,
            },
            at,
        )))
    }
}

/// Writer-side quote encoding; `levels` carry the already delta-coded prices
/// in storage order.
pub(crate) fn encode_quote(
    out: &mut Vec<u8>,
    delta: bool,
    time: u32,
    levels: &[PxLevel],
    bid_cnt: usize,
    ask_cnt: usize,
) {
    out.push(stream_header(delta, StreamType::Quotes));
    encode_uleb128(time as u64, out);
    out.push(((ask_cnt as u8) << 4) | bid_cnt as u8);
    for l in &levels[..bid_cnt + ask_cnt] {
        encode_sleb128(l.px as i64, out);
        encode_sleb128(l.qty as i64, out);
    }
}

/// A decoded trade event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeSample {
    /// Microsecond field as stored (see [`QuoteSample::time`]).
    pub time: u32,
    pub delta: bool,
    pub internal: bool,
    pub aggr: Aggressor,
    pub side: Side,
    /// Absolute price in steps.
    pub px: PriceT,
    /// Zero when the mask carried no quantity.
    pub qty: i32,
    pub trade_id: Option<u64>,
    pub order_id: Option<u64>,
}

impl TradeSample {
    pub(crate) fn decode(
        buf: &[u8],
        delta: bool,
        last_px: &mut Option<PriceT>,
        path: &Path,
        offset: u64,
    ) -> Result<Option<(Self, usize)>> {
        let mut at = 1usize;
        let Some((time, n)) = decode_uleb128(&buf[at.min(buf.len())..]) else {
            return Ok(None);
        };
        at += n;
        let Some(&mask) = buf.get(at) else {
            return Ok(None);
        };
        let mask = FieldMask(mask);
        at += 1;

        let Some((px, n)) = decode_sleb128(&buf[at.min(buf.len())..]) else {
            return Ok(None);
        };
        at += n;
        let px = if delta {
            let Some(base) = *last_px else {
                return Err(Error::corrupt(path, offset, "delta trade without a price baseline"));
            };
            base + px as PriceT
        } else {
            px as PriceT
        };

        let mut qty = 0i32;
        if mask.has_qty() {
            let Some((q, n)) = decode_sleb128(&buf[at.min(buf.len())..]) else {
                return Ok(None);
            };
            at += n;
            qty = q as i32;
        }
        let mut trade_id = None;
        if mask.has_trade_id() {
            let Some((id, n)) = decode_uleb128(&buf[at.min(buf.len())..]) else {
                return Ok(None);
            };
            at += n;
            trade_id = Some(id);
        }
        let mut order_id = None;
        if mask.has_order_id() {
            let Some((id, n)) = decode_uleb128(&buf[at.min(buf.len())..]) else {
                return Ok(None);
            };
            at += n;
            order_id = Some(id);
        }

        *last_px = Some(px);
        Ok(Some((
            TradeSample {
                time: time as u32,
                delta,
                internal: mask.internal(),
                aggr: mask.aggr(),
                side: mask.side(),
                px,
                qty,
                trade_id,
                order_id,
            },
            at,
        )))
    }
}

/// Writer-side trade encoding; `px` is already delta-coded when `delta`.
pub(crate) fn encode_trade(
    out: &mut Vec<u8>,
    delta: bool,
    time: u32,
    mask: FieldMask,
    px: PriceT,
    qty: i32,
    trade_id: u64,
    order_id: u64,
) {
    out.push(stream_header(delta, StreamType::Trade));
    encode_uleb128(time as u64, out);
    out.push(mask.0);
    encode_sleb128(px as i64, out);
    if mask.has_qty() {
        encode_sleb128(qty as i64, out);
    }
    if mask.has_trade_id() {
        encode_uleb128(trade_id, out);
    }
    if mask.has_order_id() {
        encode_uleb128(order_id, out);
    }
}
