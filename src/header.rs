//! ASCII file header: parse and emit.
//!
//! The header is line-oriented, human readable, and ends with a single blank
//! line. Emitting a parsed header reproduces it byte for byte; the price
//! step is printed with its derived precision so floating point formatting
//! stays stable across round trips.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, Write};
use std::path::Path;
use time::{Date, Month, OffsetDateTime};
use uuid::Uuid;

/// Version of the format this codec reads and writes.
pub const VERSION: u32 = 1;

/// Smallest byte count a well-formed file can have.
pub const MIN_FILE_SIZE: u64 = 165;

const SHEBANG: &str = "#!/usr/bin/env sdb";

/// Resolves an IANA or exchange-local time-zone name to a UTC offset.
///
/// The codec itself never consults the environment; callers that need
/// name-to-offset resolution inject an implementation of this trait and pass
/// the resolved offset in.
pub trait TzResolver {
    fn utc_offset_secs(&self, tz_name: &str, date: Date) -> Option<i32>;
}

/// Resolver for a zone whose offset is known up front (no DST handling).
pub struct FixedTz(pub i32);

impl TzResolver for FixedTz {
    fn utc_offset_secs(&self, _tz_name: &str, _date: Date) -> Option<i32> {
        Some(self.0)
    }
}

/// A resolved time zone: name plus signed offset in seconds east of UTC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TzInfo {
    pub name: String,
    pub offset_secs: i32,
}

impl TzInfo {
    pub fn new(name: impl Into<String>, offset_secs: i32) -> Self {
        Self {
            name: name.into(),
            offset_secs,
        }
    }

    pub fn resolve(name: impl Into<String>, date: Date, resolver: &dyn TzResolver) -> Option<Self> {
        let name = name.into();
        let offset_secs = resolver.utc_offset_secs(&name, date)?;
        Some(Self { name, offset_secs })
    }

    /// `±HHMM NAME` as printed in the `utc-date:` header line.
    pub fn hhmm(&self) -> String {
        let sign = if self.offset_secs < 0 { '-' } else { '+' };
        let n = self.offset_secs.unsigned_abs();
        format!("{}{:02}{:02} {}", sign, n / 3600, n % 3600 / 60, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Header {
    pub version: u32,
    pub exchange: String,
    pub symbol: String,
    pub instrument: String,
    pub secid: i64,
    /// UTC date of the recording; all record times are relative to its
    /// midnight.
    pub date: Date,
    pub tz: TzInfo,
    /// Book depth cap per side; the count nibble limits this to 15.
    pub depth: u8,
    /// Minimal price increment (e.g. 0.01).
    pub px_step: f64,
    /// `round(1 / px_step)`.
    pub px_scale: i32,
    /// Digits after the decimal point, `log10(px_scale)`.
    pub px_precision: u32,
    pub uuid: Uuid,
}

impl Header {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: impl Into<String>,
        symbol: impl Into<String>,
        instrument: impl Into<String>,
        secid: i64,
        date: Date,
        tz: TzInfo,
        depth: u8,
        px_step: f64,
        uuid: Uuid,
    ) -> Self {
        let (px_scale, px_precision) = derive_px(px_step);
        Self {
            version: VERSION,
            exchange: exchange.into(),
            symbol: symbol.into(),
            instrument: instrument.into(),
            secid,
            date,
            tz,
            depth,
            px_step,
            px_scale,
            px_precision,
            uuid,
        }
    }

    /// UTC midnight of the file's date.
    pub fn midnight(&self) -> OffsetDateTime {
        self.date.midnight().assume_utc()
    }

    /// Convert a price in steps back to its decimal value.
    pub fn px_to_f64(&self, px: crate::PriceT) -> f64 {
        px as f64 * self.px_step
    }

    /// Emit the header; returns the number of bytes written.
    pub fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<u64> {
        let (y, m, d) = (
            self.date.year(),
            u8::from(self.date.month()),
            self.date.day(),
        );
        let text = format!(
            "{}\n\
             version:  {}\n\
             utc-date: {:04}-{:02}-{:02} ({})\n\
             exchange: {}\n\
             symbol:   {}\n\
             instr:    {}\n\
             secid:    {}\n\
             depth:    {}\n\
             px-step:  {:.*}\n\
             uuid:     {}\n\
             \n",
            SHEBANG,
            self.version,
            y,
            m,
            d,
            self.tz.hhmm(),
            self.exchange,
            self.symbol,
            self.instrument,
            self.secid,
            self.depth,
            self.px_precision as usize,
            self.px_step,
            self.uuid,
        );
        w.write_all(text.as_bytes())?;
        Ok(text.len() as u64)
    }

    /// Parse the header from the beginning of `r`.
    ///
    /// Leaves the stream positioned on the first byte after the blank line
    /// that terminates the header.
    pub fn read_from<R: BufRead>(r: &mut R, path: &Path) -> Result<Header> {
        let bad = |reason: &str| Error::InvalidHeader {
            path: path.to_path_buf(),
            reason: reason.to_string(),
        };

        let shebang = read_line(r, path)?;
        if shebang.trim_end_matches('\n') != SHEBANG {
            return Err(bad("missing shebang line"));
        }

        let version: u32 = parse_field(r, path, "version")?;
        let date_line = field_value(r, path, "utc-date")?;
        let (date, tz) = parse_date_tz(&date_line).ok_or_else(|| bad("malformed utc-date line"))?;
        let exchange = field_value(r, path, "exchange")?;
        let symbol = field_value(r, path, "symbol")?;
        let instrument = field_value(r, path, "instr")?;
        let secid: i64 = parse_field(r, path, "secid")?;
        let depth: u8 = parse_field(r, path, "depth")?;
        let px_step: f64 = parse_field(r, path, "px-step")?;
        let uuid_str = field_value(r, path, "uuid")?;
        let uuid = Uuid::parse_str(&uuid_str).map_err(|_| bad("malformed uuid"))?;

        let blank = read_line(r, path)?;
        if blank != "\n" {
            return Err(bad("header not terminated by a blank line"));
        }

        if version != VERSION {
            return Err(Error::UnsupportedVersion {
                path: path.to_path_buf(),
                found: version,
                supported: VERSION,
            });
        }

        let (px_scale, px_precision) = derive_px(px_step);
        Ok(Header {
            version,
            exchange,
            symbol,
            instrument,
            secid,
            date,
            tz,
            depth,
            px_step,
            px_scale,
            px_precision,
            uuid,
        })
    }
}

/// `(scale, precision)` derived from the price step.
pub fn derive_px(px_step: f64) -> (i32, u32) {
    let scale = if px_step != 0.0 {
        (1.0 / px_step + 0.5) as i32
    } else {
        0
    };
    let mut precision = 0u32;
    let mut s = scale;
    while s >= 10 {
        s /= 10;
        precision += 1;
    }
    (scale, precision)
}

fn read_line<R: BufRead>(r: &mut R, path: &Path) -> Result<String> {
    let mut line = String::new();
    let n = r
        .read_line(&mut line)
        .map_err(|e| Error::io(path, 0, e))?;
    if n == 0 {
        return Err(Error::InvalidHeader {
            path: path.to_path_buf(),
            reason: "unexpected end of file in header".to_string(),
        });
    }
    Ok(line)
}

/// Read one `key: value` line, enforcing the key.
fn field_value<R: BufRead>(r: &mut R, path: &Path, key: &str) -> Result<String> {
    let line = read_line(r, path)?;
    let line = line.trim_end_matches('\n');
    match line.split_once(':') {
        Some((k, v)) if k == key => Ok(v.trim().to_string()),
        _ => Err(Error::InvalidHeader {
            path: path.to_path_buf(),
            reason: format!("expected '{}:' line", key),
        }),
    }
}

fn parse_field<R: BufRead, T: std::str::FromStr>(r: &mut R, path: &Path, key: &str) -> Result<T> {
    let v = field_value(r, path, key)?;
    v.parse().map_err(|_| Error::InvalidHeader {
        path: path.to_path_buf(),
        reason: format!("malformed '{}' value: {}", key, v),
    })
}

/// Parse `YYYY-MM-DD (±HHMM NAME)`.
fn parse_date_tz(v: &str) -> Option<(Date, TzInfo)> {
    let (date_part, rest) = v.split_once(' ')?;
    let mut it = date_part.split('-');
    let y: i32 = it.next()?.parse().ok()?;
    let m: u8 = it.next()?.parse().ok()?;
    let d: u8 = it.next()?.parse().ok()?;
    if it.next().is_some() {
        return None;
    }
    let date = Date::from_calendar_date(y, Month::try_from(m).ok()?, d).ok()?;

    let inner = rest.strip_prefix('(')?.strip_suffix(')')?;
    let (hhmm, name) = inner.split_once(' ')?;
    if hhmm.len() != 5 || name.is_empty() {
        return None;
    }
    let sign = match hhmm.as_bytes()[0] {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let hh: i32 = hhmm[1..3].parse().ok()?;
    let mm: i32 = hhmm[3..5].parse().ok()?;
    let tz = TzInfo::new(name, sign * (hh * 3600 + mm * 60));
    Some((date, tz))
}
