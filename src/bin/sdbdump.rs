use anyhow::{bail, Context, Result};
use clap::Parser;
use dotenvy::dotenv;
use sdb::{Reader, Sample};
use std::path::PathBuf;
use time::{Duration, OffsetDateTime};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(version, about = "Dump the contents of an sdb market-data file")]
struct Args {
    /// Input .sdb file
    #[arg(long, short = 'f', env = "SDB_FILE")]
    file: PathBuf,

    /// Print the file header and exit
    #[arg(long, short = 'i', default_value_t = false)]
    info: bool,

    /// Print quote records
    #[arg(long, short = 'Q', default_value_t = false)]
    quotes: bool,

    /// Print trade records
    #[arg(long, short = 'T', default_value_t = false)]
    trades: bool,

    /// Print candles of the given resolution (e.g. 300s, 5m, 1h)
    #[arg(long, short = 'C')]
    candles: Option<String>,

    /// Limit printed book depth
    #[arg(long, short = 'm', default_value_t = 100)]
    max_depth: usize,

    /// Print prices without quantities
    #[arg(long, short = 'p', default_value_t = false)]
    px_only: bool,

    /// Field delimiter
    #[arg(long, default_value_t = '|')]
    delim: char,

    /// Delimiter between price levels
    #[arg(long, default_value_t = ' ')]
    px_delim: char,

    /// Delimiter between quantity and price
    #[arg(long, default_value_t = '@')]
    qty_delim: char,

    /// Format times in the file's local time zone instead of UTC
    #[arg(long, short = 'z', default_value_t = false)]
    tz_local: bool,

    /// Emit records as JSON lines instead of delimited text
    #[arg(long, default_value_t = false)]
    json: bool,
}

fn parse_resolution(s: &str) -> Result<u16> {
    let digits: String = s.chars().take_while(|c| c.is_ascii_digit()).collect();
    let n: u32 = digits.parse().with_context(|| format!("bad resolution '{s}'"))?;
    let mult = match s[digits.len()..].to_ascii_lowercase().as_str() {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        suffix => bail!("bad resolution suffix '{suffix}'"),
    };
    u16::try_from(n * mult).with_context(|| format!("resolution '{s}' out of range"))
}

fn fmt_time(t: OffsetDateTime, tz_offset: i32, local: bool) -> String {
    let t = if local {
        t + Duration::seconds(tz_offset as i64)
    } else {
        t
    };
    format!(
        "{:02}:{:02}:{:02}.{:06}",
        t.hour(),
        t.minute(),
        t.second(),
        t.microsecond()
    )
}

fn print_info(reader: &Reader) {
    let h = reader.info();
    println!("Version....: {}", h.version);
    println!("Date.......: {} UTC ({})", h.date, h.tz.hhmm());
    println!("Exchange...: {}", h.exchange);
    println!("Symbol.....: {}", h.symbol);
    println!("Instrument.: {}", h.instrument);
    println!("SecID......: {}", h.secid);
    println!("Depth......: {}", h.depth);
    println!("PxStep.....: {:.*}", h.px_precision as usize, h.px_step);
    println!("PxPrecision: {}", h.px_precision);
    println!("PxScale....: {}", h.px_scale);
    println!("UUID.......: {}", h.uuid);
    print!("Streams....:");
    for st in reader.streams() {
        print!(" {st:?}");
    }
    println!();
    for hdr in &reader.candles().headers {
        println!(
            "Candles....: {}s x {} from {:05}s (array at {})",
            hdr.resolution,
            hdr.candles().len(),
            hdr.start_time,
            hdr.candle_data_offset()
        );
    }
}

fn print_candles(reader: &Reader, resolution: u16) -> Result<()> {
    let h = reader.info();
    let Some(hdr) = reader
        .candles()
        .headers
        .iter()
        .find(|c| c.resolution == resolution)
    else {
        bail!("no candle index with resolution {resolution}s in this file");
    };
    for (idx, c) in hdr.candles().iter().enumerate() {
        if c.is_empty() {
            continue;
        }
        let t = hdr.candle_to_time(idx);
        let p = h.px_precision as usize;
        println!(
            "{:02}:{:02}:{:02}|{:.p$}|{:.p$}|{:.p$}|{:.p$}|{}|{}|{}",
            t / 3600,
            t % 3600 / 60,
            t % 60,
            h.px_to_f64(c.open),
            h.px_to_f64(c.high),
            h.px_to_f64(c.low),
            h.px_to_f64(c.close),
            c.buy_vol,
            c.sell_vol,
            c.data_offset,
        );
    }
    Ok(())
}

fn main() -> Result<()> {
    let _ = dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let mut reader = Reader::open(&args.file)
        .with_context(|| format!("open {}", args.file.display()))?;

    if args.info {
        print_info(&reader);
        return Ok(());
    }
    if let Some(res) = &args.candles {
        return print_candles(&reader, parse_resolution(res)?);
    }
    if !args.quotes && !args.trades {
        bail!("nothing to do: pass --info, -Q, -T or -C");
    }

    let h = reader.info().clone();
    let prec = h.px_precision as usize;
    let both = args.quotes && args.trades;
    let (delim, px_delim, qty_delim) = (args.delim, args.px_delim, args.qty_delim);

    reader.read(|sample| {
        match &sample {
            Sample::Quote { time, quote } if args.quotes => {
                if args.json {
                    println!("{}", serde_json::to_string(&sample).unwrap_or_default());
                    return true;
                }
                let mut line = fmt_time(*time, h.tz.offset_secs, args.tz_local);
                line.push(delim);
                if both {
                    line.push('Q');
                    line.push(delim);
                }
                for (i, l) in quote.bids().take(args.max_depth).enumerate() {
                    if i > 0 {
                        line.push(px_delim);
                    }
                    if !args.px_only {
                        line.push_str(&format!("{}{}", l.qty, qty_delim));
                    }
                    line.push_str(&format!("{:.prec$}", h.px_to_f64(l.px)));
                }
                line.push(delim);
                for (i, l) in quote.asks().take(args.max_depth).enumerate() {
                    if i > 0 {
                        line.push(px_delim);
                    }
                    if !args.px_only {
                        line.push_str(&format!("{}{}", l.qty, qty_delim));
                    }
                    line.push_str(&format!("{:.prec$}", h.px_to_f64(l.px)));
                }
                println!("{line}");
            }
            Sample::Trade { time, trade } if args.trades => {
                if args.json {
                    println!("{}", serde_json::to_string(&sample).unwrap_or_default());
                    return true;
                }
                let mut line = fmt_time(*time, h.tz.offset_secs, args.tz_local);
                line.push(delim);
                if both {
                    line.push('T');
                    line.push(delim);
                }
                line.push(trade.side.to_char());
                line.push(delim);
                line.push_str(&format!("{:.prec$}", h.px_to_f64(trade.px)));
                line.push(delim);
                line.push_str(&trade.qty.to_string());
                line.push(delim);
                line.push(trade.aggr.to_char());
                line.push(delim);
                if let Some(id) = trade.trade_id {
                    line.push_str(&id.to_string());
                }
                line.push(delim);
                if let Some(id) = trade.order_id {
                    line.push_str(&id.to_string());
                }
                println!("{line}");
            }
            _ => {}
        }
        true
    })?;

    Ok(())
}
