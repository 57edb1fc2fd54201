use sdb::{
    Aggressor, BookLevel, CandleHeader, CandlesMeta, Error, Instrument, PriceUnit, QuoteSample,
    Reader, Sample, Side, StreamType, TzInfo, Writer,
};
use std::io::{Read, Seek, SeekFrom, Write as _};
use time::macros::date;
use time::{Date, Duration, OffsetDateTime};
use uuid::Uuid;

const DATE: Date = date!(2015 - 10 - 15);

fn krx() -> Instrument {
    Instrument {
        exchange: "KRX".into(),
        symbol: "KR4101".into(),
        instrument: "KR4101K60008".into(),
        secid: 1,
    }
}

fn kst() -> TzInfo {
    TzInfo::new("KST", 9 * 3600)
}

fn test_uuid() -> Uuid {
    Uuid::parse_str("0f7f69c9-fc9d-4517-8318-706e3e58dadd").unwrap()
}

fn midnight() -> OffsetDateTime {
    DATE.midnight().assume_utc()
}

fn at(secs: i64, usecs: i64) -> OffsetDateTime {
    midnight() + Duration::seconds(secs) + Duration::microseconds(usecs)
}

fn new_writer(dir: &std::path::Path) -> Writer {
    Writer::create_in(dir, false, krx(), DATE, kst(), 5, 0.01, Some(test_uuid())).unwrap()
}

fn bids_asks(q: &QuoteSample) -> (Vec<(i32, i32)>, Vec<(i32, i32)>) {
    (
        q.bids().map(|l| (l.px, l.qty)).collect(),
        q.asks().map(|l| (l.px, l.qty)).collect(),
    )
}

fn read_all(reader: &mut Reader) -> Vec<Sample> {
    let mut samples = Vec::new();
    reader.read(|s| {
        samples.push(s);
        true
    })
    .unwrap();
    samples
}

#[test]
fn header_identity_roundtrip_and_file_size() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = new_writer(dir.path());
    let path = w.path().to_path_buf();
    assert!(path.ends_with("20151015.KRX.KR4101.KR4101K60008.sdb"));

    w.write_streams_meta(vec![StreamType::Quotes, StreamType::Trade])
        .unwrap();
    w.write_candles_meta(CandlesMeta::new(vec![CandleHeader::new(
        300,
        3600 * 9,
        3600 * 15,
    )]))
    .unwrap();
    w.close().unwrap();

    // header 205 + streams meta 11 + candles meta 20 + 72 candles of 32
    // bytes + begin-data marker
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 2544);

    let reader = Reader::open(&path).unwrap();
    let h = reader.info();
    assert_eq!(h.date, DATE);
    assert_eq!(h.depth, 5);
    assert_eq!(h.px_step, 0.01);
    assert_eq!(h.px_scale, 100);
    assert_eq!(h.px_precision, 2);
    assert_eq!(h.exchange, "KRX");
    assert_eq!(h.symbol, "KR4101");
    assert_eq!(h.instrument, "KR4101K60008");
    assert_eq!(h.secid, 1);
    assert_eq!(h.tz, kst());
    assert_eq!(h.uuid, test_uuid());
    assert_eq!(reader.streams(), &[StreamType::Quotes, StreamType::Trade]);
    assert_eq!(reader.data_offset(), 2540);

    let candles = &reader.candles().headers;
    assert_eq!(candles.len(), 1);
    assert_eq!(candles[0].resolution, 300);
    assert_eq!(candles[0].start_time, 3600 * 9);
    assert_eq!(candles[0].candles().len(), 72);
    assert!(candles[0].candles().iter().all(|c| c.is_empty()));
}

#[test]
fn two_quote_snapshots_no_trades() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = new_writer(dir.path());
    let path = w.path().to_path_buf();
    w.write_streams_meta(vec![StreamType::Quotes, StreamType::Trade])
        .unwrap();
    w.write_candles_meta(CandlesMeta::default()).unwrap();

    let b0 = [
        BookLevel { px: 1.10, qty: 30 },
        BookLevel { px: 1.05, qty: 20 },
        BookLevel { px: 1.00, qty: 10 },
    ];
    let a0 = [
        BookLevel { px: 1.11, qty: 20 },
        BookLevel { px: 1.16, qty: 40 },
        BookLevel { px: 1.20, qty: 60 },
    ];
    w.write_quotes(at(3600, 0), PriceUnit::Double, &b0, &a0)
        .unwrap();

    let b1 = [
        BookLevel { px: 1.11, qty: 31 },
        BookLevel { px: 1.06, qty: 21 },
    ];
    let a1 = [
        BookLevel { px: 1.12, qty: 21 },
        BookLevel { px: 1.16, qty: 41 },
    ];
    w.write_quotes(at(3605, 0), PriceUnit::Double, &b1, &a1)
        .unwrap();
    w.close().unwrap();

    assert_eq!(std::fs::metadata(&path).unwrap().len(), 258);

    let mut reader = Reader::open(&path).unwrap();
    let samples = read_all(&mut reader);
    assert_eq!(samples.len(), 4);

    match &samples[0] {
        Sample::Seconds(s) => assert_eq!(s.time, 3600),
        other => panic!("expected Seconds, got {other:?}"),
    }
    match &samples[1] {
        Sample::Quote { time, quote } => {
            assert_eq!(*time, at(3600, 0));
            assert!(!quote.delta);
            let (bids, asks) = bids_asks(quote);
            assert_eq!(bids, vec![(110, 30), (105, 20), (100, 10)]);
            assert_eq!(asks, vec![(111, 20), (116, 40), (120, 60)]);
        }
        other => panic!("expected Quote, got {other:?}"),
    }
    match &samples[2] {
        Sample::Seconds(s) => assert_eq!(s.time, 3605),
        other => panic!("expected Seconds, got {other:?}"),
    }
    match &samples[3] {
        Sample::Quote { time, quote } => {
            assert_eq!(*time, at(3605, 0));
            let (bids, asks) = bids_asks(quote);
            assert_eq!(bids, vec![(111, 31), (106, 21)]);
            assert_eq!(asks, vec![(112, 21), (116, 41)]);
        }
        other => panic!("expected Quote, got {other:?}"),
    }
}

#[test]
fn delta_quote_reconstruction() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = new_writer(dir.path());
    let path = w.path().to_path_buf();
    w.write_streams_meta(vec![StreamType::Quotes]).unwrap();
    w.write_candles_meta(CandlesMeta::default()).unwrap();

    let b0 = [BookLevel { px: 1.10, qty: 30 }, BookLevel { px: 1.05, qty: 20 }];
    let a0 = [BookLevel { px: 1.11, qty: 20 }];
    w.write_quotes(at(36000, 100), PriceUnit::Double, &b0, &a0)
        .unwrap();

    let b1 = [BookLevel { px: 1.12, qty: 7 }, BookLevel { px: 1.04, qty: 9 }];
    let a1 = [BookLevel { px: 1.13, qty: 5 }];
    w.write_quotes(at(36000, 600), PriceUnit::Double, &b1, &a1)
        .unwrap();
    w.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    let samples = read_all(&mut reader);
    assert_eq!(samples.len(), 3); // one marker, two quotes

    match &samples[1] {
        Sample::Quote { time, quote } => {
            assert_eq!(*time, at(36000, 100));
            assert!(!quote.delta);
            assert_eq!(quote.time, 100);
        }
        other => panic!("expected Quote, got {other:?}"),
    }
    match &samples[2] {
        Sample::Quote { time, quote } => {
            // second quote is delta-coded, 500us after the first
            assert_eq!(*time, at(36000, 600));
            assert!(quote.delta);
            assert_eq!(quote.time, 500);
            let (bids, asks) = bids_asks(quote);
            assert_eq!(bids, vec![(112, 7), (104, 9)]);
            assert_eq!(asks, vec![(113, 5)]);
        }
        other => panic!("expected Quote, got {other:?}"),
    }
}

#[test]
fn out_of_order_timestamp_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = new_writer(dir.path());
    let path = w.path().to_path_buf();
    w.write_streams_meta(vec![StreamType::Quotes]).unwrap();
    w.write_candles_meta(CandlesMeta::default()).unwrap();

    let bids = [BookLevel { px: 1.10, qty: 30 }];
    let asks = [BookLevel { px: 1.11, qty: 20 }];
    w.write_quotes(at(3605, 0), PriceUnit::Double, &bids, &asks)
        .unwrap();

    let err = w
        .write_quotes(at(3600, 0), PriceUnit::Double, &bids, &asks)
        .unwrap_err();
    assert!(matches!(err, Error::OutOfOrderTimestamp { .. }), "{err}");
    w.close().unwrap();

    // the stream up to the first quote is still readable
    let mut reader = Reader::open(&path).unwrap();
    let samples = read_all(&mut reader);
    assert_eq!(samples.len(), 2);
    match &samples[1] {
        Sample::Quote { time, .. } => assert_eq!(*time, at(3605, 0)),
        other => panic!("expected Quote, got {other:?}"),
    }
}

#[test]
fn candle_ohlcv_aggregation() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = new_writer(dir.path());
    let path = w.path().to_path_buf();
    w.write_streams_meta(vec![StreamType::Trade]).unwrap();
    w.write_candles_meta(CandlesMeta::new(vec![CandleHeader::new(
        60,
        3600 * 9,
        3600 * 15,
    )]))
    .unwrap();

    w.write_trade(at(36000, 0), PriceUnit::Double, Side::Buy, 1.50, 100, Aggressor::Undefined, None, None)
        .unwrap();
    w.write_trade(at(36010, 0), PriceUnit::Double, Side::Sell, 1.48, 50, Aggressor::Undefined, None, None)
        .unwrap();
    w.write_trade(at(36020, 0), PriceUnit::Double, Side::Buy, 1.52, 20, Aggressor::Undefined, None, None)
        .unwrap();
    w.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    let data_offset = reader.data_offset() as u64;
    let hdr = &reader.candles().headers[0];
    let idx = hdr.time_to_idx(36000).unwrap();
    let c = hdr.candles()[idx];
    assert_eq!(c.open, 150);
    assert_eq!(c.high, 152);
    assert_eq!(c.low, 148);
    assert_eq!(c.close, 152);
    assert_eq!(c.buy_vol, 120);
    assert_eq!(c.sell_vol, 50);
    // first record of the candle is the Seconds marker right after the
    // begin-data marker
    assert_eq!(c.data_offset, data_offset + 4);

    // untouched candles stay zeroed
    assert!(hdr.candles()[0].is_empty());
    assert!(hdr.candles()[idx + 1].is_empty());

    let samples = read_all(&mut reader);
    let trades: Vec<_> = samples
        .iter()
        .filter_map(|s| match s {
            Sample::Trade { time, trade } => Some((*time, trade.side, trade.px, trade.qty)),
            _ => None,
        })
        .collect();
    assert_eq!(
        trades,
        vec![
            (at(36000, 0), Side::Buy, 150, 100),
            (at(36010, 0), Side::Sell, 148, 50),
            (at(36020, 0), Side::Buy, 152, 20),
        ]
    );
}

#[test]
fn write_phase_violations() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = new_writer(dir.path());

    let bids = [BookLevel { px: 1.10, qty: 30 }];
    let err = w
        .write_quotes(at(3600, 0), PriceUnit::Double, &bids, &[])
        .unwrap_err();
    assert!(matches!(err, Error::InvalidWritePhase { op: "write_quotes", .. }), "{err}");

    let err = w.write_candles_meta(CandlesMeta::default()).unwrap_err();
    assert!(matches!(err, Error::InvalidWritePhase { op: "write_candles_meta", .. }), "{err}");

    w.write_streams_meta(vec![StreamType::Quotes]).unwrap();
    let err = w.write_streams_meta(vec![StreamType::Quotes]).unwrap_err();
    assert!(matches!(err, Error::InvalidWritePhase { op: "write_streams_meta", .. }), "{err}");

    let err = w
        .write_trade(at(3600, 0), PriceUnit::Double, Side::Buy, 1.5, 1, Aggressor::Undefined, None, None)
        .unwrap_err();
    assert!(matches!(err, Error::InvalidWritePhase { op: "write_trade", .. }), "{err}");
}

#[test]
fn writer_rejects_bad_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let err = Writer::create_in(dir.path(), false, krx(), DATE, kst(), 16, 0.01, Some(test_uuid()))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidHeader { .. }), "{err}");

    let err = Writer::create_in(dir.path(), false, krx(), DATE, kst(), 5, 0.0, Some(test_uuid()))
        .unwrap_err();
    assert!(matches!(err, Error::InvalidHeader { .. }), "{err}");

    let mut w = new_writer(dir.path());
    w.write_streams_meta(vec![StreamType::Quotes]).unwrap();
    w.write_candles_meta(CandlesMeta::default()).unwrap();
    let six = [BookLevel { px: 1.0, qty: 1 }; 6];
    let err = w
        .write_quotes(at(3600, 0), PriceUnit::Double, &six, &[])
        .unwrap_err();
    assert!(matches!(err, Error::InvalidPriceLevelCount { bids: 6, .. }), "{err}");
}

#[test]
fn empty_book_write_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = new_writer(dir.path());
    let path = w.path().to_path_buf();
    w.write_streams_meta(vec![StreamType::Quotes]).unwrap();
    w.write_candles_meta(CandlesMeta::default()).unwrap();
    w.write_quotes(at(3600, 0), PriceUnit::Double, &[], &[])
        .unwrap();
    w.close().unwrap();

    // header 205 + streams meta 9 + empty candles meta 4 + marker 4
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 222);
    let mut reader = Reader::open(&path).unwrap();
    assert!(read_all(&mut reader).is_empty());
}

#[test]
fn trade_optional_fields_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = new_writer(dir.path());
    let path = w.path().to_path_buf();
    w.write_streams_meta(vec![StreamType::Trade]).unwrap();
    w.write_candles_meta(CandlesMeta::default()).unwrap();

    w.write_trade(at(100, 1), PriceUnit::Double, Side::Sell, 1.48, 50, Aggressor::Aggressor, Some(42), Some(7))
        .unwrap();
    w.write_trade(at(100, 2), PriceUnit::Double, Side::Buy, 1.49, 0, Aggressor::Passive, None, None)
        .unwrap();
    w.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    let samples = read_all(&mut reader);
    assert_eq!(samples.len(), 3);

    match &samples[1] {
        Sample::Trade { time, trade } => {
            assert_eq!(*time, at(100, 1));
            assert_eq!(trade.side, Side::Sell);
            assert_eq!(trade.aggr, Aggressor::Aggressor);
            assert_eq!(trade.px, 148);
            assert_eq!(trade.qty, 50);
            assert_eq!(trade.order_id, Some(42));
            assert_eq!(trade.trade_id, Some(7));
            assert!(!trade.internal);
        }
        other => panic!("expected Trade, got {other:?}"),
    }
    match &samples[2] {
        Sample::Trade { time, trade } => {
            assert_eq!(*time, at(100, 2));
            assert!(trade.delta);
            assert_eq!(trade.px, 149);
            assert_eq!(trade.qty, 0);
            assert_eq!(trade.order_id, None);
            assert_eq!(trade.trade_id, None);
            assert_eq!(trade.aggr, Aggressor::Passive);
        }
        other => panic!("expected Trade, got {other:?}"),
    }
}

#[test]
fn interleaved_quotes_and_trades_share_the_time_baseline() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = new_writer(dir.path());
    let path = w.path().to_path_buf();
    w.write_streams_meta(vec![StreamType::Quotes, StreamType::Trade])
        .unwrap();
    w.write_candles_meta(CandlesMeta::default()).unwrap();

    let bids = [BookLevel { px: 1.10, qty: 30 }];
    let asks = [BookLevel { px: 1.11, qty: 20 }];
    w.write_quotes(at(40000, 100), PriceUnit::Double, &bids, &asks)
        .unwrap();
    w.write_trade(at(40000, 300), PriceUnit::Double, Side::Buy, 1.11, 5, Aggressor::Undefined, None, None)
        .unwrap();
    let bids = [BookLevel { px: 1.09, qty: 33 }];
    let asks = [BookLevel { px: 1.12, qty: 22 }];
    w.write_quotes(at(40000, 450), PriceUnit::Double, &bids, &asks)
        .unwrap();
    w.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    let samples = read_all(&mut reader);
    assert_eq!(samples.len(), 4);
    let times: Vec<_> = samples
        .iter()
        .filter_map(|s| match s {
            Sample::Quote { time, .. } | Sample::Trade { time, .. } => Some(*time),
            _ => None,
        })
        .collect();
    assert_eq!(times, vec![at(40000, 100), at(40000, 300), at(40000, 450)]);

    // the trade opened this second for trades, so it is stored full; the
    // second quote deltas against the first
    match &samples[2] {
        Sample::Trade { trade, .. } => {
            assert!(!trade.delta);
            assert_eq!(trade.time, 300);
        }
        other => panic!("expected Trade, got {other:?}"),
    }
    match &samples[3] {
        Sample::Quote { quote, .. } => {
            assert!(quote.delta);
            assert_eq!(quote.time, 150);
            let (bids, asks) = bids_asks(quote);
            assert_eq!(bids, vec![(109, 33)]);
            assert_eq!(asks, vec![(112, 22)]);
        }
        other => panic!("expected Quote, got {other:?}"),
    }
}

#[test]
fn price_units_normalize_identically() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = new_writer(dir.path());
    let path = w.path().to_path_buf();
    w.write_streams_meta(vec![StreamType::Trade]).unwrap();
    w.write_candles_meta(CandlesMeta::default()).unwrap();

    w.write_trade(at(100, 0), PriceUnit::Double, Side::Buy, 1.50, 1, Aggressor::Undefined, None, None)
        .unwrap();
    w.write_trade(at(100, 1), PriceUnit::Precision, Side::Buy, 15000.0, 1, Aggressor::Undefined, None, None)
        .unwrap();
    w.write_trade(at(100, 2), PriceUnit::Steps, Side::Buy, 150.0, 1, Aggressor::Undefined, None, None)
        .unwrap();
    w.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    let pxs: Vec<_> = read_all(&mut reader)
        .iter()
        .filter_map(|s| match s {
            Sample::Trade { trade, .. } => Some(trade.px),
            _ => None,
        })
        .collect();
    assert_eq!(pxs, vec![150, 150, 150]);
}

#[test]
fn unknown_or_reserved_stream_types_are_fatal() {
    for tag in [0x7Fu8, StreamType::Order as u8] {
        let dir = tempfile::tempdir().unwrap();
        let mut w = new_writer(dir.path());
        let path = w.path().to_path_buf();
        w.write_streams_meta(vec![StreamType::Quotes]).unwrap();
        w.write_candles_meta(CandlesMeta::default()).unwrap();
        let bids = [BookLevel { px: 1.10, qty: 30 }];
        w.write_quotes(at(3600, 0), PriceUnit::Double, &bids, &[])
            .unwrap();
        w.close().unwrap();

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(&[tag, 0x00]).unwrap();
        drop(f);

        let mut reader = Reader::open(&path).unwrap();
        let err = reader.read(|_| true).unwrap_err();
        assert!(matches!(err, Error::CorruptMetadata { .. }), "tag {tag}: {err}");
    }
}

#[test]
fn begin_data_marker_is_verified() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = new_writer(dir.path());
    let path = w.path().to_path_buf();
    w.write_streams_meta(vec![StreamType::Quotes]).unwrap();
    w.write_candles_meta(CandlesMeta::default()).unwrap();
    w.close().unwrap();

    let data_offset = Reader::open(&path).unwrap().data_offset() as u64;
    let mut f = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    f.seek(SeekFrom::Start(data_offset)).unwrap();
    f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
    drop(f);

    let mut reader = Reader::open(&path).unwrap();
    let err = reader.read(|_| true).unwrap_err();
    assert!(matches!(err, Error::InvalidMarker { .. }), "{err}");
}

#[test]
fn unsupported_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = new_writer(dir.path());
    let path = w.path().to_path_buf();
    w.write_streams_meta(vec![StreamType::Quotes]).unwrap();
    w.write_candles_meta(CandlesMeta::default()).unwrap();
    w.close().unwrap();

    let mut bytes = Vec::new();
    std::fs::File::open(&path).unwrap().read_to_end(&mut bytes).unwrap();
    // the version digit sits at a fixed offset behind the shebang
    assert_eq!(&bytes[19..31], b"version:  1\n");
    bytes[29] = b'2';
    std::fs::write(&path, &bytes).unwrap();

    let err = Reader::open(&path).unwrap_err();
    assert!(matches!(err, Error::UnsupportedVersion { found: 2, .. }), "{err}");
}

#[test]
fn undersized_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("short.sdb");
    std::fs::write(&path, b"#!/usr/bin/env sdb\n").unwrap();
    let err = Reader::open(&path).unwrap_err();
    assert!(matches!(err, Error::InvalidHeader { .. }), "{err}");
}

#[test]
fn visitor_can_stop_early() {
    let dir = tempfile::tempdir().unwrap();
    let mut w = new_writer(dir.path());
    let path = w.path().to_path_buf();
    w.write_streams_meta(vec![StreamType::Quotes]).unwrap();
    w.write_candles_meta(CandlesMeta::default()).unwrap();
    let bids = [BookLevel { px: 1.10, qty: 30 }];
    w.write_quotes(at(3600, 0), PriceUnit::Double, &bids, &[])
        .unwrap();
    w.write_quotes(at(3601, 0), PriceUnit::Double, &bids, &[])
        .unwrap();
    w.close().unwrap();

    let mut reader = Reader::open(&path).unwrap();
    let mut seen = 0;
    reader.read(|_| {
        seen += 1;
        seen < 2
    })
    .unwrap();
    assert_eq!(seen, 2);

    // replaying from the start yields the full stream again
    assert_eq!(read_all(&mut reader).len(), 4);
}

#[test]
fn nested_directory_layout() {
    let dir = tempfile::tempdir().unwrap();
    let mut instr = krx();
    instr.instrument = "KR4101/K6".into();
    let w = Writer::create_in(dir.path(), true, instr, DATE, kst(), 5, 0.01, Some(test_uuid())).unwrap();
    let expect = dir
        .path()
        .join("KRX/KR4101/2015/10/KR4101-K6.20151015.sdb");
    assert_eq!(w.path(), expect);
    assert!(expect.exists());
}
