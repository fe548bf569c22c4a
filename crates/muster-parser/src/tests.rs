use chrono::NaiveDate;

use crate::errors::{ParseError, RowError};
use crate::model::{TransactionKind, WorkerId};
use crate::reader::{read_clock_events, read_clock_file, EventReader};

fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> chrono::NaiveDateTime {
    NaiveDate::from_ymd_opt(y, mo, d)
        .expect("bad test date")
        .and_hms_opt(h, mi, s)
        .expect("bad test time")
}

#[test]
fn parses_well_formed_rows() {
    let content = "\
BON,12345,99887,20250115,083000,20250115083000,1,51.5074,-0.1278,12.5
BOF,12345,99887,20250115,171500,20250115171500,1,51.5080,-0.1300,8.0
";
    let parsed = read_clock_events(content.as_bytes()).expect("clock file parse failed");

    assert!(parsed.skipped.is_empty());
    assert_eq!(parsed.events.len(), 2);

    let first = &parsed.events[0];
    assert_eq!(first.transaction, TransactionKind::On);
    assert_eq!(first.worker, WorkerId::new("12345").unwrap());
    assert_eq!(first.payroll_ref, "99887");
    assert_eq!(first.timestamp, ts(2025, 1, 15, 8, 30, 0));
    assert_eq!(first.geo.status, 1);
    assert!((first.geo.latitude - 51.5074).abs() < f64::EPSILON);

    let second = &parsed.events[1];
    assert_eq!(second.transaction, TransactionKind::Off);
    assert_eq!(second.timestamp, ts(2025, 1, 15, 17, 15, 0));
}

#[test]
fn preserves_row_order() {
    let content = "\
BON,00001,1,20250101,080000,20250101080000,0,0,0,0
BOF,00002,2,20250101,090000,20250101090000,0,0,0,0
BON,00003,3,20250101,100000,20250101100000,0,0,0,0
";
    let parsed = read_clock_events(content.as_bytes()).expect("parse failed");
    let ids: Vec<&str> = parsed.events.iter().map(|e| e.worker.as_str()).collect();
    assert_eq!(ids, vec!["00001", "00002", "00003"]);
}

#[test]
fn accepts_extra_trailing_columns() {
    let content = "BON,12345,99887,20250115,083000,20250115083000,1,51.5,0.1,9.0,extra,fields\n";
    let parsed = read_clock_events(content.as_bytes()).expect("parse failed");
    assert_eq!(parsed.events.len(), 1);
    assert!(parsed.skipped.is_empty());
}

#[test]
fn skips_rows_with_too_few_columns() {
    let content = "\
BON,12345,99887,20250115,083000,20250115083000,1,51.5,0.1,9.0
BOF,12345,truncated
";
    let parsed = read_clock_events(content.as_bytes()).expect("parse failed");
    assert_eq!(parsed.events.len(), 1);
    assert_eq!(parsed.skipped.len(), 1);
    match &parsed.skipped[0] {
        RowError::TooFewColumns {
            line_index, found, ..
        } => {
            assert_eq!(*line_index, 2);
            assert_eq!(*found, 3);
        }
        other => panic!("expected TooFewColumns, got {other:?}"),
    }
}

#[test]
fn skips_unknown_transaction_codes() {
    let content = "XXX,12345,99887,20250115,083000,20250115083000,1,51.5,0.1,9.0\n";
    let parsed = read_clock_events(content.as_bytes()).expect("parse failed");
    assert!(parsed.events.is_empty());
    assert_eq!(parsed.skipped.len(), 1);
    match &parsed.skipped[0] {
        RowError::BadField { column, .. } => assert_eq!(*column, "transaction"),
        other => panic!("expected BadField, got {other:?}"),
    }
}

#[test]
fn transaction_codes_are_case_insensitive() {
    let content = "bon,12345,99887,20250115,083000,20250115083000,1,51.5,0.1,9.0\n";
    let parsed = read_clock_events(content.as_bytes()).expect("parse failed");
    assert_eq!(parsed.events.len(), 1);
    assert_eq!(parsed.events[0].transaction, TransactionKind::On);
}

#[test]
fn skips_unparseable_timestamps() {
    let content = "\
BON,12345,99887,20250115,083000,2025-01-15T08:30,1,51.5,0.1,9.0
BOF,12345,99887,20250115,171500,20250115171500,1,51.5,0.1,9.0
";
    let parsed = read_clock_events(content.as_bytes()).expect("parse failed");
    assert_eq!(parsed.events.len(), 1);
    assert_eq!(parsed.skipped.len(), 1);
    assert_eq!(parsed.skipped[0].line_index(), 1);
}

#[test]
fn skips_rows_with_empty_worker_id() {
    let content = "BON,,99887,20250115,083000,20250115083000,1,51.5,0.1,9.0\n";
    let parsed = read_clock_events(content.as_bytes()).expect("parse failed");
    assert!(parsed.events.is_empty());
    match &parsed.skipped[0] {
        RowError::BadField { column, .. } => assert_eq!(*column, "worker_id"),
        other => panic!("expected BadField, got {other:?}"),
    }
}

#[test]
fn empty_geo_fields_default_to_zero() {
    let content = "BON,12345,99887,20250115,083000,20250115083000,,,,\n";
    let parsed = read_clock_events(content.as_bytes()).expect("parse failed");
    assert_eq!(parsed.events.len(), 1);
    let geo = parsed.events[0].geo;
    assert_eq!(geo.status, 0);
    assert_eq!(geo.latitude, 0.0);
    assert_eq!(geo.longitude, 0.0);
    assert_eq!(geo.accuracy, 0.0);
}

#[test]
fn rejects_non_numeric_geo_fields() {
    let content = "BON,12345,99887,20250115,083000,20250115083000,ok,51.5,0.1,9.0\n";
    let parsed = read_clock_events(content.as_bytes()).expect("parse failed");
    assert!(parsed.events.is_empty());
    match &parsed.skipped[0] {
        RowError::BadField { column, .. } => assert_eq!(*column, "geo_status"),
        other => panic!("expected BadField, got {other:?}"),
    }
}

#[test]
fn blank_lines_are_ignored() {
    let content = "\
BON,12345,99887,20250115,083000,20250115083000,1,51.5,0.1,9.0

BOF,12345,99887,20250115,171500,20250115171500,1,51.5,0.1,9.0
";
    let parsed = read_clock_events(content.as_bytes()).expect("parse failed");
    assert_eq!(parsed.events.len(), 2);
    assert!(parsed.skipped.is_empty());
}

#[test]
fn empty_input_parses_to_nothing() {
    let parsed = read_clock_events("".as_bytes()).expect("parse failed");
    assert!(parsed.events.is_empty());
    assert!(parsed.skipped.is_empty());
}

#[test]
fn missing_file_is_an_open_error() {
    let err = read_clock_file("/definitely/not/here/clock.csv")
        .expect_err("expected open failure");
    assert!(matches!(err, ParseError::Open { .. }));
}

#[test]
fn reader_yields_rows_lazily_in_order() {
    let content = "\
BON,00001,1,20250101,080000,20250101080000,0,0,0,0
BOF,00002,2,20250101,090000,20250101090000,0,0,0,0
";
    let mut reader = EventReader::from_reader(content.as_bytes());
    let first = reader
        .next()
        .expect("first row missing")
        .expect("first row failed");
    assert_eq!(first.worker.as_str(), "00001");
    let second = reader
        .next()
        .expect("second row missing")
        .expect("second row failed");
    assert_eq!(second.worker.as_str(), "00002");
    assert!(reader.next().is_none());
}
