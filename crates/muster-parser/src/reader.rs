use std::fs::File;
use std::io::Read;
use std::path::Path;

use chrono::NaiveDateTime;
use csv::StringRecord;

use crate::errors::{ParseError, RowError};
use crate::model::{ClockEvent, GeoSample, TransactionKind, WorkerId, EVENT_TIMESTAMP_FORMAT};

/// Minimum positional columns in a clock file row: transaction code, worker
/// id, payroll reference, date, time, combined timestamp, then the four geo
/// fields. Extra trailing columns are accepted and ignored.
const MIN_COLUMNS: usize = 10;

const COL_TRANSACTION: usize = 0;
const COL_WORKER_ID: usize = 1;
const COL_PAYROLL_REF: usize = 2;
const COL_TIMESTAMP: usize = 5;
const COL_GEO_STATUS: usize = 6;
const COL_LATITUDE: usize = 7;
const COL_LONGITUDE: usize = 8;
const COL_ACCURACY: usize = 9;

/// Lazy iterator over the rows of a clock file. Yields one item per
/// non-blank CSV record: the parsed event, or the row-local reason it was
/// rejected. A `RowError::Csv` means the underlying stream is corrupt; the
/// iterator stops after yielding it. Construct a new reader to start over.
pub struct EventReader<R: Read> {
    records: csv::StringRecordsIntoIter<R>,
    line_index: usize,
    corrupt: bool,
}

impl<R: Read> EventReader<R> {
    pub fn from_reader(reader: R) -> Self {
        let records = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(reader)
            .into_records();
        Self {
            records,
            line_index: 0,
            corrupt: false,
        }
    }
}

impl<R: Read> Iterator for EventReader<R> {
    type Item = Result<ClockEvent, RowError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.corrupt {
            return None;
        }
        loop {
            let record = self.records.next()?;
            self.line_index += 1;
            match record {
                Ok(record) => {
                    if record.iter().all(|field| field.trim().is_empty()) {
                        continue;
                    }
                    return Some(parse_record(&record, self.line_index));
                }
                Err(source) => {
                    self.corrupt = true;
                    return Some(Err(RowError::Csv {
                        line_index: self.line_index,
                        source,
                    }));
                }
            }
        }
    }
}

/// The readable content of one clock file: events in row order, plus the
/// rows that were individually rejected.
#[derive(Debug, Default)]
pub struct ParsedEvents {
    pub events: Vec<ClockEvent>,
    pub skipped: Vec<RowError>,
}

pub fn read_clock_file(path: impl AsRef<Path>) -> Result<ParsedEvents, ParseError> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|source| ParseError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    read_clock_events(file)
}

pub fn read_clock_events<R: Read>(reader: R) -> Result<ParsedEvents, ParseError> {
    let mut parsed = ParsedEvents::default();
    for item in EventReader::from_reader(reader) {
        match item {
            Ok(event) => parsed.events.push(event),
            Err(RowError::Csv { line_index, source }) => {
                return Err(ParseError::Csv { line_index, source });
            }
            Err(err) => parsed.skipped.push(err),
        }
    }
    Ok(parsed)
}

fn parse_record(record: &StringRecord, line_index: usize) -> Result<ClockEvent, RowError> {
    if record.len() < MIN_COLUMNS {
        return Err(RowError::TooFewColumns {
            line_index,
            expected: MIN_COLUMNS,
            found: record.len(),
        });
    }

    let transaction = TransactionKind::try_from(record.get(COL_TRANSACTION).unwrap_or_default())
        .map_err(|message| RowError::BadField {
            line_index,
            column: "transaction",
            message,
        })?;

    let worker = WorkerId::new(record.get(COL_WORKER_ID).unwrap_or_default()).map_err(
        |message| RowError::BadField {
            line_index,
            column: "worker_id",
            message,
        },
    )?;

    let payroll_ref = record
        .get(COL_PAYROLL_REF)
        .unwrap_or_default()
        .trim()
        .to_string();

    let timestamp = parse_event_timestamp(record.get(COL_TIMESTAMP).unwrap_or_default(), line_index)?;

    let geo = GeoSample {
        status: parse_i64_or_default(record.get(COL_GEO_STATUS).unwrap_or_default(), line_index, "geo_status")?,
        latitude: parse_f64_or_default(record.get(COL_LATITUDE).unwrap_or_default(), line_index, "latitude")?,
        longitude: parse_f64_or_default(record.get(COL_LONGITUDE).unwrap_or_default(), line_index, "longitude")?,
        accuracy: parse_f64_or_default(record.get(COL_ACCURACY).unwrap_or_default(), line_index, "accuracy")?,
    };

    Ok(ClockEvent {
        transaction,
        worker,
        payroll_ref,
        timestamp,
        geo,
    })
}

fn parse_event_timestamp(value: &str, line_index: usize) -> Result<NaiveDateTime, RowError> {
    let trimmed = value.trim();
    NaiveDateTime::parse_from_str(trimmed, EVENT_TIMESTAMP_FORMAT).map_err(|err| {
        RowError::BadField {
            line_index,
            column: "timestamp",
            message: format!("invalid timestamp '{trimmed}': {err}"),
        }
    })
}

fn parse_i64_or_default(
    value: &str,
    line_index: usize,
    column: &'static str,
) -> Result<i64, RowError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed.parse::<i64>().map_err(|err| RowError::BadField {
        line_index,
        column,
        message: format!("failed to parse '{trimmed}' as integer: {err}"),
    })
}

fn parse_f64_or_default(
    value: &str,
    line_index: usize,
    column: &'static str,
) -> Result<f64, RowError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(0.0);
    }
    trimmed.parse::<f64>().map_err(|err| RowError::BadField {
        line_index,
        column,
        message: format!("failed to parse '{trimmed}' as float: {err}"),
    })
}
