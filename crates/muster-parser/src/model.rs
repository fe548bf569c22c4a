use std::fmt;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// Wire format for the combined date+time column in clock files.
pub const EVENT_TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionKind {
    On,
    Off,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::On => "on",
            TransactionKind::Off => "off",
        }
    }

    /// The code carried in column 0 of a clock file row.
    pub fn wire_code(&self) -> &'static str {
        match self {
            TransactionKind::On => "BON",
            TransactionKind::Off => "BOF",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for TransactionKind {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_uppercase().as_str() {
            "BON" => Ok(TransactionKind::On),
            "BOF" => Ok(TransactionKind::Off),
            other => Err(format!("unknown transaction code '{other}'")),
        }
    }
}

/// Badge-level worker identifier, canonically a 5-digit string. Clock
/// hardware in the field is not trusted to zero-pad, so anything non-empty
/// is accepted and resolution against the mapping store decides its fate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(value: impl Into<String>) -> Result<Self, String> {
        let value = value.into();
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("worker id is empty".to_string());
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<&str> for WorkerId {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        WorkerId::new(value)
    }
}

/// GPS fix attached to a clock event. Present on every row but carries no
/// weight in reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoSample {
    pub status: i64,
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
}

/// One clock in/out transaction as read from a clock file row. Immutable
/// once parsed; reconciliation only looks at the transaction kind, the
/// worker id, and the timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockEvent {
    pub transaction: TransactionKind,
    pub worker: WorkerId,
    pub payroll_ref: String,
    pub timestamp: NaiveDateTime,
    pub geo: GeoSample,
}
