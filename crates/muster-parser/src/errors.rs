use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A single bad row. The surrounding file keeps parsing; callers log these
/// and move on.
#[derive(Debug, Error)]
pub enum RowError {
    #[error("row {line_index} has {found} columns, expected at least {expected}")]
    TooFewColumns {
        line_index: usize,
        expected: usize,
        found: usize,
    },

    #[error("row {line_index} column '{column}' invalid: {message}")]
    BadField {
        line_index: usize,
        column: &'static str,
        message: String,
    },

    #[error("row {line_index} unreadable: {source}")]
    Csv {
        line_index: usize,
        #[source]
        source: csv::Error,
    },
}

impl RowError {
    pub fn line_index(&self) -> usize {
        match self {
            RowError::TooFewColumns { line_index, .. }
            | RowError::BadField { line_index, .. }
            | RowError::Csv { line_index, .. } => *line_index,
        }
    }
}

/// The file itself could not be read. Reported upward as a parse failure
/// for the whole file, never for the batch.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("event data unreadable at row {line_index}: {source}")]
    Csv {
        line_index: usize,
        #[source]
        source: csv::Error,
    },
}
