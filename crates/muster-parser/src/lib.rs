pub mod errors;
pub mod model;
mod reader;

pub use errors::{ParseError, RowError};
pub use model::{ClockEvent, GeoSample, TransactionKind, WorkerId, EVENT_TIMESTAMP_FORMAT};
pub use reader::{read_clock_events, read_clock_file, EventReader, ParsedEvents};

#[cfg(test)]
mod tests;
