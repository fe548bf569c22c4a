pub mod config;
pub mod db;
pub mod directory;
pub mod driver;
pub mod mapping_sync;
pub mod outcome;
pub mod reconcile;
pub mod store;
