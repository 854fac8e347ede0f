pub mod assignment;
pub mod config;
pub mod persistence;
pub mod record;
pub mod report;
pub mod stats;
pub mod store;
