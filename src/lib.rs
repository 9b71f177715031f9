pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod query;
pub mod rollup;
pub mod server;
pub mod storage;
