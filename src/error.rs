use crate::storage::dimensions::Dimension;
use chrono::NaiveDate;
use thiserror::Error;

/// Errors raised by the ingestion, compaction and query core.
///
/// Every variant is surfaced to the caller as-is; nothing in the core retries.
#[derive(Debug, Error)]
pub enum StatsError {
    /// Looking up or creating a dimension row failed in the store.
    #[error("failed to resolve {dimension} dimension: {source}")]
    Resolution {
        dimension: Dimension,
        #[source]
        source: duckdb::Error,
    },
    /// A dimension could not be resolved and the writer policy rejects the event.
    #[error("{dimension} dimension unresolved: {reason}")]
    Unresolved { dimension: Dimension, reason: String },
    /// A scan or upsert aborted the compaction of a whole day.
    #[error("compaction of {day} failed: {source}")]
    Compaction {
        day: NaiveDate,
        #[source]
        source: duckdb::Error,
    },
    /// A historic or live sub-query failed; no partial results are returned.
    #[error("stats query failed: {0}")]
    Query(#[source] duckdb::Error),
    /// Writing the fact row itself failed.
    #[error("failed to write pageview: {0}")]
    Write(#[source] duckdb::Error),
    /// The request was rejected before touching the store.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl StatsError {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Returns `true` for errors caused by the caller rather than the store.
    pub const fn is_invalid_input(&self) -> bool {
        matches!(self, Self::InvalidInput(_))
    }
}
