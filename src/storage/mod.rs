pub mod dimensions;
pub mod migrations;
pub mod schema;

use chrono::{DateTime, NaiveDateTime, Utc};

/// Timestamp layout used when binding times as `CAST(? AS TIMESTAMP)`.
const BIND_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Layout produced by `strftime(..., '%Y-%m-%d %H:%M:%S')` in bucket queries.
pub(crate) const BUCKET_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Format a UTC instant for binding into DuckDB. Facts are stored as naive UTC.
pub(crate) fn bind_timestamp(ts: DateTime<Utc>) -> String {
    ts.naive_utc().format(BIND_FORMAT).to_string()
}

/// Read a `strftime`-formatted bucket column back into a UTC instant.
pub(crate) fn bucket_column(row: &duckdb::Row<'_>, idx: usize) -> Result<DateTime<Utc>, duckdb::Error> {
    parse_column(row, idx, BUCKET_FORMAT)
}

/// Read a column selected as `strftime(ts, '%Y-%m-%d %H:%M:%S.%f')`, keeping microseconds.
pub(crate) fn timestamp_column(row: &duckdb::Row<'_>, idx: usize) -> Result<DateTime<Utc>, duckdb::Error> {
    parse_column(row, idx, BIND_FORMAT)
}

fn parse_column(row: &duckdb::Row<'_>, idx: usize, layout: &str) -> Result<DateTime<Utc>, duckdb::Error> {
    let raw: String = row.get(idx)?;
    NaiveDateTime::parse_from_str(&raw, layout)
        .map(|naive| naive.and_utc())
        .map_err(|e| duckdb::Error::FromSqlConversionFailure(idx, duckdb::types::Type::Text, Box::new(e)))
}
