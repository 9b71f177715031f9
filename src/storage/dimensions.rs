use crate::error::StatsError;
use duckdb::{params, Connection};
use std::fmt;
use std::time::Duration;

/// Lookup/insert rounds before a resolution gives up on a racing writer.
const RESOLVE_ATTEMPTS: u32 = 8;

/// Pause between rounds, scaled by the attempt number.
const RESOLVE_BACKOFF: Duration = Duration::from_millis(2);

/// A category of reference data attached to every pageview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Country,
    Region,
    City,
    Browser,
    OperatingSystem,
    DeviceType,
    Language,
    Referrer,
    Path,
}

impl Dimension {
    /// All dimensions, in fact-table column order.
    pub const ALL: [Self; 9] = [
        Self::Country,
        Self::Region,
        Self::City,
        Self::Browser,
        Self::OperatingSystem,
        Self::DeviceType,
        Self::Language,
        Self::Referrer,
        Self::Path,
    ];

    pub const fn table(self) -> &'static str {
        match self {
            Self::Country => "countries",
            Self::Region => "regions",
            Self::City => "cities",
            Self::Browser => "browsers",
            Self::OperatingSystem => "operating_systems",
            Self::DeviceType => "device_types",
            Self::Language => "languages",
            Self::Referrer => "referrers",
            Self::Path => "paths",
        }
    }

    /// Column holding the natural value.
    pub const fn value_column(self) -> &'static str {
        match self {
            Self::Language => "code",
            Self::Referrer => "host",
            Self::Path => "path",
            _ => "name",
        }
    }

    /// Column scoping the natural key, for hierarchical dimensions.
    pub const fn parent_column(self) -> Option<&'static str> {
        match self {
            Self::Region => Some("country_id"),
            Self::City => Some("region_id"),
            _ => None,
        }
    }

    /// Foreign-key column in the fact and rollup tables.
    pub const fn fact_column(self) -> &'static str {
        match self {
            Self::Country => "country_id",
            Self::Region => "region_id",
            Self::City => "city_id",
            Self::Browser => "browser_id",
            Self::OperatingSystem => "os_id",
            Self::DeviceType => "device_type_id",
            Self::Language => "language_id",
            Self::Referrer => "referrer_id",
            Self::Path => "path_id",
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            Self::Country => "country",
            Self::Region => "region",
            Self::City => "city",
            Self::Browser => "browser",
            Self::OperatingSystem => "os",
            Self::DeviceType => "device_type",
            Self::Language => "language",
            Self::Referrer => "referrer",
            Self::Path => "path",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The natural key of a dimension row.
///
/// Regions are keyed by (country id, name) and cities by (region id, name);
/// every other dimension is keyed by its value alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NaturalKey<'a> {
    pub dimension: Dimension,
    pub parent: Option<i64>,
    pub value: &'a str,
}

impl<'a> NaturalKey<'a> {
    pub const fn new(dimension: Dimension, value: &'a str) -> Self {
        Self {
            dimension,
            parent: None,
            value,
        }
    }

    pub const fn scoped(dimension: Dimension, parent: i64, value: &'a str) -> Self {
        Self {
            dimension,
            parent: Some(parent),
            value,
        }
    }

    fn validate(&self) -> Result<(), StatsError> {
        if self.value.is_empty() {
            return Err(StatsError::invalid(format!(
                "{} natural key must not be empty",
                self.dimension
            )));
        }
        match (self.dimension.parent_column(), self.parent) {
            (Some(column), None) => Err(StatsError::invalid(format!(
                "{} natural key requires {column}",
                self.dimension
            ))),
            (None, Some(_)) => Err(StatsError::invalid(format!(
                "{} natural key takes no parent",
                self.dimension
            ))),
            _ => Ok(()),
        }
    }

    fn where_clause(&self) -> String {
        let value = self.dimension.value_column();
        self.dimension.parent_column().map_or_else(
            || format!("{value} = ?"),
            |parent| format!("{parent} = ? AND {value} = ?"),
        )
    }
}

/// Outcome of an insert-if-absent attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Created,
    /// Another writer already holds this natural key.
    Conflict,
}

/// Tagged resolution result consumed by the event writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(i64),
    Unresolved { reason: String },
}

impl Resolution {
    pub fn from_result(result: Result<i64, StatsError>) -> Self {
        match result {
            Ok(id) => Self::Resolved(id),
            Err(e) => Self::Unresolved {
                reason: e.to_string(),
            },
        }
    }

    pub const fn id(&self) -> Option<i64> {
        match self {
            Self::Resolved(id) => Some(*id),
            Self::Unresolved { .. } => None,
        }
    }
}

/// Resolve a natural key to its surrogate id, creating the row on first sight.
///
/// Concurrent callers with the same key converge on a single id through the
/// UNIQUE constraint on the natural key: whoever loses the insert race re-reads
/// the winner's row.
pub fn resolve(conn: &Connection, key: &NaturalKey<'_>) -> Result<i64, StatsError> {
    key.validate()?;
    let wrap = |source| StatsError::Resolution {
        dimension: key.dimension,
        source,
    };

    for attempt in 0..RESOLVE_ATTEMPTS {
        if let Some(id) = lookup(conn, key).map_err(wrap)? {
            return Ok(id);
        }

        if insert_if_absent(conn, key).map_err(wrap)? == InsertOutcome::Conflict {
            tracing::debug!(
                dimension = %key.dimension,
                attempt,
                "Lost dimension insert race, re-reading"
            );
        }

        if let Some(id) = lookup(conn, key).map_err(wrap)? {
            return Ok(id);
        }
        // The winning writer has not committed yet
        std::thread::sleep(RESOLVE_BACKOFF * (attempt + 1));
    }

    Err(wrap(duckdb::Error::QueryReturnedNoRows))
}

/// Look up the id for a natural key without creating it.
pub fn lookup(conn: &Connection, key: &NaturalKey<'_>) -> Result<Option<i64>, duckdb::Error> {
    let sql = format!(
        "SELECT id FROM {} WHERE {}",
        key.dimension.table(),
        key.where_clause()
    );
    let mut stmt = conn.prepare(&sql)?;
    match key.parent {
        Some(parent) => stmt
            .query_row(params![parent, key.value], |row| row.get(0))
            .map(Some)
            .or_else(no_rows_as_none),
        None => stmt
            .query_row(params![key.value], |row| row.get(0))
            .map(Some)
            .or_else(no_rows_as_none),
    }
}

/// Insert the natural key unless a row already holds it.
///
/// A unique-constraint or write-write conflict reported by the store counts as
/// [`InsertOutcome::Conflict`], not as a failure.
pub fn insert_if_absent(
    conn: &Connection,
    key: &NaturalKey<'_>,
) -> Result<InsertOutcome, duckdb::Error> {
    let table = key.dimension.table();
    let value = key.dimension.value_column();

    let result = match (key.dimension.parent_column(), key.parent) {
        (Some(parent_col), Some(parent)) => conn.execute(
            &format!(
                "INSERT INTO {table} ({parent_col}, {value}) VALUES (?, ?)
                 ON CONFLICT ({parent_col}, {value}) DO NOTHING"
            ),
            params![parent, key.value],
        ),
        _ => conn.execute(
            &format!(
                "INSERT INTO {table} ({value}) VALUES (?)
                 ON CONFLICT ({value}) DO NOTHING"
            ),
            params![key.value],
        ),
    };

    match result {
        Ok(0) => Ok(InsertOutcome::Conflict),
        Ok(_) => Ok(InsertOutcome::Created),
        Err(e) if is_conflict(&e) => Ok(InsertOutcome::Conflict),
        Err(e) => Err(e),
    }
}

/// Whether a store error signals a concurrent writer holding the same key.
fn is_conflict(err: &duckdb::Error) -> bool {
    match err {
        duckdb::Error::DuckDBFailure(_, Some(msg)) => {
            let msg = msg.to_ascii_lowercase();
            msg.contains("constraint") || msg.contains("duplicate key") || msg.contains("conflict")
        }
        _ => false,
    }
}

/// Read back the natural value for an id. Used by reports and tests.
pub fn value_of(
    conn: &Connection,
    dimension: Dimension,
    id: i64,
) -> Result<Option<String>, duckdb::Error> {
    let sql = format!(
        "SELECT {} FROM {} WHERE id = ?",
        dimension.value_column(),
        dimension.table()
    );
    conn.prepare(&sql)?
        .query_row([id], |row| row.get(0))
        .map(Some)
        .or_else(no_rows_as_none)
}

fn no_rows_as_none<T>(err: duckdb::Error) -> Result<Option<T>, duckdb::Error> {
    match err {
        duckdb::Error::QueryReturnedNoRows => Ok(None),
        e => Err(e),
    }
}
