use crate::error::StatsError;
use crate::ingest::enrich::EnrichedAttributes;
use crate::storage::bind_timestamp;
use crate::storage::dimensions::{resolve, Dimension, NaturalKey, Resolution};
use chrono::{DateTime, Utc};
use duckdb::{params, Connection};

/// A tracked page load, before dimension resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageviewEvent {
    pub site_id: String,
    pub path: String,
    pub referrer: Option<String>,
    /// Defaults to the write time when absent.
    pub timestamp: Option<DateTime<Utc>>,
    pub fingerprint: u32,
}

/// The immutable row written for one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageviewFact {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub site_id: String,
    pub visitor_id: u32,
    /// Surrogate ids in [`Dimension::ALL`] order; `None` when absent or unresolved.
    pub dimension_ids: [Option<i64>; 9],
}

impl PageviewFact {
    pub fn dimension_id(&self, dimension: Dimension) -> Option<i64> {
        Dimension::ALL
            .iter()
            .position(|d| *d == dimension)
            .and_then(|idx| self.dimension_ids[idx])
    }
}

/// What the writer does when a present attribute cannot be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnresolvedPolicy {
    /// Keep the event and leave the dimension reference NULL.
    #[default]
    RecordWithPlaceholder,
    /// Drop the event and surface [`StatsError::Unresolved`].
    Reject,
}

/// A dimension that was present on the event but could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedDimension {
    pub dimension: Dimension,
    pub reason: String,
}

/// Result of a successful write. A non-empty `unresolved` list is a partial success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordOutcome {
    pub fact: PageviewFact,
    pub unresolved: Vec<UnresolvedDimension>,
}

impl RecordOutcome {
    pub fn is_complete(&self) -> bool {
        self.unresolved.is_empty()
    }
}

/// Resolve every attribute of `event` and `attrs`, then insert one fact row.
///
/// No batching: each call performs its own resolution and insert.
pub fn record(
    conn: &Connection,
    event: &PageviewEvent,
    attrs: &EnrichedAttributes,
    policy: UnresolvedPolicy,
) -> Result<RecordOutcome, StatsError> {
    if event.site_id.is_empty() {
        return Err(StatsError::invalid("site_id must not be empty"));
    }
    let path = normalize_path(&event.path);
    if path.is_empty() {
        return Err(StatsError::invalid("path must not be empty"));
    }
    let referrer = event.referrer.as_deref().and_then(referrer_host);

    let mut ids = [None; 9];
    let mut unresolved = Vec::new();
    let mut note = |dimension: Dimension, resolution: Option<Resolution>| -> Option<i64> {
        match resolution? {
            Resolution::Resolved(id) => Some(id),
            Resolution::Unresolved { reason } => {
                unresolved.push(UnresolvedDimension { dimension, reason });
                None
            }
        }
    };

    let country = note(
        Dimension::Country,
        present(attrs.country.as_deref()).map(|v| tagged(conn, NaturalKey::new(Dimension::Country, v))),
    );
    let region = note(
        Dimension::Region,
        present(attrs.region.as_deref()).map(|v| scoped(conn, Dimension::Region, country, v)),
    );
    let city = note(
        Dimension::City,
        present(attrs.city.as_deref()).map(|v| scoped(conn, Dimension::City, region, v)),
    );
    ids[0] = country;
    ids[1] = region;
    ids[2] = city;

    let flat = [
        (Dimension::Browser, attrs.browser.as_deref()),
        (Dimension::OperatingSystem, attrs.os.as_deref()),
        (Dimension::DeviceType, attrs.device_type.as_deref()),
        (Dimension::Language, attrs.language.as_deref()),
        (Dimension::Referrer, referrer.as_deref()),
        (Dimension::Path, Some(path.as_str())),
    ];
    for (slot, (dimension, value)) in ids.iter_mut().skip(3).zip(flat) {
        *slot = note(
            dimension,
            present(value).map(|v| tagged(conn, NaturalKey::new(dimension, v))),
        );
    }

    if policy == UnresolvedPolicy::Reject {
        if let Some(first) = unresolved.first() {
            return Err(StatsError::Unresolved {
                dimension: first.dimension,
                reason: first.reason.clone(),
            });
        }
    }
    for miss in &unresolved {
        tracing::warn!(
            site_id = %event.site_id,
            dimension = %miss.dimension,
            reason = %miss.reason,
            "Recording pageview with unresolved dimension"
        );
    }

    let timestamp = event.timestamp.unwrap_or_else(Utc::now);
    let id = insert_fact(conn, timestamp, &event.site_id, event.fingerprint, &ids)
        .map_err(StatsError::Write)?;

    Ok(RecordOutcome {
        fact: PageviewFact {
            id,
            timestamp,
            site_id: event.site_id.clone(),
            visitor_id: event.fingerprint,
            dimension_ids: ids,
        },
        unresolved,
    })
}

fn present(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn tagged(conn: &Connection, key: NaturalKey<'_>) -> Resolution {
    Resolution::from_result(resolve(conn, &key))
}

/// Region and city are keyed under their parent; without one they stay unresolved.
fn scoped(conn: &Connection, dimension: Dimension, parent: Option<i64>, value: &str) -> Resolution {
    match parent {
        Some(parent) => tagged(conn, NaturalKey::scoped(dimension, parent, value)),
        None => Resolution::Unresolved {
            reason: format!("{dimension} requires a resolved parent"),
        },
    }
}

fn insert_fact(
    conn: &Connection,
    timestamp: DateTime<Utc>,
    site_id: &str,
    visitor_id: u32,
    ids: &[Option<i64>; 9],
) -> Result<i64, duckdb::Error> {
    let mut stmt = conn.prepare(
        "INSERT INTO pageviews (
            ts, site_id, visitor_id, country_id, region_id, city_id, browser_id, os_id,
            device_type_id, language_id, referrer_id, path_id
        ) VALUES (CAST(? AS TIMESTAMP), ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id",
    )?;
    stmt.query_row(
        params![
            bind_timestamp(timestamp),
            site_id,
            i64::from(visitor_id),
            ids[0],
            ids[1],
            ids[2],
            ids[3],
            ids[4],
            ids[5],
            ids[6],
            ids[7],
            ids[8],
        ],
        |row| row.get(0),
    )
}

/// Strip query string and fragment from a path.
fn normalize_path(path: &str) -> String {
    let path = path.trim();
    let path = path.split('?').next().unwrap_or(path);
    let path = path.split('#').next().unwrap_or(path);
    path.to_string()
}

/// Reduce a referrer URL to its lowercased host, without port or credentials.
pub fn referrer_host(referrer: &str) -> Option<String> {
    let rest = referrer.trim();
    let rest = rest
        .split_once("://")
        .map_or(rest, |(_, after)| after);
    let authority = rest.split(['/', '?', '#']).next().unwrap_or(rest);
    let host = authority.rsplit('@').next().unwrap_or(authority);
    let host = host.split(':').next().unwrap_or(host);

    if host.is_empty() {
        None
    } else {
        Some(host.to_ascii_lowercase())
    }
}
