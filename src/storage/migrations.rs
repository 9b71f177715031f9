use crate::storage::schema;
use duckdb::Connection;

/// One schema step. Steps run in `version` order, each in its own transaction.
struct Migration {
    version: u32,
    name: &'static str,
    apply: fn(&Connection) -> Result<(), duckdb::Error>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "dimensions, facts, rollups and watermarks",
        apply: schema::init_schema,
    },
    Migration {
        version: 2,
        name: "fact scan index on (site_id, ts)",
        apply: |conn| conn.execute_batch(schema::CREATE_FACT_SCAN_INDEX),
    },
];

/// Highest version this build knows how to apply.
pub const LATEST_VERSION: u32 = 2;

/// Bring the store up to [`LATEST_VERSION`], skipping steps already recorded.
///
/// A store stamped with a newer version than this build is left untouched.
pub fn run_migrations(conn: &Connection) -> Result<(), duckdb::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
             version    INTEGER NOT NULL,
             name       VARCHAR,
             applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
         )",
    )?;

    let recorded = schema_version(conn)?;
    if recorded > LATEST_VERSION {
        tracing::warn!(
            recorded,
            latest = LATEST_VERSION,
            "Store was written by a newer build; skipping migrations"
        );
        return Ok(());
    }

    for step in MIGRATIONS.iter().filter(|m| m.version > recorded) {
        apply_step(conn, step)?;
    }
    tracing::debug!(version = LATEST_VERSION.max(recorded), "Schema up to date");
    Ok(())
}

/// Highest applied version, 0 for a fresh store.
pub fn schema_version(conn: &Connection) -> Result<u32, duckdb::Error> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
}

fn apply_step(conn: &Connection, step: &Migration) -> Result<(), duckdb::Error> {
    conn.execute_batch("BEGIN TRANSACTION")?;
    let applied = (step.apply)(conn).and_then(|()| {
        conn.execute(
            "INSERT INTO schema_version (version, name) VALUES (?, ?)",
            duckdb::params![step.version, step.name],
        )
    });
    match applied {
        Ok(_) => {
            conn.execute_batch("COMMIT")?;
            tracing::info!(version = step.version, name = step.name, "Applied schema migration");
            Ok(())
        }
        Err(e) => {
            if let Err(rollback) = conn.execute_batch("ROLLBACK") {
                tracing::error!(error = %rollback, "Rollback of failed migration failed");
            }
            tracing::error!(version = step.version, error = %e, "Schema migration failed");
            Err(e)
        }
    }
}
