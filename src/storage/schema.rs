use duckdb::Connection;

/// Dimension reference tables. Append-only: rows are created lazily and never updated.
pub const CREATE_DIMENSION_TABLES: &str = r"
CREATE SEQUENCE IF NOT EXISTS countries_id_seq START 1;
CREATE TABLE IF NOT EXISTS countries (
    id   BIGINT PRIMARY KEY DEFAULT nextval('countries_id_seq'),
    name VARCHAR NOT NULL,
    UNIQUE (name)
);

CREATE SEQUENCE IF NOT EXISTS regions_id_seq START 1;
CREATE TABLE IF NOT EXISTS regions (
    id         BIGINT PRIMARY KEY DEFAULT nextval('regions_id_seq'),
    country_id BIGINT NOT NULL,
    name       VARCHAR NOT NULL,
    UNIQUE (country_id, name)
);

CREATE SEQUENCE IF NOT EXISTS cities_id_seq START 1;
CREATE TABLE IF NOT EXISTS cities (
    id        BIGINT PRIMARY KEY DEFAULT nextval('cities_id_seq'),
    region_id BIGINT NOT NULL,
    name      VARCHAR NOT NULL,
    UNIQUE (region_id, name)
);

CREATE SEQUENCE IF NOT EXISTS browsers_id_seq START 1;
CREATE TABLE IF NOT EXISTS browsers (
    id   BIGINT PRIMARY KEY DEFAULT nextval('browsers_id_seq'),
    name VARCHAR NOT NULL,
    UNIQUE (name)
);

CREATE SEQUENCE IF NOT EXISTS operating_systems_id_seq START 1;
CREATE TABLE IF NOT EXISTS operating_systems (
    id   BIGINT PRIMARY KEY DEFAULT nextval('operating_systems_id_seq'),
    name VARCHAR NOT NULL,
    UNIQUE (name)
);

CREATE SEQUENCE IF NOT EXISTS device_types_id_seq START 1;
CREATE TABLE IF NOT EXISTS device_types (
    id   BIGINT PRIMARY KEY DEFAULT nextval('device_types_id_seq'),
    name VARCHAR NOT NULL,
    UNIQUE (name)
);

CREATE SEQUENCE IF NOT EXISTS languages_id_seq START 1;
CREATE TABLE IF NOT EXISTS languages (
    id   BIGINT PRIMARY KEY DEFAULT nextval('languages_id_seq'),
    code VARCHAR NOT NULL,
    UNIQUE (code)
);

CREATE SEQUENCE IF NOT EXISTS referrers_id_seq START 1;
CREATE TABLE IF NOT EXISTS referrers (
    id   BIGINT PRIMARY KEY DEFAULT nextval('referrers_id_seq'),
    host VARCHAR NOT NULL,
    UNIQUE (host)
);

CREATE SEQUENCE IF NOT EXISTS paths_id_seq START 1;
CREATE TABLE IF NOT EXISTS paths (
    id   BIGINT PRIMARY KEY DEFAULT nextval('paths_id_seq'),
    path VARCHAR NOT NULL,
    UNIQUE (path)
);
";

/// Immutable pageview facts. Dimension references are NULL when unresolved.
pub const CREATE_PAGEVIEWS_TABLE: &str = r"
CREATE SEQUENCE IF NOT EXISTS pageviews_id_seq START 1;
CREATE TABLE IF NOT EXISTS pageviews (
    id             BIGINT DEFAULT nextval('pageviews_id_seq'),
    ts             TIMESTAMP NOT NULL,
    site_id        VARCHAR NOT NULL,
    visitor_id     UINTEGER NOT NULL,
    country_id     BIGINT,
    region_id      BIGINT,
    city_id        BIGINT,
    browser_id     BIGINT,
    os_id          BIGINT,
    device_type_id BIGINT,
    language_id    BIGINT,
    referrer_id    BIGINT,
    path_id        BIGINT
);
";

/// Rollup tables. The full dimension tuple is part of the key, so unresolved
/// references are stored as 0 rather than NULL.
pub const CREATE_ROLLUP_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS daily_pageviews (
    day             TIMESTAMP NOT NULL,
    site_id         VARCHAR NOT NULL,
    country_id      BIGINT NOT NULL,
    region_id       BIGINT NOT NULL,
    city_id         BIGINT NOT NULL,
    browser_id      BIGINT NOT NULL,
    os_id           BIGINT NOT NULL,
    device_type_id  BIGINT NOT NULL,
    language_id     BIGINT NOT NULL,
    referrer_id     BIGINT NOT NULL,
    path_id         BIGINT NOT NULL,
    count           BIGINT NOT NULL,
    unique_visitors BIGINT NOT NULL,
    bounces         BIGINT NOT NULL,
    PRIMARY KEY (day, site_id, country_id, region_id, city_id, browser_id, os_id,
                 device_type_id, language_id, referrer_id, path_id)
);

CREATE TABLE IF NOT EXISTS hourly_pageviews (
    hour            TIMESTAMP NOT NULL,
    site_id         VARCHAR NOT NULL,
    country_id      BIGINT NOT NULL,
    region_id       BIGINT NOT NULL,
    city_id         BIGINT NOT NULL,
    browser_id      BIGINT NOT NULL,
    os_id           BIGINT NOT NULL,
    device_type_id  BIGINT NOT NULL,
    language_id     BIGINT NOT NULL,
    referrer_id     BIGINT NOT NULL,
    path_id         BIGINT NOT NULL,
    count           BIGINT NOT NULL,
    unique_visitors BIGINT NOT NULL,
    bounces         BIGINT NOT NULL,
    PRIMARY KEY (hour, site_id, country_id, region_id, city_id, browser_id, os_id,
                 device_type_id, language_id, referrer_id, path_id)
);

CREATE TABLE IF NOT EXISTS compaction_watermarks (
    day          TIMESTAMP PRIMARY KEY,
    compacted_at TIMESTAMP NOT NULL,
    fact_count   BIGINT NOT NULL,
    daily_rows   BIGINT NOT NULL,
    hourly_rows  BIGINT NOT NULL
);
";

/// Range scans over facts filter on site then time.
pub const CREATE_FACT_SCAN_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS pageviews_site_ts_idx ON pageviews (site_id, ts);";

/// Initialize the database schema.
pub fn init_schema(conn: &Connection) -> Result<(), duckdb::Error> {
    conn.execute_batch(CREATE_DIMENSION_TABLES)?;
    conn.execute_batch(CREATE_PAGEVIEWS_TABLE)?;
    conn.execute_batch(CREATE_ROLLUP_TABLES)?;
    Ok(())
}
