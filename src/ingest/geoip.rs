use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

/// Geographic attributes resolved from an IP address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
}

/// Thread-safe wrapper around the MaxMind GeoLite2 database reader.
/// When the database is not available, all lookups return `GeoInfo::default()`.
pub struct GeoIpReader {
    reader: Option<Arc<maxminddb::Reader<Vec<u8>>>>,
}

impl GeoIpReader {
    /// Open a MaxMind .mmdb database file.
    ///
    /// Degrades gracefully: if the path is `None`, the file doesn't exist, or it
    /// fails to open, every lookup comes back empty.
    pub fn open(path: Option<&Path>) -> Self {
        let reader = path.and_then(|p| {
            if !p.exists() {
                tracing::warn!(path = %p.display(), "GeoIP database not found, geolocation disabled");
                return None;
            }
            match maxminddb::Reader::open_readfile(p) {
                Ok(r) => {
                    tracing::info!(path = %p.display(), "GeoIP database loaded");
                    Some(Arc::new(r))
                }
                Err(e) => {
                    tracing::warn!(path = %p.display(), error = %e, "Failed to open GeoIP database, geolocation disabled");
                    None
                }
            }
        });
        Self { reader }
    }

    /// Returns `true` if a GeoIP database is loaded.
    pub const fn is_loaded(&self) -> bool {
        self.reader.is_some()
    }

    /// Look up the country, region and city for an IP address.
    ///
    /// The address is used only for the lookup and never stored or logged.
    /// Country is the English name when the database has one, else the ISO code.
    pub fn lookup(&self, ip: &str) -> GeoInfo {
        let Some(reader) = &self.reader else {
            return GeoInfo::default();
        };

        let Ok(addr) = ip.parse::<IpAddr>() else {
            return GeoInfo::default();
        };

        let Ok(lookup_result) = reader.lookup(addr) else {
            return GeoInfo::default();
        };

        let Ok(Some(city)) = lookup_result.decode::<maxminddb::geoip2::City>() else {
            return GeoInfo::default();
        };

        let country = city
            .country
            .names
            .english
            .or(city.country.iso_code)
            .map(String::from);

        let region = city
            .subdivisions
            .first()
            .and_then(|s| s.names.english)
            .map(String::from);

        GeoInfo {
            country,
            region,
            city: city.city.names.english.map(String::from),
        }
    }
}
