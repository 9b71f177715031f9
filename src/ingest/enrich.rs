use crate::ingest::geoip::GeoIpReader;
use crate::ingest::useragent::parse_user_agent;
use std::path::Path;

/// Plain-string attributes derived from the request, before dimension resolution.
///
/// `None` (or an empty string) means the attribute is unknown; the matching
/// fact column is then left NULL without touching the dimension store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrichedAttributes {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub browser: Option<String>,
    pub os: Option<String>,
    pub device_type: Option<String>,
    pub language: Option<String>,
}

impl EnrichedAttributes {
    /// Attach the primary language tag taken from an `Accept-Language` header.
    #[must_use]
    pub fn with_language(mut self, accept_language: Option<&str>) -> Self {
        self.language = accept_language.and_then(primary_language);
        self
    }
}

/// Derives geo and client attributes from a client IP and User-Agent.
pub trait Enricher: Send + Sync {
    fn enrich(&self, ip: &str, user_agent: &str) -> EnrichedAttributes;
}

/// GeoLite2 lookup plus User-Agent classification.
pub struct StandardEnricher {
    geoip: GeoIpReader,
}

impl StandardEnricher {
    pub fn new(geoip_db: Option<&Path>) -> Self {
        Self {
            geoip: GeoIpReader::open(geoip_db),
        }
    }

    pub const fn geoip_loaded(&self) -> bool {
        self.geoip.is_loaded()
    }
}

impl Enricher for StandardEnricher {
    fn enrich(&self, ip: &str, user_agent: &str) -> EnrichedAttributes {
        let geo = self.geoip.lookup(ip);
        let ua = parse_user_agent(user_agent);
        EnrichedAttributes {
            country: geo.country,
            region: geo.region,
            city: geo.city,
            browser: ua.browser,
            os: ua.os,
            device_type: ua.device_type,
            language: None,
        }
    }
}

/// First tag of an `Accept-Language` header, lowercased, quality suffix dropped.
///
/// `"en-US,en;q=0.9"` becomes `"en-us"`; `"*"` and empty headers yield `None`.
pub fn primary_language(header: &str) -> Option<String> {
    let tag = header.split(',').next()?.split(';').next()?.trim();
    if tag.is_empty() || tag == "*" || tag.len() > 35 {
        return None;
    }
    if !tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        return None;
    }
    Some(tag.to_ascii_lowercase())
}
