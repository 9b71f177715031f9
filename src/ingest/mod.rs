pub mod enrich;
pub mod fingerprint;
pub mod geoip;
pub mod handler;
pub mod useragent;
pub mod writer;
