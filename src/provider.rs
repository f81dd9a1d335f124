//! GeoIP lookup providers.
//!
//! The binary database format is handled entirely by the `maxminddb` crate;
//! the rest of geogate only sees the [`GeoLookupProvider`] capability, which
//! maps an IP address to a country code or fails.

use std::net::IpAddr;
use std::path::Path;

use maxminddb::MaxMindDBError;

use crate::error::{Error, LookupError, Result};

/// Capability mapping an IP address to a country code.
///
/// A provider is opened from a file, shared read-only between requests and
/// released by dropping it.
pub trait GeoLookupProvider: Send + Sync + Sized + 'static {
    /// Open a provider from a database file.
    fn open(path: &Path) -> Result<Self>;

    /// Look up the country of an IP address.
    ///
    /// An address with no country (private ranges, no match) is an empty
    /// [`LookupResult`], not an error.
    fn lookup(&self, ip: IpAddr) -> std::result::Result<LookupResult, LookupError>;
}

/// Country resolved for a single request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LookupResult {
    country_code: Option<String>,
}

impl LookupResult {
    /// Build a result from an optional ISO code. Empty codes count as no country.
    pub fn new(iso_code: Option<String>) -> Self {
        Self {
            country_code: iso_code.filter(|c| !c.is_empty()),
        }
    }

    /// A result resolving to `code`.
    pub fn country(code: &str) -> Self {
        Self::new(Some(code.to_string()))
    }

    /// A result with no country.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether the lookup produced no country.
    pub fn is_empty(&self) -> bool {
        self.country_code.is_none()
    }

    /// The ISO country code, or `""` when empty.
    pub fn country_code(&self) -> &str {
        self.country_code.as_deref().unwrap_or("")
    }
}

/// Provider backed by a MaxMind GeoLite2/GeoIP2 Country or City database.
pub struct MaxMindProvider {
    reader: maxminddb::Reader<Vec<u8>>,
}

impl MaxMindProvider {
    /// Create a provider from an in-memory database.
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let reader = maxminddb::Reader::from_source(data).map_err(|e| Error::DatabaseOpen {
            path: "<memory>".into(),
            reason: e.to_string(),
        })?;
        Ok(Self { reader })
    }

    /// Database type recorded in the file metadata (e.g. `GeoLite2-Country`).
    pub fn database_type(&self) -> &str {
        &self.reader.metadata.database_type
    }

    /// Build time of the database as a Unix timestamp.
    pub fn build_epoch(&self) -> u64 {
        self.reader.metadata.build_epoch
    }
}

impl GeoLookupProvider for MaxMindProvider {
    fn open(path: &Path) -> Result<Self> {
        let reader = maxminddb::Reader::open_readfile(path).map_err(|e| Error::DatabaseOpen {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        log::debug!(
            "Opened {} database {:?} (build epoch {})",
            reader.metadata.database_type,
            path,
            reader.metadata.build_epoch
        );

        Ok(Self { reader })
    }

    fn lookup(&self, ip: IpAddr) -> std::result::Result<LookupResult, LookupError> {
        #[derive(serde::Deserialize)]
        struct Country {
            iso_code: Option<String>,
        }

        #[derive(serde::Deserialize)]
        struct CountryRecord {
            country: Option<Country>,
        }

        match self.reader.lookup::<CountryRecord>(ip) {
            Ok(record) => Ok(LookupResult::new(record.country.and_then(|c| c.iso_code))),
            Err(MaxMindDBError::AddressNotFoundError(_)) => Ok(LookupResult::empty()),
            Err(e) => Err(LookupError::Database(e.to_string())),
        }
    }
}
