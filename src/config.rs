//! Command line and environment configuration.
//!
//! Every option can be given as a flag (`--countries IT,FR`) or through the
//! matching `GEOGATE_*` environment variable. All values are validated
//! before the server binds its listener.

use clap::Parser;
use humanize_rs::ParseError;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::policy::{Action, Policy};

/// geogate configuration.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "geogate",
    about = "Forward-auth server allowing or blocking requests by GeoIP country",
    version
)]
pub struct Config {
    /// Action on countries. "allow": only listed countries are allowed.
    /// "block": listed countries are blocked, others are allowed.
    #[arg(long, env = "GEOGATE_ACTION", default_value = "allow")]
    pub action: Action,

    /// Comma separated ISO country codes to allow or block (see --action)
    #[arg(long, env = "GEOGATE_COUNTRIES", default_value = "IT")]
    pub countries: String,

    /// Allow requests whose address has no country (default: block)
    #[arg(long, env = "GEOGATE_ALLOW_EMPTY_COUNTRIES")]
    pub allow_empty_countries: bool,

    /// GeoIP database path
    #[arg(long, env = "GEOGATE_DB", default_value = "GeoLite2-Country.mmdb")]
    pub db: PathBuf,

    /// Re-read the database file after this period
    #[arg(long, env = "GEOGATE_DB_REFRESH_EVERY", default_value = "1h", value_parser = parse_duration)]
    pub db_refresh_every: Duration,

    /// Delay before a replaced database is closed
    #[arg(long, env = "GEOGATE_DB_GRACE_PERIOD", default_value = "10s", value_parser = parse_duration)]
    pub db_grace_period: Duration,

    /// HTTP listener address and port (":8080" listens on all interfaces)
    #[arg(long, env = "GEOGATE_WEB_LISTEN", default_value = ":8080")]
    pub web_listen: String,

    /// Timeout for serving a request and for draining on shutdown
    #[arg(long, env = "GEOGATE_WEB_TIMEOUT", default_value = "30s", value_parser = parse_duration)]
    pub web_timeout: Duration,

    /// Debug mode (log verbose)
    #[arg(long, env = "GEOGATE_DEBUG")]
    pub debug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            action: Action::Allow,
            countries: "IT".to_string(),
            allow_empty_countries: false,
            db: PathBuf::from("GeoLite2-Country.mmdb"),
            db_refresh_every: Duration::from_secs(60 * 60),
            db_grace_period: Duration::from_secs(10),
            web_listen: ":8080".to_string(),
            web_timeout: Duration::from_secs(30),
            debug: false,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments.
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Default log filter for this configuration.
    pub fn log_filter(&self) -> &'static str {
        if self.debug {
            "debug"
        } else {
            "info"
        }
    }

    /// Build the policy from `action`, `countries` and `allow_empty_countries`.
    pub fn policy(&self) -> Result<Policy> {
        Policy::from_list(self.action, &self.countries, self.allow_empty_countries)
    }

    /// Resolve `web_listen` into a socket address.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        parse_listen_addr(&self.web_listen)
    }

    /// Validate everything that can fail before serving.
    pub fn validate(&self) -> Result<()> {
        self.policy()?;
        self.listen_addr()?;
        if self.db_refresh_every.is_zero() {
            return Err(Error::InvalidDuration(
                "db-refresh-every must be greater than zero".to_string(),
            ));
        }
        if self.web_timeout.is_zero() {
            return Err(Error::InvalidDuration(
                "web-timeout must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a human readable duration ("1h", "30s", "500ms"); a bare number is seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    match humanize_rs::duration::parse(value) {
        Ok(d) => Ok(d),
        Err(ParseError::MissingUnit) => value
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| Error::InvalidDuration(value.to_string())),
        Err(e) => Err(Error::InvalidDuration(format!("{value:?}: {e}"))),
    }
}

/// Parse a listen address, accepting the `":port"` shorthand for all interfaces.
pub fn parse_listen_addr(value: &str) -> Result<SocketAddr> {
    let full;
    let addr = if value.starts_with(':') {
        full = format!("0.0.0.0{value}");
        full.as_str()
    } else {
        value
    };

    addr.parse()
        .map_err(|_| Error::InvalidListenAddress(value.to_string()))
}
