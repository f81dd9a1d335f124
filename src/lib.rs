//! geogate - a tiny forward-auth server allowing or blocking requests by country.
//!
//! A reverse proxy (e.g. Traefik's ForwardAuth middleware) asks geogate about
//! every incoming request. geogate reads the client address from
//! `X-Forwarded-For`, resolves its country in a MaxMind GeoIP database and
//! answers `200` to allow or `403` to deny.
//!
//! # Features
//!
//! - **Allowlist or blocklist**: a set of ISO country codes with an `allow`
//!   or `block` action
//! - **Empty results**: addresses without a country (private ranges, no
//!   match) are allowed or denied by a dedicated flag
//! - **Hot reload**: the database file is re-read periodically and swapped in
//!   atomically, without dropping in-flight requests
//! - **Graceful shutdown**: SIGINT/SIGTERM drain in-flight requests before
//!   the database is closed
//!
//! # Quick Start
//!
//! ```ignore
//! use geogate::{Config, MaxMindProvider, Server};
//!
//! let config = Config::from_args();
//! let server = Server::<MaxMindProvider>::new(&config)?;
//! server.run().await?;
//! ```
//!
//! # Status codes
//!
//! - `200`: allowed
//! - `403`: denied
//! - `400`: `X-Forwarded-For` missing or not an IP address
//! - `500`: database lookup failed

mod error;

pub mod config;
pub mod database;
pub mod handler;
pub mod policy;
pub mod provider;
pub mod reloader;
pub mod server;

// Re-export core types
pub use error::{Error, LookupError, Result};
pub use policy::{decide, Action, Policy, Verdict};
pub use provider::{GeoLookupProvider, LookupResult, MaxMindProvider};

// Re-export database lifecycle
pub use database::{DatabaseHandle, OpenedDatabase};
pub use reloader::Reloader;

// Re-export server types
pub use config::Config;
pub use handler::{create_router, AppState};
pub use server::Server;
