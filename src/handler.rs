//! Forward-auth request handling.
//!
//! The reverse proxy forwards every incoming request here before routing it.
//! The client address comes from `X-Forwarded-For`, which is taken as a single
//! raw value; a comma separated chain is not split and fails to parse.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Router;
use std::net::IpAddr;
use std::sync::Arc;

use crate::database::DatabaseHandle;
use crate::policy::Policy;
use crate::provider::GeoLookupProvider;

/// Header carrying the client address set by the reverse proxy.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";

/// Shared state for request handlers.
pub struct AppState<P> {
    database: Arc<DatabaseHandle<P>>,
    policy: Policy,
}

impl<P: GeoLookupProvider> AppState<P> {
    pub fn new(database: Arc<DatabaseHandle<P>>, policy: Policy) -> Self {
        Self { database, policy }
    }

    pub fn database(&self) -> &Arc<DatabaseHandle<P>> {
        &self.database
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// Resolve the status code for a request with the given headers.
    pub fn check(&self, headers: &HeaderMap) -> StatusCode {
        let raw = match headers.get(FORWARDED_FOR_HEADER) {
            Some(value) if !value.is_empty() => value,
            _ => {
                log::debug!("Request without {} header", FORWARDED_FOR_HEADER);
                return StatusCode::BAD_REQUEST;
            }
        };

        let ip = match raw.to_str().ok().and_then(|s| s.parse::<IpAddr>().ok()) {
            Some(ip) => ip.to_canonical(),
            None => {
                log::error!("Can't parse IP address, source-ip={:?}", raw);
                return StatusCode::BAD_REQUEST;
            }
        };

        let result = match self.database.snapshot().lookup(ip) {
            Ok(result) => result,
            Err(e) => {
                log::error!("GeoIP database lookup failed for {}: {}", ip, e);
                return StatusCode::INTERNAL_SERVER_ERROR;
            }
        };

        let verdict = self.policy.evaluate(&result);
        log::debug!(
            "{} ip={} country={:?} action={} allow-empty={}",
            verdict,
            ip,
            result.country_code(),
            self.policy.action(),
            self.policy.allow_empty_country()
        );

        verdict.status_code()
    }
}

/// Handle any request: reply 200 to allow, 403 to deny.
pub async fn authorize<P: GeoLookupProvider>(
    State(state): State<Arc<AppState<P>>>,
    headers: HeaderMap,
) -> StatusCode {
    state.check(&headers)
}

/// Create the router answering every path and method with [`authorize`].
///
/// Timeouts are enforced per connection by the server, not here.
pub fn create_router<P: GeoLookupProvider>(state: Arc<AppState<P>>) -> Router {
    Router::new().fallback(authorize::<P>).with_state(state)
}
