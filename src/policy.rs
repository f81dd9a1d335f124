//! Country policy and the allow/deny decision.

use ahash::AHashSet;
use axum::http::StatusCode;
use std::fmt;

use crate::error::{Error, Result};
use crate::provider::LookupResult;

/// What to do with the countries listed in a [`Policy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Action {
    /// Only listed countries are allowed
    #[default]
    Allow,
    /// Listed countries are blocked, all others allowed
    Block,
}

impl Action {
    /// Get the string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Block => "block",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Action {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "allow" => Ok(Action::Allow),
            "block" => Ok(Action::Block),
            _ => Err(Error::InvalidAction(s.to_string())),
        }
    }
}

/// Outcome of a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Allow,
    Deny,
}

impl Verdict {
    /// HTTP status code reported to the reverse proxy.
    pub fn status_code(self) -> StatusCode {
        match self {
            Verdict::Allow => StatusCode::OK,
            Verdict::Deny => StatusCode::FORBIDDEN,
        }
    }

    pub fn is_allow(self) -> bool {
        self == Verdict::Allow
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Allow => f.write_str("ALLOW"),
            Verdict::Deny => f.write_str("DENY"),
        }
    }
}

/// Immutable allow/block rule set, built once at startup.
#[derive(Debug, Clone)]
pub struct Policy {
    action: Action,
    /// Set of 2-letter ISO country codes (uppercase)
    countries: AHashSet<String>,
    allow_empty_country: bool,
}

impl Policy {
    /// Create a policy from already-validated country codes.
    pub fn new<I, S>(action: Action, countries: I, allow_empty_country: bool) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut set = AHashSet::new();
        for country in countries {
            set.insert(normalize_country_code(country.as_ref())?);
        }

        Ok(Self {
            action,
            countries: set,
            allow_empty_country,
        })
    }

    /// Create a policy from a comma separated country list such as `"IT,FR"`.
    ///
    /// Entries are trimmed and upper-cased; empty entries are skipped.
    pub fn from_list(action: Action, list: &str, allow_empty_country: bool) -> Result<Self> {
        let countries = list.split(',').map(str::trim).filter(|c| !c.is_empty());
        Self::new(action, countries, allow_empty_country)
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn allow_empty_country(&self) -> bool {
        self.allow_empty_country
    }

    /// Get the number of country codes in this policy.
    pub fn count(&self) -> usize {
        self.countries.len()
    }

    /// Check if a country code is listed (case insensitive).
    pub fn contains(&self, country: &str) -> bool {
        if country.bytes().any(|b| b.is_ascii_lowercase()) {
            self.countries.contains(&country.to_ascii_uppercase())
        } else {
            self.countries.contains(country)
        }
    }

    /// Decide on a lookup result.
    pub fn evaluate(&self, result: &LookupResult) -> Verdict {
        decide(result.country_code(), result.is_empty(), self)
    }
}

/// Map a resolved country to a verdict.
///
/// An empty result is decided by `allow_empty_country` alone, before any
/// set membership check.
pub fn decide(country_code: &str, is_empty: bool, policy: &Policy) -> Verdict {
    if is_empty {
        return if policy.allow_empty_country {
            Verdict::Allow
        } else {
            Verdict::Deny
        };
    }

    let listed = policy.contains(country_code);
    match (policy.action, listed) {
        (Action::Allow, true) | (Action::Block, false) => Verdict::Allow,
        (Action::Allow, false) | (Action::Block, true) => Verdict::Deny,
    }
}

fn normalize_country_code(pattern: &str) -> Result<String> {
    let code = pattern.trim().to_ascii_uppercase();

    // Must be exactly 2 ASCII letters
    if code.len() != 2 || !code.bytes().all(|c| c.is_ascii_alphabetic()) {
        return Err(Error::InvalidCountryCode(pattern.to_string()));
    }

    Ok(code)
}
