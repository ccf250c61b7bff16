//! Origin policy guard
//!
//! Decides which callers may talk to the custodian at all. An origin is the
//! `scheme://host[:port]` triple of the caller's execution context. Two lists
//! are consulted:
//!
//! - **defaults**: built in from configuration, never removable at runtime
//! - **user**: added and removed by the key owner, persisted in the vault
//!
//! Every entry is normalized through URL parsing before it is stored or
//! compared. The guard is consulted before any other processing of an
//! inbound frame; frames that fail it are dropped without a reply.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use url::Url;

use crate::error::{CustodyError, Result};

/// Field name of the allowlist-only export document.
pub const ALLOWLIST_FIELD: &str = "allowedOrigins";

/// Normalize an origin string to `scheme://host[:port]`.
///
/// Default ports are elided, scheme and host are lowercased, and any path,
/// query or fragment is discarded. Inputs without a host are rejected.
pub fn canonicalize(input: &str) -> Result<String> {
    let trimmed = input.trim();
    let url = Url::parse(trimmed)
        .map_err(|e| CustodyError::InvalidOrigin(format!("{trimmed}: {e}")))?;

    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| CustodyError::InvalidOrigin(format!("{trimmed}: missing host")))?
        .to_ascii_lowercase();

    let scheme = url.scheme();
    Ok(match url.port() {
        Some(port) => format!("{scheme}://{host}:{port}"),
        None => format!("{scheme}://{host}"),
    })
}

/// Persisted form of the allowlist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowlistSnapshot {
    pub defaults: Vec<String>,
    pub user: Vec<String>,
}

/// Allowlist-only export document: `{"allowedOrigins": [...]}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AllowlistDocument {
    #[serde(rename = "allowedOrigins")]
    allowed_origins: Vec<serde_json::Value>,
}

/// Outcome of merging origins from an external document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllowlistImport {
    pub added: usize,
    pub skipped: usize,
}

/// The two-tier origin allowlist.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    defaults: Vec<String>,
    user: Vec<String>,
}

impl OriginPolicy {
    /// Build a policy from the built-in defaults.
    ///
    /// Defaults come from configuration, so a malformed entry is a
    /// configuration error rather than something to skip.
    pub fn new<I, S>(defaults: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self::default();
        for origin in defaults {
            let canonical = canonicalize(origin.as_ref())
                .map_err(|e| CustodyError::Config(format!("default origin: {e}")))?;
            if !policy.defaults.contains(&canonical) {
                policy.defaults.push(canonical);
            }
        }
        Ok(policy)
    }

    /// Restore user entries, e.g. from the vault. Entries that no longer
    /// parse are dropped.
    pub fn restore_user<I, S>(&mut self, origins: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0;
        for origin in origins {
            match self.add_user_origin(origin.as_ref()) {
                Ok(true) => added += 1,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Dropping stored origin"),
            }
        }
        added
    }

    /// True iff `origin` is in the default set or the user set.
    pub fn is_allowed(&self, origin: &str) -> bool {
        match canonicalize(origin) {
            Ok(canonical) => self.contains(&canonical),
            Err(_) => false,
        }
    }

    fn contains(&self, canonical: &str) -> bool {
        self.defaults.iter().any(|o| o == canonical) || self.user.iter().any(|o| o == canonical)
    }

    /// Add an origin to the user set.
    ///
    /// Returns `Ok(false)` if it is already present in either set.
    /// Malformed input is rejected and leaves the policy untouched.
    pub fn add_user_origin(&mut self, origin: &str) -> Result<bool> {
        let canonical = canonicalize(origin)?;
        if self.contains(&canonical) {
            return Ok(false);
        }
        debug!(origin = %canonical, "Adding user origin");
        self.user.push(canonical);
        Ok(true)
    }

    /// Remove an origin from the user set. Default entries are never
    /// removed; the call returns `false` for them.
    pub fn remove_user_origin(&mut self, origin: &str) -> bool {
        let Ok(canonical) = canonicalize(origin) else {
            return false;
        };
        let before = self.user.len();
        self.user.retain(|o| o != &canonical);
        before != self.user.len()
    }

    pub fn defaults(&self) -> &[String] {
        &self.defaults
    }

    pub fn user(&self) -> &[String] {
        &self.user
    }

    pub fn snapshot(&self) -> AllowlistSnapshot {
        AllowlistSnapshot {
            defaults: self.defaults.clone(),
            user: self.user.clone(),
        }
    }

    /// Export the user set as `{"allowedOrigins": [...]}`.
    pub fn export_json(&self) -> Result<String> {
        let doc = AllowlistDocument {
            allowed_origins: self
                .user
                .iter()
                .cloned()
                .map(serde_json::Value::String)
                .collect(),
        };
        Ok(serde_json::to_string_pretty(&doc)?)
    }

    /// Union the origins of an exported document into the user set.
    ///
    /// A document that is not JSON or lacks the array is an error and
    /// changes nothing. Individual entries that are not valid origins are
    /// skipped and counted.
    pub fn import_json(&mut self, text: &str) -> Result<AllowlistImport> {
        let doc: AllowlistDocument = serde_json::from_str(text)?;

        let mut outcome = AllowlistImport::default();
        for value in doc.allowed_origins {
            let Some(origin) = value.as_str() else {
                outcome.skipped += 1;
                continue;
            };
            match self.add_user_origin(origin) {
                Ok(true) => outcome.added += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "Skipping invalid origin in allowlist import");
                    outcome.skipped += 1;
                }
            }
        }
        Ok(outcome)
    }
}
