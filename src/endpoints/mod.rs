//! Upstream mirror resolution with failover and stickiness.
//!
//! The external catalog is served by a volatile set of interchangeable
//! mirrors. This module abstracts "one working base URL" away from that
//! set:
//!
//! - [`EndpointResolver`] - fetches the mirror manifest, validates
//!   liveness in parallel, caches the reachable subset (memory + disk),
//!   and executes requests with per-operation sticky failover
//! - [`Endpoint`] - one candidate upstream base URL
//! - [`EndpointError`] - manifest/cache internals (degraded paths are
//!   logged, not propagated)

mod error;
mod manifest;
mod resolver;

pub use error::EndpointError;
pub use manifest::{Manifest, ProviderGroup};
pub use resolver::{EndpointResolver, ResolverConfig};

use serde::{Deserialize, Serialize};
use url::Url;

/// One candidate upstream base URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Short name derived from the hostname; the stickiness key.
    pub name: String,
    /// Base URL, no trailing slash guaranteed.
    pub url: String,
    /// Routing preference; lower is tried first. Assigned by source
    /// ordering over the validated reachable subset.
    pub priority: u32,
    /// Provider group this mirror came from.
    pub group: String,
}

impl Endpoint {
    /// Builds an endpoint, deriving the name from the URL's host
    /// (plus the port when one is spelled out, so mirrors sharing a
    /// host stay distinguishable).
    ///
    /// Falls back to the raw URL string when it does not parse.
    #[must_use]
    pub fn new(url: impl Into<String>, priority: u32, group: impl Into<String>) -> Self {
        let url = url.into();
        let name = Url::parse(&url)
            .ok()
            .and_then(|parsed| {
                parsed.host_str().map(|host| match parsed.port() {
                    Some(port) => format!("{host}:{port}"),
                    None => host.to_string(),
                })
            })
            .unwrap_or_else(|| url.clone());
        Self {
            name,
            url,
            priority,
            group: group.into(),
        }
    }

    /// Joins a request path onto the base URL.
    #[must_use]
    pub fn join(&self, path: &str) -> String {
        format!("{}{}", self.url.trim_end_matches('/'), path)
    }
}
