//! Error types for endpoint resolution internals.

use thiserror::Error;

/// Errors from manifest acquisition and the on-disk endpoint cache.
///
/// These stay internal to the resolver: callers of
/// [`resolve_and_call`](super::EndpointResolver::resolve_and_call) see a
/// "no data" value instead, and list acquisition degrades to the last
/// known endpoint set.
#[derive(Debug, Error)]
pub enum EndpointError {
    /// HTTP transport failure while fetching the manifest.
    #[error("manifest request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The manifest fetch returned a non-success status.
    #[error("manifest fetch returned HTTP {status}")]
    ManifestStatus {
        /// The status code returned by the manifest host.
        status: u16,
    },

    /// The manifest or cache payload did not parse.
    #[error("malformed endpoint data: {0}")]
    Format(#[from] serde_json::Error),

    /// Reading or writing the on-disk cache failed.
    #[error("endpoint cache I/O failed: {0}")]
    Cache(#[from] std::io::Error),
}
