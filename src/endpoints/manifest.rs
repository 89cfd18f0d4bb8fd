//! Mirror manifest parsing, parallel liveness validation, and the
//! on-disk endpoint cache.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::future::join_all;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Endpoint, EndpointError};

/// Remote mirror manifest: provider groups in priority order, each
/// listing candidate base URLs.
#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    /// Provider groups; source ordering defines base priority.
    pub providers: Vec<ProviderGroup>,
}

/// One provider's set of mirrors.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderGroup {
    /// Provider name.
    pub name: String,
    /// Candidate base URLs, in the provider's preference order.
    pub mirrors: Vec<String>,
}

impl Manifest {
    /// Flattens the manifest into `(group, url)` candidates, preserving
    /// source order across groups.
    #[must_use]
    pub fn candidates(&self) -> Vec<(String, String)> {
        self.providers
            .iter()
            .flat_map(|group| {
                group
                    .mirrors
                    .iter()
                    .map(|url| (group.name.clone(), url.clone()))
            })
            .collect()
    }
}

/// Probes every candidate in parallel and keeps the reachable subset,
/// assigning ascending priority by source order.
///
/// A candidate is reachable when a HEAD request (falling back to GET
/// when HEAD fails at the transport level) returns any status below
/// 500. Timeouts and connection errors mark it unreachable.
pub(crate) async fn validate_candidates(
    client: &Client,
    candidates: Vec<(String, String)>,
) -> Vec<Endpoint> {
    let probes = candidates.into_iter().map(|(group, url)| async move {
        let reachable = probe(client, &url).await;
        (group, url, reachable)
    });

    let mut priority = 0;
    let mut validated = Vec::new();
    for (group, url, reachable) in join_all(probes).await {
        if reachable {
            validated.push(Endpoint::new(url, priority, group));
            priority += 1;
        } else {
            debug!(url, "mirror unreachable, dropped from routing set");
        }
    }
    validated
}

/// Single-candidate liveness probe.
async fn probe(client: &Client, url: &str) -> bool {
    match client.head(url).send().await {
        Ok(response) => response.status().as_u16() < 500,
        Err(head_error) => {
            debug!(url, error = %head_error, "HEAD probe failed, retrying with GET");
            match client.get(url).send().await {
                Ok(response) => response.status().as_u16() < 500,
                Err(get_error) => {
                    debug!(url, error = %get_error, "GET probe failed");
                    false
                }
            }
        }
    }
}

/// On-disk snapshot of the last validated endpoint set.
#[derive(Debug, Serialize, Deserialize)]
struct DiskCache {
    /// Unix seconds when the set was validated.
    fetched_at: u64,
    /// The validated, reachable endpoints.
    endpoints: Vec<Endpoint>,
}

/// Persists the validated endpoint set to the on-disk cache.
///
/// # Errors
///
/// Returns [`EndpointError::Cache`] on I/O failure or
/// [`EndpointError::Format`] if serialization fails.
pub(crate) async fn store_disk_cache(
    path: &Path,
    endpoints: &[Endpoint],
) -> Result<(), EndpointError> {
    let fetched_at = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    let cache = DiskCache {
        fetched_at,
        endpoints: endpoints.to_vec(),
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let payload = serde_json::to_vec_pretty(&cache)?;
    tokio::fs::write(path, payload).await?;
    debug!(path = %path.display(), count = endpoints.len(), "endpoint cache written");
    Ok(())
}

/// Loads the on-disk cache when it is younger than `ttl`.
///
/// Returns `None` for a missing or expired cache; parse failures are
/// surfaced so the caller can log them.
///
/// # Errors
///
/// Returns [`EndpointError::Cache`] on I/O failure (other than the file
/// being absent) or [`EndpointError::Format`] on a malformed payload.
pub(crate) async fn load_disk_cache(
    path: &Path,
    ttl: Duration,
) -> Result<Option<Vec<Endpoint>>, EndpointError> {
    let raw = match tokio::fs::read(path).await {
        Ok(raw) => raw,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(error.into()),
    };
    let cache: DiskCache = serde_json::from_slice(&raw)?;

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    let age = now.saturating_sub(cache.fetched_at);
    if age > ttl.as_secs() {
        warn!(path = %path.display(), age_secs = age, "endpoint cache expired");
        return Ok(None);
    }

    Ok(Some(cache.endpoints))
}
