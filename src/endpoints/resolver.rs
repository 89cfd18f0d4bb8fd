//! Endpoint resolver: TTL-cached mirror list with sticky failover.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use reqwest::Client;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use super::manifest::{self, Manifest};
use super::{Endpoint, EndpointError};

/// How long a validated endpoint set stays fresh in memory and on disk.
const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(15 * 60);

/// Per-request timeout during resolve-and-call.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-probe timeout during liveness validation.
const DEFAULT_VALIDATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a 429 before moving to the next endpoint.
const DEFAULT_RATE_LIMIT_BACKOFF: Duration = Duration::from_secs(2);

/// Resolver configuration, fixed at construction.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Where the mirror manifest is fetched from.
    pub manifest_url: String,
    /// On-disk cache location for the validated endpoint set.
    pub cache_path: PathBuf,
    /// Endpoint set freshness window.
    pub cache_ttl: Duration,
    /// Timeout for catalog requests.
    pub request_timeout: Duration,
    /// Timeout for liveness probes.
    pub validation_timeout: Duration,
    /// Pause after an upstream 429.
    pub rate_limit_backoff: Duration,
}

impl ResolverConfig {
    /// Creates a config with default timings.
    #[must_use]
    pub fn new(manifest_url: impl Into<String>, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            manifest_url: manifest_url.into(),
            cache_path: cache_path.into(),
            cache_ttl: DEFAULT_CACHE_TTL,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            validation_timeout: DEFAULT_VALIDATION_TIMEOUT,
            rate_limit_backoff: DEFAULT_RATE_LIMIT_BACKOFF,
        }
    }
}

/// In-memory endpoint cache state.
#[derive(Debug, Default)]
struct CacheState {
    /// Last validated reachable set; routing never leaves it.
    endpoints: Vec<Endpoint>,
    /// When the set was validated; `None` forces a refresh attempt.
    fetched_at: Option<Instant>,
}

/// Per-operation memory of the last endpoint that satisfied a request.
#[derive(Debug, Clone)]
struct SuccessRecord {
    endpoint: String,
    at: Instant,
}

/// Resolves catalog requests across a volatile set of upstream mirrors.
///
/// Process-wide single instance: constructed once at startup and shared
/// as an `Arc` by all consumers. All state (endpoint cache, success
/// history) is owned by the instance - there is no ambient global.
#[derive(Debug)]
pub struct EndpointResolver {
    client: Client,
    probe_client: Client,
    config: ResolverConfig,
    cache: RwLock<CacheState>,
    history: DashMap<String, SuccessRecord>,
}

impl EndpointResolver {
    /// Creates a resolver.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError::Http`] if HTTP client construction fails.
    #[instrument(skip(config), fields(manifest_url = %config.manifest_url))]
    pub fn new(config: ResolverConfig) -> Result<Self, EndpointError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .gzip(true)
            .build()?;
        let probe_client = Client::builder()
            .timeout(config.validation_timeout)
            .build()?;

        Ok(Self {
            client,
            probe_client,
            config,
            cache: RwLock::new(CacheState::default()),
            history: DashMap::new(),
        })
    }

    /// Returns the current routable endpoint set.
    ///
    /// Fresh cache is returned as-is; otherwise the manifest is
    /// re-fetched and re-validated. Fetch failure degrades to the
    /// on-disk cache when fresh, then to whatever was last known
    /// (possibly empty). This method never fails - degraded paths are
    /// logged.
    #[instrument(skip(self))]
    pub async fn endpoints(&self) -> Vec<Endpoint> {
        {
            let cache = self.cache.read().await;
            if let Some(fetched_at) = cache.fetched_at {
                if fetched_at.elapsed() < self.config.cache_ttl {
                    return cache.endpoints.clone();
                }
            }
        }

        match self.refresh().await {
            Ok(endpoints) => endpoints,
            Err(error) => {
                warn!(error = %error, "manifest refresh failed, falling back to cache");
                self.fallback_endpoints().await
            }
        }
    }

    /// Fetches, validates, and caches a fresh endpoint set.
    ///
    /// # Errors
    ///
    /// Returns [`EndpointError`] when the manifest cannot be fetched or
    /// parsed. Validation itself cannot fail - unreachable mirrors are
    /// simply dropped.
    #[instrument(skip(self))]
    pub async fn refresh(&self) -> Result<Vec<Endpoint>, EndpointError> {
        let response = self.client.get(&self.config.manifest_url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EndpointError::ManifestStatus {
                status: status.as_u16(),
            });
        }
        let manifest: Manifest = response.json().await?;

        let validated =
            manifest::validate_candidates(&self.probe_client, manifest.candidates()).await;
        debug!(reachable = validated.len(), "endpoint set validated");

        if let Err(error) = manifest::store_disk_cache(&self.config.cache_path, &validated).await {
            warn!(error = %error, "failed to persist endpoint cache");
        }

        let mut cache = self.cache.write().await;
        cache.endpoints = validated.clone();
        cache.fetched_at = Some(Instant::now());
        Ok(validated)
    }

    /// Degraded acquisition: fresh on-disk cache, else last known set.
    async fn fallback_endpoints(&self) -> Vec<Endpoint> {
        match manifest::load_disk_cache(&self.config.cache_path, self.config.cache_ttl).await {
            Ok(Some(endpoints)) => {
                debug!(count = endpoints.len(), "using on-disk endpoint cache");
                let mut cache = self.cache.write().await;
                // Last-known only: fetched_at stays unset so the next
                // call retries the manifest.
                cache.endpoints = endpoints.clone();
                endpoints
            }
            Ok(None) => self.cache.read().await.endpoints.clone(),
            Err(error) => {
                warn!(error = %error, "on-disk endpoint cache unusable");
                self.cache.read().await.endpoints.clone()
            }
        }
    }

    /// Executes a catalog request with failover across the routable set.
    ///
    /// Candidates are tried in priority order, except that the endpoint
    /// remembered as last-successful for `operation` (or, lacking one,
    /// the globally most recent success) goes first. Per candidate:
    ///
    /// - network error / timeout: next endpoint
    /// - HTTP 429: fixed pause, then next endpoint
    /// - other non-success statuses: next endpoint
    /// - HTTP 200 with an empty-for-this-operation payload: soft
    ///   failure, next endpoint
    /// - HTTP 200 with a non-empty parseable payload: success is
    ///   recorded for stickiness and the payload returned
    ///
    /// Exhausting every candidate yields `None` - "no data", not an
    /// error; the caller decides how to surface it.
    #[instrument(skip(self, params), fields(path, operation))]
    pub async fn resolve_and_call(
        &self,
        path: &str,
        params: &[(&str, String)],
        operation: &str,
    ) -> Option<Value> {
        let endpoints = self.endpoints().await;
        if endpoints.is_empty() {
            warn!(operation, "no routable endpoints");
            return None;
        }

        for endpoint in self.sticky_order(endpoints, operation) {
            let url = endpoint.join(path);
            let response = match self.client.get(&url).query(params).send().await {
                Ok(response) => response,
                Err(error) => {
                    warn!(endpoint = %endpoint.name, error = %error, "endpoint request failed");
                    continue;
                }
            };

            let status = response.status();
            if status.as_u16() == 429 {
                warn!(endpoint = %endpoint.name, "endpoint rate limited, pausing");
                tokio::time::sleep(self.config.rate_limit_backoff).await;
                continue;
            }
            if !status.is_success() {
                debug!(endpoint = %endpoint.name, status = status.as_u16(), "endpoint returned error status");
                continue;
            }

            let payload: Value = match response.json().await {
                Ok(payload) => payload,
                Err(error) => {
                    warn!(endpoint = %endpoint.name, error = %error, "endpoint returned malformed payload");
                    continue;
                }
            };

            if is_empty_payload(operation, &payload) {
                debug!(endpoint = %endpoint.name, operation, "endpoint returned empty payload, trying next");
                continue;
            }

            self.record_success(operation, &endpoint.name);
            return Some(payload);
        }

        debug!(operation, "all endpoints exhausted without data");
        None
    }

    /// Orders candidates by priority, hoisting the sticky endpoint to
    /// the front. A remembered endpoint absent from the current
    /// reachable set is ignored.
    fn sticky_order(&self, mut endpoints: Vec<Endpoint>, operation: &str) -> Vec<Endpoint> {
        endpoints.sort_by_key(|endpoint| endpoint.priority);

        let sticky = self
            .history
            .get(operation)
            .map(|record| record.endpoint.clone())
            .or_else(|| self.latest_success());

        if let Some(name) = sticky {
            if let Some(position) = endpoints.iter().position(|endpoint| endpoint.name == name) {
                let preferred = endpoints.remove(position);
                endpoints.insert(0, preferred);
            }
        }
        endpoints
    }

    /// The endpoint name of the most recent success across any operation.
    fn latest_success(&self) -> Option<String> {
        self.history
            .iter()
            .max_by_key(|entry| entry.value().at)
            .map(|entry| entry.value().endpoint.clone())
    }

    /// Records a successful call for stickiness.
    fn record_success(&self, operation: &str, endpoint: &str) {
        self.history.insert(
            operation.to_string(),
            SuccessRecord {
                endpoint: endpoint.to_string(),
                at: Instant::now(),
            },
        );
    }

    /// The endpoint remembered as last-successful for an operation.
    /// Exposed for status surfaces and tests.
    #[must_use]
    pub fn last_success_for(&self, operation: &str) -> Option<String> {
        self.history
            .get(operation)
            .map(|record| record.endpoint.clone())
    }
}

/// Heuristic for "reachable endpoint, but no data for this operation".
///
/// Upstream mirrors sometimes return well-formed but empty payloads;
/// those must trigger failover rather than being mistaken for a genuine
/// catalog answer until every endpoint has been tried.
fn is_empty_payload(operation: &str, payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Array(entries) => entries.is_empty(),
        Value::Object(map) => {
            if map.is_empty() {
                return true;
            }
            if operation.starts_with("search") || operation.ends_with("list") {
                for key in ["items", "results", "data", "tracks"] {
                    if let Some(Value::Array(entries)) = map.get(key) {
                        return entries.is_empty();
                    }
                }
            }
            false
        }
        _ => false,
    }
}
