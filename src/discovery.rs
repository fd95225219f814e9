//! Endpoint discoverer (spec §4.2): probes a fixed ordered list of health
//! paths for a service's base URL and caches the winning strategy for the
//! process lifetime.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Client;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::DiscoveryError;
use crate::model::{EndpointStrategy, ServiceKey};

/// Paths probed in order; the first 2xx response wins (spec §4.2).
const CANDIDATE_PATHS: &[&str] = &["/healthz", "/health", "/ping", "/api/health"];

/// Builds the probe URL for a base + path: trims trailing slashes from the
/// base, appends the path verbatim. An empty base yields the path alone
/// (spec §4.2, tested concretely in spec §8).
pub fn join_probe_url(base: &str, path: &str) -> String {
    let trimmed = base.trim_end_matches('/');
    format!("{trimmed}{path}")
}

#[derive(Clone)]
pub struct EndpointDiscoverer {
    client: Client,
    cache: Arc<RwLock<HashMap<ServiceKey, EndpointStrategy>>>,
}

impl EndpointDiscoverer {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Read the cached strategy without probing. `None` if not yet resolved.
    pub async fn get_strategy(&self, key: &ServiceKey) -> Option<EndpointStrategy> {
        self.cache.read().await.get(key).cloned()
    }

    /// Drops the cached strategy for a single key, forcing the next
    /// `discover` call to re-probe.
    pub async fn clear_strategy(&self, key: &ServiceKey) {
        self.cache.write().await.remove(key);
    }

    /// Resolves (probing if necessary) the strategy for `key`/`base_url`.
    /// Concurrent callers on distinct keys never contend; concurrent calls
    /// on the *same* key may each redundantly probe (the probes are
    /// idempotent GETs) but converge on the same cached value — spec §4.2
    /// explicitly allows this and leaves de-duplication as an implementer's
    /// option, not a requirement.
    pub async fn discover(
        &self,
        key: &ServiceKey,
        base_url: &str,
        cancel: &CancellationToken,
    ) -> Result<EndpointStrategy, DiscoveryError> {
        if let Some(cached) = self.get_strategy(key).await {
            return Ok(cached);
        }

        for path in CANDIDATE_PATHS {
            if cancel.is_cancelled() {
                return Err(DiscoveryError::Cancelled);
            }

            let url = join_probe_url(base_url, path);
            let attempt = tokio::select! {
                result = self.client.get(&url).send() => result,
                _ = cancel.cancelled() => return Err(DiscoveryError::Cancelled),
            };

            match attempt {
                Ok(resp) if resp.status().is_success() => {
                    let strategy = EndpointStrategy::HealthEndpoint(url.clone());
                    debug!(service = %key, endpoint = %url, "discovered health endpoint");
                    self.cache.write().await.insert(key.clone(), strategy.clone());
                    return Ok(strategy);
                }
                Ok(resp) => {
                    debug!(service = %key, path, status = %resp.status(), "candidate path rejected");
                }
                Err(err) => {
                    debug!(service = %key, path, error = %err, "candidate path unreachable");
                }
            }
        }

        debug!(service = %key, "no health endpoint found, falling back to oidc auth");
        self.cache
            .write()
            .await
            .insert(key.clone(), EndpointStrategy::OidcAuth);
        Ok(EndpointStrategy::OidcAuth)
    }
}
