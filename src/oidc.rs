//! OIDC client-credentials client (spec §4.3): lazy discovery, cached
//! tokens with proactive refresh, and single-flight concurrent fetches so
//! N callers racing a cold cache produce exactly one HTTP token request.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::OidcConfig;
use crate::errors::OidcError;
use crate::secret::Secret;
use crate::time::SharedClock;

/// Proactive refresh threshold (spec §4.3): a token with less than this
/// much life left is treated as due for refresh.
const REFRESH_THRESHOLD_SECS: i64 = 30;

#[derive(Debug, Clone)]
pub struct CachedToken {
    pub access_token: Secret<String>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OidcState {
    Valid,
    Error,
}

/// Status exposed on the SSE `state` event's `oidcStatus` field (spec §6).
/// Never carries the token itself.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcStatus {
    pub state: OidcState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct DiscoveryDocument {
    token_endpoint: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    expires_in: i64,
}

type FetchResult = Result<CachedToken, OidcError>;

pub struct OidcClient {
    http: Client,
    issuer_url: String,
    client_id: String,
    client_secret: Secret<String>,
    scopes: Vec<String>,
    token_endpoint: RwLock<Option<String>>,
    cached: Mutex<Option<CachedToken>>,
    inflight: Mutex<Option<broadcast::Sender<FetchResult>>>,
    status: Mutex<OidcStatus>,
    clock: SharedClock,
}

impl OidcClient {
    pub fn new(http: Client, config: &OidcConfig, clock: SharedClock) -> Self {
        Self {
            http,
            issuer_url: config.issuer_url.clone(),
            client_id: config.client_id.clone(),
            client_secret: config
                .client_secret
                .clone()
                .unwrap_or_else(|| Secret::new(String::new())),
            scopes: config.scopes.clone(),
            token_endpoint: RwLock::new(None),
            cached: Mutex::new(None),
            inflight: Mutex::new(None),
            status: Mutex::new(OidcStatus {
                state: OidcState::Error,
                last_success: None,
            }),
            clock,
        }
    }

    pub async fn status(&self) -> OidcStatus {
        self.status.lock().await.clone()
    }

    /// Returns a bearer token, refreshing if the cache is cold or within the
    /// proactive-refresh threshold. Concurrent callers during a refresh
    /// share one underlying fetch (spec §4.3, §8 "single-flight token
    /// fetch"); a caller whose `cancel` fires while waiting returns its own
    /// cancellation error without disturbing the leader's fetch.
    pub async fn get_token(&self, cancel: &CancellationToken) -> Result<Secret<String>, OidcError> {
        if let Some(tok) = self.fresh_cached().await {
            return Ok(tok.access_token);
        }

        let mut inflight_guard = self.inflight.lock().await;
        if let Some(tx) = inflight_guard.as_ref() {
            let mut rx = tx.subscribe();
            drop(inflight_guard);
            return tokio::select! {
                result = rx.recv() => match result {
                    Ok(Ok(tok)) => Ok(tok.access_token),
                    Ok(Err(e)) => Err(e),
                    Err(_) => Err(OidcError::Cancelled),
                },
                _ = cancel.cancelled() => Err(OidcError::Cancelled),
            };
        }

        let (tx, _rx) = broadcast::channel(1);
        *inflight_guard = Some(tx.clone());
        drop(inflight_guard);

        let result = self.fetch_token(cancel).await;

        *self.inflight.lock().await = None;

        match &result {
            Ok(tok) => {
                *self.cached.lock().await = Some(tok.clone());
                *self.status.lock().await = OidcStatus {
                    state: OidcState::Valid,
                    last_success: Some(self.clock.now()),
                };
            }
            Err(_) => {
                let mut status = self.status.lock().await;
                status.state = OidcState::Error;
            }
        }

        // Lossy by design: a broadcast channel with no current waiters is a
        // no-op send, which is fine — this call's own `result` is returned
        // directly below regardless.
        let _ = tx.send(result.clone());

        result.map(|tok| tok.access_token)
    }

    async fn fresh_cached(&self) -> Option<CachedToken> {
        let guard = self.cached.lock().await;
        let tok = guard.as_ref()?;
        if tok.expires_at - self.clock.now() > chrono::Duration::seconds(REFRESH_THRESHOLD_SECS) {
            Some(tok.clone())
        } else {
            None
        }
    }

    async fn discover_token_endpoint(&self, cancel: &CancellationToken) -> Result<String, OidcError> {
        if let Some(endpoint) = self.token_endpoint.read().await.clone() {
            return Ok(endpoint);
        }

        let url = format!(
            "{}/.well-known/openid-configuration",
            self.issuer_url.trim_end_matches('/')
        );

        let resp = tokio::select! {
            r = self.http.get(&url).send() => r.map_err(|e| OidcError::Discovery(e.to_string()))?,
            _ = cancel.cancelled() => return Err(OidcError::Cancelled),
        };

        if !resp.status().is_success() {
            return Err(OidcError::Discovery(format!("status {}", resp.status())));
        }

        let doc: DiscoveryDocument = resp
            .json()
            .await
            .map_err(|e| OidcError::Discovery(e.to_string()))?;

        // Only cache on success — a discovery failure is never cached so
        // the next `get_token` retries discovery from scratch (spec §4.3).
        *self.token_endpoint.write().await = Some(doc.token_endpoint.clone());
        Ok(doc.token_endpoint)
    }

    async fn fetch_token(&self, cancel: &CancellationToken) -> FetchResult {
        let endpoint = self.discover_token_endpoint(cancel).await?;

        let mut form: Vec<(&str, String)> = vec![
            ("grant_type", "client_credentials".to_string()),
            ("client_id", self.client_id.clone()),
            ("client_secret", self.client_secret.expose().clone()),
        ];
        if !self.scopes.is_empty() {
            form.push(("scope", self.scopes.join(" ")));
        }

        let resp = tokio::select! {
            r = self.http.post(&endpoint).form(&form).send() => {
                r.map_err(|e| OidcError::TokenRequest(e.to_string()))?
            }
            _ = cancel.cancelled() => return Err(OidcError::Cancelled),
        };

        if !resp.status().is_success() {
            return Err(OidcError::TokenRequest(format!("status {}", resp.status())));
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| OidcError::MalformedResponse(e.to_string()))?;

        if body.access_token.is_empty() || body.expires_in <= 0 {
            return Err(OidcError::MalformedResponse(
                "missing access_token or non-positive expires_in".to_string(),
            ));
        }

        Ok(CachedToken {
            access_token: Secret::new(body.access_token),
            expires_at: self.clock.now() + chrono::Duration::seconds(body.expires_in),
        })
    }
}

pub type SharedOidcClient = Arc<OidcClient>;
