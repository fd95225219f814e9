//! Health probing pipeline (spec §4.4): resolves a service's endpoint
//! strategy, performs one HTTP probe, and folds in pod diagnostics and
//! endpoint-ready counts before committing the result through the store.

use std::time::{Duration, Instant};

use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;

use crate::discovery::EndpointDiscoverer;
use crate::model::{bounded_snippet, AuthMethod, EndpointStrategy, HealthStatus, ServiceKey, ServiceSource};
use crate::oidc::SharedOidcClient;
use crate::podwatch::PodDiagnosticsIndex;

/// Per-probe HTTP timeout. Short relative to the check interval so a
/// wedged upstream never backs up the scheduler (spec §5).
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ProbeOutcome {
    pub status: HealthStatus,
    pub http_code: Option<u16>,
    pub latency_ms: u64,
    pub snippet: Option<String>,
    pub auth_guarded: bool,
    pub auth_method: Option<AuthMethod>,
    pub health_url: Option<String>,
}

impl ProbeOutcome {
    fn connection_error(message: &str) -> Self {
        ProbeOutcome {
            status: HealthStatus::Unhealthy,
            http_code: None,
            latency_ms: 0,
            snippet: Some(bounded_snippet(message)),
            auth_guarded: false,
            auth_method: None,
            health_url: None,
        }
    }
}

pub struct HealthProber {
    client: Client,
    discoverer: EndpointDiscoverer,
    oidc: Option<SharedOidcClient>,
}

impl HealthProber {
    pub fn new(client: Client, discoverer: EndpointDiscoverer, oidc: Option<SharedOidcClient>) -> Self {
        Self {
            client,
            discoverer,
            oidc,
        }
    }

    /// Performs one probe against `base_url` for `key`, classifying the
    /// result per spec §4.4's status mapping. Never panics: every failure
    /// mode (discovery error, connection error, timeout, missing OIDC
    /// config) degrades to `unhealthy` with a bounded snippet.
    pub async fn probe(
        &self,
        key: &ServiceKey,
        base_url: &str,
        cancel: &CancellationToken,
    ) -> ProbeOutcome {
        let strategy = match self.discoverer.discover(key, base_url, cancel).await {
            Ok(strategy) => strategy,
            Err(err) => return ProbeOutcome::connection_error(&err.to_string()),
        };

        match &strategy {
            EndpointStrategy::HealthEndpoint(endpoint) => {
                let mut outcome = self.probe_url(endpoint, None).await;
                outcome.auth_method = Some(AuthMethod::HealthEndpoint);
                outcome.health_url = Some(endpoint.clone());
                outcome
            }
            EndpointStrategy::OidcAuth => {
                let mut outcome = match &self.oidc {
                    Some(oidc) => match oidc.get_token(cancel).await {
                        Ok(token) => {
                            self.probe_url(base_url, Some(token.expose().clone())).await
                        }
                        Err(err) => ProbeOutcome::connection_error(&err.to_string()),
                    },
                    None => ProbeOutcome::connection_error("oidc auth required but not configured"),
                };
                outcome.auth_guarded = true;
                outcome.auth_method = Some(AuthMethod::OidcAuth);
                outcome
            }
        }
    }

    async fn probe_url(&self, url: &str, bearer: Option<String>) -> ProbeOutcome {
        let start = Instant::now();
        let mut request = self.client.get(url).timeout(PROBE_TIMEOUT);
        if let Some(token) = &bearer {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        match request.send().await {
            Ok(resp) => {
                let latency_ms = start.elapsed().as_millis() as u64;
                let status_code = resp.status();
                if status_code.is_success() {
                    ProbeOutcome {
                        status: HealthStatus::Healthy,
                        http_code: Some(status_code.as_u16()),
                        latency_ms,
                        snippet: None,
                        auth_guarded: false,
                        auth_method: None,
                        health_url: None,
                    }
                } else {
                    let auth_guarded = matches!(
                        status_code,
                        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN
                    );
                    let body = resp.text().await.unwrap_or_default();
                    ProbeOutcome {
                        status: HealthStatus::Unhealthy,
                        http_code: Some(status_code.as_u16()),
                        latency_ms,
                        snippet: Some(bounded_snippet(&body)),
                        auth_guarded,
                        auth_method: None,
                        health_url: None,
                    }
                }
            }
            Err(err) => {
                let mut outcome = ProbeOutcome::connection_error(&err.to_string());
                outcome.latency_ms = start.elapsed().as_millis() as u64;
                outcome
            }
        }
    }
}

/// Folds a raw probe outcome with pod diagnostics and endpoint-ready counts
/// from the cluster informer (spec §4.4, §3 invariants) directly onto the
/// mutable service view passed to `ServiceStore::update`.
pub fn apply_probe(
    service: &mut crate::model::Service,
    outcome: &ProbeOutcome,
    pods: &PodDiagnosticsIndex,
    key: &ServiceKey,
    now: chrono::DateTime<chrono::Utc>,
) {
    service.status = outcome.status;
    service.http_code = outcome.http_code;
    service.response_time_ms = Some(outcome.latency_ms);
    service.last_checked = Some(now);
    service.error_snippet = outcome.snippet.clone();
    service.auth_guarded = outcome.auth_guarded;
    if outcome.auth_method.is_some() {
        service.auth_method = outcome.auth_method;
    }
    if outcome.health_url.is_some() {
        service.health_url = outcome.health_url.clone();
    }

    // Config-sourced services never carry pod diagnostics (spec §3) even if
    // they share a (namespace, name) with a Kubernetes workload.
    if service.source == ServiceSource::Kubernetes
        && let Some(diag) = pods.diagnostics_for(key)
    {
        service.ready_endpoints = Some(diag.ready);
        service.total_endpoints = Some(diag.total);
        service.pod_diagnostic = diag.pod_diagnostic;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::get;
    use axum::Router;

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn probe_maps_2xx_to_healthy() {
        let router = Router::new().route("/healthz", get(|| async { "ok" }));
        let base = spawn_server(router).await;
        let prober = HealthProber::new(Client::new(), EndpointDiscoverer::new(Client::new()), None);
        let key = ServiceKey::new("default", "myapp");
        let outcome = prober.probe(&key, &base, &CancellationToken::new()).await;
        assert_eq!(outcome.status, HealthStatus::Healthy);
        assert_eq!(outcome.auth_method, Some(AuthMethod::HealthEndpoint));
    }

    #[tokio::test]
    async fn probe_maps_401_to_unhealthy_and_auth_guarded() {
        let router = Router::new().route(
            "/healthz",
            get(|| async { axum::http::StatusCode::UNAUTHORIZED }),
        );
        let base = spawn_server(router).await;
        let prober = HealthProber::new(Client::new(), EndpointDiscoverer::new(Client::new()), None);
        let key = ServiceKey::new("default", "myapp");
        let outcome = prober.probe(&key, &base, &CancellationToken::new()).await;
        assert_eq!(outcome.status, HealthStatus::Unhealthy);
        assert!(outcome.auth_guarded);
    }

    #[tokio::test]
    async fn probe_falls_back_to_oidc_and_fails_without_client() {
        let router = Router::new();
        let base = spawn_server(router).await;
        let prober = HealthProber::new(Client::new(), EndpointDiscoverer::new(Client::new()), None);
        let key = ServiceKey::new("default", "myapp");
        let outcome = prober.probe(&key, &base, &CancellationToken::new()).await;
        assert_eq!(outcome.status, HealthStatus::Unhealthy);
        assert!(outcome.auth_guarded);
        assert_eq!(outcome.auth_method, Some(AuthMethod::OidcAuth));
    }

    #[tokio::test]
    async fn probe_reports_connection_error_for_unreachable_host() {
        let prober = HealthProber::new(Client::new(), EndpointDiscoverer::new(Client::new()), None);
        let key = ServiceKey::new("default", "myapp");
        let outcome = prober
            .probe(&key, "http://127.0.0.1:1", &CancellationToken::new())
            .await;
        assert_eq!(outcome.status, HealthStatus::Unhealthy);
        assert!(outcome.snippet.is_some());
    }

    fn fresh_service(key: &ServiceKey, source: ServiceSource) -> crate::model::Service {
        crate::model::Service::new(key, source)
    }

    #[tokio::test]
    async fn apply_probe_clears_auth_guarded_once_the_401_stops_recurring() {
        let key = ServiceKey::new("default", "myapp");
        let pods = PodDiagnosticsIndex::new();
        let mut service = fresh_service(&key, ServiceSource::Kubernetes);

        let guarded_outcome = ProbeOutcome {
            status: HealthStatus::Unhealthy,
            http_code: Some(401),
            latency_ms: 5,
            snippet: None,
            auth_guarded: true,
            auth_method: Some(AuthMethod::HealthEndpoint),
            health_url: None,
        };
        apply_probe(&mut service, &guarded_outcome, &pods, &key, chrono::Utc::now());
        assert!(service.auth_guarded);

        let healthy_outcome = ProbeOutcome {
            status: HealthStatus::Healthy,
            http_code: Some(200),
            latency_ms: 5,
            snippet: None,
            auth_guarded: false,
            auth_method: Some(AuthMethod::HealthEndpoint),
            health_url: None,
        };
        apply_probe(&mut service, &healthy_outcome, &pods, &key, chrono::Utc::now());
        assert!(!service.auth_guarded);
    }

    #[tokio::test]
    async fn apply_probe_never_sets_pod_diagnostic_for_config_sourced_services() {
        let key = ServiceKey::new("default", "myapp");
        let pods = PodDiagnosticsIndex::new();
        pods.seed_for_test(key.clone(), 1, 2, 10).await;

        let mut service = fresh_service(&key, ServiceSource::Config);
        let outcome = ProbeOutcome {
            status: HealthStatus::Healthy,
            http_code: Some(200),
            latency_ms: 5,
            snippet: None,
            auth_guarded: false,
            auth_method: Some(AuthMethod::HealthEndpoint),
            health_url: None,
        };
        apply_probe(&mut service, &outcome, &pods, &key, chrono::Utc::now());

        assert!(service.pod_diagnostic.is_none());
        assert!(service.ready_endpoints.is_none());
        assert!(service.total_endpoints.is_none());
    }

    #[tokio::test]
    async fn apply_probe_folds_pod_diagnostic_for_kubernetes_sourced_services() {
        let key = ServiceKey::new("default", "myapp");
        let pods = PodDiagnosticsIndex::new();
        pods.seed_for_test(key.clone(), 1, 2, 10).await;

        let mut service = fresh_service(&key, ServiceSource::Kubernetes);
        let outcome = ProbeOutcome {
            status: HealthStatus::Healthy,
            http_code: Some(200),
            latency_ms: 5,
            snippet: None,
            auth_guarded: false,
            auth_method: Some(AuthMethod::HealthEndpoint),
            health_url: None,
        };
        apply_probe(&mut service, &outcome, &pods, &key, chrono::Utc::now());

        assert_eq!(service.ready_endpoints, Some(1));
        assert_eq!(service.total_endpoints, Some(2));
        assert!(service.pod_diagnostic.is_some());
    }
}
