//! HTTP surface (spec §6): the SSE stream, the GitOps endpoints, and the
//! session-authentication wrapper described in spec §4.8.
//!
//! Route wiring is deliberately thin — the interesting logic lives in
//! [`crate::sse`], [`crate::gitprovider`], and [`crate::session`]; this
//! module only translates HTTP concerns (cookies, status codes, JSON
//! envelopes) onto those.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::connect_info::Connected;
use axum::extract::{ConnectInfo, Json, State};
use axum::http::{header, HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_extra::extract::cookie::{Cookie, SameSite};
use futures::stream::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio_rustls::server::TlsStream;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::GitProviderKind;
use crate::errors::{ApiError, ok_envelope};
use crate::gitprovider::GitProvider;
use crate::secret::Secret;
use crate::session::{self, PeerCertificate, SessionDecision};
use crate::sse::SseBroker;
use crate::time::SharedClock;

/// Cookie name fixed by spec §6.
const SESSION_COOKIE_NAME: &str = "__Host-session";

/// What the TLS acceptor hands axum's `ConnectInfo` extractor: the peer
/// certificate's fingerprint, if the client presented one. Populated by
/// `axum_server`'s rustls acceptor via the [`Connected`] trait, which is
/// the documented way to surface per-connection TLS state to handlers
/// without threading it through every extractor by hand.
#[derive(Debug, Clone, Default)]
pub struct PeerCertInfo {
    pub fingerprint: Option<String>,
}

impl<T> Connected<&TlsStream<T>> for PeerCertInfo {
    fn connect_info(target: &TlsStream<T>) -> Self {
        let (_, session) = target.get_ref();
        let fingerprint = session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| session::fingerprint_der(cert.as_ref()));
        PeerCertInfo { fingerprint }
    }
}

#[derive(Clone)]
pub struct GitopsRouteState {
    pub provider: Arc<GitProvider>,
    pub provider_kind: GitProviderKind,
    pub repository: String,
}

#[derive(Clone)]
pub struct SessionState {
    pub secret: Secret<String>,
    pub duration_secs: u64,
    pub secure: bool,
    pub clock: SharedClock,
}

#[derive(Clone)]
pub struct AppState {
    pub sse: Arc<SseBroker>,
    pub gitops: Option<GitopsRouteState>,
    pub session: SessionState,
}

pub fn build_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api/events", get(events_handler))
        .route("/api/gitops/status", get(gitops_status_handler))
        .route("/api/gitops/commits", get(gitops_commits_handler))
        .route("/api/gitops/rollback", post(gitops_rollback_handler))
        .layer(middleware::from_fn_with_state(state.clone(), session_auth));

    Router::new()
        .route("/api/logout", post(logout_handler))
        .merge(protected)
        .with_state(state)
}

fn cookie_from_headers<'a>(headers: &'a HeaderMap) -> Option<&'a str> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    raw.split(';').map(str::trim).find_map(|kv| {
        let (name, value) = kv.split_once('=')?;
        (name == SESSION_COOKIE_NAME).then_some(value)
    })
}

fn mint_cookie(session: &SessionState, fingerprint: &str) -> Cookie<'static> {
    let token = session::create_token(
        &session.secret,
        fingerprint,
        session.clock.now(),
        chrono::Duration::seconds(session.duration_secs as i64),
    );
    let mut cookie = Cookie::new(SESSION_COOKIE_NAME, token);
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Strict);
    cookie.set_secure(session.secure);
    cookie.set_path("/");
    cookie.set_max_age(time::Duration::seconds(session.duration_secs as i64));
    cookie.into_owned()
}

fn clear_cookie(session: &SessionState) -> Cookie<'static> {
    let mut cookie = Cookie::new(SESSION_COOKIE_NAME, "");
    cookie.set_http_only(true);
    cookie.set_same_site(SameSite::Strict);
    cookie.set_secure(session.secure);
    cookie.set_path("/");
    cookie.set_max_age(time::Duration::seconds(-1));
    cookie.into_owned()
}

fn unauthorized_no_store(message: &str) -> Response {
    let body = axum::Json(serde_json::json!({ "ok": false, "error": message }));
    let mut response = (StatusCode::UNAUTHORIZED, body).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, header::HeaderValue::from_static("no-store"));
    response
}

/// Implements spec §4.8 steps 2-4. Step 1 (`/api/logout`) is handled by its
/// own handler below, outside this middleware, since logout's contract
/// (require a valid cookie, then clear it) doesn't fit the
/// accept/mint/reject shape the other routes share.
async fn session_auth(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<PeerCertInfo>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let cookie = cookie_from_headers(request.headers()).map(str::to_string);
    let peer_cert = peer.fingerprint.map(|fingerprint| PeerCertificate { fingerprint });
    let now = state.session.clock.now();

    let decision = session::decide(&state.session.secret, cookie.as_deref(), peer_cert.as_ref(), now);

    match decision {
        SessionDecision::Accept { .. } => next.run(request).await,
        SessionDecision::AcceptAndMint { fingerprint } => {
            let mut response = next.run(request).await;
            let cookie = mint_cookie(&state.session, &fingerprint);
            if let Ok(value) = header::HeaderValue::from_str(&cookie.to_string()) {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
            response
        }
        SessionDecision::Reject(_) => unauthorized_no_store("authentication required"),
    }
}

async fn logout_handler(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<PeerCertInfo>,
    headers: HeaderMap,
) -> Response {
    let Some(token) = cookie_from_headers(&headers) else {
        return unauthorized_no_store("no session cookie presented");
    };

    let now = state.session.clock.now();
    let verified = match session::verify_token(&state.session.secret, token, now) {
        Ok(v) => v,
        Err(_) => return unauthorized_no_store("invalid session"),
    };

    if let Some(fingerprint) = peer.fingerprint
        && fingerprint != verified.fingerprint
    {
        return unauthorized_no_store("certificate fingerprint mismatch");
    }

    let mut response = axum::Json(serde_json::json!({ "ok": true })).into_response();
    let cleared = clear_cookie(&state.session);
    if let Ok(value) = header::HeaderValue::from_str(&cleared.to_string()) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

/// Unsubscribes from the broker once the stream (and this guard) is
/// dropped — the client disconnecting is the only signal axum gives us,
/// so cleanup rides on `Drop` rather than an explicit close message.
struct SubscriberGuard {
    sse: Arc<SseBroker>,
    id: u64,
}

impl Drop for SubscriberGuard {
    fn drop(&mut self) {
        let sse = self.sse.clone();
        let id = self.id;
        tokio::spawn(async move { sse.unsubscribe(id).await });
    }
}

async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, std::convert::Infallible>>> {
    let (id, rx) = state.sse.subscribe().await;
    let guard = SubscriberGuard { sse: state.sse.clone(), id };

    let stream = ReceiverStream::new(rx).map(move |frame| {
        let _keep_alive = &guard;
        Ok(frame.into_axum_event())
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GitopsStatusBody {
    configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    repository: Option<String>,
}

async fn gitops_status_handler(State(state): State<AppState>) -> impl IntoResponse {
    match &state.gitops {
        Some(g) => ok_envelope(GitopsStatusBody {
            configured: true,
            provider: Some(match g.provider_kind {
                GitProviderKind::Github => "github",
            }),
            repository: Some(g.repository.clone()),
        }),
        None => ok_envelope(GitopsStatusBody { configured: false, provider: None, repository: None }),
    }
}

#[derive(Debug, Serialize)]
struct CommitsBody {
    commits: Vec<crate::gitprovider::CommitSummary>,
}

async fn gitops_commits_handler(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let Some(gitops) = &state.gitops else {
        return Err(ApiError::not_found("gitops is not configured"));
    };

    let cancel = CancellationToken::new();
    let commits = gitops.provider.list_commits(&cancel).await?;
    Ok(ok_envelope(CommitsBody { commits }))
}

#[derive(Debug, Deserialize)]
struct RollbackRequest {
    sha: Option<String>,
}

async fn gitops_rollback_handler(
    State(state): State<AppState>,
    Json(body): Json<RollbackRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(sha) = body.sha.filter(|s| !s.is_empty()) else {
        return Err(ApiError::bad_request("missing sha"));
    };

    let Some(gitops) = &state.gitops else {
        return Err(ApiError::not_found("gitops is not configured"));
    };

    let cancel = CancellationToken::new();
    let result = gitops.provider.revert_commit(&sha, &cancel).await?;
    Ok(ok_envelope(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GitopsConfig;
    use crate::ratelimit::RateLimiter;
    use crate::sse::K8sConnectivity;
    use crate::store::ServiceStore;
    use crate::time::system_clock;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn session_state() -> SessionState {
        SessionState {
            secret: Secret::new("a-very-long-test-session-secret".to_string()),
            duration_secs: 3600,
            secure: false,
            clock: system_clock(),
        }
    }

    fn app_state() -> AppState {
        let store = ServiceStore::new(system_clock());
        let sse = Arc::new(SseBroker::new(store, K8sConnectivity::new(), None, vec![], 30_000));
        AppState { sse, gitops: None, session: session_state() }
    }

    #[tokio::test]
    async fn gitops_status_reports_unconfigured_when_no_gitops() {
        let body = gitops_status_handler(State(app_state())).await.into_response();
        let bytes = body.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["data"]["configured"], false);
    }

    #[tokio::test]
    async fn gitops_commits_404_when_unconfigured() {
        let result = gitops_commits_handler(State(app_state())).await;
        assert!(matches!(result, Err(ApiError { status: StatusCode::NOT_FOUND, .. })));
    }

    #[tokio::test]
    async fn rollback_rejects_missing_sha() {
        let result = gitops_rollback_handler(
            State(app_state()),
            Json(RollbackRequest { sha: None }),
        )
        .await;
        assert!(matches!(result, Err(ApiError { status: StatusCode::BAD_REQUEST, .. })));
    }

    #[tokio::test]
    async fn logout_without_cookie_is_rejected() {
        let response = logout_handler(
            State(app_state()),
            ConnectInfo(PeerCertInfo::default()),
            HeaderMap::new(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            response.headers().get(header::CACHE_CONTROL).unwrap(),
            "no-store"
        );
    }

    #[tokio::test]
    async fn logout_clears_cookie_for_matching_fingerprint() {
        let state = app_state();
        let now = state.session.clock.now();
        let token = session::create_token(&state.session.secret, "fp1", now, chrono::Duration::hours(1));

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            header::HeaderValue::from_str(&format!("{SESSION_COOKIE_NAME}={token}")).unwrap(),
        );

        let response = logout_handler(
            State(state),
            ConnectInfo(PeerCertInfo { fingerprint: Some("fp1".to_string()) }),
            headers,
        )
        .await;

        assert_eq!(response.status(), StatusCode::OK);
        let set_cookie = response.headers().get(header::SET_COOKIE).unwrap().to_str().unwrap();
        assert!(set_cookie.contains("Max-Age=-1"));
    }

    #[tokio::test]
    async fn logout_rejects_mismatched_fingerprint() {
        let state = app_state();
        let now = state.session.clock.now();
        let token = session::create_token(&state.session.secret, "fp1", now, chrono::Duration::hours(1));

        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            header::HeaderValue::from_str(&format!("{SESSION_COOKIE_NAME}={token}")).unwrap(),
        );

        let response = logout_handler(
            State(state),
            ConnectInfo(PeerCertInfo { fingerprint: Some("fp2".to_string()) }),
            headers,
        )
        .await;

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    fn gitops_state() -> GitopsRouteState {
        let config = GitopsConfig {
            provider: GitProviderKind::Github,
            repository: "acme/infra".to_string(),
            branch: "main".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
        };
        let limiter = Arc::new(RateLimiter::new(10, 10, std::time::Duration::from_secs(1), system_clock()));
        let provider = GitProvider::new(&config, Secret::new("tok".to_string()), limiter).unwrap();
        GitopsRouteState { provider: Arc::new(provider), provider_kind: config.provider, repository: config.repository }
    }

    #[tokio::test]
    async fn gitops_status_reports_configured_repository() {
        let mut state = app_state();
        state.gitops = Some(gitops_state());
        let body = gitops_status_handler(State(state)).await.into_response();
        let bytes = body.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["data"]["configured"], true);
        assert_eq!(json["data"]["repository"], "acme/infra");
    }

    #[tokio::test]
    async fn protected_route_without_cookie_or_cert_is_rejected() {
        let router = build_router(app_state());
        let mut request = Request::builder().uri("/api/gitops/status").body(Body::empty()).unwrap();
        request.extensions_mut().insert(ConnectInfo(PeerCertInfo::default()));

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-store");
    }

    #[tokio::test]
    async fn protected_route_mints_a_cookie_for_a_first_time_cert() {
        let router = build_router(app_state());
        let mut request = Request::builder().uri("/api/gitops/status").body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(PeerCertInfo { fingerprint: Some("fp1".to_string()) }));

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(header::SET_COOKIE).is_some());
    }
}
