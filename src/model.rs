//! The data model shared by the state store, probing pipeline, GitOps
//! watcher, notification engine, and SSE broker. See spec §3.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Raw or composite health state. Ordering matches the display priority
/// from spec §3: `unhealthy < degraded < unknown < healthy`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "camelCase")]
pub enum HealthStatus {
    Unhealthy,
    Degraded,
    Unknown,
    Healthy,
}

impl HealthStatus {
    fn rank(self) -> u8 {
        match self {
            HealthStatus::Unhealthy => 0,
            HealthStatus::Degraded => 1,
            HealthStatus::Unknown => 2,
            HealthStatus::Healthy => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
            HealthStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialOrd for HealthStatus {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HealthStatus {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

/// A pod-level signal folded into `compositeStatus`. Only present when the
/// service maps to a pod and a non-healthy signal applies (spec §3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodDiagnostic {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub restart_count: u32,
}

impl PodDiagnostic {
    /// Matches `commands/watch.rs`'s own threshold for "restarting too much."
    pub fn is_crashing(&self) -> bool {
        self.restart_count > 3
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReconciliationState {
    Synced,
    Progressing,
    Failed,
    Suspended,
}

impl ReconciliationState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReconciliationState::Synced => "synced",
            ReconciliationState::Progressing => "progressing",
            ReconciliationState::Failed => "failed",
            ReconciliationState::Suspended => "suspended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GitOpsSourceType {
    Kustomization,
    Helmrelease,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitOpsStatus {
    pub reconciliation_state: ReconciliationState,
    pub message: String,
    pub source_type: GitOpsSourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ServiceSource {
    Kubernetes,
    Config,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Hash, PartialOrd, Ord)]
pub struct ServiceKey {
    pub namespace: String,
    pub name: String,
}

impl ServiceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Canonical string form `namespace/name` (glossary).
    pub fn canonical(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.canonical())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AuthMethod {
    HealthEndpoint,
    OidcAuth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub namespace: String,
    pub name: String,
    pub display_name: String,
    pub group: String,
    pub url: String,
    pub source: ServiceSource,
    pub status: HealthStatus,
    pub composite_status: HealthStatus,
    pub auth_guarded: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_state_change: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_snippet: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_endpoints: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_endpoints: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_diagnostic: Option<PodDiagnostic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_ops_status: Option<GitOpsStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_method: Option<AuthMethod>,
}

/// Bound on `errorSnippet`: first N bytes of a response body or connection
/// error text (spec §3). Truncation happens at a UTF-8 boundary.
pub const ERROR_SNIPPET_MAX_BYTES: usize = 256;

pub fn bounded_snippet(raw: &str) -> String {
    if raw.len() <= ERROR_SNIPPET_MAX_BYTES {
        return raw.to_string();
    }
    let mut end = ERROR_SNIPPET_MAX_BYTES;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].to_string()
}

impl Service {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.namespace.clone(), self.name.clone())
    }

    pub fn new(key: &ServiceKey, source: ServiceSource) -> Self {
        Self {
            namespace: key.namespace.clone(),
            name: key.name.clone(),
            display_name: key.name.clone(),
            group: String::new(),
            url: String::new(),
            source,
            status: HealthStatus::Unknown,
            composite_status: HealthStatus::Unknown,
            auth_guarded: false,
            http_code: None,
            response_time_ms: None,
            last_checked: None,
            last_state_change: None,
            error_snippet: None,
            ready_endpoints: None,
            total_endpoints: None,
            pod_diagnostic: None,
            git_ops_status: None,
            health_url: None,
            auth_method: None,
        }
    }

    /// Recompute `compositeStatus` from the folding rules (spec §3 invariants).
    /// Returns `true` if the composite changed.
    pub fn refold_composite(&mut self) -> bool {
        let previous = self.composite_status;

        let mut composite = self.status;

        if self.status == HealthStatus::Healthy {
            if let (Some(ready), Some(total)) = (self.ready_endpoints, self.total_endpoints)
                && ready < total
            {
                composite = HealthStatus::Degraded;
            }
        }

        if let Some(diag) = &self.pod_diagnostic
            && diag.is_crashing()
            && composite > HealthStatus::Unhealthy
        {
            composite = HealthStatus::Unhealthy;
        }

        self.composite_status = composite;
        previous != composite
    }
}

/// Tagged union of store-emitted events (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    Discovered(Service),
    Updated(Service),
    Removed { namespace: String, name: String },
}

impl Event {
    pub fn key(&self) -> ServiceKey {
        match self {
            Event::Discovered(s) | Event::Updated(s) => s.key(),
            Event::Removed { namespace, name } => ServiceKey::new(namespace.clone(), name.clone()),
        }
    }
}

/// Cached result of endpoint discovery (spec §3, §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointStrategy {
    HealthEndpoint(String),
    OidcAuth,
}

impl EndpointStrategy {
    pub fn auth_method(&self) -> AuthMethod {
        match self {
            EndpointStrategy::HealthEndpoint(_) => AuthMethod::HealthEndpoint,
            EndpointStrategy::OidcAuth => AuthMethod::OidcAuth,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_status_ordering() {
        assert!(HealthStatus::Unhealthy < HealthStatus::Degraded);
        assert!(HealthStatus::Degraded < HealthStatus::Unknown);
        assert!(HealthStatus::Unknown < HealthStatus::Healthy);
    }

    #[test]
    fn composite_degrades_when_endpoints_not_all_ready() {
        let key = ServiceKey::new("default", "myapp");
        let mut svc = Service::new(&key, ServiceSource::Kubernetes);
        svc.status = HealthStatus::Healthy;
        svc.ready_endpoints = Some(2);
        svc.total_endpoints = Some(3);
        svc.refold_composite();
        assert_eq!(svc.composite_status, HealthStatus::Degraded);
    }

    #[test]
    fn composite_unhealthy_when_pod_crashing() {
        let key = ServiceKey::new("default", "myapp");
        let mut svc = Service::new(&key, ServiceSource::Kubernetes);
        svc.status = HealthStatus::Healthy;
        svc.pod_diagnostic = Some(PodDiagnostic {
            reason: Some("CrashLoopBackOff".to_string()),
            restart_count: 10,
        });
        svc.refold_composite();
        assert_eq!(svc.composite_status, HealthStatus::Unhealthy);
    }

    #[test]
    fn composite_matches_status_otherwise() {
        let key = ServiceKey::new("default", "myapp");
        let mut svc = Service::new(&key, ServiceSource::Kubernetes);
        svc.status = HealthStatus::Degraded;
        svc.refold_composite();
        assert_eq!(svc.composite_status, HealthStatus::Degraded);
    }

    #[test]
    fn refold_reports_change() {
        let key = ServiceKey::new("default", "myapp");
        let mut svc = Service::new(&key, ServiceSource::Kubernetes);
        assert!(!svc.refold_composite()); // unknown -> unknown
        svc.status = HealthStatus::Healthy;
        assert!(svc.refold_composite());
        assert!(!svc.refold_composite()); // healthy -> healthy, no change
    }

    #[test]
    fn snippet_truncates_at_char_boundary() {
        let raw = "x".repeat(ERROR_SNIPPET_MAX_BYTES + 10);
        let snip = bounded_snippet(&raw);
        assert_eq!(snip.len(), ERROR_SNIPPET_MAX_BYTES);
    }

    #[test]
    fn snippet_passthrough_when_short() {
        assert_eq!(bounded_snippet("short"), "short");
    }

    #[test]
    fn service_key_canonical_form() {
        let key = ServiceKey::new("default", "myapp");
        assert_eq!(key.canonical(), "default/myapp");
        assert_eq!(key.to_string(), "default/myapp");
    }
}
