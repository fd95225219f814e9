//! Process configuration: loaded from YAML, overridable by environment for
//! secrets. Mirrors the enumerated surface in spec §6.

use crate::errors::ConfigError;
use crate::secret::Secret;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_check_interval_ms() -> u64 {
    30_000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcConfig {
    #[serde(rename = "issuerURL")]
    pub issuer_url: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<Secret<String>>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRule {
    pub services: Vec<String>,
    pub transitions: Vec<String>,
    pub channels: Vec<String>,
    #[serde(default)]
    pub suppression_interval: Option<String>,
    #[serde(default)]
    pub escalate_after: Option<String>,
    #[serde(default)]
    pub escalation_channels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterType {
    Webhook,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    #[serde(rename = "type")]
    pub kind: AdapterType,
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationsConfig {
    #[serde(default)]
    pub rules: Vec<NotificationRule>,
    #[serde(default)]
    pub adapters: Vec<AdapterConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GitProviderKind {
    Github,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitopsConfig {
    pub provider: GitProviderKind,
    pub repository: String,
    pub branch: String,
    pub token_env: String,
}

/// A service declared directly in the config file rather than discovered
/// from the cluster (spec §2 "a service source (cluster informer and/or
/// static config)"; `source=config` in the data model, spec §3). The
/// in-cluster discovery side of "service source" is a Kubernetes informer
/// over Services/Ingresses, which spec.md §1 places outside the covered
/// core alongside the rest of the route/config-loader wiring — this static
/// list is the one source of truth this crate actually populates services
/// from at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaticServiceConfig {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub group: String,
    pub url: String,
}

fn default_flux_namespace() -> String {
    "flux-system".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FluxConfig {
    #[serde(default = "default_flux_namespace")]
    pub namespace: String,
}

impl Default for FluxConfig {
    fn default() -> Self {
        Self {
            namespace: default_flux_namespace(),
        }
    }
}

fn default_session_duration_secs() -> u64 {
    8 * 3600
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default)]
    pub secret: Option<Secret<String>>,
    #[serde(default = "default_session_duration_secs")]
    pub duration_secs: u64,
    #[serde(default)]
    pub secure: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: None,
            duration_secs: default_session_duration_secs(),
            secure: true,
        }
    }
}

impl SessionConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }
}

/// Whether a GitOps status discovered for `(namespace, name)` should also be
/// attributed to same-named services in other namespaces. Surprising
/// heuristic kept from the source system at the spec's explicit direction;
/// defaults to on for behavioral parity, off disables it entirely.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub oidc: Option<OidcConfig>,
    #[serde(default)]
    pub notifications: NotificationsConfig,
    #[serde(default)]
    pub gitops: Option<GitopsConfig>,
    #[serde(default)]
    pub flux: FluxConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default = "default_true")]
    pub gitops_cross_namespace_propagation: bool,
    #[serde(default)]
    pub services: Vec<StaticServiceConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            health: HealthConfig::default(),
            oidc: None,
            notifications: NotificationsConfig::default(),
            gitops: None,
            flux: FluxConfig::default(),
            session: SessionConfig::default(),
            gitops_cross_namespace_propagation: true,
            services: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Config =
            serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
                path: path.display().to_string(),
                source,
            })?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Pull secrets from the environment rather than the YAML file. `tokenEnv`
    /// names the variable holding the git provider token; the OIDC client
    /// secret and session HMAC secret have fixed variable names so they never
    /// need to sit in plaintext config.
    fn apply_env_overrides(&mut self) {
        if let Some(oidc) = &mut self.oidc
            && oidc.client_secret.is_none()
            && let Ok(v) = std::env::var("SENTINEL_OIDC_CLIENT_SECRET")
        {
            oidc.client_secret = Some(Secret::new(v));
        }
        if self.session.secret.is_none()
            && let Ok(v) = std::env::var("SENTINEL_SESSION_SECRET")
        {
            self.session.secret = Some(Secret::new(v));
        }
    }

    pub fn git_provider_token(&self) -> Option<Secret<String>> {
        let gitops = self.gitops.as_ref()?;
        std::env::var(&gitops.token_env).ok().map(Secret::new)
    }

    /// Startup validation. Never fatal: problems are collected and surfaced
    /// on the SSE `state` event's `configErrors` field (spec §7) because a
    /// missing OIDC or GitOps field only matters if a service actually needs
    /// that subsystem.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if self.health.check_interval_ms == 0 {
            errors.push(ConfigError::Invalid {
                field: "health.checkIntervalMs".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        if let Some(oidc) = &self.oidc {
            if oidc.issuer_url.is_empty() {
                errors.push(ConfigError::Invalid {
                    field: "oidc.issuerURL".to_string(),
                    reason: "must not be empty".to_string(),
                });
            }
            if oidc.client_secret.is_none() {
                errors.push(ConfigError::Invalid {
                    field: "oidc.clientSecret".to_string(),
                    reason: "not set in config or SENTINEL_OIDC_CLIENT_SECRET".to_string(),
                });
            }
        }

        if let Some(gitops) = &self.gitops {
            if !gitops.repository.contains('/') {
                errors.push(ConfigError::Invalid {
                    field: "gitops.repository".to_string(),
                    reason: "expected \"owner/repo\"".to_string(),
                });
            }
            if std::env::var(&gitops.token_env).is_err() {
                errors.push(ConfigError::Invalid {
                    field: "gitops.tokenEnv".to_string(),
                    reason: format!("environment variable {} not set", gitops.token_env),
                });
            }
        }

        if self.session.secret.is_none() {
            errors.push(ConfigError::Invalid {
                field: "session.secret".to_string(),
                reason: "not set in config or SENTINEL_SESSION_SECRET".to_string(),
            });
        }

        errors
    }
}
