//! GitOps reconciliation watcher (spec §4.5): two dynamic informers over
//! Flux's `Kustomization` and `HelmRelease` custom resources, folding their
//! `Ready` condition into each mapped service's `gitOpsStatus`.
//!
//! The CRD shapes below mirror `src/crd.rs`'s `CustomResource` derive idiom,
//! trimmed to only the fields this watcher actually reads.

use futures::StreamExt;
use kube::{Api, Client, CustomResource};
use kube_runtime::watcher::{self, Event};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::model::{GitOpsStatus, GitOpsSourceType, ReconciliationState, ServiceKey, ServiceSource};
use crate::store::ServiceStore;

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FluxCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "lastTransitionTime")]
    pub last_transition_time: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct FluxStatus {
    #[serde(default)]
    pub conditions: Vec<FluxCondition>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct KustomizationSpec {
    #[serde(default)]
    pub suspend: bool,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "kustomize.toolkit.fluxcd.io",
    version = "v1",
    kind = "Kustomization",
    namespaced,
    status = "FluxStatus"
)]
pub struct KustomizationCrdSpec {
    #[serde(default)]
    pub suspend: bool,
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "helm.toolkit.fluxcd.io",
    version = "v2beta1",
    kind = "HelmRelease",
    namespaced,
    status = "FluxStatus"
)]
pub struct HelmReleaseCrdSpec {
    #[serde(default)]
    pub suspend: bool,
}

/// Total function from a Flux object's suspend flag + condition list to the
/// reconciliation status the store records (spec §4.5, §8 scenario 5). Never
/// panics on a missing/malformed shape — absence just falls through to the
/// "awaiting first reconciliation" branch.
pub fn fold_conditions(suspend: bool, conditions: &[FluxCondition]) -> (ReconciliationState, String) {
    if suspend {
        return (ReconciliationState::Suspended, "reconciliation suspended".to_string());
    }

    let ready = conditions
        .iter()
        .find(|c| c.type_.eq_ignore_ascii_case("ready"));

    match ready {
        Some(cond) if cond.status.eq_ignore_ascii_case("true") => (
            ReconciliationState::Synced,
            cond.message.clone().unwrap_or_default(),
        ),
        Some(cond) if cond.status.eq_ignore_ascii_case("false") => (
            ReconciliationState::Failed,
            cond.message.clone().unwrap_or_default(),
        ),
        Some(cond) => (
            ReconciliationState::Progressing,
            cond.message.clone().unwrap_or_default(),
        ),
        None => (
            ReconciliationState::Progressing,
            "awaiting first reconciliation".to_string(),
        ),
    }
}

/// Applies a resolved GitOps status to `name` in its own namespace and, when
/// `cross_namespace_propagation` is enabled, to every other service sharing
/// that name in a different namespace (spec §4.5's name-based propagation —
/// kept because the source does it, gated behind a config switch per the
/// spec's own design note).
async fn apply_status(
    store: &ServiceStore,
    namespace: &str,
    name: &str,
    source_type: GitOpsSourceType,
    state: ReconciliationState,
    message: String,
    cross_namespace_propagation: bool,
) {
    let status = GitOpsStatus {
        reconciliation_state: state,
        message: message.clone(),
        source_type,
        last_transition_time: Some(chrono::Utc::now()),
    };

    let key = ServiceKey::new(namespace, name);
    store
        .update(&key, ServiceSource::Kubernetes, {
            let status = status.clone();
            move |svc| svc.git_ops_status = Some(status)
        })
        .await;

    if !cross_namespace_propagation {
        return;
    }

    for svc in store.all().await {
        if svc.name == name && svc.namespace != namespace {
            let other_key = svc.key();
            store
                .update(&other_key, svc.source, {
                    let status = status.clone();
                    move |svc| svc.git_ops_status = Some(status)
                })
                .await;
        }
    }
}

/// Runs the `Kustomization` informer until `cancel` fires. A sync failure
/// (CRD not installed) is logged and the loop exits — the other informer
/// keeps running independently (spec §4.5).
pub async fn run_kustomization_watcher(
    client: Client,
    namespace: String,
    store: ServiceStore,
    cross_namespace_propagation: bool,
    cancel: CancellationToken,
) {
    let api: Api<Kustomization> = Api::namespaced(client, &namespace);
    let mut stream = Box::pin(watcher::watcher(api, watcher::Config::default()));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("kustomization_watcher_shutdown");
                return;
            }
            event = stream.next() => {
                match event {
                    Some(Ok(Event::Apply(obj))) | Some(Ok(Event::InitApply(obj))) => {
                        handle_kustomization(&store, &obj, cross_namespace_propagation).await;
                    }
                    Some(Ok(Event::Delete(_))) | Some(Ok(Event::Init)) | Some(Ok(Event::InitDone)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "kustomization_watch_error, CRD may not be installed");
                    }
                    None => {
                        warn!("kustomization_watch_stream_ended");
                        return;
                    }
                }
            }
        }
    }
}

/// Runs the `HelmRelease` informer. Mirrors [`run_kustomization_watcher`].
pub async fn run_helmrelease_watcher(
    client: Client,
    namespace: String,
    store: ServiceStore,
    cross_namespace_propagation: bool,
    cancel: CancellationToken,
) {
    let api: Api<HelmRelease> = Api::namespaced(client, &namespace);
    let mut stream = Box::pin(watcher::watcher(api, watcher::Config::default()));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("helmrelease_watcher_shutdown");
                return;
            }
            event = stream.next() => {
                match event {
                    Some(Ok(Event::Apply(obj))) | Some(Ok(Event::InitApply(obj))) => {
                        handle_helmrelease(&store, &obj, cross_namespace_propagation).await;
                    }
                    Some(Ok(Event::Delete(_))) | Some(Ok(Event::Init)) | Some(Ok(Event::InitDone)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "helmrelease_watch_error, CRD may not be installed");
                    }
                    None => {
                        warn!("helmrelease_watch_stream_ended");
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_kustomization(store: &ServiceStore, obj: &Kustomization, cross_namespace_propagation: bool) {
    let Some(name) = obj.metadata.name.as_deref() else { return };
    let Some(namespace) = obj.metadata.namespace.as_deref() else { return };
    let conditions = obj.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default();
    let (state, message) = fold_conditions(obj.spec.suspend, &conditions);
    apply_status(
        store,
        namespace,
        name,
        GitOpsSourceType::Kustomization,
        state,
        message,
        cross_namespace_propagation,
    )
    .await;
}

async fn handle_helmrelease(store: &ServiceStore, obj: &HelmRelease, cross_namespace_propagation: bool) {
    let Some(name) = obj.metadata.name.as_deref() else { return };
    let Some(namespace) = obj.metadata.namespace.as_deref() else { return };
    let conditions = obj.status.as_ref().map(|s| s.conditions.clone()).unwrap_or_default();
    let (state, message) = fold_conditions(obj.spec.suspend, &conditions);
    apply_status(
        store,
        namespace,
        name,
        GitOpsSourceType::Helmrelease,
        state,
        message,
        cross_namespace_propagation,
    )
    .await;
}
