//! Pod diagnostics informer: folds Kubernetes pod state into the per-service
//! `readyEndpoints`/`totalEndpoints`/`podDiagnostic` signals consumed by the
//! health probing pipeline (spec §4.4, §3 invariants).
//!
//! The index itself is keyed purely by namespace + the pod's
//! `app.kubernetes.io/name` (falling back to `app`) label, mirroring the
//! pod-to-workload association the teacher's `governance.rs` performs via
//! namespace + label inspection — it has no notion of `ServiceSource` and
//! will answer for any key a pod's labels happen to produce. Services of
//! `source=config` never carry pod diagnostics (spec §3); that guard lives
//! in `prober::apply_probe`, which only consults this index for
//! Kubernetes-sourced services.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use kube_runtime::watcher::{self, Event};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::model::{PodDiagnostic, ServiceKey};

#[derive(Debug, Clone)]
pub struct PodEndpointDiagnostic {
    pub ready: u32,
    pub total: u32,
    pub pod_diagnostic: Option<PodDiagnostic>,
}

#[derive(Debug, Default)]
struct Aggregate {
    ready: u32,
    total: u32,
    max_restarts: u32,
    worst_reason: Option<String>,
}

#[derive(Default)]
struct Inner {
    // one aggregate per (namespace, workload-label) key, rebuilt from the
    // full pod set on every event — small cluster scale, rebuild is cheap.
    pods: HashMap<String, Pod>,
    aggregates: HashMap<ServiceKey, Aggregate>,
}

/// Shared read side consulted by the probing pipeline after each probe.
#[derive(Clone, Default)]
pub struct PodDiagnosticsIndex {
    inner: Arc<RwLock<Inner>>,
}

impl PodDiagnosticsIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Test-only seam: inserts a resolved aggregate directly, bypassing the
    /// pod-event rebuild, so other modules' tests can exercise a populated
    /// index without standing up a fake `kube::Client`.
    #[cfg(test)]
    pub(crate) async fn seed_for_test(&self, key: ServiceKey, ready: u32, total: u32, restart_count: u32) {
        let mut guard = self.inner.write().await;
        guard.aggregates.insert(
            key,
            Aggregate {
                ready,
                total,
                max_restarts: restart_count,
                worst_reason: (restart_count > 0).then(|| "CrashLoopBackOff".to_string()),
            },
        );
    }

    pub fn diagnostics_for(&self, key: &ServiceKey) -> Option<PodEndpointDiagnostic> {
        let guard = self.inner.blocking_read_or_none()?;
        let agg = guard.aggregates.get(key)?;
        Some(PodEndpointDiagnostic {
            ready: agg.ready,
            total: agg.total,
            pod_diagnostic: if agg.max_restarts > 0 {
                Some(PodDiagnostic {
                    reason: agg.worst_reason.clone(),
                    restart_count: agg.max_restarts,
                })
            } else {
                None
            },
        })
    }

    async fn rebuild(&self) {
        let mut guard = self.inner.write().await;
        let mut aggregates: HashMap<ServiceKey, Aggregate> = HashMap::new();

        for pod in guard.pods.values() {
            let Some(ns) = pod.metadata.namespace.as_deref() else {
                continue;
            };
            let Some(workload) = workload_label(pod) else {
                continue;
            };
            let key = ServiceKey::new(ns, workload);
            let agg = aggregates.entry(key).or_default();

            agg.total += 1;
            if pod_is_ready(pod) {
                agg.ready += 1;
            }

            let restarts = max_restart_count(pod);
            if restarts > agg.max_restarts {
                agg.max_restarts = restarts;
                agg.worst_reason = crash_reason(pod);
            }
        }

        guard.aggregates = aggregates;
    }
}

// `diagnostics_for` is called from synchronous probe-folding code; rather
// than thread an async call through every caller, take a best-effort
// `try_read` — the index is only ever a few milliseconds stale between pod
// events, which the spec's composite-status folding tolerates fine.
trait TryReadExt<T> {
    fn blocking_read_or_none(&self) -> Option<tokio::sync::RwLockReadGuard<'_, T>>;
}

impl<T> TryReadExt<T> for RwLock<T> {
    fn blocking_read_or_none(&self) -> Option<tokio::sync::RwLockReadGuard<'_, T>> {
        self.try_read().ok()
    }
}

fn workload_label(pod: &Pod) -> Option<String> {
    let labels = pod.metadata.labels.as_ref()?;
    labels
        .get("app.kubernetes.io/name")
        .or_else(|| labels.get("app"))
        .cloned()
}

fn pod_is_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}

fn max_restart_count(pod: &Pod) -> u32 {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .map(|statuses| {
            statuses
                .iter()
                .map(|cs| cs.restart_count.max(0) as u32)
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0)
}

fn crash_reason(pod: &Pod) -> Option<String> {
    let statuses = pod.status.as_ref()?.container_statuses.as_ref()?;
    for cs in statuses {
        if let Some(waiting) = cs.state.as_ref().and_then(|s| s.waiting.as_ref()) {
            if let Some(reason) = &waiting.reason {
                return Some(reason.clone());
            }
        }
        if let Some(terminated) = cs.state.as_ref().and_then(|s| s.terminated.as_ref()) {
            if let Some(reason) = &terminated.reason {
                return Some(reason.clone());
            }
        }
    }
    None
}

/// Runs the pod informer until `cancel` fires. CRD-less, so failures here
/// are genuine API errors rather than "CRD not installed" (that's the
/// GitOps watcher's concern) — still logged and non-fatal per spec §4.5's
/// general discipline of never tearing down the process over a watch error.
pub async fn run(client: Client, index: PodDiagnosticsIndex, cancel: CancellationToken) {
    let pods: Api<Pod> = Api::all(client);
    let mut stream = Box::pin(watcher::watcher(pods, watcher::Config::default()));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("pod_watcher_shutdown");
                return;
            }
            event = stream.next() => {
                match event {
                    Some(Ok(Event::Apply(pod))) => {
                        if let Some(key) = pod_key(&pod) {
                            index.inner.write().await.pods.insert(key, pod);
                            index.rebuild().await;
                        }
                    }
                    Some(Ok(Event::Delete(pod))) => {
                        if let Some(key) = pod_key(&pod) {
                            index.inner.write().await.pods.remove(&key);
                            index.rebuild().await;
                        }
                    }
                    Some(Ok(Event::Init)) => {}
                    Some(Ok(Event::InitApply(pod))) => {
                        if let Some(key) = pod_key(&pod) {
                            index.inner.write().await.pods.insert(key, pod);
                        }
                    }
                    Some(Ok(Event::InitDone)) => {
                        index.rebuild().await;
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "pod_watch_error");
                    }
                    None => {
                        warn!("pod_watch_stream_ended");
                        return;
                    }
                }
            }
        }
    }
}

fn pod_key(pod: &Pod) -> Option<String> {
    let ns = pod.metadata.namespace.as_deref()?;
    let name = pod.metadata.name.as_deref()?;
    Some(format!("{ns}/{name}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodCondition, PodStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod(ns: &str, name: &str, workload: &str, ready: bool, restarts: i32) -> Pod {
        let mut labels = BTreeMap::new();
        labels.insert("app".to_string(), workload.to_string());

        Pod {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            status: Some(PodStatus {
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: if ready { "True" } else { "False" }.to_string(),
                    ..Default::default()
                }]),
                container_statuses: Some(vec![ContainerStatus {
                    restart_count: restarts,
                    state: Some(ContainerState {
                        terminated: if restarts > 3 {
                            Some(ContainerStateTerminated {
                                reason: Some("CrashLoopBackOff".to_string()),
                                ..Default::default()
                            })
                        } else {
                            None
                        },
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn aggregates_ready_count_across_pods_sharing_a_workload() {
        let index = PodDiagnosticsIndex::new();
        {
            let mut guard = index.inner.write().await;
            guard.pods.insert("default/myapp-1".into(), pod("default", "myapp-1", "myapp", true, 0));
            guard.pods.insert("default/myapp-2".into(), pod("default", "myapp-2", "myapp", false, 0));
        }
        index.rebuild().await;

        let key = ServiceKey::new("default", "myapp");
        let diag = index.diagnostics_for(&key).unwrap();
        assert_eq!(diag.ready, 1);
        assert_eq!(diag.total, 2);
        assert!(diag.pod_diagnostic.is_none());
    }

    #[tokio::test]
    async fn surfaces_crash_diagnostic_for_high_restart_pods() {
        let index = PodDiagnosticsIndex::new();
        {
            let mut guard = index.inner.write().await;
            guard.pods.insert("default/myapp-1".into(), pod("default", "myapp-1", "myapp", true, 10));
        }
        index.rebuild().await;

        let key = ServiceKey::new("default", "myapp");
        let diag = index.diagnostics_for(&key).unwrap();
        let pod_diag = diag.pod_diagnostic.unwrap();
        assert_eq!(pod_diag.restart_count, 10);
        assert_eq!(pod_diag.reason.as_deref(), Some("CrashLoopBackOff"));
    }

    #[tokio::test]
    async fn unknown_key_has_no_diagnostics() {
        let index = PodDiagnosticsIndex::new();
        let key = ServiceKey::new("default", "ghost");
        assert!(index.diagnostics_for(&key).is_none());
    }
}
