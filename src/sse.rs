//! SSE broker (spec §4.7): fans store events out to every connected
//! operator UI over a bounded per-subscriber queue, evicting slow
//! consumers instead of ever blocking the publisher.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::response::sse::Event as AxumEvent;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::model::{Event, Service};
use crate::oidc::OidcStatus;
use crate::store::ServiceStore;

/// Per-subscriber queue depth (spec §4.7).
const SUBSCRIBER_QUEUE_CAPACITY: usize = 256;

/// How often the broker re-sends a full `state` snapshot, independent of any
/// individual subscriber connecting (spec §4.7's "periodic state snapshot").
const STATE_SNAPSHOT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateSnapshot {
    pub services: Vec<Service>,
    pub app_version: &'static str,
    pub k8s_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8s_last_event: Option<DateTime<Utc>>,
    pub health_check_interval_ms: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub config_errors: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oidc_status: Option<OidcStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sStatus {
    pub k8s_connected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub k8s_last_event: Option<DateTime<Utc>>,
}

/// Wire-level frame matching spec §6's SSE event catalogue. Carries its own
/// `event:` name so the axum route handler stays a thin pass-through.
#[derive(Debug, Clone)]
pub enum SseFrame {
    State(StateSnapshot),
    Discovered(Service),
    Update(Service),
    Removed { namespace: String, name: String },
    K8sStatus(K8sStatus),
}

impl SseFrame {
    fn name(&self) -> &'static str {
        match self {
            SseFrame::State(_) => "state",
            SseFrame::Discovered(_) => "discovered",
            SseFrame::Update(_) => "update",
            SseFrame::Removed { .. } => "removed",
            SseFrame::K8sStatus(_) => "k8sStatus",
        }
    }

    pub fn into_axum_event(self) -> AxumEvent {
        let name = self.name();
        let data = match self {
            SseFrame::State(s) => serde_json::to_string(&s),
            SseFrame::Discovered(s) | SseFrame::Update(s) => serde_json::to_string(&s),
            SseFrame::Removed { namespace, name } => {
                serde_json::to_string(&serde_json::json!({ "namespace": namespace, "name": name }))
            }
            SseFrame::K8sStatus(s) => serde_json::to_string(&s),
        }
        .unwrap_or_else(|_| "{}".to_string());

        AxumEvent::default().event(name).data(data)
    }
}

/// Shared view of cluster connectivity, updated by whichever subsystem owns
/// the kube client (the pod watcher / GitOps watcher loops).
#[derive(Clone, Default)]
pub struct K8sConnectivity {
    inner: Arc<RwLock<K8sStatus>>,
}

impl K8sConnectivity {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(K8sStatus { k8s_connected: false, k8s_last_event: None })),
        }
    }

    pub async fn mark_event(&self) {
        let mut guard = self.inner.write().await;
        guard.k8s_connected = true;
        guard.k8s_last_event = Some(Utc::now());
    }

    pub async fn mark_disconnected(&self) {
        self.inner.write().await.k8s_connected = false;
    }

    pub async fn snapshot(&self) -> K8sStatus {
        self.inner.read().await.clone()
    }
}

struct Subscriber {
    tx: mpsc::Sender<SseFrame>,
}

pub struct SseBroker {
    store: ServiceStore,
    subscribers: Mutex<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    k8s: K8sConnectivity,
    oidc_status: Option<Arc<crate::oidc::OidcClient>>,
    config_errors: Vec<String>,
    health_check_interval_ms: u64,
}

pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

impl SseBroker {
    pub fn new(
        store: ServiceStore,
        k8s: K8sConnectivity,
        oidc_status: Option<Arc<crate::oidc::OidcClient>>,
        config_errors: Vec<String>,
        health_check_interval_ms: u64,
    ) -> Self {
        Self {
            store,
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            k8s,
            oidc_status,
            config_errors,
            health_check_interval_ms,
        }
    }

    /// Registers a new subscriber and immediately queues an initial `state`
    /// snapshot so the client never renders an empty view while waiting for
    /// the next periodic tick (spec §4.7).
    pub async fn subscribe(&self) -> (u64, mpsc::Receiver<SseFrame>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers.lock().await.insert(id, Subscriber { tx: tx.clone() });

        let snapshot = self.snapshot().await;
        let _ = tx.try_send(SseFrame::State(snapshot));

        (id, rx)
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().await.remove(&id);
    }

    async fn snapshot(&self) -> StateSnapshot {
        let services = self.store.all().await;
        let k8s = self.k8s.snapshot().await;
        let oidc_status = match &self.oidc_status {
            Some(client) => Some(client.status().await),
            None => None,
        };

        StateSnapshot {
            services,
            app_version: APP_VERSION,
            k8s_connected: k8s.k8s_connected,
            k8s_last_event: k8s.k8s_last_event,
            health_check_interval_ms: self.health_check_interval_ms,
            config_errors: self.config_errors.clone(),
            oidc_status,
        }
    }

    /// Non-blocking fan-out. A subscriber whose queue is full is considered
    /// slow and dropped outright — the broker never waits on it (spec §4.7,
    /// §8 "SSE backpressure").
    async fn publish(&self, frame: SseFrame) {
        let mut subscribers = self.subscribers.lock().await;
        let mut dead = Vec::new();

        for (id, sub) in subscribers.iter() {
            match sub.tx.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(subscriber = id, "sse subscriber queue full, evicting");
                    dead.push(*id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    dead.push(*id);
                }
            }
        }

        for id in dead {
            subscribers.remove(&id);
        }
    }

    /// Drives the broker for the process lifetime: forwards store events as
    /// they commit, and emits a periodic full `state` snapshot.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut rx = self.store.subscribe();
        let mut ticker = tokio::time::interval(STATE_SNAPSHOT_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("sse_broker_shutdown");
                    return;
                }
                _ = ticker.tick() => {
                    let snapshot = self.snapshot().await;
                    self.publish(SseFrame::State(snapshot)).await;
                }
                event = rx.recv() => {
                    match event {
                        Ok(Event::Discovered(service)) => self.publish(SseFrame::Discovered(service)).await,
                        Ok(Event::Updated(service)) => self.publish(SseFrame::Update(service)).await,
                        Ok(Event::Removed { namespace, name }) => {
                            self.publish(SseFrame::Removed { namespace, name }).await
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "sse broker lagged behind store event bus");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::system_clock;

    #[tokio::test]
    async fn subscribe_immediately_receives_a_state_snapshot() {
        let store = ServiceStore::new(system_clock());
        let broker = SseBroker::new(store, K8sConnectivity::new(), None, vec![], 30_000);
        let (_, mut rx) = broker.subscribe().await;
        let frame = rx.recv().await.unwrap();
        assert!(matches!(frame, SseFrame::State(_)));
    }

    #[tokio::test]
    async fn slow_subscriber_is_evicted_without_blocking_others() {
        let store = ServiceStore::new(system_clock());
        let broker = SseBroker::new(store, K8sConnectivity::new(), None, vec![], 30_000);

        let (slow_id, mut slow_rx) = broker.subscribe().await;
        let (fast_id, mut fast_rx) = broker.subscribe().await;

        // Drain the initial state snapshots.
        slow_rx.recv().await.unwrap();
        fast_rx.recv().await.unwrap();

        // Flood past the slow subscriber's queue capacity without reading it,
        // while draining the fast one after every publish.
        for i in 0..SUBSCRIBER_QUEUE_CAPACITY + 10 {
            broker
                .publish(SseFrame::Removed { namespace: "default".to_string(), name: format!("svc-{i}") })
                .await;
            let _ = fast_rx.try_recv();
        }

        assert!(!broker.subscribers.lock().await.contains_key(&slow_id));
        assert!(broker.subscribers.lock().await.contains_key(&fast_id));
    }

    #[tokio::test]
    async fn unsubscribe_removes_the_subscriber() {
        let store = ServiceStore::new(system_clock());
        let broker = SseBroker::new(store, K8sConnectivity::new(), None, vec![], 30_000);
        let (id, _rx) = broker.subscribe().await;
        broker.unsubscribe(id).await;
        assert!(!broker.subscribers.lock().await.contains_key(&id));
    }
}
