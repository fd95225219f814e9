//! Probe scheduler (spec §4.4, §5): one independently-phased `tokio` task
//! per service so checks never burst together, and exactly one probe is
//! ever in flight for a given service at a time.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::model::{ServiceKey, ServiceSource};
use crate::podwatch::PodDiagnosticsIndex;
use crate::prober::{apply_probe, HealthProber};
use crate::store::ServiceStore;

/// Deterministic per-key phase offset so many services sharing one interval
/// don't all probe in the same tick (spec §5 "independent per-service
/// phase"). Not cryptographic; just spreads load.
fn phase_offset(key: &ServiceKey, interval: Duration) -> Duration {
    if interval.is_zero() {
        return Duration::ZERO;
    }
    let mut hasher = DefaultHasher::new();
    key.canonical().hash(&mut hasher);
    let millis = interval.as_millis().max(1) as u64;
    Duration::from_millis(hasher.finish() % millis)
}

struct Scheduled {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

/// Owns one spawned task per actively-scheduled service. `ensure_scheduled`
/// is idempotent; re-registering a key already running is a no-op so the
/// Kubernetes service-source reconciler can call it on every resync without
/// restarting in-flight probes.
#[derive(Clone)]
pub struct ProbeScheduler {
    store: ServiceStore,
    prober: Arc<HealthProber>,
    pods: PodDiagnosticsIndex,
    interval: Duration,
    tasks: Arc<Mutex<HashMap<ServiceKey, Scheduled>>>,
}

impl ProbeScheduler {
    pub fn new(
        store: ServiceStore,
        prober: Arc<HealthProber>,
        pods: PodDiagnosticsIndex,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            prober,
            pods,
            interval,
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Starts (or leaves running) the probe loop for `key` against
    /// `base_url`, `source`.
    pub async fn ensure_scheduled(&self, key: ServiceKey, base_url: String, source: ServiceSource) {
        let mut tasks = self.tasks.lock().await;
        if tasks.contains_key(&key) {
            return;
        }

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_loop(
            self.store.clone(),
            self.prober.clone(),
            self.pods.clone(),
            key.clone(),
            base_url,
            source,
            self.interval,
            cancel.clone(),
        ));

        tasks.insert(key, Scheduled { handle, cancel });
    }

    /// Cancels and removes the loop for `key`, if one is running. Used when
    /// a Kubernetes-sourced service disappears (spec §4.5's cross-reconciler
    /// contract: the loop halts "promptly", not mid-probe).
    pub async fn unschedule(&self, key: &ServiceKey) {
        let mut tasks = self.tasks.lock().await;
        if let Some(scheduled) = tasks.remove(key) {
            scheduled.cancel.cancel();
            scheduled.handle.abort();
        }
    }

    pub async fn is_scheduled(&self, key: &ServiceKey) -> bool {
        self.tasks.lock().await.contains_key(key)
    }

    /// Cancels every running loop and waits for them to exit. Called once
    /// at process shutdown.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for (_, scheduled) in tasks.drain() {
            scheduled.cancel.cancel();
            let _ = scheduled.handle.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_loop(
    store: ServiceStore,
    prober: Arc<HealthProber>,
    pods: PodDiagnosticsIndex,
    key: ServiceKey,
    base_url: String,
    source: ServiceSource,
    interval: Duration,
    cancel: CancellationToken,
) {
    let offset = phase_offset(&key, interval);
    debug!(service = %key, ?offset, "probe loop starting");

    // Spec §4.4: a newly discovered service is probed immediately; the phase
    // offset only spreads *subsequent* probes across the interval so many
    // services sharing one cadence don't all fire in the same tick.
    run_one_probe(&store, &prober, &pods, &key, &base_url, source, &cancel).await;
    if cancel.is_cancelled() {
        return;
    }

    tokio::select! {
        _ = tokio::time::sleep(offset) => {}
        _ = cancel.cancelled() => return,
    }

    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(service = %key, "probe loop cancelled");
                return;
            }
            _ = ticker.tick() => {
                run_one_probe(&store, &prober, &pods, &key, &base_url, source, &cancel).await;
                if cancel.is_cancelled() {
                    return;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one_probe(
    store: &ServiceStore,
    prober: &HealthProber,
    pods: &PodDiagnosticsIndex,
    key: &ServiceKey,
    base_url: &str,
    source: ServiceSource,
    cancel: &CancellationToken,
) {
    let outcome = prober.probe(key, base_url, cancel).await;
    let now = Utc::now();
    let pods = pods.clone();
    let key_for_fold = key.clone();
    store
        .update(key, source, move |svc| {
            apply_probe(svc, &outcome, &pods, &key_for_fold, now);
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::EndpointDiscoverer;
    use crate::time::system_clock;
    use axum::routing::get;
    use axum::Router;
    use reqwest::Client;

    async fn spawn_server(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn phase_offset_is_deterministic_for_a_given_key() {
        let key = ServiceKey::new("default", "myapp");
        let interval = Duration::from_millis(30_000);
        assert_eq!(phase_offset(&key, interval), phase_offset(&key, interval));
    }

    #[test]
    fn phase_offset_never_exceeds_interval() {
        let key = ServiceKey::new("default", "myapp");
        let interval = Duration::from_millis(5_000);
        assert!(phase_offset(&key, interval) < interval);
    }

    #[tokio::test]
    async fn ensure_scheduled_is_idempotent() {
        let router = Router::new().route("/healthz", get(|| async { "ok" }));
        let base = spawn_server(router).await;

        let store = ServiceStore::new(system_clock());
        let prober = Arc::new(HealthProber::new(
            Client::new(),
            EndpointDiscoverer::new(Client::new()),
            None,
        ));
        let scheduler = ProbeScheduler::new(
            store,
            prober,
            PodDiagnosticsIndex::new(),
            Duration::from_millis(20),
        );

        let key = ServiceKey::new("default", "myapp");
        scheduler.ensure_scheduled(key.clone(), base.clone(), ServiceSource::Config).await;
        scheduler.ensure_scheduled(key.clone(), base, ServiceSource::Config).await;

        assert_eq!(scheduler.tasks.lock().await.len(), 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn probing_populates_the_store() {
        let router = Router::new().route("/healthz", get(|| async { "ok" }));
        let base = spawn_server(router).await;

        let store = ServiceStore::new(system_clock());
        let prober = Arc::new(HealthProber::new(
            Client::new(),
            EndpointDiscoverer::new(Client::new()),
            None,
        ));
        let scheduler = ProbeScheduler::new(
            store.clone(),
            prober,
            PodDiagnosticsIndex::new(),
            Duration::from_millis(10),
        );

        let key = ServiceKey::new("default", "myapp");
        scheduler.ensure_scheduled(key.clone(), base, ServiceSource::Config).await;

        let mut rx = store.subscribe();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("probe should fire within timeout")
            .unwrap();
        assert_eq!(event.key(), key);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn unschedule_stops_further_probes() {
        let router = Router::new().route("/healthz", get(|| async { "ok" }));
        let base = spawn_server(router).await;

        let store = ServiceStore::new(system_clock());
        let prober = Arc::new(HealthProber::new(
            Client::new(),
            EndpointDiscoverer::new(Client::new()),
            None,
        ));
        let scheduler = ProbeScheduler::new(
            store,
            prober,
            PodDiagnosticsIndex::new(),
            Duration::from_millis(10),
        );

        let key = ServiceKey::new("default", "myapp");
        scheduler.ensure_scheduled(key.clone(), base, ServiceSource::Config).await;
        assert!(scheduler.is_scheduled(&key).await);

        scheduler.unschedule(&key).await;
        assert!(!scheduler.is_scheduled(&key).await);
    }

    #[tokio::test]
    async fn newly_discovered_service_is_probed_immediately() {
        let router = Router::new().route("/healthz", get(|| async { "ok" }));
        let base = spawn_server(router).await;

        let store = ServiceStore::new(system_clock());
        let prober = Arc::new(HealthProber::new(
            Client::new(),
            EndpointDiscoverer::new(Client::new()),
            None,
        ));
        // An interval long enough that a phase-offset-first-then-tick loop
        // would never fire within this test's timeout; a probe-first loop
        // fires well before it (spec §4.4 "probed immediately").
        let scheduler = ProbeScheduler::new(
            store.clone(),
            prober,
            PodDiagnosticsIndex::new(),
            Duration::from_secs(30_000),
        );

        let key = ServiceKey::new("default", "myapp");
        scheduler.ensure_scheduled(key.clone(), base, ServiceSource::Config).await;

        let mut rx = store.subscribe();
        let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("first probe should fire immediately, not after the phase offset")
            .unwrap();
        assert_eq!(event.key(), key);

        scheduler.shutdown().await;
    }
}
