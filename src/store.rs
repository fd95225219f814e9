//! The authoritative in-memory service model (spec §4.1).
//!
//! `ServiceStore` keys services by `(namespace, name)` and exposes a single
//! mutation entry point, `update`, through which every producer (service
//! source, probe scheduler, GitOps watcher) must pass. Every commit emits
//! exactly one [`Event`] onto the store's broadcast bus; the notification
//! engine and the SSE broker each hold their own receiver.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::warn;

use crate::errors::StoreError;
use crate::model::{Event, Service, ServiceKey, ServiceSource};
use crate::time::SharedClock;

/// Capacity of the store's broadcast bus. Sized generously (spec §4.1's
/// "the store never blocks on subscribers") so a lag is a symptom, not a
/// mechanism — the SSE broker's own bounded per-subscriber queues (§4.7)
/// are the real backpressure valve.
const EVENT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Inner {
    services: HashMap<ServiceKey, Service>,
}

#[derive(Clone)]
pub struct ServiceStore {
    inner: Arc<RwLock<Inner>>,
    // Serialises the read-modify-recompute-publish sequence in `update`.
    // A single mutex over the whole map is acceptable per spec §4.1 — the
    // map holds hundreds of services, not millions.
    write_lock: Arc<Mutex<()>>,
    events: broadcast::Sender<Event>,
    clock: SharedClock,
}

impl ServiceStore {
    pub fn new(clock: SharedClock) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            write_lock: Arc::new(Mutex::new(())),
            events,
            clock,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Snapshot of every currently-known service (spec §4.1 `All()`).
    pub async fn all(&self) -> Vec<Service> {
        let guard = self.inner.read().await;
        guard.services.values().cloned().collect()
    }

    pub async fn get(&self, key: &ServiceKey) -> Option<Service> {
        let guard = self.inner.read().await;
        guard.services.get(key).cloned()
    }

    /// The single public mutation entry point. `fn` receives a mutable view
    /// of the service (seeded to a zero value keyed by `key` and `source` if
    /// this is the first observation) and may set any field. After `fn`
    /// returns, the composite status is refolded and exactly one event is
    /// published.
    pub async fn update(
        &self,
        key: &ServiceKey,
        source: ServiceSource,
        mutate: impl FnOnce(&mut Service),
    ) -> Service {
        let _write_guard = self.write_lock.lock().await;

        let mut guard = self.inner.write().await;
        let is_new = !guard.services.contains_key(key);
        let service = guard
            .services
            .entry(key.clone())
            .or_insert_with(|| Service::new(key, source));

        mutate(service);

        if service.refold_composite() {
            service.last_state_change = Some(self.clock.now());
        }

        let snapshot = service.clone();
        drop(guard);

        let event = if is_new {
            Event::Discovered(snapshot.clone())
        } else {
            Event::Updated(snapshot.clone())
        };
        self.publish(event);

        snapshot
    }

    /// Removes a service and emits `Removed`. A later rediscovery under the
    /// same key is a fresh lifecycle (spec §3): the entry is gone, so the
    /// next `update` seeds a zero value again rather than replaying history.
    pub async fn remove(&self, key: &ServiceKey) -> bool {
        let _write_guard = self.write_lock.lock().await;
        let mut guard = self.inner.write().await;
        let removed = guard.services.remove(key).is_some();
        drop(guard);

        if removed {
            self.publish(Event::Removed {
                namespace: key.namespace.clone(),
                name: key.name.clone(),
            });
        }
        removed
    }

    pub async fn try_get(&self, key: &ServiceKey) -> Result<Service, StoreError> {
        self.get(key)
            .await
            .ok_or_else(|| StoreError::NotFound(key.canonical()))
    }

    fn publish(&self, event: Event) {
        // `send` only errors when there are no receivers; that's normal
        // before the notification engine / SSE broker have subscribed.
        if self.events.send(event).is_err() {
            warn!("store event published with no active subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::HealthStatus;
    use crate::time::system_clock;

    fn store() -> ServiceStore {
        ServiceStore::new(system_clock())
    }

    #[tokio::test]
    async fn first_update_emits_discovered() {
        let store = store();
        let mut rx = store.subscribe();
        let key = ServiceKey::new("default", "myapp");

        store
            .update(&key, ServiceSource::Config, |svc| {
                svc.url = "http://svc".to_string();
            })
            .await;

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::Discovered(_)));
    }

    #[tokio::test]
    async fn second_update_emits_updated() {
        let store = store();
        let key = ServiceKey::new("default", "myapp");
        store.update(&key, ServiceSource::Config, |_| {}).await;

        let mut rx = store.subscribe();
        store
            .update(&key, ServiceSource::Config, |svc| {
                svc.status = HealthStatus::Healthy;
            })
            .await;

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::Updated(_)));
    }

    #[tokio::test]
    async fn remove_emits_removed_and_drops_entry() {
        let store = store();
        let key = ServiceKey::new("default", "myapp");
        store.update(&key, ServiceSource::Config, |_| {}).await;

        let mut rx = store.subscribe();
        assert!(store.remove(&key).await);
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::Removed { .. }));
        assert!(store.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn remove_of_unknown_key_is_noop() {
        let store = store();
        let key = ServiceKey::new("default", "ghost");
        assert!(!store.remove(&key).await);
    }

    #[tokio::test]
    async fn rediscovery_after_removal_is_a_fresh_lifecycle() {
        let store = store();
        let key = ServiceKey::new("default", "myapp");
        store
            .update(&key, ServiceSource::Config, |svc| {
                svc.status = HealthStatus::Healthy;
            })
            .await;
        store.remove(&key).await;

        let mut rx = store.subscribe();
        store.update(&key, ServiceSource::Config, |_| {}).await;
        let event = rx.recv().await.unwrap();
        match event {
            Event::Discovered(svc) => assert_eq!(svc.status, HealthStatus::Unknown),
            other => panic!("expected Discovered, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn last_state_change_updates_only_on_composite_change() {
        let store = store();
        let key = ServiceKey::new("default", "myapp");
        let svc = store
            .update(&key, ServiceSource::Config, |svc| {
                svc.status = HealthStatus::Healthy;
            })
            .await;
        let first_change = svc.last_state_change;
        assert!(first_change.is_some());

        let svc = store
            .update(&key, ServiceSource::Config, |svc| {
                svc.http_code = Some(200);
            })
            .await;
        assert_eq!(svc.last_state_change, first_change);
    }

    #[tokio::test]
    async fn all_returns_snapshot_of_every_service() {
        let store = store();
        store
            .update(&ServiceKey::new("default", "a"), ServiceSource::Config, |_| {})
            .await;
        store
            .update(&ServiceKey::new("default", "b"), ServiceSource::Config, |_| {})
            .await;

        let all = store.all().await;
        assert_eq!(all.len(), 2);
    }
}
