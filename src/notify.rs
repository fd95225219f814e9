//! Notification engine (spec §4.6): watches the store's event bus for
//! composite-status transitions, matches them against configured rules,
//! runs each match through the suppression engine, and dispatches surviving
//! deliveries through a bounded-concurrency retry dispatcher.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use reqwest::Client;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{AdapterConfig, AdapterType, NotificationRule, NotificationsConfig};
use crate::errors::NotifyError;
use crate::model::{Event, HealthStatus, PodDiagnostic, Service, ServiceKey};
use crate::store::ServiceStore;
use crate::time::SharedClock;

/// Minimum granularity a configured suppression interval is clamped to
/// (spec §4.6.1).
const MIN_SUPPRESSION_INTERVAL: Duration = Duration::from_secs(60);

/// Retry dispatcher defaults (spec §4.6.2).
const DISPATCH_CONCURRENCY: usize = 32;
const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_secs(1);

/// How often the reminder sweep re-checks still-unhealthy services against
/// their suppression interval (spec §4.6.1, §9's "wire a reminder ticker").
const REMINDER_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub namespace: String,
    pub name: String,
    pub prev_state: HealthStatus,
    pub new_state: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub signals: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_diagnostic: Option<PodDiagnostic>,
    pub escalated: bool,
}

/// Derives the human-scannable signal list for a notification payload (spec
/// §4.6.3). Each check is independent; a service can carry several signals
/// at once.
fn compute_signals(service: &Service) -> Vec<String> {
    let mut signals = Vec::new();

    if service.status != HealthStatus::Healthy {
        signals.push(format!("http:{}", service.status.as_str()));
    }
    if service.auth_guarded {
        signals.push("http:auth-guarded".to_string());
    }
    if let (Some(ready), Some(total)) = (service.ready_endpoints, service.total_endpoints) {
        signals.push(format!("endpoints:{ready}/{total}-ready"));
    }
    if let Some(snippet) = &service.error_snippet {
        signals.push(format!("error:{snippet}"));
    }

    signals
}

#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

pub struct WebhookAdapter {
    name: String,
    url: String,
    client: Client,
}

impl WebhookAdapter {
    pub fn new(name: String, url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { name, url, client }
    }
}

#[async_trait]
impl Adapter for WebhookAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(notification)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery {
                adapter: self.name.clone(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::Delivery {
                adapter: self.name.clone(),
                reason: format!("status {}", resp.status()),
            })
        }
    }
}

/// Parses the small set of duration strings the spec actually uses
/// (`"15m"`, `"30m"`, plain seconds, etc). Not a general ISO-8601 parser —
/// this crate's config never needs one.
fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let (number, unit) = raw.split_at(raw.len() - 1);
    let (value, unit): (&str, char) = match unit.chars().next() {
        Some(c) if c.is_ascii_alphabetic() => (number, c),
        _ => (raw, 's'),
    };
    let value: u64 = value.parse().ok()?;
    let secs = match unit {
        's' => value,
        'm' => value * 60,
        'h' => value * 3600,
        'd' => value * 86_400,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}

struct CompiledRule {
    index: usize,
    services: GlobSet,
    transitions: Vec<String>,
    channels: Vec<String>,
    suppression_interval: Option<Duration>,
    escalate_after: Option<Duration>,
    escalation_channels: Vec<String>,
}

impl CompiledRule {
    fn compile(index: usize, rule: &NotificationRule) -> Self {
        let mut builder = GlobSetBuilder::new();
        for pattern in &rule.services {
            let expanded = if pattern == "*" { "*/*".to_string() } else { pattern.clone() };
            if let Ok(glob) = Glob::new(&expanded) {
                builder.add(glob);
            }
        }
        let services = builder.build().unwrap_or_else(|_| GlobSetBuilder::new().build().unwrap());

        let suppression_interval = rule
            .suppression_interval
            .as_deref()
            .and_then(parse_duration)
            .map(|d| d.max(MIN_SUPPRESSION_INTERVAL));
        let escalate_after = rule.escalate_after.as_deref().and_then(parse_duration);

        Self {
            index,
            services,
            transitions: rule.transitions.clone(),
            channels: rule.channels.clone(),
            suppression_interval,
            escalate_after,
            escalation_channels: rule.escalation_channels.clone(),
        }
    }

    fn matches(&self, key: &ServiceKey, new_state: HealthStatus) -> bool {
        if !self.services.is_match(key.canonical()) {
            return false;
        }
        self.transitions.is_empty() || self.transitions.iter().any(|t| t == new_state.as_str())
    }
}

#[derive(Debug, Clone, Default)]
struct SuppressionState {
    last_notified_at: Option<DateTime<Utc>>,
    unhealthy_since: Option<DateTime<Utc>>,
    escalated: bool,
}

enum Decision {
    Allow(Vec<String>),
    Escalate(Vec<String>),
    Suppress,
}

fn decide(state: &mut SuppressionState, rule: &CompiledRule, now: DateTime<Utc>) -> Decision {
    if state.unhealthy_since.is_none() {
        state.unhealthy_since = Some(now);
        state.last_notified_at = Some(now);
        return Decision::Allow(rule.channels.clone());
    }

    let unhealthy_since = state.unhealthy_since.unwrap();
    if let Some(escalate_after) = rule.escalate_after {
        if !state.escalated
            && now.signed_duration_since(unhealthy_since) >= chrono::Duration::from_std(escalate_after).unwrap_or_default()
        {
            state.escalated = true;
            state.last_notified_at = Some(now);
            let mut channels = rule.channels.clone();
            channels.extend(rule.escalation_channels.clone());
            channels.sort();
            channels.dedup();
            return Decision::Escalate(channels);
        }
    }

    if let Some(interval) = rule.suppression_interval {
        let last = state.last_notified_at.unwrap_or(unhealthy_since);
        if now.signed_duration_since(last) < chrono::Duration::from_std(interval).unwrap_or_default() {
            return Decision::Suppress;
        }
        state.last_notified_at = Some(now);
        return Decision::Allow(rule.channels.clone());
    }

    state.last_notified_at = Some(now);
    Decision::Allow(rule.channels.clone())
}

/// Bounded-concurrency, bounded-retry delivery dispatcher (spec §4.6.2).
/// Dropping a delivery when the semaphore is saturated is the intended
/// overload behavior, not a bug — the engine must never block the event bus.
struct RetryDispatcher {
    adapters: HashMap<String, Arc<dyn Adapter>>,
    semaphore: Arc<Semaphore>,
}

impl RetryDispatcher {
    fn new(adapters: HashMap<String, Arc<dyn Adapter>>) -> Self {
        Self {
            adapters,
            semaphore: Arc::new(Semaphore::new(DISPATCH_CONCURRENCY)),
        }
    }

    fn dispatch(&self, channel: String, notification: Notification, cancel: CancellationToken) {
        let Some(adapter) = self.adapters.get(&channel).cloned() else {
            warn!(channel, "no adapter registered for notification channel");
            return;
        };

        let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
            warn!(channel, "dispatcher saturated, dropping delivery");
            return;
        };

        tokio::spawn(async move {
            let _permit = permit;
            for attempt in 0..MAX_ATTEMPTS {
                match adapter.send(&notification).await {
                    Ok(()) => return,
                    Err(err) => {
                        warn!(channel = %adapter.name(), attempt, error = %err, "notification delivery failed");
                    }
                }

                let backoff = BASE_BACKOFF * 2u32.pow(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return,
                }
            }
            warn!(channel = %adapter.name(), "notification retries exhausted, dropping");
        });
    }
}

pub struct Engine {
    store: ServiceStore,
    rules: Vec<CompiledRule>,
    dispatcher: RetryDispatcher,
    prev_composite: Mutex<HashMap<ServiceKey, HealthStatus>>,
    suppression: Mutex<HashMap<(ServiceKey, usize), SuppressionState>>,
    clock: SharedClock,
}

impl Engine {
    pub fn new(store: ServiceStore, config: &NotificationsConfig, clock: SharedClock) -> Self {
        let rules = config
            .rules
            .iter()
            .enumerate()
            .map(|(i, r)| CompiledRule::compile(i, r))
            .collect();

        let adapters: HashMap<String, Arc<dyn Adapter>> = config
            .adapters
            .iter()
            .map(|a: &AdapterConfig| {
                let adapter: Arc<dyn Adapter> = match a.kind {
                    AdapterType::Webhook => Arc::new(WebhookAdapter::new(a.name.clone(), a.url.clone())),
                };
                (a.name.clone(), adapter)
            })
            .collect();

        Self {
            store,
            rules,
            dispatcher: RetryDispatcher::new(adapters),
            prev_composite: Mutex::new(HashMap::new()),
            suppression: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Consumes the store's event bus in arrival order until `cancel` fires,
    /// interleaved with the periodic reminder sweep (spec §4.6.1, §9).
    pub async fn run(&self, cancel: CancellationToken) {
        let mut rx = self.store.subscribe();
        let mut reminder_ticker = tokio::time::interval(REMINDER_SWEEP_INTERVAL);
        reminder_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("notification_engine_shutdown");
                    return;
                }
                _ = reminder_ticker.tick() => {
                    self.reminder_sweep(&cancel).await;
                }
                event = rx.recv() => {
                    match event {
                        Ok(event) => self.handle_event(event, &cancel).await,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "notification engine lagged behind store event bus");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    async fn handle_event(&self, event: Event, cancel: &CancellationToken) {
        match event {
            Event::Discovered(service) => {
                self.prev_composite
                    .lock()
                    .await
                    .insert(service.key(), service.composite_status);
            }
            Event::Updated(service) => {
                let key = service.key();
                let prev = {
                    let mut guard = self.prev_composite.lock().await;
                    let prev = guard.get(&key).copied();
                    guard.insert(key.clone(), service.composite_status);
                    prev
                };

                if let Some(prev) = prev
                    && prev != service.composite_status
                {
                    self.handle_transition(&service, prev, cancel).await;
                }
            }
            Event::Removed { namespace, name } => {
                let key = ServiceKey::new(namespace, name);
                self.prev_composite.lock().await.remove(&key);
                self.suppression.lock().await.retain(|(k, _), _| k != &key);
            }
        }
    }

    async fn handle_transition(&self, service: &Service, prev: HealthStatus, cancel: &CancellationToken) {
        let key = service.key();
        let now = self.clock.now();

        if service.composite_status == HealthStatus::Healthy {
            self.suppression.lock().await.retain(|(k, _), _| k != &key);
            for rule in &self.rules {
                if !rule.matches(&key, service.composite_status) {
                    continue;
                }
                self.emit(service, prev, rule.channels.clone(), false, cancel).await;
            }
            return;
        }

        for rule in &self.rules {
            if !rule.matches(&key, service.composite_status) {
                continue;
            }

            let decision = {
                let mut guard = self.suppression.lock().await;
                let state = guard.entry((key.clone(), rule.index)).or_default();
                decide(state, rule, now)
            };

            match decision {
                Decision::Allow(channels) => self.emit(service, prev, channels, false, cancel).await,
                Decision::Escalate(channels) => self.emit(service, prev, channels, true, cancel).await,
                Decision::Suppress => {}
            }
        }
    }

    /// Re-evaluates every still-open suppression entry against the current
    /// service state. A service that has since recovered (or disappeared) is
    /// skipped; the store's own events already cleared its entry.
    async fn reminder_sweep(&self, cancel: &CancellationToken) {
        let now = self.clock.now();
        let keys: Vec<(ServiceKey, usize)> = self.suppression.lock().await.keys().cloned().collect();

        for (key, rule_index) in keys {
            let Some(service) = self.store.get(&key).await else { continue };
            if service.composite_status == HealthStatus::Healthy {
                continue;
            }
            let Some(rule) = self.rules.iter().find(|r| r.index == rule_index) else { continue };

            let decision = {
                let mut guard = self.suppression.lock().await;
                let Some(state) = guard.get_mut(&(key.clone(), rule_index)) else { continue };
                decide(state, rule, now)
            };

            match decision {
                Decision::Allow(channels) => {
                    self.emit(&service, service.composite_status, channels, false, cancel).await
                }
                Decision::Escalate(channels) => {
                    self.emit(&service, service.composite_status, channels, true, cancel).await
                }
                Decision::Suppress => {}
            }
        }
    }

    /// Builds the notification payload once and dispatches it to every
    /// channel, deduplicated (spec §4.6's "dispatch deduplicates per
    /// transition").
    async fn emit(
        &self,
        service: &Service,
        prev: HealthStatus,
        mut channels: Vec<String>,
        escalated: bool,
        cancel: &CancellationToken,
    ) {
        channels.sort();
        channels.dedup();

        let notification = Notification {
            namespace: service.namespace.clone(),
            name: service.name.clone(),
            prev_state: prev,
            new_state: service.composite_status,
            timestamp: self.clock.now(),
            signals: compute_signals(service),
            pod_diagnostic: service.pod_diagnostic.clone(),
            escalated,
        };

        for channel in channels {
            self.dispatcher.dispatch(channel, notification.clone(), cancel.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NotificationRule;
    use crate::model::ServiceSource;
    use crate::time::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    struct RecordingAdapter {
        name: String,
        hits: StdArc<AtomicUsize>,
    }

    #[async_trait]
    impl Adapter for RecordingAdapter {
        fn name(&self) -> &str {
            &self.name
        }
        async fn send(&self, _n: &Notification) -> Result<(), NotifyError> {
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn rule(services: &[&str], transitions: &[&str]) -> NotificationRule {
        NotificationRule {
            services: services.iter().map(|s| s.to_string()).collect(),
            transitions: transitions.iter().map(|s| s.to_string()).collect(),
            channels: vec!["webhook".to_string()],
            suppression_interval: None,
            escalate_after: None,
            escalation_channels: vec![],
        }
    }

    #[test]
    fn star_shorthand_matches_any_namespace_and_name() {
        let compiled = CompiledRule::compile(0, &rule(&["*"], &[]));
        let key = ServiceKey::new("default", "myapp");
        assert!(compiled.matches(&key, HealthStatus::Unhealthy));
    }

    #[test]
    fn empty_transitions_matches_any_new_state() {
        let compiled = CompiledRule::compile(0, &rule(&["default/myapp"], &[]));
        let key = ServiceKey::new("default", "myapp");
        assert!(compiled.matches(&key, HealthStatus::Degraded));
    }

    #[test]
    fn transition_list_restricts_matches() {
        let compiled = CompiledRule::compile(0, &rule(&["*"], &["unhealthy"]));
        let key = ServiceKey::new("default", "myapp");
        assert!(compiled.matches(&key, HealthStatus::Unhealthy));
        assert!(!compiled.matches(&key, HealthStatus::Degraded));
    }

    #[test]
    fn parses_minute_and_hour_suffixes() {
        assert_eq!(parse_duration("15m"), Some(Duration::from_secs(900)));
        assert_eq!(parse_duration("30m"), Some(Duration::from_secs(1800)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
    }

    #[test]
    fn suppression_interval_is_clamped_to_minimum_granularity() {
        let mut r = rule(&["*"], &["unhealthy"]);
        r.suppression_interval = Some("5s".to_string());
        let compiled = CompiledRule::compile(0, &r);
        assert_eq!(compiled.suppression_interval, Some(MIN_SUPPRESSION_INTERVAL));
    }

    #[test]
    fn first_occurrence_always_allows() {
        let r = rule(&["*"], &["unhealthy"]);
        let compiled = CompiledRule::compile(0, &r);
        let mut state = SuppressionState::default();
        let now = Utc::now();
        assert!(matches!(decide(&mut state, &compiled, now), Decision::Allow(_)));
    }

    #[test]
    fn suppresses_within_interval_then_allows_after() {
        let mut r = rule(&["*"], &["unhealthy"]);
        r.suppression_interval = Some("15m".to_string());
        let compiled = CompiledRule::compile(0, &r);
        let mut state = SuppressionState::default();
        let t0 = Utc::now();
        assert!(matches!(decide(&mut state, &compiled, t0), Decision::Allow(_)));

        let t1 = t0 + chrono::Duration::minutes(5);
        assert!(matches!(decide(&mut state, &compiled, t1), Decision::Suppress));

        let t2 = t0 + chrono::Duration::minutes(16);
        assert!(matches!(decide(&mut state, &compiled, t2), Decision::Allow(_)));
    }

    #[test]
    fn escalates_after_window_then_stops_escalating_again() {
        let mut r = rule(&["*"], &["unhealthy"]);
        r.suppression_interval = Some("15m".to_string());
        r.escalate_after = Some("30m".to_string());
        r.escalation_channels = vec!["pager".to_string()];
        let compiled = CompiledRule::compile(0, &r);
        let mut state = SuppressionState::default();

        let t0 = Utc::now();
        decide(&mut state, &compiled, t0);
        decide(&mut state, &compiled, t0 + chrono::Duration::minutes(16));

        let t31 = t0 + chrono::Duration::minutes(31);
        let decision = decide(&mut state, &compiled, t31);
        match decision {
            Decision::Escalate(channels) => {
                assert!(channels.contains(&"webhook".to_string()));
                assert!(channels.contains(&"pager".to_string()));
            }
            _ => panic!("expected escalate"),
        }
        assert!(state.escalated);
    }

    #[tokio::test]
    async fn suppression_scenario_from_spec() {
        // services:[*], transitions:[unhealthy], suppressionInterval:15m,
        // escalateAfter:30m, escalationChannels:[pager]. Transitions at
        // t=0, t+5m, t+16m, t+31m: webhook at t=0,t+16m; escalate at t+31m.
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = ServiceStore::new(clock.clone());

        let webhook_hits = StdArc::new(AtomicUsize::new(0));
        let pager_hits = StdArc::new(AtomicUsize::new(0));

        let mut rules_cfg = NotificationsConfig::default();
        let mut r = rule(&["*"], &["unhealthy"]);
        r.suppression_interval = Some("15m".to_string());
        r.escalate_after = Some("30m".to_string());
        r.escalation_channels = vec!["pager".to_string()];
        rules_cfg.rules.push(r);

        let engine = Engine::new(store.clone(), &rules_cfg, clock.clone());
        {
            let mut adapters = HashMap::new();
            adapters.insert(
                "webhook".to_string(),
                Arc::new(RecordingAdapter { name: "webhook".to_string(), hits: webhook_hits.clone() }) as Arc<dyn Adapter>,
            );
            adapters.insert(
                "pager".to_string(),
                Arc::new(RecordingAdapter { name: "pager".to_string(), hits: pager_hits.clone() }) as Arc<dyn Adapter>,
            );
            // Re-point the engine's dispatcher adapters for the test.
            let dispatcher = RetryDispatcher::new(adapters);
            let engine = Engine { dispatcher, ..engine };

            let key = ServiceKey::new("default", "myapp");
            store.update(&key, ServiceSource::Config, |_| {}).await;

            let cancel = CancellationToken::new();

            let mut svc = store.get(&key).await.unwrap();
            svc.status = HealthStatus::Unhealthy;
            svc.refold_composite();
            engine.handle_transition(&svc, HealthStatus::Unknown, &cancel).await;
            tokio::time::sleep(Duration::from_millis(20)).await;

            clock.advance(chrono::Duration::minutes(5));
            engine.handle_transition(&svc, HealthStatus::Unhealthy, &cancel).await;
            tokio::time::sleep(Duration::from_millis(20)).await;

            clock.advance(chrono::Duration::minutes(11));
            engine.handle_transition(&svc, HealthStatus::Unhealthy, &cancel).await;
            tokio::time::sleep(Duration::from_millis(20)).await;

            clock.advance(chrono::Duration::minutes(15));
            engine.handle_transition(&svc, HealthStatus::Unhealthy, &cancel).await;
            tokio::time::sleep(Duration::from_millis(20)).await;

            assert_eq!(webhook_hits.load(Ordering::SeqCst), 3);
            assert_eq!(pager_hits.load(Ordering::SeqCst), 1);
        }
    }

    /// Blocks inside `send` until released, so a burst of dispatches holds
    /// its permits open long enough to observe how many the semaphore let
    /// through.
    struct BlockingAdapter {
        name: String,
        started: StdArc<AtomicUsize>,
        release: StdArc<tokio::sync::Notify>,
    }

    #[async_trait]
    impl Adapter for BlockingAdapter {
        fn name(&self) -> &str {
            &self.name
        }
        async fn send(&self, _n: &Notification) -> Result<(), NotifyError> {
            self.started.fetch_add(1, Ordering::SeqCst);
            self.release.notified().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatcher_drops_delivery_when_semaphore_is_saturated() {
        let started = StdArc::new(AtomicUsize::new(0));
        let release = StdArc::new(tokio::sync::Notify::new());
        let adapter: Arc<dyn Adapter> = Arc::new(BlockingAdapter {
            name: "webhook".to_string(),
            started: started.clone(),
            release: release.clone(),
        });
        let mut adapters = HashMap::new();
        adapters.insert("webhook".to_string(), adapter);
        let dispatcher = RetryDispatcher::new(adapters);

        let notification = Notification {
            namespace: "default".to_string(),
            name: "myapp".to_string(),
            prev_state: HealthStatus::Unknown,
            new_state: HealthStatus::Unhealthy,
            timestamp: Utc::now(),
            signals: vec![],
            pod_diagnostic: None,
            escalated: false,
        };
        let cancel = CancellationToken::new();

        // Saturate the semaphore (capacity C) with one delivery over budget.
        for _ in 0..(DISPATCH_CONCURRENCY + 1) {
            dispatcher.dispatch("webhook".to_string(), notification.clone(), cancel.clone());
        }

        // Give the spawned tasks time to acquire a permit and enter `send`.
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Exactly C deliveries got a permit and are now parked in `send`;
        // the C+1th was dropped by `try_acquire_owned` failing, never
        // reaching the adapter at all.
        assert_eq!(started.load(Ordering::SeqCst), DISPATCH_CONCURRENCY);

        release.notify_waiters();
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
