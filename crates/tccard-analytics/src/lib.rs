//! Durable per-profile event counters with best-effort delivery to a remote collector.
//!
//! Every recorded event is applied and persisted locally before anything touches the
//! network. Failed deliveries land in a persisted retry queue that a background task
//! drains until it is empty.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use tccard_core::{
    counter_state_key, retry_queue_key, CounterAction, CounterError, CounterState,
    DeliveryPayload, RetryQueueEntry,
};
use tccard_storage::{load_json, save_json, FetchError, HttpFetcher, KeyValueStore, StoreError};
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

pub const CRATE_NAME: &str = "tccard-analytics";

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Hand-driven clock for hosts that replay events or for tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("collector unreachable: {0}")]
    Transport(#[from] FetchError),
    #[error("collector rejected update: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait Collector: Send + Sync {
    async fn deliver(&self, payload: &DeliveryPayload) -> Result<(), DeliveryError>;
}

/// Posts payloads as JSON to `<base>/update`.
#[derive(Debug, Clone)]
pub struct HttpCollector {
    http: HttpFetcher,
    endpoint: String,
}

impl HttpCollector {
    pub fn new(http: HttpFetcher, base_url: &str) -> Self {
        Self::with_endpoint(http, format!("{}/update", base_url.trim_end_matches('/')))
    }

    pub fn with_endpoint(http: HttpFetcher, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Collector for HttpCollector {
    async fn deliver(&self, payload: &DeliveryPayload) -> Result<(), DeliveryError> {
        let resp = self.http.post_json(&self.endpoint, payload).await?;
        // Plain 2xx bodies count as success; only an explicit error envelope does not.
        let Ok(body) = serde_json::from_slice::<JsonValue>(&resp.body) else {
            return Ok(());
        };
        let status = body.get("status").and_then(JsonValue::as_str);
        if status.is_some_and(|s| s.eq_ignore_ascii_case("error")) {
            let message = body
                .get("message")
                .and_then(JsonValue::as_str)
                .unwrap_or("no message")
                .to_string();
            return Err(DeliveryError::Rejected(message));
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum CounterStoreError {
    #[error("persisting counters: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Counter(#[from] CounterError),
}

#[derive(Debug, Clone, Copy)]
pub struct CounterStoreConfig {
    pub visit_cooldown: Duration,
    pub retry_interval: Duration,
}

impl Default for CounterStoreConfig {
    fn default() -> Self {
        Self {
            visit_cooldown: Duration::from_secs(30 * 60),
            retry_interval: Duration::from_secs(30),
        }
    }
}

/// Result of [`EventCounterStore::record_event`].
#[derive(Debug)]
pub struct Recorded {
    counted: bool,
    delivery: Option<JoinHandle<()>>,
}

impl Recorded {
    fn skipped() -> Self {
        Self {
            counted: false,
            delivery: None,
        }
    }

    pub fn counted(&self) -> bool {
        self.counted
    }

    /// Wait until the delivery attempt finished: sent, or parked in the retry queue.
    pub async fn settled(self) {
        if let Some(handle) = self.delivery {
            if let Err(err) = handle.await {
                warn!(error = %err, "delivery task did not complete");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub attempted: usize,
    pub delivered: usize,
    pub remaining: usize,
}

struct Inner {
    link: String,
    state_key: String,
    queue_key: String,
    kv: Arc<dyn KeyValueStore>,
    collector: Arc<dyn Collector>,
    clock: Arc<dyn Clock>,
    config: CounterStoreConfig,
    state: Mutex<CounterState>,
    queue: Mutex<Vec<RetryQueueEntry>>,
    retry_task: Mutex<Option<JoinHandle<()>>>,
    drain_lock: tokio::sync::Mutex<()>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.retry_task).take() {
            handle.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Counters for one profile link. Clones share the same state.
#[derive(Clone)]
pub struct EventCounterStore {
    inner: Arc<Inner>,
}

impl EventCounterStore {
    pub fn open(
        link: impl Into<String>,
        kv: Arc<dyn KeyValueStore>,
        collector: Arc<dyn Collector>,
        config: CounterStoreConfig,
    ) -> Result<Self, CounterStoreError> {
        Self::open_with_clock(link, kv, collector, config, Arc::new(SystemClock))
    }

    pub fn open_with_clock(
        link: impl Into<String>,
        kv: Arc<dyn KeyValueStore>,
        collector: Arc<dyn Collector>,
        config: CounterStoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CounterStoreError> {
        let link = link.into();
        let state_key = counter_state_key(&link);
        let queue_key = retry_queue_key(&link);

        let state = match load_json::<CounterState>(kv.as_ref(), &state_key)? {
            Some(Ok(state)) => state,
            Some(Err(err)) => {
                warn!(%link, error = %err, "discarding unreadable counter snapshot");
                CounterState::default()
            }
            None => CounterState::default(),
        };
        let queue = match load_json::<Vec<RetryQueueEntry>>(kv.as_ref(), &queue_key)? {
            Some(Ok(queue)) => queue,
            Some(Err(err)) => {
                warn!(%link, error = %err, "discarding unreadable retry queue");
                Vec::new()
            }
            None => Vec::new(),
        };
        let pending = queue.len();

        let store = Self {
            inner: Arc::new(Inner {
                link,
                state_key,
                queue_key,
                kv,
                collector,
                clock,
                config,
                state: Mutex::new(state),
                queue: Mutex::new(queue),
                retry_task: Mutex::new(None),
                drain_lock: tokio::sync::Mutex::new(()),
            }),
        };
        if pending > 0 {
            info!(link = %store.inner.link, pending, "resuming queued analytics deliveries");
            ensure_retry_task(&store.inner);
        }
        Ok(store)
    }

    pub fn link(&self) -> &str {
        &self.inner.link
    }

    pub fn snapshot(&self) -> CounterState {
        lock(&self.inner.state).clone()
    }

    pub fn retry_queue(&self) -> Vec<RetryQueueEntry> {
        lock(&self.inner.queue).clone()
    }

    pub fn is_retry_task_running(&self) -> bool {
        lock(&self.inner.retry_task)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Apply and persist one event, then deliver it in the background.
    ///
    /// Returns once the local write is done. Delivery failures are queued for retry
    /// and never reported here. Outside a tokio runtime the payload goes straight to
    /// the retry queue.
    pub fn record_event(
        &self,
        action: CounterAction,
        detail: Option<&str>,
    ) -> Result<Recorded, CounterStoreError> {
        let inner = &self.inner;
        let now = inner.clock.now_ms();
        let cooldown_ms = inner.config.visit_cooldown.as_millis() as i64;

        let payload = {
            let mut state = lock(&inner.state);
            let mut next = state.clone();
            if !next.apply(action, detail, now, cooldown_ms)? {
                debug!(link = %inner.link, %action, "event inside cool-down window, not counted");
                return Ok(Recorded::skipped());
            }
            save_json(inner.kv.as_ref(), &inner.state_key, &next)?;
            *state = next;
            DeliveryPayload {
                action,
                detail: detail
                    .map(str::trim)
                    .filter(|d| !d.is_empty())
                    .map(ToString::to_string),
                timestamp: now,
                full_state: state.clone(),
            }
        };

        let delivery = match Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(inner);
                Some(handle.spawn(async move { deliver_or_enqueue(&inner, payload).await }))
            }
            Err(_) => {
                warn!(link = %inner.link, %action, "no async runtime, queueing delivery");
                enqueue(inner, RetryQueueEntry::from_payload(&payload, now));
                None
            }
        };

        Ok(Recorded {
            counted: true,
            delivery,
        })
    }

    /// Count a page view and send the tracking-initialized beacon.
    pub fn begin_session(&self) -> Result<Vec<Recorded>, CounterStoreError> {
        let visit = self.record_event(CounterAction::Visit, None)?;
        let init = self.record_event(CounterAction::Init, None)?;
        Ok(vec![visit, init])
    }

    /// Run one retry cycle now.
    pub async fn drain_retry_queue(&self) -> DrainReport {
        drain(&self.inner).await
    }

    /// Start the periodic retry task unless it is already running.
    pub fn ensure_retry_task(&self) -> bool {
        ensure_retry_task(&self.inner)
    }
}

async fn deliver_or_enqueue(inner: &Arc<Inner>, payload: DeliveryPayload) {
    match inner.collector.deliver(&payload).await {
        Ok(()) => debug!(link = %inner.link, action = %payload.action, "analytics update delivered"),
        Err(err) => {
            warn!(link = %inner.link, action = %payload.action, error = %err, "analytics update failed, queueing for retry");
            let now = inner.clock.now_ms();
            enqueue(inner, RetryQueueEntry::from_payload(&payload, now));
            ensure_retry_task(inner);
        }
    }
}

fn enqueue(inner: &Inner, entry: RetryQueueEntry) {
    let mut queue = lock(&inner.queue);
    queue.push(entry);
    if let Err(err) = save_json(inner.kv.as_ref(), &inner.queue_key, &*queue) {
        error!(link = %inner.link, error = %err, "persisting retry queue failed; entry kept in memory");
    }
}

async fn drain(inner: &Arc<Inner>) -> DrainReport {
    let _draining = inner.drain_lock.lock().await;
    let pending = lock(&inner.queue).clone();
    if pending.is_empty() {
        return DrainReport::default();
    }

    let mut delivered = Vec::new();
    for entry in &pending {
        match inner.collector.deliver(&entry.payload()).await {
            Ok(()) => delivered.push(entry),
            Err(err) => debug!(link = %inner.link, action = %entry.action, error = %err, "retry failed"),
        }
    }

    let mut queue = lock(&inner.queue);
    for done in &delivered {
        if let Some(pos) = queue.iter().position(|e| e == *done) {
            queue.remove(pos);
        }
    }
    if let Err(err) = save_json(inner.kv.as_ref(), &inner.queue_key, &*queue) {
        error!(link = %inner.link, error = %err, "persisting retry queue failed");
    }

    let report = DrainReport {
        attempted: pending.len(),
        delivered: delivered.len(),
        remaining: queue.len(),
    };
    info!(link = %inner.link, attempted = report.attempted, delivered = report.delivered, remaining = report.remaining, "retry cycle finished");
    report
}

fn ensure_retry_task(inner: &Arc<Inner>) -> bool {
    let mut slot = lock(&inner.retry_task);
    if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
        return false;
    }
    let Ok(runtime) = Handle::try_current() else {
        warn!(link = %inner.link, "no async runtime, retry task not started");
        return false;
    };
    debug!(link = %inner.link, "starting retry task");
    *slot = Some(runtime.spawn(retry_loop(
        Arc::downgrade(inner),
        inner.config.retry_interval,
    )));
    true
}

/// Holds only a weak handle so dropping the store ends the loop.
async fn retry_loop(inner: Weak<Inner>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        drain(&inner).await;

        // Decide to stop while holding the slot so a concurrent failure either sees
        // this task still registered or finds the slot empty and starts a new one.
        let mut slot = lock(&inner.retry_task);
        if lock(&inner.queue).is_empty() {
            debug!(link = %inner.link, "retry queue empty, stopping retry task");
            slot.take();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tccard_storage::{HttpClientConfig, MemoryKeyValueStore};
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn payload() -> DeliveryPayload {
        DeliveryPayload {
            action: CounterAction::Share,
            detail: None,
            timestamp: 1_700_000_000_000,
            full_state: CounterState {
                share_count: 1,
                ..Default::default()
            },
        }
    }

    fn fetcher() -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .expect("fetcher")
    }

    #[tokio::test]
    async fn http_collector_posts_camel_case_payload_to_update_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/exec/update"))
            .and(body_partial_json(json!({
                "action": "share",
                "detail": null,
                "fullState": {"shareCount": 1}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "success"})))
            .expect(1)
            .mount(&server)
            .await;

        let collector = HttpCollector::new(fetcher(), &format!("{}/exec/", server.uri()));
        assert!(collector.endpoint().ends_with("/exec/update"));
        collector.deliver(&payload()).await.expect("delivered");
    }

    #[tokio::test]
    async fn http_collector_treats_error_envelopes_and_bad_status_as_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rejecting/update"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": "error", "message": "sheet locked"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/down/update"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/plain/update"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        let rejecting = HttpCollector::new(fetcher(), &format!("{}/rejecting", server.uri()));
        assert!(matches!(
            rejecting.deliver(&payload()).await,
            Err(DeliveryError::Rejected(m)) if m == "sheet locked"
        ));

        let down = HttpCollector::new(fetcher(), &format!("{}/down", server.uri()));
        assert!(matches!(
            down.deliver(&payload()).await,
            Err(DeliveryError::Transport(FetchError::HttpStatus { status: 503, .. }))
        ));

        let plain = HttpCollector::new(fetcher(), &format!("{}/plain", server.uri()));
        assert!(plain.deliver(&payload()).await.is_ok());
    }

    struct NeverCalled;

    #[async_trait]
    impl Collector for NeverCalled {
        async fn deliver(&self, _payload: &DeliveryPayload) -> Result<(), DeliveryError> {
            panic!("collector must not be reached");
        }
    }

    #[test]
    fn without_runtime_events_go_straight_to_the_queue() {
        let kv: Arc<dyn KeyValueStore> = Arc::new(MemoryKeyValueStore::new());
        let store = EventCounterStore::open_with_clock(
            "jane",
            kv,
            Arc::new(NeverCalled),
            CounterStoreConfig::default(),
            Arc::new(ManualClock::new(5_000)),
        )
        .expect("open");

        let recorded = store
            .record_event(CounterAction::Copy, None)
            .expect("recorded");
        assert!(recorded.counted());
        assert_eq!(store.snapshot().copy_count, 1);
        assert_eq!(store.snapshot().last_updated_epoch_ms, 5_000);
        assert_eq!(store.retry_queue().len(), 1);
        assert!(!store.is_retry_task_running());
    }
}
