// ===============================
// src/cache.rs (TTL memo + single-flight)
// ===============================
//
// One slot per logical resource (the GET path):
// - fresh entry (age < TTL)  -> served without touching the transport
// - fetch in flight          -> caller joins the same shared future
// - otherwise                -> one fetch; success replaces the entry
// - 429 with an old entry    -> the old entry is served (stale read)
//
use ahash::AHashMap as HashMap;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::ApiError;
use crate::metrics::CACHE_EVENTS;
use crate::transport::Transport;

pub type Payload = Arc<Value>;
type Inflight = Shared<BoxFuture<'static, Result<Payload, ApiError>>>;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Payload,
    pub captured_at: Instant,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.captured_at) < ttl
    }
}

#[derive(Default)]
struct Slot {
    entry: Option<CacheEntry>,
    inflight: Option<(u64, Inflight)>,
}

type Slots = Arc<Mutex<HashMap<String, Slot>>>;

#[derive(Clone)]
pub struct ResponseCache {
    transport: Arc<dyn Transport>,
    ttl: Duration,
    slots: Slots,
    next_flight: Arc<Mutex<u64>>,
}

impl ResponseCache {
    pub fn new(transport: Arc<dyn Transport>, ttl: Duration) -> Self {
        Self { transport, ttl, slots: Arc::default(), next_flight: Arc::default() }
    }

    /// Payload for `key`, fetched through the transport at most once per TTL window.
    pub async fn get(&self, key: &str) -> Result<Payload, ApiError> {
        let flight = {
            let mut slots = self.slots.lock();
            let slot = slots.entry(key.to_string()).or_default();

            if let Some(entry) = &slot.entry {
                if entry.is_fresh(Instant::now(), self.ttl) {
                    CACHE_EVENTS.with_label_values(&["hit"]).inc();
                    debug!(%key, "cache hit");
                    return Ok(entry.payload.clone());
                }
            }

            match &slot.inflight {
                Some((_, f)) => {
                    CACHE_EVENTS.with_label_values(&["joined"]).inc();
                    debug!(%key, "joining in-flight fetch");
                    f.clone()
                }
                None => {
                    CACHE_EVENTS.with_label_values(&["miss"]).inc();
                    debug!(%key, "cache miss, fetching");
                    let id = {
                        let mut n = self.next_flight.lock();
                        *n += 1;
                        *n
                    };
                    let f = self.fetch(key.to_string(), id);
                    slot.inflight = Some((id, f.clone()));
                    f
                }
            }
        };
        flight.await
    }

    fn fetch(&self, key: String, id: u64) -> Inflight {
        let transport = Arc::clone(&self.transport);
        let slots = Arc::clone(&self.slots);
        async move {
            let captured_at = Instant::now();
            let result = transport.get(&key).await;

            let mut slots = slots.lock();
            let slot = slots.entry(key.clone()).or_default();
            // an invalidate() during the flight detaches it; its result is still returned
            let current = matches!(&slot.inflight, Some((fid, _)) if *fid == id);
            if current {
                slot.inflight = None;
            }

            match result {
                Ok(v) => {
                    let payload = Arc::new(v);
                    if current {
                        slot.entry = Some(CacheEntry { payload: payload.clone(), captured_at });
                    }
                    Ok(payload)
                }
                Err(e) if e.is_rate_limited() => match &slot.entry {
                    Some(prev) => {
                        CACHE_EVENTS.with_label_values(&["stale"]).inc();
                        warn!(%key, "rate limited, serving stale cache");
                        Ok(prev.payload.clone())
                    }
                    None => Err(e),
                },
                Err(e) => Err(e),
            }
        }
        .boxed()
        .shared()
    }

    /// Forget `key` so the next `get` goes to the transport.
    pub fn invalidate(&self, key: &str) {
        if let Some(slot) = self.slots.lock().get_mut(key) {
            slot.entry = None;
            slot.inflight = None;
        }
    }

    pub fn peek(&self, key: &str) -> Option<CacheEntry> {
        self.slots.lock().get(key).and_then(|s| s.entry.clone())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted transport: pops one reply per GET, counts every call.
    pub(crate) struct FakeTransport {
        pub gets: AtomicUsize,
        pub posts: AtomicUsize,
        replies: Mutex<VecDeque<Result<Value, ApiError>>>,
        fallback: Mutex<Result<Value, ApiError>>,
        post_reply: Mutex<Result<Value, ApiError>>,
        delay: Duration,
    }

    impl FakeTransport {
        pub(crate) fn new(fallback: Value) -> Self {
            Self {
                gets: AtomicUsize::new(0),
                posts: AtomicUsize::new(0),
                replies: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(Ok(fallback)),
                post_reply: Mutex::new(Ok(serde_json::json!({ "message": "ok" }))),
                delay: Duration::ZERO,
            }
        }
        pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
        pub(crate) fn push(&self, r: Result<Value, ApiError>) {
            self.replies.lock().push_back(r);
        }
        pub(crate) fn set_fallback(&self, r: Result<Value, ApiError>) {
            *self.fallback.lock() = r;
        }
        pub(crate) fn set_post_reply(&self, r: Result<Value, ApiError>) {
            *self.post_reply.lock() = r;
        }
        pub(crate) fn get_count(&self) -> usize {
            self.gets.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn get(&self, _path: &str) -> Result<Value, ApiError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.replies.lock().pop_front();
            next.unwrap_or_else(|| self.fallback.lock().clone())
        }
        async fn post(&self, _path: &str, _body: Option<Value>) -> Result<Value, ApiError> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.post_reply.lock().clone()
        }
    }

    fn rate_limited() -> ApiError {
        ApiError::Status { status: 429, body: "Too Many Requests".into() }
    }

    #[tokio::test(start_paused = true)]
    async fn two_calls_within_ttl_issue_one_request() {
        let t = Arc::new(FakeTransport::new(serde_json::json!({ "n": 1 })));
        let cache = ResponseCache::new(t.clone(), Duration::from_secs(5));

        let a = cache.get("/status").await.unwrap();
        tokio::time::advance(Duration::from_secs(4)).await;
        let b = cache.get("/status").await.unwrap();

        assert_eq!(t.get_count(), 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test(start_paused = true)]
    async fn call_after_ttl_refetches() {
        let t = Arc::new(FakeTransport::new(serde_json::json!({})));
        let cache = ResponseCache::new(t.clone(), Duration::from_secs(5));

        cache.get("/status").await.unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        cache.get("/status").await.unwrap();

        assert_eq!(t.get_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_flight() {
        let t = Arc::new(FakeTransport::new(serde_json::json!({ "v": 7 })).with_delay(Duration::from_millis(300)));
        let cache = ResponseCache::new(t.clone(), Duration::from_secs(5));

        let (a, b, c) = tokio::join!(cache.get("/status"), cache.get("/status"), cache.get("/status"));

        assert_eq!(t.get_count(), 1);
        let (a, b, c) = (a.unwrap(), b.unwrap(), c.unwrap());
        assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_callers_share_one_failure() {
        let t = Arc::new(FakeTransport::new(serde_json::json!({})).with_delay(Duration::from_millis(100)));
        t.push(Err(ApiError::Transport("connection refused".into())));
        let cache = ResponseCache::new(t.clone(), Duration::from_secs(5));

        let (a, b) = tokio::join!(cache.get("/status"), cache.get("/status"));

        assert_eq!(t.get_count(), 1);
        assert_eq!(a.unwrap_err(), ApiError::Transport("connection refused".into()));
        assert!(b.is_err());
        // failure is not cached
        cache.get("/status").await.unwrap();
        assert_eq!(t.get_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_serves_stale_entry() {
        let t = Arc::new(FakeTransport::new(serde_json::json!({})));
        t.push(Ok(serde_json::json!({ "status": "running" })));
        t.push(Err(rate_limited()));
        let cache = ResponseCache::new(t.clone(), Duration::from_secs(5));

        cache.get("/status").await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        let stale = cache.get("/status").await.unwrap();

        assert_eq!(t.get_count(), 2);
        assert_eq!(stale["status"], "running");
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_without_entry_propagates() {
        let t = Arc::new(FakeTransport::new(serde_json::json!({})));
        t.push(Err(rate_limited()));
        let cache = ResponseCache::new(t.clone(), Duration::from_secs(5));

        let err = cache.get("/status").await.unwrap_err();
        assert!(err.is_rate_limited());
    }

    #[tokio::test(start_paused = true)]
    async fn other_errors_do_not_fall_back_to_stale() {
        let t = Arc::new(FakeTransport::new(serde_json::json!({})));
        t.push(Ok(serde_json::json!({ "status": "running" })));
        t.push(Err(ApiError::Status { status: 500, body: "boom".into() }));
        let cache = ResponseCache::new(t.clone(), Duration::from_secs(5));

        cache.get("/status").await.unwrap();
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(cache.get("/status").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn resources_are_cached_independently() {
        let t = Arc::new(FakeTransport::new(serde_json::json!({})));
        let cache = ResponseCache::new(t.clone(), Duration::from_secs(5));

        cache.get("/status").await.unwrap();
        cache.get("/state").await.unwrap();
        cache.get("/status").await.unwrap();

        assert_eq!(t.get_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_forces_refetch() {
        let t = Arc::new(FakeTransport::new(serde_json::json!({})));
        let cache = ResponseCache::new(t.clone(), Duration::from_secs(5));

        cache.get("/status").await.unwrap();
        assert!(cache.peek("/status").is_some());
        cache.invalidate("/status");
        assert!(cache.peek("/status").is_none());
        cache.get("/status").await.unwrap();

        assert_eq!(t.get_count(), 2);
    }
}
