// =============================================================================
// Fan-out Hub — non-blocking broadcast to many WebSocket subscribers
// =============================================================================
//
// Producers push into a bounded dispatch queue and never block: when the
// queue is full the message is dropped and counted. A single dispatch
// worker fans each message out to every session's bounded queue; a session
// whose queue is full at dispatch time is evicted on the spot. Delivery
// within one session preserves publication order.
//
// Payloads are serialized once per broadcast and shared between sessions
// behind an Arc; serialization scratch buffers are pooled to keep the
// allocator quiet at 1000+ msg/s.
// =============================================================================

pub mod messages;
pub mod session;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::metrics::Metrics;

/// Per-session outbound queue depth.
pub const SESSION_QUEUE_CAPACITY: usize = 512;
/// Dispatch queue depth shared by all producers.
const DISPATCH_QUEUE_CAPACITY: usize = 1024;
/// Hard upper bound on a single broadcast payload.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;
/// Only every Nth dispatch drop is logged.
const DROP_LOG_SAMPLE: u64 = 100;

/// A registered subscriber's receiving half.
pub struct SessionQueue {
    pub id: u64,
    pub rx: mpsc::Receiver<Arc<str>>,
}

/// Pool of serialization scratch buffers.
struct ScratchPool {
    bufs: Mutex<Vec<Vec<u8>>>,
}

impl ScratchPool {
    fn new() -> Self {
        Self {
            bufs: Mutex::new(Vec::new()),
        }
    }

    fn take(&self) -> Vec<u8> {
        self.bufs.lock().pop().unwrap_or_default()
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut bufs = self.bufs.lock();
        if bufs.len() < 16 {
            bufs.push(buf);
        }
    }
}

/// The broadcast hub.
pub struct Hub {
    sessions: RwLock<HashMap<u64, mpsc::Sender<Arc<str>>>>,
    next_session_id: AtomicU64,
    client_count: AtomicUsize,
    dropped: AtomicU64,
    stopped: AtomicBool,
    dispatch_tx: mpsc::Sender<Arc<str>>,
    dispatch_rx: Mutex<Option<mpsc::Receiver<Arc<str>>>>,
    cancel: CancellationToken,
    scratch: ScratchPool,
    metrics: Arc<Metrics>,
}

impl Hub {
    pub fn new(metrics: Arc<Metrics>) -> Arc<Self> {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(DISPATCH_QUEUE_CAPACITY);
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            client_count: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            dispatch_tx,
            dispatch_rx: Mutex::new(Some(dispatch_rx)),
            cancel: CancellationToken::new(),
            scratch: ScratchPool::new(),
            metrics,
        })
    }

    /// Spawn the dispatch worker. Call once at startup.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let hub = self.clone();
        let mut rx = self
            .dispatch_rx
            .lock()
            .take()
            .expect("hub dispatch worker started twice");

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = hub.cancel.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Some(payload) => hub.fan_out(payload),
                        None => break,
                    },
                }
            }
            debug!("hub dispatch worker stopped");
        })
    }

    // ── Registration ────────────────────────────────────────────────────

    /// Add a subscriber. Returns `None` once the hub has stopped.
    pub fn register(&self) -> Option<SessionQueue> {
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(SESSION_QUEUE_CAPACITY);
        self.sessions.write().insert(id, tx);
        self.client_count.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = id, "hub session registered");
        Some(SessionQueue { id, rx })
    }

    /// Remove a subscriber and close its queue. Safe to call twice; the
    /// second call is a no-op.
    pub fn unregister(&self, id: u64) {
        if self.sessions.write().remove(&id).is_some() {
            self.client_count.fetch_sub(1, Ordering::Relaxed);
            debug!(session_id = id, "hub session unregistered");
        }
    }

    // ── Broadcast ───────────────────────────────────────────────────────

    /// Serialize once and offer to every session. Never blocks.
    pub fn broadcast(&self, msg: &serde_json::Value) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }

        let mut buf = self.scratch.take();
        if serde_json::to_writer(&mut buf, msg).is_err() {
            self.scratch.put(buf);
            return;
        }
        let payload: Arc<str> = match std::str::from_utf8(&buf) {
            Ok(s) => Arc::from(s),
            Err(_) => {
                self.scratch.put(buf);
                return;
            }
        };
        self.scratch.put(buf);

        self.broadcast_raw(payload);
    }

    /// Fast path for pre-serialized payloads.
    pub fn broadcast_raw(&self, payload: Arc<str>) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if payload.len() > MAX_MESSAGE_BYTES {
            warn!(bytes = payload.len(), "broadcast payload exceeds hard bound — dropped");
            self.count_drop();
            return;
        }
        if self.dispatch_tx.try_send(payload).is_err() {
            self.count_drop();
        }
    }

    fn count_drop(&self) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        self.metrics.record_hub_drop();
        if dropped % DROP_LOG_SAMPLE == 1 {
            warn!(dropped, "hub dispatch queue full — dropping messages");
        }
    }

    /// Deliver one payload to every live session, evicting the slow ones.
    fn fan_out(&self, payload: Arc<str>) {
        // Snapshot under a brief read lock; sends happen outside it.
        let snapshot: Vec<(u64, mpsc::Sender<Arc<str>>)> = self
            .sessions
            .read()
            .iter()
            .map(|(&id, tx)| (id, tx.clone()))
            .collect();

        let mut evict: Vec<u64> = Vec::new();
        for (id, tx) in snapshot {
            match tx.try_send(payload.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(session_id = id, "session queue full — evicting slow consumer");
                    evict.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => evict.push(id),
            }
        }

        for id in evict {
            self.unregister(id);
            self.metrics.record_hub_eviction();
        }
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Lock-free subscriber count.
    pub fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Relaxed)
    }

    /// Monotonic count of messages dropped at the dispatch boundary.
    pub fn dropped_messages(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Close every session queue and stop the dispatch worker. Idempotent;
    /// broadcasts after stop are silently ignored.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let mut sessions = self.sessions.write();
        let n = sessions.len();
        sessions.clear();
        self.client_count.store(0, Ordering::Relaxed);
        info!(sessions = n, "hub stopped");
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("clients", &self.client_count())
            .field("dropped", &self.dropped_messages())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Origin admission
// ---------------------------------------------------------------------------

/// Origin whitelist for browser-driven transports. Missing origin means a
/// non-browser caller and is allowed; `*` allows everything.
#[derive(Debug, Clone)]
pub struct OriginPolicy {
    allow_all: bool,
    allowed: std::collections::HashSet<String>,
}

impl OriginPolicy {
    /// Build from a comma-separated configuration string.
    pub fn from_config(raw: &str) -> Self {
        let mut allow_all = false;
        let mut allowed = std::collections::HashSet::new();
        for entry in raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if entry == "*" {
                allow_all = true;
            } else {
                allowed.insert(entry.to_string());
            }
        }
        Self { allow_all, allowed }
    }

    pub fn allows(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(_) if self.allow_all => true,
            Some(o) => self.allowed.contains(o),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hub() -> Arc<Hub> {
        Hub::new(Arc::new(Metrics::new()))
    }

    fn payload(i: usize) -> serde_json::Value {
        serde_json::json!({ "seq": i })
    }

    #[tokio::test]
    async fn broadcast_reaches_all_sessions_in_order() {
        let hub = hub();
        let _worker = hub.start();

        let mut a = hub.register().unwrap();
        let mut b = hub.register().unwrap();
        assert_eq!(hub.client_count(), 2);

        for i in 0..5 {
            hub.broadcast(&payload(i));
        }

        for session in [&mut a, &mut b] {
            for i in 0..5 {
                let msg = session.rx.recv().await.unwrap();
                let v: serde_json::Value = serde_json::from_str(&msg).unwrap();
                assert_eq!(v["seq"], i);
            }
        }
    }

    #[tokio::test]
    async fn slow_session_is_evicted_not_blocked() {
        let hub = hub();
        let _worker = hub.start();

        // Never drained: its queue fills at SESSION_QUEUE_CAPACITY.
        let _slow = hub.register().unwrap();
        let mut fast = hub.register().unwrap();

        let total = SESSION_QUEUE_CAPACITY + 10;
        for i in 0..total {
            hub.broadcast(&payload(i));
            // Keep the fast consumer drained so only the slow one fills.
            while let Ok(msg) = fast.rx.try_recv() {
                let _ = msg;
            }
            tokio::task::yield_now().await;
        }
        // Allow the worker to process the tail.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }

        assert_eq!(hub.client_count(), 1, "slow session should be evicted");
    }

    #[tokio::test]
    async fn producers_never_block_and_drops_are_counted() {
        let hub = hub();
        // Worker not started: the dispatch queue fills and overflow drops.
        let produced = 5000u64;
        for i in 0..produced {
            hub.broadcast(&payload(i as usize));
        }

        let dropped = hub.dropped_messages();
        assert!(dropped > 0);
        // Everything produced is either queued or counted as dropped.
        assert_eq!(dropped, produced - 1024);
    }

    #[tokio::test]
    async fn oversized_payload_is_dropped() {
        let hub = hub();
        let _worker = hub.start();
        let big = "x".repeat(MAX_MESSAGE_BYTES + 1);
        hub.broadcast_raw(Arc::from(big.as_str()));
        assert_eq!(hub.dropped_messages(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_closes_queues() {
        let hub = hub();
        let _worker = hub.start();
        let mut session = hub.register().unwrap();

        hub.stop();
        hub.stop();

        assert_eq!(hub.client_count(), 0);
        assert!(session.rx.recv().await.is_none(), "queue must be closed");
        assert!(hub.register().is_none());

        // Broadcasts after stop are no-ops.
        hub.broadcast(&payload(0));
        assert_eq!(hub.dropped_messages(), 0);
    }

    #[tokio::test]
    async fn unregister_twice_is_harmless() {
        let hub = hub();
        let session = hub.register().unwrap();
        hub.unregister(session.id);
        hub.unregister(session.id);
        assert_eq!(hub.client_count(), 0);
    }

    // ---- OriginPolicy ----------------------------------------------------

    #[test]
    fn origin_policy_membership() {
        let policy = OriginPolicy::from_config("https://ops.example.com, https://ui.example.com");
        assert!(policy.allows(None));
        assert!(policy.allows(Some("https://ops.example.com")));
        assert!(!policy.allows(Some("https://evil.example.com")));
    }

    #[test]
    fn origin_policy_wildcard() {
        let policy = OriginPolicy::from_config("*");
        assert!(policy.allows(Some("https://anything.example")));
    }
}
