//! Admission control under a hot-reloadable concurrency cap.
//!
//! ## Responsibility
//! Hold submitted requests in a priority queue, admit them into a bounded
//! active set, run each caller-supplied handler in its own task, and settle
//! the caller's completion handle with the handler's verbatim result.
//!
//! ## Guarantees
//! - The active set never exceeds the configured cap (unless the cap is the
//!   `-1` unlimited sentinel). The slot computation and the queue→active
//!   promotion happen inside one mutex-guarded critical section, so two
//!   scheduling passes can never interleave.
//! - Admission is strictly priority-first; equal priorities are strictly
//!   FIFO via an explicit monotone sequence number (a bare priority
//!   comparator would not guarantee this).
//! - The cap is re-read from [`ConfigHandle`] on every scheduling pass —
//!   raising it at runtime admits more requests on the next pass.
//! - An already-active request is never preempted by a later, higher
//!   priority arrival.
//! - Handler failures are propagated verbatim: counted, never masked or
//!   retried.
//!
//! ## Cancellation
//! Every handler receives a [`CancelToken`]. Cancelling a *queued* request
//! removes it and rejects its handle with [`GatewayError::Cancelled`].
//! Cancelling an *active* request frees its slot and fires the token so a
//! cooperative handler can abort — the in-flight completion handle is never
//! force-rejected; whatever the handler returns still reaches the caller.
//!
//! ## NOT Responsible For
//! - Timeouts: a stuck handler occupies its slot indefinitely; timeout
//!   enforcement belongs to the handler/backend layer.
//! - Choosing a backend or recording metrics (the handler does both).

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, warn};

use crate::config::ConfigHandle;
use crate::GatewayError;

/// Poll interval for [`ConcurrencyManager::wait_for_idle`].
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ── Handler contract ─────────────────────────────────────────────────────

/// Boxed handler future.
pub type HandlerFuture<T> = Pin<Box<dyn Future<Output = Result<T, GatewayError>> + Send>>;

/// The opaque operation a request runs once admitted. Receives a
/// [`CancelToken`] it may watch for cooperative cancellation.
pub type Handler<T> = Box<dyn FnOnce(CancelToken) -> HandlerFuture<T> + Send>;

/// Cooperative cancellation signal threaded into every handler.
///
/// The token only ever transitions from not-cancelled to cancelled. If the
/// request settles normally the token is simply dropped and
/// [`cancelled`](CancelToken::cancelled) never resolves.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    fn new() -> (watch::Sender<bool>, Self) {
        let (tx, rx) = watch::channel(false);
        (tx, Self { rx })
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested. Never resolves if the
    /// request settles without being cancelled — intended as a `select!`
    /// arm alongside the actual work.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender dropped without firing: this request will never be
                // cancelled. Park so a select! arm never spuriously wins.
                std::future::pending::<()>().await;
            }
        }
    }

    /// A token that is never cancelled, for running handlers outside the
    /// manager (tests, direct execution).
    pub fn detached() -> Self {
        let (tx, token) = Self::new();
        // Leak the sender so the channel stays open.
        std::mem::forget(tx);
        token
    }
}

// ── Request records ──────────────────────────────────────────────────────

/// Caller-supplied request metadata. `priority` orders admission (higher is
/// more urgent, default 0); the optional routing labels feed metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RequestMetadata {
    /// Admission priority; higher runs first, equal values are FIFO.
    pub priority: i64,
    /// Logical endpoint for per-endpoint metrics.
    pub endpoint: Option<String>,
    /// Model identifier for per-model metrics.
    pub model: Option<String>,
}

impl RequestMetadata {
    /// Metadata with only a priority set.
    pub fn with_priority(priority: i64) -> Self {
        Self {
            priority,
            ..Self::default()
        }
    }
}

struct QueuedRequest<T> {
    id: String,
    /// Monotone submission order, the FIFO tie-break within a priority.
    seq: u64,
    queued_at: Instant,
    metadata: RequestMetadata,
    handler: Handler<T>,
    reply: oneshot::Sender<Result<T, GatewayError>>,
}

struct ActiveEntry {
    cancel: watch::Sender<bool>,
    metadata: RequestMetadata,
    queued_at: Instant,
    started_at: Instant,
}

struct Inner<T> {
    queue: Vec<QueuedRequest<T>>,
    active: HashMap<String, ActiveEntry>,
    seq: u64,
    completed: u64,
    failed: u64,
    cancelled: u64,
}

// ── Public views ─────────────────────────────────────────────────────────

/// Lifecycle state reported by [`ConcurrencyManager::status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Waiting for a slot.
    Queued,
    /// Handler is running.
    Active,
}

/// Point-in-time view of one request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestStatus {
    /// Current lifecycle state.
    pub state: RequestState,
    /// Time since submission.
    #[serde(with = "duration_millis")]
    pub queued_for: Duration,
    /// Caller-supplied metadata.
    pub metadata: RequestMetadata,
    /// Requests ahead in admission order. Only for queued requests.
    pub position: Option<usize>,
}

/// Manager counters for the pull-based stats surface.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ManagerStats {
    /// Requests currently running.
    pub active: usize,
    /// Requests waiting for a slot.
    pub queued: usize,
    /// Requests that settled successfully.
    pub completed: u64,
    /// Requests whose handler failed.
    pub failed: u64,
    /// Requests cancelled before or during execution.
    pub cancelled: u64,
}

/// A pending completion handle returned by [`ConcurrencyManager::submit`].
///
/// Await [`wait`](Completion::wait) to observe the handler's verbatim result.
#[derive(Debug)]
pub struct Completion<T> {
    rx: oneshot::Receiver<Result<T, GatewayError>>,
}

impl<T> Completion<T> {
    /// Suspend until the request settles.
    ///
    /// # Errors
    ///
    /// Returns the handler's own error, [`GatewayError::Cancelled`],
    /// [`GatewayError::QueueCleared`], or [`GatewayError::ChannelClosed`]
    /// if the manager was dropped mid-flight.
    pub async fn wait(self) -> Result<T, GatewayError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::ChannelClosed),
        }
    }
}

// ── Manager ──────────────────────────────────────────────────────────────

/// Global admission control and priority queue.
///
/// Cloning is cheap; all clones share the same queue and active set.
pub struct ConcurrencyManager<T> {
    inner: Arc<Mutex<Inner<T>>>,
    config: ConfigHandle,
}

impl<T> Clone for ConcurrencyManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            config: self.config.clone(),
        }
    }
}

impl<T: Send + 'static> ConcurrencyManager<T> {
    /// Create a manager reading its concurrency cap from `config` on every
    /// scheduling pass.
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: Vec::new(),
                active: HashMap::new(),
                seq: 0,
                completed: 0,
                failed: 0,
                cancelled: 0,
            })),
            config,
        }
    }

    /// Submit a request and return its completion handle without waiting.
    ///
    /// The request is queued immediately and a scheduling pass is triggered
    /// before this returns, so submission order is the FIFO order.
    pub async fn submit<F, Fut>(
        &self,
        id: impl Into<String>,
        metadata: RequestMetadata,
        handler: F,
    ) -> Completion<T>
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        let id = id.into();
        let (tx, rx) = oneshot::channel();
        {
            let mut inner = self.inner.lock().await;
            inner.seq += 1;
            let seq = inner.seq;
            debug!(
                id = %id,
                priority = metadata.priority,
                seq = seq,
                queued = inner.queue.len() + 1,
                "request submitted"
            );
            inner.queue.push(QueuedRequest {
                id,
                seq,
                queued_at: Instant::now(),
                metadata,
                handler: Box::new(move |token| Box::pin(handler(token))),
                reply: tx,
            });
        }
        self.schedule().await;
        Completion { rx }
    }

    /// Submit a request and suspend until it is admitted and its handler
    /// settles. The handler's result is returned verbatim.
    ///
    /// # Errors
    ///
    /// See [`Completion::wait`].
    pub async fn enqueue<F, Fut>(
        &self,
        id: impl Into<String>,
        metadata: RequestMetadata,
        handler: F,
    ) -> Result<T, GatewayError>
    where
        F: FnOnce(CancelToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, GatewayError>> + Send + 'static,
    {
        self.submit(id, metadata, handler).await.wait().await
    }

    /// One scheduling pass: re-read the cap, compute free slots, promote the
    /// top of the priority queue into the active set, and start each
    /// promoted handler in its own task.
    ///
    /// Runs after every submission and every settlement. The whole pass
    /// holds the state lock, so concurrent passes serialize and the cap
    /// cannot be overshot by interleaving.
    async fn schedule(&self) {
        // Never cached: hot config changes apply on the very next pass.
        let perf = self.config.performance().await;

        let mut inner = self.inner.lock().await;
        if inner.queue.is_empty() {
            return;
        }
        let available = if perf.is_unlimited() {
            inner.queue.len()
        } else {
            (perf.concurrent_requests as usize).saturating_sub(inner.active.len())
        };
        if available == 0 {
            return;
        }

        // Priority descending, then submission order ascending. The explicit
        // seq comparison is what makes equal-priority admission stable FIFO.
        inner.queue.sort_by(|a, b| {
            b.metadata
                .priority
                .cmp(&a.metadata.priority)
                .then(a.seq.cmp(&b.seq))
        });

        let n = available.min(inner.queue.len());
        let batch: Vec<QueuedRequest<T>> = inner.queue.drain(..n).collect();
        for request in batch {
            self.launch(&mut inner, request);
        }
    }

    /// Promote one request into the active set and spawn its wrapper task.
    fn launch(&self, inner: &mut Inner<T>, request: QueuedRequest<T>) {
        let QueuedRequest {
            id,
            seq: _,
            queued_at,
            metadata,
            handler,
            reply,
        } = request;

        let (cancel_tx, token) = CancelToken::new();
        inner.active.insert(
            id.clone(),
            ActiveEntry {
                cancel: cancel_tx,
                metadata,
                queued_at,
                started_at: Instant::now(),
            },
        );

        let this = self.clone();
        tokio::spawn(async move {
            let waited = queued_at.elapsed();
            let started = Instant::now();
            debug!(id = %id, waited_ms = waited.as_millis() as u64, "request admitted");

            let result = handler(token).await;
            let duration = started.elapsed();

            {
                let mut inner = this.inner.lock().await;
                // Already gone if the request was cancelled while active;
                // it was counted as cancelled then, not here.
                let was_active = inner.active.remove(&id).is_some();
                match &result {
                    Ok(_) => {
                        if was_active {
                            inner.completed += 1;
                        }
                        debug!(
                            id = %id,
                            duration_ms = duration.as_millis() as u64,
                            "request succeeded"
                        );
                    }
                    Err(e) => {
                        if was_active {
                            inner.failed += 1;
                        }
                        warn!(
                            id = %id,
                            duration_ms = duration.as_millis() as u64,
                            error = %e,
                            "request failed"
                        );
                    }
                }
            }

            // The receiver may have been dropped; the result is then discarded.
            let _ = reply.send(result);
            // Settlement frees a slot — keep the queue moving.
            this.schedule().await;
        });
    }

    /// Cancel a request by id.
    ///
    /// - Queued: removed from the queue, its handle rejected with
    ///   [`GatewayError::Cancelled`]. Returns true.
    /// - Active: its slot is freed and its [`CancelToken`] fires; the
    ///   handler keeps running until it observes the token, and its
    ///   completion handle is settled by whatever it returns. Returns true.
    /// - Unknown id: returns false with no side effect.
    pub async fn cancel(&self, id: &str) -> bool {
        enum Outcome<T> {
            Queued(oneshot::Sender<Result<T, GatewayError>>),
            Active,
            Unknown,
        }

        let outcome = {
            let mut inner = self.inner.lock().await;
            if let Some(pos) = inner.queue.iter().position(|q| q.id == id) {
                let request = inner.queue.remove(pos);
                inner.cancelled += 1;
                Outcome::Queued(request.reply)
            } else if let Some(entry) = inner.active.remove(id) {
                let _ = entry.cancel.send(true);
                inner.cancelled += 1;
                Outcome::Active
            } else {
                Outcome::Unknown
            }
        };

        match outcome {
            Outcome::Queued(reply) => {
                debug!(id = %id, "queued request cancelled");
                let _ = reply.send(Err(GatewayError::Cancelled));
                true
            }
            Outcome::Active => {
                debug!(id = %id, "active request cancel signalled");
                // The freed slot can admit the next queued request now.
                self.schedule().await;
                true
            }
            Outcome::Unknown => false,
        }
    }

    /// Snapshot of one request's lifecycle, or `None` for an unknown id.
    pub async fn status(&self, id: &str) -> Option<RequestStatus> {
        let inner = self.inner.lock().await;
        if let Some(entry) = inner.active.get(id) {
            return Some(RequestStatus {
                state: RequestState::Active,
                queued_for: entry.started_at.duration_since(entry.queued_at),
                metadata: entry.metadata.clone(),
                position: None,
            });
        }
        let request = inner.queue.iter().find(|q| q.id == id)?;
        // Rank in admission order: requests with higher priority, or equal
        // priority submitted earlier, are ahead.
        let ahead = inner
            .queue
            .iter()
            .filter(|q| {
                q.metadata.priority > request.metadata.priority
                    || (q.metadata.priority == request.metadata.priority && q.seq < request.seq)
            })
            .count();
        Some(RequestStatus {
            state: RequestState::Queued,
            queued_for: request.queued_at.elapsed(),
            metadata: request.metadata.clone(),
            position: Some(ahead),
        })
    }

    /// Reject every queued request with [`GatewayError::QueueCleared`] and
    /// empty the queue. Active requests are untouched. Returns the number
    /// of requests discarded.
    pub async fn clear_queue(&self) -> usize {
        let drained: Vec<QueuedRequest<T>> = {
            let mut inner = self.inner.lock().await;
            inner.queue.drain(..).collect()
        };
        let n = drained.len();
        for request in drained {
            let _ = request.reply.send(Err(GatewayError::QueueCleared));
        }
        if n > 0 {
            warn!(cleared = n, "request queue cleared");
        }
        n
    }

    /// Coarse drain primitive for graceful shutdown: poll until both the
    /// active set and the queue are empty. Makes no ordering promises.
    pub async fn wait_for_idle(&self) {
        loop {
            {
                let inner = self.inner.lock().await;
                if inner.active.is_empty() && inner.queue.is_empty() {
                    return;
                }
            }
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    /// Current manager counters.
    pub async fn stats(&self) -> ManagerStats {
        let inner = self.inner.lock().await;
        ManagerStats {
            active: inner.active.len(),
            queued: inner.queue.len(),
            completed: inner.completed,
            failed: inner.failed,
            cancelled: inner.cancelled,
        }
    }
}

mod duration_millis {
    //! Serialize a `Duration` as whole milliseconds.
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GatewayConfig, PerformanceConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    fn manager_with_cap(cap: i64) -> (ConcurrencyManager<String>, ConfigHandle) {
        let handle = ConfigHandle::new(GatewayConfig {
            performance: PerformanceConfig {
                concurrent_requests: cap,
            },
            ..GatewayConfig::default()
        });
        (ConcurrencyManager::new(handle.clone()), handle)
    }

    /// Handler that records its start order and waits for a release signal.
    fn gated_handler(
        log: Arc<Mutex<Vec<String>>>,
        gate: Arc<Notify>,
        id: &str,
    ) -> impl FnOnce(CancelToken) -> HandlerFuture<String> + Send + 'static {
        let id = id.to_string();
        move |_token| {
            Box::pin(async move {
                log.lock().await.push(id.clone());
                gate.notified().await;
                Ok(id)
            })
        }
    }

    #[tokio::test]
    async fn test_single_request_runs_and_settles() {
        let (mgr, _) = manager_with_cap(2);
        let result = mgr
            .enqueue("r1", RequestMetadata::default(), |_token| async {
                Ok("done".to_string())
            })
            .await;
        assert_eq!(result, Ok("done".to_string()));

        let stats = mgr.stats().await;
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_handler_error_propagates_verbatim() {
        let (mgr, _) = manager_with_cap(2);
        let result = mgr
            .enqueue("r1", RequestMetadata::default(), |_token| async {
                Err::<String, _>(GatewayError::Handler("upstream 503".into()))
            })
            .await;
        assert_eq!(result, Err(GatewayError::Handler("upstream 503".into())));
        assert_eq!(mgr.stats().await.failed, 1);
    }

    #[tokio::test]
    async fn test_active_set_never_exceeds_cap() {
        let (mgr, _) = manager_with_cap(2);
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut completions = Vec::new();
        for i in 0..8 {
            let concurrent = Arc::clone(&concurrent);
            let peak = Arc::clone(&peak);
            let completion = mgr
                .submit(format!("r{i}"), RequestMetadata::default(), move |_token| {
                    Box::pin(async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                        Ok(String::new())
                    }) as HandlerFuture<String>
                })
                .await;
            completions.push(completion);
        }
        for completion in completions {
            completion.wait().await.unwrap();
        }
        assert!(
            peak.load(Ordering::SeqCst) <= 2,
            "cap of 2 exceeded: peak {}",
            peak.load(Ordering::SeqCst)
        );
        assert_eq!(mgr.stats().await.completed, 8);
    }

    #[tokio::test]
    async fn test_unlimited_cap_admits_everything() {
        let (mgr, _) = manager_with_cap(-1);
        let gate = Arc::new(Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut completions = Vec::new();
        for i in 0..6 {
            let completion = mgr
                .submit(
                    format!("r{i}"),
                    RequestMetadata::default(),
                    gated_handler(Arc::clone(&log), Arc::clone(&gate), &format!("r{i}")),
                )
                .await;
            completions.push(completion);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mgr.stats().await.active, 6, "all admitted at once");

        gate.notify_waiters();
        for completion in completions {
            completion.wait().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_equal_priority_is_fifo() {
        let (mgr, _) = manager_with_cap(1);
        let gate = Arc::new(Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        // Occupy the single slot so later submissions queue up.
        let blocker = mgr
            .submit(
                "blocker",
                RequestMetadata::default(),
                gated_handler(Arc::clone(&log), Arc::clone(&gate), "blocker"),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut completions = Vec::new();
        for i in 0..4 {
            let completion = mgr
                .submit(
                    format!("r{i}"),
                    RequestMetadata::default(),
                    gated_handler(Arc::clone(&log), Arc::clone(&gate), &format!("r{i}")),
                )
                .await;
            completions.push(completion);
        }

        // Release everything; with cap 1 the starts serialize in FIFO order.
        for _ in 0..8 {
            gate.notify_waiters();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        blocker.wait().await.unwrap();
        for completion in completions {
            completion.wait().await.unwrap();
        }

        let order = log.lock().await.clone();
        assert_eq!(order, vec!["blocker", "r0", "r1", "r2", "r3"]);
    }

    #[tokio::test]
    async fn test_higher_priority_admitted_first_once_slot_frees() {
        let (mgr, _) = manager_with_cap(1);
        let gate = Arc::new(Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let blocker = mgr
            .submit(
                "blocker",
                RequestMetadata::default(),
                gated_handler(Arc::clone(&log), Arc::clone(&gate), "blocker"),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let low = mgr
            .submit(
                "low",
                RequestMetadata::with_priority(0),
                gated_handler(Arc::clone(&log), Arc::clone(&gate), "low"),
            )
            .await;
        let high = mgr
            .submit(
                "high",
                RequestMetadata::with_priority(5),
                gated_handler(Arc::clone(&log), Arc::clone(&gate), "high"),
            )
            .await;

        for _ in 0..8 {
            gate.notify_waiters();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        blocker.wait().await.unwrap();
        low.wait().await.unwrap();
        high.wait().await.unwrap();

        let order = log.lock().await.clone();
        assert_eq!(
            order,
            vec!["blocker", "high", "low"],
            "high priority jumps the queue but never preempts the active one"
        );
    }

    #[tokio::test]
    async fn test_cancel_queued_removes_and_rejects() {
        let (mgr, _) = manager_with_cap(1);
        let gate = Arc::new(Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let blocker = mgr
            .submit(
                "blocker",
                RequestMetadata::default(),
                gated_handler(Arc::clone(&log), Arc::clone(&gate), "blocker"),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let queued = mgr
            .submit(
                "victim",
                RequestMetadata::default(),
                gated_handler(Arc::clone(&log), Arc::clone(&gate), "victim"),
            )
            .await;

        assert!(mgr.cancel("victim").await);
        assert_eq!(queued.wait().await, Err(GatewayError::Cancelled));
        assert_eq!(mgr.stats().await.cancelled, 1);

        gate.notify_waiters();
        blocker.wait().await.unwrap();
        assert!(
            !log.lock().await.contains(&"victim".to_string()),
            "cancelled request must never start"
        );
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_returns_false_without_side_effect() {
        let (mgr, _) = manager_with_cap(1);
        assert!(!mgr.cancel("ghost").await);
        let stats = mgr.stats().await;
        assert_eq!(stats.cancelled, 0);
        assert_eq!(stats.queued, 0);
    }

    #[tokio::test]
    async fn test_cancel_active_fires_token_and_frees_slot() {
        let (mgr, _) = manager_with_cap(1);

        let completion = mgr
            .submit("r1", RequestMetadata::default(), |mut token| async move {
                token.cancelled().await;
                Err::<String, _>(GatewayError::Cancelled)
            })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mgr.stats().await.active, 1);

        assert!(mgr.cancel("r1").await);
        // The cooperative handler observed the token and aborted; its result
        // still reaches the caller — the handle was never force-rejected.
        assert_eq!(completion.wait().await, Err(GatewayError::Cancelled));

        let stats = mgr.stats().await;
        assert_eq!(stats.active, 0, "slot freed");
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.failed, 0, "counted as cancelled, not failed");
    }

    #[tokio::test]
    async fn test_cancel_active_lets_uncooperative_handler_finish() {
        let (mgr, _) = manager_with_cap(1);
        let gate = Arc::new(Notify::new());

        let gate_clone = Arc::clone(&gate);
        let completion = mgr
            .submit("r1", RequestMetadata::default(), move |_token| async move {
                // Ignores the token entirely.
                gate_clone.notified().await;
                Ok("finished anyway".to_string())
            })
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(mgr.cancel("r1").await);
        gate.notify_waiters();
        assert_eq!(completion.wait().await, Ok("finished anyway".to_string()));
    }

    #[tokio::test]
    async fn test_clear_queue_rejects_pending_keeps_active() {
        let (mgr, _) = manager_with_cap(1);
        let gate = Arc::new(Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let blocker = mgr
            .submit(
                "blocker",
                RequestMetadata::default(),
                gated_handler(Arc::clone(&log), Arc::clone(&gate), "blocker"),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let q1 = mgr
            .submit(
                "q1",
                RequestMetadata::default(),
                gated_handler(Arc::clone(&log), Arc::clone(&gate), "q1"),
            )
            .await;
        let q2 = mgr
            .submit(
                "q2",
                RequestMetadata::default(),
                gated_handler(Arc::clone(&log), Arc::clone(&gate), "q2"),
            )
            .await;

        assert_eq!(mgr.clear_queue().await, 2);
        assert_eq!(q1.wait().await, Err(GatewayError::QueueCleared));
        assert_eq!(q2.wait().await, Err(GatewayError::QueueCleared));

        gate.notify_waiters();
        assert_eq!(
            blocker.wait().await,
            Ok("blocker".to_string()),
            "active request survives a queue clear"
        );
    }

    #[tokio::test]
    async fn test_status_reports_state_and_position() {
        let (mgr, _) = manager_with_cap(1);
        let gate = Arc::new(Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let _blocker = mgr
            .submit(
                "blocker",
                RequestMetadata::default(),
                gated_handler(Arc::clone(&log), Arc::clone(&gate), "blocker"),
            )
            .await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _q1 = mgr
            .submit(
                "q1",
                RequestMetadata::with_priority(0),
                gated_handler(Arc::clone(&log), Arc::clone(&gate), "q1"),
            )
            .await;
        let _q2 = mgr
            .submit(
                "q2",
                RequestMetadata::with_priority(9),
                gated_handler(Arc::clone(&log), Arc::clone(&gate), "q2"),
            )
            .await;

        let blocker_status = mgr.status("blocker").await.unwrap();
        assert_eq!(blocker_status.state, RequestState::Active);
        assert_eq!(blocker_status.position, None);

        // q2 outranks q1 despite being submitted later.
        assert_eq!(mgr.status("q2").await.unwrap().position, Some(0));
        assert_eq!(mgr.status("q1").await.unwrap().position, Some(1));
        assert!(mgr.status("ghost").await.is_none());

        gate.notify_waiters();
    }

    #[tokio::test]
    async fn test_raising_cap_at_runtime_admits_more() {
        let (mgr, handle) = manager_with_cap(1);
        let gate = Arc::new(Notify::new());
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut completions = Vec::new();
        for i in 0..3 {
            let completion = mgr
                .submit(
                    format!("r{i}"),
                    RequestMetadata::default(),
                    gated_handler(Arc::clone(&log), Arc::clone(&gate), &format!("r{i}")),
                )
                .await;
            completions.push(completion);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mgr.stats().await.active, 1);

        // Hot-reload the cap; the pass triggered by the next submission
        // re-reads it and admits the backlog.
        let mut config = handle.current().await;
        config.performance.concurrent_requests = 4;
        handle.replace(config).await;

        let extra = mgr
            .submit(
                "r3",
                RequestMetadata::default(),
                gated_handler(Arc::clone(&log), Arc::clone(&gate), "r3"),
            )
            .await;
        completions.push(extra);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(mgr.stats().await.active, 4, "new cap applies immediately");

        for _ in 0..4 {
            gate.notify_waiters();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        for completion in completions {
            completion.wait().await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_wait_for_idle_returns_after_drain() {
        let (mgr, _) = manager_with_cap(2);
        for i in 0..5 {
            let mgr2 = mgr.clone();
            tokio::spawn(async move {
                let _ = mgr2
                    .enqueue(format!("r{i}"), RequestMetadata::default(), |_| async {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(String::new())
                    })
                    .await;
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        tokio::time::timeout(Duration::from_secs(2), mgr.wait_for_idle())
            .await
            .expect("wait_for_idle must return once everything settled");
        assert_eq!(mgr.stats().await.active, 0);
    }

    #[tokio::test]
    async fn test_detached_token_is_never_cancelled() {
        let token = CancelToken::detached();
        assert!(!token.is_cancelled());
    }
}
