//! Request Queue
//!
//! Admits outbound requests, orders them priority-then-FIFO, and runs them
//! under a concurrency budget sized by the current network quality.
//! Failed attempts (transport error, non-success status, timeout) are retried
//! with linear backoff before the terminal error is reported.

mod types;

pub use types::{PendingRequest, Priority, QueueStats, RequestQueueConfig};

use crate::error::{ResilienceError, ResilienceResult};
use crate::network::{EffectiveType, NetworkMonitor, RequestOptions, Transport, TransportResponse};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use types::QueuedRequest;
use uuid::Uuid;

struct QueueState {
    /// One FIFO per priority, indexed by `Priority::index`
    buckets: [VecDeque<QueuedRequest>; 4],
    in_flight: usize,
    max_concurrent: usize,
    closed: bool,
}

impl QueueState {
    fn push(&mut self, request: QueuedRequest) {
        self.buckets[request.priority.index()].push_back(request);
    }

    fn pop_next(&mut self) -> Option<QueuedRequest> {
        self.buckets.iter_mut().find_map(|bucket| bucket.pop_front())
    }

    fn drain(&mut self) -> Vec<QueuedRequest> {
        self.buckets
            .iter_mut()
            .flat_map(|bucket| bucket.drain(..))
            .collect()
    }
}

struct QueueInner {
    transport: Arc<dyn Transport>,
    config: RequestQueueConfig,
    state: Mutex<QueueState>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

/// Priority request scheduler.
///
/// Cheap to clone; clones share the same queue. Must be used from within a
/// Tokio runtime since dispatch spawns one task per in-flight attempt.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<QueueInner>,
}

impl RequestQueue {
    pub fn new(transport: Arc<dyn Transport>, config: RequestQueueConfig) -> Self {
        let max_concurrent = config.initial_effective_type.concurrency_limit();
        let state = QueueState {
            buckets: Default::default(),
            in_flight: 0,
            max_concurrent,
            closed: false,
        };

        Self {
            inner: Arc::new(QueueInner {
                transport,
                config,
                state: Mutex::new(state),
                monitor_task: Mutex::new(None),
            }),
        }
    }

    /// Queue a request. The returned future resolves once the request is
    /// settled; the request is scheduled even if the future is never polled.
    pub fn enqueue(
        &self,
        target: impl Into<String>,
        options: RequestOptions,
        priority: Priority,
    ) -> PendingRequest {
        let (tx, rx) = oneshot::channel();
        let id = Uuid::new_v4();
        let request = QueuedRequest {
            id,
            target: target.into(),
            options,
            priority,
            enqueued_at: Instant::now(),
            retry_count: 0,
            responder: tx,
        };

        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return PendingRequest::rejected(ResilienceError::Disposed);
            }
            debug!(
                "Enqueued {} {} ({})",
                request.options.method.as_str(),
                request.target,
                priority.as_str()
            );
            state.push(request);
        }

        QueueInner::dispatch(&self.inner);
        PendingRequest::new(id, rx)
    }

    /// [`enqueue`](Self::enqueue) with `Priority::Normal`
    pub fn enqueue_default(&self, target: impl Into<String>, options: RequestOptions) -> PendingRequest {
        self.enqueue(target, options, Priority::Normal)
    }

    /// Reject every request still waiting for dispatch with
    /// [`ResilienceError::Cancelled`]. In-flight attempts keep running.
    /// Returns how many requests were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained = self.inner.state.lock().drain();
        let count = drained.len();
        for request in drained {
            request.settle(Err(ResilienceError::Cancelled));
        }
        if count > 0 {
            info!("Cancelled {} queued requests", count);
        }
        count
    }

    /// Resize the concurrency budget. Applies to the next dispatch, in-flight
    /// requests are left alone.
    pub fn set_concurrency_limit(&self, limit: usize) {
        self.inner.set_limit(limit);
        QueueInner::dispatch(&self.inner);
    }

    pub fn set_effective_type(&self, effective_type: EffectiveType) {
        self.set_concurrency_limit(effective_type.concurrency_limit());
    }

    pub fn concurrency_limit(&self) -> usize {
        self.inner.state.lock().max_concurrent
    }

    /// Follow a network monitor: every effective-type change resizes the
    /// budget. Replaces any previously attached monitor.
    pub fn attach_network_monitor(&self, monitor: &NetworkMonitor) {
        let mut rx = monitor.subscribe();
        let current = rx.borrow_and_update().effective_type;
        self.set_effective_type(current);

        let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while rx.changed().await.is_ok() {
                let effective_type = rx.borrow_and_update().effective_type;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                inner.set_limit(effective_type.concurrency_limit());
                QueueInner::dispatch(&inner);
            }
        });

        if let Some(previous) = self.inner.monitor_task.lock().replace(handle) {
            previous.abort();
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.state.lock();
        QueueStats {
            critical: state.buckets[Priority::Critical.index()].len(),
            high: state.buckets[Priority::High.index()].len(),
            normal: state.buckets[Priority::Normal.index()].len(),
            low: state.buckets[Priority::Low.index()].len(),
            in_flight: state.in_flight,
            concurrency_limit: state.max_concurrent,
        }
    }

    /// Stop accepting work, cancel everything queued and detach from the
    /// network monitor. Idempotent.
    pub fn dispose(&self) {
        let was_open = {
            let mut state = self.inner.state.lock();
            !std::mem::replace(&mut state.closed, true)
        };
        self.cancel_all();
        if let Some(task) = self.inner.monitor_task.lock().take() {
            task.abort();
        }
        if was_open {
            info!("Request queue disposed");
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state.lock().closed
    }
}

impl QueueInner {
    fn set_limit(&self, limit: usize) {
        let limit = limit.max(1);
        let mut state = self.state.lock();
        if state.max_concurrent != limit {
            debug!("Concurrency limit {} -> {}", state.max_concurrent, limit);
            state.max_concurrent = limit;
        }
    }

    /// Start queued requests until the budget is used up
    fn dispatch(inner: &Arc<QueueInner>) {
        loop {
            let request = {
                let mut state = inner.state.lock();
                if state.in_flight >= state.max_concurrent {
                    return;
                }
                match state.pop_next() {
                    Some(request) => {
                        state.in_flight += 1;
                        request
                    }
                    None => return,
                }
            };

            let inner = inner.clone();
            tokio::spawn(async move {
                QueueInner::execute(inner, request).await;
            });
        }
    }

    async fn execute(inner: Arc<QueueInner>, mut request: QueuedRequest) {
        debug!(
            "Dispatching {} (attempt {}, waited {:?})",
            request.id,
            request.retry_count + 1,
            request.enqueued_at.elapsed()
        );
        let outcome = inner.attempt(&request).await;

        inner.state.lock().in_flight -= 1;

        match outcome {
            Ok(response) => request.settle(Ok(response)),
            Err(err) if request.retry_count < inner.config.retry_limit => {
                request.retry_count += 1;
                let delay = inner.config.backoff_for(request.retry_count);
                warn!(
                    "Request {} to {} failed: {}. Retry {}/{} in {:?}",
                    request.id,
                    request.target,
                    err,
                    request.retry_count,
                    inner.config.retry_limit,
                    delay
                );

                // Hand the freed slot to other work during the backoff
                QueueInner::dispatch(&inner);
                tokio::time::sleep(delay).await;

                {
                    let mut state = inner.state.lock();
                    if state.closed {
                        drop(state);
                        request.settle(Err(ResilienceError::Cancelled));
                        return;
                    }
                    state.push(request);
                }
            }
            Err(err) => {
                error!(
                    "Request {} to {} failed after {} attempts: {}",
                    request.id,
                    request.target,
                    request.retry_count + 1,
                    err
                );
                request.settle(Err(err));
            }
        }

        QueueInner::dispatch(&inner);
    }

    async fn attempt(&self, request: &QueuedRequest) -> ResilienceResult<TransportResponse> {
        let timeout = self.config.request_timeout();
        match tokio::time::timeout(timeout, self.transport.send(&request.target, &request.options)).await {
            Ok(Ok(response)) if response.is_success() => Ok(response),
            Ok(Ok(response)) => Err(ResilienceError::HttpStatus {
                status: response.status,
                body: response.body.to_string(),
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(ResilienceError::Timeout(timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers with the configured status code for every call
    struct StatusTransport {
        status: u16,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Transport for StatusTransport {
        async fn send(&self, _target: &str, _options: &RequestOptions) -> ResilienceResult<TransportResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(TransportResponse::new(self.status, json!({"error": "nope"})))
        }
    }

    fn fast_config() -> RequestQueueConfig {
        RequestQueueConfig {
            retry_limit: 2,
            retry_delay_ms: 1,
            request_timeout_ms: 1_000,
            initial_effective_type: EffectiveType::FourG,
        }
    }

    #[tokio::test]
    async fn test_non_success_status_is_a_failed_attempt() {
        let transport = Arc::new(StatusTransport {
            status: 500,
            calls: AtomicUsize::new(0),
        });
        let queue = RequestQueue::new(transport.clone(), fast_config());

        let err = queue.enqueue_default("/x", RequestOptions::get()).await.unwrap_err();
        assert!(matches!(err, ResilienceError::HttpStatus { status: 500, .. }));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_success_resolves_with_response() {
        let transport = Arc::new(StatusTransport {
            status: 201,
            calls: AtomicUsize::new(0),
        });
        let queue = RequestQueue::new(transport, fast_config());
        let response = queue
            .enqueue("/items", RequestOptions::post(json!({})), Priority::High)
            .await
            .unwrap();
        assert_eq!(response.status, 201);

        let stats = queue.stats();
        assert_eq!(stats.queued(), 0);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_enqueue_after_dispose_is_rejected() {
        let transport = Arc::new(StatusTransport {
            status: 200,
            calls: AtomicUsize::new(0),
        });
        let queue = RequestQueue::new(transport.clone(), fast_config());
        queue.dispose();
        queue.dispose();

        assert!(queue.is_disposed());
        let err = queue.enqueue_default("/x", RequestOptions::get()).await.unwrap_err();
        assert!(matches!(err, ResilienceError::Disposed));
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_limit_is_never_below_one() {
        let transport = Arc::new(StatusTransport {
            status: 200,
            calls: AtomicUsize::new(0),
        });
        let queue = RequestQueue::new(transport, fast_config());
        assert_eq!(queue.concurrency_limit(), 4);
        queue.set_concurrency_limit(0);
        assert_eq!(queue.concurrency_limit(), 1);
        queue.set_effective_type(EffectiveType::ThreeG);
        assert_eq!(queue.concurrency_limit(), 2);
    }
}
