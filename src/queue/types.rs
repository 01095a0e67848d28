use crate::network::{EffectiveType, RequestOptions, TransportResponse};
use crate::error::{ResilienceError, ResilienceResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use uuid::Uuid;

/// Dispatch priority. Lower numeric value is dispatched first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 0,
    High = 1,
    #[default]
    Normal = 2,
    Low = 3,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Normal,
        Priority::Low,
    ];

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl FromStr for Priority {
    type Err = ResilienceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "normal" => Ok(Priority::Normal),
            "low" => Ok(Priority::Low),
            other => Err(ResilienceError::InvalidInput(format!(
                "Unknown priority '{}'",
                other
            ))),
        }
    }
}

/// Request queue tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestQueueConfig {
    /// Retries after the first attempt
    pub retry_limit: u32,
    /// Base of the linear backoff: attempt `n` waits `n * retry_delay_ms`
    pub retry_delay_ms: u64,
    /// Bound on each individual attempt
    pub request_timeout_ms: u64,
    /// Connection class assumed until a network monitor reports one
    pub initial_effective_type: EffectiveType,
}

impl Default for RequestQueueConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            retry_delay_ms: 1000,
            request_timeout_ms: 30_000,
            initial_effective_type: EffectiveType::Unknown,
        }
    }
}

impl RequestQueueConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Delay before retry number `retry_count` (1-based)
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        self.retry_delay() * retry_count
    }
}

pub(crate) type Responder = oneshot::Sender<ResilienceResult<TransportResponse>>;

/// One pending network operation, owned by the queue until settled
pub(crate) struct QueuedRequest {
    pub id: Uuid,
    pub target: String,
    pub options: RequestOptions,
    pub priority: Priority,
    pub enqueued_at: Instant,
    pub retry_count: u32,
    pub responder: Responder,
}

impl QueuedRequest {
    pub fn settle(self, result: ResilienceResult<TransportResponse>) {
        // The caller may have dropped its future; nothing left to notify then
        let _ = self.responder.send(result);
    }
}

/// Future returned by [`super::RequestQueue::enqueue`].
///
/// Resolves with the response, the terminal error after retries, or
/// [`ResilienceError::Cancelled`].
#[derive(Debug)]
pub struct PendingRequest {
    id: Uuid,
    rx: oneshot::Receiver<ResilienceResult<TransportResponse>>,
}

impl PendingRequest {
    pub(crate) fn new(id: Uuid, rx: oneshot::Receiver<ResilienceResult<TransportResponse>>) -> Self {
        Self { id, rx }
    }

    /// Already-settled request, used when the queue refuses work
    pub(crate) fn rejected(err: ResilienceError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(err));
        Self::new(Uuid::new_v4(), rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

impl Future for PendingRequest {
    type Output = ResilienceResult<TransportResponse>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // Sender dropped without an answer: the runtime tore the task down
            Poll::Ready(Err(_)) => Poll::Ready(Err(ResilienceError::Cancelled)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Snapshot for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub critical: usize,
    pub high: usize,
    pub normal: usize,
    pub low: usize,
    pub in_flight: usize,
    pub concurrency_limit: usize,
}

impl QueueStats {
    pub fn queued(&self) -> usize {
        self.critical + self.high + self.normal + self.low
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order_and_parse() {
        let mut all = vec![Priority::Low, Priority::Critical, Priority::Normal, Priority::High];
        all.sort();
        assert_eq!(all, Priority::ALL.to_vec());
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_linear_backoff() {
        let config = RequestQueueConfig::default();
        assert_eq!(config.backoff_for(1), Duration::from_millis(1000));
        assert_eq!(config.backoff_for(3), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_rejected_pending_request_resolves_immediately() {
        let pending = PendingRequest::rejected(ResilienceError::Disposed);
        assert!(matches!(pending.await, Err(ResilienceError::Disposed)));
    }
}
