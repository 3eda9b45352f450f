//! Deferred-processing queue for the degradation path.
//!
//! Accept-and-hold only: the layer records a request that could not be
//! served right now and reports its position; callers drain the queue and
//! re-admit items on their own schedule. The layer runs no background
//! tasks.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

/// A request parked for later processing.
#[derive(Clone, Debug)]
pub struct QueuedRequest {
    pub id: Uuid,
    pub principal_id: String,
    pub query: String,
    pub queued_at: DateTime<Utc>,
}

impl QueuedRequest {
    pub fn new(principal_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            principal_id: principal_id.into(),
            query: query.into(),
            queued_at: Utc::now(),
        }
    }
}

/// Bounded FIFO of deferred requests.
#[derive(Debug)]
pub struct RequestQueue {
    items: Mutex<VecDeque<QueuedRequest>>,
    capacity: usize,
}

impl RequestQueue {
    /// `capacity` of zero disables queuing entirely.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Enqueue a request, returning its 1-based position, or `None` when
    /// queuing is disabled or the queue is full.
    pub async fn enqueue(&self, request: QueuedRequest) -> Option<usize> {
        if self.capacity == 0 {
            return None;
        }
        let mut items = self.items.lock().await;
        if items.len() >= self.capacity {
            return None;
        }
        items.push_back(request);
        Some(items.len())
    }

    /// Pop the oldest queued request.
    pub async fn dequeue(&self) -> Option<QueuedRequest> {
        self.items.lock().await.pop_front()
    }

    pub async fn len(&self) -> usize {
        self.items.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.items.lock().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order_and_positions() {
        let queue = RequestQueue::new(10);

        let first = QueuedRequest::new("a", "q1");
        let first_id = first.id;
        assert_eq!(queue.enqueue(first).await, Some(1));
        assert_eq!(queue.enqueue(QueuedRequest::new("b", "q2")).await, Some(2));

        let popped = queue.dequeue().await.unwrap();
        assert_eq!(popped.id, first_id);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_bounded() {
        let queue = RequestQueue::new(1);
        assert_eq!(queue.enqueue(QueuedRequest::new("a", "q")).await, Some(1));
        assert!(queue.enqueue(QueuedRequest::new("a", "q")).await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_queue_rejects() {
        let queue = RequestQueue::new(0);
        assert!(!queue.is_enabled());
        assert!(queue.enqueue(QueuedRequest::new("a", "q")).await.is_none());
    }
}
