//! Event queue seam
//!
//! The broker itself is an external collaborator: a durable, ordered,
//! multi-producer/multi-consumer FIFO of opaque serialized events. The
//! trait captures the contract (push, pop-or-block with timeout, a
//! dead-letter path); [`MemoryQueue`] is the in-process stand-in.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Message that exhausted processing, parked with the failure reason.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub body: String,
    pub reason: String,
}

#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Append one serialized event.
    async fn push(&self, body: String);

    /// Pop the oldest event, blocking up to `timeout`. `None` on timeout.
    async fn pop(&self, timeout: Duration) -> Option<String>;

    /// Park a message that must not be requeued.
    async fn push_dead_letter(&self, body: String, reason: String);

    async fn dead_letters(&self) -> Vec<DeadLetter>;

    async fn len(&self) -> usize;
}

/// In-process FIFO with blocking pop. FIFO across producers is preserved
/// by the single VecDeque; consumers contend on pop only.
pub struct MemoryQueue {
    items: Mutex<VecDeque<String>>,
    dead: Mutex<Vec<DeadLetter>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            dead: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventQueue for MemoryQueue {
    async fn push(&self, body: String) {
        self.items.lock().await.push_back(body);
        self.notify.notify_one();
    }

    async fn pop(&self, timeout: Duration) -> Option<String> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(body) = self.items.lock().await.pop_front() {
                return Some(body);
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return None;
            }
            // Wake on push or expire; a racing consumer may win the item,
            // in which case we loop and wait out the rest of the budget.
            let _ = tokio::time::timeout(remaining, self.notify.notified()).await;
        }
    }

    async fn push_dead_letter(&self, body: String, reason: String) {
        tracing::warn!(reason = %reason, "dead-lettering message");
        self.dead.lock().await.push(DeadLetter { body, reason });
    }

    async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead.lock().await.clone()
    }

    async fn len(&self) -> usize {
        self.items.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fifo_order() {
        let q = MemoryQueue::new();
        q.push("a".into()).await;
        q.push("b".into()).await;
        assert_eq!(q.pop(Duration::from_millis(10)).await.as_deref(), Some("a"));
        assert_eq!(q.pop(Duration::from_millis(10)).await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_pop_times_out_empty() {
        let q = MemoryQueue::new();
        assert!(q.pop(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn test_pop_wakes_on_push() {
        let q = std::sync::Arc::new(MemoryQueue::new());
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.pop(Duration::from_secs(2)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.push("late".into()).await;
        assert_eq!(waiter.await.unwrap().as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn test_dead_letter_keeps_reason() {
        let q = MemoryQueue::new();
        q.push_dead_letter("{bad}".into(), "malformed".into()).await;
        let dead = q.dead_letters().await;
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, "malformed");
    }
}
