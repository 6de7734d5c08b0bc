//! In-process queue with real visibility-timeout semantics.
//!
//! Single-process deployments run on this implementation; it also backs the
//! integration tests, where short visibility timeouts exercise the redelivery
//! and dead-letter paths without an external broker.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{JobQueue, QueueError, QueueMessage};

const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct Entry {
    message_id: String,
    body: String,
    attributes: Vec<(String, String)>,
    /// Hidden from consumers until this instant; `None` means visible now.
    invisible_until: Option<Instant>,
    /// Bumped on every delivery; the receipt handle encodes it so stale
    /// handles from an earlier delivery cannot delete a redelivered message.
    delivery_seq: u64,
}

/// A message copied to the dead-letter queue with its final error.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub body: String,
    pub error: String,
}

#[derive(Debug, Default)]
struct State {
    entries: VecDeque<Entry>,
    dead_letters: Vec<DeadLetter>,
}

/// Shared in-process queue handle.
#[derive(Clone)]
pub struct MemoryQueue {
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
    next_id: Arc<AtomicU64>,
    visibility_timeout: Duration,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        debug_assert!(visibility_timeout > Duration::ZERO);
        Self {
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
            next_id: Arc::new(AtomicU64::new(1)),
            visibility_timeout,
        }
    }

    /// Snapshot of the dead-letter queue, for inspection by tests and
    /// operator tooling.
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Number of messages currently on the main queue, visible or not.
    pub async fn depth(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    fn receipt(entry: &Entry) -> String {
        format!("{}#{}", entry.message_id, entry.delivery_seq)
    }

    fn parse_receipt(receipt: &str) -> Option<(&str, u64)> {
        let (id, seq) = receipt.rsplit_once('#')?;
        Some((id, seq.parse().ok()?))
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn send(
        &self,
        body: String,
        attributes: Vec<(String, String)>,
    ) -> Result<String, QueueError> {
        let message_id = format!("msg-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = self.state.lock().await;
        state.entries.push_back(Entry {
            message_id: message_id.clone(),
            body,
            attributes,
            invisible_until: None,
            delivery_seq: 0,
        });
        drop(state);
        self.notify.notify_waiters();
        Ok(message_id)
    }

    async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<QueueMessage>, QueueError> {
        debug_assert!(max >= 1);
        let deadline = Instant::now() + wait;

        loop {
            {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                let mut delivered = Vec::new();
                for entry in state.entries.iter_mut() {
                    if delivered.len() >= max {
                        break;
                    }
                    let visible = entry.invisible_until.map_or(true, |until| until <= now);
                    if !visible {
                        continue;
                    }
                    entry.invisible_until = Some(now + self.visibility_timeout);
                    entry.delivery_seq += 1;
                    delivered.push(QueueMessage {
                        message_id: entry.message_id.clone(),
                        receipt: Self::receipt(entry),
                        body: entry.body.clone(),
                        attributes: entry.attributes.clone(),
                    });
                }
                if !delivered.is_empty() {
                    return Ok(delivered);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            // Wake on new sends, but poll periodically as well so messages
            // whose visibility timeout lapses mid-wait are picked up.
            let nap = RECEIVE_POLL_INTERVAL.min(deadline - now);
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn delete(&self, receipt: &str) -> Result<(), QueueError> {
        let Some((message_id, seq)) = Self::parse_receipt(receipt) else {
            return Err(QueueError::StaleReceipt(receipt.to_string()));
        };
        let mut state = self.state.lock().await;
        let position = state
            .entries
            .iter()
            .position(|entry| entry.message_id == message_id);
        if let Some(idx) = position {
            if state.entries[idx].delivery_seq == seq {
                state.entries.remove(idx);
            } else {
                tracing::warn!(
                    message_id,
                    "stale receipt ignored; message already redelivered"
                );
            }
        }
        Ok(())
    }

    async fn send_dlq(&self, body: String, error: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        state.dead_letters.push(DeadLetter {
            body,
            error: error.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_receive_delete_round_trip() {
        let queue = MemoryQueue::new(Duration::from_secs(300));
        queue.send("one".to_string(), Vec::new()).await.expect("send");

        let messages = queue
            .receive(1, Duration::from_millis(10))
            .await
            .expect("receive");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "one");

        queue.delete(&messages[0].receipt).await.expect("delete");
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test]
    async fn received_message_is_hidden_until_visibility_expires() {
        tokio::time::pause();
        let queue = MemoryQueue::new(Duration::from_secs(30));
        queue.send("work".to_string(), Vec::new()).await.expect("send");

        let first = queue
            .receive(1, Duration::from_millis(10))
            .await
            .expect("receive");
        assert_eq!(first.len(), 1);

        // Hidden while the visibility timeout is running.
        let during = queue
            .receive(1, Duration::from_millis(10))
            .await
            .expect("receive during visibility");
        assert!(during.is_empty());

        tokio::time::advance(Duration::from_secs(31)).await;
        let redelivered = queue
            .receive(1, Duration::from_millis(100))
            .await
            .expect("receive after expiry");
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].body, "work");
        assert_ne!(redelivered[0].receipt, first[0].receipt);
    }

    #[tokio::test]
    async fn stale_receipt_does_not_delete_redelivered_message() {
        tokio::time::pause();
        let queue = MemoryQueue::new(Duration::from_secs(10));
        queue.send("work".to_string(), Vec::new()).await.expect("send");

        let first = queue
            .receive(1, Duration::from_millis(10))
            .await
            .expect("first delivery");
        tokio::time::advance(Duration::from_secs(11)).await;
        let second = queue
            .receive(1, Duration::from_millis(100))
            .await
            .expect("second delivery");
        assert_eq!(second.len(), 1);

        // The first handle is stale now; deleting with it must be a no-op.
        queue.delete(&first[0].receipt).await.expect("stale delete");
        assert_eq!(queue.depth().await, 1);

        queue.delete(&second[0].receipt).await.expect("live delete");
        assert_eq!(queue.depth().await, 0);
    }

    #[tokio::test]
    async fn dead_letters_accumulate() {
        let queue = MemoryQueue::new(Duration::from_secs(300));
        queue
            .send_dlq("{\"jobId\":\"j1\"}".to_string(), "vision backend down")
            .await
            .expect("dlq send");
        let letters = queue.dead_letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].error, "vision backend down");
    }

    #[tokio::test]
    async fn long_poll_returns_message_sent_mid_wait() {
        let queue = MemoryQueue::new(Duration::from_secs(300));
        let receiver = queue.clone();
        let handle =
            tokio::spawn(async move { receiver.receive(1, Duration::from_secs(5)).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.send("late".to_string(), Vec::new()).await.expect("send");

        let messages = handle.await.expect("join").expect("receive");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "late");
    }
}
