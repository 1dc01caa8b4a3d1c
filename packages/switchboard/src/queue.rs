//! FIFO buffer for envelopes sent while the connection is not open.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::envelope::Envelope;

/// What to discard when a bounded queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Evict the head to make room for the new envelope.
    #[default]
    DropOldest,
    /// Keep what is queued and discard the new envelope.
    DropNewest,
}

/// An envelope waiting for the connection to open.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub envelope: Envelope,
    pub enqueued_at: Instant,
}

/// Outbound envelopes held while disconnected, flushed in enqueue order.
pub struct OutboundQueue {
    buffer: VecDeque<QueuedMessage>,
    capacity: Option<usize>,
    policy: OverflowPolicy,
    dropped: u64,
}

impl OutboundQueue {
    pub fn unbounded() -> Self {
        Self {
            buffer: VecDeque::new(),
            capacity: None,
            policy: OverflowPolicy::default(),
            dropped: 0,
        }
    }

    pub fn bounded(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            capacity: Some(capacity),
            policy,
            ..Self::unbounded()
        }
    }

    /// Append at the tail. Returns the envelope discarded to respect the
    /// capacity, if any.
    pub fn enqueue(&mut self, envelope: Envelope) -> Option<Envelope> {
        let Some(capacity) = self.capacity else {
            self.push(envelope);
            return None;
        };

        if capacity == 0 {
            self.dropped += 1;
            return Some(envelope);
        }

        if self.buffer.len() < capacity {
            self.push(envelope);
            return None;
        }

        self.dropped += 1;
        match self.policy {
            OverflowPolicy::DropNewest => Some(envelope),
            OverflowPolicy::DropOldest => {
                let evicted = self.buffer.pop_front().map(|m| m.envelope);
                self.push(envelope);
                evicted
            }
        }
    }

    /// Hand envelopes to `sender` head first. An envelope leaves the queue only
    /// once `sender` accepts it; on the first failure the rest stay queued in
    /// order and the error is returned.
    pub fn flush<E>(
        &mut self,
        mut sender: impl FnMut(&Envelope) -> Result<(), E>,
    ) -> Result<usize, E> {
        let mut sent = 0;
        while let Some(head) = self.buffer.front() {
            sender(&head.envelope)?;
            self.buffer.pop_front();
            sent += 1;
        }
        Ok(sent)
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Total envelopes discarded by the overflow policy.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// When the oldest queued envelope was enqueued.
    pub fn oldest(&self) -> Option<Instant> {
        self.buffer.front().map(|m| m.enqueued_at)
    }

    fn push(&mut self, envelope: Envelope) {
        self.buffer.push_back(QueuedMessage {
            envelope,
            enqueued_at: Instant::now(),
        });
    }
}

impl Default for OutboundQueue {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ping(n: u64) -> Envelope {
        Envelope::new("ping", json!({ "n": n }))
    }

    fn seq(envelope: &Envelope) -> u64 {
        envelope.data()["n"].as_u64().unwrap()
    }

    #[test]
    fn flush_preserves_order() {
        let mut queue = OutboundQueue::unbounded();
        for n in 1..=3 {
            queue.enqueue(ping(n));
        }

        let mut seen = Vec::new();
        let sent = queue
            .flush(|env| {
                seen.push(seq(env));
                Ok::<_, ()>(())
            })
            .unwrap();

        assert_eq!(sent, 3);
        assert_eq!(seen, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn failure_mid_flush_keeps_remainder() {
        let mut queue = OutboundQueue::unbounded();
        for n in 1..=5 {
            queue.enqueue(ping(n));
        }

        let mut seen = Vec::new();
        let result = queue.flush(|env| {
            if seq(env) == 3 {
                return Err("socket gone");
            }
            seen.push(seq(env));
            Ok(())
        });

        assert_eq!(result, Err("socket gone"));
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(queue.len(), 3);

        // Retrying resumes at the failed envelope, nothing is sent twice
        let mut resumed = Vec::new();
        queue
            .flush(|env| {
                resumed.push(seq(env));
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(resumed, vec![3, 4, 5]);
    }

    #[test]
    fn flush_empty_is_noop() {
        let mut queue = OutboundQueue::unbounded();
        let sent = queue.flush(|_| Err::<(), _>("never called")).unwrap();
        assert_eq!(sent, 0);
    }

    #[test]
    fn drop_oldest_evicts_head() {
        let mut queue = OutboundQueue::bounded(2, OverflowPolicy::DropOldest);
        assert!(queue.enqueue(ping(1)).is_none());
        assert!(queue.enqueue(ping(2)).is_none());

        let evicted = queue.enqueue(ping(3)).unwrap();
        assert_eq!(seq(&evicted), 1);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);

        let mut seen = Vec::new();
        queue
            .flush(|env| {
                seen.push(seq(env));
                Ok::<_, ()>(())
            })
            .unwrap();
        assert_eq!(seen, vec![2, 3]);
    }

    #[test]
    fn drop_newest_rejects_incoming() {
        let mut queue = OutboundQueue::bounded(2, OverflowPolicy::DropNewest);
        queue.enqueue(ping(1));
        queue.enqueue(ping(2));

        let rejected = queue.enqueue(ping(3)).unwrap();
        assert_eq!(seq(&rejected), 3);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);
    }

    #[test]
    fn zero_capacity_keeps_nothing() {
        let mut queue = OutboundQueue::bounded(0, OverflowPolicy::DropOldest);
        assert!(queue.enqueue(ping(1)).is_some());
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn records_enqueue_time() {
        let mut queue = OutboundQueue::unbounded();
        let before = Instant::now();
        queue.enqueue(ping(1));
        tokio::time::advance(std::time::Duration::from_secs(3)).await;
        queue.enqueue(ping(2));

        assert_eq!(queue.oldest(), Some(before));
    }
}
