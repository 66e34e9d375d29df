use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use sitrep_core::types::NormalizedMessage;

/// Bounded FIFO of messages awaiting extraction. Overflow evicts from the
/// front — the oldest message — never the newest.
#[derive(Debug)]
pub struct PendingQueue {
    capacity: usize,
    items: VecDeque<NormalizedMessage>,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    /// Append a message, evicting the oldest if the queue is full.
    /// Returns the number of messages dropped (0 or 1).
    pub fn push(&mut self, msg: NormalizedMessage) -> usize {
        let mut dropped = 0;
        while self.items.len() >= self.capacity {
            self.items.pop_front();
            dropped += 1;
        }
        self.items.push_back(msg);
        dropped
    }

    /// Seconds since the oldest unbatched message arrived.
    pub fn oldest_age_secs(&self, now: DateTime<Utc>) -> Option<i64> {
        self.items
            .front()
            .map(|m| (now - m.arrived_at).num_seconds())
    }

    /// Remove and return up to `n` messages from the front.
    pub fn take_batch(&mut self, n: usize) -> Vec<NormalizedMessage> {
        let take = n.min(self.items.len());
        self.items.drain(..take).collect()
    }

    /// Put messages back at the front, preserving their order.
    pub fn restore_front(&mut self, msgs: Vec<NormalizedMessage>) {
        for msg in msgs.into_iter().rev() {
            self.items.push_front(msg);
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitrep_core::normalize::fingerprint;
    use sitrep_core::types::{Lang, SourceClass, SourceId};

    fn msg(id: i64, at: DateTime<Utc>) -> NormalizedMessage {
        let text = format!("message {}", id);
        NormalizedMessage {
            source_id: SourceId::from("alpha"),
            source_class: SourceClass::Arab,
            message_id: id,
            arrived_at: at,
            hash: fingerprint(&text),
            text_norm: text,
            lang_guess: Lang::Latin,
            empty: false,
            reply_to: None,
        }
    }

    #[test]
    fn overflow_drops_oldest_never_newest() {
        let now = Utc::now();
        let mut queue = PendingQueue::new(512);
        let mut dropped = 0;
        for id in 0..1000 {
            dropped += queue.push(msg(id, now));
        }
        assert_eq!(dropped, 488);
        assert_eq!(queue.len(), 512);
        // the survivors are exactly the newest 512
        let batch = queue.take_batch(512);
        assert_eq!(batch.first().unwrap().message_id, 488);
        assert_eq!(batch.last().unwrap().message_id, 999);
    }

    #[test]
    fn take_batch_preserves_fifo_order() {
        let now = Utc::now();
        let mut queue = PendingQueue::new(16);
        for id in 0..5 {
            queue.push(msg(id, now));
        }
        let batch = queue.take_batch(3);
        let ids: Vec<i64> = batch.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn restore_front_keeps_order() {
        let now = Utc::now();
        let mut queue = PendingQueue::new(16);
        for id in 0..4 {
            queue.push(msg(id, now));
        }
        let batch = queue.take_batch(2);
        queue.restore_front(batch);
        let ids: Vec<i64> = queue.take_batch(4).iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn oldest_age_tracks_front() {
        let now = Utc::now();
        let mut queue = PendingQueue::new(16);
        assert_eq!(queue.oldest_age_secs(now), None);
        queue.push(msg(1, now - chrono::Duration::seconds(45)));
        queue.push(msg(2, now));
        assert_eq!(queue.oldest_age_secs(now), Some(45));
    }
}
