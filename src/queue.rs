use crossbeam_channel::{Receiver, Sender, TrySendError};

/// Bounded hand-off queue. Pushing never blocks: when full, the oldest item is
/// thrown away to make room. Popping never blocks either; `None` just means
/// nothing new has arrived.
///
/// Cloning gives another handle to the same queue.
pub struct DropOldestQueue<T> {
    tx: Sender<T>,
    rx: Receiver<T>,
}

impl<T> Clone for DropOldestQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
        }
    }
}

impl<T> DropOldestQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded(capacity.max(1));
        Self { tx, rx }
    }

    /// Insert `item`, evicting the oldest entry if needed. Returns `true` when
    /// something was dropped.
    pub fn push(&self, item: T) -> bool {
        let mut item = item;
        let mut dropped = false;
        // A concurrent producer can refill the slot we just freed, so retry.
        // Each round removes one item, which bounds the loop by the capacity.
        for _ in 0..=self.capacity() {
            match self.tx.try_send(item) {
                Ok(()) => return dropped,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    dropped |= self.rx.try_recv().is_ok();
                }
                Err(TrySendError::Disconnected(_)) => return true,
            }
        }
        true
    }

    #[cfg(test)]
    pub fn pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Empty the queue and return the most recent item, if any.
    pub fn pop_latest(&self) -> Option<T> {
        let mut latest = None;
        while let Ok(item) = self.rx.try_recv() {
            latest = Some(item);
        }
        latest
    }

    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn capacity(&self) -> usize {
        self.tx.capacity().unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_queue_drops_oldest() {
        let q = DropOldestQueue::new(3);
        assert!(!q.push(1));
        assert!(!q.push(2));
        assert!(!q.push(3));
        assert!(q.push(4));
        assert_eq!(q.len(), 3);
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), Some(4));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn pop_latest_drains_everything() {
        let q = DropOldestQueue::new(10);
        for i in 0..5 {
            q.push(i);
        }
        assert_eq!(q.pop_latest(), Some(4));
        assert_eq!(q.len(), 0);
        assert_eq!(q.pop_latest(), None);
    }

    #[test]
    fn clones_share_storage() {
        let producer = DropOldestQueue::new(2);
        let consumer = producer.clone();
        producer.push("a");
        producer.push("b");
        producer.push("c");
        assert_eq!(consumer.pop(), Some("b"));
        consumer.clear();
        assert_eq!(producer.pop(), None);
    }

    #[test]
    fn zero_capacity_is_treated_as_one() {
        let q = DropOldestQueue::new(0);
        q.push(1);
        q.push(2);
        assert_eq!(q.capacity(), 1);
        assert_eq!(q.pop(), Some(2));
    }
}
