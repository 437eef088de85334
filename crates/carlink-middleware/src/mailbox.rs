//! [`Mailbox`] – bounded, overwrite-on-full hand-off between two tasks.
//!
//! A producer never blocks: when the mailbox already holds `depth` items the
//! oldest one is dropped to make room.  With `depth == 1` this is the
//! single-slot "latest wins" frame slot; larger depths give a small amount of
//! pipelining without letting a backlog grow.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Inner<T> {
    queue: VecDeque<T>,
    closed: bool,
}

/// Bounded latest-wins mailbox with an async receive side.
///
/// Intended for one consumer task; any number of producers may push.
pub struct Mailbox<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    depth: usize,
}

impl<T> Mailbox<T> {
    /// Create a mailbox retaining at most `depth` items (minimum 1).
    pub fn new(depth: usize) -> Self {
        let depth = depth.max(1);
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::with_capacity(depth),
                closed: false,
            }),
            notify: Notify::new(),
            depth,
        }
    }

    /// A single-slot mailbox.
    pub fn slot() -> Self {
        Self::new(1)
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Store `value`, evicting the oldest entry when full.
    ///
    /// Returns the item that was not retained: the evicted entry, or `value`
    /// itself when the mailbox is closed.
    pub fn push(&self, value: T) -> Option<T> {
        let displaced = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Some(value);
            }
            let displaced = if inner.queue.len() >= self.depth {
                inner.queue.pop_front()
            } else {
                None
            };
            inner.queue.push_back(value);
            displaced
        };
        self.notify.notify_one();
        displaced
    }

    /// Take the oldest retained item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.inner.lock().queue.pop_front()
    }

    /// Take the newest retained item and discard the rest.
    ///
    /// Returns the item together with the number of older items discarded.
    pub fn take_latest(&self) -> Option<(T, usize)> {
        let mut inner = self.inner.lock();
        let latest = inner.queue.pop_back()?;
        let discarded = inner.queue.len();
        inner.queue.clear();
        Some((latest, discarded))
    }

    /// Wait for the oldest retained item.
    ///
    /// Returns `None` once the mailbox is closed and drained.  Cancel-safe:
    /// an item is only removed when the future completes.
    pub async fn recv(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(value) = inner.queue.pop_front() {
                    return Some(value);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Wait until at least one item is available, then behave like
    /// [`take_latest`][Self::take_latest].
    pub async fn recv_latest(&self) -> Option<(T, usize)> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.inner.lock();
                if let Some(latest) = inner.queue.pop_back() {
                    let discarded = inner.queue.len();
                    inner.queue.clear();
                    return Some((latest, discarded));
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }

    /// Drop every retained item, returning how many were dropped.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let n = inner.queue.len();
        inner.queue.clear();
        n
    }

    /// Refuse further pushes.  Retained items can still be received; once
    /// drained, receivers get `None`.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn slot_overwrites_unconsumed_value() {
        let slot = Mailbox::slot();
        assert_eq!(slot.push(1), None);
        assert_eq!(slot.push(2), Some(1));
        assert_eq!(slot.push(3), Some(2));
        assert_eq!(slot.len(), 1);
        assert_eq!(slot.try_pop(), Some(3));
        assert_eq!(slot.try_pop(), None);
    }

    #[test]
    fn depth_is_never_exceeded() {
        let mb = Mailbox::new(2);
        for i in 0..100 {
            mb.push(i);
            assert!(mb.len() <= 2);
        }
        assert_eq!(mb.try_pop(), Some(98));
        assert_eq!(mb.try_pop(), Some(99));
    }

    #[test]
    fn zero_depth_is_treated_as_one() {
        let mb = Mailbox::new(0);
        assert_eq!(mb.depth(), 1);
        mb.push("a");
        assert_eq!(mb.push("b"), Some("a"));
    }

    #[test]
    fn take_latest_discards_older_entries() {
        let mb = Mailbox::new(3);
        mb.push(1);
        mb.push(2);
        mb.push(3);
        assert_eq!(mb.take_latest(), Some((3, 2)));
        assert!(mb.is_empty());
        assert_eq!(mb.take_latest(), None);
    }

    #[test]
    fn closed_mailbox_rejects_pushes() {
        let mb = Mailbox::slot();
        mb.close();
        assert_eq!(mb.push(7), Some(7));
        assert!(mb.is_empty());
    }

    #[test]
    fn clear_reports_dropped_count() {
        let mb = Mailbox::new(4);
        mb.push(1);
        mb.push(2);
        assert_eq!(mb.clear(), 2);
        assert!(mb.is_empty());
    }

    #[tokio::test]
    async fn recv_waits_for_push() {
        let mb = Arc::new(Mailbox::slot());
        let producer = Arc::clone(&mb);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.push("hello");
        });
        let got = tokio::time::timeout(Duration::from_secs(2), mb.recv())
            .await
            .expect("recv must complete");
        assert_eq!(got, Some("hello"));
    }

    #[tokio::test]
    async fn recv_returns_none_after_close_and_drain() {
        let mb = Arc::new(Mailbox::new(2));
        mb.push(1);
        mb.close();
        assert_eq!(mb.recv().await, Some(1));
        assert_eq!(mb.recv().await, None);
    }

    #[tokio::test]
    async fn close_wakes_pending_receiver() {
        let mb: Arc<Mailbox<u8>> = Arc::new(Mailbox::slot());
        let closer = Arc::clone(&mb);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            closer.close();
        });
        let got = tokio::time::timeout(Duration::from_secs(2), mb.recv())
            .await
            .expect("close must wake the receiver");
        assert_eq!(got, None);
    }

    #[tokio::test]
    async fn recv_latest_returns_newest() {
        let mb = Mailbox::new(2);
        mb.push("old");
        mb.push("new");
        assert_eq!(mb.recv_latest().await, Some(("new", 1)));
    }
}
