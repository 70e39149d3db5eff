//! Batched delivery of consumer notifications.

use parking_lot::Mutex;

type Notification = Box<dyn FnOnce() + Send>;

/// Coalesces consumer-listener callbacks so that a batch of synchronous
/// cache mutations flushes them once, in enqueue order, instead of once per
/// mutation.
///
/// Cache-bus events never pass through here; they dispatch synchronously so
/// their causal ordering is observable. Only the callbacks handed to
/// external consumers are deferred while a batch scope is open.
pub struct NotifyManager {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    depth: usize,
    queue: Vec<Notification>,
}

impl NotifyManager {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Run `f` inside a batching scope.
    ///
    /// Notifications queued while the scope is open are delivered when the
    /// outermost scope exits; nested scopes flush nothing on their own.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.inner.lock().depth += 1;
        let result = f();
        let drained = {
            let mut inner = self.inner.lock();
            inner.depth -= 1;
            if inner.depth == 0 {
                std::mem::take(&mut inner.queue)
            } else {
                Vec::new()
            }
        };
        for notification in drained {
            notification();
        }
        result
    }

    /// Deliver `f` now, or queue it when a batch scope is open.
    pub fn notify(&self, f: impl FnOnce() + Send + 'static) {
        {
            let mut inner = self.inner.lock();
            if inner.depth > 0 {
                inner.queue.push(Box::new(f));
                return;
            }
        }
        f();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn notify_outside_batch_is_immediate() {
        let manager = NotifyManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        manager.notify(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn batch_defers_until_exit() {
        let manager = NotifyManager::new();
        let count = Arc::new(AtomicUsize::new(0));
        manager.batch(|| {
            for _ in 0..3 {
                let c = count.clone();
                manager.notify(move || {
                    c.fetch_add(1, Ordering::SeqCst);
                });
            }
            assert_eq!(count.load(Ordering::SeqCst), 0);
        });
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn nested_batches_flush_once_at_outermost_exit() {
        let manager = NotifyManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        manager.batch(|| {
            let o = order.clone();
            manager.notify(move || o.lock().push(1));
            manager.batch(|| {
                let o = order.clone();
                manager.notify(move || o.lock().push(2));
            });
            assert!(order.lock().is_empty());
            let o = order.clone();
            manager.notify(move || o.lock().push(3));
        });
        assert_eq!(*order.lock(), vec![1, 2, 3]);
    }
}
