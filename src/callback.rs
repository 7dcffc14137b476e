//! Generic multi-subscriber callback registry.
//!
//! Subscribers are fired in insertion order, outside of the registry's own
//! lock, so a callback is free to re-enter the registry (add/remove another
//! subscriber, or call back into the component that owns it) without
//! deadlocking.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Slot<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Entry<T> {
    id: u64,
    func: Slot<T>,
}

/// A registry of subscribers to events of type `T`.
pub struct CallbackRegistry<T> {
    next_id: AtomicU64,
    entries: Mutex<Vec<Entry<T>>>,
}

impl<T> Default for CallbackRegistry<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }
}

impl<T> CallbackRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber, returning a handle that detaches it on `remove`.
    pub fn add<F>(&self, func: F) -> CallbackHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().unwrap().push(Entry { id, func: Arc::new(func) });
        CallbackHandle { id }
    }

    /// Detach a previously added subscriber. A no-op if already removed.
    pub fn remove(&self, handle: &CallbackHandle) {
        self.entries.lock().unwrap().retain(|e| e.id != handle.id);
    }

    /// Fire every currently-registered subscriber with `value`, in insertion order.
    ///
    /// The subscriber list is snapshotted (cheap `Arc` clones) under the lock
    /// before any callback runs, so callbacks may freely add or remove
    /// subscribers, including themselves, without deadlocking this registry.
    pub fn fire(&self, value: &T) {
        let snapshot: Vec<Slot<T>> = {
            let guard = self.entries.lock().unwrap();
            guard.iter().map(|e| e.func.clone()).collect()
        };
        for func in snapshot {
            func(value);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Opaque handle returned by [`CallbackRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackHandle {
    id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn fires_in_insertion_order() {
        let reg: CallbackRegistry<i32> = CallbackRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            reg.add(move |_| order.lock().unwrap().push(i));
        }
        reg.fire(&0);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn remove_detaches() {
        let reg: CallbackRegistry<i32> = CallbackRegistry::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let handle = reg.add(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        reg.fire(&0);
        reg.remove(&handle);
        reg.fire(&0);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_add_remove_fire_is_safe() {
        let reg = Arc::new(CallbackRegistry::<i32>::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let reg = reg.clone();
            handles.push(thread::spawn(move || {
                let h = reg.add(|_| {});
                reg.fire(&1);
                reg.remove(&h);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(reg.len(), 0);
    }
}
