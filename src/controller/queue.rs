use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard};

/// Deduplicating FIFO of pending reconcile keys
///
/// A key that is already waiting is not queued twice, so any number of
/// watch notifications for one object collapse into a single reconcile.
#[derive(Debug)]
pub struct WorkQueue<T> {
    inner: Mutex<QueueInner<T>>,
}

#[derive(Debug)]
struct QueueInner<T> {
    queued: HashSet<T>,
    order: VecDeque<T>,
}

impl<T> Default for WorkQueue<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                queued: HashSet::new(),
                order: VecDeque::new(),
            }),
        }
    }
}

impl<T: Eq + Hash + Clone> WorkQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner<T>> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue `item`; returns false if it was already waiting
    pub fn add(&self, item: T) -> bool {
        let mut inner = self.lock();
        if !inner.queued.insert(item.clone()) {
            return false;
        }
        inner.order.push_back(item);
        true
    }

    /// Pop the oldest item
    pub fn get(&self) -> Option<T> {
        let mut inner = self.lock();
        let item = inner.order.pop_front()?;
        inner.queued.remove(&item);
        Some(item)
    }

    pub fn len(&self) -> usize {
        self.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
