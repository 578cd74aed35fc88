//! Generic get/put pool with a fallible factory
//!
//! `get` hands out a previously returned item when one is idle, otherwise it
//! asks the factory for a fresh one. The factory returns `None` once the
//! underlying resource is exhausted.

use parking_lot::Mutex;

type Factory<T> = Box<dyn Fn() -> Option<T> + Send + Sync>;

pub struct ResourcePool<T> {
    idle: Mutex<Vec<T>>,
    max_idle: usize,
    factory: Factory<T>,
}

impl<T> ResourcePool<T> {
    /// Create a pool that retains at most `max_idle` returned items
    pub fn new(max_idle: usize, factory: impl Fn() -> Option<T> + Send + Sync + 'static) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_idle,
            factory: Box::new(factory),
        }
    }

    pub fn get(&self) -> Option<T> {
        if let Some(item) = self.idle.lock().pop() {
            return Some(item);
        }
        (self.factory)()
    }

    /// Return an item to the pool. Dropped if the pool is already full.
    pub fn put(&self, item: T) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(item);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}
