// rust/pipeline-core/src/channel/wait_group.rs

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// Counter that lets a thread wait for a set of in-flight operations.
///
/// `add` raises the count, `done` lowers it, and `wait` blocks until it is
/// back at zero. Used to throttle shuffle sends: a worker adds one per
/// destination, every completion callback calls `done`, and the worker waits
/// before reusing its send buffers.
#[derive(Debug, Default)]
pub struct WaitGroup {
    count: Mutex<i64>,
    zero: Condvar,
}

impl WaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, delta: i64) {
        if delta == 0 {
            return;
        }
        let mut count = self.count.lock();
        *count += delta;
        debug_assert!(*count >= 0, "wait group count went negative");
        if *count <= 0 {
            self.zero.notify_all();
        }
    }

    pub fn done(&self) {
        self.add(-1);
    }

    /// Blocks until the count reaches zero.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    /// Resets the count and wakes every waiter.
    pub fn clear(&self) {
        *self.count.lock() = 0;
        self.zero.notify_all();
    }

    pub fn count(&self) -> i64 {
        *self.count.lock()
    }

    /// A one-shot callback that calls `done` on this group.
    pub fn completion(self: &Arc<Self>) -> Box<dyn FnOnce() + Send + 'static> {
        let group = Arc::clone(self);
        Box::new(move || group.done())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_returns_immediately_at_zero() {
        let group = WaitGroup::new();
        group.wait();
        assert_eq!(group.count(), 0);
    }

    #[test]
    fn test_wait_blocks_until_all_done() {
        let group = Arc::new(WaitGroup::new());
        group.add(4);

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let done = group.completion();
                thread::spawn(move || done())
            })
            .collect();

        group.wait();
        assert_eq!(group.count(), 0);
        for w in workers {
            w.join().unwrap();
        }
    }

    #[test]
    fn test_clear_releases_waiters() {
        let group = Arc::new(WaitGroup::new());
        group.add(3);

        let waiter = {
            let group = Arc::clone(&group);
            thread::spawn(move || group.wait())
        };
        group.clear();
        waiter.join().unwrap();
    }
}
