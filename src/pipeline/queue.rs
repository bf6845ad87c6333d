use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::errors::{RelayError, Result};

/// Unbounded FIFO feeding the encoder worker.
///
/// Lifecycle tasks must never be dropped, so unlike a frame ring this queue
/// has no capacity limit; backlog is controlled with `purge` instead.
pub struct TaskQueue<T> {
    inner: Mutex<QueueInner<T>>,
    cv: Condvar,
}

struct QueueInner<T> {
    items: VecDeque<T>,
    closed: bool,
}

impl<T> TaskQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Append a task. Returns `false` if the queue has been closed.
    pub fn push(&self, item: T) -> bool {
        let mut g = self.inner.lock().expect("lock poisoned");
        if g.closed {
            return false;
        }
        g.items.push_back(item);
        self.cv.notify_one();
        true
    }

    /// Wait up to `timeout` for the next task.
    ///
    /// Queued tasks are still handed out after `close`; the error is only
    /// returned once a closed queue is empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Result<Option<T>> {
        let mut g = self.inner.lock().expect("lock poisoned");

        if timeout == Duration::ZERO {
            return Ok(g.items.pop_front());
        }

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(item) = g.items.pop_front() {
                return Ok(Some(item));
            }
            if g.closed {
                return Err(RelayError::WorkerUnavailable("task queue closed".to_string()));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let remaining = deadline - now;
            let (ng, _) = self.cv.wait_timeout(g, remaining).expect("lock poisoned");
            g = ng;
        }
    }

    /// Remove every queued task matching `pred`. Returns how many were removed.
    pub fn purge<F>(&self, pred: F) -> usize
    where
        F: Fn(&T) -> bool,
    {
        let mut g = self.inner.lock().expect("lock poisoned");
        let before = g.items.len();
        g.items.retain(|item| !pred(item));
        before - g.items.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").items.len()
    }

    pub fn close(&self) {
        let mut g = self.inner.lock().expect("lock poisoned");
        g.closed = true;
        self.cv.notify_all();
    }
}

impl<T> Default for TaskQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let q = TaskQueue::new();
        for i in 0..5 {
            assert!(q.push(i));
        }
        let popped: Vec<i32> = (0..5)
            .map(|_| q.pop_timeout(Duration::ZERO).unwrap().unwrap())
            .collect();
        assert_eq!(popped, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_purge_keeps_order_of_survivors() {
        let q = TaskQueue::new();
        for i in 0..10 {
            q.push(i);
        }
        assert_eq!(q.purge(|i| i % 2 == 0), 5);
        assert_eq!(q.len(), 5);
        assert_eq!(q.pop_timeout(Duration::ZERO).unwrap(), Some(1));
        assert_eq!(q.pop_timeout(Duration::ZERO).unwrap(), Some(3));
    }

    #[test]
    fn test_pop_times_out() {
        let q: TaskQueue<u8> = TaskQueue::new();
        let start = Instant::now();
        assert_eq!(q.pop_timeout(Duration::from_millis(20)).unwrap(), None);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_close_drains_then_errors() {
        let q = TaskQueue::new();
        q.push(1);
        q.close();
        assert!(!q.push(2));
        assert_eq!(q.pop_timeout(Duration::from_millis(5)).unwrap(), Some(1));
        assert!(q.pop_timeout(Duration::from_millis(5)).is_err());
    }

    #[test]
    fn test_push_wakes_waiting_consumer() {
        let q = Arc::new(TaskQueue::new());
        let consumer = {
            let q = q.clone();
            std::thread::spawn(move || q.pop_timeout(Duration::from_secs(2)))
        };
        std::thread::sleep(Duration::from_millis(20));
        q.push(7u32);
        assert_eq!(consumer.join().unwrap().unwrap(), Some(7));
    }
}
