//! Fixed-capacity concurrent ring buffer.
//!
//! FIFO with overwrite-on-full: `push` appends and, when the buffer is at
//! capacity, atomically drops the oldest element. Used for the MQ inbox and
//! the chat history, both of which want "keep the last N" semantics without
//! ever blocking a producer.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

/// A clonable handle to a fixed-capacity FIFO. All operations take a short
/// internal lock; readers copy out and never hold it across user code.
#[derive(Clone)]
pub struct Ring<T> {
    inner: Arc<Mutex<VecDeque<T>>>,
    capacity: usize,
}

impl<T: Clone> Ring<T> {
    /// Create a ring holding at most `capacity` elements. A zero capacity is
    /// clamped to 1 so `push` always retains something.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append an element, evicting the oldest when full.
    pub fn push(&self, value: T) {
        let mut q = self.inner.lock();
        if q.len() == self.capacity {
            q.pop_front();
        }
        q.push_back(value);
    }

    /// Copy of the contents in insertion order (oldest first).
    pub fn snapshot(&self) -> Vec<T> {
        self.inner.lock().iter().cloned().collect()
    }

    /// Exact number of retained elements.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Remove and return everything, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.inner.lock().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_below_capacity_keeps_order() {
        let ring = Ring::new(4);
        for i in 0..3 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.snapshot(), vec![0, 1, 2]);
    }

    #[test]
    fn overflow_drops_oldest() {
        let ring = Ring::new(3);
        for i in 0..7 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.snapshot(), vec![4, 5, 6]);
    }

    #[test]
    fn len_is_min_of_pushes_and_capacity() {
        for cap in [1usize, 2, 5, 16] {
            for n in [0usize, 1, 4, 20] {
                let ring = Ring::new(cap);
                for i in 0..n {
                    ring.push(i);
                }
                assert_eq!(ring.len(), n.min(cap), "cap={cap} n={n}");
            }
        }
    }

    #[test]
    fn drain_empties() {
        let ring = Ring::new(2);
        ring.push("a");
        ring.push("b");
        assert_eq!(ring.drain(), vec!["a", "b"]);
        assert!(ring.is_empty());
    }

    #[test]
    fn concurrent_writers_never_exceed_capacity() {
        let ring = Ring::new(8);
        let mut handles = Vec::new();
        for t in 0..4 {
            let r = ring.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..500 {
                    r.push(t * 1000 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(ring.len(), 8);
    }
}
