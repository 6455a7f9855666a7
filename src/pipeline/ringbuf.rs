//! Bounded FIFO backing the delay and replay buffers

use ringbuf::traits::{Consumer, Observer, Producer, RingBuffer as _};
use ringbuf::HeapRb;

/// Fixed-capacity FIFO that evicts its oldest element on overflow
///
/// Capacity zero is allowed and yields a buffer that stays empty.
pub struct RingBuffer<T> {
    ring: Option<HeapRb<T>>,
    stats: Stats,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub pushed: u64,
    pub evicted: u64,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: (capacity > 0).then(|| HeapRb::new(capacity)),
            stats: Stats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.as_ref().map_or(0, |ring| ring.capacity().get())
    }

    pub fn len(&self) -> usize {
        self.ring.as_ref().map_or(0, |ring| ring.occupied_len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity()
    }

    /// Append, evicting the oldest element when full
    pub fn push(&mut self, item: T) {
        self.stats.pushed += 1;
        match self.ring.as_mut() {
            Some(ring) => {
                if ring.push_overwrite(item).is_some() {
                    self.stats.evicted += 1;
                }
            }
            None => self.stats.evicted += 1,
        }
    }

    pub fn oldest(&self) -> Option<&T> {
        self.ring.as_ref()?.iter().next()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.ring.iter().flat_map(|ring| ring.iter())
    }

    /// Change capacity, keeping the most recent `min(len, new_capacity)` elements
    pub fn resize(&mut self, new_capacity: usize) {
        if new_capacity == self.capacity() {
            return;
        }
        self.replace_storage(Self::new(new_capacity));
    }

    /// Adopt the storage of the empty buffer `next`, carrying over as many
    /// of the most recent elements as it holds. Counters are kept.
    pub fn replace_storage(&mut self, next: RingBuffer<T>) {
        let mut next = next.ring;
        let new_capacity = next.as_ref().map_or(0, |ring| ring.capacity().get());
        if let Some(mut old) = self.ring.take() {
            let mut surplus = old.occupied_len().saturating_sub(new_capacity);
            while let Some(item) = old.try_pop() {
                if surplus > 0 {
                    surplus -= 1;
                    self.stats.evicted += 1;
                    continue;
                }
                if let Some(ring) = next.as_mut() {
                    // cannot overflow: surplus was dropped above
                    let _ = ring.try_push(item);
                }
            }
        }
        self.ring = next;
    }

    pub fn clear(&mut self) {
        if let Some(ring) = self.ring.as_mut() {
            Consumer::clear(ring);
        }
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }
}

impl<T: Clone> RingBuffer<T> {
    /// Copy of the current contents, oldest first
    pub fn snapshot(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}
