use std::collections::VecDeque;

/// Fixed-capacity FIFO buffer. Pushing onto a full buffer evicts the oldest
/// element, so memory stays bounded under any producer rate.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    items: VecDeque<T>,
    capacity: usize,
    evicted: u64,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    /// Append an element, returning the evicted oldest element if the buffer
    /// was full.
    pub fn push(&mut self, item: T) -> Option<T> {
        let evicted = if self.items.len() == self.capacity {
            self.evicted = self.evicted.saturating_add(1);
            self.items.pop_front()
        } else {
            None
        };
        self.items.push_back(item);
        evicted
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of elements evicted since creation.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn front(&self) -> Option<&T> {
        self.items.front()
    }

    pub fn back(&self) -> Option<&T> {
        self.items.back()
    }

    /// Iterate oldest to newest.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> RingBuffer<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::RingBuffer;

    #[test]
    fn eviction_is_fifo_and_bounded() {
        let mut rb = RingBuffer::new(3);
        for i in 0..10 {
            let evicted = rb.push(i);
            assert!(rb.len() <= 3);
            if i >= 3 {
                assert_eq!(evicted, Some(i - 3));
            } else {
                assert_eq!(evicted, None);
            }
        }
        assert_eq!(rb.to_vec(), vec![7, 8, 9]);
        assert_eq!(rb.evicted(), 7);
        assert_eq!(rb.front(), Some(&7));
        assert_eq!(rb.back(), Some(&9));
    }

    #[test]
    fn contents_always_equal_most_recent_window() {
        for capacity in [1usize, 2, 5, 64] {
            let mut rb = RingBuffer::new(capacity);
            for n in 1..=200usize {
                rb.push(n);
                let expected: Vec<usize> = (n.saturating_sub(capacity) + 1..=n).collect();
                assert_eq!(rb.to_vec(), expected);
            }
        }
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut rb = RingBuffer::new(0);
        rb.push("a");
        rb.push("b");
        assert_eq!(rb.capacity(), 1);
        assert_eq!(rb.to_vec(), vec!["b"]);
    }
}
