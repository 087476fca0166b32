//! Wait-free single-producer/single-consumer latest-value slot.
//!
//! Publishes the most recent microphone observation for external observers
//! without blocking the audio thread. Two storage slots alternate on the low
//! bit of a monotonically increasing sequence number: the publisher writes
//! the slot the *next* sequence selects, then release-stores the sequence;
//! the consumer acquire-loads the sequence and reads the matching slot. The
//! publisher never rewrites a slot until the following publish flips to the
//! other one, so a reader that saw sequence `s` cannot observe a torn value.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Double-buffered latest-value publisher.
///
/// Wait-free for both sides. The safety argument requires the SPSC
/// discipline: at most one thread publishing and at most one thread
/// consuming (`try_read`/`read_latest` share one read cursor).
pub struct LatestSlot<T> {
    buf: [UnsafeCell<T>; 2],
    seq: AtomicU64,
    last_read_seq: AtomicU64,
}

// A value is only read from a slot the publisher is guaranteed not to be
// writing (see module docs), and T is plain copyable data.
unsafe impl<T: Copy + Send> Sync for LatestSlot<T> {}

impl<T: Copy> LatestSlot<T> {
    pub fn new(initial: T) -> Self {
        Self {
            buf: [UnsafeCell::new(initial), UnsafeCell::new(initial)],
            seq: AtomicU64::new(0),
            last_read_seq: AtomicU64::new(0),
        }
    }

    fn slot_for(seq: u64) -> usize {
        (seq & 1) as usize
    }

    /// Publish a new value (producer side).
    pub fn publish(&self, value: T) {
        let next = self.seq.load(Ordering::Relaxed) + 1;
        unsafe {
            *self.buf[Self::slot_for(next)].get() = value;
        }
        self.seq.store(next, Ordering::Release);
    }

    /// Return the latest value iff one has been published since the last
    /// successful read (consumer side).
    pub fn try_read(&self) -> Option<T> {
        let s = self.seq.load(Ordering::Acquire);
        if s == self.last_read_seq.load(Ordering::Relaxed) {
            return None;
        }
        let value = unsafe { *self.buf[Self::slot_for(s)].get() };
        self.last_read_seq.store(s, Ordering::Relaxed);
        Some(value)
    }

    /// Return the latest value unconditionally and mark it read.
    pub fn read_latest(&self) -> T {
        let s = self.seq.load(Ordering::Acquire);
        let value = unsafe { *self.buf[Self::slot_for(s)].get() };
        self.last_read_seq.store(s, Ordering::Relaxed);
        value
    }

    /// Sequence number of the most recent publish (0 before the first).
    pub fn sequence(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_empty_slot_returns_none() {
        let slot = LatestSlot::new(0u32);
        assert_eq!(slot.try_read(), None);
        assert_eq!(slot.sequence(), 0);
    }

    #[test]
    fn test_try_read_returns_latest_then_none() {
        let slot = LatestSlot::new(0u32);
        for value in 1..=10 {
            slot.publish(value);
        }
        assert_eq!(slot.try_read(), Some(10));
        assert_eq!(slot.try_read(), None);

        slot.publish(11);
        assert_eq!(slot.try_read(), Some(11));
    }

    #[test]
    fn test_read_latest_always_returns_current() {
        let slot = LatestSlot::new(5i64);
        assert_eq!(slot.read_latest(), 5);

        slot.publish(7);
        assert_eq!(slot.read_latest(), 7);
        assert_eq!(slot.read_latest(), 7);
        // read_latest also consumes the "new" flag.
        assert_eq!(slot.try_read(), None);
    }

    #[test]
    fn test_publishes_are_observed_in_order_across_threads() {
        const ROUNDS: u64 = 10_000;
        let slot = Arc::new(LatestSlot::new(0u64));

        let producer = {
            let slot = Arc::clone(&slot);
            std::thread::spawn(move || {
                for value in 1..=ROUNDS {
                    slot.publish(value);
                }
            })
        };

        let mut last_seen = 0u64;
        while last_seen < ROUNDS {
            if let Some(value) = slot.try_read() {
                assert!(value > last_seen, "went backwards: {value} <= {last_seen}");
                last_seen = value;
            }
        }
        producer.join().unwrap();
    }
}
