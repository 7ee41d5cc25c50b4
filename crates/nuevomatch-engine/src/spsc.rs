//! Bounded single-producer/single-consumer ring
//!
//! The job queue between a dispatcher and a parallel worker. Capacity is a
//! power of two so slot selection is `index & (capacity - 1)`. The producer
//! side never blocks: a full ring is reported back as the backpressure
//! signal.

use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

struct Inner<T> {
    mask: usize,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Next slot the consumer reads
    head: CachePadded<AtomicUsize>,
    /// Next slot the producer writes
    tail: CachePadded<AtomicUsize>,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let head = *self.head.get_mut();
        let tail = *self.tail.get_mut();
        for index in head..tail {
            let slot = &mut self.slots[index & self.mask];
            unsafe { slot.get_mut().assume_init_drop() };
        }
    }
}

/// Producing half of the ring; owned by the dispatcher
pub struct Producer<T> {
    inner: Arc<Inner<T>>,
}

/// Consuming half of the ring; owned by the worker processing unit
pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
}

/// Create a bounded SPSC ring.
///
/// # Panics
///
/// Panics if `capacity` is zero or not a power of two; callers validate the
/// configured queue size before reaching this point.
pub fn channel<T: Send>(capacity: usize) -> (Producer<T>, Consumer<T>) {
    assert!(
        capacity.is_power_of_two() && capacity > 0,
        "ring capacity must be a power of two"
    );
    let slots = (0..capacity)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect();
    let inner = Arc::new(Inner {
        mask: capacity - 1,
        slots,
        head: CachePadded::new(AtomicUsize::new(0)),
        tail: CachePadded::new(AtomicUsize::new(0)),
    });
    (
        Producer {
            inner: inner.clone(),
        },
        Consumer { inner },
    )
}

impl<T> Producer<T> {
    /// Try to enqueue without blocking; a full ring hands the value back
    #[inline]
    pub fn try_push(&mut self, value: T) -> Result<(), T> {
        let inner = &*self.inner;
        let tail = inner.tail.load(Ordering::Relaxed);
        let head = inner.head.load(Ordering::Acquire);
        if tail - head > inner.mask {
            return Err(value);
        }
        unsafe {
            (*inner.slots[tail & inner.mask].get()).write(value);
        }
        inner.tail.store(tail + 1, Ordering::Release);
        Ok(())
    }

    /// Ring capacity
    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.inner.mask + 1
    }
}

impl<T> Consumer<T> {
    /// Try to dequeue without blocking
    #[inline]
    pub fn try_pop(&mut self) -> Option<T> {
        let inner = &*self.inner;
        let head = inner.head.load(Ordering::Relaxed);
        let tail = inner.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let value = unsafe { (*inner.slots[head & inner.mask].get()).assume_init_read() };
        inner.head.store(head + 1, Ordering::Release);
        Some(value)
    }

    /// Whether the ring currently holds no jobs
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        let inner = &*self.inner;
        inner.head.load(Ordering::Relaxed) == inner.tail.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let (mut tx, mut rx) = channel::<u32>(8);
        for i in 0..5 {
            tx.try_push(i).unwrap();
        }
        for i in 0..5 {
            assert_eq!(rx.try_pop(), Some(i));
        }
        assert_eq!(rx.try_pop(), None);
    }

    #[test]
    fn test_full_ring_rejects() {
        let (mut tx, mut rx) = channel::<u32>(4);
        for i in 0..4 {
            tx.try_push(i).unwrap();
        }
        // Capacity + 1'th push must fail without enqueueing
        assert_eq!(tx.try_push(99), Err(99));

        // Draining one slot admits exactly one more
        assert_eq!(rx.try_pop(), Some(0));
        tx.try_push(4).unwrap();
        assert_eq!(tx.try_push(5), Err(5));
    }

    #[test]
    fn test_wraparound() {
        let (mut tx, mut rx) = channel::<u64>(2);
        for round in 0..100u64 {
            tx.try_push(round).unwrap();
            tx.try_push(round + 1000).unwrap();
            assert_eq!(rx.try_pop(), Some(round));
            assert_eq!(rx.try_pop(), Some(round + 1000));
        }
        assert!(rx.is_empty());
    }

    #[test]
    fn test_cross_thread_transfer() {
        let (mut tx, mut rx) = channel::<u64>(64);
        let producer = std::thread::spawn(move || {
            let mut sent = 0u64;
            while sent < 10_000 {
                if tx.try_push(sent).is_ok() {
                    sent += 1;
                } else {
                    std::hint::spin_loop();
                }
            }
        });

        let mut expected = 0u64;
        while expected < 10_000 {
            if let Some(value) = rx.try_pop() {
                assert_eq!(value, expected);
                expected += 1;
            } else {
                std::hint::spin_loop();
            }
        }
        producer.join().unwrap();
    }

    #[test]
    fn test_drop_releases_undelivered_jobs() {
        let payload = Arc::new(());
        {
            let (mut tx, _rx) = channel::<Arc<()>>(4);
            tx.try_push(payload.clone()).unwrap();
            tx.try_push(payload.clone()).unwrap();
        }
        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    #[should_panic(expected = "power of two")]
    fn test_non_power_of_two_capacity_panics() {
        let _ = channel::<u32>(6);
    }
}
