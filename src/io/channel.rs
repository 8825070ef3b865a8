use crate::utils::CancelToken;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

/// Unbounded FIFO guarded by one lock, with a blocking consumer side.
///
/// Producers never block (beyond the lock) and may be any thread, including
/// transport I/O threads. There is one logical consumer: the spin loop of the
/// node that owns the channel.
///
/// No capacity bound is enforced. A consumer that falls behind lets the queue
/// grow without limit; keeping depth bounded is up to the deployment.
pub struct Channel<T> {
    queue: Mutex<VecDeque<T>>,
    ready: Condvar,
}

impl<T> Default for Channel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Channel<T> {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
        }
    }

    /// Append to the tail and wake at most one blocked consumer.
    #[inline]
    pub fn produce(&self, item: T) {
        self.queue.lock().push_back(item);
        self.ready.notify_one();
    }

    /// Non-blocking removal of the head.
    #[inline]
    pub fn try_consume(&self) -> Option<T> {
        self.queue.lock().pop_front()
    }

    /// Remove the head, blocking until an item exists or `cancel` fires.
    ///
    /// Returns `None` on cancellation, even if items are still queued. The
    /// wait is woken explicitly by [`Channel::wake`]; `poll` only bounds how
    /// long a cancellation that arrives without a wake (e.g. an OS signal)
    /// can go unnoticed.
    pub fn consume_blocking(&self, cancel: &CancelToken, poll: Duration) -> Option<T> {
        let mut queue = self.queue.lock();
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            if let Some(item) = queue.pop_front() {
                return Some(item);
            }
            self.ready.wait_for(&mut queue, poll);
        }
    }

    /// Remove every item present right now and hand each to `f` in FIFO order.
    ///
    /// The lock is released before `f` runs, so `f` may produce into this
    /// channel; such items wait for the next call. Returns the number of items
    /// handed out.
    pub fn drain_available<F: FnMut(T)>(&self, mut f: F) -> usize {
        let batch = std::mem::take(&mut *self.queue.lock());
        let n = batch.len();
        for item in batch {
            f(item);
        }
        n
    }

    /// Wake every blocked consumer so it re-checks its cancel token.
    pub fn wake(&self) {
        // taking the lock orders this notify after any in-progress cancel check
        let _guard = self.queue.lock();
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    const POLL: Duration = Duration::from_millis(50);

    #[test]
    fn preserves_fifo_order() {
        let ch = Channel::new();
        for i in 0..5 {
            ch.produce(i);
        }
        let mut seen = Vec::new();
        assert_eq!(ch.drain_available(|i| seen.push(i)), 5);
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        assert!(ch.is_empty());
    }

    #[test]
    fn drain_leaves_items_produced_during_drain() {
        let ch = Channel::new();
        ch.produce(1);
        ch.produce(2);

        let n = ch.drain_available(|i| ch.produce(i * 10));
        assert_eq!(n, 2);
        assert_eq!(ch.len(), 2);
        assert_eq!(ch.try_consume(), Some(10));
        assert_eq!(ch.try_consume(), Some(20));
    }

    #[test]
    fn blocking_consume_wakes_on_produce() {
        let ch = Arc::new(Channel::new());
        let token = CancelToken::new_root();

        let producer = {
            let ch = ch.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                ch.produce(7u32);
            })
        };

        assert_eq!(ch.consume_blocking(&token, Duration::from_secs(5)), Some(7));
        producer.join().unwrap();
    }

    #[test]
    fn blocking_consume_returns_none_after_cancel_and_wake() {
        let ch = Arc::new(Channel::<u32>::new());
        let token = CancelToken::new_root();

        let consumer = {
            let ch = ch.clone();
            let token = token.clone();
            thread::spawn(move || {
                let start = Instant::now();
                // long poll: only the explicit wake can end this promptly
                let got = ch.consume_blocking(&token, Duration::from_secs(30));
                (got, start.elapsed())
            })
        };

        thread::sleep(Duration::from_millis(20));
        token.cancel();
        ch.wake();

        let (got, elapsed) = consumer.join().unwrap();
        assert_eq!(got, None);
        assert!(elapsed < Duration::from_secs(5), "{elapsed:?}");
    }

    #[test]
    fn cancelled_consumer_ignores_queued_items() {
        let ch = Channel::new();
        ch.produce(1);
        let token = CancelToken::new_root();
        token.cancel();
        assert_eq!(ch.consume_blocking(&token, POLL), None);
        assert_eq!(ch.len(), 1);
    }

    #[test]
    fn concurrent_producers_deliver_everything_once_in_per_producer_order() {
        const PRODUCERS: usize = 4;
        const PER: usize = 2_000;

        let ch = Arc::new(Channel::new());
        let token = CancelToken::new_root();

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let ch = ch.clone();
                thread::spawn(move || {
                    for seq in 0..PER {
                        ch.produce((p, seq));
                    }
                })
            })
            .collect();

        let mut last = [None::<usize>; PRODUCERS];
        let mut total = 0;
        while total < PRODUCERS * PER {
            // alternate both removal styles
            if total % 2 == 0 {
                let (p, seq) = ch.consume_blocking(&token, POLL).unwrap();
                assert!(last[p].is_none_or(|l| seq == l + 1));
                last[p] = Some(seq);
                total += 1;
            } else {
                total += ch.drain_available(|(p, seq)| {
                    assert!(last[p].is_none_or(|l| seq == l + 1));
                    last[p] = Some(seq);
                });
            }
        }

        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(total, PRODUCERS * PER);
        assert!(ch.is_empty());
        assert!(last.iter().all(|l| *l == Some(PER - 1)));
    }
}
