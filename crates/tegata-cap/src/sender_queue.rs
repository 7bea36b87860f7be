//! FIFO of waiters parked until some event lets them proceed.
//!
//! The queued capability keeps one of these per concern: pushes hand back a
//! promise for the eventual outcome, and whoever resolves the underlying
//! future drains the queue in submission order.

use crate::promise::{promise_and_fulfiller, Fulfiller, Promise};

pub struct SenderQueue<In, Out> {
    queue: Vec<(In, Fulfiller<Out>)>,
}

impl<In, Out: 'static> SenderQueue<In, Out> {
    pub fn new() -> Self {
        Self { queue: Vec::new() }
    }

    /// Park `value`; the returned promise settles when the queue is drained
    /// (or rejects if the queue is dropped first).
    pub fn push(&mut self, value: In) -> Promise<Out> {
        let (promise, fulfiller) = promise_and_fulfiller();
        self.queue.push((value, fulfiller));
        promise
    }

    /// All parked entries, in submission order. The queue is empty after.
    pub fn drain(&mut self) -> Vec<(In, Fulfiller<Out>)> {
        std::mem::take(&mut self.queue)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    #[test]
    fn test_drain_preserves_submission_order() {
        let mut queue: SenderQueue<u32, u32> = SenderQueue::new();
        let first = queue.push(1);
        let second = queue.push(2);
        assert_eq!(queue.len(), 2);

        for (value, fulfiller) in queue.drain() {
            fulfiller.fulfill(value * 10);
        }

        assert_eq!(first.now_or_never().unwrap().unwrap(), 10);
        assert_eq!(second.now_or_never().unwrap().unwrap(), 20);
        assert_eq!(queue.len(), 0);
    }
}
