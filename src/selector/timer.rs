use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

pub(crate) type TimerCallback = Box<dyn FnOnce() + Send>;

/// Handle of a scheduled timer callback.
///
/// Cancellation is advisory: once the loop has started running the
/// callback, `cancel` has no effect.
#[derive(Debug, Clone)]
pub struct TimerEvent {
    cancelled: Arc<AtomicBool>,
    deadline: Instant,
}

impl TimerEvent {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

struct Scheduled {
    deadline: Instant,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    callback: TimerCallback,
}

impl PartialEq for Scheduled {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Scheduled {}

impl PartialOrd for Scheduled {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scheduled {
    // reversed: the heap pops the earliest deadline first, ties by insertion
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Pending timers ordered by fire time.
#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<Scheduled>,
    seq: u64,
}

impl TimerQueue {
    pub(crate) fn push(&mut self, delay: Duration, callback: TimerCallback) -> TimerEvent {
        let deadline = Instant::now() + delay;
        let cancelled = Arc::new(AtomicBool::new(false));
        self.seq += 1;
        self.heap.push(Scheduled {
            deadline,
            seq: self.seq,
            cancelled: Arc::clone(&cancelled),
            callback,
        });
        TimerEvent { cancelled, deadline }
    }

    /// Earliest deadline among timers that are still live.
    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(head) = self.heap.peek() {
            if head.cancelled.load(Ordering::Acquire) {
                self.heap.pop();
                continue;
            }
            return Some(head.deadline);
        }
        None
    }

    /// Pop the next live timer whose deadline has passed.
    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<TimerCallback> {
        while self.heap.peek().is_some_and(|head| head.deadline <= now) {
            let Some(head) = self.heap.pop() else { break };
            if head.cancelled.load(Ordering::Acquire) {
                continue;
            }
            return Some(head.callback);
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }
}
