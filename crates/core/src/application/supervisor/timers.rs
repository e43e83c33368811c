// In-loop timer queue
//
// The supervisor never spawns tasks just to sleep: pending deadlines live
// in this heap and the control loop selects on the earliest one. Firing is
// advisory; handlers re-validate slot state (and spawn sequence, for grace
// timers) so a timer for a slot that has since moved on is a no-op.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::AppKey;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimerEvent {
    /// Restart backoff elapsed; re-attempt admission for the app
    BackoffExpired { key: AppKey },
    /// Grace period elapsed for a STOPPING slot incarnation; force kill
    GraceExpired { key: AppKey, seq: u64 },
    /// Flush the queued persistence records
    PersistRetry,
}

#[derive(Debug)]
struct TimerEntry {
    due: Instant,
    event: TimerEvent,
}

// Min-heap on deadline
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other.due.cmp(&self.due)
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due
    }
}

impl Eq for TimerEntry {}

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: BinaryHeap<TimerEntry>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn schedule_in(&mut self, delay: Duration, event: TimerEvent) {
        self.heap.push(TimerEntry {
            due: Instant::now() + delay,
            event,
        });
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek().map(|e| e.due)
    }

    /// Pop every entry that is due now
    pub fn pop_due(&mut self) -> Vec<TimerEvent> {
        let now = Instant::now();
        let mut due = Vec::new();
        while self.heap.peek().is_some_and(|e| e.due <= now) {
            due.push(self.heap.pop().expect("peeked entry").event);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fires_in_deadline_order() {
        let mut timers = TimerQueue::new();
        let key_a = AppKey::new("t", "a");
        let key_b = AppKey::new("t", "b");

        timers.schedule_in(
            Duration::from_millis(20),
            TimerEvent::BackoffExpired { key: key_b.clone() },
        );
        timers.schedule_in(
            Duration::from_millis(5),
            TimerEvent::BackoffExpired { key: key_a.clone() },
        );

        assert!(timers.pop_due().is_empty());

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            timers.pop_due(),
            vec![TimerEvent::BackoffExpired { key: key_a }]
        );

        tokio::time::sleep(Duration::from_millis(15)).await;
        assert_eq!(
            timers.pop_due(),
            vec![TimerEvent::BackoffExpired { key: key_b }]
        );
    }
}
