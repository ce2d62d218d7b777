//! The process-wide timer queue.
//!
//! Transactions arm timers here and the endpoint loop drains the queue on a
//! fixed tick, dispatching each expired entry back to its transaction.
//! Cancellation is lazy: a cancelled id leaves a tombstone in the heap that
//! is skipped when it surfaces.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::{Duration, Instant},
};

#[derive(PartialEq, Eq)]
struct Deadline {
    fires_at: Instant,
    id: u64,
}

impl Ord for Deadline {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fires_at
            .cmp(&other.fires_at)
            .then(self.id.cmp(&other.id))
    }
}

impl PartialOrd for Deadline {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct Timer<T> {
    deadlines: Mutex<BinaryHeap<Reverse<Deadline>>>,
    values: Mutex<HashMap<u64, T>>,
    next_id: AtomicU64,
}

impl<T> Timer<T> {
    pub fn new() -> Self {
        Timer {
            deadlines: Mutex::new(BinaryHeap::new()),
            values: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Pending entries, cancelled tombstones excluded.
    pub fn len(&self) -> usize {
        self.values.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Arm a timer `duration` from now. Returns the id used to cancel it.
    pub fn timeout(&self, duration: Duration, value: T) -> u64 {
        self.timeout_at(Instant::now() + duration, value)
    }

    pub fn timeout_at(&self, fires_at: Instant, value: T) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.values.lock().unwrap().insert(id, value);
        self.deadlines
            .lock()
            .unwrap()
            .push(Reverse(Deadline { fires_at, id }));
        id
    }

    /// Disarm a timer, returning its value when it had not fired yet.
    pub fn cancel(&self, id: u64) -> Option<T> {
        self.values.lock().unwrap().remove(&id)
    }

    /// Pop every entry due at `now`.
    pub fn poll(&self, now: Instant) -> Vec<T> {
        let mut due = Vec::new();
        let mut deadlines = self.deadlines.lock().unwrap();
        let mut values = self.values.lock().unwrap();
        while let Some(Reverse(head)) = deadlines.peek() {
            if head.fires_at > now {
                break;
            }
            let id = head.id;
            deadlines.pop();
            if let Some(value) = values.remove(&id) {
                due.push(value);
            }
        }
        due
    }
}

impl<T> Default for Timer<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_cancel_poll() {
        let timer = Timer::new();
        let now = Instant::now();

        let id = timer.timeout_at(now, "a");
        assert_eq!(timer.cancel(id), Some("a"));
        assert_eq!(timer.cancel(id), None);

        timer.timeout_at(now, "b");
        timer.timeout_at(now + Duration::from_millis(50), "c");
        timer.timeout_at(now + Duration::from_secs(60), "d");

        let due = timer.poll(now + Duration::from_millis(100));
        assert_eq!(due, vec!["b", "c"]);
        assert_eq!(timer.len(), 1);

        assert!(timer.poll(now + Duration::from_millis(100)).is_empty());
    }

    #[test]
    fn test_cancelled_entries_are_skipped() {
        let timer = Timer::new();
        let now = Instant::now();

        let id = timer.timeout_at(now, "gone");
        timer.timeout_at(now, "kept");
        timer.cancel(id);

        assert_eq!(timer.poll(now + Duration::from_millis(1)), vec!["kept"]);
        assert!(timer.is_empty());
    }

    #[test]
    fn test_fire_order_follows_deadline() {
        let timer = Timer::new();
        let now = Instant::now();

        timer.timeout_at(now + Duration::from_millis(30), 3);
        timer.timeout_at(now + Duration::from_millis(10), 1);
        timer.timeout_at(now + Duration::from_millis(20), 2);

        assert_eq!(timer.poll(now + Duration::from_millis(40)), vec![1, 2, 3]);
    }
}
