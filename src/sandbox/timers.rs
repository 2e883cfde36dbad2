//! Host side of `setTimeout` / `setInterval`.
//!
//! The queue only tracks ids and deadlines; the callbacks themselves stay
//! on the script side (see `prelude.js`), so nothing here is reachable
//! from the engine's garbage collector. The queue belongs to one context
//! and is dropped with it, which defuses every timer still pending.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Upper bound on simultaneously pending timers per context.
pub const MAX_PENDING_TIMERS: usize = 10_000;

/// Intervals are clamped to this period so `setInterval(f, 0)` cannot spin.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
struct TimerEntry {
    due: Instant,
    interval: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    next_id: u32,
    entries: BTreeMap<u32, TimerEntry>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a timer firing `delay` after `now`. Returns its id.
    pub fn schedule(&mut self, now: Instant, delay: Duration, repeat: bool) -> anyhow::Result<u32> {
        if self.entries.len() >= MAX_PENDING_TIMERS {
            return Err(anyhow::anyhow!(
                "too many pending timers (limit is {MAX_PENDING_TIMERS})"
            ));
        }
        self.next_id += 1;
        let id = self.next_id;
        let interval = repeat.then(|| delay.max(MIN_INTERVAL));
        self.entries.insert(
            id,
            TimerEntry {
                due: now + delay,
                interval,
            },
        );
        Ok(id)
    }

    /// Cancels a timer. Unknown ids are ignored, as in browsers.
    pub fn cancel(&mut self, id: u32) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Earliest pending deadline.
    pub fn next_due(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.due).min()
    }

    /// Takes the earliest timer due at `now`. Intervals are re-armed;
    /// one-shot timers are removed. Ties fire in scheduling order.
    pub fn pop_due(&mut self, now: Instant) -> Option<u32> {
        let (&id, _) = self
            .entries
            .iter()
            .filter(|(_, e)| e.due <= now)
            .min_by_key(|(id, e)| (e.due, **id))?;

        match self.entries.get_mut(&id) {
            Some(entry) => match entry.interval {
                Some(interval) => entry.due += interval,
                None => {
                    self.entries.remove(&id);
                }
            },
            None => return None,
        }
        Some(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every pending timer.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_schedule_assigns_increasing_ids() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let a = queue.schedule(now, ms(10), false).unwrap();
        let b = queue.schedule(now, ms(10), false).unwrap();
        assert!(b > a);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_pop_due_fires_in_deadline_order() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let late = queue.schedule(now, ms(30), false).unwrap();
        let early = queue.schedule(now, ms(10), false).unwrap();

        assert_eq!(queue.pop_due(now), None);
        assert_eq!(queue.pop_due(now + ms(50)), Some(early));
        assert_eq!(queue.pop_due(now + ms(50)), Some(late));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_ties_fire_in_scheduling_order() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let first = queue.schedule(now, ms(5), false).unwrap();
        let second = queue.schedule(now, ms(5), false).unwrap();
        assert_eq!(queue.pop_due(now + ms(5)), Some(first));
        assert_eq!(queue.pop_due(now + ms(5)), Some(second));
    }

    #[test]
    fn test_interval_is_rearmed() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let id = queue.schedule(now, ms(10), true).unwrap();

        assert_eq!(queue.pop_due(now + ms(10)), Some(id));
        assert_eq!(queue.next_due(), Some(now + ms(20)));
        assert_eq!(queue.pop_due(now + ms(15)), None);
        assert_eq!(queue.pop_due(now + ms(20)), Some(id));
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let id = queue.schedule(now, Duration::ZERO, true).unwrap();
        assert_eq!(queue.pop_due(now), Some(id));
        assert_eq!(queue.next_due(), Some(now + MIN_INTERVAL));
    }

    #[test]
    fn test_cancel() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        let id = queue.schedule(now, ms(1), false).unwrap();
        assert!(queue.cancel(id));
        assert!(!queue.cancel(id));
        assert!(!queue.cancel(999));
        assert_eq!(queue.pop_due(now + ms(5)), None);
    }

    #[test]
    fn test_pending_limit() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        for _ in 0..MAX_PENDING_TIMERS {
            queue.schedule(now, ms(1), false).unwrap();
        }
        let err = queue.schedule(now, ms(1), false).unwrap_err();
        assert!(err.to_string().contains("too many pending timers"));
    }

    #[test]
    fn test_clear_defuses_everything() {
        let mut queue = TimerQueue::new();
        let now = Instant::now();
        queue.schedule(now, ms(1), true).unwrap();
        queue.schedule(now, ms(2), false).unwrap();
        queue.clear();
        assert_eq!(queue.next_due(), None);
        assert_eq!(queue.pop_due(now + ms(10)), None);
    }
}
