//! Supervisor-local periodic triggers.
//!
//! A [`TriggerScheduler`] keeps one deadline per task id.  Nothing runs in
//! the background: the supervisor's own tick calls [`TriggerScheduler::run_due`],
//! which fires every task whose deadline has passed and pushes the deadline
//! one interval past *now*.  A tick that arrives late therefore fires a task
//! once, not once per missed interval.
//!
//! Worker poll loops are unaffected; a trigger only ever runs on the thread
//! that ticks the supervisor.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Work run when a trigger is due.
pub type TriggerFn = Box<dyn FnMut() + Send + Sync>;

struct Trigger {
    interval: Duration,
    next_due: Instant,
    work: TriggerFn,
}

/// Per-task-id cooperative scheduler.
///
/// Triggers must not register or cancel triggers on the same scheduler from
/// inside their callback.
#[derive(Default)]
pub struct TriggerScheduler {
    triggers: DashMap<String, Trigger>,
}

impl std::fmt::Debug for TriggerScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TriggerScheduler")
            .field("tasks", &self.task_ids())
            .finish()
    }
}

impl TriggerScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `work` every `interval`, first one interval from now.
    ///
    /// Registering a task id that already exists with the same interval keeps
    /// its current deadline and only swaps the callback, so this can be called
    /// from a polling loop without ever postponing the task.
    pub fn every(&self, interval: Duration, task_id: impl Into<String>, work: TriggerFn) {
        self.every_from(Instant::now(), interval, task_id, work);
    }

    fn every_from(&self, now: Instant, interval: Duration, task_id: impl Into<String>, work: TriggerFn) {
        let task_id = task_id.into();
        if let Some(mut existing) = self.triggers.get_mut(&task_id) {
            if existing.interval == interval {
                existing.work = work;
                return;
            }
        }

        tracing::debug!(task = %task_id, interval_ms = interval.as_millis() as u64, "trigger scheduled");
        self.triggers.insert(
            task_id,
            Trigger {
                interval,
                next_due: now + interval,
                work,
            },
        );
    }

    /// Remove a task.  Returns whether it existed.
    pub fn cancel(&self, task_id: &str) -> bool {
        self.triggers.remove(task_id).is_some()
    }

    /// Deadline of a task, if registered.
    pub fn next_due(&self, task_id: &str) -> Option<Instant> {
        self.triggers.get(task_id).map(|t| t.next_due)
    }

    pub fn task_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.triggers.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Fire every due task.  Returns how many ran.
    pub fn run_due(&self) -> usize {
        self.run_due_at(Instant::now())
    }

    /// Fire every task due at `now`.
    pub fn run_due_at(&self, now: Instant) -> usize {
        let mut fired = 0;
        for mut entry in self.triggers.iter_mut() {
            if now < entry.next_due {
                continue;
            }
            tracing::debug!(task = %entry.key(), "trigger fired");
            (entry.work)();
            entry.next_due = now + entry.interval;
            fired += 1;
        }
        fired
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counter() -> (Arc<AtomicU32>, TriggerFn) {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        (
            count,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn fires_once_per_interval() {
        let scheduler = TriggerScheduler::new();
        let start = Instant::now();
        let (count, work) = counter();
        scheduler.every_from(start, Duration::from_secs(10), "capture", work);

        assert_eq!(scheduler.run_due_at(start + Duration::from_secs(5)), 0);
        assert_eq!(scheduler.run_due_at(start + Duration::from_secs(10)), 1);
        assert_eq!(scheduler.run_due_at(start + Duration::from_secs(11)), 0);
        assert_eq!(scheduler.run_due_at(start + Duration::from_secs(20)), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn late_tick_does_not_burst() {
        let scheduler = TriggerScheduler::new();
        let start = Instant::now();
        let (count, work) = counter();
        scheduler.every_from(start, Duration::from_secs(1), "heartbeat", work);

        let late = start + Duration::from_secs(30);
        assert_eq!(scheduler.run_due_at(late), 1);
        assert_eq!(scheduler.next_due("heartbeat"), Some(late + Duration::from_secs(1)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn re_registering_keeps_deadline() {
        let scheduler = TriggerScheduler::new();
        let start = Instant::now();
        let (_, first) = counter();
        scheduler.every_from(start, Duration::from_secs(10), "capture", first);

        let (second_count, second) = counter();
        scheduler.every_from(start + Duration::from_secs(9), Duration::from_secs(10), "capture", second);
        assert_eq!(scheduler.next_due("capture"), Some(start + Duration::from_secs(10)));

        scheduler.run_due_at(start + Duration::from_secs(10));
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn changed_interval_reschedules() {
        let scheduler = TriggerScheduler::new();
        let start = Instant::now();
        let (_, a) = counter();
        let (_, b) = counter();
        scheduler.every_from(start, Duration::from_secs(10), "capture", a);
        scheduler.every_from(start, Duration::from_secs(3), "capture", b);
        assert_eq!(scheduler.next_due("capture"), Some(start + Duration::from_secs(3)));
    }

    #[test]
    fn cancel_removes_task() {
        let scheduler = TriggerScheduler::new();
        let (_, work) = counter();
        scheduler.every(Duration::from_millis(1), "x", work);
        assert_eq!(scheduler.task_ids(), vec!["x".to_string()]);
        assert!(scheduler.cancel("x"));
        assert!(!scheduler.cancel("x"));
        assert!(scheduler.next_due("x").is_none());
    }
}
