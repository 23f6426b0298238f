//! Timer service: one-shot timeouts and periodic tasks.
//!
//! A single worker thread sleeps on a condition variable until the
//! earliest deadline in a binary heap comes due, then runs the task on
//! its own thread. Tasks must return promptly; anything long-running
//! belongs on its own worker.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

type Task = Arc<dyn Fn() + Send + Sync>;

struct TimerState {
    cancelled: AtomicBool,
}

/// Handle to a scheduled task. Cancellation is idempotent and safe to
/// call after the scheduler itself is gone.
#[derive(Clone)]
pub struct TimerHandle {
    state: Arc<TimerState>,
    inner: Weak<SchedulerInner>,
}

impl TimerHandle {
    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        // Nudge the worker so a cancelled head entry is discarded
        // instead of slept on.
        if let Some(inner) = self.inner.upgrade() {
            inner.cv.notify_all();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }
}

struct Entry {
    at: Instant,
    period: Option<Duration>,
    id: u64,
    state: Arc<TimerState>,
    task: Task,
}

// Min-heap by deadline; ties broken by insertion id so firing order is
// deterministic.
impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct SchedulerInner {
    queue: Mutex<BinaryHeap<Entry>>,
    cv: Condvar,
    shutdown: AtomicBool,
    next_id: AtomicU64,
}

pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        let inner = Arc::new(SchedulerInner {
            queue: Mutex::new(BinaryHeap::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
        });

        let worker_inner = inner.clone();
        let worker = thread::Builder::new()
            .name("scheduler".to_string())
            .spawn(move || run_worker(worker_inner))
            .expect("failed to spawn scheduler thread");

        Self {
            inner,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Run `task` once at (or shortly after) `at`.
    pub fn schedule_at<F>(&self, at: Instant, task: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.push(at, None, Arc::new(task))
    }

    /// Run `task` once after `delay`.
    pub fn schedule_in<F>(&self, delay: Duration, task: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.schedule_at(Instant::now() + delay, task)
    }

    /// Run `task` every `period`, starting one period from now.
    pub fn schedule_every<F>(&self, period: Duration, task: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.push(Instant::now() + period, Some(period), Arc::new(task))
    }

    fn push(&self, at: Instant, period: Option<Duration>, task: Task) -> TimerHandle {
        let state = Arc::new(TimerState {
            cancelled: AtomicBool::new(false),
        });
        let entry = Entry {
            at,
            period,
            id: self.inner.next_id.fetch_add(1, Ordering::SeqCst),
            state: state.clone(),
            task,
        };
        self.inner.queue.lock().unwrap().push(entry);
        self.inner.cv.notify_all();
        TimerHandle {
            state,
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Stop the worker. Pending tasks are dropped unfired.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.cv.notify_all();
        if let Some(worker) = self.worker.lock().unwrap().take() {
            let _ = worker.join();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(inner: Arc<SchedulerInner>) {
    let mut queue = inner.queue.lock().unwrap();
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let now = Instant::now();
        let mut due: Vec<Entry> = Vec::new();
        while queue
            .peek()
            .is_some_and(|e| e.at <= now || e.state.cancelled.load(Ordering::SeqCst))
        {
            let entry = queue.pop().unwrap();
            if !entry.state.cancelled.load(Ordering::SeqCst) {
                due.push(entry);
            }
        }

        if !due.is_empty() {
            drop(queue);
            for entry in due {
                trace!(id = entry.id, "timer fired");
                (entry.task)();
                if let Some(period) = entry.period
                    && !entry.state.cancelled.load(Ordering::SeqCst)
                {
                    inner.queue.lock().unwrap().push(Entry {
                        at: Instant::now() + period,
                        ..entry
                    });
                }
            }
            queue = inner.queue.lock().unwrap();
            continue;
        }

        queue = match queue.peek() {
            Some(head) => {
                let wait = head.at.saturating_duration_since(now);
                inner.cv.wait_timeout(queue, wait).unwrap().0
            }
            None => inner.cv.wait(queue).unwrap(),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn one_shot_fires() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        scheduler.schedule_in(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(100));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let handle = scheduler.schedule_in(Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        handle.cancel();
        handle.cancel(); // idempotent
        assert!(handle.is_cancelled());

        thread::sleep(Duration::from_millis(120));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn periodic_fires_until_cancelled() {
        let scheduler = Scheduler::new();
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let handle = scheduler.schedule_every(Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(100));
        handle.cancel();
        let seen = fired.load(Ordering::SeqCst);
        assert!(seen >= 2, "expected repeated firings, saw {}", seen);

        thread::sleep(Duration::from_millis(60));
        let after = fired.load(Ordering::SeqCst);
        // At most one firing can race the cancellation.
        assert!(after <= seen + 1);
    }

    #[test]
    fn deadlines_fire_in_order() {
        let scheduler = Scheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let now = Instant::now();
        for (label, delay_ms) in [("late", 60u64), ("early", 20), ("mid", 40)] {
            let order = order.clone();
            scheduler.schedule_at(now + Duration::from_millis(delay_ms), move || {
                order.lock().unwrap().push(label);
            });
        }

        thread::sleep(Duration::from_millis(150));
        assert_eq!(*order.lock().unwrap(), vec!["early", "mid", "late"]);
    }
}
