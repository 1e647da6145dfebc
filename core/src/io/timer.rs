//! Process-wide deadline scheduler.
//!
//! One timer thread serves every [`PerishableReader`](super::PerishableReader)
//! in the process; each reader keeps at most one pending task registered and
//! cancels/re-arms it around every blocking read. The thread starts on first
//! use and is never torn down. Cancelling one task never disturbs another:
//! tasks are identified by a monotonically increasing id and a cancelled id
//! simply has no job left to run when its deadline pops.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Condvar, Mutex, MutexGuard, OnceLock};
use std::time::{Duration, Instant};

type Job = Box<dyn FnOnce() + Send + 'static>;

static SHARED: OnceLock<Timer> = OnceLock::new();

/// The process-wide timer instance, started on first use.
pub(crate) fn shared() -> &'static Timer {
    SHARED.get_or_init(Timer::start)
}

/// Handle to one scheduled task; pass back to [`Timer::cancel`].
#[derive(Debug)]
pub(crate) struct TimerTask {
    id: u64,
}

pub(crate) struct Timer {
    state: &'static Mutex<TimerState>,
    cond: &'static Condvar,
}

#[derive(Default)]
struct TimerState {
    // Deadlines ordered soonest-first; jobs live in a side map so that
    // cancellation is O(1) and popped stale entries are simply skipped.
    heap: BinaryHeap<Reverse<(Instant, u64)>>,
    jobs: HashMap<u64, Job>,
    next_id: u64,
}

// A poisoned timer lock only means some job panicked; the queue itself is
// still consistent, so recover the guard instead of propagating the panic.
fn lock(state: &Mutex<TimerState>) -> MutexGuard<'_, TimerState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Timer {
    fn start() -> Timer {
        let state: &'static Mutex<TimerState> = Box::leak(Box::new(Mutex::new(TimerState::default())));
        let cond: &'static Condvar = Box::leak(Box::new(Condvar::new()));
        std::thread::Builder::new()
            .name("shellfs-timer".to_string())
            .spawn(move || run_loop(state, cond))
            .expect("failed to spawn timer thread");
        Timer { state, cond }
    }

    /// Schedule `job` to run once, `delay` from now.
    pub(crate) fn schedule(&self, delay: Duration, job: impl FnOnce() + Send + 'static) -> TimerTask {
        let due = Instant::now() + delay;
        let mut st = lock(self.state);
        let id = st.next_id;
        st.next_id += 1;
        st.heap.push(Reverse((due, id)));
        st.jobs.insert(id, Box::new(job));
        self.cond.notify_one();
        TimerTask { id }
    }

    /// Cancel a pending task. A no-op if the task already fired.
    pub(crate) fn cancel(&self, task: &TimerTask) {
        lock(self.state).jobs.remove(&task.id);
    }
}

fn run_loop(state: &'static Mutex<TimerState>, cond: &'static Condvar) {
    let mut st = lock(state);
    loop {
        let now = Instant::now();
        let mut due: Vec<Job> = Vec::new();
        while let Some(&Reverse((at, id))) = st.heap.peek() {
            if at > now {
                break;
            }
            st.heap.pop();
            if let Some(job) = st.jobs.remove(&id) {
                due.push(job);
            }
        }
        if !due.is_empty() {
            drop(st);
            for job in due {
                job();
            }
            st = lock(state);
            continue;
        }
        let next_due = st.heap.peek().map(|&Reverse((at, _))| at);
        st = match next_due {
            Some(at) => {
                let wait = at.saturating_duration_since(now);
                cond.wait_timeout(st, wait)
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .0
            }
            None => cond.wait(st).unwrap_or_else(|poisoned| poisoned.into_inner()),
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn task_fires_after_delay() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        shared().schedule(Duration::from_millis(20), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancelled_task_does_not_fire() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let task = shared().schedule(Duration::from_millis(50), move || {
            f.fetch_add(1, Ordering::SeqCst);
        });
        shared().cancel(&task);
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancelling_one_task_leaves_others_alone() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f1 = fired.clone();
        let f2 = fired.clone();
        let doomed = shared().schedule(Duration::from_millis(40), move || {
            f1.fetch_add(100, Ordering::SeqCst);
        });
        shared().schedule(Duration::from_millis(40), move || {
            f2.fetch_add(1, Ordering::SeqCst);
        });
        shared().cancel(&doomed);
        std::thread::sleep(Duration::from_millis(250));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tasks_fire_in_deadline_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        shared().schedule(Duration::from_millis(80), move || {
            o1.lock().unwrap().push("late");
        });
        shared().schedule(Duration::from_millis(20), move || {
            o2.lock().unwrap().push("early");
        });
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(*order.lock().unwrap(), vec!["early", "late"]);
    }
}
