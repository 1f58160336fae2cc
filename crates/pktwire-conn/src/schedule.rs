//! Timer thread for delayed, self-rescheduling jobs.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use pktwire_transport::now_millis;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::error::{ConnError, Result};

/// A timed task bound to a connection.
pub trait ScheduleJob: Send + Sync {
    fn initial_delay(&self) -> Duration;

    /// Run once. Return the delay until the next run, or `None` to stop.
    fn fire(&self, connection: &Connection) -> Option<Duration>;
}

/// Sends a heartbeat once the connection has seen no traffic for `timeout`.
#[derive(Debug, Clone, Copy)]
pub struct IdleTimeoutJob {
    timeout: Duration,
}

impl IdleTimeoutJob {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Delay until the next check, or `None` when the connection is idle now.
    fn remaining(&self, last_active: u64, now: u64) -> Option<Duration> {
        let idle = Duration::from_millis(now.saturating_sub(last_active));
        self.timeout.checked_sub(idle).filter(|delta| !delta.is_zero())
    }
}

impl ScheduleJob for IdleTimeoutJob {
    fn initial_delay(&self) -> Duration {
        self.timeout
    }

    fn fire(&self, connection: &Connection) -> Option<Duration> {
        match self.remaining(connection.last_active_time(), now_millis()) {
            Some(delta) => Some(delta),
            None => {
                debug!(connection = %connection.id(), "idle timeout, sending heartbeat");
                connection.send_heartbeat();
                Some(self.timeout)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            thread_name: "pktwire-scheduler".to_string(),
        }
    }
}

type Task = Box<dyn FnMut() -> Option<Duration> + Send>;

struct Entry {
    due: Instant,
    seq: u64,
    flags: Arc<TaskFlags>,
    task: Task,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// Reversed so the max-heap pops the earliest deadline.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct State {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

impl State {
    fn push(&mut self, due: Instant, flags: Arc<TaskFlags>, task: Task) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.heap.push(Entry {
            due,
            seq,
            flags,
            task,
        });
    }
}

struct Shared {
    state: Mutex<State>,
    wakeup: Condvar,
}

#[derive(Debug, Default)]
struct TaskFlags {
    cancelled: AtomicBool,
    finished: AtomicBool,
}

/// Cancels a scheduled task. Dropping the handle does not cancel.
#[derive(Debug, Clone)]
pub struct ScheduleHandle {
    flags: Arc<TaskFlags>,
}

impl ScheduleHandle {
    pub fn cancel(&self) {
        self.flags.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flags.cancelled.load(Ordering::Acquire)
    }

    /// The task will not run again: it stopped itself, was cancelled, or
    /// the scheduler shut down.
    pub fn is_done(&self) -> bool {
        self.is_cancelled() || self.flags.finished.load(Ordering::Acquire)
    }
}

/// Runs tasks on one timer thread, earliest deadline first.
pub struct Scheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State::default()),
            wakeup: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(config.thread_name)
            .spawn(move || run(&worker))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Run `task` after `delay`, then again after each delay it returns.
    pub fn schedule(
        &self,
        delay: Duration,
        task: impl FnMut() -> Option<Duration> + Send + 'static,
    ) -> Result<ScheduleHandle> {
        let flags = Arc::new(TaskFlags::default());
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return Err(ConnError::ContextClosed);
            }
            state.push(Instant::now() + delay, Arc::clone(&flags), Box::new(task));
        }
        self.shared.wakeup.notify_one();
        Ok(ScheduleHandle { flags })
    }

    /// Tasks waiting for their deadline, cancelled ones included.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().heap.len()
    }

    /// Stop the timer thread and drop every pending task. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            for entry in state.heap.drain() {
                entry.flags.finished.store(true, Ordering::Release);
            }
        }
        self.shared.wakeup.notify_all();
        let thread = self.thread.lock().take();
        if let Some(thread) = thread {
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

fn run(shared: &Shared) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            break;
        }
        let Some(due) = state.heap.peek().map(|entry| entry.due) else {
            shared.wakeup.wait(&mut state);
            continue;
        };
        if due > Instant::now() {
            shared.wakeup.wait_until(&mut state, due);
            continue;
        }
        let Some(mut entry) = state.heap.pop() else {
            continue;
        };
        if entry.flags.cancelled.load(Ordering::Acquire) {
            continue;
        }

        let next = parking_lot::MutexGuard::unlocked(&mut state, || (entry.task)());
        trace!(seq = entry.seq, rescheduled = next.is_some(), "scheduled task ran");
        match next {
            Some(delay)
                if !state.shutdown && !entry.flags.cancelled.load(Ordering::Acquire) =>
            {
                state.push(Instant::now() + delay, entry.flags, entry.task);
            }
            _ => entry.flags.finished.store(true, Ordering::Release),
        }
    }
    debug!("scheduler stopped");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    use super::*;

    #[test]
    fn runs_in_deadline_order() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).expect("scheduler should start");
        let (tx, rx) = mpsc::channel();
        for (label, delay) in [("late", 60), ("early", 10), ("middle", 30)] {
            let tx = tx.clone();
            scheduler
                .schedule(Duration::from_millis(delay), move || {
                    let _ = tx.send(label);
                    None
                })
                .expect("task should schedule");
        }
        let order: Vec<_> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(2)).expect("task should run"))
            .collect();
        assert_eq!(order, ["early", "middle", "late"]);
    }

    #[test]
    fn rescheduling_task_repeats_until_done() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).expect("scheduler should start");
        let runs = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::channel();
        let counter = Arc::clone(&runs);
        let handle = scheduler
            .schedule(Duration::from_millis(5), move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 3 {
                    let _ = tx.send(());
                    None
                } else {
                    Some(Duration::from_millis(5))
                }
            })
            .expect("task should schedule");
        rx.recv_timeout(Duration::from_secs(2)).expect("task should finish");
        thread::sleep(Duration::from_millis(30));
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert!(handle.is_done());
        assert!(!handle.is_cancelled());
    }

    #[test]
    fn cancelled_task_never_runs() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).expect("scheduler should start");
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let handle = scheduler
            .schedule(Duration::from_millis(20), move || {
                flag.store(true, Ordering::SeqCst);
                None
            })
            .expect("task should schedule");
        handle.cancel();
        assert!(handle.is_cancelled());
        thread::sleep(Duration::from_millis(60));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn schedule_after_shutdown_fails() {
        let scheduler = Scheduler::new(SchedulerConfig::default()).expect("scheduler should start");
        scheduler.shutdown();
        scheduler.shutdown();
        let result = scheduler.schedule(Duration::ZERO, || None);
        assert!(matches!(result, Err(ConnError::ContextClosed)));
    }

    #[test]
    fn idle_job_waits_out_remaining_time() {
        let job = IdleTimeoutJob::new(Duration::from_millis(100));
        assert_eq!(job.remaining(1_000, 1_040), Some(Duration::from_millis(60)));
        assert_eq!(job.remaining(1_000, 1_100), None);
        assert_eq!(job.remaining(1_000, 5_000), None);
        assert_eq!(job.initial_delay(), Duration::from_millis(100));
    }
}
