//! Work-stealing readiness multiplexer.
//!
//! Every worker owns a `mio::Poll`, a queue of pending registration ops and a
//! queue of ready tasks. A worker drains its own queue first, then steals from
//! peers whose queues are deeper than `min_safety_threshold`. Sources stay
//! with the worker they were first assigned to, so a stolen task that
//! re-registers goes back to its owner's poll.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::error::{Result, TransportError};
use crate::interest::{InterestTable, Op};
use crate::stream::IoSource;
use crate::traits::{IoEvent, IoProvider, IoTask, Readiness};

const WAKE_TOKEN: Token = Token(0);

type Job = (Arc<dyn IoTask>, IoEvent);

/// Configuration for [`StealingProvider`].
#[derive(Debug, Clone)]
pub struct StealingConfig {
    /// Number of poll workers.
    pub workers: usize,
    /// A queue is only stolen from while it holds more than this many tasks.
    pub min_safety_threshold: usize,
    /// Events fetched per poll call.
    pub poll_capacity: usize,
    /// Upper bound on how long an idle worker sleeps before checking peers.
    pub steal_interval: Duration,
}

impl Default for StealingConfig {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism().map_or(2, |n| n.get()),
            min_safety_threshold: 2,
            poll_capacity: 256,
            steal_interval: Duration::from_millis(10),
        }
    }
}

struct Worker {
    ops: Mutex<Vec<Op>>,
    ready: Mutex<VecDeque<Job>>,
    waker: Waker,
    saturation: AtomicUsize,
}

struct Shared {
    workers: Vec<Worker>,
    owners: Mutex<HashMap<u64, usize>>,
    shutdown: AtomicBool,
    threshold: usize,
    steal_interval: Duration,
}

impl Shared {
    fn assign(&self, source: &IoSource) -> usize {
        let mut owners = self.owners.lock();
        *owners.entry(source.id()).or_insert_with(|| {
            let saturation: Vec<usize> = self
                .workers
                .iter()
                .map(|w| w.saturation.load(Ordering::Relaxed))
                .collect();
            let index = least_busy(&saturation);
            debug!(source = source.id(), worker = index, "assigned source");
            index
        })
    }

    fn steal(&self, thief: usize) -> Option<Job> {
        let count = self.workers.len();
        let peers = (1..count).map(|offset| &self.workers[(thief + offset) % count].ready);
        steal_from(peers, self.threshold)
    }

    fn wake_peers(&self, except: usize) {
        for (index, worker) in self.workers.iter().enumerate() {
            if index != except {
                let _ = worker.waker.wake();
            }
        }
    }
}

/// Index of the least saturated worker; ties go to the lowest index.
fn least_busy(saturation: &[usize]) -> usize {
    saturation
        .iter()
        .enumerate()
        .min_by_key(|(_, load)| **load)
        .map_or(0, |(index, _)| index)
}

/// Take one task from the back of the first queue deeper than `threshold`.
fn steal_from<'a, T: 'a>(
    queues: impl IntoIterator<Item = &'a Mutex<VecDeque<T>>>,
    threshold: usize,
) -> Option<T> {
    for queue in queues {
        let mut queue = queue.lock();
        if queue.len() > threshold {
            return queue.pop_back();
        }
    }
    None
}

fn run_worker(index: usize, mut poll: Poll, capacity: usize, shared: Arc<Shared>) {
    let me = &shared.workers[index];
    let mut events = Events::with_capacity(capacity.max(1));
    let mut table = InterestTable::default();

    while !shared.shutdown.load(Ordering::Acquire) {
        let ops = std::mem::take(&mut *me.ops.lock());
        for op in ops {
            if let Some(task) = table.apply(poll.registry(), op) {
                me.ready.lock().push_back((task, IoEvent::Closed));
            }
        }

        let timeout = if me.ready.lock().is_empty() {
            shared.steal_interval
        } else {
            Duration::ZERO
        };
        if let Err(err) = poll.poll(&mut events, Some(timeout)) {
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!(worker = index, error = %err, "poll failed; stopping worker");
            break;
        }

        {
            let mut ready = me.ready.lock();
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                ready.extend(table.take_ready(poll.registry(), event));
            }
            if ready.len() > shared.threshold {
                trace!(worker = index, depth = ready.len(), "offering surplus to peers");
                drop(ready);
                shared.wake_peers(index);
            }
        }

        loop {
            if shared.shutdown.load(Ordering::Acquire) {
                break;
            }
            let own = me.ready.lock().pop_front();
            let Some((task, event)) = own.or_else(|| shared.steal(index)) else {
                break;
            };
            task.on_event(event);
            me.saturation.fetch_add(1, Ordering::Relaxed);
        }
    }

    let mut pending: Vec<Arc<dyn IoTask>> = me.ready.lock().drain(..).map(|(task, _)| task).collect();
    for op in std::mem::take(&mut *me.ops.lock()) {
        if let Op::Register { task, .. } = op {
            pending.push(task);
        }
    }
    pending.extend(table.drain(poll.registry()));
    debug!(worker = index, pending = pending.len(), "worker exiting");
    for task in pending {
        task.on_event(IoEvent::Closed);
    }
}

/// Multiplexer with one poll per worker and cross-worker task stealing.
pub struct StealingProvider {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl StealingProvider {
    pub fn new(config: StealingConfig) -> Result<Self> {
        let count = config.workers.max(1);
        let mut polls = Vec::with_capacity(count);
        let mut workers = Vec::with_capacity(count);
        for _ in 0..count {
            let poll = Poll::new().map_err(TransportError::Poll)?;
            let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(TransportError::Poll)?;
            workers.push(Worker {
                ops: Mutex::new(Vec::new()),
                ready: Mutex::new(VecDeque::new()),
                waker,
                saturation: AtomicUsize::new(0),
            });
            polls.push(poll);
        }

        let shared = Arc::new(Shared {
            workers,
            owners: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
            threshold: config.min_safety_threshold,
            steal_interval: config.steal_interval,
        });

        let mut threads = Vec::with_capacity(count);
        for (index, poll) in polls.into_iter().enumerate() {
            let shared = Arc::clone(&shared);
            let capacity = config.poll_capacity;
            let handle = thread::Builder::new()
                .name(format!("pktwire-worker-{index}"))
                .spawn(move || run_worker(index, poll, capacity, shared))?;
            threads.push(handle);
        }
        info!(
            workers = count,
            threshold = config.min_safety_threshold,
            "stealing provider started"
        );

        Ok(Self {
            shared,
            threads: Mutex::new(threads),
        })
    }

    /// Tasks processed per worker so far.
    pub fn saturation(&self) -> Vec<usize> {
        self.shared
            .workers
            .iter()
            .map(|w| w.saturation.load(Ordering::Relaxed))
            .collect()
    }

    fn submit(&self, index: usize, op: Op) -> Result<()> {
        let worker = &self.shared.workers[index];
        worker.ops.lock().push(op);
        worker.waker.wake()?;
        Ok(())
    }
}

impl IoProvider for StealingProvider {
    fn register(
        &self,
        source: &Arc<IoSource>,
        readiness: Readiness,
        task: Arc<dyn IoTask>,
    ) -> Result<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        let index = self.shared.assign(source);
        self.submit(
            index,
            Op::Register {
                source: Arc::clone(source),
                readiness,
                task,
            },
        )
    }

    fn unregister(&self, source: &Arc<IoSource>) {
        let owner = self.shared.owners.lock().remove(&source.id());
        if let Some(index) = owner {
            let _ = self.submit(
                index,
                Op::Unregister {
                    source: Arc::clone(source),
                },
            );
        }
    }

    fn close(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        for worker in &self.shared.workers {
            let _ = worker.waker.wake();
        }
        let current = thread::current().id();
        for handle in std::mem::take(&mut *self.threads.lock()) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        info!("stealing provider closed");
    }
}

impl Drop for StealingProvider {
    fn drop(&mut self) {
        self.close();
    }
}
