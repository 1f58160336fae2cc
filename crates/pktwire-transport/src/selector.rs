//! Plain readiness multiplexer: one poll loop per direction, callbacks run on
//! a shared handler pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::error::{Result, TransportError};
use crate::interest::{InterestTable, Op};
use crate::stream::IoSource;
use crate::traits::{IoEvent, IoProvider, IoTask, Readiness};

const WAKE_TOKEN: Token = Token(0);

type Job = (Arc<dyn IoTask>, IoEvent);

/// Configuration for [`SelectorProvider`].
#[derive(Debug, Clone)]
pub struct SelectorConfig {
    /// Threads executing readiness callbacks.
    pub handler_threads: usize,
    /// Events fetched per poll call.
    pub poll_capacity: usize,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            handler_threads: 4,
            poll_capacity: 256,
        }
    }
}

struct LoopShared {
    ops: Mutex<Vec<Op>>,
    waker: Waker,
    shutdown: AtomicBool,
}

struct PollLoop {
    shared: Arc<LoopShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PollLoop {
    fn spawn(name: &str, capacity: usize, jobs: Sender<Job>) -> Result<Self> {
        let poll = Poll::new().map_err(TransportError::Poll)?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN).map_err(TransportError::Poll)?;
        let shared = Arc::new(LoopShared {
            ops: Mutex::new(Vec::new()),
            waker,
            shutdown: AtomicBool::new(false),
        });
        let loop_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_loop(poll, capacity, &loop_shared, &jobs))?;
        Ok(Self {
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    fn submit(&self, op: Op) -> Result<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        self.shared.ops.lock().push(op);
        self.shared.waker.wake()?;
        Ok(())
    }

    fn stop(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.shared.waker.wake();
        if let Some(handle) = self.thread.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

fn run_loop(mut poll: Poll, capacity: usize, shared: &LoopShared, jobs: &Sender<Job>) {
    let mut events = Events::with_capacity(capacity.max(1));
    let mut table = InterestTable::default();

    while !shared.shutdown.load(Ordering::Acquire) {
        let ops = std::mem::take(&mut *shared.ops.lock());
        for op in ops {
            if let Some(task) = table.apply(poll.registry(), op) {
                let _ = jobs.send((task, IoEvent::Closed));
            }
        }

        if let Err(err) = poll.poll(&mut events, None) {
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            error!(error = %err, "poll failed; stopping loop");
            break;
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            for job in table.take_ready(poll.registry(), event) {
                if jobs.send(job).is_err() {
                    return;
                }
            }
        }
    }

    // Any ops queued after shutdown still hold tasks waiting for an answer.
    let ops = std::mem::take(&mut *shared.ops.lock());
    for op in ops {
        if let Op::Register { task, .. } = op {
            let _ = jobs.send((task, IoEvent::Closed));
        }
    }
    debug!(pending = table.len(), "poll loop exiting");
    for task in table.drain(poll.registry()) {
        let _ = jobs.send((task, IoEvent::Closed));
    }
}

fn run_handler(jobs: Receiver<Job>) {
    for (task, event) in jobs.iter() {
        task.on_event(event);
    }
}

/// Two poll loops (read, write) with a fixed handler pool.
pub struct SelectorProvider {
    read: PollLoop,
    write: PollLoop,
    jobs: Mutex<Option<Sender<Job>>>,
    handlers: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SelectorProvider {
    pub fn new(config: SelectorConfig) -> Result<Self> {
        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let mut handlers = Vec::with_capacity(config.handler_threads.max(1));
        for index in 0..config.handler_threads.max(1) {
            let rx = rx.clone();
            let handle = thread::Builder::new()
                .name(format!("pktwire-handler-{index}"))
                .spawn(move || run_handler(rx))?;
            handlers.push(handle);
        }

        let read = PollLoop::spawn("pktwire-read", config.poll_capacity, tx.clone())?;
        let write = PollLoop::spawn("pktwire-write", config.poll_capacity, tx.clone())?;
        info!(handlers = handlers.len(), "selector provider started");

        Ok(Self {
            read,
            write,
            jobs: Mutex::new(Some(tx)),
            handlers: Mutex::new(handlers),
            closed: AtomicBool::new(false),
        })
    }

    fn loop_for(&self, readiness: Readiness) -> &PollLoop {
        match readiness {
            Readiness::Read => &self.read,
            Readiness::Write => &self.write,
        }
    }
}

impl IoProvider for SelectorProvider {
    fn register(
        &self,
        source: &Arc<IoSource>,
        readiness: Readiness,
        task: Arc<dyn IoTask>,
    ) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }
        self.loop_for(readiness).submit(Op::Register {
            source: Arc::clone(source),
            readiness,
            task,
        })
    }

    fn unregister(&self, source: &Arc<IoSource>) {
        for poll_loop in [&self.read, &self.write] {
            let _ = poll_loop.submit(Op::Unregister {
                source: Arc::clone(source),
            });
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.read.stop();
        self.write.stop();
        self.jobs.lock().take();

        let current = thread::current().id();
        let handlers = std::mem::take(&mut *self.handlers.lock());
        for handle in handlers {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        info!("selector provider closed");
    }
}

impl Drop for SelectorProvider {
    fn drop(&mut self) {
        self.close();
    }
}
