//! Per-poll registration bookkeeping shared by both multiplexers.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use mio::event::Event;
use mio::unix::SourceFd;
use mio::{Interest, Registry, Token};
use tracing::{debug, warn};

use crate::stream::IoSource;
use crate::traits::{IoEvent, IoTask, Readiness};

/// A queued registration change, applied by the owning poll thread.
pub(crate) enum Op {
    Register {
        source: Arc<IoSource>,
        readiness: Readiness,
        task: Arc<dyn IoTask>,
    },
    Unregister {
        source: Arc<IoSource>,
    },
}

struct Entry {
    source: Arc<IoSource>,
    read: Option<Arc<dyn IoTask>>,
    write: Option<Arc<dyn IoTask>>,
    armed: Option<Interest>,
}

impl Entry {
    fn wanted(&self) -> Option<Interest> {
        match (self.read.is_some(), self.write.is_some()) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Sources registered with one `mio::Poll`, with at most one pending task per
/// readiness direction.
#[derive(Default)]
pub(crate) struct InterestTable {
    entries: HashMap<Token, Entry>,
}

impl InterestTable {
    pub(crate) fn token_for(source: &IoSource) -> Token {
        Token(source.id() as usize)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Apply a queued op. Returns a task that must be told [`IoEvent::Closed`]
    /// when its registration could not be armed.
    pub(crate) fn apply(&mut self, registry: &Registry, op: Op) -> Option<Arc<dyn IoTask>> {
        match op {
            Op::Register {
                source,
                readiness,
                task,
            } => {
                let token = Self::token_for(&source);
                let entry = self.entries.entry(token).or_insert_with(|| Entry {
                    source: Arc::clone(&source),
                    read: None,
                    write: None,
                    armed: None,
                });
                match readiness {
                    Readiness::Read => entry.read = Some(Arc::clone(&task)),
                    Readiness::Write => entry.write = Some(Arc::clone(&task)),
                }
                if let Err(err) = rearm(registry, token, entry) {
                    warn!(source = source.id(), error = %err, "failed to arm registration");
                    self.remove(registry, token);
                    return Some(task);
                }
                None
            }
            Op::Unregister { source } => {
                let token = Self::token_for(&source);
                if self.remove(registry, token) {
                    debug!(source = source.id(), "unregistered source");
                }
                None
            }
        }
    }

    /// Clear the interest bits an event reports and hand back the tasks to run.
    pub(crate) fn take_ready(
        &mut self,
        registry: &Registry,
        event: &Event,
    ) -> Vec<(Arc<dyn IoTask>, IoEvent)> {
        let token = event.token();
        let mut ready = Vec::with_capacity(2);
        let Some(entry) = self.entries.get_mut(&token) else {
            return ready;
        };

        let failed = event.is_error();
        if event.is_readable() || event.is_read_closed() || failed {
            if let Some(task) = entry.read.take() {
                ready.push((task, IoEvent::Readable));
            }
        }
        if event.is_writable() || event.is_write_closed() || failed {
            if let Some(task) = entry.write.take() {
                ready.push((task, IoEvent::Writable));
            }
        }

        if ready.is_empty() {
            return ready;
        }
        if entry.wanted().is_none() {
            self.remove(registry, token);
        } else if let Err(err) = rearm(registry, token, entry) {
            warn!(source = entry.source.id(), error = %err, "failed to rearm registration");
            if let Some(task) = entry.read.take() {
                ready.push((task, IoEvent::Closed));
            }
            if let Some(task) = entry.write.take() {
                ready.push((task, IoEvent::Closed));
            }
            self.remove(registry, token);
        }
        ready
    }

    /// Forget every registration, returning the tasks that were still pending.
    pub(crate) fn drain(&mut self, registry: &Registry) -> Vec<Arc<dyn IoTask>> {
        let mut pending = Vec::new();
        for (_, mut entry) in self.entries.drain() {
            let fd = entry.source.raw_fd();
            if entry.armed.is_some() {
                let _ = registry.deregister(&mut SourceFd(&fd));
            }
            pending.extend(entry.read.take());
            pending.extend(entry.write.take());
        }
        pending
    }

    fn remove(&mut self, registry: &Registry, token: Token) -> bool {
        match self.entries.remove(&token) {
            Some(entry) => {
                if entry.armed.is_some() {
                    let fd = entry.source.raw_fd();
                    let _ = registry.deregister(&mut SourceFd(&fd));
                }
                true
            }
            None => false,
        }
    }
}

fn rearm(registry: &Registry, token: Token, entry: &mut Entry) -> io::Result<()> {
    let Some(wanted) = entry.wanted() else {
        return Ok(());
    };
    let fd = entry.source.raw_fd();
    // A reregister re-evaluates readiness, so edge-triggered events that came
    // in while the task was out are reported again.
    if entry.armed.is_some() {
        registry.reregister(&mut SourceFd(&fd), token, wanted)?;
    } else {
        registry.register(&mut SourceFd(&fd), token, wanted)?;
    }
    entry.armed = Some(wanted);
    Ok(())
}
