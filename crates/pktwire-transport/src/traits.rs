use std::sync::Arc;

use crate::error::Result;
use crate::stream::IoSource;

/// Which readiness a registration waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Readiness {
    Read,
    Write,
}

/// The closed set of events delivered to an [`IoTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEvent {
    /// The socket can be read (or has hit EOF/error, which the read reports).
    Readable,
    /// The socket can be written.
    Writable,
    /// The provider shut down while this task was still pending.
    Closed,
}

/// A one-shot readiness callback.
///
/// The provider forgets a task after delivering its event. A task that could
/// not finish its transfer registers itself again rather than waiting.
pub trait IoTask: Send + Sync {
    fn on_event(&self, event: IoEvent);
}

/// A readiness multiplexer that sockets register with.
///
/// Registration changes are queued and applied by the polling thread between
/// poll iterations.
pub trait IoProvider: Send + Sync {
    /// Arm `task` to run once `source` reaches `readiness`.
    fn register(
        &self,
        source: &Arc<IoSource>,
        readiness: Readiness,
        task: Arc<dyn IoTask>,
    ) -> Result<()>;

    /// Drop every pending registration for `source`.
    fn unregister(&self, source: &Arc<IoSource>);

    /// Stop all polling threads. Pending tasks receive [`IoEvent::Closed`].
    fn close(&self);
}
