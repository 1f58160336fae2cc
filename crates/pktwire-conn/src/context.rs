use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use pktwire_transport::{IoProvider, SelectorConfig, SelectorProvider, StealingConfig, StealingProvider};
use tracing::info;

use crate::error::{ConnError, Result};
use crate::schedule::{Scheduler, SchedulerConfig};

enum ProviderChoice {
    Selector(SelectorConfig),
    Stealing(StealingConfig),
    Custom(Arc<dyn IoProvider>),
}

/// Configures and starts an [`IoContext`].
pub struct IoContextBuilder {
    provider: ProviderChoice,
    scheduler: SchedulerConfig,
}

impl Default for IoContextBuilder {
    fn default() -> Self {
        Self {
            provider: ProviderChoice::Selector(SelectorConfig::default()),
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl IoContextBuilder {
    /// Use the plain read/write selector with a handler pool (the default).
    pub fn selector(mut self, config: SelectorConfig) -> Self {
        self.provider = ProviderChoice::Selector(config);
        self
    }

    /// Use per-worker selectors with work stealing.
    pub fn stealing(mut self, config: StealingConfig) -> Self {
        self.provider = ProviderChoice::Stealing(config);
        self
    }

    /// Use an already running provider. The context closes it on close.
    pub fn io_provider(mut self, provider: Arc<dyn IoProvider>) -> Self {
        self.provider = ProviderChoice::Custom(provider);
        self
    }

    pub fn scheduler(mut self, config: SchedulerConfig) -> Self {
        self.scheduler = config;
        self
    }

    pub fn start(self) -> Result<IoContext> {
        let (provider, kind): (Arc<dyn IoProvider>, &str) = match self.provider {
            ProviderChoice::Selector(config) => (Arc::new(SelectorProvider::new(config)?), "selector"),
            ProviderChoice::Stealing(config) => (Arc::new(StealingProvider::new(config)?), "stealing"),
            ProviderChoice::Custom(provider) => (provider, "custom"),
        };
        let scheduler = match Scheduler::new(self.scheduler) {
            Ok(scheduler) => scheduler,
            Err(err) => {
                provider.close();
                return Err(err);
            }
        };
        info!(provider = kind, "io context started");
        Ok(IoContext {
            inner: Arc::new(ContextInner {
                provider,
                scheduler,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

struct ContextInner {
    provider: Arc<dyn IoProvider>,
    scheduler: Scheduler,
    closed: AtomicBool,
}

/// Shared readiness provider and scheduler for a set of connections.
///
/// Cheap to clone. Every clone refers to the same provider; [`close`]
/// through any of them stops it for all.
///
/// [`close`]: IoContext::close
#[derive(Clone)]
pub struct IoContext {
    inner: Arc<ContextInner>,
}

impl IoContext {
    pub fn builder() -> IoContextBuilder {
        IoContextBuilder::default()
    }

    /// Start a context with the default selector and scheduler.
    pub fn start() -> Result<Self> {
        Self::builder().start()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub(crate) fn provider(&self) -> Result<Arc<dyn IoProvider>> {
        if self.is_closed() {
            return Err(ConnError::ContextClosed);
        }
        Ok(Arc::clone(&self.inner.provider))
    }

    pub(crate) fn scheduler(&self) -> Result<&Scheduler> {
        if self.is_closed() {
            return Err(ConnError::ContextClosed);
        }
        Ok(&self.inner.scheduler)
    }

    /// Stop the provider and the scheduler. Idempotent. Connections still
    /// open see their sources close.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.scheduler.shutdown();
        self.inner.provider.close();
        info!("io context closed");
    }
}

impl std::fmt::Debug for IoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoContext")
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn closed_context_rejects_use() {
        let ctx = IoContext::start().expect("context should start");
        assert!(ctx.provider().is_ok());
        ctx.close();
        ctx.close();
        assert!(ctx.is_closed());
        assert!(matches!(ctx.provider(), Err(ConnError::ContextClosed)));
        assert!(matches!(ctx.scheduler(), Err(ConnError::ContextClosed)));
    }

    #[test]
    fn stealing_context_starts() {
        let ctx = IoContext::builder()
            .stealing(StealingConfig {
                workers: 2,
                ..StealingConfig::default()
            })
            .scheduler(SchedulerConfig {
                thread_name: "test-scheduler".into(),
            })
            .start()
            .expect("context should start");
        let handle = ctx
            .scheduler()
            .expect("scheduler should be open")
            .schedule(Duration::from_secs(60), || None)
            .expect("task should schedule");
        handle.cancel();
        ctx.close();
    }
}
