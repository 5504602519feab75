use linkmux_core::config::ShortLinkConfig;

use crate::events::ShortLinkEventSender;
use crate::shortlink::{ShortLinkDeps, ShortLinkHandle, ShortLinkRequest, ShortLinkWorker};

/// Starts short-link workers for the scheduler.
pub trait ShortLinkFactory: Send + Sync {
    fn start(&self, request: ShortLinkRequest, events: ShortLinkEventSender) -> ShortLinkHandle;
}

/// Workers that connect through the injected socket provider.
pub struct TcpShortLinkFactory {
    deps: ShortLinkDeps,
    config: ShortLinkConfig,
}

impl TcpShortLinkFactory {
    pub fn new(deps: ShortLinkDeps, config: ShortLinkConfig) -> Self {
        Self { deps, config }
    }
}

impl ShortLinkFactory for TcpShortLinkFactory {
    fn start(&self, request: ShortLinkRequest, events: ShortLinkEventSender) -> ShortLinkHandle {
        ShortLinkWorker::spawn(self.deps.clone(), self.config.clone(), request, events)
    }
}
