//! The assembled engine facade.

use std::fmt;
use std::sync::Arc;

use continuo_graph::{ComponentGraph, StreamManager};
use continuo_ipc::{ActionHandle, CrashReason, Dispatcher, MessageLink, Result, Watchdog};

use crate::builder::ContinuoEngineBuilder;

/// Handle to a fully wired engine: transport, dispatcher, watchdog,
/// component graph and stream manager.
///
/// Built once per coprocessor boot via [`ContinuoEngine::builder`].
/// After a crash the engine stays usable for local teardown only; bring
/// the device back by resetting it and building a fresh engine.
pub struct ContinuoEngine {
    link: Arc<MessageLink>,
    dispatcher: Arc<Dispatcher>,
    watchdog: Arc<Watchdog>,
    graph: Arc<ComponentGraph>,
    streams: StreamManager,
    // Reserved action registrations live as long as the engine.
    _actions: Vec<ActionHandle>,
}

impl ContinuoEngine {
    pub fn builder() -> ContinuoEngineBuilder {
        ContinuoEngineBuilder::new()
    }

    pub(crate) fn assemble(
        link: Arc<MessageLink>,
        dispatcher: Arc<Dispatcher>,
        watchdog: Arc<Watchdog>,
        graph: Arc<ComponentGraph>,
        streams: StreamManager,
        actions: Vec<ActionHandle>,
    ) -> Self {
        Self {
            link,
            dispatcher,
            watchdog,
            graph,
            streams,
            _actions: actions,
        }
    }

    /// Stream lifecycle operations.
    pub fn streams(&self) -> &StreamManager {
        &self.streams
    }

    /// The component graph, for parameter writes outside the stream
    /// lifecycle.
    pub fn graph(&self) -> &Arc<ComponentGraph> {
        &self.graph
    }

    /// The raw transport, for platform code and diagnostics.
    pub fn link(&self) -> &Arc<MessageLink> {
        &self.link
    }

    /// Handler registry for device-originated messages.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn is_crashed(&self) -> bool {
        self.watchdog.is_crashed()
    }

    pub fn crash_reason(&self) -> Option<CrashReason> {
        self.watchdog.crash_reason()
    }

    /// Drain the receive window. The platform's frame-ready interrupt
    /// bottom half calls this.
    pub fn pump_inbound(&self) -> Result<()> {
        self.link.pump_inbound()
    }
}

impl fmt::Debug for ContinuoEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContinuoEngine")
            .field("crashed", &self.watchdog.is_crashed())
            .finish_non_exhaustive()
    }
}
