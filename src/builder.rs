//! Engine construction and platform wiring.

use std::sync::{Arc, Weak};

use thiserror::Error;
use tracing::{debug, warn};

use continuo_graph::{build_component_table, ComponentGraph, StreamManager};
use continuo_ipc::message::{cmd, notify, status};
use continuo_ipc::{
    ActionHandle, ActionOutcome, CoredumpSink, CrashReason, Dispatcher, IpcError, Keyhole,
    LinkConfig, Message, MessageLink, NoCoredump, Watchdog,
};

use crate::engine::ContinuoEngine;

/// Protocol version this engine speaks.
pub const PROTOCOL_VERSION: u16 = 0x0001;

/// Host-side DRAM allocator backing the coprocessor's dynamic memory
/// requests. Sizes and addresses are in 16-bit words.
pub trait DramAllocator: Send + Sync {
    fn alloc(&self, words: u32) -> Option<u32>;
    fn free(&self, addr: u32);
}

/// Receives the coprocessor's persistent-storage flush records.
pub trait PersistentStore: Send + Sync {
    fn flush(&self, payload: &[u16]);
}

/// Errors from engine construction.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error("no keyhole implementation was provided")]
    MissingKeyhole,

    #[error("firmware speaks protocol {device:#06x}, host speaks {host:#06x}")]
    VersionMismatch { host: u16, device: u16 },

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

/// Builder for [`ContinuoEngine`].
///
/// The keyhole is the only required collaborator. The DRAM allocator and
/// persistent store are optional; without them the corresponding device
/// requests are refused (allocation) or dropped (flush).
pub struct ContinuoEngineBuilder {
    keyhole: Option<Arc<dyn Keyhole>>,
    link_config: LinkConfig,
    coredump: Arc<dyn CoredumpSink>,
    dram: Option<Arc<dyn DramAllocator>>,
    store: Option<Arc<dyn PersistentStore>>,
    probe_version: bool,
}

impl Default for ContinuoEngineBuilder {
    fn default() -> Self {
        Self {
            keyhole: None,
            link_config: LinkConfig::default(),
            coredump: Arc::new(NoCoredump),
            dram: None,
            store: None,
            probe_version: true,
        }
    }
}

impl ContinuoEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyhole(mut self, keyhole: Arc<dyn Keyhole>) -> Self {
        self.keyhole = Some(keyhole);
        self
    }

    pub fn link_config(mut self, config: LinkConfig) -> Self {
        self.link_config = config;
        self
    }

    pub fn coredump_sink(mut self, sink: Arc<dyn CoredumpSink>) -> Self {
        self.coredump = sink;
        self
    }

    pub fn dram_allocator(mut self, dram: Arc<dyn DramAllocator>) -> Self {
        self.dram = Some(dram);
        self
    }

    pub fn persistent_store(mut self, store: Arc<dyn PersistentStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Skip the version handshake at build time. Intended for bring-up
    /// against firmware that predates the VERSION command.
    pub fn skip_version_probe(mut self) -> Self {
        self.probe_version = false;
        self
    }

    pub fn build(self) -> Result<ContinuoEngine, BuildError> {
        let keyhole = self.keyhole.ok_or(BuildError::MissingKeyhole)?;
        let watchdog = Arc::new(Watchdog::new(self.coredump));
        let dispatcher = Arc::new(Dispatcher::new());

        let link = Arc::new(MessageLink::new(
            keyhole,
            Arc::clone(&watchdog),
            Arc::clone(&dispatcher),
            self.link_config,
        ));

        let actions =
            register_reserved_actions(&dispatcher, &watchdog, &link, self.dram, self.store);

        if self.probe_version {
            // The interrupt pump is not wired until the caller has the
            // engine, so the probe drives the receive path itself.
            let resp = link.request_polling(&Message::new(cmd::VERSION))?;
            let device = resp.payload_word(1).unwrap_or(0);
            if device != PROTOCOL_VERSION {
                return Err(BuildError::VersionMismatch {
                    host: PROTOCOL_VERSION,
                    device,
                });
            }
            debug!(version = device, "firmware version verified");
        }

        let graph = Arc::new(ComponentGraph::new(
            Arc::clone(&link) as Arc<dyn continuo_graph::CommandPort>,
            Arc::clone(&watchdog),
            build_component_table(),
        ));
        let streams = StreamManager::new(Arc::clone(&graph), Arc::clone(&watchdog));

        Ok(ContinuoEngine::assemble(
            link, dispatcher, watchdog, graph, streams, actions,
        ))
    }
}

/// Wire up handlers for the reserved device-originated message ids.
fn register_reserved_actions(
    dispatcher: &Arc<Dispatcher>,
    watchdog: &Arc<Watchdog>,
    link: &Arc<MessageLink>,
    dram: Option<Arc<dyn DramAllocator>>,
    store: Option<Arc<dyn PersistentStore>>,
) -> Vec<ActionHandle> {
    let mut actions = Vec::new();

    let dog = Arc::clone(watchdog);
    actions.push(dispatcher.register(notify::PANIC, move |_payload| {
        dog.crash(CrashReason::DevicePanic);
        ActionOutcome::Handled
    }));

    let dog = Arc::clone(watchdog);
    actions.push(dispatcher.register(notify::FAULT, move |payload| {
        dog.note_fault(payload.first().copied().unwrap_or(0));
        ActionOutcome::Handled
    }));

    // The alloc responder holds the link weakly: the link owns the
    // dispatch worker that invokes it.
    let weak = Arc::downgrade(link);
    let allocator = dram.clone();
    actions.push(dispatcher.register(notify::DRAM_ALLOC, move |payload| {
        let words = match pair_u32(payload) {
            Some(words) => words,
            None => return ActionOutcome::NotHandled,
        };
        let granted = allocator.as_ref().and_then(|d| d.alloc(words));
        respond_alloc(&weak, granted);
        ActionOutcome::Handled
    }));

    actions.push(dispatcher.register(notify::DRAM_FREE, move |payload| {
        if let (Some(addr), Some(d)) = (pair_u32(payload), dram.as_ref()) {
            d.free(addr);
            debug!(addr = format_args!("{addr:#010x}"), "device freed dram block");
        }
        ActionOutcome::Handled
    }));

    actions.push(dispatcher.register(notify::PS_FLUSH, move |payload| {
        match &store {
            Some(store) => store.flush(payload),
            None => warn!("no persistent store configured, dropping flush record"),
        }
        ActionOutcome::Handled
    }));

    actions
}

fn pair_u32(payload: &[u16]) -> Option<u32> {
    let hi = payload.first()?;
    let lo = payload.get(1)?;
    Some((u32::from(*hi) << 16) | u32::from(*lo))
}

fn respond_alloc(link: &Weak<MessageLink>, granted: Option<u32>) {
    let Some(link) = link.upgrade() else {
        return;
    };
    let msg = match granted {
        Some(addr) => {
            let mut msg = Message::response_to(notify::DRAM_ALLOC, status::OK);
            msg.push_u32(addr);
            msg
        }
        None => Message::response_to(notify::DRAM_ALLOC, status::NO_MEMORY),
    };
    // respond(), not notify(): the device may be sitting on a host
    // request's answer until this allocation is served, and the in-flight
    // lock is held by that very requester.
    if let Err(err) = link.respond(&msg) {
        warn!(%err, "failed to answer dram allocation request");
    }
}
