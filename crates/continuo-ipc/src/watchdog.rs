//! Coprocessor health latch and crash handling.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{error, warn};

/// Why the coprocessor was declared dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashReason {
    /// A frame ack never arrived within the retry budget.
    AckTimeout,
    /// A command response never arrived.
    ResponseTimeout,
    /// The firmware reported a fatal panic.
    DevicePanic,
    /// The sequence counters were inconsistent at the start of a send.
    Desynchronized,
}

impl fmt::Display for CrashReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CrashReason::AckTimeout => "frame ack timeout",
            CrashReason::ResponseTimeout => "command response timeout",
            CrashReason::DevicePanic => "firmware panic",
            CrashReason::Desynchronized => "sequence counter desync",
        };
        write!(f, "{s}")
    }
}

/// Receives the post-mortem capture request after a crash. The capture
/// runs once, off the caller's thread, and is never retried.
pub trait CoredumpSink: Send + Sync {
    fn capture(&self, reason: CrashReason);
}

/// Sink that discards the capture request.
pub struct NoCoredump;

impl CoredumpSink for NoCoredump {
    fn capture(&self, _reason: CrashReason) {}
}

/// One-way health latch for the coprocessor.
///
/// Starts healthy; the first call to [`Watchdog::crash`] wins, records
/// the reason, and kicks off an asynchronous coredump capture. There is
/// no transition back: recovery is a full engine rebuild.
pub struct Watchdog {
    crashed: AtomicBool,
    reason: Mutex<Option<CrashReason>>,
    sink: Arc<dyn CoredumpSink>,
}

impl Watchdog {
    pub fn new(sink: Arc<dyn CoredumpSink>) -> Self {
        Self {
            crashed: AtomicBool::new(false),
            reason: Mutex::new(None),
            sink,
        }
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::Acquire)
    }

    /// Reason recorded by the winning `crash` call, if any.
    pub fn crash_reason(&self) -> Option<CrashReason> {
        *self.reason.lock()
    }

    /// Latch the crashed state. Later calls are no-ops; only the first
    /// reason is recorded and only one coredump capture is started.
    pub fn crash(&self, reason: CrashReason) {
        if self.crashed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.reason.lock() = Some(reason);
        error!(%reason, "coprocessor declared dead");

        let sink = Arc::clone(&self.sink);
        let spawned = thread::Builder::new()
            .name("continuo-coredump".into())
            .spawn(move || sink.capture(reason));
        if spawned.is_err() {
            warn!("failed to spawn coredump capture thread");
        }
    }

    /// Record a non-fatal fault report. Does not change health.
    pub fn note_fault(&self, code: u16) {
        warn!(code = format_args!("{code:#06x}"), "coprocessor fault report");
    }
}
