//! Keyhole IPC transport for the continuo audio coprocessor.
//!
//! The coprocessor exposes a small shared-memory aperture ("keyhole")
//! accessed one 16-bit word at a time. This crate layers on top of it:
//!
//! - [`message`]: variable-length command/response messages and ids
//! - [`frame`]: fixed 8-word wire frames and reassembly
//! - [`counters`]: the four-counter synchronization scheme
//! - [`link`]: the blocking single-outstanding-request transport
//! - [`dispatch`]: handlers for device-originated messages
//! - [`watchdog`]: the one-way crash latch and coredump hook

pub mod counters;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod keyhole;
pub mod link;
pub mod message;
pub mod watchdog;

pub use counters::SyncCounters;
pub use dispatch::{ActionHandle, ActionOutcome, Dispatcher};
pub use error::{FrameError, IpcError, KeyholeError, Result};
pub use keyhole::Keyhole;
pub use link::{LinkConfig, MessageLink};
pub use message::{Message, RESPONSE_FLAG};
pub use watchdog::{CoredumpSink, CrashReason, NoCoredump, Watchdog};
