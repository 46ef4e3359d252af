//! continuo: host-side engine for a fixed-function audio DSP coprocessor.
//!
//! The coprocessor sits behind a keyhole register window and runs a fixed
//! audio topology (mixer, EQ, resamplers, codec endpoints). This crate
//! wires the two halves together:
//!
//! - `continuo-ipc`: fragmented, counter-synchronized message transport
//!   over the keyhole, with a dispatcher for device-originated messages
//!   and a crash watchdog
//! - `continuo-graph`: the refcounted component graph and the four-stream
//!   lifecycle manager on top of it
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use continuo::prelude::*;
//!
//! # fn platform_keyhole() -> Arc<dyn Keyhole> { unimplemented!() }
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = ContinuoEngine::builder()
//!     .keyhole(platform_keyhole())
//!     .build()?;
//!
//! engine.streams().open(StreamId::Playback)?;
//! engine.streams().prepare(
//!     StreamId::Playback,
//!     &StreamParams {
//!         sample_rate: 44_100,
//!         channels: 2,
//!         format: SampleFormat::S16,
//!     },
//! )?;
//! engine.streams().start(StreamId::Playback, ClockRole::Master)?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod engine;

pub use builder::{BuildError, ContinuoEngineBuilder, DramAllocator, PersistentStore};
pub use engine::ContinuoEngine;

pub use continuo_graph as graph;
pub use continuo_ipc as ipc;

/// Common imports for engine users.
pub mod prelude {
    pub use crate::builder::{ContinuoEngineBuilder, DramAllocator, PersistentStore};
    pub use crate::engine::ContinuoEngine;
    pub use continuo_graph::{
        ClockRole, GraphError, SampleFormat, StreamId, StreamManager, StreamParams, StreamState,
    };
    pub use continuo_ipc::{
        CoredumpSink, CrashReason, IpcError, Keyhole, LinkConfig, Message, MessageLink,
    };
}
