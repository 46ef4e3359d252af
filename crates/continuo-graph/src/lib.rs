//! Refcounted component graph and stream lifecycle for the continuo
//! audio coprocessor.
//!
//! The device runs a fixed processing topology; the host mirrors it as a
//! table of refcounted components ([`graph`]) and drives four streams
//! through open/prepare/start/stop/destroy against it ([`stream`]).

pub mod batch;
pub mod component;
pub mod error;
pub mod graph;
pub mod pipeline;
pub mod stream;

pub use component::{Component, ComponentIndex, ComponentKind, OperatorClass, HANDLE_NONE};
pub use error::{GraphError, Result};
pub use graph::{CommandPort, ComponentGraph};
pub use pipeline::{
    build_component_table, elect_primary, topology, ActiveStreamSet, StreamId, NATIVE_RATE,
};
pub use stream::{ClockRole, SampleFormat, StreamManager, StreamParams, StreamState};
