//! Error types for graph and stream operations.

use continuo_ipc::IpcError;
use thiserror::Error;

use crate::component::ComponentIndex;
use crate::pipeline::StreamId;
use crate::stream::StreamState;

/// Error type for graph and stream operations.
#[derive(Error, Debug)]
pub enum GraphError {
    /// The stream cannot open while a conflicting stream is active.
    #[error("{stream} is blocked by active stream {holder}")]
    Busy { stream: StreamId, holder: StreamId },

    /// The operation is not legal in the stream's current state.
    #[error("{stream} is {state}, operation requires {expected}")]
    InvalidState {
        stream: StreamId,
        state: StreamState,
        expected: &'static str,
    },

    /// A pipeline step referenced a component with no device handle.
    #[error("component {0} has not been created on the device")]
    NotCreated(ComponentIndex),

    /// More releases than acquisitions for a component.
    #[error("release underflow on component {0}")]
    ReleaseUnderflow(ComponentIndex),

    /// The coprocessor's response did not carry the expected handle word.
    #[error("short response to command {id:#06x}")]
    ShortResponse { id: u16 },

    /// A device call failed while operating on a specific component.
    #[error("device call failed for component {index}: {source}")]
    Device {
        index: ComponentIndex,
        source: IpcError,
    },

    #[error(transparent)]
    Ipc(#[from] IpcError),
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, GraphError>;
