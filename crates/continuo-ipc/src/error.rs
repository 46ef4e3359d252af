//! Error types for the keyhole IPC transport.

use crate::watchdog::CrashReason;
use thiserror::Error;

/// Error type for IPC operations.
#[derive(Error, Debug)]
pub enum IpcError {
    /// An ack or response never arrived. Fatal: the watchdog has already
    /// latched the crashed state by the time this is returned.
    #[error("protocol timeout waiting for {operation} after {duration_ms}ms")]
    ProtocolTimeout {
        operation: &'static str,
        duration_ms: u64,
    },

    /// A response arrived carrying the wrong command id. Local failure,
    /// does not crash the subsystem.
    #[error("response mismatch: expected id {expected:#06x}, got {got:#06x}")]
    ResponseMismatch { expected: u16, got: u16 },

    /// The coprocessor answered with a non-success status word.
    #[error("command {id:#06x} rejected by the coprocessor with status {status:#06x}")]
    CommandFailed { id: u16, status: u16 },

    /// The send/ack checkpoint was not settled when a new exchange began.
    #[error("sequence counters desynchronized (host_sent={host_sent}, host_acked={host_acked})")]
    Desynchronized { host_sent: u16, host_acked: u16 },

    /// The watchdog has declared the coprocessor dead; no further protocol
    /// traffic is attempted.
    #[error("coprocessor unavailable after crash: {0}")]
    DeviceUnavailable(CrashReason),

    #[error("message framing error: {0}")]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Keyhole(#[from] KeyholeError),
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, IpcError>;

/// Errors from frame splitting and reassembly.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    #[error("cannot frame an empty message")]
    Empty,

    #[error("message of {0} words exceeds the protocol limit")]
    TooLong(usize),

    #[error("continuation frame with no reassembly in progress")]
    OrphanContinuation,

    #[error("start frame while a reassembly is in progress")]
    NestedStart,

    #[error("frame declares {0} payload words, over the window capacity")]
    BadPayloadLength(usize),

    #[error("frame payload overruns the declared message length")]
    Overrun,

    #[error("terminal frame leaves the message short of its declared length")]
    Truncated,
}

/// A word access through the keyhole window failed at the bus level.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("keyhole access fault at word {addr:#06x}")]
pub struct KeyholeError {
    pub addr: u16,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = IpcError::ProtocolTimeout {
            operation: "frame ack",
            duration_ms: 250,
        };
        assert!(err.to_string().contains("frame ack"));
        assert!(err.to_string().contains("250ms"));

        let err = IpcError::ResponseMismatch {
            expected: 0x1002,
            got: 0x1003,
        };
        assert!(err.to_string().contains("0x1002"));
        assert!(err.to_string().contains("0x1003"));

        let err = IpcError::Keyhole(KeyholeError { addr: 0x10 });
        assert!(err.to_string().contains("0x0010"));
    }
}
