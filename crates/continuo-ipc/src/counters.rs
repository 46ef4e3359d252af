//! Sequence counter snapshot and transmit/receive gating rules.

use crate::error::Result;
use crate::keyhole::{regs, Keyhole};

/// Snapshot of the four shared-memory sequence counters.
///
/// Each direction carries a sent counter owned by the producer and an
/// acked counter owned by the consumer. Counters are one keyhole word
/// wide and wrap; only equality is ever compared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounters {
    pub host_sent: u16,
    pub host_acked: u16,
    pub device_sent: u16,
    pub device_acked: u16,
}

impl SyncCounters {
    /// Read all four counters through the keyhole.
    pub fn read(keyhole: &dyn Keyhole) -> Result<Self> {
        Ok(Self {
            host_sent: keyhole.read(regs::HOST_SENT)?,
            host_acked: keyhole.read(regs::HOST_ACKED)?,
            device_sent: keyhole.read(regs::DEVICE_SENT)?,
            device_acked: keyhole.read(regs::DEVICE_ACKED)?,
        })
    }

    /// The host may place a new frame only when its last one was consumed.
    pub fn host_settled(&self) -> bool {
        self.host_sent == self.host_acked
    }

    /// An inbound frame is waiting in the receive window.
    pub fn inbound_pending(&self) -> bool {
        self.device_sent != self.device_acked
    }
}
