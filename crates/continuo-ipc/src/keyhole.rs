//! Word-granularity access to the coprocessor's shared-memory window.

use crate::error::KeyholeError;

/// Register word offsets inside the keyhole aperture.
pub mod regs {
    /// Host transmit sequence counter (host writes).
    pub const HOST_SENT: u16 = 0x00;
    /// Host transmit ack counter (device writes).
    pub const HOST_ACKED: u16 = 0x01;
    /// Device transmit sequence counter (device writes).
    pub const DEVICE_SENT: u16 = 0x02;
    /// Device transmit ack counter (host writes).
    pub const DEVICE_ACKED: u16 = 0x03;
    /// Base of the host-to-device frame window.
    pub const TX_WINDOW: u16 = 0x10;
    /// Base of the device-to-host frame window.
    pub const RX_WINDOW: u16 = 0x20;
}

/// Access to the coprocessor's register aperture, one 16-bit word at a
/// time. The platform layer implements this over whatever bus the part
/// exposes; tests implement it over an in-memory register file.
///
/// Implementations must tolerate concurrent calls: the transmit path and
/// the interrupt-driven receive path touch disjoint registers but run on
/// different threads.
pub trait Keyhole: Send + Sync {
    fn read(&self, addr: u16) -> Result<u16, KeyholeError>;
    fn write(&self, addr: u16, value: u16) -> Result<(), KeyholeError>;
}
