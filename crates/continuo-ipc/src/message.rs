//! Command/response messages exchanged with the coprocessor.
//!
//! A message is an ordered sequence of 16-bit words. Word 0 is the command
//! id; setting [`RESPONSE_FLAG`] in the id marks the message as a response
//! to the corresponding request, and word 1 of a response is a status word.

use smallvec::SmallVec;

/// Bit set in word 0 to mark a response to the same command id.
pub const RESPONSE_FLAG: u16 = 0x1000;

/// Response status words.
pub mod status {
    /// Command accepted.
    pub const OK: u16 = 0x0000;
    /// Generic failure.
    pub const FAILED: u16 = 0x0001;
    /// Host-side allocation failure servicing a device DRAM request.
    pub const NO_MEMORY: u16 = 0x0002;
}

/// Host-initiated command ids.
pub mod cmd {
    /// Protocol version probe; response payload is the firmware version word.
    pub const VERSION: u16 = 0x0001;
    /// Instantiate an operator; response payload is the operator handle.
    pub const CREATE_OPERATOR: u16 = 0x0002;
    pub const DESTROY_OPERATOR: u16 = 0x0003;
    /// Connect a source handle to a sink handle; response is the link handle.
    pub const CONNECT: u16 = 0x0004;
    pub const DISCONNECT: u16 = 0x0005;
    /// Acquire a source endpoint; response payload is the endpoint handle.
    pub const GET_SOURCE: u16 = 0x0006;
    /// Acquire a sink endpoint; response payload is the endpoint handle.
    pub const GET_SINK: u16 = 0x0007;
    pub const CLOSE_ENDPOINT: u16 = 0x0008;
    /// Write a parameter block into a created operator.
    pub const CONFIGURE_OPERATOR: u16 = 0x0009;
    /// Write a key/value parameter into an endpoint.
    pub const CONFIGURE_ENDPOINT: u16 = 0x000a;
    /// Start N operators atomically: payload is a count then N handles.
    pub const START_OPERATORS: u16 = 0x000b;
    /// Stop N operators atomically: payload is a count then N handles.
    pub const STOP_OPERATORS: u16 = 0x000c;
    /// Tell a mixer which stream currently drives its gain staging.
    pub const SET_PRIMARY_STREAM: u16 = 0x000d;
    /// Program a resampler's conversion ratio (input rate, output rate).
    pub const SET_RESAMPLER_RATE: u16 = 0x000e;
}

/// Coprocessor-initiated message ids, routed through the dispatcher.
pub mod notify {
    /// Fatal firmware panic; the host must treat the coprocessor as dead.
    pub const PANIC: u16 = 0x0100;
    /// Non-fatal fault report; payload word 0 is the fault code.
    pub const FAULT: u16 = 0x0101;
    /// DRAM allocation request; payload is the requested size in words (u32).
    pub const DRAM_ALLOC: u16 = 0x0102;
    /// DRAM free request; payload is the address previously granted (u32).
    pub const DRAM_FREE: u16 = 0x0103;
    /// Persistent-storage flush request; payload is the raw record to write.
    pub const PS_FLUSH: u16 = 0x0104;
}

/// A variable-length protocol message.
///
/// Constructed immediately before transmission and dropped once the
/// transport has consumed it; responses are built by the receive path
/// from reassembled frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    words: SmallVec<[u16; 16]>,
}

impl Message {
    /// New message carrying only a command id.
    pub fn new(id: u16) -> Self {
        let mut words = SmallVec::new();
        words.push(id);
        Self { words }
    }

    /// New message with an id and payload words.
    pub fn with_payload(id: u16, payload: &[u16]) -> Self {
        let mut msg = Self::new(id);
        msg.words.extend_from_slice(payload);
        msg
    }

    /// Build a response to `request_id` with the given status word.
    pub fn response_to(request_id: u16, status: u16) -> Self {
        let mut msg = Self::new(request_id | RESPONSE_FLAG);
        msg.words.push(status);
        msg
    }

    /// Rebuild a message from raw words (reassembly path).
    pub fn from_words(words: &[u16]) -> Self {
        Self {
            words: SmallVec::from_slice(words),
        }
    }

    pub fn push(&mut self, word: u16) -> &mut Self {
        self.words.push(word);
        self
    }

    /// Append a 32-bit value as two words, high word first.
    pub fn push_u32(&mut self, value: u32) -> &mut Self {
        self.words.push((value >> 16) as u16);
        self.words.push(value as u16);
        self
    }

    pub fn id(&self) -> u16 {
        self.words[0]
    }

    pub fn is_response(&self) -> bool {
        self.id() & RESPONSE_FLAG != 0
    }

    /// Status word of a response, if present.
    pub fn status(&self) -> Option<u16> {
        if self.is_response() {
            self.words.get(1).copied()
        } else {
            None
        }
    }

    /// Words after the command id (for responses this includes the status).
    pub fn payload(&self) -> &[u16] {
        &self.words[1..]
    }

    /// Payload word at `index`, counting from after the command id.
    pub fn payload_word(&self, index: usize) -> Option<u16> {
        self.words.get(1 + index).copied()
    }

    /// 32-bit payload value at `index` (two words, high word first).
    pub fn payload_u32(&self, index: usize) -> Option<u32> {
        let hi = self.payload_word(index)?;
        let lo = self.payload_word(index + 1)?;
        Some((u32::from(hi) << 16) | u32::from(lo))
    }

    pub fn words(&self) -> &[u16] {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let mut msg = Message::new(cmd::CREATE_OPERATOR);
        msg.push(0x0007);
        assert_eq!(msg.id(), cmd::CREATE_OPERATOR);
        assert!(!msg.is_response());
        assert_eq!(msg.status(), None);
        assert_eq!(msg.payload(), &[0x0007]);
    }

    #[test]
    fn test_response_shape() {
        let mut msg = Message::response_to(cmd::CONNECT, status::OK);
        msg.push(0x0042);
        assert_eq!(msg.id(), cmd::CONNECT | RESPONSE_FLAG);
        assert!(msg.is_response());
        assert_eq!(msg.status(), Some(status::OK));
        assert_eq!(msg.payload_word(1), Some(0x0042));
    }

    #[test]
    fn test_u32_round_trip() {
        let mut msg = Message::new(notify::DRAM_ALLOC);
        msg.push_u32(0x0002_0000);
        assert_eq!(msg.payload_u32(0), Some(0x0002_0000));
        assert_eq!(msg.payload_u32(1), None);
    }
}
