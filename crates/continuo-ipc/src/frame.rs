//! Fixed-size hardware frame codec.
//!
//! The keyhole window moves exactly [`FRAME_WORDS`] words per interrupt, so
//! variable-length messages are split into a frame sequence: a single
//! COMPLETE frame when the message fits, otherwise START followed by zero
//! or more CONTINUE frames and exactly one END. COMPLETE and START carry
//! the total message length so the receiver can pre-size its buffer and
//! detect overruns.

use crate::error::FrameError;
use crate::message::Message;

/// Words per hardware frame, including the control word.
pub const FRAME_WORDS: usize = 8;

/// Payload capacity of COMPLETE and START frames (control + length prefix).
pub const HEAD_CAPACITY: usize = FRAME_WORDS - 2;

/// Payload capacity of CONTINUE and END frames (control word only).
pub const BODY_CAPACITY: usize = FRAME_WORDS - 1;

/// Hard protocol limit on message length in words.
pub const MAX_MESSAGE_WORDS: usize = 256;

const KIND_SHIFT: u16 = 14;
const COUNT_MASK: u16 = 0x003f;

/// One keyhole window's worth of words.
pub type RawFrame = [u16; FRAME_WORDS];

/// Transport frame kind, encoded in the top bits of the control word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Complete,
    Start,
    Continue,
    End,
}

impl FrameKind {
    fn tag(self) -> u16 {
        match self {
            FrameKind::Complete => 0,
            FrameKind::Start => 1,
            FrameKind::Continue => 2,
            FrameKind::End => 3,
        }
    }

    fn from_control(word: u16) -> Self {
        match (word >> KIND_SHIFT) & 0b11 {
            0 => FrameKind::Complete,
            1 => FrameKind::Start,
            2 => FrameKind::Continue,
            _ => FrameKind::End,
        }
    }
}

/// Kind and payload count of a raw frame.
pub fn inspect(frame: &RawFrame) -> (FrameKind, usize) {
    let control = frame[0];
    (
        FrameKind::from_control(control),
        usize::from(control & COUNT_MASK),
    )
}

fn pack(kind: FrameKind, total: Option<usize>, payload: &[u16]) -> RawFrame {
    let mut frame = [0u16; FRAME_WORDS];
    frame[0] = (kind.tag() << KIND_SHIFT) | payload.len() as u16;
    let body = match total {
        Some(total) => {
            frame[1] = total as u16;
            &mut frame[2..]
        }
        None => &mut frame[1..],
    };
    body[..payload.len()].copy_from_slice(payload);
    frame
}

/// Split a message into its wire frame sequence.
///
/// A message of at most [`HEAD_CAPACITY`] words becomes one COMPLETE frame;
/// anything longer becomes START + CONTINUE* + END with exactly one
/// terminal frame.
pub fn split(msg: &Message) -> Result<Vec<RawFrame>, FrameError> {
    let words = msg.words();
    if words.is_empty() {
        return Err(FrameError::Empty);
    }
    if words.len() > MAX_MESSAGE_WORDS {
        return Err(FrameError::TooLong(words.len()));
    }

    if words.len() <= HEAD_CAPACITY {
        return Ok(vec![pack(FrameKind::Complete, Some(words.len()), words)]);
    }

    let mut frames = Vec::with_capacity(2 + (words.len() - HEAD_CAPACITY) / BODY_CAPACITY);
    frames.push(pack(
        FrameKind::Start,
        Some(words.len()),
        &words[..HEAD_CAPACITY],
    ));

    let mut rest = &words[HEAD_CAPACITY..];
    while rest.len() > BODY_CAPACITY {
        frames.push(pack(FrameKind::Continue, None, &rest[..BODY_CAPACITY]));
        rest = &rest[BODY_CAPACITY..];
    }
    frames.push(pack(FrameKind::End, None, rest));
    Ok(frames)
}

/// Per-direction reassembly state machine.
///
/// Feeds on raw frames in arrival order and yields a [`Message`] when a
/// terminal frame lands. Rejects orphan continuations, nested starts and
/// payloads that disagree with the declared total length.
#[derive(Debug, Default)]
pub struct Reassembler {
    buf: Vec<u16>,
    expected: usize,
    open: bool,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while a multi-frame message is partially assembled.
    pub fn in_progress(&self) -> bool {
        self.open
    }

    /// Drop any partial reassembly (used on crash recovery).
    pub fn reset(&mut self) {
        self.buf.clear();
        self.expected = 0;
        self.open = false;
    }

    /// Feed one frame; returns a complete message when one terminates here.
    pub fn push(&mut self, frame: &RawFrame) -> Result<Option<Message>, FrameError> {
        let (kind, count) = inspect(frame);
        match kind {
            FrameKind::Complete => {
                if self.open {
                    return Err(FrameError::NestedStart);
                }
                if count > HEAD_CAPACITY {
                    return Err(FrameError::BadPayloadLength(count));
                }
                let total = usize::from(frame[1]);
                if total != count {
                    return Err(if total > count {
                        FrameError::Truncated
                    } else {
                        FrameError::Overrun
                    });
                }
                Ok(Some(Message::from_words(&frame[2..2 + count])))
            }
            FrameKind::Start => {
                if self.open {
                    return Err(FrameError::NestedStart);
                }
                if count > HEAD_CAPACITY {
                    return Err(FrameError::BadPayloadLength(count));
                }
                let total = usize::from(frame[1]);
                if count >= total {
                    return Err(FrameError::Overrun);
                }
                self.open = true;
                self.expected = total;
                self.buf.clear();
                self.buf.extend_from_slice(&frame[2..2 + count]);
                Ok(None)
            }
            FrameKind::Continue => {
                if !self.open {
                    return Err(FrameError::OrphanContinuation);
                }
                if count > BODY_CAPACITY {
                    return Err(FrameError::BadPayloadLength(count));
                }
                self.buf.extend_from_slice(&frame[1..1 + count]);
                if self.buf.len() >= self.expected {
                    self.reset();
                    return Err(FrameError::Overrun);
                }
                Ok(None)
            }
            FrameKind::End => {
                if !self.open {
                    return Err(FrameError::OrphanContinuation);
                }
                if count > BODY_CAPACITY {
                    return Err(FrameError::BadPayloadLength(count));
                }
                self.buf.extend_from_slice(&frame[1..1 + count]);
                let result = if self.buf.len() == self.expected {
                    Ok(Some(Message::from_words(&self.buf)))
                } else if self.buf.len() > self.expected {
                    Err(FrameError::Overrun)
                } else {
                    Err(FrameError::Truncated)
                };
                self.reset();
                result
            }
        }
    }
}
