//! Batched start/stop command assembly.

use continuo_ipc::Message;
use smallvec::SmallVec;

/// Accumulates operator handles during a pipeline walk and flushes them
/// as a single start or stop command, so the firmware applies the whole
/// transition in one scheduling step.
#[derive(Debug)]
pub struct StartStopBatch {
    id: u16,
    handles: SmallVec<[u16; 8]>,
}

impl StartStopBatch {
    pub fn new(id: u16) -> Self {
        Self {
            id,
            handles: SmallVec::new(),
        }
    }

    pub fn push(&mut self, handle: u16) {
        self.handles.push(handle);
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Payload layout: count, then the handles in walk order.
    pub fn into_message(self) -> Message {
        let mut msg = Message::new(self.id);
        msg.push(self.handles.len() as u16);
        for handle in self.handles {
            msg.push(handle);
        }
        msg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use continuo_ipc::message::cmd;

    #[test]
    fn test_batch_message_layout() {
        let mut batch = StartStopBatch::new(cmd::START_OPERATORS);
        batch.push(0x0010);
        batch.push(0x0011);
        assert_eq!(batch.len(), 2);

        let msg = batch.into_message();
        assert_eq!(msg.id(), cmd::START_OPERATORS);
        assert_eq!(msg.payload(), &[2, 0x0010, 0x0011]);
    }
}
