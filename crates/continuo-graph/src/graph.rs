//! The refcounted component graph and its device command surface.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use continuo_ipc::message::cmd;
use continuo_ipc::{Message, MessageLink, Watchdog};

use crate::batch::StartStopBatch;
use crate::component::{Component, ComponentIndex, ComponentKind, HANDLE_NONE};
use crate::error::{GraphError, Result};
use crate::pipeline::StreamId;

/// Command channel to the coprocessor. Seam for tests; the production
/// implementation is [`MessageLink`].
pub trait CommandPort: Send + Sync {
    fn request(&self, msg: &Message) -> continuo_ipc::Result<Message>;
    fn notify(&self, msg: &Message) -> continuo_ipc::Result<()>;
}

impl CommandPort for MessageLink {
    fn request(&self, msg: &Message) -> continuo_ipc::Result<Message> {
        MessageLink::request(self, msg)
    }

    fn notify(&self, msg: &Message) -> continuo_ipc::Result<()> {
        MessageLink::notify(self, msg)
    }
}

/// Host-side mirror of the device's processing graph.
///
/// Components materialize on the device the first time a stream needs
/// them and are torn down when the last stream lets go; the table's
/// refcounts carry that sharing. After a crash, teardown is local only:
/// the device-side objects died with the firmware.
pub struct ComponentGraph {
    port: Arc<dyn CommandPort>,
    watchdog: Arc<Watchdog>,
    table: Mutex<Vec<Component>>,
}

impl ComponentGraph {
    pub fn new(port: Arc<dyn CommandPort>, watchdog: Arc<Watchdog>, table: Vec<Component>) -> Self {
        Self {
            port,
            watchdog,
            table: Mutex::new(table),
        }
    }

    /// Acquire a reference to a component, creating it on the device on
    /// the 0 to 1 transition. On a creation failure nothing is retained:
    /// the refcount stays at zero and any half-created object is
    /// destroyed best-effort.
    pub fn execute(&self, idx: ComponentIndex) -> Result<()> {
        let mut table = self.table.lock();
        if table[idx.0].create_refcnt == 0 {
            let kind = table[idx.0].kind;
            let handle = match kind {
                ComponentKind::Operator { class, config } => {
                    self.create_operator(idx, class.wire(), config)?
                }
                ComponentKind::Source { endpoint } => {
                    self.acquire_endpoint(idx, cmd::GET_SOURCE, endpoint)?
                }
                ComponentKind::Sink { endpoint } => {
                    self.acquire_endpoint(idx, cmd::GET_SINK, endpoint)?
                }
                ComponentKind::Link { from, to } => {
                    let from_handle = table[from.0].handle;
                    if from_handle == HANDLE_NONE {
                        return Err(GraphError::NotCreated(from));
                    }
                    let to_handle = table[to.0].handle;
                    if to_handle == HANDLE_NONE {
                        return Err(GraphError::NotCreated(to));
                    }
                    self.connect(idx, from_handle, to_handle)?
                }
            };
            table[idx.0].handle = handle;
            debug!(component = %idx, handle, "component created");
        }
        table[idx.0].create_refcnt += 1;
        Ok(())
    }

    /// Drop a reference, destroying the device object on the 1 to 0
    /// transition. Local state is reset before any device traffic so a
    /// failed teardown still leaves the slot reusable.
    pub fn release(&self, idx: ComponentIndex) -> Result<()> {
        let mut table = self.table.lock();
        let comp = &mut table[idx.0];
        if comp.create_refcnt == 0 {
            return Err(GraphError::ReleaseUnderflow(idx));
        }
        comp.create_refcnt -= 1;
        if comp.create_refcnt > 0 {
            return Ok(());
        }
        if comp.running_refcnt != 0 {
            warn!(component = %idx, running = comp.running_refcnt, "released while running");
            comp.running_refcnt = 0;
        }

        let handle = comp.handle;
        let kind = comp.kind;
        comp.reset();

        if handle == HANDLE_NONE {
            return Ok(());
        }
        if self.watchdog.is_crashed() {
            debug!(component = %idx, "crashed device, local teardown only");
            return Ok(());
        }

        let id = match kind {
            ComponentKind::Operator { .. } => cmd::DESTROY_OPERATOR,
            ComponentKind::Source { .. } | ComponentKind::Sink { .. } => cmd::CLOSE_ENDPOINT,
            ComponentKind::Link { .. } => cmd::DISCONNECT,
        };
        self.port
            .request(&Message::with_payload(id, &[handle]))
            .map_err(|source| GraphError::Device { index: idx, source })?;
        debug!(component = %idx, handle, "component destroyed");
        Ok(())
    }

    /// Start every operator in `pipeline` that is not yet running, as a
    /// single batched command, then bump their running refcounts.
    pub fn start_batch(&self, pipeline: &[ComponentIndex]) -> Result<()> {
        let mut table = self.table.lock();
        let mut batch = StartStopBatch::new(cmd::START_OPERATORS);
        for &idx in pipeline {
            let comp = &table[idx.0];
            if !comp.is_operator() {
                continue;
            }
            if !comp.is_created() {
                return Err(GraphError::NotCreated(idx));
            }
            if comp.running_refcnt == 0 {
                batch.push(comp.handle);
            }
        }
        if !batch.is_empty() {
            debug!(operators = batch.len(), "starting operators");
            self.port.request(&batch.into_message())?;
        }
        for &idx in pipeline {
            let comp = &mut table[idx.0];
            if comp.is_operator() {
                comp.running_refcnt += 1;
            }
        }
        Ok(())
    }

    /// Stop, in one batched command, every operator in `pipeline` whose
    /// running refcount would reach zero, then drop the counts. A device
    /// rejection leaves the counts untouched so the stop is retryable.
    /// Skips device traffic after a crash; the bookkeeping still runs so
    /// release sees zeros.
    pub fn stop_batch(&self, pipeline: &[ComponentIndex]) -> Result<()> {
        let mut table = self.table.lock();
        let mut batch = StartStopBatch::new(cmd::STOP_OPERATORS);
        for &idx in pipeline {
            let comp = &table[idx.0];
            if !comp.is_operator() {
                continue;
            }
            if comp.running_refcnt == 0 {
                return Err(GraphError::ReleaseUnderflow(idx));
            }
            if comp.running_refcnt == 1 {
                batch.push(comp.handle);
            }
        }
        if !batch.is_empty() && !self.watchdog.is_crashed() {
            debug!(operators = batch.len(), "stopping operators");
            self.port.request(&batch.into_message())?;
        }
        for &idx in pipeline {
            let comp = &mut table[idx.0];
            if comp.is_operator() {
                comp.running_refcnt -= 1;
            }
        }
        Ok(())
    }

    /// Point a mixer's gain staging at `stream`. Returns whether a device
    /// command was sent: the call is a no-op when the winner is unchanged
    /// or the mixer does not exist yet.
    pub fn set_primary(&self, idx: ComponentIndex, stream: Option<StreamId>) -> Result<bool> {
        let mut table = self.table.lock();
        let comp = &mut table[idx.0];
        if !comp.is_created() || comp.primary == stream {
            return Ok(false);
        }
        if self.watchdog.is_crashed() {
            return Ok(false);
        }
        let wire = stream.map_or(HANDLE_NONE, StreamId::wire);
        self.port
            .request(&Message::with_payload(
                cmd::SET_PRIMARY_STREAM,
                &[comp.handle, wire],
            ))
            .map_err(|source| GraphError::Device { index: idx, source })?;
        comp.primary = stream;
        Ok(true)
    }

    /// Program a resampler's conversion ratio. Declined (returns false)
    /// while the resampler is running; the rate that got there first
    /// stays in effect until everything using it stops.
    pub fn set_resampler_rate(
        &self,
        idx: ComponentIndex,
        input_rate: u32,
        output_rate: u32,
    ) -> Result<bool> {
        let table = self.table.lock();
        let comp = &table[idx.0];
        if !comp.is_created() {
            return Err(GraphError::NotCreated(idx));
        }
        if comp.running_refcnt != 0 {
            debug!(component = %idx, "resampler running, keeping existing rate");
            return Ok(false);
        }
        let mut msg = Message::with_payload(cmd::SET_RESAMPLER_RATE, &[comp.handle]);
        msg.push_u32(input_rate).push_u32(output_rate);
        self.port
            .request(&msg)
            .map_err(|source| GraphError::Device { index: idx, source })?;
        Ok(true)
    }

    /// Write one key/value parameter into a created endpoint.
    pub fn configure_endpoint(
        &self,
        idx: ComponentIndex,
        key: u16,
        values: &[u16],
    ) -> Result<()> {
        let table = self.table.lock();
        let comp = &table[idx.0];
        if !comp.is_created() {
            return Err(GraphError::NotCreated(idx));
        }
        let mut msg = Message::with_payload(cmd::CONFIGURE_ENDPOINT, &[comp.handle, key]);
        for &v in values {
            msg.push(v);
        }
        self.port
            .request(&msg)
            .map_err(|source| GraphError::Device { index: idx, source })?;
        Ok(())
    }

    /// Refcount snapshot `(create, running)` for a component.
    pub fn refcounts(&self, idx: ComponentIndex) -> (u32, u32) {
        let table = self.table.lock();
        (table[idx.0].create_refcnt, table[idx.0].running_refcnt)
    }

    /// Device handle of a component, if created.
    pub fn handle(&self, idx: ComponentIndex) -> Option<u16> {
        let table = self.table.lock();
        let comp = &table[idx.0];
        comp.is_created().then_some(comp.handle)
    }

    fn create_operator(
        &self,
        idx: ComponentIndex,
        class: u16,
        config: &[&[u16]],
    ) -> Result<u16> {
        let resp = self
            .port
            .request(&Message::with_payload(cmd::CREATE_OPERATOR, &[class]))
            .map_err(|source| GraphError::Device { index: idx, source })?;
        let handle = handle_word(&resp, cmd::CREATE_OPERATOR)?;

        for block in config {
            let mut msg = Message::with_payload(cmd::CONFIGURE_OPERATOR, &[handle]);
            for &word in *block {
                msg.push(word);
            }
            if let Err(source) = self.port.request(&msg) {
                // Cleanup, not retry: the half-configured operator must
                // not leak a device slot.
                let destroy = Message::with_payload(cmd::DESTROY_OPERATOR, &[handle]);
                if let Err(err) = self.port.request(&destroy) {
                    warn!(component = %idx, %err, "cleanup destroy failed");
                }
                return Err(GraphError::Device { index: idx, source });
            }
        }
        Ok(handle)
    }

    fn acquire_endpoint(&self, idx: ComponentIndex, id: u16, endpoint: u16) -> Result<u16> {
        let resp = self
            .port
            .request(&Message::with_payload(id, &[endpoint]))
            .map_err(|source| GraphError::Device { index: idx, source })?;
        handle_word(&resp, id)
    }

    fn connect(&self, idx: ComponentIndex, from: u16, to: u16) -> Result<u16> {
        let resp = self
            .port
            .request(&Message::with_payload(cmd::CONNECT, &[from, to]))
            .map_err(|source| GraphError::Device { index: idx, source })?;
        handle_word(&resp, cmd::CONNECT)
    }
}

/// Handle carried in a response's first payload word after the status.
fn handle_word(resp: &Message, id: u16) -> Result<u16> {
    resp.payload_word(1).ok_or(GraphError::ShortResponse { id })
}

#[cfg(test)]
pub(crate) mod test_port {
    use super::*;
    use continuo_ipc::message::status;
    use continuo_ipc::IpcError;
    use std::sync::atomic::{AtomicU16, Ordering};

    /// Scripted coprocessor: answers every request with OK plus a fresh
    /// handle, unless told to fail a particular command id.
    pub struct MockPort {
        pub log: Mutex<Vec<Message>>,
        next_handle: AtomicU16,
        pub fail_id: Mutex<Option<u16>>,
    }

    impl MockPort {
        pub fn new() -> Arc<Self> {
            Arc::new(Self {
                log: Mutex::new(Vec::new()),
                next_handle: AtomicU16::new(0x0010),
                fail_id: Mutex::new(None),
            })
        }

        pub fn sent_ids(&self) -> Vec<u16> {
            self.log.lock().iter().map(Message::id).collect()
        }

        pub fn count_of(&self, id: u16) -> usize {
            self.log.lock().iter().filter(|m| m.id() == id).count()
        }
    }

    impl CommandPort for MockPort {
        fn request(&self, msg: &Message) -> continuo_ipc::Result<Message> {
            self.log.lock().push(msg.clone());
            if *self.fail_id.lock() == Some(msg.id()) {
                return Err(IpcError::CommandFailed {
                    id: msg.id(),
                    status: status::FAILED,
                });
            }
            let mut resp = Message::response_to(msg.id(), status::OK);
            resp.push(self.next_handle.fetch_add(1, Ordering::SeqCst));
            Ok(resp)
        }

        fn notify(&self, msg: &Message) -> continuo_ipc::Result<()> {
            self.log.lock().push(msg.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_port::MockPort;
    use super::*;
    use crate::pipeline::{build_component_table, MAIN_MIXER, MUSIC_RESAMPLER};
    use continuo_ipc::{CrashReason, NoCoredump};

    fn make_graph(port: Arc<MockPort>) -> (ComponentGraph, Arc<Watchdog>) {
        let watchdog = Arc::new(Watchdog::new(Arc::new(NoCoredump)));
        let graph = ComponentGraph::new(port, Arc::clone(&watchdog), build_component_table());
        (graph, watchdog)
    }

    #[test]
    fn test_shared_component_created_once() {
        let port = MockPort::new();
        let (graph, _) = make_graph(port.clone());

        graph.execute(MAIN_MIXER).unwrap();
        graph.execute(MAIN_MIXER).unwrap();
        assert_eq!(graph.refcounts(MAIN_MIXER), (2, 0));
        assert_eq!(port.count_of(cmd::CREATE_OPERATOR), 1);

        graph.release(MAIN_MIXER).unwrap();
        assert_eq!(port.count_of(cmd::DESTROY_OPERATOR), 0);
        graph.release(MAIN_MIXER).unwrap();
        assert_eq!(port.count_of(cmd::DESTROY_OPERATOR), 1);
        assert_eq!(graph.handle(MAIN_MIXER), None);
    }

    #[test]
    fn test_release_underflow_rejected() {
        let port = MockPort::new();
        let (graph, _) = make_graph(port);
        assert!(matches!(
            graph.release(MAIN_MIXER),
            Err(GraphError::ReleaseUnderflow(MAIN_MIXER))
        ));
    }

    #[test]
    fn test_configure_failure_destroys_half_created_operator() {
        let port = MockPort::new();
        let (graph, _) = make_graph(port.clone());
        *port.fail_id.lock() = Some(cmd::CONFIGURE_OPERATOR);

        let err = graph.execute(MAIN_MIXER).unwrap_err();
        assert!(matches!(err, GraphError::Device { index, .. } if index == MAIN_MIXER));
        assert_eq!(port.count_of(cmd::DESTROY_OPERATOR), 1);
        assert_eq!(graph.refcounts(MAIN_MIXER), (0, 0));
        assert_eq!(graph.handle(MAIN_MIXER), None);

        // The slot is reusable once the device behaves again.
        *port.fail_id.lock() = None;
        graph.execute(MAIN_MIXER).unwrap();
        assert_eq!(graph.refcounts(MAIN_MIXER), (1, 0));
    }

    #[test]
    fn test_link_requires_created_endpoints() {
        let port = MockPort::new();
        let (graph, _) = make_graph(port);
        let err = graph.execute(crate::pipeline::LINK_MUSIC_MIX).unwrap_err();
        assert!(matches!(err, GraphError::NotCreated(MUSIC_RESAMPLER)));
    }

    #[test]
    fn test_start_batch_skips_running_operators() {
        let port = MockPort::new();
        let (graph, _) = make_graph(port.clone());
        graph.execute(MAIN_MIXER).unwrap();
        graph.execute(MAIN_MIXER).unwrap();

        graph.start_batch(&[MAIN_MIXER]).unwrap();
        graph.start_batch(&[MAIN_MIXER]).unwrap();
        assert_eq!(graph.refcounts(MAIN_MIXER), (2, 2));
        // The second start found the mixer already running.
        assert_eq!(port.count_of(cmd::START_OPERATORS), 1);

        graph.stop_batch(&[MAIN_MIXER]).unwrap();
        assert_eq!(port.count_of(cmd::STOP_OPERATORS), 0);
        graph.stop_batch(&[MAIN_MIXER]).unwrap();
        assert_eq!(port.count_of(cmd::STOP_OPERATORS), 1);
        assert_eq!(graph.refcounts(MAIN_MIXER), (2, 0));
    }

    #[test]
    fn test_stop_batch_failure_keeps_counts() {
        let port = MockPort::new();
        let (graph, _) = make_graph(port.clone());
        graph.execute(MAIN_MIXER).unwrap();
        graph.start_batch(&[MAIN_MIXER]).unwrap();

        *port.fail_id.lock() = Some(cmd::STOP_OPERATORS);
        assert!(graph.stop_batch(&[MAIN_MIXER]).is_err());
        // The mixer is still accounted as running; no underflow pending.
        assert_eq!(graph.refcounts(MAIN_MIXER), (1, 1));

        *port.fail_id.lock() = None;
        graph.stop_batch(&[MAIN_MIXER]).unwrap();
        assert_eq!(graph.refcounts(MAIN_MIXER), (1, 0));
        assert_eq!(port.count_of(cmd::STOP_OPERATORS), 2);
    }

    #[test]
    fn test_crashed_release_is_local_only() {
        let port = MockPort::new();
        let (graph, watchdog) = make_graph(port.clone());
        graph.execute(MAIN_MIXER).unwrap();
        watchdog.crash(CrashReason::DevicePanic);

        graph.release(MAIN_MIXER).unwrap();
        assert_eq!(port.count_of(cmd::DESTROY_OPERATOR), 0);
        assert_eq!(graph.handle(MAIN_MIXER), None);
        assert_eq!(graph.refcounts(MAIN_MIXER), (0, 0));
    }

    #[test]
    fn test_set_primary_sends_only_on_change() {
        let port = MockPort::new();
        let (graph, _) = make_graph(port.clone());
        graph.execute(MAIN_MIXER).unwrap();

        assert!(graph
            .set_primary(MAIN_MIXER, Some(StreamId::Playback))
            .unwrap());
        assert!(!graph
            .set_primary(MAIN_MIXER, Some(StreamId::Playback))
            .unwrap());
        assert!(graph
            .set_primary(MAIN_MIXER, Some(StreamId::VoiceCall))
            .unwrap());
        assert_eq!(port.count_of(cmd::SET_PRIMARY_STREAM), 2);
    }

    #[test]
    fn test_resampler_rate_first_wins() {
        let port = MockPort::new();
        let (graph, _) = make_graph(port.clone());
        graph.execute(MUSIC_RESAMPLER).unwrap();

        assert!(graph.set_resampler_rate(MUSIC_RESAMPLER, 44_100, 48_000).unwrap());
        graph.start_batch(&[MUSIC_RESAMPLER]).unwrap();
        assert!(!graph.set_resampler_rate(MUSIC_RESAMPLER, 96_000, 48_000).unwrap());
        assert_eq!(port.count_of(cmd::SET_RESAMPLER_RATE), 1);
    }
}
