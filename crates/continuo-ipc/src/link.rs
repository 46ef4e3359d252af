//! The message link: framing, pacing and response correlation over the
//! keyhole window.
//!
//! One request may be outstanding at a time across the whole subsystem.
//! The in-flight lock is held from the first frame of a request until its
//! response is consumed, so callers on other threads simply queue behind
//! it. Inbound traffic is pumped by the platform's frame-ready interrupt
//! calling [`MessageLink::pump_inbound`]; responses are handed to the
//! waiting sender while device-originated requests go to a dispatch
//! worker thread.
//!
//! Host-to-device answers to those device requests go through
//! [`MessageLink::respond`], which paces on the transmit window alone and
//! never queues behind the in-flight exchange.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::counters::SyncCounters;
use crate::dispatch::Dispatcher;
use crate::error::{IpcError, Result};
use crate::frame::{split, RawFrame, Reassembler, FRAME_WORDS};
use crate::keyhole::{regs, Keyhole};
use crate::message::{status, Message, RESPONSE_FLAG};
use crate::watchdog::{CrashReason, Watchdog};

/// Timing knobs for the transport.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Ack polls attempted before the watchdog declares the device dead.
    pub ack_retries: u32,
    /// Delay between ack polls.
    pub ack_poll_interval: Duration,
    /// How long a request waits for its response message.
    pub response_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ack_retries: 50,
            ack_poll_interval: Duration::from_micros(500),
            response_timeout: Duration::from_millis(2000),
        }
    }
}

impl LinkConfig {
    fn ack_budget_ms(&self) -> u64 {
        // Sub-millisecond poll intervals must not truncate to a zero
        // budget; sum in microseconds and convert once.
        let micros = u128::from(self.ack_retries) * self.ack_poll_interval.as_micros();
        (micros / 1000) as u64
    }
}

pub struct MessageLink {
    keyhole: Arc<dyn Keyhole>,
    watchdog: Arc<Watchdog>,
    config: LinkConfig,
    /// Serializes whole exchanges; held across send + response wait.
    in_flight: Mutex<()>,
    /// Guards the transmit window itself. Host-to-device responses take
    /// only this lock: while a requester blocks for its answer its frames
    /// are already sent and acked, so the window is free, and contending
    /// the in-flight lock would deadlock against a device that withholds
    /// that answer until its own request is served.
    tx_window: Mutex<()>,
    /// Id of the request currently awaiting a response. Separate lock:
    /// the receive path reads it while the sender holds `in_flight`.
    pending: Mutex<Option<u16>>,
    response_tx: Sender<Message>,
    response_rx: Receiver<Message>,
    rx: Mutex<Reassembler>,
    inbound_tx: Sender<Message>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl MessageLink {
    pub fn new(
        keyhole: Arc<dyn Keyhole>,
        watchdog: Arc<Watchdog>,
        dispatcher: Arc<Dispatcher>,
        config: LinkConfig,
    ) -> Self {
        let (response_tx, response_rx) = bounded(1);
        let (inbound_tx, inbound_rx) = bounded::<Message>(32);
        let running = Arc::new(AtomicBool::new(true));

        let worker = {
            let running = Arc::clone(&running);
            thread::Builder::new()
                .name("continuo-dispatch".into())
                .spawn(move || {
                    while running.load(Ordering::Relaxed) {
                        match inbound_rx.recv_timeout(Duration::from_millis(100)) {
                            Ok(msg) => {
                                dispatcher.dispatch(msg.id(), msg.payload());
                            }
                            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
                            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                        }
                    }
                })
                .ok()
        };

        Self {
            keyhole,
            watchdog,
            config,
            in_flight: Mutex::new(()),
            tx_window: Mutex::new(()),
            pending: Mutex::new(None),
            response_tx,
            response_rx,
            rx: Mutex::new(Reassembler::new()),
            inbound_tx,
            running,
            worker: Mutex::new(worker),
        }
    }

    /// Send a command and block until its response arrives.
    pub fn request(&self, msg: &Message) -> Result<Message> {
        let _guard = self.in_flight.lock();
        self.drain_stale_responses();
        *self.pending.lock() = Some(msg.id());
        let sent = self.transmit(msg, true);
        if let Err(err) = sent {
            *self.pending.lock() = None;
            return Err(err);
        }
        self.await_response_locked(msg.id())
    }

    /// Like [`MessageLink::request`], but drives the receive path itself
    /// by polling the keyhole instead of relying on the interrupt pump.
    /// Used before the platform's interrupt wiring is up, e.g. for the
    /// version handshake during engine construction.
    pub fn request_polling(&self, msg: &Message) -> Result<Message> {
        let _guard = self.in_flight.lock();
        self.drain_stale_responses();
        *self.pending.lock() = Some(msg.id());
        if let Err(err) = self.transmit(msg, true) {
            *self.pending.lock() = None;
            return Err(err);
        }

        let deadline = Instant::now() + self.config.response_timeout;
        loop {
            self.pump_inbound()?;
            if let Ok(response) = self.response_rx.try_recv() {
                *self.pending.lock() = None;
                return self.validate_response(msg.id(), response);
            }
            if Instant::now() >= deadline {
                *self.pending.lock() = None;
                self.watchdog.crash(CrashReason::ResponseTimeout);
                return Err(IpcError::ProtocolTimeout {
                    operation: "command response",
                    duration_ms: self.config.response_timeout.as_millis() as u64,
                });
            }
            thread::sleep(self.config.ack_poll_interval);
        }
    }

    /// Send a message that expects no response, waiting for the final
    /// frame's ack.
    pub fn notify(&self, msg: &Message) -> Result<()> {
        let _guard = self.in_flight.lock();
        self.transmit(msg, true)
    }

    /// Send without waiting for the final ack. Inter-frame pacing still
    /// applies; only the last settle wait is skipped.
    pub fn send_unacked(&self, msg: &Message) -> Result<()> {
        let _guard = self.in_flight.lock();
        self.transmit(msg, false)
    }

    /// Answer a device-originated request. Does not queue behind the
    /// in-flight exchange: the device may be holding its own response to
    /// that exchange hostage until this one goes out.
    pub fn respond(&self, msg: &Message) -> Result<()> {
        self.transmit(msg, true)
    }

    /// Drain the receive window. Called from the platform's frame-ready
    /// interrupt bottom half; safe to call spuriously.
    pub fn pump_inbound(&self) -> Result<()> {
        loop {
            let counters = SyncCounters::read(self.keyhole.as_ref())?;
            if !counters.inbound_pending() {
                return Ok(());
            }

            let mut frame: RawFrame = [0; FRAME_WORDS];
            for (i, word) in frame.iter_mut().enumerate() {
                *word = self.keyhole.read(regs::RX_WINDOW + i as u16)?;
            }
            let acked = counters.device_acked.wrapping_add(1);
            self.keyhole.write(regs::DEVICE_ACKED, acked)?;

            let mut rx = self.rx.lock();
            match rx.push(&frame) {
                Ok(Some(msg)) => {
                    drop(rx);
                    self.route_inbound(msg);
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(%err, "dropping malformed inbound frame sequence");
                    rx.reset();
                }
            }
        }
    }

    fn route_inbound(&self, msg: Message) {
        if msg.is_response() {
            // Deliver even on id mismatch so the waiter can report it.
            if self.pending.lock().is_some() {
                if self.response_tx.try_send(msg).is_err() {
                    warn!("response slot full, dropping inbound response");
                }
            } else {
                warn!(
                    id = format_args!("{:#06x}", msg.id()),
                    "unsolicited response dropped"
                );
            }
        } else if self.inbound_tx.try_send(msg).is_err() {
            warn!("dispatch queue full, dropping device message");
        }
    }

    /// Discard any response left behind by an earlier failed exchange.
    /// Only safe under the in-flight lock: with no requester active, a
    /// queued response is stale by definition.
    fn drain_stale_responses(&self) {
        while self.response_rx.try_recv().is_ok() {}
    }

    fn transmit(&self, msg: &Message, final_ack: bool) -> Result<()> {
        let _tx = self.tx_window.lock();

        if let Some(reason) = self.watchdog.crash_reason() {
            return Err(IpcError::DeviceUnavailable(reason));
        }

        let frames = split(msg)?;

        let counters = SyncCounters::read(self.keyhole.as_ref())?;
        if !counters.host_settled() {
            if final_ack {
                // An acked exchange expects the previous checkpoint to be
                // settled; anything else means the two sides disagree.
                self.watchdog.crash(CrashReason::Desynchronized);
                return Err(IpcError::Desynchronized {
                    host_sent: counters.host_sent,
                    host_acked: counters.host_acked,
                });
            }
            // An earlier unacked frame may still be in the window; pace
            // against it instead of overwriting it.
            self.wait_for_ack()?;
        }

        debug!(
            id = format_args!("{:#06x}", msg.id()),
            frames = frames.len(),
            "transmitting message"
        );

        for (i, frame) in frames.iter().enumerate() {
            if i > 0 {
                self.wait_for_ack()?;
            }
            for (offset, word) in frame.iter().enumerate() {
                self.keyhole.write(regs::TX_WINDOW + offset as u16, *word)?;
            }
            let sent = self.keyhole.read(regs::HOST_SENT)?.wrapping_add(1);
            self.keyhole.write(regs::HOST_SENT, sent)?;
        }

        if final_ack {
            self.wait_for_ack()?;
        }
        Ok(())
    }

    fn wait_for_ack(&self) -> Result<()> {
        for _ in 0..self.config.ack_retries {
            let counters = SyncCounters::read(self.keyhole.as_ref())?;
            if counters.host_settled() {
                return Ok(());
            }
            thread::sleep(self.config.ack_poll_interval);
        }
        self.watchdog.crash(CrashReason::AckTimeout);
        Err(IpcError::ProtocolTimeout {
            operation: "frame ack",
            duration_ms: self.config.ack_budget_ms(),
        })
    }

    fn await_response_locked(&self, request_id: u16) -> Result<Message> {
        let received = self.response_rx.recv_timeout(self.config.response_timeout);
        *self.pending.lock() = None;

        let response = match received {
            Ok(response) => response,
            Err(_) => {
                self.watchdog.crash(CrashReason::ResponseTimeout);
                return Err(IpcError::ProtocolTimeout {
                    operation: "command response",
                    duration_ms: self.config.response_timeout.as_millis() as u64,
                });
            }
        };
        self.validate_response(request_id, response)
    }

    fn validate_response(&self, request_id: u16, response: Message) -> Result<Message> {
        let expected = request_id | RESPONSE_FLAG;
        if response.id() != expected {
            warn!(
                expected = format_args!("{expected:#06x}"),
                got = format_args!("{:#06x}", response.id()),
                "response id mismatch"
            );
            return Err(IpcError::ResponseMismatch {
                expected,
                got: response.id(),
            });
        }

        match response.status() {
            Some(status::OK) => Ok(response),
            Some(code) => Err(IpcError::CommandFailed {
                id: request_id,
                status: code,
            }),
            None => Err(IpcError::CommandFailed {
                id: request_id,
                status: status::FAILED,
            }),
        }
    }
}

impl Drop for MessageLink {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KeyholeError;
    use crate::message::cmd;
    use crate::watchdog::NoCoredump;

    /// Register file that never acks host frames.
    struct DeafKeyhole {
        regs: Mutex<[u16; 64]>,
    }

    impl DeafKeyhole {
        fn new() -> Self {
            Self {
                regs: Mutex::new([0; 64]),
            }
        }
    }

    impl Keyhole for DeafKeyhole {
        fn read(&self, addr: u16) -> core::result::Result<u16, KeyholeError> {
            Ok(self.regs.lock()[addr as usize])
        }

        fn write(&self, addr: u16, value: u16) -> core::result::Result<(), KeyholeError> {
            self.regs.lock()[addr as usize] = value;
            Ok(())
        }
    }

    fn fast_config() -> LinkConfig {
        LinkConfig {
            ack_retries: 3,
            ack_poll_interval: Duration::from_micros(100),
            response_timeout: Duration::from_millis(20),
        }
    }

    fn make_link(keyhole: Arc<dyn Keyhole>) -> (MessageLink, Arc<Watchdog>) {
        let watchdog = Arc::new(Watchdog::new(Arc::new(NoCoredump)));
        let link = MessageLink::new(
            keyhole,
            Arc::clone(&watchdog),
            Arc::new(Dispatcher::new()),
            fast_config(),
        );
        (link, watchdog)
    }

    #[test]
    fn test_ack_timeout_crashes_watchdog() {
        let (link, watchdog) = make_link(Arc::new(DeafKeyhole::new()));
        let err = link.notify(&Message::new(cmd::DESTROY_OPERATOR)).unwrap_err();
        assert!(matches!(err, IpcError::ProtocolTimeout { .. }));
        assert_eq!(watchdog.crash_reason(), Some(CrashReason::AckTimeout));
    }

    #[test]
    fn test_desync_detected_before_first_frame() {
        let keyhole = Arc::new(DeafKeyhole::new());
        keyhole.regs.lock()[regs::HOST_SENT as usize] = 7;
        let (link, watchdog) = make_link(keyhole);

        let err = link.notify(&Message::new(cmd::VERSION)).unwrap_err();
        assert!(matches!(
            err,
            IpcError::Desynchronized {
                host_sent: 7,
                host_acked: 0
            }
        ));
        assert_eq!(watchdog.crash_reason(), Some(CrashReason::Desynchronized));
    }

    #[test]
    fn test_unacked_send_skips_settle_wait() {
        let keyhole = Arc::new(DeafKeyhole::new());
        let (link, watchdog) = make_link(Arc::clone(&keyhole) as Arc<dyn Keyhole>);

        // A fire-and-forget frame goes out without waiting for the ack.
        link.send_unacked(&Message::new(cmd::CLOSE_ENDPOINT)).unwrap();
        assert!(!watchdog.is_crashed());
        assert_eq!(keyhole.regs.lock()[regs::HOST_SENT as usize], 1);

        // The next unacked send paces against the unconsumed frame and
        // times out rather than overwriting it.
        let err = link.send_unacked(&Message::new(cmd::CLOSE_ENDPOINT)).unwrap_err();
        assert!(matches!(err, IpcError::ProtocolTimeout { .. }));
        assert_eq!(watchdog.crash_reason(), Some(CrashReason::AckTimeout));
    }

    #[test]
    fn test_ack_timeout_reports_submillisecond_budget() {
        let keyhole = Arc::new(DeafKeyhole::new());
        let watchdog = Arc::new(Watchdog::new(Arc::new(NoCoredump)));
        let link = MessageLink::new(
            keyhole,
            Arc::clone(&watchdog),
            Arc::new(Dispatcher::new()),
            LinkConfig {
                ack_retries: 6,
                ack_poll_interval: Duration::from_micros(500),
                response_timeout: Duration::from_millis(20),
            },
        );

        // 6 polls of 500us are a 3ms budget, not zero.
        let err = link.notify(&Message::new(cmd::VERSION)).unwrap_err();
        assert!(matches!(
            err,
            IpcError::ProtocolTimeout {
                operation: "frame ack",
                duration_ms: 3
            }
        ));
    }

    #[test]
    fn test_crashed_link_fails_fast() {
        let (link, watchdog) = make_link(Arc::new(DeafKeyhole::new()));
        watchdog.crash(CrashReason::DevicePanic);

        let err = link.request(&Message::new(cmd::VERSION)).unwrap_err();
        assert!(matches!(
            err,
            IpcError::DeviceUnavailable(CrashReason::DevicePanic)
        ));
        // No frame was placed in the window.
        assert!(link.pending.lock().is_none());
    }
}
