//! Shared test doubles: a scripted coprocessor behind the keyhole and a
//! thread standing in for the frame-ready interrupt.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use continuo::ipc::frame::{split, RawFrame, Reassembler, FRAME_WORDS};
use continuo::ipc::keyhole::regs;
use continuo::ipc::message::{cmd, notify, status, Message, RESPONSE_FLAG};
use continuo::ipc::{Keyhole, KeyholeError, MessageLink};

pub const FIRMWARE_VERSION: u16 = 0x0001;

struct Inner {
    registers: [u16; 64],
    rx: Reassembler,
    outbound: VecDeque<RawFrame>,
    log: Vec<Message>,
    next_handle: u16,
    drop_acks: bool,
    silent: bool,
    wrong_id_once: bool,
    dram_gate: bool,
    deferred: Option<Message>,
    version: u16,
}

/// Scripted coprocessor.
///
/// Acks host frames synchronously inside the `HOST_SENT` register write,
/// reassembles them, and answers every request with OK plus a fresh
/// handle where the command allocates one. Tests can script misbehavior:
/// dropped acks, silence, a mismatched response id, panic notifications.
pub struct MockDsp {
    inner: Mutex<Inner>,
}

impl MockDsp {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                registers: [0; 64],
                rx: Reassembler::new(),
                outbound: VecDeque::new(),
                log: Vec::new(),
                next_handle: 0x0020,
                drop_acks: false,
                silent: false,
                wrong_id_once: false,
                dram_gate: false,
                deferred: None,
                version: FIRMWARE_VERSION,
            }),
        })
    }

    pub fn received(&self) -> Vec<Message> {
        self.inner.lock().log.clone()
    }

    pub fn count_of(&self, id: u16) -> usize {
        self.inner.lock().log.iter().filter(|m| m.id() == id).count()
    }

    /// Stop acking host frames; the next send times out.
    pub fn drop_acks(&self) {
        self.inner.lock().drop_acks = true;
    }

    /// Keep acking frames but never answer requests.
    pub fn go_silent(&self) {
        self.inner.lock().silent = true;
    }

    /// Answer the next request with a response carrying the wrong id.
    pub fn wrong_id_once(&self) {
        self.inner.lock().wrong_id_once = true;
    }

    /// Withhold the next request's response until the host has answered
    /// a memory-allocation request raised in its place.
    pub fn withhold_until_dram_served(&self) {
        self.inner.lock().dram_gate = true;
    }

    pub fn set_version(&self, version: u16) {
        self.inner.lock().version = version;
    }

    /// Raise a device-originated message toward the host.
    pub fn inject_notify(&self, id: u16, payload: &[u16]) {
        self.inner.lock().enqueue(&Message::with_payload(id, payload));
    }

    pub fn inbound_pending(&self) -> bool {
        let inner = self.inner.lock();
        inner.registers[regs::DEVICE_SENT as usize] != inner.registers[regs::DEVICE_ACKED as usize]
    }
}

impl Inner {
    /// Move the next outbound frame into the receive window if the host
    /// has consumed the previous one.
    fn present_next(&mut self) {
        let sent = self.registers[regs::DEVICE_SENT as usize];
        if sent != self.registers[regs::DEVICE_ACKED as usize] {
            return;
        }
        if let Some(frame) = self.outbound.pop_front() {
            for (i, word) in frame.iter().enumerate() {
                self.registers[regs::RX_WINDOW as usize + i] = *word;
            }
            self.registers[regs::DEVICE_SENT as usize] = sent.wrapping_add(1);
        }
    }

    fn consume_host_frame(&mut self) {
        let mut frame: RawFrame = [0; FRAME_WORDS];
        for (i, word) in frame.iter_mut().enumerate() {
            *word = self.registers[regs::TX_WINDOW as usize + i];
        }
        if let Ok(Some(msg)) = self.rx.push(&frame) {
            self.handle_message(msg);
        }
    }

    fn handle_message(&mut self, msg: Message) {
        let is_response = msg.is_response();
        let id = msg.id();
        self.log.push(msg);
        if is_response {
            // Serving the memory request unblocks the withheld reply.
            if id == notify::DRAM_ALLOC | RESPONSE_FLAG {
                if let Some(resp) = self.deferred.take() {
                    self.enqueue(&resp);
                }
            }
            return;
        }
        if self.silent {
            return;
        }

        let response_id = if std::mem::take(&mut self.wrong_id_once) {
            (id.wrapping_add(1)) | RESPONSE_FLAG
        } else {
            id | RESPONSE_FLAG
        };

        let mut resp = Message::from_words(&[response_id, status::OK]);
        match id {
            cmd::VERSION => {
                resp.push(self.version);
            }
            cmd::CREATE_OPERATOR | cmd::GET_SOURCE | cmd::GET_SINK | cmd::CONNECT => {
                let handle = self.next_handle;
                self.next_handle += 1;
                resp.push(handle);
            }
            _ => {}
        }

        if std::mem::take(&mut self.dram_gate) {
            self.deferred = Some(resp);
            self.enqueue(&Message::with_payload(notify::DRAM_ALLOC, &[0x0000, 0x0040]));
            return;
        }
        self.enqueue(&resp);
    }

    fn enqueue(&mut self, msg: &Message) {
        for frame in split(msg).expect("outbound message must frame") {
            self.outbound.push_back(frame);
        }
        self.present_next();
    }
}

impl Keyhole for MockDsp {
    fn read(&self, addr: u16) -> Result<u16, KeyholeError> {
        Ok(self.inner.lock().registers[addr as usize])
    }

    fn write(&self, addr: u16, value: u16) -> Result<(), KeyholeError> {
        let mut inner = self.inner.lock();
        inner.registers[addr as usize] = value;
        match addr {
            regs::HOST_SENT => {
                if !inner.drop_acks {
                    inner.consume_host_frame();
                    inner.registers[regs::HOST_ACKED as usize] = value;
                }
            }
            regs::DEVICE_ACKED => inner.present_next(),
            _ => {}
        }
        Ok(())
    }
}

/// Stands in for the platform's frame-ready interrupt: polls the mock's
/// counters and pumps the link when a frame is waiting.
pub struct IrqPump {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl IrqPump {
    pub fn start(dsp: Arc<MockDsp>, link: Arc<MessageLink>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("mock-irq".into())
            .spawn(move || {
                while !flag.load(Ordering::Relaxed) {
                    if dsp.inbound_pending() {
                        let _ = link.pump_inbound();
                    }
                    thread::sleep(Duration::from_micros(200));
                }
            })
            .expect("spawn mock irq thread");
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for IrqPump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Log test traffic when debugging; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Spin until `cond` holds or the deadline passes.
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
