//! Shared test doubles: a scripted wire that runs every inbound frame
//! through the real bit layer and receiver engine, clock stubs, and a
//! virtual-time executor harness.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::VecDeque;
use std::future::Future;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard};

use embassy_time::{Duration, MockDriver};
use futures_executor::LocalPool;
use futures_task::LocalSpawn;

use nanoreseau_comms::crc::crc16_x25;
use nanoreseau_comms::hdlc::{Deframer, FrameBits, FLAG};
use nanoreseau_comms::receiver::RxEngine;
use nanoreseau_comms::{ClockSense, Error, FrameWire, RxStatus, TxClock};

/// The mock time driver is process-global; tests in one binary must not
/// interleave.
static TEST_LOCK: Mutex<()> = Mutex::new(());

pub fn lock() -> MutexGuard<'static, ()> {
    TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner())
}

/// Drive a self-contained future to completion, advancing virtual time
/// whenever the executor stalls.
pub fn run<F, T>(fut: F) -> T
where
    F: Future<Output = T> + 'static,
    T: 'static,
{
    let mut pool = LocalPool::new();
    let spawner = pool.spawner();
    let out: Rc<RefCell<Option<T>>> = Rc::new(RefCell::new(None));
    let slot = out.clone();
    spawner
        .spawn_local_obj(
            Box::new(async move {
                let v = fut.await;
                *slot.borrow_mut() = Some(v);
            })
            .into(),
        )
        .unwrap();

    for _ in 0..100_000 {
        pool.run_until_stalled();
        if let Some(v) = out.borrow_mut().take() {
            return v;
        }
        MockDriver::get().advance(Duration::from_micros(50));
    }
    panic!("future did not complete under virtual time");
}

/// One scripted condition on the line, consumed per reception.
pub enum Line {
    /// A well-formed wire frame (destination byte first); the FCS is
    /// appended and the whole thing bit-stuffed as a real peer would.
    Frame(Vec<u8>),
    /// Same frame, but with a corrupted FCS.
    Corrupt(Vec<u8>),
    /// The frame is cut partway through and the line held at mark.
    Aborted(Vec<u8>),
    /// Nothing on the line until the caller's deadline passes.
    Silence,
}

/// A scripted serial front end. Outbound frames are recorded verbatim;
/// inbound lines run through the real deframer and receiver engine, so
/// address filtering, FCS checking and abort handling behave exactly as
/// on hardware.
pub struct ScriptWire {
    pub script: VecDeque<Line>,
    pub sent: Vec<Vec<u8>>,
}

impl ScriptWire {
    pub fn new(script: impl IntoIterator<Item = Line>) -> Self {
        Self {
            script: script.into_iter().collect(),
            sent: Vec::new(),
        }
    }
}

impl FrameWire for ScriptWire {
    type WireError = ();

    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), Error<()>> {
        self.sent.push(frame.to_vec());
        Ok(())
    }

    async fn receive(
        &mut self,
        my_address: u8,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<RxStatus, Error<()>> {
        loop {
            let Some(line) = self.script.pop_front() else {
                if let Some(t) = timeout {
                    MockDriver::get().advance(t);
                }
                return Ok(RxStatus::TimeOut);
            };
            let bits: Vec<bool> = match &line {
                Line::Frame(bytes) => FrameBits::new(bytes).collect(),
                Line::Corrupt(bytes) => corrupt_bits(bytes),
                Line::Aborted(bytes) => {
                    let mut b: Vec<bool> = FrameBits::new(bytes).collect();
                    b.truncate(b.len() / 2);
                    b.extend([true; 10]);
                    b
                }
                Line::Silence => {
                    if let Some(t) = timeout {
                        MockDriver::get().advance(t);
                    }
                    return Ok(RxStatus::TimeOut);
                }
            };
            let mut deframer = Deframer::new();
            let mut engine = RxEngine::new(my_address, buf);
            deframer.push_bits(bits, |ev| {
                engine.feed(ev);
            });
            match engine.status() {
                // Skipped, aborted or pure idle: keep listening.
                RxStatus::Busy => continue,
                status => return Ok(status),
            }
        }
    }
}

/// Hand-stuffed framing with a flipped FCS bit.
fn corrupt_bits(payload: &[u8]) -> Vec<bool> {
    let fcs = crc16_x25(payload) ^ 0x0004;
    let mut bits = Vec::new();
    for i in 0..8 {
        bits.push((FLAG >> i) & 1 != 0);
    }
    let mut ones = 0u32;
    let mut push_byte = |bits: &mut Vec<bool>, byte: u8| {
        for i in 0..8 {
            let b = (byte >> i) & 1 != 0;
            bits.push(b);
            if b {
                ones += 1;
                if ones == 5 {
                    bits.push(false);
                    ones = 0;
                }
            } else {
                ones = 0;
            }
        }
    };
    for &b in payload {
        push_byte(&mut bits, b);
    }
    push_byte(&mut bits, fcs as u8);
    push_byte(&mut bits, (fcs >> 8) as u8);
    for i in 0..8 {
        bits.push((FLAG >> i) & 1 != 0);
    }
    bits
}

/// Records every transition of the clock enable line.
#[derive(Default)]
pub struct PulseLog {
    pub events: Vec<bool>,
}

impl TxClock for PulseLog {
    async fn set_enable(&mut self, enable: bool) {
        self.events.push(enable);
    }
}

/// Clock detector stub: scripted responses first, then a fallback level.
pub struct SenseStub {
    pub responses: VecDeque<bool>,
    pub fallback: bool,
}

impl SenseStub {
    /// A quiet line that never shows a peer clock.
    pub fn quiet() -> Self {
        Self {
            responses: VecDeque::new(),
            fallback: false,
        }
    }

    /// A peer that echoes the instant we look.
    pub fn echoing() -> Self {
        Self {
            responses: VecDeque::new(),
            fallback: true,
        }
    }
}

impl ClockSense for SenseStub {
    async fn is_clock_detected(&mut self, _cycles: u16) -> bool {
        self.responses.pop_front().unwrap_or(self.fallback)
    }
}
