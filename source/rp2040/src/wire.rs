//! PIO serial front end
//!
//! Two state machines on one PIO block carry the bus:
//!
//! * SM0 samples the data-in pin on every rising edge of the external
//!   clock and autopushes destuffed-to-be bytes MSB-aligned, eight raw
//!   bits per FIFO word. The portable deframer and receiver engine do
//!   the rest; the PIO stays dumb on purpose.
//! * SM1 shifts transmit bits out LSB-first, two PIO cycles per bit,
//!   generating the 500 kHz line clock on its side-set pin. Frames are
//!   pre-stuffed by the portable bit layer and fed through DMA; the tail
//!   of the last word is mark fill, so stopping after a drain is always
//!   a clean frame boundary.
//!
//! The transmit clock is asserted by enabling SM1 with a lead-in of flag
//! fill words. That is also how the clock-only echo is made: enable,
//! wait, disable, no data ever queued.
//!
//! Pin constraint: the sampler waits on `in_base + 1`, so clock-in must
//! be the GPIO directly above data-in.

use embassy_rp::clocks::clk_sys_freq;
use embassy_rp::dma::{AnyChannel, Channel};
use embassy_rp::gpio::{AnyPin, Level, Output, Pin as _};
use embassy_rp::pio::{
    Common, Config, Direction, FifoJoin, Instance, PioPin, ShiftConfig, ShiftDirection,
    StateMachine,
};
use embassy_rp::{into_ref, Peripheral, PeripheralRef};
use embassy_time::{with_timeout, Duration, Instant, Timer};
use fixed::traits::ToFixed;

use nanoreseau_comms::hdlc::{Deframer, FrameBits, WordPacker};
use nanoreseau_comms::receiver::RxEngine;
use nanoreseau_comms::{Error, FrameWire, RxStatus, TxClock};

use crate::BUS_CLOCK_HZ;

/// A word of back-to-back flags, LSB-first: idle fill on an asserted
/// clock.
const FLAG_FILL: u32 = 0x7E7E7E7E;

/// Flag fill queued when the clock comes up; covers the echo pulse and
/// the lead-in before a data frame.
const FILL_WORDS: usize = 6;

/// One 32-bit word on the wire.
const WORD_TIME_US: u64 = 32 * 1_000_000 / BUS_CLOCK_HZ as u64;

/// The PIO-backed serial front end of the bridge.
pub struct BusWire<'d, P: Instance> {
    rx_sm: StateMachine<'d, P, 0>,
    tx_sm: StateMachine<'d, P, 1>,
    dma: PeripheralRef<'d, AnyChannel>,
    tx_enable: Output<'d, AnyPin>,
    rx_enable: Output<'d, AnyPin>,
    clock_on: bool,
}

impl<'d, P: Instance> BusWire<'d, P> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        common: &mut Common<'d, P>,
        mut rx_sm: StateMachine<'d, P, 0>,
        mut tx_sm: StateMachine<'d, P, 1>,
        dma: impl Peripheral<P = impl Channel> + 'd,
        data_in: impl PioPin,
        clk_in: impl PioPin,
        data_out: impl PioPin,
        clk_out: impl PioPin,
        mut tx_enable: Output<'d, AnyPin>,
        rx_enable: Output<'d, AnyPin>,
    ) -> Self {
        into_ref!(dma);
        assert_eq!(data_in.pin() + 1, clk_in.pin(), "clock-in must sit directly above data-in");

        let data_in = common.make_pio_pin(data_in);
        let clk_in = common.make_pio_pin(clk_in);
        let rx_prg = pio_proc::pio_asm!(
            "; externally clocked sampler, data on in_base, clock above it",
            ".wrap_target",
            "wait 0 pin 1",
            "wait 1 pin 1",
            "in pins, 1",
            ".wrap",
        );
        let mut cfg = Config::default();
        cfg.use_program(&common.load_program(&rx_prg.program), &[]);
        cfg.set_in_pins(&[&data_in, &clk_in]);
        // Eight raw bits per FIFO word, landing MSB-aligned.
        cfg.shift_in = ShiftConfig {
            auto_fill: true,
            threshold: 8,
            direction: ShiftDirection::Right,
        };
        cfg.fifo_join = FifoJoin::RxOnly;
        rx_sm.set_config(&cfg);
        rx_sm.set_pin_dirs(Direction::In, &[&data_in, &clk_in]);

        let data_out = common.make_pio_pin(data_out);
        let clk_out = common.make_pio_pin(clk_out);
        let tx_prg = pio_proc::pio_asm!(
            "; one bit per two instructions, line clock on the side-set pin",
            ".side_set 1",
            ".wrap_target",
            "out pins, 1  side 0",
            "nop          side 1",
            ".wrap",
        );
        let mut cfg = Config::default();
        cfg.use_program(&common.load_program(&tx_prg.program), &[&clk_out]);
        cfg.set_out_pins(&[&data_out]);
        cfg.shift_out = ShiftConfig {
            auto_fill: true,
            threshold: 32,
            direction: ShiftDirection::Right,
        };
        cfg.clock_divider = (clk_sys_freq() / (2 * BUS_CLOCK_HZ)).to_fixed();
        tx_sm.set_config(&cfg);
        tx_sm.set_pins(Level::Low, &[&clk_out]);
        // Mark idle on the data line.
        tx_sm.set_pins(Level::High, &[&data_out]);
        tx_sm.set_pin_dirs(Direction::Out, &[&data_out, &clk_out]);

        tx_enable.set_low();
        rx_sm.set_enable(true);

        Self {
            rx_sm,
            tx_sm,
            dma: dma.map_into(),
            tx_enable,
            rx_enable,
            clock_on: false,
        }
    }

    /// Wait until everything queued has left the shift register.
    async fn drain_tx(&mut self) {
        while !self.tx_sm.tx().empty() {
            Timer::after_micros(WORD_TIME_US).await;
        }
        Timer::after_micros(WORD_TIME_US).await;
    }

    async fn clock_up(&mut self) {
        self.tx_enable.set_high();
        self.tx_sm.clear_fifos();
        self.tx_sm.restart();
        self.tx_sm.set_enable(true);
        for _ in 0..FILL_WORDS {
            let _ = self.tx_sm.tx().try_push(FLAG_FILL);
        }
    }

    async fn clock_down(&mut self) {
        // The queue always ends in flag or mark fill, so draining stops
        // us on a clean boundary.
        self.drain_tx().await;
        self.tx_sm.set_enable(false);
        self.tx_enable.set_low();
    }
}

impl<'d, P: Instance> TxClock for BusWire<'d, P> {
    async fn set_enable(&mut self, enable: bool) {
        if enable == self.clock_on {
            return;
        }
        self.clock_on = enable;
        if enable {
            self.clock_up().await;
        } else {
            self.clock_down().await;
        }
    }
}

impl<'d, P: Instance> FrameWire for BusWire<'d, P> {
    type WireError = ();

    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), Error<()>> {
        // Half duplex: mute the receive path while we drive the bus.
        self.rx_enable.set_high();
        let was_on = self.clock_on;
        if !was_on {
            self.clock_up().await;
        }

        let mut packer = WordPacker::new(FrameBits::new(frame));
        let mut chunk = [0u32; 64];
        loop {
            let mut n = 0;
            for slot in chunk.iter_mut() {
                match packer.next() {
                    Some(w) => {
                        *slot = w;
                        n += 1;
                    }
                    None => break,
                }
            }
            if n == 0 {
                break;
            }
            self.tx_sm.tx().dma_push(self.dma.reborrow(), &chunk[..n]).await;
            if n < chunk.len() {
                break;
            }
        }

        if was_on {
            // Leave the clock to the caller, but make sure our closing
            // flag is really out before returning.
            self.drain_tx().await;
        } else {
            self.clock_down().await;
        }
        self.rx_enable.set_low();
        Ok(())
    }

    async fn receive(
        &mut self,
        my_address: u8,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<RxStatus, Error<()>> {
        self.rx_sm.clear_fifos();
        self.rx_sm.restart();

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut deframer = Deframer::new();
        let mut engine = RxEngine::new(my_address, buf);
        loop {
            let word = if let Some(deadline) = deadline {
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    self.rx_sm.clear_fifos();
                    return Ok(RxStatus::TimeOut);
                };
                match with_timeout(remaining, self.rx_sm.rx().wait_pull()).await {
                    Ok(w) => w,
                    Err(_) => {
                        self.rx_sm.clear_fifos();
                        return Ok(RxStatus::TimeOut);
                    }
                }
            } else {
                self.rx_sm.rx().wait_pull().await
            };

            // Eight raw bits, oldest first, MSB-aligned by the sampler.
            let byte = (word >> 24) as u8;
            for i in 0..8 {
                let bit = (byte >> i) & 1 != 0;
                deframer.push_bit(bit, |ev| {
                    engine.feed(ev);
                });
            }
            let status = engine.status();
            if status != RxStatus::Busy {
                return Ok(status);
            }
        }
    }
}
