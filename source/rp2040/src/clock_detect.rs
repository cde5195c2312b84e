//! Clock-presence detection
//!
//! The bus idles at an undefined DC level, so sampling the clock wire
//! tells us nothing; counting edges does. A PWM slice in rising-edge
//! count mode is zeroed, we sleep the worst-case window for the asked
//! number of edges at the nominal bus rate, and any non-zero count means
//! somebody is driving the line.
//!
//! The counter input must be a PWM B pin; route the clock-in signal to an
//! odd GPIO.

use embassy_rp::pwm::{Channel, ChannelBPin, Config, InputMode, Pwm};
use embassy_rp::Peripheral;
use embassy_time::Timer;

use nanoreseau_comms::ClockSense;

use crate::BUS_CLOCK_HZ;

/// The edge-counting clock detector.
pub struct EdgeCounter<'d, T: Channel> {
    pwm: Pwm<'d, T>,
}

impl<'d, T: Channel> EdgeCounter<'d, T> {
    pub fn new(
        slice: impl Peripheral<P = T> + 'd,
        clk_in: impl Peripheral<P = impl ChannelBPin<T>> + 'd,
    ) -> Self {
        let cfg = Config::default();
        Self {
            pwm: Pwm::new_input(slice, clk_in, InputMode::RisingEdge, cfg),
        }
    }
}

impl<T: Channel> ClockSense for EdgeCounter<'_, T> {
    async fn is_clock_detected(&mut self, cycles: u16) -> bool {
        self.pwm.set_counter(0);
        // Worst-case time for `cycles` edges at the nominal rate, rounded
        // up a microsecond.
        let window = (cycles as u64 * 1_000_000) / BUS_CLOCK_HZ as u64 + 1;
        Timer::after_micros(window).await;
        self.pwm.counter() != 0
    }
}
