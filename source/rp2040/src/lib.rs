//! RP2040 front end for the Nanoréseau bridge
//!
//! Binds the wire traits of `nanoreseau-comms` to the Pico hardware:
//!
//! * [`wire::BusWire`], a PIO state machine pair doing the externally
//!   clocked bit sampling and the clocked transmit path,
//! * [`clock_detect::EdgeCounter`], a PWM slice in edge-count mode
//!   watching the shared clock wire,
//! * [`get_unique_id`], the flash unique id, used as the USB serial
//!   number.
//!
//! The USB vendor dispatcher and board bring-up live in the application
//! crate; nothing here touches them.

#![no_std]

pub mod clock_detect;
pub mod wire;

use embassy_rp::flash::{Blocking, Flash};
use embassy_rp::peripherals::FLASH;

/// Nominal bus bit rate.
pub const BUS_CLOCK_HZ: u32 = 500_000;

/// The QSPI flash unique id, the closest thing the RP2040 has to a
/// serial number. Feeds the USB device descriptor.
pub fn get_unique_id(flash: &mut FLASH) -> Option<u64> {
    let mut flash: Flash<'_, FLASH, Blocking, { 2 * 1024 * 1024 }> = Flash::new_blocking(flash);

    let mut id = [0u8; core::mem::size_of::<u64>()];
    flash.blocking_unique_id(&mut id).ok()?;
    Some(u64::from_be_bytes(id))
}
