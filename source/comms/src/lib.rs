//! # Nanoréseau Comms
//!
//! This is the netstack of a USB bridge for the Nanoréseau, the HDLC-framed
//! educational school bus of the 1980s French 8-bit computers. It is
//! intended to run on bare metal at the bus's fixed network speed of
//! 500 kHz.
//!
//! The bus is a shared, externally clocked, half-duplex synchronous serial
//! medium: one clock wire, one data wire, both multi-drop. Whoever talks
//! drives the clock while talking; between dialogues the lines float.
//!
//! ## Entities
//!
//! There are two roles on the bus:
//!
//! 1. The master (station address `0x00`), which arbitrates the medium and
//!    drives every exchange to completion. This crate implements the
//!    master; the bridge device is always station 0.
//! 2. Peers (stations `0x01..`), the classroom machines. A peer may call
//!    the master, but only ever speaks inside a dialogue the master's
//!    link layer knows about.
//!
//! ## Message framing
//!
//! Frames are bit-synchronous HDLC: delimited by `0x7E` flags, zero-stuffed
//! after five consecutive ones, aborted by seven or more consecutive ones,
//! closed by a CRC-16/X-25 FCS transmitted low byte first. Bits travel
//! LSB-first within each byte. The first in-frame byte is the destination
//! station: receivers probe it and silently skip frames that are not
//! theirs, so a station never observes another station's traffic.
//!
//! A control frame is three bytes: destination, control word, originator.
//! The control word's high nibble names the exchange (see [`CtrlWord`]);
//! its low nibble carries either a 4-bit message number or a consigne
//! length in 4-byte units. A data frame replaces the control word with the
//! data nibble (`0x0`) and carries its payload after the originator byte.
//!
//! ## The dialogue
//!
//! A peer opens with an *initial call* naming the length of the consigne
//! it wants to push. The master answers not with a frame but with a brief
//! pulse of its own clock, the *echo*: the peer's silence detector sees
//! the line move and knows it was heard. The peer then sends the consigne
//! as a data frame, the master *takes charge* of it, and the peer
//! acknowledges with a *queueing notice*. From that point a logical
//! session is open: the station is `waiting`, exchanges roll a per-peer
//! 4-bit message number, and the session survives until a disconnect
//! handshake (or a watchdog) tears it down.
//!
//! Going the other way, the master opens with an initial call (or a
//! *call-under-queue* when a session is already open), waits for the
//! peer's echo by watching the clock wire, and pushes its consigne or data
//! block bracketed inside its own clock window.
//!
//! ## Architecture
//!
//! Everything time-critical is split in two along a trait boundary:
//!
//! * the portable side (this crate) holds the bit layer
//!   ([`hdlc`]), the frame receiver engine ([`receiver`]), the consigne
//!   codec ([`consigne`]), the peer table and the link master
//!   ([`link::Master`]), all expressed as explicit state machines that
//!   host tests drive directly;
//! * the hardware side implements [`FrameWire`], [`TxClock`] and
//!   [`ClockSense`] on whatever serial front end is available.
//!
//! The USB dispatcher is a consumer of this crate, not part of it: it
//! posts one [`host::Request`] at a time into the command mailbox and
//! reads back packed status and consigne snapshots. See [`host`].

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![allow(async_fn_in_trait)]

#[macro_use]
mod macros;

pub mod consigne;
pub mod crc;
pub mod hdlc;
pub mod host;
pub mod link;
mod peer;
pub mod receiver;

pub use peer::MAX_PEERS;

use embassy_time::{Duration, Timer};

/// The bus address of the master, which is always this device.
pub const MASTER_ADDRESS: u8 = 0x00;

/// An error type for the wire traits.
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum Error<E> {
    /// Some error with the underlying serial front end
    Wire(E),
}

impl<E> From<E> for Error<E> {
    fn from(value: E) -> Self {
        Self::Wire(value)
    }
}

/// Outcome of one reception session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxStatus {
    /// Still armed, nothing terminal yet.
    Busy,
    /// A frame for us passed its FCS; `n` payload bytes are in the buffer
    /// (the FCS itself is not counted).
    Done(usize),
    /// A frame for us failed its FCS.
    BadCrc,
    /// A frame for us was too short to check.
    FrameShort,
    /// The caller's deadline passed without a terminal event.
    TimeOut,
}

/// The serial front end: one frame out, one frame in.
pub trait FrameWire {
    /// The error type of the underlying hardware
    type WireError;

    /// Emit one HDLC frame: opening flag, bit-stuffed `frame` bytes, FCS,
    /// closing flag. Returns once the closing flag has left the shift
    /// register, so a subsequent send can never overlap it.
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), Error<Self::WireError>>;

    /// Receive one frame addressed to `my_address` into `buf`.
    ///
    /// Frames carrying any other destination are skipped without trace.
    /// With a deadline, [`RxStatus::TimeOut`] is returned once it passes;
    /// without one the call waits indefinitely. The receiver is disarmed
    /// whenever this returns.
    async fn receive(
        &mut self,
        my_address: u8,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<RxStatus, Error<Self::WireError>>;
}

/// The single owner of the transmit clock enable line.
///
/// Frame emission and clock assertion are deliberately independent: the
/// link layer pulses a clock-only echo without ever touching the data
/// path.
pub trait TxClock {
    /// Assert or release the clock enable. Releasing takes effect on the
    /// next flag boundary, so an in-flight frame always completes.
    async fn set_enable(&mut self, enable: bool);
}

/// The clock-presence detector on the shared clock wire.
pub trait ClockSense {
    /// True if at least one clock edge was counted within the worst-case
    /// time `cycles` edges take at the nominal bus rate. `cycles` should
    /// be at least 2 to ride out a single glitch.
    async fn is_clock_detected(&mut self, cycles: u16) -> bool;

    /// Poll until the line is quiet.
    async fn wait_for_no_clock(&mut self) {
        while self.is_clock_detected(2).await {
            Timer::after_micros(20).await;
        }
    }
}

/// Control word: command nibble plus 4-bit payload
///
/// The high nibble names the exchange, the low nibble carries either a
/// message number or a consigne length in 4-byte units. Nibbles
/// `0x1..=0x7` are not part of the protocol and are rejected on receipt.
///
/// [`CtrlWord::Ack`] (`0xE`) is context-sensitive: after a data exchange
/// it is the OK, after a disconnect request it is the UA. The wire cannot
/// tell them apart; call sites name the one they were waiting for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlWord {
    /// Data frame, payload follows - `0x0`
    Data(u8),
    /// "Go ahead, receive" - `0x8`
    VasYRecois(u8),
    /// Take-charge acknowledgement - `0x9`
    PriseEnCharge(u8),
    /// Queueing notice - `0xA`
    AvisMiseAttente(u8),
    /// "Go ahead, transmit" - `0xB`
    ///
    /// Declared by the protocol but driven by no master code path here.
    VasYEmets(u8),
    /// Disconnect request - `0xC`
    Deconnecte(u8),
    /// Call under an existing queue - `0xD`
    AppelSousAttente(u8),
    /// Acknowledge (OK, or UA after a disconnect) - `0xE`
    Ack(u8),
    /// Initial call - `0xF`
    AppelInitial(u8),
}

/// Control word error
#[derive(Debug, PartialEq)]
#[non_exhaustive]
pub enum CtrlWordError {
    /// A reserved command nibble was found
    Reserved,
}

impl CtrlWord {
    const DATA: u8 = 0x0;
    const VAS_Y_RECOIS: u8 = 0x8;
    const PRISE_EN_CHARGE: u8 = 0x9;
    const AVIS_MISE_ATTENTE: u8 = 0xA;
    const VAS_Y_EMETS: u8 = 0xB;
    const DECONNECTE: u8 = 0xC;
    const APPEL_SOUS_ATTENTE: u8 = 0xD;
    const ACK: u8 = 0xE;
    const APPEL_INITIAL: u8 = 0xF;

    /// The command nibble.
    pub fn nibble(&self) -> u8 {
        match self {
            CtrlWord::Data(_) => Self::DATA,
            CtrlWord::VasYRecois(_) => Self::VAS_Y_RECOIS,
            CtrlWord::PriseEnCharge(_) => Self::PRISE_EN_CHARGE,
            CtrlWord::AvisMiseAttente(_) => Self::AVIS_MISE_ATTENTE,
            CtrlWord::VasYEmets(_) => Self::VAS_Y_EMETS,
            CtrlWord::Deconnecte(_) => Self::DECONNECTE,
            CtrlWord::AppelSousAttente(_) => Self::APPEL_SOUS_ATTENTE,
            CtrlWord::Ack(_) => Self::ACK,
            CtrlWord::AppelInitial(_) => Self::APPEL_INITIAL,
        }
    }

    /// The 4-bit payload.
    pub fn payload(&self) -> u8 {
        match self {
            CtrlWord::Data(p)
            | CtrlWord::VasYRecois(p)
            | CtrlWord::PriseEnCharge(p)
            | CtrlWord::AvisMiseAttente(p)
            | CtrlWord::VasYEmets(p)
            | CtrlWord::Deconnecte(p)
            | CtrlWord::AppelSousAttente(p)
            | CtrlWord::Ack(p)
            | CtrlWord::AppelInitial(p) => *p & 0x0F,
        }
    }

    /// Protocol short name, used in log and error strings.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            CtrlWord::Data(_) => "DATA",
            CtrlWord::VasYRecois(_) => "MCVR",
            CtrlWord::PriseEnCharge(_) => "MCPCH",
            CtrlWord::AvisMiseAttente(_) => "MCAMA",
            CtrlWord::VasYEmets(_) => "MCVE",
            CtrlWord::Deconnecte(_) => "MCDISC",
            CtrlWord::AppelSousAttente(_) => "MCAPA",
            CtrlWord::Ack(_) => "MCOK",
            CtrlWord::AppelInitial(_) => "MCAPI",
        }
    }
}

impl TryFrom<u8> for CtrlWord {
    type Error = CtrlWordError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        let cmd = value >> 4;
        let payload = value & 0x0F;
        match cmd {
            Self::DATA => Ok(CtrlWord::Data(payload)),
            Self::VAS_Y_RECOIS => Ok(CtrlWord::VasYRecois(payload)),
            Self::PRISE_EN_CHARGE => Ok(CtrlWord::PriseEnCharge(payload)),
            Self::AVIS_MISE_ATTENTE => Ok(CtrlWord::AvisMiseAttente(payload)),
            Self::VAS_Y_EMETS => Ok(CtrlWord::VasYEmets(payload)),
            Self::DECONNECTE => Ok(CtrlWord::Deconnecte(payload)),
            Self::APPEL_SOUS_ATTENTE => Ok(CtrlWord::AppelSousAttente(payload)),
            Self::ACK => Ok(CtrlWord::Ack(payload)),
            Self::APPEL_INITIAL => Ok(CtrlWord::AppelInitial(payload)),
            _ => Err(CtrlWordError::Reserved),
        }
    }
}

impl From<CtrlWord> for u8 {
    fn from(val: CtrlWord) -> Self {
        (val.nibble() << 4) | val.payload()
    }
}
