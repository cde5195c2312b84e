//! Link-layer master
//!
//! [`Master`] runs the bus. It is polled from the main execution context
//! and does exactly one of two things per [`Master::step`]:
//!
//! 1. execute a queued host command to completion (push a consigne, push a
//!    data block, disconnect a peer), or
//! 2. run one bounded listen pass for a peer's initial call.
//!
//! Everything that can go wrong on the bus is absorbed here: no error
//! crosses the trait boundary upward except a hardware fault of the
//! serial front end itself. An absorbed failure resets the affected
//! sub-machine, records its kind and a short human string in the status
//! board and raises the error event; the host always sees forward
//! progress.
//!
//! The `Master` is intended to live in a `static`:
//!
//! ```rust
//! use nanoreseau_comms::link::Master;
//! use nanoreseau_comms::MASTER_ADDRESS;
//! use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
//!
//! static MASTER: Master<CriticalSectionRawMutex> = Master::new(MASTER_ADDRESS);
//! ```
//!
//! with the USB side posting requests through [`Master::mailbox`] and the
//! bus task calling [`Master::step`] in a loop, passing the serial front
//! end, the transmit clock capability and the clock detector on every
//! call. Passing them per call keeps the static's type simple and keeps
//! the clock-enable line owned by exactly one place in the integrator's
//! code.

use core::fmt::Write;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::{Duration, Instant, Timer};
use heapless::String;

use crate::consigne::Consigne;
use crate::host::{
    DataBuffer, ErrorKind, LinkState, Mailbox, Request, StatusBoard, ERROR_MSG_LEN, EVT_CMD_DONE,
    EVT_SELECTED,
};
use crate::peer::{PeerTable, MAX_PEERS};
use crate::{ClockSense, CtrlWord, Error, FrameWire, RxStatus, TxClock};

/// Per-state watchdog of the dialogue sub-machines.
pub const DEFAULT_RX_TIMEOUT: Duration = Duration::from_millis(2);

/// How long a called peer gets to echo our clock back.
pub const ECHO_TIMEOUT: Duration = Duration::from_millis(5);

/// Full-sequence retries when pushing a consigne or a data block.
pub const SEND_RETRIES: u8 = 5;

// Echo pulse shape. Empirically tuned for the slowest peer machines; not
// too fast, or their silence detector misses it.
const ECHO_GAP_US: u64 = 50;
const ECHO_PULSE_US: u64 = 300;

// Pacing around an outbound data frame, clock assertion to release.
const DATA_LEAD_US: u64 = 110;
const DATA_SETTLE_US: u64 = 50;
const DATA_TAIL_US: u64 = 100;
const DATA_RELEASE_US: u64 = 250;

const ECHO_POLL_CYCLES: u16 = 2;

/// An absorbed link failure: taxonomy kind plus the short string the host
/// reads.
#[derive(Debug)]
pub(crate) struct Fail {
    pub(crate) kind: ErrorKind,
    pub(crate) msg: String<ERROR_MSG_LEN>,
}

impl Fail {
    pub(crate) fn new(kind: ErrorKind, msg: &str) -> Self {
        let mut s = String::new();
        let _ = s.push_str(&msg[..msg.len().min(ERROR_MSG_LEN)]);
        Self { kind, msg: s }
    }

    pub(crate) fn timeout(waited_for: &str) -> Self {
        let mut msg = String::new();
        let _ = write!(msg, "{} rx timeout", waited_for);
        Self {
            kind: ErrorKind::Timeout,
            msg,
        }
    }

    pub(crate) fn protocol(wanted: &str) -> Self {
        let mut msg = String::new();
        let _ = write!(msg, "unexpected reply, wanted {}", wanted);
        Self {
            kind: ErrorKind::Protocol,
            msg,
        }
    }
}

/// WAIT_SELECT transition: a valid opening is an initial call from a
/// station the peer table knows.
pub(crate) fn classify_select(frame: &[u8]) -> Option<(u8, u8)> {
    if frame.len() < 2 {
        return None;
    }
    let word = CtrlWord::try_from(frame[0]).ok()?;
    let station = frame[1];
    match word {
        CtrlWord::AppelInitial(units) if (station as usize) < MAX_PEERS => Some((station, units)),
        _ => None,
    }
}

/// GET_COMMAND transition: the consigne data frame from the calling
/// station. Returns the consigne body range within the frame.
pub(crate) fn classify_command(
    frame: &[u8],
    station: u8,
    units: u8,
) -> Result<core::ops::Range<usize>, Fail> {
    if frame.len() < 2 {
        return Err(Fail::new(ErrorKind::ShortFrame, "command short frame"));
    }
    match CtrlWord::try_from(frame[0]) {
        Ok(CtrlWord::Data(_)) => {}
        _ => return Err(Fail::protocol("DATA")),
    }
    if frame[1] != station {
        return Err(Fail::new(ErrorKind::Protocol, "command from wrong station"));
    }
    if frame.len() - 2 < units as usize * 4 {
        return Err(Fail::new(ErrorKind::ShortFrame, "consigne short frame"));
    }
    Ok(2..frame.len())
}

/// WAIT_RESPONSE outcome of one control exchange attempt.
enum WaitOutcome {
    /// The expected word arrived from the addressed station; its payload
    /// nibble.
    Got(u8),
    /// The addressed station answered with something else entirely.
    Wrong,
    /// Nothing usable within the window. Burns one retry.
    TimedOut,
}

/// Link master and bus-facing state.
pub struct Master<R: RawMutex + 'static> {
    address: u8,
    peers: Mutex<R, PeerTable>,
    mailbox: Mailbox,
    board: StatusBoard,
    data: DataBuffer,
}

impl<R: RawMutex + 'static> Master<R> {
    /// Create the master for the given bus address (0 on a bridge).
    pub const fn new(address: u8) -> Self {
        Self {
            address,
            peers: Mutex::new(PeerTable::const_new()),
            mailbox: Mailbox::new(),
            board: StatusBoard::new(),
            data: DataBuffer::new(),
        }
    }

    /// The command mailbox, written by the USB side.
    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    /// Status and consigne snapshots, read by the USB side.
    pub fn board(&self) -> &StatusBoard {
        &self.board
    }

    /// The data staging buffer shared with the USB side.
    pub fn data(&self) -> &DataBuffer {
        &self.data
    }

    /// Is a logical session open with this station?
    pub async fn session_open(&self, station: u8) -> bool {
        self.peers
            .lock()
            .await
            .get(station)
            .map(|p| p.is_waiting())
            .unwrap_or(false)
    }

    /// Forget every session. Device-reset semantics; the bus is not told.
    pub async fn reset_peers(&self) {
        self.peers.lock().await.reset_all();
    }

    /// Run one step of the bus: a queued command if there is one,
    /// otherwise a single bounded listen pass for an initial call.
    ///
    /// `scratch` is the frame assembly and reception buffer; make it as
    /// large as the biggest data block plus the three-byte frame header.
    pub async fn step<W, C, S>(
        &self,
        wire: &mut W,
        clock: &mut C,
        sense: &mut S,
        scratch: &mut [u8],
    ) -> Result<(), Error<W::WireError>>
    where
        W: FrameWire,
        C: TxClock,
        S: ClockSense,
    {
        if let Some(req) = self.mailbox.take() {
            self.board.set_state(LinkState::Busy);
            self.board.clear_error();
            let outcome = match req {
                Request::SendConsigne(c) => {
                    self.push_consigne(wire, clock, sense, scratch, c).await
                }
                Request::SendData { station, len } => {
                    self.push_data(wire, clock, sense, scratch, station, len).await
                }
                Request::Disconnect { station } => self.disconnect(wire, scratch, station).await,
            };
            match outcome {
                Ok(Ok(())) => self.board.raise_event(EVT_CMD_DONE),
                Ok(Err(fail)) => self.board.record_error(fail.kind, &fail.msg),
                Err(e) => {
                    self.board.set_state(LinkState::Idle);
                    return Err(e);
                }
            }
            self.board.set_state(LinkState::Idle);
            return Ok(());
        }

        self.listen(wire, clock, sense, scratch).await
    }

    /// One WAIT_SELECT pass. A quiet bus is the normal case and makes no
    /// noise; anything that got past the address filter but is not a
    /// well-formed initial call is surfaced.
    async fn listen<W, C, S>(
        &self,
        wire: &mut W,
        clock: &mut C,
        sense: &mut S,
        scratch: &mut [u8],
    ) -> Result<(), Error<W::WireError>>
    where
        W: FrameWire,
        C: TxClock,
        S: ClockSense,
    {
        let n = match wire
            .receive(self.address, scratch, Some(DEFAULT_RX_TIMEOUT))
            .await?
        {
            RxStatus::Done(n) => n,
            RxStatus::TimeOut | RxStatus::Busy => return Ok(()),
            RxStatus::BadCrc => {
                self.board.record_error(ErrorKind::BadCrc, "select bad fcs");
                return Ok(());
            }
            RxStatus::FrameShort => {
                self.board
                    .record_error(ErrorKind::ShortFrame, "select short frame");
                return Ok(());
            }
        };

        let Some((station, units)) = classify_select(&scratch[..n]) else {
            self.board
                .record_error(ErrorKind::Protocol, "unexpected select word");
            return Ok(());
        };

        nr_info!("initial call from station {=u8:x}", station);
        self.board.set_state(LinkState::ReceivingInitialCall);
        let outcome = self
            .receive_initial_call(wire, clock, sense, scratch, station, units)
            .await;
        self.board.set_state(LinkState::Idle);
        if let Err(fail) = outcome? {
            self.board.record_error(fail.kind, &fail.msg);
        }
        Ok(())
    }

    /// GET_COMMAND and take-charge phases of an inbound initial call.
    async fn receive_initial_call<W, C, S>(
        &self,
        wire: &mut W,
        clock: &mut C,
        sense: &mut S,
        scratch: &mut [u8],
        station: u8,
        units: u8,
    ) -> Result<Result<(), Fail>, Error<W::WireError>>
    where
        W: FrameWire,
        C: TxClock,
        S: ClockSense,
    {
        // Echo: pulse our clock once the line is quiet, so the caller's
        // silence detector sees it was heard.
        sense.wait_for_no_clock().await;
        Timer::after_micros(ECHO_GAP_US).await;
        clock.set_enable(true).await;
        Timer::after_micros(ECHO_PULSE_US).await;
        clock.set_enable(false).await;

        // GET_COMMAND: the consigne data frame, same station.
        let consigne = match wire
            .receive(self.address, scratch, Some(DEFAULT_RX_TIMEOUT))
            .await?
        {
            RxStatus::Done(n) => match classify_command(&scratch[..n], station, units) {
                Ok(body) => Consigne::from_wire(station, &scratch[body]),
                Err(fail) => return Ok(Err(fail)),
            },
            RxStatus::TimeOut | RxStatus::Busy => return Ok(Err(Fail::timeout("DATA"))),
            RxStatus::BadCrc => return Ok(Err(Fail::new(ErrorKind::BadCrc, "command bad fcs"))),
            RxStatus::FrameShort => {
                return Ok(Err(Fail::new(ErrorKind::ShortFrame, "command short frame")))
            }
        };

        // Take charge of the consigne; the caller acknowledges by going
        // into the waiting state.
        match self
            .exchange_ctrl(
                wire,
                scratch,
                station,
                CtrlWord::PriseEnCharge(0),
                CtrlWord::AvisMiseAttente(0),
                "MCAMA",
                DEFAULT_RX_TIMEOUT,
                1,
            )
            .await?
        {
            Ok(msg_num) => {
                if let Some(p) = self.peers.lock().await.get_mut(station) {
                    p.note_msg_num(msg_num);
                    p.open_session();
                }
                nr_info!("station {=u8:x} selected", station);
                self.board.publish_consigne(consigne);
                self.board.raise_event(EVT_SELECTED);
                Ok(Ok(()))
            }
            Err(fail) => Ok(Err(fail)),
        }
    }

    /// Push a consigne to a station, retrying the full call sequence on
    /// timeouts.
    async fn push_consigne<W, C, S>(
        &self,
        wire: &mut W,
        clock: &mut C,
        sense: &mut S,
        scratch: &mut [u8],
        consigne: Consigne,
    ) -> Result<Result<(), Fail>, Error<W::WireError>>
    where
        W: FrameWire,
        C: TxClock,
        S: ClockSense,
    {
        let station = consigne.station;
        if station as usize >= MAX_PEERS {
            return Ok(Err(Fail::new(ErrorKind::Protocol, "station out of range")));
        }

        let mut waited_for = "MCPCH";
        for attempt in 0..SEND_RETRIES {
            // Opening call: an initial call for a fresh session, a
            // call-under-queue when one is already open.
            let (open, expect, expect_name) = {
                let peers = self.peers.lock().await;
                match peers.get(station) {
                    Some(p) if p.is_waiting() => (
                        CtrlWord::AppelSousAttente(p.msg_num()),
                        CtrlWord::Ack(0),
                        "MCOK",
                    ),
                    _ => (
                        CtrlWord::AppelInitial(consigne.len_units()),
                        CtrlWord::PriseEnCharge(0),
                        "MCPCH",
                    ),
                }
            };
            waited_for = expect_name;

            wire.send_frame(&[station, open.into(), self.address]).await?;
            if !self.wait_for_echo(sense).await {
                nr_warn!("no echo from {=u8:x}, attempt {=u8}", station, attempt);
                waited_for = "echo";
                continue;
            }

            // The consigne itself, bracketed inside our clock window.
            let n = frame_data(scratch, station, self.address, consigne.wire());
            Timer::after_micros(DATA_LEAD_US).await;
            clock.set_enable(true).await;
            Timer::after_micros(DATA_SETTLE_US).await;
            wire.send_frame(&scratch[..n]).await?;
            Timer::after_micros(DATA_TAIL_US).await;
            clock.set_enable(false).await;
            Timer::after_micros(DATA_RELEASE_US).await;

            match self
                .wait_ctrl(wire, scratch, station, expect, DEFAULT_RX_TIMEOUT)
                .await?
            {
                WaitOutcome::Got(msg_num) => {
                    let newly_open = {
                        let mut peers = self.peers.lock().await;
                        match peers.get_mut(station) {
                            Some(p) => {
                                let newly_open = !p.is_waiting();
                                p.note_msg_num(msg_num);
                                newly_open
                            }
                            None => false,
                        }
                    };
                    if newly_open {
                        // Complete the handshake from our side: the
                        // take-charge is answered with a queueing notice,
                        // and only then is the session open.
                        wire.send_frame(&[
                            station,
                            CtrlWord::AvisMiseAttente(0).into(),
                            self.address,
                        ])
                        .await?;
                        if let Some(p) = self.peers.lock().await.get_mut(station) {
                            p.open_session();
                        }
                    }
                    return Ok(Ok(()));
                }
                WaitOutcome::Wrong => return Ok(Err(Fail::protocol(expect_name))),
                WaitOutcome::TimedOut => continue,
            }
        }
        Ok(Err(Fail::timeout(waited_for)))
    }

    /// Push a staged data block to a station. Same shape as a consigne
    /// push, with a go-ahead-receive opening.
    async fn push_data<W, C, S>(
        &self,
        wire: &mut W,
        clock: &mut C,
        sense: &mut S,
        scratch: &mut [u8],
        station: u8,
        len: u16,
    ) -> Result<Result<(), Fail>, Error<W::WireError>>
    where
        W: FrameWire,
        C: TxClock,
        S: ClockSense,
    {
        if station as usize >= MAX_PEERS {
            return Ok(Err(Fail::new(ErrorKind::Protocol, "station out of range")));
        }
        let body_len = len as usize;
        if scratch.len() < 3 + body_len {
            return Ok(Err(Fail::new(ErrorKind::Protocol, "data block too large")));
        }

        for attempt in 0..SEND_RETRIES {
            let msg_num = self
                .peers
                .lock()
                .await
                .get(station)
                .map(|p| p.msg_num())
                .unwrap_or(0);

            wire.send_frame(&[
                station,
                CtrlWord::VasYRecois(msg_num).into(),
                self.address,
            ])
            .await?;
            if !self.wait_for_echo(sense).await {
                nr_warn!("no echo from {=u8:x}, attempt {=u8}", station, attempt);
                continue;
            }

            // Stage fresh each attempt; the reply path reuses the scratch.
            scratch[0] = station;
            scratch[1] = CtrlWord::Data(0).into();
            scratch[2] = self.address;
            if !self.data.copy_to(&mut scratch[3..3 + body_len]) {
                return Ok(Err(Fail::new(ErrorKind::Protocol, "no staged data")));
            }

            Timer::after_micros(DATA_LEAD_US).await;
            clock.set_enable(true).await;
            Timer::after_micros(DATA_SETTLE_US).await;
            wire.send_frame(&scratch[..3 + body_len]).await?;
            Timer::after_micros(DATA_TAIL_US).await;
            clock.set_enable(false).await;
            Timer::after_micros(DATA_RELEASE_US).await;

            match self
                .wait_ctrl(wire, scratch, station, CtrlWord::Ack(0), DEFAULT_RX_TIMEOUT)
                .await?
            {
                WaitOutcome::Got(msg_num) => {
                    if let Some(p) = self.peers.lock().await.get_mut(station) {
                        p.note_msg_num(msg_num);
                    }
                    return Ok(Ok(()));
                }
                WaitOutcome::Wrong => return Ok(Err(Fail::protocol("MCOK"))),
                WaitOutcome::TimedOut => continue,
            }
        }
        Ok(Err(Fail::timeout("MCOK")))
    }

    /// Close the session with a station. The local state clears even if
    /// the peer never answers; a dead station must not wedge its slot.
    async fn disconnect<W>(
        &self,
        wire: &mut W,
        scratch: &mut [u8],
        station: u8,
    ) -> Result<Result<(), Fail>, Error<W::WireError>>
    where
        W: FrameWire,
    {
        if station as usize >= MAX_PEERS {
            return Ok(Err(Fail::new(ErrorKind::Protocol, "station out of range")));
        }
        let msg_num = self
            .peers
            .lock()
            .await
            .get(station)
            .map(|p| p.msg_num())
            .unwrap_or(0);

        let res = self
            .exchange_ctrl(
                wire,
                scratch,
                station,
                CtrlWord::Deconnecte(msg_num),
                CtrlWord::Ack(0),
                "MCUA",
                DEFAULT_RX_TIMEOUT,
                1,
            )
            .await?;

        if let Some(p) = self.peers.lock().await.get_mut(station) {
            p.close_session();
        }
        Ok(res.map(|_| ()))
    }

    /// The reusable two-phase control exchange: emit a control word, then
    /// await a specific response word from the addressed station.
    /// Responses from the wrong station count against the retry budget.
    #[allow(clippy::too_many_arguments)]
    async fn exchange_ctrl<W>(
        &self,
        wire: &mut W,
        scratch: &mut [u8],
        station: u8,
        send: CtrlWord,
        expect: CtrlWord,
        expect_name: &'static str,
        timeout: Duration,
        attempts: u8,
    ) -> Result<Result<u8, Fail>, Error<W::WireError>>
    where
        W: FrameWire,
    {
        let word: u8 = send.into();
        for _ in 0..attempts {
            wire.send_frame(&[station, word, self.address]).await?;
            match self.wait_ctrl(wire, scratch, station, expect, timeout).await? {
                WaitOutcome::Got(payload) => return Ok(Ok(payload)),
                WaitOutcome::Wrong => return Ok(Err(Fail::protocol(expect_name))),
                WaitOutcome::TimedOut => continue,
            }
        }
        Ok(Err(Fail::timeout(expect_name)))
    }

    /// WAIT_RESPONSE phase: one bounded wait for a control word from one
    /// station.
    async fn wait_ctrl<W>(
        &self,
        wire: &mut W,
        scratch: &mut [u8],
        station: u8,
        expect: CtrlWord,
        timeout: Duration,
    ) -> Result<WaitOutcome, Error<W::WireError>>
    where
        W: FrameWire,
    {
        match wire.receive(self.address, scratch, Some(timeout)).await? {
            RxStatus::Done(n) if n >= 2 => {
                let Ok(word) = CtrlWord::try_from(scratch[0]) else {
                    return Ok(WaitOutcome::TimedOut);
                };
                if scratch[1] != station {
                    nr_warn!("reply from {=u8:x}, wanted {=u8:x}", scratch[1], station);
                    return Ok(WaitOutcome::TimedOut);
                }
                if word.nibble() == expect.nibble() {
                    Ok(WaitOutcome::Got(word.payload()))
                } else {
                    Ok(WaitOutcome::Wrong)
                }
            }
            // Undersized frames and corrupt replies burn the attempt just
            // like silence does.
            RxStatus::Done(_) | RxStatus::BadCrc | RxStatus::FrameShort => {
                Ok(WaitOutcome::TimedOut)
            }
            RxStatus::TimeOut | RxStatus::Busy => Ok(WaitOutcome::TimedOut),
        }
    }

    /// Poll the clock detector until the called peer echoes, bounded by
    /// [`ECHO_TIMEOUT`].
    async fn wait_for_echo<S: ClockSense>(&self, sense: &mut S) -> bool {
        let entered = Instant::now();
        while entered.elapsed() < ECHO_TIMEOUT {
            if sense.is_clock_detected(ECHO_POLL_CYCLES).await {
                return true;
            }
            Timer::after_micros(100).await;
        }
        false
    }
}

/// Assemble a data frame: destination, data word, originator, body.
fn frame_data(scratch: &mut [u8], station: u8, from: u8, body: &[u8]) -> usize {
    scratch[0] = station;
    scratch[1] = CtrlWord::Data(0).into();
    scratch[2] = from;
    scratch[3..3 + body.len()].copy_from_slice(body);
    3 + body.len()
}
