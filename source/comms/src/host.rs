//! Host boundary: command mailbox and snapshots
//!
//! The USB dispatcher lives on the other core and is deliberately thin: it
//! writes one command at a time into the [`Mailbox`] and reads back the
//! [`StatusBoard`] snapshots. Both sides of that boundary are guarded by a
//! critical-section mutex, the only synchronisation primitive shared
//! between the two cores.
//!
//! The mailbox is a single slot. Posting into an occupied slot is refused
//! rather than queued; the host is expected to poll `GET_STATUS` for the
//! completion event before issuing the next command.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use grounded::uninit::GroundedArrayCell;
use heapless::String;

use crate::consigne::{Consigne, SNAPSHOT_LEN};

/// Largest data block one bus exchange can move.
pub const DATA_MAX: usize = 65535;

/// Length of the human-readable error string in the status snapshot.
pub const ERROR_MSG_LEN: usize = 60;

/// Packed status snapshot: state, error, event, message.
pub const STATUS_LEN: usize = 3 + ERROR_MSG_LEN;

/// Event bits surfaced through `GET_STATUS`.
pub const EVT_SELECTED: u8 = 1 << 0;
pub const EVT_CMD_DONE: u8 = 1 << 1;
pub const EVT_ERROR: u8 = 1 << 2;

/// Global link state as the host sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Idle = 0,
    ReceivingInitialCall = 1,
    Busy = 2,
}

/// Error taxonomy of the link layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorKind {
    NoError = 0,
    /// No expected event within its bounded window.
    Timeout = 1,
    /// A frame arrived shorter than its declared length.
    ShortFrame = 2,
    /// Frame CRC did not match its FCS.
    BadCrc = 3,
    /// An unexpected control word from the addressed peer.
    Protocol = 4,
}

/// One host-originated command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Push a consigne to `consigne.station`.
    SendConsigne(Consigne),
    /// Send `len` bytes of the staging buffer to a station.
    SendData { station: u8, len: u16 },
    /// Close the session with a station.
    Disconnect { station: u8 },
}

/// Single-slot command mailbox, one producer (USB core), one consumer
/// (link master).
pub struct Mailbox {
    slot: Mutex<CriticalSectionRawMutex, RefCell<Option<Request>>>,
}

impl Mailbox {
    pub const fn new() -> Self {
        Self {
            slot: Mutex::new(RefCell::new(None)),
        }
    }

    /// Post a request. Returns it back if a command is still outstanding.
    pub fn post(&self, req: Request) -> Result<(), Request> {
        self.slot.lock(|s| {
            let mut s = s.borrow_mut();
            if s.is_some() {
                Err(req)
            } else {
                *s = Some(req);
                Ok(())
            }
        })
    }

    pub fn is_empty(&self) -> bool {
        self.slot.lock(|s| s.borrow().is_none())
    }

    pub(crate) fn take(&self) -> Option<Request> {
        self.slot.lock(|s| s.borrow_mut().take())
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

struct BoardInner {
    state: LinkState,
    error: ErrorKind,
    event: u8,
    message: String<ERROR_MSG_LEN>,
    consigne: Option<Consigne>,
}

/// The snapshots the USB side marshals to the host: link state, last
/// error, pending event bits and the last received consigne.
pub struct StatusBoard {
    inner: Mutex<CriticalSectionRawMutex, RefCell<BoardInner>>,
}

impl StatusBoard {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(BoardInner {
                state: LinkState::Idle,
                error: ErrorKind::NoError,
                event: 0,
                message: String::new(),
                consigne: None,
            })),
        }
    }

    pub(crate) fn set_state(&self, state: LinkState) {
        self.inner.lock(|i| i.borrow_mut().state = state);
    }

    pub(crate) fn record_error(&self, kind: ErrorKind, message: &str) {
        self.inner.lock(|i| {
            let mut i = i.borrow_mut();
            i.error = kind;
            i.message.clear();
            // Truncated rather than refused; the wire field is fixed.
            let take = message.len().min(ERROR_MSG_LEN);
            let _ = i.message.push_str(&message[..take]);
            i.event |= EVT_ERROR;
        });
    }

    pub(crate) fn clear_error(&self) {
        self.inner.lock(|i| {
            let mut i = i.borrow_mut();
            i.error = ErrorKind::NoError;
            i.message.clear();
        });
    }

    pub(crate) fn raise_event(&self, bits: u8) {
        self.inner.lock(|i| i.borrow_mut().event |= bits);
    }

    pub(crate) fn publish_consigne(&self, consigne: Consigne) {
        self.inner.lock(|i| i.borrow_mut().consigne = Some(consigne));
    }

    /// Pack the status for `GET_STATUS`. Event bits are
    /// acknowledge-on-read.
    pub fn read_status(&self, out: &mut [u8; STATUS_LEN]) {
        self.inner.lock(|i| {
            let mut i = i.borrow_mut();
            out.fill(0);
            out[0] = i.state as u8;
            out[1] = i.error as u8;
            out[2] = i.event;
            out[3..3 + i.message.len()].copy_from_slice(i.message.as_bytes());
            i.event = 0;
        });
    }

    /// Pack the last consigne for `GET_CONSIGNE`. False if none arrived
    /// since reset.
    pub fn read_consigne(&self, out: &mut [u8; SNAPSHOT_LEN]) -> bool {
        self.inner.lock(|i| match &i.borrow().consigne {
            Some(c) => {
                c.to_snapshot(out);
                true
            }
            None => false,
        })
    }

    /// Non-destructive view for the firmware itself (and tests).
    pub fn peek(&self) -> (LinkState, ErrorKind, u8) {
        self.inner.lock(|i| {
            let i = i.borrow();
            (i.state, i.error, i.event)
        })
    }

    /// The current error message, for logs and tests.
    pub fn message(&self) -> String<ERROR_MSG_LEN> {
        self.inner.lock(|i| i.borrow().message.clone())
    }
}

impl Default for StatusBoard {
    fn default() -> Self {
        Self::new()
    }
}

/// Take-once backing storage for the large transfer buffers.
///
/// Intended for static use; the first call to [`BufferStorage::take`]
/// returns the zeroed slice, all later calls return `None`.
pub struct BufferStorage<const N: usize> {
    buf: GroundedArrayCell<u8, N>,
    once: AtomicBool,
}

impl<const N: usize> BufferStorage<N> {
    pub const fn new() -> Self {
        Self {
            buf: GroundedArrayCell::const_init(),
            once: AtomicBool::new(false),
        }
    }

    pub fn take(&'static self) -> Option<&'static mut [u8]> {
        critical_section::with(|_| {
            let old = self.once.load(Ordering::Acquire);
            self.once.store(true, Ordering::Release);
            !old
        })
        .then(|| unsafe {
            let ptr = self.buf.as_mut_ptr();
            core::ptr::write_bytes(ptr, 0, N);
            core::slice::from_raw_parts_mut(ptr, N)
        })
    }
}

struct DataInner {
    buf: Option<&'static mut [u8]>,
    len: u16,
}

/// Staging buffer for `PUT_DATA`/`GET_DATA` blocks, shared between the
/// USB core and the link master.
///
/// The single-outstanding-command rule of the mailbox is what makes the
/// sharing safe in time: the producer fills the buffer before posting and
/// does not touch it again until completion.
pub struct DataBuffer {
    inner: Mutex<CriticalSectionRawMutex, RefCell<DataInner>>,
}

impl DataBuffer {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(DataInner { buf: None, len: 0 })),
        }
    }

    /// Attach the backing storage, typically from a [`BufferStorage`].
    pub fn attach(&self, storage: &'static mut [u8]) {
        self.inner.lock(|i| i.borrow_mut().buf = Some(storage));
    }

    /// Host side: stage a chunk at `offset`. False if out of bounds.
    pub fn write(&self, offset: usize, data: &[u8]) -> bool {
        self.inner.lock(|i| {
            let mut i = i.borrow_mut();
            match i.buf.as_deref_mut() {
                Some(buf) if offset + data.len() <= buf.len() => {
                    buf[offset..offset + data.len()].copy_from_slice(data);
                    true
                }
                _ => false,
            }
        })
    }

    /// Host side: read a chunk back. False if out of bounds.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> bool {
        self.inner.lock(|i| {
            let i = i.borrow();
            match i.buf.as_deref() {
                Some(buf) if offset + out.len() <= buf.len() => {
                    out.copy_from_slice(&buf[offset..offset + out.len()]);
                    true
                }
                _ => false,
            }
        })
    }

    pub fn set_len(&self, len: u16) {
        self.inner.lock(|i| i.borrow_mut().len = len);
    }

    pub fn len(&self) -> u16 {
        self.inner.lock(|i| i.borrow().len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bus side: copy the first `out.len()` staged bytes out.
    pub(crate) fn copy_to(&self, out: &mut [u8]) -> bool {
        self.read(0, out)
    }
}

impl Default for DataBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mailbox_holds_one_request() {
        let mb = Mailbox::new();
        assert!(mb.is_empty());
        mb.post(Request::Disconnect { station: 0x11 }).unwrap();
        let refused = mb.post(Request::SendData {
            station: 0x11,
            len: 4,
        });
        assert!(refused.is_err());
        assert_eq!(mb.take(), Some(Request::Disconnect { station: 0x11 }));
        assert!(mb.is_empty());
        assert_eq!(mb.take(), None);
    }

    #[test]
    fn status_events_clear_on_read() {
        let board = StatusBoard::new();
        board.set_state(LinkState::Busy);
        board.record_error(ErrorKind::Timeout, "MCAMA rx timeout");
        let mut out = [0u8; STATUS_LEN];
        board.read_status(&mut out);
        assert_eq!(out[0], LinkState::Busy as u8);
        assert_eq!(out[1], ErrorKind::Timeout as u8);
        assert_eq!(out[2], EVT_ERROR);
        assert_eq!(&out[3..3 + 16], b"MCAMA rx timeout");
        // Acknowledge-on-read.
        board.read_status(&mut out);
        assert_eq!(out[2], 0);
    }

    #[test]
    fn long_error_messages_truncate() {
        let board = StatusBoard::new();
        let long = core::str::from_utf8(&[b'x'; 100]).unwrap();
        board.record_error(ErrorKind::Protocol, long);
        assert_eq!(board.message().len(), ERROR_MSG_LEN);
    }

    #[test]
    fn consigne_snapshot() {
        use crate::consigne::SNAPSHOT_LEN;
        let board = StatusBoard::new();
        let mut out = [0u8; SNAPSHOT_LEN];
        assert!(!board.read_consigne(&mut out));
        board.publish_consigne(Consigne::from_wire(0x11, &[1, 2, 3, 4]));
        assert!(board.read_consigne(&mut out));
        assert_eq!(out[0], 4);
        assert_eq!(out[1], 0x11);
        assert_eq!(&out[2..6], &[1, 2, 3, 4]);
    }

    #[test]
    fn data_buffer_stages_blocks() {
        static STORAGE: BufferStorage<256> = BufferStorage::new();
        let buf = DataBuffer::new();
        buf.attach(STORAGE.take().unwrap());
        assert!(STORAGE.take().is_none());

        assert!(buf.write(0, &[1, 2, 3, 4]));
        buf.set_len(4);
        let mut out = [0u8; 4];
        assert!(buf.copy_to(&mut out));
        assert_eq!(out, [1, 2, 3, 4]);
        assert!(!buf.write(255, &[0, 0]));
    }
}
