//! Lockstep reliable byte-stream transport (component J): trades TCP's
//! window scaling and congestion control for a fixed retransmit window and
//! a much smaller footprint. Transport-agnostic by design — see
//! [`crate::eth::Tpipe`] and [`crate::udp::Tpipe`] for the two bindings
//! built on this core.
//!
//! The Tpipe packet header is six bytes: `u16 flags` (start/stop flags
//! packed with the data length), `u16 txpos`, `u16 rxpos`, followed by up
//! to [`MAX_WINDOW`] bytes of data.

use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};

use crate::io::{LimitedRead, Readable, Writeable};

/// Largest single data block, and the capacity of each direction's
/// retransmit/reassembly buffer.
pub const MAX_WINDOW: usize = 512;

const FLAG_START: u16 = 0x8000;
const FLAG_STOP: u16 = 0x4000;
const FLAG_LEN: u16 = 0x03FF;

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    struct State: u16 {
        const OPENREQ = 0x0001;
        const READY   = 0x0002;
        const TXBUSY  = 0x0004;
        const CLOSING = 0x0008;
        const TXONLY  = 0x0010;
    }
}

/// What a [`Core`] needs from its transport binding to send one packet:
/// write any outer framing (Ethernet, or Ethernet+IP+UDP) sized for
/// `body_len` additional bytes, then let the core write the Tpipe header
/// and body into `out`. Returns `false` if not ready right now (peer
/// address not yet known, ARP resolution pending, ...); the core retries
/// on the next poll, the same catch-all path used for flow control.
pub trait Link {
    fn open_write(&mut self, body_len: usize, out: &mut dyn Writeable) -> bool;
}

/// Fixed-capacity byte queue backing each direction of a [`Core`]'s
/// buffered stream. Plays the same role as `io::buffer::PacketBuffer` in
/// stream mode, but owns its storage outright: a `Core` can't hold a
/// `PacketBuffer` borrowing a slice of itself.
struct ByteFifo {
    buf: [u8; MAX_WINDOW],
    len: usize,
}

impl ByteFifo {
    const fn new() -> Self {
        ByteFifo {
            buf: [0; MAX_WINDOW],
            len: 0,
        }
    }

    fn clear(&mut self) {
        self.len = 0;
    }

    fn space(&self) -> usize {
        MAX_WINDOW - self.len
    }

    /// Append as much of `data` as fits; returns the number of bytes
    /// actually queued.
    fn push(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.space());
        self.buf[self.len..self.len + n].copy_from_slice(&data[..n]);
        self.len += n;
        n
    }

    fn peek(&self, n: usize) -> &[u8] {
        &self.buf[..n.min(self.len)]
    }

    fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        self.buf.copy_within(n..self.len, 0);
        self.len -= n;
    }
}

impl Writeable for ByteFifo {
    fn write_space(&self) -> usize {
        self.space()
    }

    fn write_bytes(&mut self, src: &[u8]) {
        if self.push(src) < src.len() {
            self.write_overflow();
        }
    }

    fn write_next(&mut self, data: u8) {
        self.write_bytes(&[data]);
    }
}

impl Readable for ByteFifo {
    fn read_ready(&self) -> usize {
        self.len
    }

    fn read_bytes(&mut self, dst: &mut [u8]) -> bool {
        if dst.len() > self.len {
            self.read_underflow();
            return false;
        }
        dst.copy_from_slice(&self.buf[..dst.len()]);
        self.consume(dst.len());
        true
    }

    fn read_next(&mut self) -> u8 {
        let b = self.buf[0];
        self.consume(1);
        b
    }
}

/// Core lockstep byte-stream state machine, shared by both transport
/// bindings. The application writes outgoing bytes and reads incoming ones
/// through this object directly (it implements [`Readable`]/[`Writeable`]
/// over its internal FIFOs), while the embedding loop drives [`open`],
/// [`close`], [`packet_rcvd`] and [`poll_always`].
pub struct Core {
    state: State,
    retry_msec: u32,
    next_due_msec: u32,
    retransmit_msec: u16,
    timeout_msec: u16,
    txpos: u16,
    txref: u16,
    rxpos: u16,
    rxref: u16,
    tx: ByteFifo,
    rx: ByteFifo,
    rng: ChaCha8Rng,
    now: u32,
}

impl Core {
    /// `seed` drives the jitter and initial sequence-number randomization;
    /// pass whatever entropy source the embedding application has (this
    /// crate has no OS RNG to call in `no_std`).
    pub fn new(seed: u64) -> Self {
        Core {
            state: State::empty(),
            retry_msec: 0,
            next_due_msec: 0,
            retransmit_msec: 500,
            timeout_msec: 30_000,
            txpos: 0,
            txref: 0,
            rxpos: 0,
            rxref: 0,
            tx: ByteFifo::new(),
            rx: ByteFifo::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            now: 0,
        }
    }

    /// Latch the current time, following the same convention as
    /// `switch::SwitchCore`/`router::Dispatch`: called once per main-loop
    /// pass before any other method that needs to know "now".
    pub fn set_time(&mut self, now_msec: u32) {
        self.now = now_msec;
    }

    pub fn set_retransmit(&mut self, msec: u16) {
        self.retransmit_msec = msec;
    }

    pub fn set_timeout(&mut self, msec: u16) {
        self.timeout_msec = msec;
    }

    /// Unidirectional streaming: no acknowledgement is required and queued
    /// data is consumed immediately after each send. Sticky until closed.
    pub fn set_txonly(&mut self) {
        self.timeout_msec = 0;
        self.state.insert(State::READY | State::TXONLY);
    }

    /// Has every byte queued for transmission been acknowledged?
    pub fn completed(&self) -> bool {
        self.state.contains(State::READY) && self.tx.len == 0
    }

    pub fn is_ready(&self) -> bool {
        self.state.contains(State::READY)
    }

    /// Notify the core that the application queued new data, so it can
    /// send right away instead of waiting for the next retransmit tick (the
    /// explicit counterpart of a `data_rcvd`-style callback).
    pub fn data_queued(&mut self) {
        if !self.state.contains(State::TXBUSY) {
            self.next_due_msec = self.now;
        }
    }

    /// Begin opening a connection. Randomizes the initial sequence numbers
    /// so a stale peer can't accidentally resume a prior session. The
    /// opening packet itself goes out on the next [`poll_always`].
    ///
    /// [`poll_always`]: Core::poll_always
    pub fn open(&mut self) {
        self.state = State::OPENREQ;
        self.txpos = (self.rng.next_u32() & 0xFFFF) as u16;
        self.rxpos = (self.rng.next_u32() & 0xFFFF) as u16;
        self.next_due_msec = self.now;
    }

    /// Begin closing the connection. Per the crate's "does not wait for
    /// acknowledgement" contract, the close packet (if one is owed) goes
    /// out on the next `poll_always`, after which local state is torn down
    /// immediately rather than waiting for the peer's ack.
    pub fn close(&mut self) {
        if self.state.contains(State::READY) {
            self.state.insert(State::CLOSING);
            self.next_due_msec = self.now;
        } else {
            self.reset();
        }
    }

    fn reset(&mut self) {
        self.state = State::empty();
        self.tx.clear();
        self.rx.clear();
    }

    fn due(&self) -> bool {
        self.now.wrapping_sub(self.next_due_msec) < (1 << 31)
    }

    /// Feed one received Tpipe packet (the transport binding has already
    /// stripped its own framing; `src` starts at the six-byte Tpipe header).
    /// Call `set_time` first so the connection's timers stay in sync.
    pub fn packet_rcvd(&mut self, mut src: LimitedRead<'_>) {
        if src.read_ready() < 6 {
            return;
        }
        let flags = src.read_u16();
        let txpos_in = src.read_u16();
        let rxpos_in = src.read_u16();
        let rxlen = (flags & FLAG_LEN) as usize;
        if src.read_ready() < rxlen || rxlen > MAX_WINDOW {
            return;
        }

        if flags & FLAG_START != 0 {
            // Check against the sequence numbers from our own last sent
            // packet before resetting them, so a delayed duplicate of the
            // original open request doesn't clobber an established session.
            let dupe = self.txref == rxpos_in && self.rxref == txpos_in;
            if !dupe {
                self.rx.clear();
                self.txpos = rxpos_in;
                self.txref = rxpos_in;
                self.rxpos = txpos_in;
                self.rxref = txpos_in;
            }
            self.state = State::READY;
            self.next_due_msec = self.now;
        } else if self.state.contains(State::OPENREQ) {
            self.rx.clear();
            self.state.remove(State::OPENREQ);
            self.state.insert(State::READY);
        } else if !self.state.contains(State::READY) {
            return;
        }

        // Any packet from the remote side resets the lost-connection timer.
        self.retry_msec = 0;

        let rxdiff = rxpos_in.wrapping_sub(self.txpos);
        if (rxdiff as i16) > 0 {
            let n = rxdiff as usize;
            self.tx.consume(n);
            self.txpos = self.txpos.wrapping_add(rxdiff);
            self.state.remove(State::TXBUSY);
            self.next_due_msec = self.now;
        }

        let skip = self.rxpos.wrapping_sub(txpos_in) as usize;
        if rxlen > skip {
            let rdlen = (rxlen - skip).min(self.rx.space());
            let _ = src.read_consume(skip);
            let mut tmp = [0u8; MAX_WINDOW];
            let _ = src.read_bytes(&mut tmp[..rdlen]);
            let n = self.rx.push(&tmp[..rdlen]);
            self.rxpos = self.rxpos.wrapping_add(n as u16);
            self.next_due_msec = self.now;
        }

        if flags & FLAG_STOP != 0 {
            self.reset();
        }
    }

    /// Send a retransmit/keep-alive/acknowledgement block if one is due,
    /// and tear the connection down if the lost-connection timeout has
    /// elapsed. Call once per main-loop pass, after `set_time`.
    pub fn poll_always(&mut self, link: &mut dyn Link, out: &mut dyn Writeable) {
        if self.state.is_empty() || !self.due() {
            return;
        }
        if (self.retry_msec < self.timeout_msec as u32) || self.state.contains(State::TXONLY) {
            self.send_block(link, out);
        } else {
            self.reset();
        }
    }

    fn send_block(&mut self, link: &mut dyn Link, out: &mut dyn Writeable) {
        let closing = self.state.contains(State::CLOSING);
        let txlen = self.tx.len.min(MAX_WINDOW);
        if link.open_write(6 + txlen, out) {
            // Randomize the next retry from 1.0-1.5x nominal to reduce the
            // number of crossing-in-transit messages.
            let half = ((self.retransmit_msec as u32) / 2).max(1);
            let timeout = self.retransmit_msec as u32 + self.rng.next_u32() % half;
            self.state.insert(State::TXBUSY);
            self.retry_msec += timeout;
            self.next_due_msec = self.now.wrapping_add(timeout);

            let mut flags = txlen as u16;
            if self.state.contains(State::OPENREQ) {
                flags |= FLAG_START;
            }
            if closing {
                flags |= FLAG_STOP;
            }
            out.write_u16(flags);
            out.write_u16(self.txpos);
            out.write_u16(self.rxpos);
            if txlen > 0 {
                out.write_bytes(self.tx.peek(txlen));
            }
            let sent = out.write_finalize();

            if closing {
                // Fire-and-forget: don't wait for the peer's ack.
                self.reset();
                return;
            }
            if sent && self.state.contains(State::TXONLY) {
                self.tx.consume(txlen);
                self.txpos = self.txpos.wrapping_add(txlen as u16);
            }
        } else {
            // Rapid polling until the transport is ready to send (flow
            // control, or an ARP resolution still outstanding).
            const POLL_MSEC: u32 = 10;
            self.retry_msec += POLL_MSEC;
            self.next_due_msec = self.now.wrapping_add(POLL_MSEC);
        }
    }
}

impl Writeable for Core {
    fn write_space(&self) -> usize {
        self.tx.write_space()
    }

    fn write_bytes(&mut self, src: &[u8]) {
        self.tx.write_bytes(src);
    }

    fn write_next(&mut self, data: u8) {
        self.tx.write_next(data);
    }

    fn write_overflow(&mut self) {
        self.tx.write_overflow();
    }
}

impl Readable for Core {
    fn read_ready(&self) -> usize {
        self.rx.read_ready()
    }

    fn read_bytes(&mut self, dst: &mut [u8]) -> bool {
        self.rx.read_bytes(dst)
    }

    fn read_next(&mut self) -> u8 {
        self.rx.read_next()
    }
}
