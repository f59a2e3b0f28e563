//! ConfigBus register access: an opaque 32-bit read/write capability
//! addressable as `(device, register)`, implemented either as a
//! zero-overhead memory-mapped wrapper or a sequence-numbered remote
//! command protocol carried over Ethernet/UDP.

use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::io::{Readable, Writeable};

/// Outcome of a register access.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IoStatus {
    Ok,
    BusError,
    CmdError,
    Timeout,
}

/// A 32-bit register-addressable bus capability. Implementations may be a
/// raw memory-mapped window (`MemoryMapped`) or a framed remote transport
/// (`Remote`); callers never distinguish between the two.
pub trait RegisterAccess {
    fn read(&self, reg: u16) -> Result<u32, IoStatus>;
    fn write(&mut self, reg: u16, value: u32) -> Result<(), IoStatus>;
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("bulk access of {0} words exceeds the 256-word limit")]
    TooLong(usize),
    #[error("bus access failed: {0:?}")]
    Bus(IoStatus),
}

/// Zero-overhead register window: each element is one 32-bit register,
/// accessed with the ordering a true memory-mapped peripheral needs
/// (no framing, no sequence numbers). Backed by `AtomicU32` rather than
/// a raw pointer so the wrapper is safe and testable off-target; an
/// on-target embedding can back it with the MMIO window's actual
/// address by constructing the slice over that memory instead.
pub struct MemoryMapped<'a> {
    regs: &'a [AtomicU32],
}

impl<'a> MemoryMapped<'a> {
    pub fn new(regs: &'a [AtomicU32]) -> Self {
        MemoryMapped { regs }
    }
}

impl<'a> RegisterAccess for MemoryMapped<'a> {
    fn read(&self, reg: u16) -> Result<u32, IoStatus> {
        self.regs
            .get(reg as usize)
            .map(|r| r.load(Ordering::SeqCst))
            .ok_or(IoStatus::BusError)
    }

    fn write(&mut self, reg: u16, value: u32) -> Result<(), IoStatus> {
        let r = self.regs.get(reg as usize).ok_or(IoStatus::BusError)?;
        r.store(value, Ordering::SeqCst);
        Ok(())
    }
}

const OPMASK_CMD: u8 = 0xF0;
const OPMASK_WREN: u8 = 0x0F;
const OPCODE_NOOP: u8 = 0x00;
const OPCODE_WRITE0: u8 = 0x20;
const OPCODE_WRITE1: u8 = 0x30;
const OPCODE_READ0: u8 = 0x40;
const OPCODE_READ1: u8 = 0x50;

/// Upper bound on a single bulk read/write, matching the original
/// transport's sanity check.
pub const MAX_BULK_WORDS: usize = 256;

/// Sequence-numbered Ethernet/UDP command protocol: `opcode(1) len(1)
/// seq(1) rsvd(1) addr(4) [payload]`, replied to in kind with a
/// trailing readback (for reads) and a one-byte error flag. `dst`/`src`
/// are expected to already be positioned on a transport that delivers
/// the reply synchronously with the request — on a real network this
/// means the caller drives `read`/`write` only once a reply frame has
/// actually arrived (e.g. from its own dispatch callback), not that
/// this type spins waiting for one.
pub struct Remote<'a> {
    dst: RefCell<&'a mut dyn Writeable>,
    src: RefCell<&'a mut dyn Readable>,
    seq: Cell<u8>,
}

impl<'a> Remote<'a> {
    pub fn new(dst: &'a mut dyn Writeable, src: &'a mut dyn Readable) -> Self {
        Remote {
            dst: RefCell::new(dst),
            src: RefCell::new(src),
            seq: Cell::new(0),
        }
    }

    /// Send a NOOP command (connectivity check); the reply carries no
    /// payload.
    pub fn noop(&self) -> Result<(), IoStatus> {
        self.transact(OPCODE_NOOP, 0, &[], 1).map(|_| ())
    }

    /// Read `count` consecutive registers starting at `reg`.
    pub fn read_array(&self, reg: u16, out: &mut [u32]) -> Result<(), Error> {
        if out.len() > MAX_BULK_WORDS {
            return Err(Error::TooLong(out.len()));
        }
        let words = self
            .transact(OPCODE_READ1, reg, &[], out.len())
            .map_err(Error::Bus)?;
        out.copy_from_slice(&words[..out.len()]);
        Ok(())
    }

    /// Read the same register `count` times (a FIFO/status port).
    pub fn read_repeat(&self, reg: u16, out: &mut [u32]) -> Result<(), Error> {
        if out.len() > MAX_BULK_WORDS {
            return Err(Error::TooLong(out.len()));
        }
        let words = self
            .transact(OPCODE_READ0, reg, &[], out.len())
            .map_err(Error::Bus)?;
        out.copy_from_slice(&words[..out.len()]);
        Ok(())
    }

    /// Write consecutive registers starting at `reg`.
    pub fn write_array(&self, reg: u16, data: &[u32]) -> Result<(), Error> {
        if data.len() > MAX_BULK_WORDS {
            return Err(Error::TooLong(data.len()));
        }
        self.transact(OPCODE_WRITE1, reg, data, data.len())
            .map_err(Error::Bus)?;
        Ok(())
    }

    /// Write the same register `data.len()` times (a FIFO/command port).
    pub fn write_repeat(&self, reg: u16, data: &[u32]) -> Result<(), Error> {
        if data.len() > MAX_BULK_WORDS {
            return Err(Error::TooLong(data.len()));
        }
        self.transact(OPCODE_WRITE0, reg, data, data.len())
            .map_err(Error::Bus)?;
        Ok(())
    }

    /// `words` is the payload for a write command, ignored for reads.
    /// `count` is the word count to request: `words.len()` for writes,
    /// the caller's desired readback length for reads. Returns the
    /// readback words for a read command (empty otherwise).
    fn transact(
        &self,
        cmd: u8,
        reg: u16,
        words: &[u32],
        count: usize,
    ) -> Result<heapless::Vec<u32, MAX_BULK_WORDS>, IoStatus> {
        let len = count.max(1);
        let seq = self.seq.get().wrapping_add(1);
        self.seq.set(seq);

        let opcode = cmd | if cmd == OPCODE_WRITE0 || cmd == OPCODE_WRITE1 {
            OPMASK_WREN
        } else {
            0
        };

        {
            let mut dst = self.dst.borrow_mut();
            dst.write_u8(opcode);
            dst.write_u8((len - 1) as u8);
            dst.write_u8(seq);
            dst.write_u8(0);
            dst.write_u32(reg as u32);
            for w in words {
                dst.write_u32(*w);
            }
            if !dst.write_finalize() {
                return Err(IoStatus::BusError);
            }
        }

        let mut src = self.src.borrow_mut();
        if src.read_ready() < 8 {
            return Err(IoStatus::Timeout);
        }
        let rx_opcode = src.read_u8();
        let rx_len8 = src.read_u8();
        let rx_seq = src.read_u8();
        src.read_u8(); // reserved
        src.read_u32(); // echoed address, not needed once matched by seq/opcode
        let rx_len = rx_len8 as usize + 1;

        if rx_opcode != opcode || rx_len != len || rx_seq != seq {
            return Err(IoStatus::CmdError);
        }

        let mut result = heapless::Vec::new();
        if cmd == OPCODE_READ0 || cmd == OPCODE_READ1 {
            let need = 4 * rx_len + 1;
            if src.read_ready() < need {
                return Err(IoStatus::Timeout);
            }
            for _ in 0..rx_len {
                let _ = result.push(src.read_u32());
            }
            let errflag = src.read_u8();
            if errflag != 0 {
                return Err(IoStatus::BusError);
            }
        }
        Ok(result)
    }
}

impl<'a> RegisterAccess for Remote<'a> {
    fn read(&self, reg: u16) -> Result<u32, IoStatus> {
        let words = self.transact(OPCODE_READ1, reg, &[], 1)?;
        Ok(words[0])
    }

    fn write(&mut self, reg: u16, value: u32) -> Result<(), IoStatus> {
        self.transact(OPCODE_WRITE1, reg, &[value], 1).map(|_| ())
    }
}
