//! Streaming checksum codecs: append-on-finalize (`ChecksumTx`) and
//! verify-on-finalize (`ChecksumRx`), both built around [`crc::Crc32State`].

use crate::crc::Crc32State;
use crate::io::Writeable;

/// Wraps a destination `Writeable`; every byte is forwarded untouched and
/// folded into a running CRC-32, which is appended (4 bytes, wire-order)
/// when the frame is finalized.
pub struct ChecksumTx<'a> {
    dst: &'a mut dyn Writeable,
    crc: Crc32State,
}

impl<'a> ChecksumTx<'a> {
    pub fn new(dst: &'a mut dyn Writeable) -> Self {
        ChecksumTx {
            dst,
            crc: Crc32State::new(),
        }
    }
}

impl<'a> Writeable for ChecksumTx<'a> {
    fn write_space(&self) -> usize {
        self.dst.write_space().saturating_sub(4)
    }

    fn write_bytes(&mut self, src: &[u8]) {
        for &b in src {
            self.crc.update(b);
        }
        self.dst.write_bytes(src);
    }

    fn write_next(&mut self, data: u8) {
        self.write_bytes(&[data]);
    }

    fn write_overflow(&mut self) {
        self.dst.write_overflow();
    }

    fn write_finalize(&mut self) -> bool {
        let crc = self.crc.finish();
        self.dst.write_bytes(&crc.to_le_bytes());
        self.crc = Crc32State::new();
        self.dst.write_finalize()
    }

    fn write_abort(&mut self) {
        self.crc = Crc32State::new();
        self.dst.write_abort();
    }
}

/// Wraps a destination `Writeable`; buffers the trailing 4 bytes of each
/// frame in a shift register, feeding only validated payload bytes (all
/// but the trailing CRC) to the destination. Keeps cumulative error and
/// frame counters for diagnostics.
pub struct ChecksumRx<'a> {
    dst: &'a mut dyn Writeable,
    crc: Crc32State,
    shift: [u8; 4],
    filled: usize,
    frames_ok: u32,
    frames_bad: u32,
}

impl<'a> ChecksumRx<'a> {
    pub fn new(dst: &'a mut dyn Writeable) -> Self {
        ChecksumRx {
            dst,
            crc: Crc32State::new(),
            shift: [0; 4],
            filled: 0,
            frames_ok: 0,
            frames_bad: 0,
        }
    }

    pub fn frames_ok(&self) -> u32 {
        self.frames_ok
    }

    pub fn frames_bad(&self) -> u32 {
        self.frames_bad
    }

    /// Push one more byte into the 4-byte trailing shift register,
    /// returning the byte that falls out the front (which is safe to fold
    /// into the running CRC) once the register is full.
    fn sreg_push(&mut self, byte: u8) -> Option<u8> {
        if self.filled < 4 {
            self.shift[self.filled] = byte;
            self.filled += 1;
            return None;
        }
        let out = self.shift[0];
        self.shift.copy_within(1..4, 0);
        self.shift[3] = byte;
        Some(out)
    }
}

impl<'a> Writeable for ChecksumRx<'a> {
    fn write_space(&self) -> usize {
        self.dst.write_space()
    }

    fn write_bytes(&mut self, src: &[u8]) {
        for &b in src {
            if let Some(out) = self.sreg_push(b) {
                self.crc.update(out);
                self.dst.write_u8(out);
            }
        }
    }

    fn write_next(&mut self, data: u8) {
        self.write_bytes(&[data]);
    }

    fn write_overflow(&mut self) {
        self.dst.write_overflow();
    }

    fn write_finalize(&mut self) -> bool {
        let ok = self.filled == 4 && self.crc.finish().to_le_bytes() == self.shift;
        self.crc = Crc32State::new();
        self.filled = 0;
        if ok {
            self.frames_ok += 1;
            self.dst.write_finalize()
        } else {
            self.frames_bad += 1;
            self.dst.write_abort();
            false
        }
    }

    fn write_abort(&mut self) {
        self.crc = Crc32State::new();
        self.filled = 0;
        self.dst.write_abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::buffer::PacketBuffer;

    #[test]
    fn tx_then_rx_round_trips_and_detects_bitflip() {
        let mut raw = [0u8; 64];
        let mut lbuf = [0u16; 2];
        let mut rx_buf = PacketBuffer::new(&mut raw, &mut lbuf, 2);

        let mut wire = [0u8; 64];
        {
            let mut wbuf_raw = [0u8; 64];
            let mut wbuf_lbuf = [0u16; 2];
            let mut staging = PacketBuffer::new(&mut wbuf_raw, &mut wbuf_lbuf, 2);
            {
                let mut tx = ChecksumTx::new(&mut staging);
                tx.write_bytes(b"hello, checksum world!!");
                assert!(tx.write_finalize());
            }
            let n = staging.read_ready();
            for (i, slot) in wire.iter_mut().take(n).enumerate() {
                *slot = {
                    let mut b = [0u8; 1];
                    staging.read_bytes(&mut b);
                    let _ = i;
                    b[0]
                };
            }
            wire_len_check(n);
            let mut checksum_rx = ChecksumRx::new(&mut rx_buf);
            checksum_rx.write_bytes(&wire[..n]);
            assert!(checksum_rx.write_finalize());
            assert_eq!(checksum_rx.frames_ok(), 1);
        }

        // Corrupt one bit of the wire image and confirm detection.
        let mut raw2 = [0u8; 64];
        let mut lbuf2 = [0u16; 2];
        let mut sink2 = PacketBuffer::new(&mut raw2, &mut lbuf2, 2);
        let mut corrupted = wire;
        corrupted[0] ^= 0x01;
        let mut checksum_rx2 = ChecksumRx::new(&mut sink2);
        checksum_rx2.write_bytes(&corrupted[..24 + 4]);
        assert!(!checksum_rx2.write_finalize());
        assert_eq!(checksum_rx2.frames_bad(), 1);
    }

    fn wire_len_check(n: usize) {
        assert_eq!(n, "hello, checksum world!!".len() + 4);
    }
}
