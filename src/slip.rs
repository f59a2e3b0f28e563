//! SLIP (RFC 1055) serial-line framing: `0xC0` end delimiter, `0xDB`
//! escape, used to frame packets over a raw byte-oriented link (UART).

use crate::io::Writeable;

const END: u8 = 0xC0;
const ESC: u8 = 0xDB;
const ESC_END: u8 = 0xDC;
const ESC_ESC: u8 = 0xDD;

/// Encodes outgoing packets with SLIP escaping, writing a leading `END`
/// byte before each frame so the decoder at the far end can resynchronize
/// after a dropped byte.
pub struct SlipEncoder<'a> {
    dst: &'a mut dyn Writeable,
    started: bool,
}

impl<'a> SlipEncoder<'a> {
    pub fn new(dst: &'a mut dyn Writeable) -> Self {
        SlipEncoder {
            dst,
            started: false,
        }
    }
}

impl<'a> Writeable for SlipEncoder<'a> {
    fn write_space(&self) -> usize {
        self.dst.write_space() / 2
    }

    fn write_bytes(&mut self, src: &[u8]) {
        if !self.started {
            self.dst.write_u8(END);
            self.started = true;
        }
        for &b in src {
            match b {
                END => self.dst.write_bytes(&[ESC, ESC_END]),
                ESC => self.dst.write_bytes(&[ESC, ESC_ESC]),
                _ => self.dst.write_u8(b),
            }
        }
    }

    fn write_next(&mut self, data: u8) {
        self.write_bytes(&[data]);
    }

    fn write_finalize(&mut self) -> bool {
        self.dst.write_u8(END);
        self.started = false;
        self.dst.write_finalize()
    }

    fn write_abort(&mut self) {
        self.started = false;
        self.dst.write_abort();
    }
}

/// Decodes a raw SLIP byte stream into framed packets, handing each
/// complete frame to `dst` and discarding empty frames (consecutive `END`
/// bytes).
pub struct SlipDecoder<'a> {
    dst: &'a mut dyn Writeable,
    escaped: bool,
    frame_len: usize,
}

impl<'a> SlipDecoder<'a> {
    pub fn new(dst: &'a mut dyn Writeable) -> Self {
        SlipDecoder {
            dst,
            escaped: false,
            frame_len: 0,
        }
    }

    /// Feed one raw byte from the serial link.
    pub fn push(&mut self, byte: u8) {
        match byte {
            END => {
                if self.frame_len > 0 {
                    self.dst.write_finalize();
                }
                self.frame_len = 0;
                self.escaped = false;
            }
            ESC => self.escaped = true,
            ESC_END if self.escaped => {
                self.dst.write_u8(END);
                self.frame_len += 1;
                self.escaped = false;
            }
            ESC_ESC if self.escaped => {
                self.dst.write_u8(ESC);
                self.frame_len += 1;
                self.escaped = false;
            }
            b => {
                self.escaped = false;
                self.dst.write_u8(b);
                self.frame_len += 1;
            }
        }
    }

    /// Feed a run of raw bytes.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push(b);
        }
    }
}
