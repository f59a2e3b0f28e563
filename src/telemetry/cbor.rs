//! The small, bounded subset of CBOR (RFC 8949) this crate needs for
//! telemetry records: unsigned/negative integers, byte/text strings,
//! booleans, single/double floats, and one level of map nesting. Encoded
//! maps always use the indefinite-length form (open byte `0xBF`, closed by
//! a `0xFF` break) so the encoder never has to know the field count in
//! advance; the decoder accepts both that and ordinary definite-length
//! maps, since a [`crate::telemetry::TelemetryRx`] may also be fed packets
//! produced by a general-purpose CBOR encoder upstream.

/// One decoded CBOR value. Values that require one level of nesting to
/// reach (byte/text strings, the handful of numeric/boolean types) are
/// all this crate's telemetry records ever carry.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum CborValue<'a> {
    Uint(u64),
    Int(i64),
    Bytes(&'a [u8]),
    Text(&'a str),
    F32(f32),
    F64(f64),
    Bool(bool),
}

/// Streaming CBOR map encoder over a fixed-size backing buffer. Construct
/// with [`CborWriter::new`], append fields, then [`CborWriter::close`]; the
/// encoded bytes are available via [`CborWriter::encoded`] regardless of
/// whether `close` reports an overflow (so a caller can still inspect how
/// much survived, though [`TelemetryAggregator`](crate::telemetry::TelemetryAggregator)
/// discards overflowed records outright).
pub struct CborWriter<const N: usize> {
    buf: [u8; N],
    len: usize,
    overflow: bool,
}

impl<const N: usize> CborWriter<N> {
    pub fn new() -> Self {
        let mut w = CborWriter {
            buf: [0; N],
            len: 0,
            overflow: false,
        };
        w.push(0xBF);
        w
    }

    fn push(&mut self, byte: u8) {
        if self.len < N {
            self.buf[self.len] = byte;
            self.len += 1;
        } else {
            self.overflow = true;
        }
    }

    fn push_slice(&mut self, bytes: &[u8]) {
        for &b in bytes {
            self.push(b);
        }
    }

    fn write_header(&mut self, major: u8, val: u64) {
        let top = major << 5;
        if val < 24 {
            self.push(top | val as u8);
        } else if val <= u8::MAX as u64 {
            self.push(top | 24);
            self.push(val as u8);
        } else if val <= u16::MAX as u64 {
            self.push(top | 25);
            self.push_slice(&(val as u16).to_be_bytes());
        } else if val <= u32::MAX as u64 {
            self.push(top | 26);
            self.push_slice(&(val as u32).to_be_bytes());
        } else {
            self.push(top | 27);
            self.push_slice(&val.to_be_bytes());
        }
    }

    fn write_key(&mut self, key: u32) {
        self.write_header(0, key as u64);
    }

    pub fn write_u32(&mut self, key: u32, val: u32) {
        self.write_key(key);
        self.write_header(0, val as u64);
    }

    pub fn write_u64(&mut self, key: u32, val: u64) {
        self.write_key(key);
        self.write_header(0, val);
    }

    pub fn write_i32(&mut self, key: u32, val: i32) {
        self.write_key(key);
        if val >= 0 {
            self.write_header(0, val as u64);
        } else {
            self.write_header(1, (-1i64 - val as i64) as u64);
        }
    }

    pub fn write_i64(&mut self, key: u32, val: i64) {
        self.write_key(key);
        if val >= 0 {
            self.write_header(0, val as u64);
        } else {
            self.write_header(1, (-1i64 - val) as u64);
        }
    }

    pub fn write_f32(&mut self, key: u32, val: f32) {
        self.write_key(key);
        self.push(0xFA);
        self.push_slice(&val.to_be_bytes());
    }

    pub fn write_f64(&mut self, key: u32, val: f64) {
        self.write_key(key);
        self.push(0xFB);
        self.push_slice(&val.to_be_bytes());
    }

    pub fn write_bool(&mut self, key: u32, val: bool) {
        self.write_key(key);
        self.push(if val { 0xF5 } else { 0xF4 });
    }

    pub fn write_bytes(&mut self, key: u32, val: &[u8]) {
        self.write_key(key);
        self.write_header(2, val.len() as u64);
        self.push_slice(val);
    }

    pub fn write_str(&mut self, key: u32, val: &str) {
        self.write_key(key);
        self.write_header(3, val.len() as u64);
        self.push_slice(val.as_bytes());
    }

    /// Close the map. Returns `false` if any field was dropped because
    /// the backing buffer ran out of room.
    pub fn close(&mut self) -> bool {
        self.push(0xFF);
        !self.overflow
    }

    pub fn encoded(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// An empty map, once closed, is exactly the two-byte `{0xBF, 0xFF}`
    /// open/close pair — nothing worth sending.
    pub fn is_empty(&self) -> bool {
        self.len <= 2
    }
}

impl<const N: usize> Default for CborWriter<N> {
    fn default() -> Self {
        Self::new()
    }
}

fn read_header(buf: &[u8], pos: &mut usize) -> Option<(u8, u64, u8)> {
    let first = *buf.get(*pos)?;
    *pos += 1;
    let major = first >> 5;
    let info = first & 0x1F;
    let value = match info {
        0..=23 => info as u64,
        24 => {
            let v = *buf.get(*pos)? as u64;
            *pos += 1;
            v
        }
        25 => {
            let b: [u8; 2] = buf.get(*pos..*pos + 2)?.try_into().ok()?;
            *pos += 2;
            u16::from_be_bytes(b) as u64
        }
        26 => {
            let b: [u8; 4] = buf.get(*pos..*pos + 4)?.try_into().ok()?;
            *pos += 4;
            u32::from_be_bytes(b) as u64
        }
        27 => {
            let b: [u8; 8] = buf.get(*pos..*pos + 8)?.try_into().ok()?;
            *pos += 8;
            u64::from_be_bytes(b)
        }
        31 => 0,
        _ => return None,
    };
    Some((major, value, info))
}

fn read_value<'a>(buf: &'a [u8], pos: &mut usize) -> Option<CborValue<'a>> {
    let (major, value, info) = read_header(buf, pos)?;
    match major {
        0 => Some(CborValue::Uint(value)),
        1 => Some(CborValue::Int(-1 - value as i64)),
        2 => {
            if info == 31 {
                return None; // indefinite-length byte strings aren't used here
            }
            let n = value as usize;
            let s = buf.get(*pos..*pos + n)?;
            *pos += n;
            Some(CborValue::Bytes(s))
        }
        3 => {
            if info == 31 {
                return None;
            }
            let n = value as usize;
            let s = buf.get(*pos..*pos + n)?;
            *pos += n;
            core::str::from_utf8(s).ok().map(CborValue::Text)
        }
        7 => match info {
            20 => Some(CborValue::Bool(false)),
            21 => Some(CborValue::Bool(true)),
            26 => Some(CborValue::F32(f32::from_bits(value as u32))),
            27 => Some(CborValue::F64(f64::from_bits(value))),
            _ => None,
        },
        _ => None,
    }
}

/// Iterates the key/value pairs of one top-level CBOR map. Keys that
/// arrive as byte/text strings are hashed to a 32-bit CRC (the same
/// algorithm as Ethernet FCS) rather than compared as strings, matching
/// `TelemetryKey`'s hashed-label convention; keys that arrive as unsigned
/// integers pass straight through.
pub struct CborMapIter<'a> {
    buf: &'a [u8],
    pos: usize,
    remaining: Option<u64>,
    done: bool,
}

impl<'a> CborMapIter<'a> {
    pub fn new(buf: &'a [u8]) -> Option<Self> {
        let mut pos = 0;
        let (major, value, info) = read_header(buf, &mut pos)?;
        if major != 5 {
            return None;
        }
        let remaining = if info == 31 { None } else { Some(value) };
        Some(CborMapIter {
            buf,
            pos,
            remaining,
            done: false,
        })
    }
}

impl<'a> Iterator for CborMapIter<'a> {
    type Item = (u32, CborValue<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.remaining {
            Some(0) => {
                self.done = true;
                return None;
            }
            Some(n) => self.remaining = Some(n - 1),
            None => {
                if self.buf.get(self.pos) == Some(&0xFF) {
                    self.pos += 1;
                    self.done = true;
                    return None;
                }
            }
        }
        let mut p = self.pos;
        let key_item = read_value(self.buf, &mut p)?;
        let key = match key_item {
            CborValue::Uint(k) => k as u32,
            CborValue::Bytes(b) => crate::crc::crc32(b),
            CborValue::Text(s) => crate::crc::crc32(s.as_bytes()),
            _ => {
                self.done = true;
                return None;
            }
        };
        let val = read_value(self.buf, &mut p)?;
        self.pos = p;
        Some((key, val))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_mixed_field_types() {
        let mut w = CborWriter::<64>::new();
        w.write_u32(1, 42);
        w.write_i32(2, -7);
        w.write_str(3, "ok");
        w.write_bool(4, true);
        w.write_f32(5, 1.5);
        assert!(w.close());

        let mut items = CborMapIter::new(w.encoded()).expect("valid map");
        assert_eq!(items.next(), Some((1, CborValue::Uint(42))));
        assert_eq!(items.next(), Some((2, CborValue::Int(-7))));
        assert_eq!(items.next(), Some((3, CborValue::Text("ok"))));
        assert_eq!(items.next(), Some((4, CborValue::Bool(true))));
        assert_eq!(items.next(), Some((5, CborValue::F32(1.5))));
        assert_eq!(items.next(), None);
    }

    #[test]
    fn empty_map_is_reported_empty() {
        let mut w = CborWriter::<16>::new();
        assert!(w.close());
        assert!(w.is_empty());
    }

    #[test]
    fn overflow_past_buffer_capacity_is_reported() {
        let mut w = CborWriter::<4>::new();
        w.write_str(1, "this does not fit");
        assert!(!w.close());
    }

    #[test]
    fn text_key_is_hashed_to_a_crc32() {
        // A hand-encoded definite-length map {"temperature": 42}.
        let mut buf = heapless::Vec::<u8, 32>::new();
        buf.push(0xA1).unwrap(); // map, 1 pair
        buf.push(0x6B).unwrap(); // text string, 11 bytes
        buf.extend_from_slice(b"temperature").unwrap();
        buf.push(0x18).unwrap(); // uint, 1-byte follows
        buf.push(42).unwrap();

        let mut items = CborMapIter::new(&buf).expect("valid map");
        let (key, val) = items.next().expect("one entry");
        assert_eq!(key, crate::crc::crc32(b"temperature"));
        assert_eq!(val, CborValue::Uint(42));
    }
}
