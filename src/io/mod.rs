//! Abstract byte/packet stream interfaces shared by every protocol and
//! device adapter in the crate: [`Readable`], [`Writeable`], and the
//! lightweight composition wrappers built on top of them.

pub mod buffer;

use heapless::Vec;

/// Write a byte-stream or packet stream without blocking.
///
/// Implementors MUST override [`Writeable::write_space`]; the default
/// multi-width write helpers are provided here and call down to
/// [`Writeable::write_bytes`], which implementors MAY override for
/// performance but never must.
pub trait Writeable {
    /// Bytes that can be accepted right now without blocking.
    fn write_space(&self) -> usize;

    /// Write `src` to the stream. The default forwards each byte to
    /// `write_next`; most implementations only need to override this for
    /// performance (e.g. a circular buffer copying a contiguous run).
    fn write_bytes(&mut self, src: &[u8]) {
        for &b in src {
            self.write_next(b);
        }
    }

    /// Push a single byte. Implementations that override `write_bytes`
    /// still need this for the generic scalar-write helpers below, but may
    /// leave it unreachable if every call site is routed through
    /// `write_bytes`.
    fn write_next(&mut self, data: u8);

    /// Called whenever a write exceeds available space; sets whatever
    /// sticky overflow flag `write_finalize` consults. Default: no-op
    /// (callers that don't track overflow just always succeed).
    fn write_overflow(&mut self) {}

    /// Commit the in-progress frame. Returns `false` if an overflow
    /// occurred since the last finalize/abort.
    fn write_finalize(&mut self) -> bool {
        true
    }

    /// Discard the in-progress frame.
    fn write_abort(&mut self) {}

    /// Write a null-terminator-free string.
    fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }
    fn write_u16(&mut self, v: u16) {
        self.write_bytes(&v.to_be_bytes());
    }
    fn write_u24(&mut self, v: u32) {
        self.write_bytes(&v.to_be_bytes()[1..4]);
    }
    fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_be_bytes());
    }
    fn write_u48(&mut self, v: u64) {
        self.write_bytes(&v.to_be_bytes()[2..8]);
    }
    fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_be_bytes());
    }
    fn write_s8(&mut self, v: i8) {
        self.write_u8(v as u8);
    }
    fn write_s16(&mut self, v: i16) {
        self.write_u16(v as u16);
    }
    fn write_s32(&mut self, v: i32) {
        self.write_u32(v as u32);
    }
    fn write_s64(&mut self, v: i64) {
        self.write_u64(v as u64);
    }
    fn write_f32(&mut self, v: f32) {
        self.write_u32(v.to_bits());
    }
    fn write_f64(&mut self, v: f64) {
        self.write_u64(v.to_bits());
    }

    fn write_u16l(&mut self, v: u16) {
        self.write_bytes(&v.to_le_bytes());
    }
    fn write_u24l(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes()[0..3]);
    }
    fn write_u32l(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }
    fn write_u48l(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes()[0..6]);
    }
    fn write_u64l(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }
    fn write_s16l(&mut self, v: i16) {
        self.write_u16l(v as u16);
    }
    fn write_s32l(&mut self, v: i32) {
        self.write_u32l(v as u32);
    }
    fn write_s64l(&mut self, v: i64) {
        self.write_u64l(v as u64);
    }
    fn write_f32l(&mut self, v: f32) {
        self.write_u32l(v.to_bits());
    }
    fn write_f64l(&mut self, v: f64) {
        self.write_u64l(v.to_bits());
    }
}

/// Objects that know how to serialize themselves onto a `Writeable`,
/// mirroring `write_obj<T>`'s `t.write_to(this)` dispatch.
pub trait WriteTo {
    fn write_to(&self, dst: &mut dyn Writeable);
}

/// Read a byte-stream or packet stream without blocking.
pub trait Readable {
    /// Bytes immediately available to read (within the current packet, if
    /// the source is packetized).
    fn read_ready(&self) -> usize;

    /// Fill `dst` completely or return `false` if insufficient data is
    /// ready (no partial read occurs on failure from the caller's point of
    /// view, though bytes may have been consumed from a degraded source —
    /// callers needing strict all-or-nothing semantics should check
    /// `read_ready` first).
    fn read_bytes(&mut self, dst: &mut [u8]) -> bool {
        if self.read_ready() < dst.len() {
            self.read_underflow();
            return false;
        }
        for slot in dst.iter_mut() {
            *slot = self.read_next();
        }
        true
    }

    /// Pull the next byte. Called by the default `read_bytes`/scalar
    /// helpers.
    fn read_next(&mut self) -> u8;

    /// Called when a read is attempted past the end of available data.
    fn read_underflow(&mut self) {}

    /// Skip `nbytes` without returning them.
    fn read_consume(&mut self, nbytes: usize) -> bool {
        if self.read_ready() < nbytes {
            self.read_underflow();
            return false;
        }
        for _ in 0..nbytes {
            self.read_next();
        }
        true
    }

    /// Release the current packet (packetized sources) or no-op (stream
    /// sources).
    fn read_finalize(&mut self) {}

    /// Copy everything currently ready to `dst`.
    fn copy_to(&mut self, dst: &mut dyn Writeable) {
        let n = self.read_ready();
        for _ in 0..n {
            dst.write_u8(self.read_next());
        }
    }

    fn read_u8(&mut self) -> u8 {
        let mut b = [0u8; 1];
        self.read_bytes(&mut b);
        b[0]
    }
    fn read_u16(&mut self) -> u16 {
        let mut b = [0u8; 2];
        self.read_bytes(&mut b);
        u16::from_be_bytes(b)
    }
    fn read_u24(&mut self) -> u32 {
        let mut b = [0u8; 4];
        self.read_bytes(&mut b[1..4]);
        u32::from_be_bytes(b)
    }
    fn read_u32(&mut self) -> u32 {
        let mut b = [0u8; 4];
        self.read_bytes(&mut b);
        u32::from_be_bytes(b)
    }
    fn read_u48(&mut self) -> u64 {
        let mut b = [0u8; 8];
        self.read_bytes(&mut b[2..8]);
        u64::from_be_bytes(b)
    }
    fn read_u64(&mut self) -> u64 {
        let mut b = [0u8; 8];
        self.read_bytes(&mut b);
        u64::from_be_bytes(b)
    }
    fn read_s8(&mut self) -> i8 {
        self.read_u8() as i8
    }
    fn read_s16(&mut self) -> i16 {
        self.read_u16() as i16
    }
    fn read_s32(&mut self) -> i32 {
        self.read_u32() as i32
    }
    fn read_s64(&mut self) -> i64 {
        self.read_u64() as i64
    }
    fn read_f32(&mut self) -> f32 {
        f32::from_bits(self.read_u32())
    }
    fn read_f64(&mut self) -> f64 {
        f64::from_bits(self.read_u64())
    }

    fn read_u16l(&mut self) -> u16 {
        let mut b = [0u8; 2];
        self.read_bytes(&mut b);
        u16::from_le_bytes(b)
    }
    fn read_u24l(&mut self) -> u32 {
        let mut b = [0u8; 4];
        self.read_bytes(&mut b[0..3]);
        u32::from_le_bytes(b)
    }
    fn read_u32l(&mut self) -> u32 {
        let mut b = [0u8; 4];
        self.read_bytes(&mut b);
        u32::from_le_bytes(b)
    }
    fn read_u64l(&mut self) -> u64 {
        let mut b = [0u8; 8];
        self.read_bytes(&mut b);
        u64::from_le_bytes(b)
    }
    fn read_s16l(&mut self) -> i16 {
        self.read_u16l() as i16
    }
    fn read_s32l(&mut self) -> i32 {
        self.read_u32l() as i32
    }
    fn read_s64l(&mut self) -> i64 {
        self.read_u64l() as i64
    }
}

/// Non-owning, single-shot `Writeable` over caller-provided storage.
pub struct ArrayWrite<'a> {
    dst: &'a mut [u8],
    widx: usize,
    overflow: bool,
}

impl<'a> ArrayWrite<'a> {
    pub fn new(dst: &'a mut [u8]) -> Self {
        ArrayWrite {
            dst,
            widx: 0,
            overflow: false,
        }
    }

    /// Bytes written since construction or the last `write_finalize`.
    pub fn written_len(&self) -> usize {
        self.widx
    }

    pub fn written(&self) -> &[u8] {
        &self.dst[..self.widx]
    }
}

impl<'a> Writeable for ArrayWrite<'a> {
    fn write_space(&self) -> usize {
        self.dst.len() - self.widx
    }

    fn write_bytes(&mut self, src: &[u8]) {
        if src.len() > self.write_space() {
            self.write_overflow();
            return;
        }
        self.dst[self.widx..self.widx + src.len()].copy_from_slice(src);
        self.widx += src.len();
    }

    fn write_next(&mut self, data: u8) {
        self.write_bytes(&[data]);
    }

    fn write_overflow(&mut self) {
        self.overflow = true;
    }

    fn write_finalize(&mut self) -> bool {
        let ok = !self.overflow;
        self.overflow = false;
        ok
    }

    fn write_abort(&mut self) {
        self.widx = 0;
        self.overflow = false;
    }
}

/// Non-owning, single-shot `Readable` over caller-provided storage.
pub struct ArrayRead<'a> {
    src: &'a [u8],
    ridx: usize,
}

impl<'a> ArrayRead<'a> {
    pub fn new(src: &'a [u8]) -> Self {
        ArrayRead { src, ridx: 0 }
    }
}

impl<'a> Readable for ArrayRead<'a> {
    fn read_ready(&self) -> usize {
        self.src.len() - self.ridx
    }

    fn read_next(&mut self) -> u8 {
        let b = self.src[self.ridx];
        self.ridx += 1;
        b
    }
}

/// Wraps a source and caps the number of bytes visible through it,
/// without affecting `read_finalize` on the underlying source (the caller
/// retains responsibility for releasing the real frame).
pub struct LimitedRead<'a> {
    src: &'a mut dyn Readable,
    remaining: usize,
}

impl<'a> LimitedRead<'a> {
    pub fn new(src: &'a mut dyn Readable, max_len: usize) -> Self {
        let remaining = max_len.min(src.read_ready());
        LimitedRead { src, remaining }
    }

    pub fn remaining(&self) -> usize {
        self.remaining
    }
}

impl<'a> Readable for LimitedRead<'a> {
    fn read_ready(&self) -> usize {
        self.remaining.min(self.src.read_ready())
    }

    fn read_next(&mut self) -> u8 {
        debug_assert!(self.remaining > 0);
        self.remaining = self.remaining.saturating_sub(1);
        self.src.read_next()
    }
}

/// Wraps a destination and caps the number of bytes writable through it.
/// `write_finalize` is intentionally not forwarded: the limited view exists
/// purely to bound how much a nested writer may emit, not to control
/// framing of the underlying destination.
pub struct LimitedWrite<'a> {
    dst: &'a mut dyn Writeable,
    remaining: usize,
}

impl<'a> LimitedWrite<'a> {
    pub fn new(dst: &'a mut dyn Writeable, max_len: usize) -> Self {
        LimitedWrite {
            dst,
            remaining: max_len,
        }
    }
}

impl<'a> Writeable for LimitedWrite<'a> {
    fn write_space(&self) -> usize {
        self.remaining.min(self.dst.write_space())
    }

    fn write_bytes(&mut self, src: &[u8]) {
        let n = src.len().min(self.remaining);
        self.dst.write_bytes(&src[..n]);
        self.remaining -= n;
        if n < src.len() {
            self.dst.write_overflow();
        }
    }

    fn write_next(&mut self, data: u8) {
        self.write_bytes(&[data]);
    }
}

/// Discards everything written to it; reports a fixed amount of available
/// space. Used as a placeholder destination instead of a null pointer.
pub struct NullWrite {
    space: usize,
}

impl NullWrite {
    pub const fn new(space: usize) -> Self {
        NullWrite { space }
    }
}

impl Writeable for NullWrite {
    fn write_space(&self) -> usize {
        self.space
    }
    fn write_bytes(&mut self, _src: &[u8]) {}
    fn write_next(&mut self, _data: u8) {}
}

/// Pump mode for [`BufferedCopy`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CopyMode {
    /// Finalize the destination at each source packet boundary.
    Packet,
    /// Finalize after every copy, regardless of packet boundaries.
    Stream,
    /// Never finalize; caller is responsible for committing the frame.
    Always,
}

/// Pumps bytes from a source to a sink whenever notified (typically from a
/// `data_rcvd`-style callback), honoring one of three finalize policies.
pub struct BufferedCopy<'a> {
    src: &'a mut dyn Readable,
    dst: &'a mut dyn Writeable,
    mode: CopyMode,
}

impl<'a> BufferedCopy<'a> {
    pub fn new(src: &'a mut dyn Readable, dst: &'a mut dyn Writeable, mode: CopyMode) -> Self {
        BufferedCopy { src, dst, mode }
    }

    /// Drain everything currently ready from the source.
    pub fn pump(&mut self) {
        self.src.copy_to(self.dst);
        match self.mode {
            CopyMode::Packet => {
                self.dst.write_finalize();
                self.src.read_finalize();
            }
            CopyMode::Stream => {
                self.dst.write_finalize();
            }
            CopyMode::Always => {}
        }
    }
}

/// Packetizes a byte stream toward a network address with three
/// thresholds: always send once `max_chunk` bytes are queued, optionally
/// send as soon as `min_txnow` bytes are queued, otherwise flush whatever
/// is queued once the idle timer (driven externally via `poll`) expires.
pub struct BufferedStream<'a> {
    src: &'a mut dyn Readable,
    dst: &'a mut dyn Writeable,
    max_chunk: usize,
    min_txnow: usize,
}

impl<'a> BufferedStream<'a> {
    pub fn new(
        src: &'a mut dyn Readable,
        dst: &'a mut dyn Writeable,
        max_chunk: usize,
        min_txnow: usize,
    ) -> Self {
        BufferedStream {
            src,
            dst,
            max_chunk,
            min_txnow,
        }
    }

    /// Called on each `data_rcvd` notification; sends immediately once
    /// `max_chunk` or `min_txnow` bytes are available.
    pub fn poll(&mut self) {
        let ready = self.src.read_ready();
        if ready >= self.max_chunk || (self.min_txnow > 0 && ready >= self.min_txnow) {
            self.flush(ready.min(self.max_chunk.max(self.min_txnow)).max(1));
        }
    }

    /// Force a flush of up to `ready` bytes regardless of threshold,
    /// called by the idle timeout path.
    pub fn flush_idle(&mut self) {
        let ready = self.src.read_ready();
        if ready > 0 {
            self.flush(ready);
        }
    }

    fn flush(&mut self, n: usize) {
        let n = n.min(self.src.read_ready());
        for _ in 0..n {
            self.dst.write_u8(self.src.read_next());
        }
        self.dst.write_finalize();
    }
}

/// Broadcasts every write to a fixed-capacity list of sinks.
pub struct BufferedTee<'a, const N: usize> {
    sinks: Vec<&'a mut dyn Writeable, N>,
}

impl<'a, const N: usize> BufferedTee<'a, N> {
    pub fn new() -> Self {
        BufferedTee { sinks: Vec::new() }
    }

    pub fn add(&mut self, sink: &'a mut dyn Writeable) -> Result<(), &'a mut dyn Writeable> {
        self.sinks.push(sink)
    }
}

impl<'a, const N: usize> Default for BufferedTee<'a, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const N: usize> Writeable for BufferedTee<'a, N> {
    fn write_space(&self) -> usize {
        self.sinks
            .iter()
            .map(|s| s.write_space())
            .min()
            .unwrap_or(usize::MAX)
    }

    fn write_bytes(&mut self, src: &[u8]) {
        for sink in self.sinks.iter_mut() {
            sink.write_bytes(src);
        }
    }

    fn write_next(&mut self, data: u8) {
        for sink in self.sinks.iter_mut() {
            sink.write_next(data);
        }
    }

    fn write_finalize(&mut self) -> bool {
        let mut ok = true;
        for sink in self.sinks.iter_mut() {
            ok &= sink.write_finalize();
        }
        ok
    }

    fn write_abort(&mut self) {
        for sink in self.sinks.iter_mut() {
            sink.write_abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_write_round_trips_scalars() {
        let mut buf = [0u8; 32];
        {
            let mut w = ArrayWrite::new(&mut buf);
            w.write_u32(0x0102_0304);
            w.write_u16l(0xBEEF);
            assert!(w.write_finalize());
            assert_eq!(w.written_len(), 6);
        }
        let mut r = ArrayRead::new(&buf[..6]);
        assert_eq!(r.read_u32(), 0x0102_0304);
        assert_eq!(r.read_u16l(), 0xBEEF);
    }

    #[test]
    fn array_write_overflow_fails_finalize() {
        let mut buf = [0u8; 2];
        let mut w = ArrayWrite::new(&mut buf);
        w.write_bytes(&[1, 2, 3]);
        assert!(!w.write_finalize());
    }

    #[test]
    fn limited_read_bounds_visible_length() {
        let data = [1u8, 2, 3, 4, 5];
        let mut src = ArrayRead::new(&data);
        let mut lim = LimitedRead::new(&mut src, 3);
        assert_eq!(lim.read_ready(), 3);
        assert_eq!(lim.read_u8(), 1);
        assert_eq!(lim.read_ready(), 2);
    }

    #[test]
    fn tee_broadcasts_to_all_sinks() {
        let mut a = [0u8; 4];
        let mut b = [0u8; 4];
        let mut wa = ArrayWrite::new(&mut a);
        let mut wb = ArrayWrite::new(&mut b);
        let mut tee: BufferedTee<'_, 4> = BufferedTee::new();
        tee.add(&mut wa).unwrap();
        tee.add(&mut wb).unwrap();
        tee.write_u16(0xABCD);
        drop(tee);
        assert_eq!(&a[..2], &[0xAB, 0xCD]);
        assert_eq!(&b[..2], &[0xAB, 0xCD]);
    }
}
