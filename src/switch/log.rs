//! Switch forwarding-decision log: per-frame keep/drop records plus a
//! coalesced summary record, the software side of the hardware switch's
//! diagnostic FIFO.

use crate::cfgbus::RegisterAccess;
use crate::eth::Header;
use crate::io::{ArrayRead, Readable, Writeable};
use crate::poll::Timer;

pub const REASON_KEEP: u8 = 0;
pub const DROP_OVERFLOW: u8 = 1;
pub const DROP_BADFCS: u8 = 2;
pub const DROP_BADFRM: u8 = 3;
pub const DROP_MCTRL: u8 = 4;
pub const DROP_VLAN: u8 = 5;
pub const DROP_VRATE: u8 = 6;
pub const DROP_PTPERR: u8 = 7;
pub const DROP_NO_ROUTE: u8 = 8;
pub const DROP_DISABLED: u8 = 9;
pub const DROP_UNKNOWN: u8 = 255;

const TYPE_KEEP: u8 = 0x00;
const TYPE_DROP: u8 = 0x40;
const TYPE_SKIP: u8 = 0x80;
const TYPE_MASK: u8 = 0xC0;
const SRC_MASK: u8 = 0x3F;

/// One record from the switch's forwarding-decision log: a kept frame, a
/// dropped frame (with reason), or a coalesced summary of frames skipped
/// because the log itself was full.
#[derive(Clone, Copy, Debug)]
pub struct SwitchLogMessage {
    pub tstamp: u32,
    type_src: u8,
    pub hdr: Header,
    pub meta: u32,
}

const HEADER_NULL: Header = Header {
    dst: crate::eth::MacAddr::ZERO,
    src: crate::eth::MacAddr::ZERO,
    vtag: None,
    etype: crate::eth::EtherType(0),
};

impl SwitchLogMessage {
    pub fn init_keep(hdr: Header, src_port: u8, tstamp: u32, dst_mask: u32) -> Self {
        SwitchLogMessage {
            tstamp,
            type_src: TYPE_KEEP | (src_port & SRC_MASK),
            hdr,
            meta: dst_mask,
        }
    }

    pub fn init_drop(hdr: Header, src_port: u8, tstamp: u32, why: u8) -> Self {
        SwitchLogMessage {
            tstamp,
            type_src: TYPE_DROP | (src_port & SRC_MASK),
            hdr,
            meta: why as u32,
        }
    }

    pub fn init_skip(tstamp: u32, dropped: u16, kept: u16) -> Self {
        SwitchLogMessage {
            tstamp,
            type_src: TYPE_SKIP,
            hdr: HEADER_NULL,
            meta: ((dropped as u32) << 16) | kept as u32,
        }
    }

    fn msg_type(&self) -> u8 {
        self.type_src & TYPE_MASK
    }

    pub fn src_port(&self) -> u8 {
        self.type_src & SRC_MASK
    }

    pub fn is_keep(&self) -> bool {
        self.msg_type() == TYPE_KEEP
    }

    pub fn is_drop(&self) -> bool {
        self.msg_type() == TYPE_DROP
    }

    pub fn is_summary(&self) -> bool {
        self.msg_type() == TYPE_SKIP
    }

    pub fn reason(&self) -> u8 {
        match self.msg_type() {
            TYPE_KEEP => REASON_KEEP,
            TYPE_DROP => (self.meta & 0xFF) as u8,
            _ => DROP_UNKNOWN,
        }
    }

    pub fn reason_str(&self) -> &'static str {
        match self.reason() {
            REASON_KEEP => "N/A",
            DROP_OVERFLOW => "Overflow",
            DROP_BADFCS => "Bad CRC",
            DROP_BADFRM => "Bad header",
            DROP_MCTRL => "Link-local",
            DROP_VLAN => "VLAN policy",
            DROP_VRATE => "Rate-limit",
            DROP_PTPERR => "PTP error",
            DROP_NO_ROUTE => "No route",
            DROP_DISABLED => "Port off",
            _ => "Unknown",
        }
    }

    pub fn count_drop(&self) -> u16 {
        match self.msg_type() {
            TYPE_KEEP => 0,
            TYPE_DROP => 1,
            _ => (self.meta >> 16) as u16,
        }
    }

    pub fn count_keep(&self) -> u16 {
        match self.msg_type() {
            TYPE_KEEP => 1,
            TYPE_DROP => 0,
            _ => (self.meta & 0xFFFF) as u16,
        }
    }

    pub const LEN_BYTES: usize = 3 + 1 + 12 + 2 + 2 + 4;

    pub fn write_to(&self, dst: &mut dyn Writeable) {
        dst.write_u24(self.tstamp);
        dst.write_u8(self.type_src);
        self.hdr.dst.write_to(dst);
        self.hdr.src.write_to(dst);
        dst.write_u16(self.hdr.etype.0);
        dst.write_u16(self.hdr.vtag.map(|t| t.0).unwrap_or(0));
        dst.write_u32(self.meta);
    }

    pub fn read_from(src: &mut dyn Readable) -> Option<Self> {
        if src.read_ready() < Self::LEN_BYTES {
            return None;
        }
        let tstamp = src.read_u24();
        let type_src = src.read_u8();
        let dst = crate::eth::MacAddr::read_from(src);
        let hsrc = crate::eth::MacAddr::read_from(src);
        let etype = crate::eth::EtherType(src.read_u16());
        let vid = src.read_u16();
        let meta = src.read_u32();
        Some(SwitchLogMessage {
            tstamp,
            type_src,
            hdr: Header {
                dst,
                src: hsrc,
                vtag: (vid != 0).then_some(crate::eth::VlanTag(vid)),
                etype,
            },
            meta,
        })
    }
}

/// Cumulative counters kept alongside the raw log stream.
#[derive(Clone, Copy, Default, Debug)]
pub struct SwitchLogStats {
    pub kept: u32,
    pub dropped: u32,
    pub skipped_records: u32,
}

impl SwitchLogStats {
    pub fn observe(&mut self, msg: &SwitchLogMessage) {
        self.kept += msg.count_keep() as u32;
        self.dropped += msg.count_drop() as u32;
        if msg.is_summary() {
            self.skipped_records += 1;
        }
    }
}

/// Anything that wants to receive parsed log records as they arrive.
pub trait SwitchLogHandler {
    fn log_packet(&mut self, msg: SwitchLogMessage);
}

/// Parses a raw byte stream of back-to-back `SwitchLogMessage` records
/// (e.g. drained from a hardware FIFO) and hands each one to a handler.
pub struct SwitchLogReader<'a, H: SwitchLogHandler> {
    dst: &'a mut H,
}

impl<'a, H: SwitchLogHandler> SwitchLogReader<'a, H> {
    pub fn new(dst: &'a mut H) -> Self {
        SwitchLogReader { dst }
    }

    pub fn poll(&mut self, src: &mut dyn Readable) {
        while let Some(msg) = SwitchLogMessage::read_from(src) {
            self.dst.log_packet(msg);
        }
    }
}

/// Serializes records to a `Writeable` sink, coalescing into a `Skip`
/// summary whenever the sink has no room for an individual record.
pub struct SwitchLogWriter<'a> {
    dst: &'a mut dyn Writeable,
    skip_drop: u16,
    skip_keep: u16,
}

impl<'a> SwitchLogWriter<'a> {
    pub fn new(dst: &'a mut dyn Writeable) -> Self {
        SwitchLogWriter {
            dst,
            skip_drop: 0,
            skip_keep: 0,
        }
    }

    fn flush_summary(&mut self) {
        if self.dst.write_space() < SwitchLogMessage::LEN_BYTES {
            return;
        }
        if self.skip_drop == 0 && self.skip_keep == 0 {
            return;
        }
        let msg = SwitchLogMessage::init_skip(0, self.skip_drop, self.skip_keep);
        msg.write_to(self.dst);
        if self.dst.write_finalize() {
            self.skip_drop = 0;
            self.skip_keep = 0;
        }
    }
}

impl<'a> SwitchLogHandler for SwitchLogWriter<'a> {
    /// Write immediately if there is room and no summary is already
    /// pending, otherwise fold the record into the pending `Skip` counters.
    fn log_packet(&mut self, msg: SwitchLogMessage) {
        let can_write = self.dst.write_space() >= SwitchLogMessage::LEN_BYTES;
        let skip_mode = self.skip_drop > 0 || self.skip_keep > 0;
        if can_write && !skip_mode {
            msg.write_to(self.dst);
            self.dst.write_finalize();
        } else {
            self.skip_drop += msg.count_drop();
            self.skip_keep += msg.count_keep();
            if can_write {
                self.flush_summary();
            }
        }
    }
}

impl<'a> Timer for SwitchLogWriter<'a> {
    fn timer_event(&mut self) {
        self.flush_summary();
    }
}

/// Polls a ConfigBus register holding a switch's hardware forwarding-log
/// FIFO: words arrive 24 bits at a time with a valid bit and a final-word
/// marker, assembled into one complete record per `timer_event`.
pub struct SwitchLogHardware<'a, R: RegisterAccess> {
    dst: &'a mut dyn SwitchLogHandler,
    src: R,
    reg: u16,
    scratch: [u8; SCRATCH_LEN],
    scratch_len: usize,
}

const DATA_VALID: u32 = 1 << 31;
const DATA_FINAL: u32 = 1 << 30;
/// Scratch buffer rounded up to a whole number of 24-bit words.
const SCRATCH_LEN: usize = (SwitchLogMessage::LEN_BYTES + 2) / 3 * 3;

impl<'a, R: RegisterAccess> SwitchLogHardware<'a, R> {
    pub fn new(dst: &'a mut dyn SwitchLogHandler, src: R, reg: u16) -> Self {
        SwitchLogHardware {
            dst,
            src,
            reg,
            scratch: [0u8; SCRATCH_LEN],
            scratch_len: 0,
        }
    }
}

impl<'a, R: RegisterAccess> Timer for SwitchLogHardware<'a, R> {
    fn timer_event(&mut self) {
        while let Ok(word) = self.src.read(self.reg) {
            if word & DATA_VALID == 0 {
                break;
            }
            if self.scratch_len + 3 <= self.scratch.len() {
                let bytes = word.to_be_bytes();
                self.scratch[self.scratch_len..self.scratch_len + 3].copy_from_slice(&bytes[1..4]);
                self.scratch_len += 3;
            }
            if word & DATA_FINAL != 0 {
                let mut rd = ArrayRead::new(&self.scratch[..self.scratch_len]);
                if let Some(msg) = SwitchLogMessage::read_from(&mut rd) {
                    self.dst.log_packet(msg);
                }
                self.scratch_len = 0;
            }
        }
    }
}
