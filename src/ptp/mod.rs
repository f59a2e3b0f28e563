//! Precision Time Protocol (IEEE 1588-2019) message framing and time math.
//!
//! This module defines the 34-byte common header shared by every PTP
//! message, the handful of message bodies this stack needs to originate or
//! parse (Announce, Sync, Follow-Up, Delay-Req, Delay-Resp), and a
//! nanosecond-plus-fraction [`Time`] type with wrapping, full-range signed
//! arithmetic. The closed-loop clock discipline built on top of it lives in
//! [`filters`] and [`tracking`].

pub mod client;
pub mod filters;
pub mod tracking;

use crate::io::{Readable, Writeable};

/// Fixed-point sub-nanosecond scale: 2^16 LSB per nanosecond.
pub const SUBNS_PER_NSEC: i64 = 1 << 16;
/// Whole nanoseconds per second, for normalizing [`Time`].
const NSEC_PER_SEC: i64 = 1_000_000_000;

/// One normalized-rate LSB per [`tracking::TrackingClock::clock_rate`] call:
/// 2^16 LSB = 1 PPB = 1 nanosecond of drift per second of wall time.
pub const RATE_ONE_PPB: i64 = SUBNS_PER_NSEC;
pub const RATE_ONE_PPM: i64 = 1000 * RATE_ONE_PPB;
pub const RATE_ONE_PPK: i64 = 1000 * RATE_ONE_PPM;

/// A PTP timestamp: whole seconds, whole nanoseconds (`0..1e9`), and a
/// fractional-nanosecond remainder in 2^-16 LSBs. Arithmetic normalizes
/// through a 128-bit sub-nanosecond total so it stays exact across any
/// number of additions or subtractions, including negative deltas that
/// span a seconds boundary.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Time {
    pub seconds: i64,
    pub nanoseconds: u32,
    pub subnanoseconds: u16,
}

impl Time {
    pub const ZERO: Time = Time {
        seconds: 0,
        nanoseconds: 0,
        subnanoseconds: 0,
    };

    pub fn new(seconds: i64, nanoseconds: u32, subnanoseconds: u16) -> Self {
        Time::from_subns(
            (seconds as i128) * (NSEC_PER_SEC as i128) * (SUBNS_PER_NSEC as i128)
                + (nanoseconds as i128) * (SUBNS_PER_NSEC as i128)
                + (subnanoseconds as i128),
        )
    }

    /// Total value as sub-nanosecond LSBs (2^-16 nsec), signed.
    pub fn total_subns(&self) -> i128 {
        (self.seconds as i128) * (NSEC_PER_SEC as i128) * (SUBNS_PER_NSEC as i128)
            + (self.nanoseconds as i128) * (SUBNS_PER_NSEC as i128)
            + (self.subnanoseconds as i128)
    }

    fn from_subns(total: i128) -> Self {
        let subns_per_sec = (NSEC_PER_SEC as i128) * (SUBNS_PER_NSEC as i128);
        // rem_euclid keeps the nanosecond/sub-nanosecond parts in
        // [0, subns_per_sec) even when `total` is negative, so the sign
        // lives entirely in `seconds`.
        let seconds = total.div_euclid(subns_per_sec);
        let rem = total.rem_euclid(subns_per_sec);
        let nanoseconds = (rem / (SUBNS_PER_NSEC as i128)) as u32;
        let subnanoseconds = (rem % (SUBNS_PER_NSEC as i128)) as u16;
        Time {
            seconds: seconds as i64,
            nanoseconds,
            subnanoseconds,
        }
    }

    /// Truncate to whole nanoseconds (rounding toward zero sub-nanosecond
    /// part), the representation used on the wire by [`Timestamp`].
    pub fn as_wire(&self) -> Timestamp {
        Timestamp {
            seconds: self.seconds as u64 & 0xFFFF_FFFF_FFFF,
            nanoseconds: self.nanoseconds,
        }
    }

    /// Seconds field after rounding the sub-nanosecond remainder to the
    /// nearest nanosecond (carrying into the nanosecond/second fields as
    /// needed).
    pub fn round_secs(&self) -> i64 {
        self.round_total_nsec().div_euclid(NSEC_PER_SEC as i128) as i64
    }

    /// Nanoseconds field after rounding the sub-nanosecond remainder to the
    /// nearest nanosecond.
    pub fn round_nsec(&self) -> u32 {
        self.round_total_nsec().rem_euclid(NSEC_PER_SEC as i128) as u32
    }

    fn round_total_nsec(&self) -> i128 {
        let half = (SUBNS_PER_NSEC as i128) / 2;
        (self.total_subns() + half).div_euclid(SUBNS_PER_NSEC as i128)
    }

    /// The raw `seconds` field, with no rounding of the sub-second parts.
    pub fn field_secs(&self) -> i64 {
        self.seconds
    }
}

impl core::ops::Add for Time {
    type Output = Time;
    fn add(self, rhs: Time) -> Time {
        Time::from_subns(self.total_subns() + rhs.total_subns())
    }
}

impl core::ops::Sub for Time {
    type Output = Time;
    fn sub(self, rhs: Time) -> Time {
        Time::from_subns(self.total_subns() - rhs.total_subns())
    }
}

impl core::ops::Neg for Time {
    type Output = Time;
    fn neg(self) -> Time {
        Time::from_subns(-self.total_subns())
    }
}

impl PartialOrd for Time {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Time {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.total_subns().cmp(&other.total_subns())
    }
}

/// Wire-format PTP timestamp: 48-bit seconds, 32-bit nanoseconds. No
/// sub-nanosecond fraction is carried on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct Timestamp {
    pub seconds: u64,
    pub nanoseconds: u32,
}

impl Timestamp {
    pub const WIRE_LEN: usize = 10;

    pub fn read_from(src: &mut dyn Readable) -> Self {
        Timestamp {
            seconds: src.read_u48(),
            nanoseconds: src.read_u32(),
        }
    }

    pub fn write_to(&self, dst: &mut dyn Writeable) {
        dst.write_u48(self.seconds & 0xFFFF_FFFF_FFFF);
        dst.write_u32(self.nanoseconds);
    }

    pub fn as_time(&self) -> Time {
        Time::new(self.seconds as i64, self.nanoseconds, 0)
    }
}

/// `sourcePortIdentity` / `requestingPortIdentity`: a clock identity plus
/// the port number within that clock (Section 7.5.2.1).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PortId {
    pub clock_id: u64,
    pub port_num: u16,
}

impl PortId {
    pub const WIRE_LEN: usize = 10;

    pub fn read_from(src: &mut dyn Readable) -> Self {
        PortId {
            clock_id: src.read_u64(),
            port_num: src.read_u16(),
        }
    }

    pub fn write_to(&self, dst: &mut dyn Writeable) {
        dst.write_u64(self.clock_id);
        dst.write_u16(self.port_num);
    }
}

/// The 34-byte header common to every PTP message (Section 13.3).
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Header {
    pub msg_type: u8,
    pub version: u8,
    pub length: u16,
    pub domain: u8,
    pub sdo_id: u16,
    pub flags: u16,
    pub correction: u64,
    pub subtype: u32,
    pub src_port: PortId,
    pub seq_id: u16,
    pub control: u8,
    pub log_interval: i8,
}

impl Header {
    pub const HEADER_LEN: usize = 34;

    // Message types (Table 36).
    pub const TYPE_SYNC: u8 = 0x0;
    pub const TYPE_DELAY_REQ: u8 = 0x1;
    pub const TYPE_PDELAY_REQ: u8 = 0x2;
    pub const TYPE_PDELAY_RESP: u8 = 0x3;
    pub const TYPE_FOLLOW_UP: u8 = 0x8;
    pub const TYPE_DELAY_RESP: u8 = 0x9;
    pub const TYPE_PDELAY_RFU: u8 = 0xA;
    pub const TYPE_ANNOUNCE: u8 = 0xB;
    pub const TYPE_SIGNALING: u8 = 0xC;
    pub const TYPE_MANAGEMENT: u8 = 0xD;

    // Flags (Table 37).
    pub const FLAG_LEAP61: u16 = 1 << 0;
    pub const FLAG_LEAP59: u16 = 1 << 1;
    pub const FLAG_UTC_VALID: u16 = 1 << 2;
    pub const FLAG_PTP_TIMESCALE: u16 = 1 << 3;
    pub const FLAG_TIME_TRACEABLE: u16 = 1 << 4;
    pub const FLAG_FREQ_TRACEABLE: u16 = 1 << 5;
    pub const FLAG_UNCERTAIN: u16 = 1 << 6;
    pub const FLAG_ALT_MASTER: u16 = 1 << 8;
    pub const FLAG_TWO_STEP: u16 = 1 << 9;
    pub const FLAG_UNICAST: u16 = 1 << 10;
    pub const FLAG_PROFILE1: u16 = 1 << 13;
    pub const FLAG_PROFILE2: u16 = 1 << 14;

    pub fn read_from(src: &mut dyn Readable) -> Self {
        let byte0 = src.read_u8();
        let msg_type = byte0 & 0x0F;
        let sdo_hi = (byte0 >> 4) & 0x0F;
        let version = src.read_u8();
        let length = src.read_u16();
        let domain = src.read_u8();
        let sdo_lo = src.read_u8();
        let flags = src.read_u16();
        let correction = src.read_u64();
        let subtype = src.read_u32();
        let src_port = PortId::read_from(src);
        let seq_id = src.read_u16();
        let control = src.read_u8();
        let log_interval = src.read_s8();
        Header {
            msg_type,
            version,
            length,
            domain,
            sdo_id: ((sdo_hi as u16) << 8) | (sdo_lo as u16),
            flags,
            correction,
            subtype,
            src_port,
            seq_id,
            control,
            log_interval,
        }
    }

    pub fn write_to(&self, dst: &mut dyn Writeable) {
        let sdo_hi = ((self.sdo_id >> 8) & 0x0F) as u8;
        let sdo_lo = (self.sdo_id & 0xFF) as u8;
        dst.write_u8((sdo_hi << 4) | (self.msg_type & 0x0F));
        dst.write_u8(self.version);
        dst.write_u16(self.length);
        dst.write_u8(self.domain);
        dst.write_u8(sdo_lo);
        dst.write_u16(self.flags);
        dst.write_u64(self.correction);
        dst.write_u32(self.subtype);
        self.src_port.write_to(dst);
        dst.write_u16(self.seq_id);
        dst.write_u8(self.control);
        dst.write_s8(self.log_interval);
    }
}

/// Clock-quality metadata carried in an Announce message (Section 13.5.1).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ClockInfo {
    pub grandmaster_priority1: u8,
    pub grandmaster_class: u8,
    pub grandmaster_accuracy: u8,
    pub grandmaster_variance: u16,
    pub grandmaster_priority2: u8,
    pub grandmaster_identity: u64,
    pub steps_removed: u16,
    pub time_source: u8,
}

impl ClockInfo {
    pub const WIRE_LEN: usize = 17;

    // Lower priority values take precedence (Section 9.3.2.2).
    pub const PRIORITY_MIN: u8 = 255;
    pub const PRIORITY_MID: u8 = 128;
    pub const PRIORITY_MAX: u8 = 0;

    pub const CLASS_PRIMARY: u8 = 6;
    pub const CLASS_APP_SPEC: u8 = 13;
    pub const CLASS_DEFAULT: u8 = 248;
    pub const CLASS_SLAVE: u8 = 255;

    pub const ACCURACY_25NSEC: u8 = 0x20;
    pub const ACCURACY_100NSEC: u8 = 0x21;
    pub const ACCURACY_1USEC: u8 = 0x23;
    pub const ACCURACY_UNK: u8 = 0xFE;

    pub const VARIANCE_10NSEC: u16 = 0x4AD9;
    pub const VARIANCE_100NSEC: u16 = 0x517E;
    pub const VARIANCE_MAX: u16 = 0xFFFF;

    pub const SRC_ATOMIC: u8 = 0x10;
    pub const SRC_GNSS: u8 = 0x20;
    pub const SRC_PTP: u8 = 0x40;
    pub const SRC_NTP: u8 = 0x50;
    pub const SRC_INTERNAL: u8 = 0xA0;

    pub fn read_from(src: &mut dyn Readable) -> Self {
        ClockInfo {
            grandmaster_priority1: src.read_u8(),
            grandmaster_class: src.read_u8(),
            grandmaster_accuracy: src.read_u8(),
            grandmaster_variance: src.read_u16(),
            grandmaster_priority2: src.read_u8(),
            grandmaster_identity: src.read_u64(),
            steps_removed: src.read_u16(),
            time_source: src.read_u8(),
        }
    }

    pub fn write_to(&self, dst: &mut dyn Writeable) {
        dst.write_u8(self.grandmaster_priority1);
        dst.write_u8(self.grandmaster_class);
        dst.write_u8(self.grandmaster_accuracy);
        dst.write_u16(self.grandmaster_variance);
        dst.write_u8(self.grandmaster_priority2);
        dst.write_u64(self.grandmaster_identity);
        dst.write_u16(self.steps_removed);
        dst.write_u8(self.time_source);
    }
}

/// Unspecified clock with the lowest possible priority on every metric;
/// loses every Best Master Clock comparison unless it is the only clock.
pub const DEFAULT_CLOCK: ClockInfo = ClockInfo {
    grandmaster_priority1: ClockInfo::PRIORITY_MIN,
    grandmaster_class: ClockInfo::CLASS_DEFAULT,
    grandmaster_accuracy: ClockInfo::ACCURACY_UNK,
    grandmaster_variance: ClockInfo::VARIANCE_MAX,
    grandmaster_priority2: ClockInfo::PRIORITY_MIN,
    grandmaster_identity: 0,
    steps_removed: 0,
    time_source: ClockInfo::SRC_INTERNAL,
};

/// Example high-quality GPS-disciplined clock.
pub const VERY_GOOD_CLOCK: ClockInfo = ClockInfo {
    grandmaster_priority1: ClockInfo::PRIORITY_MID,
    grandmaster_class: ClockInfo::CLASS_PRIMARY,
    grandmaster_accuracy: ClockInfo::ACCURACY_25NSEC,
    grandmaster_variance: ClockInfo::VARIANCE_10NSEC,
    grandmaster_priority2: ClockInfo::PRIORITY_MID,
    grandmaster_identity: 0,
    steps_removed: 0,
    time_source: ClockInfo::SRC_INTERNAL,
};

/// Announce message body (Section 13.5).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Announce {
    pub origin_timestamp: Timestamp,
    pub current_utc_offset: i16,
    pub info: ClockInfo,
}

impl Announce {
    pub fn read_from(src: &mut dyn Readable) -> Self {
        let origin_timestamp = Timestamp::read_from(src);
        let current_utc_offset = src.read_s16();
        let _reserved = src.read_u8();
        let info = ClockInfo::read_from(src);
        Announce {
            origin_timestamp,
            current_utc_offset,
            info,
        }
    }

    pub fn write_to(&self, dst: &mut dyn Writeable) {
        self.origin_timestamp.write_to(dst);
        dst.write_s16(self.current_utc_offset);
        dst.write_u8(0);
        self.info.write_to(dst);
    }
}

/// Sync / Delay-Req body: just the originating timestamp. For a two-step
/// clock the Sync timestamp is a placeholder; the precise value follows in
/// a Follow-Up.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct SyncBody {
    pub origin_timestamp: Timestamp,
}

impl SyncBody {
    pub fn read_from(src: &mut dyn Readable) -> Self {
        SyncBody {
            origin_timestamp: Timestamp::read_from(src),
        }
    }

    pub fn write_to(&self, dst: &mut dyn Writeable) {
        self.origin_timestamp.write_to(dst);
    }
}

/// Follow-Up body: the precise transmit timestamp of the preceding Sync.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct FollowUp {
    pub precise_origin_timestamp: Timestamp,
}

impl FollowUp {
    pub fn read_from(src: &mut dyn Readable) -> Self {
        FollowUp {
            precise_origin_timestamp: Timestamp::read_from(src),
        }
    }

    pub fn write_to(&self, dst: &mut dyn Writeable) {
        self.precise_origin_timestamp.write_to(dst);
    }
}

/// Delay-Resp body: the receive timestamp of the matching Delay-Req, plus
/// the port identity that sent it.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct DelayResp {
    pub receive_timestamp: Timestamp,
    pub requesting_port: PortId,
}

impl DelayResp {
    pub fn read_from(src: &mut dyn Readable) -> Self {
        DelayResp {
            receive_timestamp: Timestamp::read_from(src),
            requesting_port: PortId::read_from(src),
        }
    }

    pub fn write_to(&self, dst: &mut dyn Writeable) {
        self.receive_timestamp.write_to(dst);
        self.requesting_port.write_to(dst);
    }
}

/// Selects the destination of an outgoing PTP message.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum DispatchTo {
    /// Ethernet broadcast, no IP header.
    BroadcastL2,
    /// IPv4/UDP broadcast to ports 319/320.
    BroadcastL3,
    /// Unicast reply to whoever sent the message currently being handled.
    Reply,
    /// Unicast to the address most recently captured by `store_reply_addr`.
    Stored,
}

/// The four one-way delay measurements that make up a single Sync /
/// Delay-Req exchange (Section 11.3):
///  * `t1` -- master's Sync transmit time (origin timestamp).
///  * `t2` -- slave's Sync receive time (local hardware timestamp).
///  * `t3` -- slave's Delay-Req transmit time (local hardware timestamp).
///  * `t4` -- master's Delay-Req receive time (Delay-Resp receive_timestamp).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Measurement {
    pub t1: Time,
    pub t2: Time,
    pub t3: Time,
    pub t4: Time,
}

impl Measurement {
    /// Offset of the slave clock from the master: `((t2-t1)-(t4-t3))/2`.
    /// Positive means the slave is ahead.
    pub fn offset(&self) -> Time {
        Time::from_subns(((self.t2 - self.t1).total_subns() - (self.t4 - self.t3).total_subns()) / 2)
    }

    /// One-way mean path delay: `((t2-t1)+(t4-t3))/2`.
    pub fn mean_path_delay(&self) -> Time {
        Time::from_subns(((self.t2 - self.t1).total_subns() + (self.t4 - self.t3).total_subns()) / 2)
    }
}

/// Receives a finished [`Measurement`] each time a Sync/Delay exchange
/// completes. Implemented by [`tracking::TrackingController`] and
/// [`tracking::TrackingCoarse`].
pub trait Callback {
    fn ptp_ready(&mut self, data: &Measurement);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{ArrayRead, ArrayWrite};

    #[test]
    fn time_add_sub_round_trips_across_second_boundary() {
        let a = Time::new(10, 900_000_000, 0);
        let b = Time::new(0, 200_000_000, 0);
        let sum = a + b;
        assert_eq!(sum.seconds, 11);
        assert_eq!(sum.nanoseconds, 100_000_000);
        let back = sum - b;
        assert_eq!(back, a);
    }

    #[test]
    fn time_handles_negative_deltas() {
        let a = Time::new(5, 0, 0);
        let b = Time::new(5, 500_000_000, 0);
        let delta = a - b;
        assert_eq!(delta.seconds, -1);
        assert_eq!(delta.nanoseconds, 500_000_000);
        assert_eq!(delta.total_subns(), -500_000_000i128 * SUBNS_PER_NSEC as i128);
    }

    #[test]
    fn header_round_trips_through_wire_bytes() {
        let hdr = Header {
            msg_type: Header::TYPE_SYNC,
            version: 2,
            length: 44,
            domain: 0,
            sdo_id: 0x123,
            flags: Header::FLAG_TWO_STEP,
            correction: 0,
            subtype: 0,
            src_port: PortId {
                clock_id: 0x0011_2233_4455_6677,
                port_num: 1,
            },
            seq_id: 42,
            control: 0,
            log_interval: -3,
        };
        let mut buf = [0u8; Header::HEADER_LEN];
        let mut w = ArrayWrite::new(&mut buf);
        hdr.write_to(&mut w);
        assert!(w.write_finalize());
        assert_eq!(w.written_len(), Header::HEADER_LEN);

        let mut r = ArrayRead::new(w.written());
        let back = Header::read_from(&mut r);
        assert_eq!(back, hdr);
    }

    #[test]
    fn measurement_offset_and_delay_match_textbook_formula() {
        // Symmetric path: 50us one-way delay, slave 10us ahead of master.
        let m = Measurement {
            t1: Time::new(100, 0, 0),
            t2: Time::new(100, 60_010, 0),
            t3: Time::new(100, 200_000, 0),
            t4: Time::new(100, 249_990, 0),
        };
        assert_eq!(m.offset(), Time::new(0, 10_000, 0));
        assert_eq!(m.mean_path_delay(), Time::new(0, 50_000, 0));
    }
}
