//! Ethernet II framing, VLAN tags, and the dispatch that fans frames out
//! to registered protocols by `(VLAN, EtherType)`.

pub mod arp;

use heapless::Vec;
use thiserror::Error;

use crate::io::{LimitedRead, Readable, Writeable};

/// Maximum number of protocols simultaneously registered on one dispatch.
pub const MAX_PROTOCOLS: usize = 16;

/// 48-bit Ethernet hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);
    /// Reserved link-local control block, `01:80:C2:00:00:00/40`.
    const SWCONTROL_PREFIX: [u8; 5] = [0x01, 0x80, 0xC2, 0x00, 0x00];

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_unicast(&self) -> bool {
        !self.is_multicast()
    }

    pub fn is_valid(&self) -> bool {
        *self != Self::ZERO
    }

    pub fn is_swcontrol(&self) -> bool {
        self.0[..5] == Self::SWCONTROL_PREFIX
    }

    pub fn write_to(&self, dst: &mut dyn Writeable) {
        dst.write_bytes(&self.0);
    }

    pub fn read_from(src: &mut dyn Readable) -> Self {
        let mut b = [0u8; 6];
        src.read_bytes(&mut b);
        MacAddr(b)
    }
}

/// 802.1Q VLAN tag: 3-bit priority, 1-bit DEI, 12-bit VID. `VID == 0`
/// means untagged.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct VlanTag(pub u16);

pub const VTAG_NONE: VlanTag = VlanTag(0);
const TPID_8021Q: u16 = 0x8100;

impl VlanTag {
    pub fn new(priority: u8, dei: bool, vid: u16) -> Self {
        VlanTag(((priority as u16 & 0x7) << 13) | ((dei as u16) << 12) | (vid & 0x0FFF))
    }

    pub fn vid(&self) -> u16 {
        self.0 & 0x0FFF
    }

    pub fn priority(&self) -> u8 {
        ((self.0 >> 13) & 0x7) as u8
    }

    pub fn is_tagged(&self) -> bool {
        self.vid() != 0
    }
}

/// 16-bit Ethernet protocol identifier carried after (optional VLAN +)
/// source MAC.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct EtherType(pub u16);

impl EtherType {
    pub const IPV4: EtherType = EtherType(0x0800);
    pub const ARP: EtherType = EtherType(0x0806);
    pub const PTP: EtherType = EtherType(0x88F7);
    pub const VLAN: EtherType = EtherType(TPID_8021Q);
}

/// Key a registered [`Protocol`] matches against: `(VLAN, EtherType)`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FrameType {
    pub vid: u16,
    pub etype: EtherType,
}

/// Parsed Ethernet II header (VLAN tag optional).
#[derive(Clone, Copy, Debug)]
pub struct Header {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub vtag: Option<VlanTag>,
    pub etype: EtherType,
}

impl Header {
    pub fn read_from(src: &mut dyn Readable) -> Self {
        let dst = MacAddr::read_from(src);
        let srcmac = MacAddr::read_from(src);
        let next = src.read_u16();
        let (vtag, etype) = if next == TPID_8021Q {
            let tag = VlanTag(src.read_u16());
            (Some(tag), EtherType(src.read_u16()))
        } else {
            (None, EtherType(next))
        };
        Header {
            dst,
            src: srcmac,
            vtag,
            etype,
        }
    }

    pub fn write_to(&self, dst: &mut dyn Writeable) {
        self.dst.write_to(dst);
        self.src.write_to(dst);
        if let Some(tag) = self.vtag {
            dst.write_u16(TPID_8021Q);
            dst.write_u16(tag.0);
        }
        dst.write_u16(self.etype.0);
    }

    /// Size in bytes of this header as it would appear on the wire.
    pub fn wire_len(&self) -> usize {
        12 + if self.vtag.is_some() { 4 } else { 2 }
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("frame shorter than minimum Ethernet header")]
    Truncated,
    #[error("no registered protocol matched the frame type")]
    Unhandled,
    #[error("protocol table is full")]
    TableFull,
}

/// Implemented by anything that wants to receive frames of a specific
/// `FrameType` from a [`Dispatch`]. Registration is an intrusive list
/// entry; the dispatch never owns the protocol object.
pub trait Protocol {
    fn frame_type(&self) -> FrameType;
    fn frame_rcvd(&mut self, reply: &ReplyContext, src: LimitedRead<'_>);
}

/// Reply context captured for the duration of one `data_rcvd` call: the
/// sender's address and the VLAN/etype it arrived on, swapped as needed to
/// answer.
#[derive(Clone, Copy, Debug)]
pub struct ReplyContext {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub vtag: Option<VlanTag>,
    pub etype: EtherType,
}

impl ReplyContext {
    fn from_header(h: &Header) -> Self {
        ReplyContext {
            dst: h.src,
            src: h.dst,
            vtag: h.vtag,
            etype: h.etype,
        }
    }
}

/// Ethernet-layer dispatch: parses L2 headers on ingress and fans the
/// payload out to whichever registered [`Protocol`] matches
/// `(vid, etype)`.
pub struct Dispatch<'a> {
    local_mac: MacAddr,
    protocols: Vec<&'a mut dyn Protocol, MAX_PROTOCOLS>,
    last_reply: Option<ReplyContext>,
}

impl<'a> Dispatch<'a> {
    pub fn new(local_mac: MacAddr) -> Self {
        Dispatch {
            local_mac,
            protocols: Vec::new(),
            last_reply: None,
        }
    }

    pub fn local_mac(&self) -> MacAddr {
        self.local_mac
    }

    pub fn register(&mut self, proto: &'a mut dyn Protocol) -> Result<(), Error> {
        self.protocols.push(proto).map_err(|_| Error::TableFull)
    }

    /// Handle one ingress frame. `src` must be positioned at the start of
    /// the Ethernet header; `read_finalize` is always called before
    /// returning, whether or not a protocol handled the frame.
    pub fn data_rcvd(&mut self, src: &mut dyn Readable) -> Result<(), Error> {
        if src.read_ready() < 14 {
            src.read_finalize();
            return Err(Error::Truncated);
        }
        let header = Header::read_from(src);
        let reply = ReplyContext::from_header(&header);
        self.last_reply = Some(reply);

        let vid = header.vtag.map(|t| t.vid()).unwrap_or(0);
        let wanted = FrameType {
            vid,
            etype: header.etype,
        };
        let remaining = src.read_ready();
        let result = if let Some(proto) = self
            .protocols
            .iter_mut()
            .find(|p| p.frame_type() == wanted)
        {
            proto.frame_rcvd(&reply, LimitedRead::new(src, remaining));
            Ok(())
        } else {
            Err(Error::Unhandled)
        };
        src.read_finalize();
        result
    }

    /// Begin writing a new outgoing frame with an explicit destination.
    pub fn open_write(
        &self,
        dst_mac: MacAddr,
        etype: EtherType,
        vtag: Option<VlanTag>,
        out: &mut dyn Writeable,
    ) {
        let header = Header {
            dst: dst_mac,
            src: self.local_mac,
            vtag,
            etype,
        };
        header.write_to(out);
    }

    /// Begin a reply using the most recently captured ingress context
    /// (source/destination swapped, VLAN preserved).
    pub fn open_reply(&self, etype: EtherType, out: &mut dyn Writeable) -> Option<()> {
        let reply = self.last_reply?;
        self.open_write(reply.dst, etype, reply.vtag, out);
        Some(())
    }
}

/// Binds a [`crate::tpipe::Core`] to raw Ethernet framing: the connection
/// is addressed by `(EtherType, VLAN)` plus a peer MAC, either supplied by
/// [`connect`](Tpipe::connect) or learned from the first frame received
/// while bound.
pub struct Tpipe {
    core: crate::tpipe::Core,
    frame_type: FrameType,
    peer: Option<MacAddr>,
}

impl Tpipe {
    pub fn new(seed: u64) -> Self {
        Tpipe {
            core: crate::tpipe::Core::new(seed),
            frame_type: FrameType {
                vid: 0,
                etype: EtherType::IPV4,
            },
            peer: None,
        }
    }

    /// Listen passively for an incoming connection on `(etype, vid)`.
    pub fn bind(&mut self, etype: EtherType, vid: u16) {
        self.frame_type = FrameType { vid, etype };
    }

    /// Actively open a connection to `peer` on `(etype, vid)`. The open
    /// request goes out on the next [`poll_always`](Tpipe::poll_always).
    pub fn connect(&mut self, peer: MacAddr, etype: EtherType, vid: u16) {
        self.frame_type = FrameType { vid, etype };
        self.peer = Some(peer);
        self.core.open();
    }

    pub fn ready(&self) -> bool {
        self.core.is_ready()
    }

    pub fn completed(&self) -> bool {
        self.core.completed()
    }

    pub fn close(&mut self) {
        self.core.close();
    }

    pub fn set_retransmit(&mut self, msec: u16) {
        self.core.set_retransmit(msec);
    }

    pub fn set_timeout(&mut self, msec: u16) {
        self.core.set_timeout(msec);
    }

    pub fn set_txonly(&mut self) {
        self.core.set_txonly();
    }

    /// Latch the current time; call once per main-loop pass, before
    /// `poll_always` or dispatching a received frame to this protocol.
    pub fn set_time(&mut self, now_msec: u32) {
        self.core.set_time(now_msec);
    }

    /// Queue outgoing application bytes.
    pub fn writer(&mut self) -> &mut dyn Writeable {
        &mut self.core
    }

    /// Read application bytes delivered so far, in order.
    pub fn reader(&mut self) -> &mut dyn Readable {
        &mut self.core
    }

    /// Notify the core that new data was queued via `writer()`, so it can
    /// send right away rather than waiting for the next retransmit tick.
    pub fn data_queued(&mut self) {
        self.core.data_queued();
    }

    /// Send a retransmit/keep-alive/ack block if one is due. `disp` supplies
    /// the Ethernet framing once the peer's MAC address is known; while
    /// unknown (bound but not yet connected, or not yet learned from an
    /// incoming frame) this is a no-op, matching the core's generic
    /// not-ready-yet retry path.
    pub fn poll_always(&mut self, disp: &Dispatch<'_>, out: &mut dyn Writeable) {
        struct EthLink<'b, 'a> {
            disp: &'b Dispatch<'a>,
            peer: Option<MacAddr>,
            frame_type: FrameType,
        }
        impl<'b, 'a> crate::tpipe::Link for EthLink<'b, 'a> {
            fn open_write(&mut self, _body_len: usize, out: &mut dyn Writeable) -> bool {
                let Some(mac) = self.peer else {
                    return false;
                };
                let vtag = if self.frame_type.vid == 0 {
                    None
                } else {
                    Some(VlanTag::new(0, false, self.frame_type.vid))
                };
                self.disp.open_write(mac, self.frame_type.etype, vtag, out);
                true
            }
        }
        let mut link = EthLink {
            disp,
            peer: self.peer,
            frame_type: self.frame_type,
        };
        self.core.poll_always(&mut link, out);
    }
}

impl Protocol for Tpipe {
    fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    fn frame_rcvd(&mut self, reply: &ReplyContext, src: LimitedRead<'_>) {
        self.peer = Some(reply.dst);
        self.core.packet_rcvd(src);
    }
}

/// Binds a [`crate::ptp::client::Client`] to raw Ethernet framing on
/// EtherType `0x88F7`, the PTP-over-L2 transport (Annex F of IEEE 1588).
/// The master's MAC is learned from whichever frame carries the Sync this
/// session is currently tracking, the same convention as [`Tpipe`].
///
/// Local tx/rx timestamps come from a caller-supplied
/// [`crate::ptp::tracking::TrackingClock`] rather than real hardware
/// timestamping, since `frame_rcvd`'s signature (fixed by [`Protocol`])
/// carries no time parameter of its own.
pub struct Ptp<'a> {
    client: crate::ptp::client::Client,
    clock: &'a mut dyn crate::ptp::tracking::TrackingClock,
    callback: &'a mut dyn crate::ptp::Callback,
    vid: u16,
    master: Option<MacAddr>,
}

impl<'a> Ptp<'a> {
    pub fn new(
        local_port: crate::ptp::PortId,
        clock: &'a mut dyn crate::ptp::tracking::TrackingClock,
        callback: &'a mut dyn crate::ptp::Callback,
    ) -> Self {
        Ptp {
            client: crate::ptp::client::Client::new(local_port),
            clock,
            callback,
            vid: 0,
            master: None,
        }
    }

    pub fn bind(&mut self, vid: u16) {
        self.vid = vid;
    }

    pub fn set_req_interval(&mut self, msec: u32) {
        self.client.set_req_interval(msec);
    }

    pub fn set_time(&mut self, now_msec: u32) {
        self.client.set_time(now_msec);
    }

    /// Send a Delay-Req to the learned master if one is due.
    pub fn poll_always(&mut self, disp: &Dispatch<'_>, out: &mut dyn Writeable) {
        let Some(mac) = self.master else {
            return;
        };
        if !self.client.due() {
            return;
        }
        let vtag = if self.vid == 0 {
            None
        } else {
            Some(VlanTag::new(0, false, self.vid))
        };
        disp.open_write(mac, EtherType::PTP, vtag, out);
        let local_tx_time = self.clock.clock_now();
        self.client.write_delay_req(local_tx_time, out);
        out.write_finalize();
    }
}

impl<'a> Protocol for Ptp<'a> {
    fn frame_type(&self) -> FrameType {
        FrameType {
            vid: self.vid,
            etype: EtherType::PTP,
        }
    }

    fn frame_rcvd(&mut self, reply: &ReplyContext, mut src: LimitedRead<'_>) {
        self.master = Some(reply.dst);
        let header = crate::ptp::Header::read_from(&mut src);
        let local_rx_time = self.clock.clock_now();
        self.client
            .packet_rcvd(&header, local_rx_time, &mut src, self.callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::ArrayWrite;

    struct Echo {
        ft: FrameType,
        seen: Option<heapless::Vec<u8, 64>>,
    }
    impl Protocol for Echo {
        fn frame_type(&self) -> FrameType {
            self.ft
        }
        fn frame_rcvd(&mut self, _reply: &ReplyContext, mut src: LimitedRead<'_>) {
            let mut buf = heapless::Vec::<u8, 64>::new();
            while src.read_ready() > 0 {
                let _ = buf.push(src.read_next());
            }
            self.seen = Some(buf);
        }
    }

    #[test]
    fn header_round_trips_with_and_without_vlan() {
        let mut buf = [0u8; 32];
        let h = Header {
            dst: MacAddr([1, 2, 3, 4, 5, 6]),
            src: MacAddr([6, 5, 4, 3, 2, 1]),
            vtag: Some(VlanTag::new(3, false, 42)),
            etype: EtherType::IPV4,
        };
        let mut w = ArrayWrite::new(&mut buf);
        h.write_to(&mut w);
        let len = w.written_len();
        let mut r = crate::io::ArrayRead::new(&buf[..len]);
        let h2 = Header::read_from(&mut r);
        assert_eq!(h2.dst, h.dst);
        assert_eq!(h2.src, h.src);
        assert_eq!(h2.vtag.unwrap().vid(), 42);
        assert_eq!(h2.etype, h.etype);
    }

    #[test]
    fn dispatch_routes_by_frame_type() {
        let mut echo = Echo {
            ft: FrameType {
                vid: 0,
                etype: EtherType::IPV4,
            },
            seen: None,
        };
        let mut disp = Dispatch::new(MacAddr([0xAA; 6]));
        disp.register(&mut echo).unwrap();

        let mut raw = [0u8; 32];
        {
            let mut w = ArrayWrite::new(&mut raw);
            MacAddr([0xAA; 6]).write_to(&mut w);
            MacAddr([0xBB; 6]).write_to(&mut w);
            w.write_u16(EtherType::IPV4.0);
            w.write_bytes(b"payload");
        }
        let mut r = crate::io::ArrayRead::new(&raw[..14 + 7]);
        disp.data_rcvd(&mut r).unwrap();
        assert_eq!(echo.seen.unwrap().as_slice(), b"payload");
    }

    #[test]
    fn tpipe_over_ethernet_completes_handshake_and_delivers_data() {
        let mac_a = MacAddr([0xAA; 6]);
        let mac_b = MacAddr([0xBB; 6]);
        let etype = EtherType(0x7050);

        let mut tp_a = Tpipe::new(10);
        let mut tp_b = Tpipe::new(20);
        tp_a.connect(mac_b, etype, 0);
        tp_b.bind(etype, 0);

        let disp_a = Dispatch::new(mac_a);
        let disp_b = Dispatch::new(mac_b);

        tp_a.set_time(0);
        let mut buf = [0u8; 64];
        let mut w = ArrayWrite::new(&mut buf);
        tp_a.poll_always(&disp_a, &mut w);
        assert!(w.written_len() > 14, "open request should carry a tpipe header");

        let reply_to_b = ReplyContext {
            dst: mac_b,
            src: mac_a,
            vtag: None,
            etype,
        };
        tp_b.set_time(0);
        let mut r = crate::io::ArrayRead::new(w.written());
        let _ = r.read_consume(14);
        let remaining = r.read_ready();
        tp_b.frame_rcvd(&reply_to_b, LimitedRead::new(&mut r, remaining));
        assert!(tp_b.ready());

        let mut buf2 = [0u8; 64];
        let mut w2 = ArrayWrite::new(&mut buf2);
        tp_b.poll_always(&disp_b, &mut w2);
        assert!(w2.written_len() > 14);

        let reply_to_a = ReplyContext {
            dst: mac_a,
            src: mac_b,
            vtag: None,
            etype,
        };
        tp_a.set_time(0);
        let mut r2 = crate::io::ArrayRead::new(w2.written());
        let _ = r2.read_consume(14);
        let remaining2 = r2.read_ready();
        tp_a.frame_rcvd(&reply_to_a, LimitedRead::new(&mut r2, remaining2));
        assert!(tp_a.ready());

        tp_a.writer().write_bytes(b"hi");
        tp_a.set_time(1);
        tp_a.data_queued();
        let mut buf3 = [0u8; 64];
        let mut w3 = ArrayWrite::new(&mut buf3);
        tp_a.poll_always(&disp_a, &mut w3);
        let mut r3 = crate::io::ArrayRead::new(w3.written());
        let _ = r3.read_consume(14);
        let remaining3 = r3.read_ready();
        tp_b.set_time(1);
        tp_b.frame_rcvd(&reply_to_b, LimitedRead::new(&mut r3, remaining3));

        let mut got = [0u8; 2];
        assert!(tp_b.reader().read_bytes(&mut got));
        assert_eq!(&got, b"hi");
    }

    struct FixedClock(crate::ptp::Time);
    impl crate::ptp::tracking::TrackingClock for FixedClock {
        fn clock_now(&mut self) -> crate::ptp::Time {
            self.0
        }
        fn clock_adjust(&mut self, _amount: crate::ptp::Time) -> crate::ptp::Time {
            crate::ptp::Time::ZERO
        }
        fn clock_rate(&mut self, _offset: i64) {}
        fn get_rate(&self) -> i64 {
            0
        }
    }

    struct CountingCallback(u32);
    impl crate::ptp::Callback for CountingCallback {
        fn ptp_ready(&mut self, _data: &crate::ptp::Measurement) {
            self.0 += 1;
        }
    }

    #[test]
    fn ptp_over_ethernet_sends_delay_req_after_sync() {
        use crate::ptp::{Header, PortId, SyncBody};

        let mac_master = MacAddr([0, 1, 2, 3, 4, 5]);
        let mac_slave = MacAddr([0, 1, 2, 3, 4, 6]);
        let mut clock = FixedClock(crate::ptp::Time::new(100, 0, 0));
        let mut cb = CountingCallback(0);
        let mut ptp = Ptp::new(
            PortId {
                clock_id: 0x1122,
                port_num: 1,
            },
            &mut clock,
            &mut cb,
        );
        ptp.bind(0);

        let sync_hdr = Header {
            msg_type: Header::TYPE_SYNC,
            version: 2,
            length: 44,
            domain: 0,
            sdo_id: 0,
            flags: 0,
            correction: 0,
            subtype: 0,
            src_port: PortId {
                clock_id: 0x99,
                port_num: 1,
            },
            seq_id: 5,
            control: 0,
            log_interval: 0,
        };
        let mut buf = [0u8; 64];
        let mut w = ArrayWrite::new(&mut buf);
        sync_hdr.write_to(&mut w);
        SyncBody {
            origin_timestamp: crate::ptp::Time::new(100, 0, 0).as_wire(),
        }
        .write_to(&mut w);
        w.write_finalize();

        let reply = ReplyContext {
            dst: mac_master,
            src: mac_slave,
            vtag: None,
            etype: EtherType::PTP,
        };
        let mut r = crate::io::ArrayRead::new(w.written());
        let remaining = r.read_ready();
        ptp.frame_rcvd(&reply, LimitedRead::new(&mut r, remaining));

        let disp = Dispatch::new(mac_slave);
        let mut out_buf = [0u8; 64];
        let mut out = ArrayWrite::new(&mut out_buf);
        ptp.poll_always(&disp, &mut out);
        assert!(out.written_len() > 14, "delay-req frame was sent");
    }
}
