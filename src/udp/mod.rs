//! User Datagram Protocol: header parse/emit and the port-number dispatch
//! sitting on top of [`crate::ip::Dispatch`].

#[cfg(feature = "dhcp")]
pub mod dhcp;

use heapless::Vec;
use thiserror::Error;

use crate::eth::MacAddr;
use crate::io::{LimitedRead, Readable, Writeable};
use crate::ip::{self, Addr, IpProtocol, Port, PROTO_UDP};

pub const HDR_LEN: usize = 8;
/// Maximum number of registered port handlers.
pub const MAX_PORTS: usize = 8;

#[derive(Debug, Error)]
pub enum Error {
    #[error("datagram shorter than the 8-byte UDP header")]
    Truncated,
    #[error("no listener registered on the destination port")]
    Unhandled,
    #[error("port table is full")]
    TableFull,
}

/// Parsed UDP header.
#[derive(Clone, Copy, Debug)]
pub struct Header {
    pub src_port: Port,
    pub dst_port: Port,
    pub length: u16,
}

impl Header {
    fn read_from(src: &mut dyn Readable) -> Result<Self, Error> {
        if src.read_ready() < HDR_LEN {
            return Err(Error::Truncated);
        }
        let src_port = Port(src.read_u16());
        let dst_port = Port(src.read_u16());
        let length = src.read_u16();
        let _checksum = src.read_u16();
        Ok(Header {
            src_port,
            dst_port,
            length,
        })
    }

    fn write_to(&self, dst: &mut dyn Writeable) {
        dst.write_u16(self.src_port.0);
        dst.write_u16(self.dst_port.0);
        dst.write_u16(self.length);
        dst.write_u16(0); // UDP checksum is optional over IPv4; left as zero
    }
}

/// A destination reachable by UDP: IP address, MAC (once resolved), and
/// port, mirroring the `udp::Address` connection-tracking convenience type.
#[derive(Clone, Copy, Debug)]
pub struct Address {
    pub ip: Addr,
    pub mac: Option<MacAddr>,
    pub port: Port,
}

/// Implemented by UDP-layer listeners (DHCP client/server, application
/// protocols) registered on a [`Dispatch`].
pub trait UdpListener {
    fn port(&self) -> Port;
    fn udp_rcvd(&mut self, header: &Header, src_addr: Addr, src: LimitedRead<'_>);
}

/// UDP dispatch: routes datagrams to registered port listeners and frames
/// outgoing ones atop an [`ip::Dispatch`].
pub struct Dispatch<'a> {
    ip_self: Addr,
    listeners: Vec<&'a mut dyn UdpListener, MAX_PORTS>,
}

impl<'a> Dispatch<'a> {
    pub fn new(ip_self: Addr) -> Self {
        Dispatch {
            ip_self,
            listeners: Vec::new(),
        }
    }

    pub fn register(&mut self, listener: &'a mut dyn UdpListener) -> Result<(), Error> {
        self.listeners.push(listener).map_err(|_| Error::TableFull)
    }

    /// Begin writing a UDP datagram; caller must already have opened the
    /// Ethernet+IP headers via `ip::Dispatch::open_write`.
    pub fn open_write(&self, src_port: Port, dst_port: Port, inner_len: usize, out: &mut dyn Writeable) {
        let header = Header {
            src_port,
            dst_port,
            length: (HDR_LEN + inner_len) as u16,
        };
        header.write_to(out);
    }
}

impl<'a> IpProtocol for Dispatch<'a> {
    fn protocol(&self) -> u8 {
        PROTO_UDP
    }

    fn ip_rcvd(&mut self, ip_header: &ip::Header, mut src: LimitedRead<'_>) {
        let header = match Header::read_from(&mut src) {
            Ok(h) => h,
            Err(_) => return,
        };
        if ip_header.dst != self.ip_self && !ip_header.dst.is_broadcast() {
            return;
        }
        let remaining = (header.length as usize).saturating_sub(HDR_LEN).min(src.read_ready());
        if let Some(listener) = self
            .listeners
            .iter_mut()
            .find(|l| l.port() == header.dst_port)
        {
            listener.udp_rcvd(&header, ip_header.src, LimitedRead::new(&mut src, remaining));
        }
    }
}

/// Binds a [`crate::tpipe::Core`] to UDP framing: addressed by a local port
/// plus a peer [`Address`]. The peer's MAC may still be pending ARP
/// resolution when `connect`/`udp_rcvd` first learn of it — `poll_always`
/// just stays in the core's generic not-ready retry path until
/// `set_peer_mac` fills it in, the same as flow control or a busy link.
///
/// Unlike [`crate::eth::Tpipe`], a freshly bound connection cannot learn
/// the peer's MAC from the receive path alone: `ip::Dispatch::ip_rcvd`
/// hands protocols only the IP header, not the Ethernet source address, so
/// the embedding application must resolve it (typically via
/// `eth::arp::ArpProtocol::resolve`) before the reply can go out.
pub struct Tpipe {
    core: crate::tpipe::Core,
    local_port: Port,
    peer: Option<Address>,
}

impl Tpipe {
    pub fn new(seed: u64) -> Self {
        Tpipe {
            core: crate::tpipe::Core::new(seed),
            local_port: Port(0),
            peer: None,
        }
    }

    /// Listen passively on `port` for an incoming connection.
    pub fn bind(&mut self, port: Port) {
        self.local_port = port;
    }

    /// Actively open a connection to `peer` from `local_port`.
    pub fn connect(&mut self, local_port: Port, peer: Address) {
        self.local_port = local_port;
        self.peer = Some(peer);
        self.core.open();
    }

    /// Fill in the peer's hardware address once ARP resolves it.
    pub fn set_peer_mac(&mut self, mac: MacAddr) {
        if let Some(peer) = &mut self.peer {
            peer.mac = Some(mac);
        }
    }

    pub fn peer(&self) -> Option<Address> {
        self.peer
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
    /// `poll_always` or dispatching a received datagram to this listener.
    pub fn set_time(&mut self, now_msec: u32) {
        self.core.set_time(now_msec);
    }

    pub fn writer(&mut self) -> &mut dyn Writeable {
        &mut self.core
    }

    pub fn reader(&mut self) -> &mut dyn Readable {
        &mut self.core
    }

    pub fn data_queued(&mut self) {
        self.core.data_queued();
    }

    /// Send a retransmit/keep-alive/ack block if one is due. `ip_disp`
    /// supplies the Ethernet+IP framing once the peer's address (including
    /// MAC) is fully known; otherwise this is a no-op.
    pub fn poll_always(&mut self, ip_disp: &mut ip::Dispatch<'_>, out: &mut dyn Writeable) {
        struct UdpLink<'b, 'a> {
            ip_disp: &'b mut ip::Dispatch<'a>,
            local_port: Port,
            peer: Option<Address>,
        }
        impl<'b, 'a> crate::tpipe::Link for UdpLink<'b, 'a> {
            fn open_write(&mut self, body_len: usize, out: &mut dyn Writeable) -> bool {
                let Some(peer) = self.peer else {
                    return false;
                };
                let Some(mac) = peer.mac else {
                    return false;
                };
                self.ip_disp.open_write(
                    mac,
                    None,
                    peer.ip,
                    PROTO_UDP,
                    HDR_LEN + body_len,
                    out,
                );
                Header {
                    src_port: self.local_port,
                    dst_port: peer.port,
                    length: (HDR_LEN + body_len) as u16,
                }
                .write_to(out);
                true
            }
        }
        let mut link = UdpLink {
            ip_disp,
            local_port: self.local_port,
            peer: self.peer,
        };
        self.core.poll_always(&mut link, out);
    }
}

impl UdpListener for Tpipe {
    fn port(&self) -> Port {
        self.local_port
    }

    fn udp_rcvd(&mut self, header: &Header, src_addr: Addr, src: LimitedRead<'_>) {
        if self.peer.is_none() {
            self.peer = Some(Address {
                ip: src_addr,
                mac: None,
                port: header.src_port,
            });
        }
        self.core.packet_rcvd(src);
    }
}

/// IANA-assigned PTP-over-UDP ports (Annex D/E of IEEE 1588): `319` carries
/// time-critical event messages (Sync, Delay-Req), `320` carries general
/// messages (Announce, Follow-Up, Delay-Resp).
pub const PTP_EVENT_PORT: Port = Port(319);
pub const PTP_GENERAL_PORT: Port = Port(320);

/// Binds a [`crate::ptp::client::Client`] to UDP framing. For simplicity
/// this implementation listens on a single port (default
/// [`PTP_EVENT_PORT`]) for both event and general messages rather than
/// registering separately on 319 and 320, since both carry the same
/// session's traffic and this crate has no multi-listener aliasing.
///
/// As with [`Tpipe`], the master's MAC must be supplied externally via
/// `set_peer_mac` once ARP resolves it; until then `poll_always` is a no-op.
pub struct Ptp<'a> {
    client: crate::ptp::client::Client,
    clock: &'a mut dyn crate::ptp::tracking::TrackingClock,
    callback: &'a mut dyn crate::ptp::Callback,
    local_port: Port,
    master: Option<Address>,
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
            local_port: PTP_EVENT_PORT,
            master: None,
        }
    }

    pub fn bind(&mut self, port: Port) {
        self.local_port = port;
    }

    pub fn set_peer_mac(&mut self, mac: MacAddr) {
        if let Some(master) = &mut self.master {
            master.mac = Some(mac);
        }
    }

    pub fn set_req_interval(&mut self, msec: u32) {
        self.client.set_req_interval(msec);
    }

    pub fn set_time(&mut self, now_msec: u32) {
        self.client.set_time(now_msec);
    }

    /// Send a Delay-Req to the learned master if one is due and its MAC is
    /// known.
    pub fn poll_always(&mut self, ip_disp: &mut ip::Dispatch<'_>, out: &mut dyn Writeable) {
        if !self.client.due() {
            return;
        }
        let Some(master) = self.master else {
            return;
        };
        let Some(mac) = master.mac else {
            return;
        };
        let local_tx_time = self.clock.clock_now();
        let body_len = crate::ptp::Header::HEADER_LEN + crate::ptp::Timestamp::WIRE_LEN;
        ip_disp.open_write(mac, None, master.ip, PROTO_UDP, HDR_LEN + body_len, out);
        Header {
            src_port: self.local_port,
            dst_port: master.port,
            length: (HDR_LEN + body_len) as u16,
        }
        .write_to(out);
        self.client.write_delay_req(local_tx_time, out);
        out.write_finalize();
    }
}

impl<'a> UdpListener for Ptp<'a> {
    fn port(&self) -> Port {
        self.local_port
    }

    fn udp_rcvd(&mut self, header: &Header, src_addr: Addr, mut src: LimitedRead<'_>) {
        if self.master.is_none() {
            self.master = Some(Address {
                ip: src_addr,
                mac: None,
                port: header.src_port,
            });
        }
        let local_rx_time = self.clock.clock_now();
        let ptp_header = crate::ptp::Header::read_from(&mut src);
        self.client
            .packet_rcvd(&ptp_header, local_rx_time, &mut src, self.callback);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{ArrayRead, ArrayWrite};

    struct Echo {
        port: Port,
        last: Option<heapless::Vec<u8, 32>>,
    }
    impl UdpListener for Echo {
        fn port(&self) -> Port {
            self.port
        }
        fn udp_rcvd(&mut self, _h: &Header, _src_addr: Addr, mut src: LimitedRead<'_>) {
            let mut buf = heapless::Vec::<u8, 32>::new();
            while src.read_ready() > 0 {
                let _ = buf.push(src.read_next());
            }
            self.last = Some(buf);
        }
    }

    #[test]
    fn header_round_trips() {
        let mut buf = [0u8; 8];
        let h = Header {
            src_port: Port(68),
            dst_port: Port(67),
            length: 20,
        };
        let mut w = ArrayWrite::new(&mut buf);
        h.write_to(&mut w);
        let mut r = ArrayRead::new(&buf);
        let h2 = Header::read_from(&mut r).unwrap();
        assert_eq!(h2.src_port.0, 68);
        assert_eq!(h2.dst_port.0, 67);
        assert_eq!(h2.length, 20);
    }

    #[test]
    fn dispatch_routes_by_port() {
        let mut echo = Echo {
            port: Port(7),
            last: None,
        };
        let mut disp = Dispatch::new(Addr::new(10, 0, 0, 5));
        disp.register(&mut echo).unwrap();

        let mut raw = [0u8; 16];
        {
            let mut w = ArrayWrite::new(&mut raw);
            Header {
                src_port: Port(9000),
                dst_port: Port(7),
                length: 12,
            }
            .write_to(&mut w);
            w.write_bytes(b"ping");
        }
        let ip_header = ip::Header {
            ihl: 5,
            total_len: 32,
            ident: 0,
            ttl: 64,
            protocol: PROTO_UDP,
            src: Addr::new(10, 0, 0, 9),
            dst: Addr::new(10, 0, 0, 5),
        };
        let mut r = ArrayRead::new(&raw[..12]);
        disp.ip_rcvd(&ip_header, LimitedRead::new(&mut r, 12));
        assert_eq!(echo.last.unwrap().as_slice(), b"ping");
    }

    #[test]
    fn tpipe_over_udp_completes_handshake_with_known_peer_mac() {
        let mac_a = MacAddr([0xAA; 6]);
        let mac_b = MacAddr([0xBB; 6]);
        let addr_a = Addr::new(10, 0, 0, 1);
        let addr_b = Addr::new(10, 0, 0, 2);
        const ETH_IP_HDR: usize = 14 + 20;

        let mut tp_a = Tpipe::new(1);
        let mut tp_b = Tpipe::new(2);

        tp_a.connect(
            Port(9000),
            Address {
                ip: addr_b,
                mac: Some(mac_b),
                port: Port(9001),
            },
        );
        tp_b.bind(Port(9001));

        let mut ip_a = ip::Dispatch::new(mac_a, addr_a);
        let mut ip_b = ip::Dispatch::new(mac_b, addr_b);

        tp_a.set_time(0);
        let mut buf = [0u8; 64];
        let mut w = ArrayWrite::new(&mut buf);
        tp_a.poll_always(&mut ip_a, &mut w);
        assert!(w.written_len() > ETH_IP_HDR + HDR_LEN);

        let mut r = ArrayRead::new(w.written());
        let _ = r.read_consume(ETH_IP_HDR);
        let udp_header = Header::read_from(&mut r).unwrap();
        let remaining = r.read_ready();
        tp_b.set_time(0);
        tp_b.udp_rcvd(&udp_header, addr_a, LimitedRead::new(&mut r, remaining));
        assert!(tp_b.ready());

        // The receive path alone can't tell B what A's MAC is (see the
        // type doc above); the embedding app resolves it out of band.
        tp_b.set_peer_mac(mac_a);

        let mut buf2 = [0u8; 64];
        let mut w2 = ArrayWrite::new(&mut buf2);
        tp_b.poll_always(&mut ip_b, &mut w2);
        assert!(w2.written_len() > ETH_IP_HDR + HDR_LEN);

        let mut r2 = ArrayRead::new(w2.written());
        let _ = r2.read_consume(ETH_IP_HDR);
        let udp_header2 = Header::read_from(&mut r2).unwrap();
        let remaining2 = r2.read_ready();
        tp_a.set_time(0);
        tp_a.udp_rcvd(&udp_header2, addr_b, LimitedRead::new(&mut r2, remaining2));
        assert!(tp_a.ready());

        tp_a.writer().write_bytes(b"over udp");
        tp_a.set_time(1);
        tp_a.data_queued();
        let mut buf3 = [0u8; 64];
        let mut w3 = ArrayWrite::new(&mut buf3);
        tp_a.poll_always(&mut ip_a, &mut w3);
        let mut r3 = ArrayRead::new(w3.written());
        let _ = r3.read_consume(ETH_IP_HDR);
        let udp_header3 = Header::read_from(&mut r3).unwrap();
        let remaining3 = r3.read_ready();
        tp_b.set_time(1);
        tp_b.udp_rcvd(&udp_header3, addr_a, LimitedRead::new(&mut r3, remaining3));

        let mut got = [0u8; 8];
        assert!(tp_b.reader().read_bytes(&mut got));
        assert_eq!(&got, b"over udp");
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
    fn ptp_over_udp_sends_delay_req_once_master_mac_is_known() {
        use crate::ptp::{Header as PtpHeader, PortId, SyncBody};

        let addr_master = Addr::new(10, 0, 0, 1);
        let mut clock = FixedClock(crate::ptp::Time::new(200, 0, 0));
        let mut cb = CountingCallback(0);
        let mut ptp = Ptp::new(
            PortId {
                clock_id: 0x77,
                port_num: 1,
            },
            &mut clock,
            &mut cb,
        );

        let sync_hdr = PtpHeader {
            msg_type: PtpHeader::TYPE_SYNC,
            version: 2,
            length: 44,
            domain: 0,
            sdo_id: 0,
            flags: 0,
            correction: 0,
            subtype: 0,
            src_port: PortId {
                clock_id: 0x55,
                port_num: 1,
            },
            seq_id: 1,
            control: 0,
            log_interval: 0,
        };
        let mut buf = [0u8; 64];
        let mut w = ArrayWrite::new(&mut buf);
        sync_hdr.write_to(&mut w);
        SyncBody {
            origin_timestamp: crate::ptp::Time::new(200, 0, 0).as_wire(),
        }
        .write_to(&mut w);
        w.write_finalize();
        let mut r = ArrayRead::new(w.written());
        let remaining = r.read_ready();
        ptp.udp_rcvd(&Header { src_port: PTP_EVENT_PORT, dst_port: PTP_EVENT_PORT, length: 0 }, addr_master, LimitedRead::new(&mut r, remaining));

        ptp.set_peer_mac(MacAddr([0xCC; 6]));

        let mut ip_disp = ip::Dispatch::new(MacAddr([0xDD; 6]), Addr::new(10, 0, 0, 9));
        let mut out_buf = [0u8; 80];
        let mut out = ArrayWrite::new(&mut out_buf);
        ptp.poll_always(&mut ip_disp, &mut out);
        const ETH_IP_HDR: usize = 14 + 20;
        assert!(out.written_len() > ETH_IP_HDR + HDR_LEN);
    }
}
