//! Drives the full eth + ip + router pipeline across three simulated
//! endpoints: endpoint 1 sends a UDP datagram to endpoint 2 through a
//! router with a route to each endpoint's subnet, and the payload must
//! arrive at endpoint 2 byte-for-byte with the forwarding MAC the
//! router's routing table resolved to.

use satcat5::crc::ip_checksum;
use satcat5::eth::arp::ArpProtocol;
use satcat5::eth::{EtherType, MacAddr};
use satcat5::io::{ArrayRead, ArrayWrite, Writeable};
use satcat5::ip::table::{RouteFlags, Table};
use satcat5::ip::{Addr, Mask, Subnet, PROTO_UDP};
use satcat5::router::{Dispatch, Port};

const MAC1: MacAddr = MacAddr([0xDE, 0xAD, 0xBE, 0xEF, 0x11, 0x11]);
const MAC2: MacAddr = MacAddr([0xDE, 0xAD, 0xBE, 0xEF, 0x22, 0x22]);
const MAC3: MacAddr = MacAddr([0xDE, 0xAD, 0xBE, 0xEF, 0x33, 0x33]);
const ROUTER_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x00]);

fn ip1(last: u8) -> Addr {
    Addr::new(192, 168, 1, last)
}
fn ip2(last: u8) -> Addr {
    Addr::new(192, 168, 2, last)
}

/// Hand-assembles a 20-byte IPv4 header exactly the way the crate's
/// internal (non-public) header writer does, since the pipeline under
/// test only exposes `Readable`/`Writeable` frame boundaries, not the
/// header codec itself.
fn write_ip_header(dst: &mut dyn Writeable, total_len: u16, ident: u16, ttl: u8, protocol: u8, src: Addr, dst_addr: Addr) {
    let mut core = [0u8; 20];
    core[0] = (4 << 4) | 5;
    core[2..4].copy_from_slice(&total_len.to_be_bytes());
    core[4..6].copy_from_slice(&ident.to_be_bytes());
    core[8] = ttl;
    core[9] = protocol;
    core[12..16].copy_from_slice(&src.0.to_be_bytes());
    core[16..20].copy_from_slice(&dst_addr.0.to_be_bytes());
    let sum = ip_checksum(&core);
    core[10..12].copy_from_slice(&sum.to_be_bytes());
    dst.write_bytes(&core);
}

#[test]
fn endpoint_one_reaches_endpoint_two_through_the_router() {
    let mut table = Table::new();
    assert!(table.route_static(
        Subnet {
            addr: Addr::new(192, 168, 1, 0),
            mask: Mask::from_prefix(24),
        },
        Addr::UNSPECIFIED,
        MAC1,
        0,
        RouteFlags::empty(),
    ));
    assert!(table.route_static(
        Subnet {
            addr: Addr::new(192, 168, 2, 0),
            mask: Mask::from_prefix(24),
        },
        Addr::UNSPECIFIED,
        MAC2,
        1,
        RouteFlags::empty(),
    ));
    assert!(table.route_static(
        Subnet {
            addr: Addr::new(192, 168, 3, 0),
            mask: Mask::from_prefix(24),
        },
        Addr::UNSPECIFIED,
        MAC3,
        2,
        RouteFlags::empty(),
    ));

    let mut arp = ArpProtocol::new(ROUTER_MAC, Addr::new(192, 168, 0, 0));

    let payload = b"Message from 1 to 2.";
    let mut in_frame = [0u8; 64];
    let mut in_wire = ArrayWrite::new(&mut in_frame);
    let eth_hdr = satcat5::eth::Header {
        dst: ROUTER_MAC,
        src: MAC1,
        vtag: None,
        etype: EtherType::IPV4,
    };
    eth_hdr.write_to(&mut in_wire);
    write_ip_header(&mut in_wire, (20 + payload.len()) as u16, 1, 64, PROTO_UDP, ip1(1), ip2(2));
    in_wire.write_bytes(payload);
    let in_frame = in_wire.written();

    let mut rx0 = ArrayRead::new(in_frame);
    let mut tx0_buf = [0u8; 64];
    let mut tx0 = ArrayWrite::new(&mut tx0_buf);

    let empty: [u8; 0] = [];
    let mut rx1 = ArrayRead::new(&empty);
    let mut tx1_buf = [0u8; 64];
    let mut tx1 = ArrayWrite::new(&mut tx1_buf);

    let mut rx2 = ArrayRead::new(&empty);
    let mut tx2_buf = [0u8; 64];
    let mut tx2 = ArrayWrite::new(&mut tx2_buf);

    let mut disp = Dispatch::new(ROUTER_MAC, &mut table, &mut arp);
    disp.add_port(Port::new(&mut rx0, &mut tx0, 0)).unwrap();
    disp.add_port(Port::new(&mut rx1, &mut tx1, 1)).unwrap();
    disp.add_port(Port::new(&mut rx2, &mut tx2, 2)).unwrap();
    disp.poll_always();

    assert!(tx2.written().is_empty(), "nothing should go out endpoint 3's port");

    let out = tx1.written();
    assert!(!out.is_empty(), "endpoint 2 should have received a forwarded frame");
    let mut r = ArrayRead::new(out);
    let out_eth = satcat5::eth::Header::read_from(&mut r);
    assert_eq!(out_eth.dst, MAC2);
    assert_eq!(out_eth.src, ROUTER_MAC);
    // Skip the 20-byte IP header; the payload follows immediately.
    let mut skip = [0u8; 20];
    r.read_bytes(&mut skip);
    let mut got = vec![0u8; payload.len()];
    r.read_bytes(&mut got);
    assert_eq!(&got[..], payload);

    assert_eq!(table.route_lookup(ip2(2)).dstmac, MAC2);
}
