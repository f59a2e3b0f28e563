//! A cooperative-polling, `no_std` embedded networking stack: Ethernet
//! framing and VLAN dispatch, ARP, IPv4 with a routing table and ICMP,
//! UDP with an optional DHCP client/server, a layer-3 router, register
//! access over a local or remote ConfigBus, switch port management and
//! logging, telemetry aggregation, and a handful of optional protocol
//! modules (PTP, SNTP, CCSDS space-link framing, a CoAP reverse proxy,
//! MACsec framing).
//!
//! Every module is built around the [`io::Readable`]/[`io::Writeable`]
//! traits: callers drive everything by polling, there is no executor
//! and no heap allocation anywhere in the crate.

#![no_std]

pub mod checksum;
pub mod crc;
pub mod eth;
pub mod io;
pub mod ip;
pub mod irq;
pub mod log;
pub mod poll;
pub mod router;
pub mod slip;
pub mod switch;
pub mod telemetry;
pub mod time;
pub mod tpipe;
pub mod udp;

#[cfg(feature = "ccsds")]
pub mod ccsds;

#[cfg(feature = "coap")]
pub mod coap;

#[cfg(feature = "macsec")]
pub mod macsec;

#[cfg(feature = "ntp")]
pub mod ntp;

#[cfg(feature = "ptp")]
pub mod ptp;

pub mod cfgbus;
