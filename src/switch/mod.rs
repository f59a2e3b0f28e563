//! Managed L2 switch: a fixed set of ports, a chain of ingress plugins that
//! decide where a frame goes, and a MAC-learning cache plugin implementing
//! the default forwarding policy.

pub mod log;

use heapless::{FnvIndexMap, Vec};

use crate::eth::{Header, MacAddr};
use crate::io::{LimitedRead, Readable, Writeable};
use crate::switch::log::{SwitchLogHandler, SwitchLogMessage};

/// Maximum ports bound to one [`SwitchCore`]; a `u32` port mask caps this
/// at 32, matching the bitmask representation used throughout.
pub const MAX_PORTS: usize = 32;
/// Maximum ingress plugins chained on one [`SwitchCore`].
pub const MAX_PLUGINS: usize = 8;
/// Rows in the MAC-learning table.
pub const MAC_TABLE_SIZE: usize = 64;

/// One switch port: a `Readable`/`Writeable` pair plus its bit position in
/// the 32-bit port mask and current VLAN membership/priority.
pub struct Port<'a> {
    pub rx: &'a mut dyn Readable,
    pub tx: &'a mut dyn Writeable,
    pub index: u8,
    pub vlan_mask: u32,
}

impl<'a> Port<'a> {
    pub fn new(rx: &'a mut dyn Readable, tx: &'a mut dyn Writeable, index: u8) -> Self {
        Port {
            rx,
            tx,
            index,
            vlan_mask: u32::MAX,
        }
    }

    pub fn bit(&self) -> u32 {
        1 << self.index
    }
}

/// Mutable forwarding decision threaded through the plugin chain for one
/// ingress frame. Plugins narrow `dst_mask`; none may widen it beyond what
/// an earlier plugin already excluded.
pub struct PluginContext {
    pub src_port: u8,
    pub hdr: Header,
    pub dst_mask: u32,
}

/// One stage of the ingress pipeline: VLAN policy, rate limiting, access
/// control, or (the default) MAC-address learning and lookup.
pub trait PluginCore {
    /// Narrow (never widen) `ctx.dst_mask` according to this plugin's
    /// policy. Returning `false` drops the frame outright.
    fn query(&mut self, ctx: &mut PluginContext) -> bool;
}

/// Learns source-MAC → ingress-port bindings and looks up destinations;
/// unknown unicast, multicast, and broadcast frames fan out to every
/// member port of the VLAN instead.
pub struct SwitchCache {
    table: FnvIndexMap<MacAddr, u8, MAC_TABLE_SIZE>,
}

impl SwitchCache {
    pub fn new() -> Self {
        SwitchCache {
            table: FnvIndexMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.table.clear();
    }
}

impl Default for SwitchCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PluginCore for SwitchCache {
    fn query(&mut self, ctx: &mut PluginContext) -> bool {
        if ctx.hdr.src.is_unicast() && ctx.hdr.src.is_valid() {
            let _ = self.table.insert(ctx.hdr.src, ctx.src_port);
        }
        if ctx.hdr.dst.is_unicast() {
            if let Some(&port) = self.table.get(&ctx.hdr.dst) {
                ctx.dst_mask &= 1 << port;
                return true;
            }
        }
        true
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no port registered at that index")]
    NoSuchPort,
    #[error("plugin chain is full")]
    TableFull,
}

/// The switch proper: owns the port set and ingress plugin chain, and
/// forwards each received frame to every port selected by the chain's
/// final `dst_mask`, optionally emitting a [`SwitchLogMessage`] per frame.
pub struct SwitchCore<'a> {
    ports: Vec<Port<'a>, MAX_PORTS>,
    plugins: Vec<&'a mut dyn PluginCore, MAX_PLUGINS>,
    logger: Option<&'a mut dyn SwitchLogHandler>,
    now: u32,
}

impl<'a> SwitchCore<'a> {
    pub fn new() -> Self {
        SwitchCore {
            ports: Vec::new(),
            plugins: Vec::new(),
            logger: None,
            now: 0,
        }
    }

    pub fn set_logger(&mut self, logger: &'a mut dyn SwitchLogHandler) {
        self.logger = Some(logger);
    }

    /// Advance the switch's coarse timestamp (used only to stamp log
    /// records), typically driven by the embedding application's clock.
    pub fn set_time(&mut self, now_usec: u32) {
        self.now = now_usec;
    }

    pub fn add_port(&mut self, port: Port<'a>) -> Result<(), Error> {
        self.ports.push(port).map_err(|_| Error::TableFull)
    }

    pub fn add_plugin(&mut self, plugin: &'a mut dyn PluginCore) -> Result<(), Error> {
        self.plugins.push(plugin).map_err(|_| Error::TableFull)
    }

    /// Poll every port for a pending frame and forward it. Call once per
    /// main-loop pass (an `Always` task in the embedding application).
    pub fn poll_always(&mut self) {
        for idx in 0..self.ports.len() {
            self.service_port(idx);
        }
    }

    fn service_port(&mut self, idx: usize) {
        if self.ports[idx].rx.read_ready() < 14 {
            return;
        }
        let header = Header::read_from(self.ports[idx].rx);
        let remaining = self.ports[idx].rx.read_ready();
        let mut body = heapless::Vec::<u8, { crate::io::buffer::DEFAULT_PKTBUF }>::new();
        {
            let mut src = LimitedRead::new(self.ports[idx].rx, remaining);
            while src.read_ready() > 0 {
                if body.push(src.read_next()).is_err() {
                    break;
                }
            }
        }
        self.ports[idx].rx.read_finalize();

        let src_port = self.ports[idx].index;
        let src_bit = self.ports[idx].bit();
        let vlan_members: u32 = self
            .ports
            .iter()
            .filter(|p| p.vlan_mask & src_bit != 0)
            .map(|p| p.bit())
            .fold(0u32, |acc, b| acc | b);

        let mut ctx = PluginContext {
            src_port,
            hdr: header,
            dst_mask: vlan_members & !src_bit,
        };
        let mut keep = true;
        for plugin in self.plugins.iter_mut() {
            if !plugin.query(&mut ctx) {
                keep = false;
                break;
            }
        }

        if !keep || ctx.dst_mask == 0 {
            if let Some(logger) = self.logger.as_mut() {
                let why = if keep {
                    log::DROP_NO_ROUTE
                } else {
                    log::DROP_DISABLED
                };
                logger.log_packet(SwitchLogMessage::init_drop(ctx.hdr, src_port, self.now, why));
            }
            return;
        }

        if let Some(logger) = self.logger.as_mut() {
            logger.log_packet(SwitchLogMessage::init_keep(
                ctx.hdr,
                src_port,
                self.now,
                ctx.dst_mask,
            ));
        }

        for port in self.ports.iter_mut() {
            if ctx.dst_mask & port.bit() == 0 {
                continue;
            }
            ctx.hdr.write_to(port.tx);
            port.tx.write_bytes(&body);
            port.tx.write_finalize();
        }
    }
}

impl<'a> Default for SwitchCore<'a> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eth::EtherType;
    use crate::io::{ArrayRead, ArrayWrite};

    fn raw_frame(dst: MacAddr, src: MacAddr, payload: &[u8]) -> heapless::Vec<u8, 64> {
        let mut buf = heapless::Vec::<u8, 64>::new();
        buf.extend_from_slice(&dst.0).unwrap();
        buf.extend_from_slice(&src.0).unwrap();
        buf.extend_from_slice(&EtherType::IPV4.0.to_be_bytes()).unwrap();
        buf.extend_from_slice(payload).unwrap();
        buf
    }

    #[test]
    fn unknown_destination_floods_other_ports() {
        let mac_a = MacAddr([0x02, 0, 0, 0, 0, 0xAA]);

        let frame = raw_frame(MacAddr::BROADCAST, mac_a, b"hello");
        let mut rx0 = ArrayRead::new(&frame);
        let mut tx0_buf = [0u8; 64];
        let mut tx0 = ArrayWrite::new(&mut tx0_buf);

        let empty: [u8; 0] = [];
        let mut rx1 = ArrayRead::new(&empty);
        let mut tx1_buf = [0u8; 64];
        let mut tx1 = ArrayWrite::new(&mut tx1_buf);

        let mut cache = SwitchCache::new();
        let mut sw = SwitchCore::new();
        sw.add_port(Port::new(&mut rx0, &mut tx0, 0)).unwrap();
        sw.add_port(Port::new(&mut rx1, &mut tx1, 1)).unwrap();
        sw.add_plugin(&mut cache).unwrap();
        sw.poll_always();

        assert_eq!(tx0.written_len(), 0, "frame must not loop back to its ingress port");
        assert_eq!(tx1.written(), frame.as_slice());
    }

    #[test]
    fn learned_destination_is_not_flooded() {
        let mac_a = MacAddr([0x02, 0, 0, 0, 0, 0xAA]);
        let mac_b = MacAddr([0x02, 0, 0, 0, 0, 0xBB]);

        // First frame: B -> A, so the cache learns B is on port 1.
        let learn = raw_frame(mac_a, mac_b, b"hi");
        let empty: [u8; 0] = [];
        let mut rx0 = ArrayRead::new(&empty);
        let mut tx0_buf = [0u8; 64];
        let mut tx0 = ArrayWrite::new(&mut tx0_buf);
        let mut rx1 = ArrayRead::new(&learn);
        let mut tx1_buf = [0u8; 64];
        let mut tx1 = ArrayWrite::new(&mut tx1_buf);

        let mut cache = SwitchCache::new();
        let mut sw = SwitchCore::new();
        sw.add_port(Port::new(&mut rx0, &mut tx0, 0)).unwrap();
        sw.add_port(Port::new(&mut rx1, &mut tx1, 1)).unwrap();
        sw.add_plugin(&mut cache).unwrap();
        sw.poll_always();
        assert_eq!(tx0.written(), learn.as_slice());

        // Second frame: A -> B, forwarded to port 1 only (now known).
        let reply = raw_frame(mac_b, mac_a, b"hey");
        let mut rx0b = ArrayRead::new(&reply);
        let mut tx0b_buf = [0u8; 64];
        let mut tx0b = ArrayWrite::new(&mut tx0b_buf);
        let mut rx1b = ArrayRead::new(&empty);
        let mut tx1b_buf = [0u8; 64];
        let mut tx1b = ArrayWrite::new(&mut tx1b_buf);

        let mut sw2 = SwitchCore::new();
        sw2.add_port(Port::new(&mut rx0b, &mut tx0b, 0)).unwrap();
        sw2.add_port(Port::new(&mut rx1b, &mut tx1b, 1)).unwrap();
        sw2.add_plugin(&mut cache).unwrap();
        sw2.poll_always();
        assert_eq!(tx1b.written(), reply.as_slice());
        assert_eq!(tx0b.written_len(), 0);
    }
}
