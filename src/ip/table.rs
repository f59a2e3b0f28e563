//! Static + ephemeral IPv4 routing table: longest-prefix lookup with an
//! ARP-cache-backed gateway MAC, following the split of a fixed block of
//! user-configured routes and a pool of cache entries that grows from the
//! opposite end of the same array.

use crate::eth::MacAddr;
use crate::ip::{Addr, Mask, Subnet};

/// Total rows (static + ephemeral combined) held by one [`Table`].
pub const ROUTING_TABLE_SIZE: usize = 16;

bitflags::bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct RouteFlags: u8 {
        /// Gateway MAC was set explicitly and must not be overwritten by
        /// ARP-cache updates.
        const MAC_FIXED = 0x01;
    }
}

/// One routing-table row: which destinations it covers, where to forward
/// them, and (once resolved) the gateway's hardware address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Route {
    pub subnet: Subnet,
    pub gateway: Addr,
    pub dstmac: MacAddr,
    pub port: u8,
    pub flags: RouteFlags,
}

const ROUTE_NONE: Route = Route {
    subnet: Subnet {
        addr: Addr::UNSPECIFIED,
        mask: Mask::NONE,
    },
    gateway: Addr::UNSPECIFIED,
    dstmac: MacAddr::ZERO,
    port: 0,
    flags: RouteFlags::empty(),
};

const fn simple_route(addr: Addr, dstmac: MacAddr, port: u8, flags: RouteFlags) -> Route {
    Route {
        subnet: Subnet {
            addr,
            mask: Mask(0xFFFF_FFFF),
        },
        gateway: addr,
        dstmac,
        port,
        flags,
    }
}

/// Static/ephemeral routing table for one IPv4 interface. Static routes
/// (added via [`Table::route_static`]/[`Table::route_default`]) fill the
/// array from the front; ephemeral ARP-learned cache entries fill it from
/// the back, so the two halves never collide while either has free rows.
pub struct Table {
    rows: [Route; ROUTING_TABLE_SIZE],
    default_route: Route,
    wridx_static: usize,
    wridx_ephemeral: usize,
}

impl Table {
    pub fn new() -> Self {
        Table {
            rows: [ROUTE_NONE; ROUTING_TABLE_SIZE],
            default_route: simple_route(Addr::BROADCAST, MacAddr::ZERO, 0, RouteFlags::empty()),
            wridx_static: 0,
            wridx_ephemeral: ROUTING_TABLE_SIZE - 1,
        }
    }

    /// Erase every route. `lockdown` also clears the default gateway
    /// (`false` instead falls back to treating every destination as local).
    pub fn route_clear(&mut self, lockdown: bool) {
        self.wridx_static = 0;
        self.wridx_ephemeral = ROUTING_TABLE_SIZE - 1;
        self.default_route = simple_route(
            if lockdown {
                Addr::UNSPECIFIED
            } else {
                Addr::BROADCAST
            },
            MacAddr::ZERO,
            0,
            RouteFlags::empty(),
        );
        self.rows = [ROUTE_NONE; ROUTING_TABLE_SIZE];
    }

    /// Clear cached gateway MACs. Rows with a user-fixed MAC are left
    /// untouched; ephemeral rows are deleted outright.
    pub fn route_flush(&mut self) {
        self.wridx_ephemeral = ROUTING_TABLE_SIZE - 1;
        for a in 0..ROUTING_TABLE_SIZE {
            if self.rows[a].flags.contains(RouteFlags::MAC_FIXED) {
                continue;
            }
            if a < self.wridx_static {
                self.rows[a].dstmac = MacAddr::ZERO;
            } else {
                self.rows[a] = ROUTE_NONE;
            }
        }
    }

    pub fn route_default(&mut self, gateway: Addr, dstmac: MacAddr, port: u8, mut flags: RouteFlags) -> bool {
        if dstmac.is_valid() {
            flags.insert(RouteFlags::MAC_FIXED);
        }
        self.default_route = Route {
            subnet: Subnet::DEFAULT_ROUTE,
            gateway,
            dstmac,
            port,
            flags,
        };
        true
    }

    /// Clear the table, then route everything to `gateway` except `subnet`,
    /// which is treated as directly reachable.
    pub fn route_simple(&mut self, gateway: Addr, subnet_mask: Mask) -> bool {
        self.route_clear(false);
        self.route_default(gateway, MacAddr::ZERO, 0, RouteFlags::empty());
        self.route_local(Subnet {
            addr: gateway,
            mask: subnet_mask,
        })
    }

    /// A directly-reachable (no gateway) subnet.
    pub fn route_local(&mut self, subnet: Subnet) -> bool {
        self.route_static(subnet, Addr::BROADCAST, MacAddr::ZERO, 0, RouteFlags::empty())
    }

    pub fn route_static(
        &mut self,
        subnet: Subnet,
        gateway: Addr,
        dstmac: MacAddr,
        port: u8,
        mut flags: RouteFlags,
    ) -> bool {
        if dstmac.is_valid() {
            flags.insert(RouteFlags::MAC_FIXED);
        }
        if subnet == Subnet::DEFAULT_ROUTE {
            return self.route_default(gateway, dstmac, port, flags);
        }
        for a in 0..self.wridx_static {
            if self.rows[a].subnet == subnet {
                self.rows[a] = Route {
                    subnet,
                    gateway,
                    dstmac,
                    port,
                    flags,
                };
                return true;
            }
        }
        if self.wridx_static < ROUTING_TABLE_SIZE {
            self.rows[self.wridx_static] = Route {
                subnet,
                gateway,
                dstmac,
                port,
                flags,
            };
            self.wridx_static += 1;
            true
        } else {
            false
        }
    }

    /// Record a freshly-resolved ARP mapping, updating every matching
    /// cache-eligible route or creating a new ephemeral entry.
    pub fn route_cache(&mut self, gateway: Addr, dstmac: MacAddr) -> bool {
        if !gateway.is_unicast() || !dstmac.is_unicast() {
            return false;
        }
        let mut self_match = false;
        for a in 0..ROUTING_TABLE_SIZE {
            if self.rows[a].gateway == gateway {
                if self.rows[a].subnet.contains(gateway) {
                    self_match = true;
                }
                if !self.rows[a].flags.contains(RouteFlags::MAC_FIXED) {
                    self.rows[a].dstmac = dstmac;
                }
            }
        }
        if self_match {
            return true;
        }
        if self.wridx_static >= ROUTING_TABLE_SIZE {
            return false;
        }
        let best = self.route_lookup(gateway);
        let mut flags = best.flags;
        flags.remove(RouteFlags::MAC_FIXED);
        if self.wridx_ephemeral < self.wridx_static || self.wridx_ephemeral >= ROUTING_TABLE_SIZE {
            self.wridx_ephemeral = ROUTING_TABLE_SIZE - 1;
        }
        let idx = self.wridx_ephemeral;
        self.rows[idx] = simple_route(gateway, dstmac, best.port, flags);
        self.wridx_ephemeral = self.wridx_ephemeral.wrapping_sub(1);
        true
    }

    pub fn route_remove(&mut self, subnet: Subnet) -> bool {
        for a in 0..self.wridx_static {
            if self.rows[a].subnet == subnet {
                self.wridx_static -= 1;
                let last = self.wridx_static;
                if a != last {
                    self.rows[a] = self.rows[last];
                }
                self.rows[last] = ROUTE_NONE;
                return true;
            }
        }
        for a in self.wridx_static..ROUTING_TABLE_SIZE {
            if self.rows[a].subnet == subnet {
                self.rows[a] = ROUTE_NONE;
                return true;
            }
        }
        false
    }

    /// Longest-prefix match for `dstaddr`, falling back to the default
    /// route. Multicast destinations and the unspecified address are
    /// special-cased to avoid a table scan.
    pub fn route_lookup(&self, dstaddr: Addr) -> Route {
        if dstaddr.is_multicast() {
            return simple_route(dstaddr, MacAddr::BROADCAST, 0, RouteFlags::empty());
        }
        if dstaddr == Addr::UNSPECIFIED {
            return simple_route(Addr::UNSPECIFIED, MacAddr::ZERO, 0, RouteFlags::empty());
        }
        let mut best = self.default_route;
        for row in &self.rows {
            if row.subnet.mask.0 > best.subnet.mask.0 && row.subnet.contains(dstaddr) {
                best = *row;
            }
        }
        if best.gateway == Addr::BROADCAST {
            best.gateway = dstaddr;
        }
        best
    }
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn longest_prefix_wins_over_default_route() {
        let mut t = Table::new();
        t.route_default(Addr::new(10, 0, 0, 1), MacAddr::ZERO, 0, RouteFlags::empty());
        t.route_static(
            Subnet {
                addr: Addr::new(192, 168, 1, 0),
                mask: Mask::from_prefix(24),
            },
            Addr::BROADCAST,
            MacAddr::ZERO,
            0,
            RouteFlags::empty(),
        );
        let local = t.route_lookup(Addr::new(192, 168, 1, 42));
        assert_eq!(local.gateway, Addr::new(192, 168, 1, 42));

        let remote = t.route_lookup(Addr::new(8, 8, 8, 8));
        assert_eq!(remote.gateway, Addr::new(10, 0, 0, 1));
    }

    #[test]
    fn route_cache_updates_matching_rows_and_adds_ephemeral() {
        let mut t = Table::new();
        t.route_default(Addr::new(10, 0, 0, 1), MacAddr::ZERO, 0, RouteFlags::empty());
        let learned_mac = MacAddr([2, 2, 2, 2, 2, 2]);
        assert!(t.route_cache(Addr::new(10, 0, 0, 1), learned_mac));
        let route = t.route_lookup(Addr::new(172, 16, 0, 5));
        assert_eq!(route.dstmac, learned_mac);
    }

    #[test]
    fn route_remove_deletes_static_entry_without_leaving_gap() {
        let mut t = Table::new();
        let subnet = Subnet {
            addr: Addr::new(10, 1, 0, 0),
            mask: Mask::from_prefix(16),
        };
        assert!(t.route_static(subnet, Addr::BROADCAST, MacAddr::ZERO, 0, RouteFlags::empty()));
        assert!(t.route_remove(subnet));
        assert!(!t.route_remove(subnet));
    }
}
