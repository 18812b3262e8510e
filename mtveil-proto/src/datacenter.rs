//! Telegram datacenter address table.
//!
//! Five ingress clusters, compile-time known.  The proxy only ever dials
//! these addresses; there is no discovery and no config override.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Upstream port for every datacenter.
pub const UPSTREAM_PORT: u16 = 443;

// ─── Datacenter ───────────────────────────────────────────────────────────────

/// One Telegram ingress cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Datacenter {
    pub id:       i32,
    pub ipv4:     Ipv4Addr,
    pub ipv6:     Ipv6Addr,
    pub location: &'static str,
    /// 1 is the best-connected tier; 3 the least.
    pub priority: u8,
}

impl Datacenter {
    pub fn addr_v4(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.ipv4), UPSTREAM_PORT)
    }

    pub fn addr_v6(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V6(self.ipv6), UPSTREAM_PORT)
    }

    /// `"DC3"` — the label used in metrics and logs.
    pub fn label(&self) -> String {
        format!("DC{}", self.id)
    }
}

static TABLE: [Datacenter; 5] = [
    Datacenter {
        id:       1,
        ipv4:     Ipv4Addr::new(149, 154, 175, 53),
        ipv6:     Ipv6Addr::new(0x2001, 0xb28, 0xf23d, 0xf001, 0, 0, 0, 0xa),
        location: "MIA",
        priority: 3,
    },
    Datacenter {
        id:       2,
        ipv4:     Ipv4Addr::new(149, 154, 167, 51),
        ipv6:     Ipv6Addr::new(0x2001, 0x67c, 0x4e8, 0xf002, 0, 0, 0, 0xa),
        location: "AMS",
        priority: 2,
    },
    Datacenter {
        id:       3,
        ipv4:     Ipv4Addr::new(149, 154, 175, 100),
        ipv6:     Ipv6Addr::new(0x2001, 0xb28, 0xf23d, 0xf003, 0, 0, 0, 0xa),
        location: "MIA",
        priority: 3,
    },
    Datacenter {
        id:       4,
        ipv4:     Ipv4Addr::new(149, 154, 167, 91),
        ipv6:     Ipv6Addr::new(0x2001, 0x67c, 0x4e8, 0xf004, 0, 0, 0, 0xa),
        location: "AMS",
        priority: 2,
    },
    Datacenter {
        id:       5,
        ipv4:     Ipv4Addr::new(91, 108, 56, 130),
        ipv6:     Ipv6Addr::new(0x2001, 0xb28, 0xf23f, 0xf005, 0, 0, 0, 0xa),
        location: "SIN",
        priority: 1,
    },
];

/// The full five-entry table.
pub fn table() -> &'static [Datacenter; 5] {
    &TABLE
}

/// Look up a datacenter by id (1..=5).
pub fn by_id(id: i32) -> Option<&'static Datacenter> {
    TABLE.iter().find(|dc| dc.id == id)
}

/// The priority-1 datacenter, used as the fallback target for unknown ids.
pub fn priority_one() -> &'static Datacenter {
    &TABLE[4]
}

/// Dial order after `failed_id` could not be reached: the remaining DCs,
/// same-priority region first, then increasingly better-connected tiers.
pub fn fallback_order(failed_id: i32) -> Vec<&'static Datacenter> {
    let mut rest: Vec<&'static Datacenter> =
        TABLE.iter().filter(|dc| dc.id != failed_id).collect();
    rest.sort_by_key(|dc| (std::cmp::Reverse(dc.priority), dc.id));
    rest
}
