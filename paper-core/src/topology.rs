//! Network identities of the F engine mesh
//!
//! Every F engine has four switch-facing and four X-engine-facing 10 GbE
//! links. All addresses are derived from the engine's function ID (FID) and
//! link index with fixed offsets that mirror the physical cabling:
//! - switch:  base + 32 + 8*link + fid
//! - cluster: base + 512 + 256*link + fid + 1, peer host `px{fid+1}-{link+2}`
//!
//! Nothing here validates FID or link ranges, the hardware does not either.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Links per F engine in each address family.
pub const LINKS_PER_NODE: u32 = 4;

/// Entries in a 10 GbE core ARP table.
pub const ARP_TABLE_SIZE: usize = 256;

const SWITCH_OFFSET: u32 = 32;
const SWITCH_LINK_STRIDE: u32 = 8;
const CLUSTER_OFFSET: u32 = 512;
const CLUSTER_LINK_STRIDE: u32 = 256;
const MAC_MASK: u64 = 0xffff_ffff_ffff;

/// 48-bit Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(u64);

impl MacAddr {
    pub const fn new(value: u64) -> Self {
        Self(value & MAC_MASK)
    }

    pub const fn to_u64(self) -> u64 {
        self.0
    }

    /// Adds `n`, wrapping inside the 48-bit space.
    pub const fn offset(self, n: u64) -> Self {
        Self::new(self.0.wrapping_add(n))
    }

    /// Big-endian pair of 32-bit words (`hi` holds the top 16 bits).
    pub const fn to_words(self) -> [u32; 2] {
        [(self.0 >> 32) as u32, self.0 as u32]
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0.to_be_bytes();
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", b[2], b[3], b[4], b[5], b[6], b[7])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MacParseError {
    #[error("bad mac length: {0} hex digits")]
    Length(usize),
    #[error("bad mac hex: {0}")]
    Hex(String),
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    /// Accepts any separator, e.g. `02:02:0a:0a:0a:00` or `02020a0a0a00`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        if hex.len() != 12 {
            return Err(MacParseError::Length(hex.len()));
        }
        u64::from_str_radix(&hex, 16)
            .map(MacAddr::new)
            .map_err(|_| MacParseError::Hex(s.to_string()))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// IP/MAC pair of one 10 GbE core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interface {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
}

/// Both address families of one link index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkIdentity {
    pub link: u32,
    pub switch: Interface,
    pub cluster: Interface,
    /// X engine host on the other end of the cluster link; resolved elsewhere.
    pub peer_hostname: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub fid: u32,
    pub links: Vec<LinkIdentity>,
}

/// Base addresses of both families. Offsets and strides are fixed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressPlan {
    pub switch_ip_base: Ipv4Addr,
    pub switch_mac_base: MacAddr,
    pub cluster_ip_base: Ipv4Addr,
    pub cluster_mac_base: MacAddr,
}

impl Default for AddressPlan {
    fn default() -> Self {
        Self {
            switch_ip_base: Ipv4Addr::new(10, 10, 10, 0),
            switch_mac_base: MacAddr::new(0x0202_0a0a_0a00),
            cluster_ip_base: Ipv4Addr::new(10, 10, 0, 0),
            cluster_mac_base: MacAddr::new(0x0202_c0a8_0000),
        }
    }
}

fn ip_offset(base: Ipv4Addr, n: u32) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(base).wrapping_add(n))
}

/// X engine host wired to cluster link `link` of F engine `fid`.
pub fn peer_hostname(fid: u32, link: u32) -> String {
    format!("px{}-{}", u64::from(fid) + 1, u64::from(link) + 2)
}

impl AddressPlan {
    /// Addresses of one link of F engine `fid`.
    pub fn derive_identity(&self, fid: u32, link: u32) -> LinkIdentity {
        let sw = SWITCH_OFFSET
            .wrapping_add(SWITCH_LINK_STRIDE.wrapping_mul(link))
            .wrapping_add(fid);
        let cl = CLUSTER_OFFSET
            .wrapping_add(CLUSTER_LINK_STRIDE.wrapping_mul(link))
            .wrapping_add(fid)
            .wrapping_add(1);

        LinkIdentity {
            link,
            switch: Interface {
                ip: ip_offset(self.switch_ip_base, sw),
                mac: self.switch_mac_base.offset(u64::from(sw)),
            },
            cluster: Interface {
                ip: ip_offset(self.cluster_ip_base, cl),
                mac: self.cluster_mac_base.offset(u64::from(cl)),
            },
            peer_hostname: peer_hostname(fid, link),
        }
    }

    /// All [`LINKS_PER_NODE`] links of F engine `fid`.
    pub fn node_identity(&self, fid: u32) -> NodeIdentity {
        NodeIdentity {
            fid,
            links: (0..LINKS_PER_NODE).map(|link| self.derive_identity(fid, link)).collect(),
        }
    }

    /// ARP table pushed to every switch-facing core.
    pub fn switch_arp_table(&self) -> ArpTable {
        ArpTable::build(self.switch_mac_base, ARP_TABLE_SIZE)
    }
}

/// Static ARP table, indexed by the low byte of the destination IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpTable {
    entries: Vec<MacAddr>,
}

impl ArpTable {
    /// Entry `i` maps to `mac_base + i/2`: switch ports come in pairs.
    pub fn build(mac_base: MacAddr, size: usize) -> Self {
        let entries = (0..size as u64).map(|i| mac_base.offset(i / 2)).collect();
        Self { entries }
    }

    pub fn entries(&self) -> &[MacAddr] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Core memory image: one 8-byte big-endian slot per entry.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * 8);
        for mac in &self.entries {
            for word in mac.to_words() {
                out.extend_from_slice(&word.to_be_bytes());
            }
        }
        out
    }
}
