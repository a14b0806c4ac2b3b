//! Ban policy consulted when a peer first connects
//!
//! The ban list itself (editing, persistence) belongs to the admin layer.
//! The core only asks one question per connect attempt.

use std::net::IpAddr;

pub trait BanPolicy {
    fn is_banned(&self, addr: IpAddr) -> bool;
}

/// Policy that admits everyone
#[derive(Debug, Default, Clone, Copy)]
pub struct NoBans;

impl BanPolicy for NoBans {
    fn is_banned(&self, _addr: IpAddr) -> bool {
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanEntry {
    pub addr: IpAddr,
    /// Number of leading bits that must match
    pub prefix_len: u8,
    /// Exceptions re-admit addresses a broader ban would cover
    pub exception: bool,
}

impl BanEntry {
    pub fn matches(&self, addr: IpAddr) -> bool {
        match (self.addr, addr) {
            (IpAddr::V4(base), IpAddr::V4(ip)) => {
                prefix_eq(&base.octets(), &ip.octets(), self.prefix_len.min(32))
            }
            (IpAddr::V6(base), IpAddr::V6(ip)) => {
                prefix_eq(&base.octets(), &ip.octets(), self.prefix_len.min(128))
            }
            _ => false,
        }
    }
}

fn prefix_eq(a: &[u8], b: &[u8], bits: u8) -> bool {
    let full = (bits / 8) as usize;
    if a[..full] != b[..full] {
        return false;
    }
    let rest = bits % 8;
    if rest == 0 {
        return true;
    }
    let mask = 0xFFu8 << (8 - rest);
    a[full] & mask == b[full] & mask
}

/// In-memory ban list where any matching exception wins over any matching ban
#[derive(Debug, Default, Clone)]
pub struct BanList {
    entries: Vec<BanEntry>,
}

impl BanList {
    pub fn new(entries: Vec<BanEntry>) -> Self {
        Self { entries }
    }

    pub fn ban(&mut self, addr: IpAddr, prefix_len: u8) {
        self.entries.push(BanEntry {
            addr,
            prefix_len,
            exception: false,
        });
    }

    pub fn except(&mut self, addr: IpAddr, prefix_len: u8) {
        self.entries.push(BanEntry {
            addr,
            prefix_len,
            exception: true,
        });
    }
}

impl BanPolicy for BanList {
    fn is_banned(&self, addr: IpAddr) -> bool {
        let mut banned = false;
        for entry in self.entries.iter().filter(|e| e.matches(addr)) {
            if entry.exception {
                return false;
            }
            banned = true;
        }
        banned
    }
}
