// Copyright (C) 2024, 2025 NimPool Developers (see AUTHORS)
//
// This file is part of NimPool
//
// NimPool is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// NimPool is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// NimPool. If not, see <https://www.gnu.org/licenses/>.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;
use tokio::time::Instant;

/// Key bans and per-IP counters are tracked under. IPv6 hosts usually own a
/// whole /64, so the prefix is what gets banned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpKey {
    V4(Ipv4Addr),
    V6Prefix([u8; 8]),
}

impl From<IpAddr> for IpKey {
    fn from(ip: IpAddr) -> Self {
        match normalize(ip) {
            IpAddr::V4(v4) => IpKey::V4(v4),
            IpAddr::V6(v6) => {
                let mut prefix = [0u8; 8];
                prefix.copy_from_slice(&v6.octets()[..8]);
                IpKey::V6Prefix(prefix)
            }
        }
    }
}

/// IPv4-mapped IPv6 addresses are treated as the IPv4 address they carry.
pub fn normalize(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        },
        v4 => v4,
    }
}

/// Private, loopback, link-local and unique-local addresses are never
/// banned or limited.
pub fn is_exempt(ip: IpAddr) -> bool {
    match normalize(ip) {
        IpAddr::V4(v4) => {
            v4.is_private() || v4.is_loopback() || v4.is_link_local() || v4.is_unspecified()
        }
        IpAddr::V6(v6) => is_local_v6(&v6),
    }
}

fn is_local_v6(v6: &Ipv6Addr) -> bool {
    let first = v6.segments()[0];
    v6.is_loopback() || v6.is_unspecified() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
}

/// Temporarily banned addresses with their expiry.
#[derive(Debug, Default)]
pub struct BanList {
    bans: HashMap<IpKey, Instant>,
}

impl BanList {
    /// Returns false for exempt addresses, which are never banned.
    pub fn ban(&mut self, ip: IpAddr, ban_time: Duration, now: Instant) -> bool {
        if is_exempt(ip) {
            return false;
        }
        self.bans.insert(IpKey::from(ip), now + ban_time);
        true
    }

    /// Expired bans still count until the next sweep.
    pub fn is_banned(&self, ip: IpAddr) -> bool {
        !is_exempt(ip) && self.bans.contains_key(&IpKey::from(ip))
    }

    /// Drop expired bans, returning how many were lifted.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.bans.len();
        self.bans.retain(|_, expiry| *expiry >= now);
        before - self.bans.len()
    }

    pub fn len(&self) -> usize {
        self.bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bans.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_ipv6_bans_whole_prefix() {
        let mut bans = BanList::default();
        let now = Instant::now();
        assert!(bans.ban(ip("2001:db8:1:2::5"), Duration::from_secs(600), now));
        assert!(bans.is_banned(ip("2001:db8:1:2:ffff::1")));
        assert!(!bans.is_banned(ip("2001:db8:1:3::5")));
    }

    #[test]
    fn test_mapped_ipv4_is_the_same_host() {
        let mut bans = BanList::default();
        let now = Instant::now();
        bans.ban(ip("::ffff:203.0.113.9"), Duration::from_secs(600), now);
        assert!(bans.is_banned(ip("203.0.113.9")));
        assert_eq!(IpKey::from(ip("::ffff:203.0.113.9")), IpKey::from(ip("203.0.113.9")));
    }

    #[test]
    fn test_private_addresses_are_never_banned() {
        let mut bans = BanList::default();
        let now = Instant::now();
        for addr in ["127.0.0.1", "10.1.2.3", "192.168.0.4", "169.254.1.1", "::1", "fd00::1", "fe80::1"] {
            assert!(!bans.ban(ip(addr), Duration::from_secs(600), now), "{addr}");
            assert!(!bans.is_banned(ip(addr)));
        }
        assert!(bans.is_empty());
    }

    #[test]
    fn test_sweep_lifts_expired_bans() {
        let mut bans = BanList::default();
        let now = Instant::now();
        bans.ban(ip("203.0.113.1"), Duration::from_secs(60), now);
        bans.ban(ip("203.0.113.2"), Duration::from_secs(600), now);

        assert_eq!(bans.sweep(now + Duration::from_secs(30)), 0);
        assert_eq!(bans.sweep(now + Duration::from_secs(61)), 1);
        assert!(!bans.is_banned(ip("203.0.113.1")));
        assert!(bans.is_banned(ip("203.0.113.2")));
        assert_eq!(bans.len(), 1);
    }
}
