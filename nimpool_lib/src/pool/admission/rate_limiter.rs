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

use super::ban_list::IpKey;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;

/// Timestamps of recent connection attempts.
/// Only reachable through [`ConnectionLimiter`], which lives under the
/// admission lock.
#[derive(Debug, Default)]
struct RecentCounter {
    timestamps: VecDeque<Instant>,
}

impl RecentCounter {
    fn prune(&mut self, window: Duration, now: Instant) {
        while let Some(front) = self.timestamps.front() {
            if now.duration_since(*front) >= window {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn increment(&mut self, window: Duration, now: Instant) {
        self.prune(window, now);
        self.timestamps.push_back(now);
    }

    fn count(&mut self, window: Duration, now: Instant) -> usize {
        self.prune(window, now);
        self.timestamps.len()
    }
}

#[derive(Debug, Default)]
struct IpUsage {
    open: u32,
    recent: RecentCounter,
}

/// Why a connection was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitExceeded {
    Concurrent,
    Rate,
}

/// Per-IP concurrent connection count plus a rolling window of recent
/// connection attempts.
#[derive(Debug)]
pub struct ConnectionLimiter {
    usage: HashMap<IpKey, IpUsage>,
    max_open: u32,
    max_per_window: u32,
    window: Duration,
}

impl ConnectionLimiter {
    pub fn new(max_open: u32, max_per_window: u32, window: Duration) -> Self {
        Self {
            usage: HashMap::new(),
            max_open,
            max_per_window,
            window,
        }
    }

    /// Account a new connection if both limits allow it.
    pub fn try_acquire(&mut self, key: IpKey, now: Instant) -> Result<(), LimitExceeded> {
        let usage = self.usage.entry(key).or_default();
        if usage.open >= self.max_open {
            return Err(LimitExceeded::Concurrent);
        }
        if usage.recent.count(self.window, now) >= self.max_per_window as usize {
            return Err(LimitExceeded::Rate);
        }
        usage.open += 1;
        usage.recent.increment(self.window, now);
        Ok(())
    }

    pub fn release(&mut self, key: IpKey) {
        if let Some(usage) = self.usage.get_mut(&key) {
            usage.open = usage.open.saturating_sub(1);
        }
    }

    pub fn open_connections(&self, key: IpKey) -> u32 {
        self.usage.get(&key).map(|usage| usage.open).unwrap_or(0)
    }

    /// Forget addresses with no open connections and no recent attempts.
    pub fn sweep(&mut self, now: Instant) {
        let window = self.window;
        self.usage.retain(|_, usage| {
            usage.recent.prune(window, now);
            usage.open > 0 || !usage.recent.timestamps.is_empty()
        });
    }

    pub fn tracked(&self) -> usize {
        self.usage.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn key(last: u8) -> IpKey {
        IpKey::V4(Ipv4Addr::new(203, 0, 113, last))
    }

    #[test]
    fn test_concurrent_limit() {
        let mut limiter = ConnectionLimiter::new(2, 100, Duration::from_secs(60));
        let now = Instant::now();
        assert!(limiter.try_acquire(key(1), now).is_ok());
        assert!(limiter.try_acquire(key(1), now).is_ok());
        assert_eq!(limiter.try_acquire(key(1), now), Err(LimitExceeded::Concurrent));
        // Other addresses are unaffected
        assert!(limiter.try_acquire(key(2), now).is_ok());

        limiter.release(key(1));
        assert_eq!(limiter.open_connections(key(1)), 1);
        assert!(limiter.try_acquire(key(1), now).is_ok());
    }

    #[test]
    fn test_rate_limit_uses_rolling_window() {
        let mut limiter = ConnectionLimiter::new(100, 3, Duration::from_secs(60));
        let start = Instant::now();
        for i in 0..3 {
            assert!(limiter.try_acquire(key(1), start + Duration::from_secs(i)).is_ok());
            limiter.release(key(1));
        }
        assert_eq!(
            limiter.try_acquire(key(1), start + Duration::from_secs(30)),
            Err(LimitExceeded::Rate)
        );
        // The first attempt has left the window
        assert!(limiter.try_acquire(key(1), start + Duration::from_secs(60)).is_ok());
    }

    #[test]
    fn test_sweep_forgets_idle_addresses() {
        let mut limiter = ConnectionLimiter::new(10, 10, Duration::from_secs(60));
        let now = Instant::now();
        limiter.try_acquire(key(1), now).unwrap();
        limiter.try_acquire(key(2), now).unwrap();
        limiter.release(key(2));

        limiter.sweep(now + Duration::from_secs(120));
        assert_eq!(limiter.tracked(), 1);
        assert_eq!(limiter.open_connections(key(1)), 1);
    }
}
