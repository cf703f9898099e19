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


use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall clock time, swappable in tests.
pub trait TimeProvider: Send + Sync {
    fn now(&self) -> SystemTime;

    fn millis_since_epoch(&self) -> u64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    fn seconds_since_epoch(&self) -> u64 {
        self.millis_since_epoch() / 1000
    }
}

#[derive(Clone, Debug, Default)]
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
#[derive(Clone, Debug)]
pub struct TestTimeProvider {
    time: Arc<Mutex<SystemTime>>,
}

impl TestTimeProvider {
    pub fn new(time: SystemTime) -> Self {
        Self {
            time: Arc::new(Mutex::new(time)),
        }
    }

    pub fn at_seconds(seconds: u64) -> Self {
        Self::new(UNIX_EPOCH + Duration::from_secs(seconds))
    }

    pub fn set_since_epoch(&self, seconds: u64) {
        *self.lock() = UNIX_EPOCH + Duration::from_secs(seconds);
    }

    pub fn advance(&self, by: Duration) {
        let mut time = self.lock();
        *time += by;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SystemTime> {
        self.time.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl TimeProvider for TestTimeProvider {
    fn now(&self) -> SystemTime {
        *self.lock()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_test_time_provider_is_shared_between_clones() {
        let provider = TestTimeProvider::at_seconds(1000);
        let clone = provider.clone();
        clone.advance(Duration::from_millis(1500));
        assert_eq!(provider.millis_since_epoch(), 1_001_500);
        assert_eq!(provider.seconds_since_epoch(), 1001);
        provider.set_since_epoch(5);
        assert_eq!(clone.seconds_since_epoch(), 5);
    }

    #[test]
    fn test_system_time_provider() {
        let provider = SystemTimeProvider;
        let diff = SystemTime::now().duration_since(provider.now()).unwrap();
        assert!(diff < Duration::from_secs(1));
        assert!(provider.seconds_since_epoch() > 1_600_000_000);
    }
}
