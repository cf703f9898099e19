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
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The timers an agent runs. At most one of each kind is armed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    RecalcDifficulty,
    ConnectionTimeout,
    SendBalance,
    KeepAlive,
}

/// One firing of a timer, stamped with the arming that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerFired {
    pub kind: TimerKind,
    generation: u64,
}

/// Table of named timers feeding one channel.
///
/// Each armed timer is a spawned task that sends its kind when it fires.
/// Arming a kind again aborts the previous task, so a reset timeout never
/// fires twice. A firing already queued when its timer was reset or cleared
/// is refused by [`Timers::accept`]. Dropping the table aborts everything.
pub struct Timers {
    timer_tx: mpsc::Sender<TimerFired>,
    handles: HashMap<TimerKind, (u64, JoinHandle<()>)>,
    next_generation: u64,
}

impl Timers {
    pub fn new(timer_tx: mpsc::Sender<TimerFired>) -> Self {
        Self {
            timer_tx,
            handles: HashMap::new(),
            next_generation: 0,
        }
    }

    /// Fire `kind` once after `delay`.
    pub fn reset_timeout(&mut self, kind: TimerKind, delay: Duration) {
        let timer_tx = self.timer_tx.clone();
        let fired = self.arm(kind);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timer_tx.send(fired).await;
        });
        self.replace(fired, handle);
    }

    /// Fire `kind` every `period`, first after one full period.
    pub fn reset_interval(&mut self, kind: TimerKind, period: Duration) {
        let timer_tx = self.timer_tx.clone();
        let fired = self.arm(kind);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if timer_tx.send(fired).await.is_err() {
                    break;
                }
            }
        });
        self.replace(fired, handle);
    }

    pub fn clear(&mut self, kind: TimerKind) {
        if let Some((_, handle)) = self.handles.remove(&kind) {
            handle.abort();
        }
    }

    pub fn clear_all(&mut self) {
        for (_, (_, handle)) in self.handles.drain() {
            handle.abort();
        }
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.handles
            .get(&kind)
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// The kind to act on, or None when the firing belongs to an arming
    /// that has since been reset or cleared.
    pub fn accept(&self, fired: TimerFired) -> Option<TimerKind> {
        match self.handles.get(&fired.kind) {
            Some((generation, _)) if *generation == fired.generation => Some(fired.kind),
            _ => None,
        }
    }

    fn arm(&mut self, kind: TimerKind) -> TimerFired {
        self.next_generation += 1;
        TimerFired {
            kind,
            generation: self.next_generation,
        }
    }

    fn replace(&mut self, fired: TimerFired, handle: JoinHandle<()>) {
        if let Some((_, previous)) = self.handles.insert(fired.kind, (fired.generation, handle)) {
            previous.abort();
        }
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.clear_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_fires_once() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.reset_timeout(TimerKind::ConnectionTimeout, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(rx.try_recv().unwrap().kind, TimerKind::ConnectionTimeout);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_timeout_postpones() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.reset_timeout(TimerKind::ConnectionTimeout, Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(6)).await;
        timers.reset_timeout(TimerKind::ConnectionTimeout, Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(rx.try_recv().is_err());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(rx.try_recv().unwrap().kind, TimerKind::ConnectionTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_repeats_until_cleared() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.reset_interval(TimerKind::KeepAlive, Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(31)).await;
        let mut fired = 0;
        while let Ok(fired) = rx.try_recv() {
            assert_eq!(timers.accept(fired), Some(TimerKind::KeepAlive));
            fired += 1;
        }
        assert_eq!(fired, 3);

        timers.clear(TimerKind::KeepAlive);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts_all_timers() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.reset_timeout(TimerKind::RecalcDifficulty, Duration::from_secs(1));
        timers.reset_interval(TimerKind::SendBalance, Duration::from_secs(1));
        assert!(timers.is_armed(TimerKind::RecalcDifficulty));
        drop(timers);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_firing_queued_before_reset_is_refused() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.reset_timeout(TimerKind::RecalcDifficulty, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(2)).await;

        // Fired and queued, then the timer is re-armed before the firing is read
        timers.reset_timeout(TimerKind::RecalcDifficulty, Duration::from_secs(60));
        let stale = rx.try_recv().unwrap();
        assert_eq!(stale.kind, TimerKind::RecalcDifficulty);
        assert_eq!(timers.accept(stale), None);

        tokio::time::sleep(Duration::from_secs(61)).await;
        let fresh = rx.try_recv().unwrap();
        assert_eq!(timers.accept(fresh), Some(TimerKind::RecalcDifficulty));
    }

    #[tokio::test(start_paused = true)]
    async fn test_firing_queued_before_clear_is_refused() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = Timers::new(tx);
        timers.reset_timeout(TimerKind::ConnectionTimeout, Duration::from_secs(1));
        tokio::time::sleep(Duration::from_secs(2)).await;

        timers.clear(TimerKind::ConnectionTimeout);
        let stale = rx.try_recv().unwrap();
        assert_eq!(timers.accept(stale), None);
    }
}
