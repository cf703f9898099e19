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

//! Pool wide counters kept in memory and reported in the logs.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

const STATS_MESSAGE_BUFFER_SIZE: usize = 1000;

/// How often the hashrate is sampled.
pub const HASHRATE_SAMPLE_INTERVAL: Duration = Duration::from_secs(60);

/// Number of samples the reported hashrate averages over.
pub const HASHRATE_SAMPLES: usize = 10;

/// Hashes expected per unit of share difficulty.
const HASHES_PER_DIFFICULTY: Decimal = dec!(65536);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    pub blocks_mined: u64,
    pub shares_accepted: u64,
    pub total_share_difficulty: Decimal,
    /// Hashes per second, averaged over the recent samples
    pub hashrate: Decimal,
}

/// Messages that can be sent to the stats actor
#[derive(Debug)]
pub enum StatsMessage {
    RecordShare { difficulty: Decimal },
    RecordBlockMined,
    GetStats { response: oneshot::Sender<PoolStats> },
}

struct StatsActor {
    stats: PoolStats,
    difficulty_at_last_sample: Decimal,
    samples: VecDeque<Decimal>,
    sample_interval: Duration,
    receiver: mpsc::Receiver<StatsMessage>,
}

impl StatsActor {
    fn new(receiver: mpsc::Receiver<StatsMessage>, sample_interval: Duration) -> Self {
        Self {
            stats: PoolStats::default(),
            difficulty_at_last_sample: Decimal::ZERO,
            samples: VecDeque::with_capacity(HASHRATE_SAMPLES),
            sample_interval,
            receiver,
        }
    }

    async fn run(mut self) {
        let mut sampler = tokio::time::interval_at(
            tokio::time::Instant::now() + self.sample_interval,
            self.sample_interval,
        );
        loop {
            tokio::select! {
                msg = self.receiver.recv() => match msg {
                    Some(msg) => self.handle_message(msg),
                    None => break,
                },
                _ = sampler.tick() => self.sample_hashrate(),
            }
        }
    }

    fn handle_message(&mut self, msg: StatsMessage) {
        match msg {
            StatsMessage::RecordShare { difficulty } => {
                self.stats.shares_accepted += 1;
                self.stats.total_share_difficulty += difficulty;
            }
            StatsMessage::RecordBlockMined => {
                self.stats.blocks_mined += 1;
            }
            StatsMessage::GetStats { response } => {
                let _ = response.send(self.stats.clone());
            }
        }
    }

    /// Difficulty accepted since the last sample, converted to hashes per
    /// second and averaged with the previous samples.
    fn sample_hashrate(&mut self) {
        let seconds = Decimal::from(self.sample_interval.as_secs().max(1));
        let delta = self.stats.total_share_difficulty - self.difficulty_at_last_sample;
        self.difficulty_at_last_sample = self.stats.total_share_difficulty;

        if self.samples.len() == HASHRATE_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(delta / seconds * HASHES_PER_DIFFICULTY);

        let sum: Decimal = self.samples.iter().sum();
        self.stats.hashrate = (sum / Decimal::from(self.samples.len())).round_dp(2);
        debug!("Pool hashrate {} H/s", self.stats.hashrate);
    }
}

/// A handle to interact with the stats actor
#[derive(Clone)]
pub struct PoolStatsHandle {
    sender: mpsc::Sender<StatsMessage>,
}

impl PoolStatsHandle {
    pub async fn record_share(&self, difficulty: Decimal) {
        let _ = self
            .sender
            .send(StatsMessage::RecordShare { difficulty })
            .await;
    }

    pub async fn record_block_mined(&self) {
        let _ = self.sender.send(StatsMessage::RecordBlockMined).await;
    }

    /// None if the actor has stopped.
    pub async fn get_stats(&self) -> Option<PoolStats> {
        let (response, rx) = oneshot::channel();
        self.sender
            .send(StatsMessage::GetStats { response })
            .await
            .ok()?;
        rx.await.ok()
    }
}

pub fn start_pool_stats() -> PoolStatsHandle {
    start_pool_stats_with_interval(HASHRATE_SAMPLE_INTERVAL)
}

pub fn start_pool_stats_with_interval(sample_interval: Duration) -> PoolStatsHandle {
    let (sender, receiver) = mpsc::channel(STATS_MESSAGE_BUFFER_SIZE);
    tokio::spawn(StatsActor::new(receiver, sample_interval).run());
    PoolStatsHandle { sender }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hashrate_averages_last_samples() {
        let (_tx, rx) = mpsc::channel(1);
        let mut actor = StatsActor::new(rx, Duration::from_secs(60));

        actor.handle_message(StatsMessage::RecordShare {
            difficulty: dec!(60),
        });
        actor.sample_hashrate();
        // 60 difficulty over 60s is 1 difficulty per second
        assert_eq!(actor.stats.hashrate, dec!(65536));

        actor.sample_hashrate();
        assert_eq!(actor.stats.hashrate, dec!(32768));

        for _ in 0..HASHRATE_SAMPLES {
            actor.sample_hashrate();
        }
        assert_eq!(actor.stats.hashrate, Decimal::ZERO);
        assert_eq!(actor.samples.len(), HASHRATE_SAMPLES);
    }

    #[tokio::test]
    async fn test_handle_records_shares_and_blocks() {
        let handle = start_pool_stats();
        handle.record_share(dec!(2.5)).await;
        handle.record_share(dec!(1.5)).await;
        handle.record_block_mined().await;

        let stats = handle.get_stats().await.unwrap();
        assert_eq!(stats.shares_accepted, 2);
        assert_eq!(stats.total_share_difficulty, dec!(4));
        assert_eq!(stats.blocks_mined, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_samples_on_interval() {
        let handle = start_pool_stats_with_interval(Duration::from_secs(60));
        handle.record_share(dec!(120)).await;
        tokio::time::sleep(Duration::from_secs(61)).await;

        let stats = handle.get_stats().await.unwrap();
        assert_eq!(stats.hashrate, dec!(131072));
    }
}
