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

//! Process exit: OS signals, component failures and the exit code they map
//! to.

use std::io;
use std::process::ExitCode;
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info};

/// Why the pool is stopping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownReason {
    None,
    /// ctrl-c, SIGTERM or SIGHUP
    Signal,
    /// A component failed, or signals could not be watched
    Error,
}

impl ShutdownReason {
    /// Only a requested stop counts as success for service runners.
    pub fn exit_code(self) -> ExitCode {
        match self {
            ShutdownReason::Signal => ExitCode::SUCCESS,
            ShutdownReason::None | ShutdownReason::Error => ExitCode::FAILURE,
        }
    }
}

/// Name of the first stop signal the process receives.
#[cfg(unix)]
async fn next_stop_signal() -> io::Result<&'static str> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => interrupted.map(|_| "SIGINT"),
        _ = hangup.recv() => Ok("SIGHUP"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn next_stop_signal() -> io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|_| "ctrl-c")
}

/// Publish [`ShutdownReason::Signal`] on the first stop signal. The task
/// ends early once anything else publishes a reason.
pub fn setup_signal_handler(exit_sender: watch::Sender<ShutdownReason>) -> JoinHandle<()> {
    let mut exit_receiver = exit_sender.subscribe();
    tokio::spawn(async move {
        let reason = tokio::select! {
            _ = exit_receiver.changed() => return,
            received = next_stop_signal() => match received {
                Ok(name) => {
                    info!("Received {name}, stopping pool");
                    ShutdownReason::Signal
                }
                Err(e) => {
                    error!("Failed to listen for stop signals: {e}");
                    ShutdownReason::Error
                }
            },
        };
        let _ = exit_sender.send(reason);
    })
}

/// Wait until some reason to stop is published. A closed channel means
/// every publisher is gone, which is treated as a failure.
pub async fn wait_for_exit(exit_receiver: &mut watch::Receiver<ShutdownReason>) -> ShutdownReason {
    loop {
        let reason = *exit_receiver.borrow_and_update();
        if reason != ShutdownReason::None {
            return reason;
        }
        if exit_receiver.changed().await.is_err() {
            error!("Shutdown channel closed");
            return ShutdownReason::Error;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_handler_exits_when_another_reason_is_published() {
        let exit_sender = watch::Sender::new(ShutdownReason::None);
        let handle = setup_signal_handler(exit_sender.clone());

        tokio::time::sleep(Duration::from_millis(10)).await;
        exit_sender.send(ShutdownReason::Error).unwrap();

        let result = tokio::time::timeout(Duration::from_millis(100), handle).await;
        assert!(result.is_ok());
        assert_eq!(*exit_sender.borrow(), ShutdownReason::Error);
    }

    #[tokio::test]
    async fn test_wait_for_exit_returns_reason_already_set() {
        let exit_sender = watch::Sender::new(ShutdownReason::Signal);
        let mut exit_receiver = exit_sender.subscribe();
        assert_eq!(wait_for_exit(&mut exit_receiver).await, ShutdownReason::Signal);
    }

    #[tokio::test]
    async fn test_wait_for_exit_waits_for_a_reason() {
        let exit_sender = watch::Sender::new(ShutdownReason::None);
        let mut exit_receiver = exit_sender.subscribe();
        let waiter = tokio::spawn(async move { wait_for_exit(&mut exit_receiver).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        exit_sender.send(ShutdownReason::Error).unwrap();
        assert_eq!(waiter.await.unwrap(), ShutdownReason::Error);
    }

    #[tokio::test]
    async fn test_wait_for_exit_treats_closed_channel_as_error() {
        let (exit_sender, mut exit_receiver) = watch::channel(ShutdownReason::None);
        drop(exit_sender);
        assert_eq!(wait_for_exit(&mut exit_receiver).await, ShutdownReason::Error);
    }

    #[test]
    fn test_only_signals_exit_successfully() {
        assert_eq!(ShutdownReason::Signal.exit_code(), ExitCode::SUCCESS);
        assert_eq!(ShutdownReason::Error.exit_code(), ExitCode::FAILURE);
        assert_eq!(ShutdownReason::None.exit_code(), ExitCode::FAILURE);
    }
}
