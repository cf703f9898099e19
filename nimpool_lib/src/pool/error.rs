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

use crate::chain::{ChainError, DecodeError};
use crate::store::StoreError;
use std::fmt;

/// Errors that end an agent session.
///
/// `Protocol` covers misbehaviour and bans the peer IP. `Terminate` closes
/// the connection quietly.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentError {
    Protocol(String),
    Terminate(String),
}

impl AgentError {
    pub fn is_ban(&self) -> bool {
        matches!(self, AgentError::Protocol(_))
    }
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Protocol(reason) => write!(f, "Protocol violation: {reason}"),
            AgentError::Terminate(reason) => write!(f, "Connection terminated: {reason}"),
        }
    }
}

impl std::error::Error for AgentError {}

impl From<DecodeError> for AgentError {
    fn from(e: DecodeError) -> Self {
        AgentError::Protocol(format!("undecodable payload: {e}"))
    }
}

impl From<StoreError> for AgentError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::DuplicateShare => {
                AgentError::Protocol("client submitted share twice".to_string())
            }
            other => AgentError::Terminate(format!("store failure: {other}")),
        }
    }
}

impl From<ChainError> for AgentError {
    fn from(e: ChainError) -> Self {
        AgentError::Terminate(format!("node failure: {e}"))
    }
}

/// Reasons a share is turned down without ending the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareRejection {
    MinerAddressMismatch,
    ExtraDataMismatch,
    BadTimestamp,
    InvalidPow,
    WrongBodyHash,
    WrongAccountsHash,
    BadInterlink,
    BadPrev,
    /// A successor of the parent block is already known.
    ShareExpired,
    /// No job has been pushed to this agent yet.
    NoWork,
}

impl ShareRejection {
    /// Expired shares are reported but do not count against the error budget.
    pub fn counts_as_error(&self) -> bool {
        !matches!(self, ShareRejection::ShareExpired)
    }

    /// Text sent back in the `error` message.
    pub fn error_message(&self) -> String {
        match self {
            ShareRejection::ShareExpired => self.to_string(),
            _ => format!("invalid share: {self}"),
        }
    }
}

impl fmt::Display for ShareRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            ShareRejection::MinerAddressMismatch => "miner address mismatch",
            ShareRejection::ExtraDataMismatch => "extra data mismatch",
            ShareRejection::BadTimestamp => "bad timestamp",
            ShareRejection::InvalidPow => "invalid pow",
            ShareRejection::WrongBodyHash => "wrong body hash",
            ShareRejection::WrongAccountsHash => "wrong accounts hash",
            ShareRejection::BadInterlink => "bad interlink",
            ShareRejection::BadPrev => "bad prev",
            ShareRejection::ShareExpired => "share expired",
            ShareRejection::NoWork => "no work",
        };
        write!(f, "{reason}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_messages() {
        assert_eq!(
            ShareRejection::InvalidPow.error_message(),
            "invalid share: invalid pow"
        );
        assert_eq!(ShareRejection::ShareExpired.error_message(), "share expired");
        assert!(!ShareRejection::ShareExpired.counts_as_error());
        assert!(ShareRejection::BadPrev.counts_as_error());
    }

    #[test]
    fn test_duplicate_share_is_a_protocol_violation() {
        let err = AgentError::from(StoreError::DuplicateShare);
        assert!(err.is_ban());
        let err = AgentError::from(StoreError::ChannelClosed);
        assert!(!err.is_ban());
    }
}
