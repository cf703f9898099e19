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


/// Column families strings defined in one place for type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnFamily {
    User,
    UserIndex,
    Block,
    BlockIndex,
    Share,
    ShareIndex,
    Payin,
    UserPayin,
    Payout,
    UserPayout,
    PayoutRequest,
    PoolFee,
    Metadata,
}

impl ColumnFamily {
    pub const ALL: [ColumnFamily; 13] = [
        ColumnFamily::User,
        ColumnFamily::UserIndex,
        ColumnFamily::Block,
        ColumnFamily::BlockIndex,
        ColumnFamily::Share,
        ColumnFamily::ShareIndex,
        ColumnFamily::Payin,
        ColumnFamily::UserPayin,
        ColumnFamily::Payout,
        ColumnFamily::UserPayout,
        ColumnFamily::PayoutRequest,
        ColumnFamily::PoolFee,
        ColumnFamily::Metadata,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnFamily::User => "user",
            ColumnFamily::UserIndex => "user_index",
            ColumnFamily::Block => "block",
            ColumnFamily::BlockIndex => "block_index",
            ColumnFamily::Share => "share",
            ColumnFamily::ShareIndex => "share_index",
            ColumnFamily::Payin => "payin",
            ColumnFamily::UserPayin => "user_payin",
            ColumnFamily::Payout => "payout",
            ColumnFamily::UserPayout => "user_payout",
            ColumnFamily::PayoutRequest => "payout_request",
            ColumnFamily::PoolFee => "pool_fee",
            ColumnFamily::Metadata => "metadata",
        }
    }
}

impl std::ops::Deref for ColumnFamily {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.as_str()
    }
}

impl AsRef<str> for ColumnFamily {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl From<ColumnFamily> for String {
    fn from(val: ColumnFamily) -> Self {
        val.as_str().to_string()
    }
}
