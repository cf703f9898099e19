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


pub mod admission;
pub mod agent;
pub mod connections;
pub mod difficulty_adjuster;
pub mod error;
pub mod extra_data;
pub mod head;
pub mod job;
pub mod messages;
pub mod server;
pub mod share_writer;
pub mod stats;
pub mod timers;

pub use server::start_pool_server;
