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


use crate::config::LoggingConfig;
use std::error::Error;
use std::path::Path;
use tracing::info;
use tracing_appender::non_blocking;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{EnvFilter, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILE: &str = "nimpool.log";

/// Installs the global subscriber. RUST_LOG takes precedence over the
/// configured level. The returned guard flushes the file writer on drop and
/// must be held for the lifetime of the process.
pub fn setup_logging(logging_config: &LoggingConfig) -> Result<Option<WorkerGuard>, Box<dyn Error>> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging_config.level));

    let console_layer = logging_config.console.unwrap_or(true).then(fmt::layer);

    let (file_layer, guard) = match &logging_config.file {
        Some(file_path) => {
            let file_path = Path::new(file_path);
            let directory = file_path.parent().unwrap_or_else(|| Path::new("."));
            std::fs::create_dir_all(directory)?;
            let filename = file_path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or(DEFAULT_LOG_FILE);

            let appender = RollingFileAppender::new(Rotation::DAILY, directory, filename);
            let (writer, guard) = non_blocking(appender);
            let layer = fmt::layer().with_writer(writer).with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    Registry::default()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if let Some(file) = &logging_config.file {
        info!("Logging to file {file}");
    }
    Ok(guard)
}
