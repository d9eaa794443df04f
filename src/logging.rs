// Copyright 2026 Ragkit Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Diagnostic logging to stderr, and optionally to a log file.
//!
//! ```toml
//! [logging]
//! level = "info"
//! file = "output/ragkit.log"
//!
//! [logging.modules]
//! "ragkit::generate" = "debug"
//! ```
//!
//! `RUST_LOG` takes precedence over the file settings.

use std::fs::OpenOptions;
use std::sync::Mutex;
use std::sync::Once;

use time::OffsetDateTime;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

static INIT: Once = Once::new();

/// `HH:MM:SS.mmm` in UTC.
struct CompactTime;

impl FormatTime for CompactTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let now = OffsetDateTime::now_utc();
        write!(
            w,
            "{:02}:{:02}:{:02}.{:03}",
            now.hour(),
            now.minute(),
            now.second(),
            now.millisecond()
        )
    }
}

fn filter_directives(config: &LoggingConfig) -> String {
    let mut directives = config.level.clone();
    for (module, level) in &config.modules {
        directives.push_str(&format!(",{module}={level}"));
    }
    directives
}

fn build_filter(config: &LoggingConfig) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new(filter_directives(config))
    }
}

/// Installs the global subscriber. Only the first call has an effect.
pub fn init(config: &LoggingConfig) {
    INIT.call_once(|| {
        let stderr_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_timer(CompactTime)
            .with_filter(build_filter(config));

        let file_layer = config.file.as_ref().and_then(|path| {
            if let Some(parent) = path.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            let file = OpenOptions::new().create(true).append(true).open(path);
            match file {
                Ok(file) => Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(Mutex::new(file))
                        .with_ansi(false)
                        .with_target(true)
                        .with_timer(CompactTime)
                        .with_filter(build_filter(config)),
                ),
                Err(err) => {
                    eprintln!("warning: cannot open log file {}: {err}", path.display());
                    None
                }
            }
        });

        let _ = tracing_subscriber::registry()
            .with(stderr_layer)
            .with(file_layer)
            .try_init();
    });
}
