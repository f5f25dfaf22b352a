// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License in the LICENSE file at the
// root of this repository, or online at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Tracing utilities.
//!
//! The key export is the **[`configure`]** function, which configures the
//! `tracing` crate with sensible defaults and should be called during
//! initialization of every front-end binary.

use std::io::{self, IsTerminal};
use std::str::FromStr;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::filter::Targets;
use tracing_subscriber::fmt::format::{format, Writer};
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// Application tracing configuration.
///
/// See the [`configure`] function for details.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Configuration of the stderr log.
    pub stderr_log: StderrLogConfig,
}

/// Configures the stderr log.
#[derive(Debug, Clone)]
pub struct StderrLogConfig {
    /// An optional prefix for each stderr log line.
    pub prefix: Option<String>,
    /// A filter which determines which events are emitted to the log.
    pub filter: Targets,
}

impl TracingConfig {
    /// Builds a configuration from a filter directive string such as
    /// `info,vdb_proxy=debug`.
    pub fn from_filter(filter: &str, prefix: Option<String>) -> Result<Self, anyhow::Error> {
        let filter = Targets::from_str(filter)?;
        Ok(TracingConfig {
            stderr_log: StderrLogConfig { prefix, filter },
        })
    }
}

/// Enables application tracing via the [`tracing`] crate.
///
/// Events are written to stderr, filtered by the configured [`Targets`] and
/// optionally prefixed with a fixed string (useful when several processes
/// share one terminal). ANSI colors are used when stderr is a terminal.
///
/// Returns an error if a global subscriber was already installed.
pub fn configure(service_name: &str, config: TracingConfig) -> Result<(), anyhow::Error> {
    let stderr_log_layer = fmt::layer()
        .event_format(PrefixFormat {
            inner: format(),
            prefix: config.stderr_log.prefix,
        })
        .with_writer(io::stderr)
        .with_ansi(io::stderr().is_terminal())
        .with_filter(config.stderr_log.filter);

    tracing_subscriber::registry()
        .with(stderr_log_layer)
        .try_init()?;

    tracing::info!(service_name, "tracing configured");
    Ok(())
}

/// Returns the level of a specific target from a [`Targets`].
pub fn target_level(targets: &Targets, target: &str) -> Level {
    if targets.would_enable(target, &Level::TRACE) {
        Level::TRACE
    } else if targets.would_enable(target, &Level::DEBUG) {
        Level::DEBUG
    } else if targets.would_enable(target, &Level::INFO) {
        Level::INFO
    } else if targets.would_enable(target, &Level::WARN) {
        Level::WARN
    } else {
        Level::ERROR
    }
}

/// A wrapper around a [`FormatEvent`] that adds an optional prefix to each
/// event.
#[derive(Debug)]
pub struct PrefixFormat<F> {
    inner: F,
    prefix: Option<String>,
}

impl<F, C, N> FormatEvent<C, N> for PrefixFormat<F>
where
    C: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
    F: FormatEvent<C, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, C, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        if let Some(prefix) = &self.prefix {
            if writer.has_ansi_escapes() {
                write!(writer, "\x1b[1m{prefix}:\x1b[0m ")?;
            } else {
                write!(writer, "{prefix}: ")?;
            }
        }
        self.inner.format_event(ctx, writer, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_levels() {
        let config =
            TracingConfig::from_filter("warn,vdb_proxy=debug", None).expect("valid filter");
        let targets = &config.stderr_log.filter;
        assert_eq!(target_level(targets, "vdb_proxy"), Level::DEBUG);
        assert_eq!(target_level(targets, "vdb_proxy::scheduler"), Level::DEBUG);
        assert_eq!(target_level(targets, "hyper"), Level::WARN);
    }
}
