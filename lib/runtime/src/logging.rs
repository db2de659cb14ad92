// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide tracing setup for the generation fleet.
//!
//! Settings are read, highest priority first, from:
//!   1. the `GENFLEET_LOG` filter directive,
//!   2. the TOML file named by `GENFLEET_LOGGING_CONFIG_PATH`,
//!   3. `/opt/genfleet/etc/logging.toml`.
//!
//! Output is a compact human-readable line per event unless
//! `GENFLEET_LOGGING_JSONL` is truthy, in which case every event is a single
//! JSON object. Timestamps are UTC unless `GENFLEET_LOG_USE_LOCAL_TZ` is set.
//!
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "genfleet_llm::generation" = "debug"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Once;

use figment::{
    providers::{Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing::{Event, Subscriber};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::fmt::{self, format::Writer, time::FormatTime, FmtContext, FormatFields};
use tracing_subscriber::fmt::{FormatEvent, FormattedFields};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::{disable_ansi_logging, jsonl_logging_enabled, use_local_timezone};

/// ENV used to set the log filter
const FILTER_ENV: &str = "GENFLEET_LOG";

const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV naming an extra logging configuration file
const CONFIG_PATH_ENV: &str = "GENFLEET_LOGGING_CONFIG_PATH";

const SYSTEM_CONFIG_PATH: &str = "/opt/genfleet/etc/logging.toml";

static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::from([
                ("figment".to_string(), "error".to_string()),
                ("tokio_util".to_string(), "error".to_string()),
            ]),
        }
    }
}

/// Install the global subscriber. Calling this more than once is a no-op.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn setup_logging() {
    let filter = build_filter(load_config());
    let result = if jsonl_logging_enabled() {
        let layer = fmt::layer()
            .with_ansi(false)
            .event_format(JsonlFormatter::new())
            .with_writer(std::io::stderr)
            .with_filter(filter);
        tracing_subscriber::registry().with(layer).try_init()
    } else {
        let layer = fmt::layer()
            .with_ansi(!disable_ansi_logging())
            .event_format(fmt::format().compact().with_timer(TimeFormatter::new()))
            .with_writer(std::io::stderr)
            .with_filter(filter);
        tracing_subscriber::registry().with(layer).try_init()
    };
    if let Err(e) = result {
        // another subscriber already owns the process, e.g. a test harness
        eprintln!("genfleet logging not installed: {e}");
    }
}

fn build_filter(config: LoggingConfig) -> EnvFilter {
    let default_level = config
        .log_level
        .parse::<LevelFilter>()
        .unwrap_or_else(|e| {
            eprintln!("Invalid log_level '{}': {e}", config.log_level);
            LevelFilter::INFO
        });
    let mut filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => filter = filter.add_directive(d),
            Err(e) => eprintln!("Failed parsing filter '{level}' for module '{module}': {e}"),
        }
    }
    filter
}

fn load_config() -> LoggingConfig {
    let mut figment = Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file(SYSTEM_CONFIG_PATH));
    if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
        if !path.is_empty() {
            figment = figment.merge(Toml::file(path));
        }
    }
    figment.extract().unwrap_or_else(|e| {
        eprintln!("Failed loading logging configuration, using defaults: {e}");
        LoggingConfig::default()
    })
}

struct TimeFormatter {
    use_local_tz: bool,
}

impl TimeFormatter {
    fn new() -> Self {
        Self {
            use_local_tz: use_local_timezone(),
        }
    }

    fn format_now(&self) -> String {
        if self.use_local_tz {
            chrono::Local::now()
                .format("%Y-%m-%dT%H:%M:%S%.3f%:z")
                .to_string()
        } else {
            chrono::Utc::now()
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string()
        }
    }
}

impl FormatTime for TimeFormatter {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", self.format_now())
    }
}

#[derive(Serialize)]
struct JsonLine<'a> {
    time: String,
    level: String,
    target: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    span: Option<String>,
    message: serde_json::Value,
    #[serde(flatten)]
    fields: BTreeMap<String, serde_json::Value>,
}

struct JsonlFormatter {
    time_formatter: TimeFormatter,
}

impl JsonlFormatter {
    fn new() -> Self {
        Self {
            time_formatter: TimeFormatter::new(),
        }
    }
}

impl<S, N> FormatEvent<S, N> for JsonlFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = JsonVisitor::default();
        event.record(&mut visitor);
        let message = visitor
            .fields
            .remove("message")
            .unwrap_or_else(|| serde_json::Value::String(String::new()));

        let mut span_name = None;
        let current_span = event
            .parent()
            .and_then(|id| ctx.span(id))
            .or_else(|| ctx.lookup_current());
        if let Some(span) = current_span {
            let ext = span.extensions();
            if let Some(data) = ext.get::<FormattedFields<N>>() {
                for (name, value) in data
                    .fields
                    .split(' ')
                    .filter_map(|entry| entry.split_once('='))
                {
                    visitor.fields.insert(
                        name.to_string(),
                        serde_json::Value::String(value.trim_matches('"').to_string()),
                    );
                }
            }
            span_name = Some(span.name().to_string());
        }

        let metadata = event.metadata();
        let line = JsonLine {
            time: self.time_formatter.format_now(),
            level: metadata.level().to_string(),
            target: metadata.target(),
            span: span_name,
            message,
            fields: visitor.fields,
        };
        let json = serde_json::to_string(&line).map_err(|_| std::fmt::Error)?;
        writeln!(writer, "{json}")
    }
}

#[derive(Default)]
struct JsonVisitor {
    // sorted so output is stable
    fields: BTreeMap<String, serde_json::Value>,
}

impl tracing::field::Visit for JsonVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::String(format!("{value:?}")),
        );
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::String(value.to_string()),
        );
    }

    fn record_bool(&mut self, field: &tracing::field::Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }

    fn record_i64(&mut self, field: &tracing::field::Field, value: i64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::from(value));
    }

    fn record_f64(&mut self, field: &tracing::field::Field, value: f64) {
        // NaN and inf are not JSON numbers
        let number = serde_json::Number::from_f64(value).unwrap_or_else(|| 0.into());
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Number(number));
    }
}
