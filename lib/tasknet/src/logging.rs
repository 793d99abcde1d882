// SPDX-FileCopyrightText: Copyright (c) 2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Process-wide logging for task network peers.
//!
//! - Configuration loaded from:
//!   1. Environment variables (highest priority).
//!   2. Optional TOML file pointed to by the `TASKNET_LOGGING_CONFIG_PATH` environment variable.
//!   3. `/opt/fleet/etc/logging.toml`.
//!
//! Output is either compact human-readable lines or JSONL. JSONL is enabled by setting
//! `TASKNET_LOGGING_JSONL=1`. Set `TASKNET_LOG_USE_LOCAL_TZ=1` to stamp lines in local time.
//!
//! Filters come from the `TASKNET_LOG` environment variable or the `log_filters` table of the
//! TOML file, as comma-separated `target=level` pairs. The default level is `info`.
//!
//! Example:
//! ```toml
//! log_level = "warn"
//!
//! [log_filters]
//! "fleet_tasknet::upstream" = "debug"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Once;

use figment::{
    Figment,
    providers::{Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use tracing::{Event, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::fmt::{self, FmtContext, FormatEvent, FormatFields, format::Writer, time::FormatTime};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;

/// ENV used to set the log filter
const FILTER_ENV: &str = "TASKNET_LOG";

const DEFAULT_FILTER_LEVEL: &str = "info";

/// ENV used to set the path to the logging configuration file
const CONFIG_PATH_ENV: &str = "TASKNET_LOGGING_CONFIG_PATH";

const SYSTEM_CONFIG_PATH: &str = "/opt/fleet/etc/logging.toml";

const JSONL_ENV: &str = "TASKNET_LOGGING_JSONL";
const LOCAL_TZ_ENV: &str = "TASKNET_LOG_USE_LOCAL_TZ";

static INIT: Once = Once::new();

#[derive(Serialize, Deserialize, Debug, PartialEq)]
struct LoggingConfig {
    log_level: String,
    log_filters: HashMap<String, String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            log_level: DEFAULT_FILTER_LEVEL.to_string(),
            log_filters: HashMap::from([
                ("h2".to_string(), "error".to_string()),
                ("tower".to_string(), "error".to_string()),
                ("hyper_util".to_string(), "error".to_string()),
                ("tonic".to_string(), "error".to_string()),
            ]),
        }
    }
}

/// Initialize the logger. Later calls are no-ops.
pub fn init() {
    INIT.call_once(setup_logging);
}

fn env_is_truthy(key: &str) -> bool {
    std::env::var(key)
        .map(|value| matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "on" | "yes"))
        .unwrap_or(false)
}

fn setup_logging() {
    let filter_layer = filters(load_config());
    // each builder method returns a distinct type, so the two layers are spelled out in full
    if env_is_truthy(JSONL_ENV) {
        let l = fmt::layer()
            .with_ansi(false)
            .event_format(JsonFormatter::new())
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        // another subscriber may already be installed, e.g. by a test harness
        let _ = tracing_subscriber::registry().with(l).try_init();
    } else {
        let l = fmt::layer()
            .event_format(fmt::format().compact().with_timer(TimeFormatter::new()))
            .with_writer(std::io::stderr)
            .with_filter(filter_layer);
        let _ = tracing_subscriber::registry().with(l).try_init();
    }
}

fn filters(config: LoggingConfig) -> EnvFilter {
    let default_directive = config
        .log_level
        .parse::<Directive>()
        .unwrap_or_else(|_| LevelFilter::INFO.into());
    let mut filter_layer = EnvFilter::builder()
        .with_default_directive(default_directive)
        .with_env_var(FILTER_ENV)
        .from_env_lossy();

    for (module, level) in config.log_filters {
        match format!("{module}={level}").parse::<Directive>() {
            Ok(d) => {
                filter_layer = filter_layer.add_directive(d);
            }
            Err(e) => {
                eprintln!("Failed parsing filter '{level}' for module '{module}': {e}");
            }
        }
    }
    filter_layer
}

fn load_config() -> LoggingConfig {
    let config_path = std::env::var(CONFIG_PATH_ENV).unwrap_or_default();
    let figment = Figment::new()
        .merge(Serialized::defaults(LoggingConfig::default()))
        .merge(Toml::file(SYSTEM_CONFIG_PATH))
        .merge(Toml::file(config_path));

    figment.extract().unwrap_or_else(|e| {
        eprintln!("Invalid logging configuration, using defaults: {e}");
        LoggingConfig::default()
    })
}

struct TimeFormatter {
    use_local_tz: bool,
}

impl TimeFormatter {
    fn new() -> Self {
        Self {
            use_local_tz: env_is_truthy(LOCAL_TZ_ENV),
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
struct JsonLog<'a> {
    time: String,
    level: String,
    target: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    span_name: Option<&'a str>,
    message: serde_json::Value,
    #[serde(flatten)]
    fields: BTreeMap<String, serde_json::Value>,
}

struct JsonFormatter {
    time_formatter: TimeFormatter,
}

impl JsonFormatter {
    fn new() -> Self {
        Self {
            time_formatter: TimeFormatter::new(),
        }
    }
}

impl<S, N> FormatEvent<S, N> for JsonFormatter
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
            .unwrap_or(serde_json::Value::String(String::new()));

        let span_name = event
            .parent()
            .and_then(|id| ctx.span(id))
            .or_else(|| ctx.lookup_current())
            .map(|span| span.name());

        let metadata = event.metadata();
        let log = JsonLog {
            time: self.time_formatter.format_now(),
            level: metadata.level().to_string(),
            target: metadata.target(),
            span_name,
            message,
            fields: visitor.fields,
        };
        let json = serde_json::to_string(&log).map_err(|_| std::fmt::Error)?;
        writeln!(writer, "{json}")
    }
}

#[derive(Default)]
struct JsonVisitor {
    // sorted so lines always print fields in the same order
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
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::Number(value.into()),
        );
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::Number(value.into()),
        );
    }
}
