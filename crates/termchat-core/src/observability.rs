use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INIT: OnceCell<()> = OnceCell::new();

const DEFAULT_LOG_FILE: &str = "termchat.logs.jsonl";

/// Logging settings resolved from the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogSettings {
    pub enabled: bool,
    /// `EnvFilter` directive string.
    pub filter: String,
    /// JSONL output file; console on stderr when unset.
    pub json_path: Option<PathBuf>,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" | "enabled" => Some(true),
        "0" | "false" | "no" | "off" | "disabled" => Some(false),
        _ => None,
    }
}

impl LogSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = lookup("TERMCHAT_OBSERVABILITY")
            .map(|v| parse_bool(&v).unwrap_or(true))
            .unwrap_or(true);

        let filter = lookup("TERMCHAT_LOG_LEVEL")
            .filter(|v| tracing_subscriber::EnvFilter::try_new(v).is_ok())
            .or_else(|| lookup("RUST_LOG").filter(|v| !v.trim().is_empty()))
            .unwrap_or_else(|| {
                let debug = lookup("DEBUG").and_then(|v| parse_bool(&v)).unwrap_or(false);
                let level = if debug { "debug" } else { "warn" };
                level.to_string()
            });

        let json_path = lookup("TERMCHAT_JSON_LOG_PATH")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Self {
            enabled,
            filter,
            json_path,
        }
    }

    fn env_filter(&self) -> tracing_subscriber::EnvFilter {
        tracing_subscriber::EnvFilter::try_new(&self.filter)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    }
}

/// Installs the global subscriber once per process.
///
/// Environment variables:
/// - `TERMCHAT_OBSERVABILITY`: enable/disable flag (default enabled).
/// - `TERMCHAT_LOG_LEVEL`: filter override; then `RUST_LOG`; then `DEBUG=true`
///   selects `debug`; otherwise `warn`.
/// - `TERMCHAT_JSON_LOG_PATH`: write JSONL to this file instead of the
///   console. Console output goes to stderr; stdout carries the reply.
pub fn init_observability() {
    INIT.get_or_init(|| {
        let settings = LogSettings::from_env();
        if !settings.enabled {
            return;
        }

        let env_filter = settings.env_filter();
        if let Some(path) = settings.json_path.as_deref() {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                let _ = std::fs::create_dir_all(parent);
            }
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| Path::new("."));
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(DEFAULT_LOG_FILE);
            let writer = tracing_appender::rolling::never(dir, file_name);
            let json_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(true)
                .with_target(false)
                .with_writer(writer);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(json_layer)
                .try_init();
        } else {
            let console_layer = tracing_subscriber::fmt::layer()
                .compact()
                .with_target(false)
                .with_writer(std::io::stderr);
            let _ = tracing_subscriber::registry()
                .with(env_filter)
                .with(console_layer)
                .try_init();
        }
    });
}
