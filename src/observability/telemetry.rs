//! Telemetry & Observability
//!
//! Provides structured logging and tracing for recovery operations.
//! Features:
//! - Compact or JSON log output, chosen by configuration
//! - Configurable log levels via RUST_LOG (wins over the config file)
//! - Healing-task spans carrying task and step identifiers
//! - Status transition logging
//! - Sanitisation and truncation of untrusted error text

use std::sync::Once;
use tracing::{info, info_span, Span};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LoggingConfig};

/// Maximum characters of an error string written to a single log line.
pub const MAX_LOG_FIELD_CHARS: usize = 500;

/// Sanitize a string for safe log output by escaping control characters.
/// Prevents log injection where collaborator output embeds newlines to forge log entries.
pub fn sanitize_for_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\x1b' => out.push_str("\\e"),
            '\x00' => out.push_str("\\0"),
            c if c.is_control() => out.push_str(&format!("\\u{:04x}", c as u32)),
            _ => out.push(c),
        }
    }
    out
}

/// Truncate to at most `max_chars` characters (UTF-8 safe), marking the cut.
pub fn truncate_for_log(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max_chars).collect();
    out.push_str("...[truncated]");
    out
}

/// Sanitized, redacted and truncated form of an error string, ready for a log field.
pub fn log_safe(s: &str) -> String {
    let redacted = crate::redact::redact_secrets(s);
    truncate_for_log(&sanitize_for_log(&redacted), MAX_LOG_FIELD_CHARS)
}

/// Initialize global tracing subscriber from configuration.
///
/// `RUST_LOG`, when set, overrides the configured level. Only the first call
/// installs a subscriber; later calls are no-ops.
pub fn init_tracing(config: &LoggingConfig) {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let directive = std::env::var("RUST_LOG").unwrap_or_else(|_| config.level.clone());
        let filter_layer =
            EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("warn"));

        match config.format {
            LogFormat::Compact => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false)
                    .with_level(true)
                    .compact()
                    .with_writer(std::io::stderr);
                let _ = tracing_subscriber::registry()
                    .with(filter_layer)
                    .with(fmt_layer)
                    .try_init();
            }
            LogFormat::Json => {
                let fmt_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr);
                let _ = tracing_subscriber::registry()
                    .with(filter_layer)
                    .with(fmt_layer)
                    .try_init();
            }
        }
    });
}

/// Span wrapping the whole workflow of one healing task
pub fn healing_span(task_id: &str, step_id: &str) -> Span {
    let safe_step = sanitize_for_log(step_id);
    let span = info_span!("healing_task", task_id = task_id, step_id = safe_step.as_str());
    span
}

/// Record a healing status transition
pub fn record_transition(task_id: &str, from: &str, to: &str) {
    info!(task_id = task_id, from = from, to = to, "Healing status transition");
}

/// Initialize tracing for tests with a simple subscriber
#[cfg(test)]
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}
