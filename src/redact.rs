//! Secret redaction for text that leaves the process
//!
//! Error messages, step log excerpts and snapshot state routinely carry
//! credentials copied from failing commands. Everything written to the
//! key/value store, the event bus or the Phoenix snapshot goes through here.

use regex::{Regex, RegexBuilder};
use std::borrow::Cow;
use std::sync::OnceLock;

/// Placeholder for redacted content
pub const REDACTED: &str = "[REDACTED]";

/// Maximum compiled regex size to mitigate ReDoS (catastrophic backtracking).
const REGEX_SIZE_LIMIT: usize = 1 << 20;

static SECRET_PATTERNS: OnceLock<Vec<SecretPattern>> = OnceLock::new();

struct SecretPattern {
    name: &'static str,
    regex: Regex,
}

/// Compile with a size limit; a pattern that fails to compile is skipped.
fn compile_pattern(name: &'static str, pattern: &str) -> Option<SecretPattern> {
    match RegexBuilder::new(pattern).size_limit(REGEX_SIZE_LIMIT).build() {
        Ok(regex) => Some(SecretPattern { name, regex }),
        Err(e) => {
            tracing::warn!("Secret pattern '{}' failed to compile (skipping): {}", name, e);
            None
        }
    }
}

fn patterns() -> &'static Vec<SecretPattern> {
    SECRET_PATTERNS.get_or_init(|| {
        let candidates: Vec<Option<SecretPattern>> = vec![
            compile_pattern(
                "api_key",
                r#"(?i)(api[_-]?key|apikey)\s*[=:]\s*["']?([a-zA-Z0-9_\-]{20,})["']?"#,
            ),
            compile_pattern("bearer_token", r#"(?i)(bearer\s+)([a-zA-Z0-9_\-\.]{20,})"#),
            compile_pattern("github_token", r#"(ghp_[a-zA-Z0-9]{36})"#),
            compile_pattern("openai_key", r#"(sk-[a-zA-Z0-9_\-]{32,})"#),
            compile_pattern("aws_access_key", r#"(AKIA[A-Z0-9]{16})"#),
            compile_pattern(
                "password",
                r#"(?i)(password|passwd|pwd|secret)\s*[=:]\s*["']?([^\s"']{8,})["']?"#,
            ),
            compile_pattern(
                "db_connection",
                r#"(?i)(mongodb|postgres|postgresql|mysql|redis)://[^\s"'<>]+"#,
            ),
            compile_pattern("jwt", r#"eyJ[a-zA-Z0-9_-]*\.eyJ[a-zA-Z0-9_-]*\.[a-zA-Z0-9_-]*"#),
            compile_pattern(
                "env_token",
                r#"(?i)([A-Z_]*(?:TOKEN|SECRET|PASSWORD|CREDENTIAL)[A-Z_]*)\s*[=:]\s*["']?([^\s"']{16,})["']?"#,
            ),
        ];
        candidates.into_iter().flatten().collect()
    })
}

/// Redact secrets from a string
pub fn redact_secrets(input: &str) -> Cow<'_, str> {
    let mut result = Cow::Borrowed(input);

    for pattern in patterns() {
        if pattern.regex.is_match(&result) {
            let replacement = format!("{}={}", pattern.name, REDACTED);
            result = Cow::Owned(
                pattern
                    .regex
                    .replace_all(&result, replacement.as_str())
                    .into_owned(),
            );
        }
    }

    result
}

/// Redact secrets from a JSON value (recursively)
pub fn redact_json(value: &mut serde_json::Value) {
    match value {
        serde_json::Value::String(s) => {
            let redacted = redact_secrets(s).into_owned();
            if redacted != *s {
                *s = redacted;
            }
        }
        serde_json::Value::Array(arr) => {
            for item in arr {
                redact_json(item);
            }
        }
        serde_json::Value::Object(obj) => {
            for (key, val) in obj.iter_mut() {
                if is_sensitive_key(key) && val.is_string() {
                    *val = serde_json::Value::String(REDACTED.to_string());
                } else {
                    redact_json(val);
                }
            }
        }
        _ => {}
    }
}

/// Check if a key name suggests sensitive data
pub fn is_sensitive_key(key: &str) -> bool {
    let key_lower = key.to_lowercase();
    const SENSITIVE: [&str; 10] = [
        "password",
        "passwd",
        "secret",
        "token",
        "api_key",
        "apikey",
        "credential",
        "private_key",
        "authorization",
        "cookie",
    ];
    SENSITIVE.iter().any(|p| key_lower.contains(p))
}
