//! Error Classifier
//!
//! Maps free-form error text onto a closed [`ErrorCategory`] by ordered
//! pattern matching over the lower-cased text.
//!
//! Order is significant. Infrastructure and verification patterns are tested
//! before transient/logic/state/permission ones: provider rate-limit messages
//! routinely also say "timeout", and a rate limit read as a transient error
//! is retried after seconds instead of minutes.
//!
//! Results are memoized per distinct error string in a bounded LRU cache.

use lru::LruCache;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroUsize;
use tracing::debug;

use crate::config::ClassifierConfig;

/// Category of a step failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Transient,
    Infrastructure,
    Logic,
    State,
    Permission,
    UserInput,
    Verification,
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "TRANSIENT",
            Self::Infrastructure => "INFRASTRUCTURE",
            Self::Logic => "LOGIC",
            Self::State => "STATE",
            Self::Permission => "PERMISSION",
            Self::UserInput => "USER_INPUT",
            Self::Verification => "VERIFICATION",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Patterns per category, in precedence order.
const CATEGORY_PATTERNS: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::Infrastructure,
        &[
            r"rate[\s_-]?limit",
            r"too many requests",
            r"\b(?:http|status|code|error)[\s:]*(?:429|50[234])\b",
            r"quota[\s_-]?(?:exceeded|exhausted|limit)",
            r"exceeded (?:your |the )?quota",
            r"(?:model|server|service|api|engine) (?:is )?overloaded",
            r"overloaded_error",
            r"(?:at|over|insufficient) capacity",
            r"service unavailable",
            r"bad gateway",
            r"gateway time-?out",
            r"resource[\s_]exhausted",
            r"out of memory",
            r"no space left",
            r"disk full",
        ],
    ),
    (
        ErrorCategory::Verification,
        &[
            r"verif",
            r"grisha",
            r"criteria (?:not|were not|was not) met",
            r"no [\w\s-]*files? found",
            r"empty results?",
            r"no results? (?:found|returned)",
            r"expected outcome",
        ],
    ),
    (
        ErrorCategory::Transient,
        &[
            r"connection ?reset",
            r"connection ?aborted",
            r"connection ?refused",
            r"econnreset",
            r"econnrefused",
            r"broken pipe",
            r"timed? ?out",
            r"timeout",
            r"temporar(?:y|ily)",
            r"try again",
            r"network (?:error|unreachable)",
            r"socket hang up",
        ],
    ),
    (
        ErrorCategory::Logic,
        &[
            r"syntax ?error",
            r"indentation ?error",
            r"type ?error",
            r"name ?error",
            r"attribute ?error",
            r"key ?error",
            r"index ?error",
            r"value ?error",
            r"import ?error",
            r"modulenotfound",
            r"is not defined",
            r"undefined (?:variable|function|method|reference)",
            r"unexpected token",
            r"cannot read propert",
            r"null pointer",
            r"assertion ?error",
        ],
    ),
    (
        ErrorCategory::State,
        &[
            r"invalid state",
            r"inconsistent state",
            r"state (?:is )?corrupt",
            r"corrupted",
            r"deadlock",
            r"stale (?:lock|state|session)",
            r"already running",
            r"lock (?:held|acquired|timeout)",
        ],
    ),
    (
        ErrorCategory::Permission,
        &[
            r"permission denied",
            r"access denied",
            r"not permitted",
            r"eacces",
            r"eperm",
            r"forbidden",
            r"\b40[13]\b",
            r"unauthori[sz]ed",
            r"authentication failed",
            r"sudo",
        ],
    ),
    (
        ErrorCategory::UserInput,
        &[
            r"invalid (?:input|argument|parameter|request)",
            r"missing required",
            r"please (?:provide|specify|clarify)",
            r"ambiguous",
            r"user input",
            r"clarification",
        ],
    ),
];

static COMPILED: Lazy<Vec<(ErrorCategory, RegexSet)>> = Lazy::new(|| {
    CATEGORY_PATTERNS
        .iter()
        .filter_map(|(category, patterns)| match RegexSet::new(*patterns) {
            Ok(set) => Some((*category, set)),
            Err(e) => {
                tracing::warn!("Classifier patterns for {} failed to compile: {}", category, e);
                None
            }
        })
        .collect()
});

/// Classify without touching any cache.
pub fn classify_uncached(error: &str) -> ErrorCategory {
    let text = error.to_lowercase();
    COMPILED
        .iter()
        .find(|(_, set)| set.is_match(&text))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Unknown)
}

/// Memoizing classifier
pub struct ErrorClassifier {
    cache: Mutex<LruCache<String, ErrorCategory>>,
}

impl ErrorClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        let capacity = NonZeroUsize::new(config.cache_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Classify an error string. Never panics; anything unmatched is UNKNOWN.
    pub fn classify(&self, error: &str) -> ErrorCategory {
        if let Some(category) = self.cache.lock().get(error) {
            debug!(category = %category, "Classifier cache hit");
            return *category;
        }

        let category = classify_uncached(error);
        self.cache.lock().put(error.to_string(), category);
        category
    }

    /// Number of memoized entries
    pub fn cached_entries(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn clear_cache(&self) {
        self.cache.lock().clear();
    }
}

impl Default for ErrorClassifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default())
    }
}
