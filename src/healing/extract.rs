//! Best-effort parsing of diagnostic analysis text
//!
//! Nothing here fails: malformed or unexpected input degrades to an empty or
//! fallback result.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

/// Lines shorter than this are not considered a fix description on their own
const MIN_SUBSTANTIAL_LINE: usize = 20;
/// Fallback length when no line qualifies
const FALLBACK_CHARS: usize = 200;

/// `Fix:` / `Solution:` at the start of a markdown-stripped line
static FIX_MARKER: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?i)^(?:fix|solution)\s*:").ok());

/// A fenced code block from the analysis
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    /// Language from the fence info string, if any
    pub language: Option<String>,
    /// Target file named by the info string or a leading `file:` comment
    pub path: Option<String>,
    pub code: String,
}

/// Derive a one-line fix description from the analysis.
///
/// First line marked `fix:` / `solution:` (case-insensitive), else the first
/// substantial prose line, else the first 200 characters.
pub fn extract_fix_description(analysis: &str) -> String {
    let prose: Vec<&str> = prose_lines(analysis).collect();

    if let Some(marker) = FIX_MARKER.as_ref() {
        for line in &prose {
            let trimmed = strip_markdown(line);
            let Some(m) = marker.find(trimmed) else {
                continue;
            };
            let rest = trimmed[m.end()..].trim_start_matches('*').trim();
            if !rest.is_empty() {
                return rest.to_string();
            }
        }
    }

    if let Some(line) = prose
        .iter()
        .map(|l| strip_markdown(l))
        .find(|l| l.chars().count() >= MIN_SUBSTANTIAL_LINE)
    {
        return line.to_string();
    }

    analysis.trim().chars().take(FALLBACK_CHARS).collect()
}

/// Lines outside fenced code
fn prose_lines(text: &str) -> impl Iterator<Item = &str> {
    let mut in_block = false;
    text.lines().filter(move |line| {
        if line.trim_start().starts_with("```") {
            in_block = !in_block;
            return false;
        }
        !in_block && !line.trim().is_empty()
    })
}

fn strip_markdown(line: &str) -> &str {
    line.trim()
        .trim_start_matches(['#', '*', '-', '>'])
        .trim_start()
        .trim_start_matches("**")
        .trim()
}

/// Extract fenced code blocks. An unterminated final block is kept.
pub fn extract_code_blocks(text: &str) -> Vec<CodeBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<(String, String)> = None;

    for line in text.lines() {
        let trimmed = line.trim_start();
        if let Some(info) = trimmed.strip_prefix("```") {
            match current.take() {
                Some((info, body)) => push_block(&mut blocks, &info, &body),
                None => current = Some((info.trim().to_string(), String::new())),
            }
        } else if let Some((_, body)) = current.as_mut() {
            body.push_str(line);
            body.push('\n');
        }
    }

    if let Some((info, body)) = current {
        push_block(&mut blocks, &info, &body);
    }

    blocks
}

fn push_block(blocks: &mut Vec<CodeBlock>, info: &str, body: &str) {
    if body.trim().is_empty() {
        return;
    }

    let (language, mut path) = parse_info_string(info);
    let mut code = body.trim_end().to_string();

    if path.is_none() {
        if let Some((first, rest)) = code.split_once('\n') {
            if let Some(p) = file_comment(first) {
                path = Some(p);
                code = rest.to_string();
            }
        }
    }

    blocks.push(CodeBlock {
        language,
        path,
        code,
    });
}

/// ```` ```rust ````, ```` ```python:src/app.py ````, ```` ```python path=src/app.py ````
fn parse_info_string(info: &str) -> (Option<String>, Option<String>) {
    let mut parts = info.split_whitespace();
    let Some(head) = parts.next() else {
        return (None, None);
    };

    let (language, mut path) = match head.split_once(':') {
        Some((lang, p)) if !p.is_empty() => (lang.to_string(), Some(p.to_string())),
        _ => (head.to_string(), None),
    };

    for part in parts {
        if let Some(p) = part
            .strip_prefix("path=")
            .or_else(|| part.strip_prefix("file="))
        {
            path = Some(p.trim_matches(['"', '\'']).to_string());
        }
    }

    let language = (!language.is_empty()).then_some(language);
    (language, path)
}

/// `# file: x.py`, `// file: src/lib.rs`
fn file_comment(line: &str) -> Option<String> {
    let body = line
        .trim()
        .trim_start_matches("//")
        .trim_start_matches('#')
        .trim_start_matches("--")
        .trim();
    let lower = body.to_lowercase();
    let rest = if lower.starts_with("file:") {
        &body["file:".len()..]
    } else if lower.starts_with("filename:") {
        &body["filename:".len()..]
    } else {
        return None;
    };
    let path = rest.trim();
    (!path.is_empty()).then(|| path.to_string())
}

/// Path -> content for blocks that name a target file. Later blocks win.
pub fn target_files(blocks: &[CodeBlock]) -> BTreeMap<String, String> {
    blocks
        .iter()
        .filter_map(|b| b.path.as_ref().map(|p| (p.clone(), b.code.clone())))
        .collect()
}

/// Blocks without a target file, joined into a single test script
pub fn test_script(blocks: &[CodeBlock]) -> String {
    blocks
        .iter()
        .filter(|b| b.path.is_none())
        .map(|b| b.code.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Keep only the last `limit` characters: the most recent log lines.
pub fn tail_chars(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    if count <= limit {
        return text.to_string();
    }
    text.chars().skip(count - limit).collect()
}
