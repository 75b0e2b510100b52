//! Syntax validation seam and the plausibility precheck
//!
//! Language-specific parsers are external; the orchestrator only consumes a
//! [`SyntaxValidationResult`]. The built-in [`BracketValidator`] catches the
//! most common damage in generated code (truncated output, unbalanced
//! delimiters) for brace-based languages.

use cadence_core::{SyntaxDiagnostic, SyntaxValidationResult};
use std::path::Path;

/// Validates generated file content
pub trait SyntaxValidator: Send + Sync {
    fn validate(&self, path: &str, content: &str) -> SyntaxValidationResult;
}

/// Map a file extension to a language name
pub fn detect_language(path: &str) -> Option<&'static str> {
    let ext = Path::new(path).extension()?.to_str()?;
    let lang = match ext.to_lowercase().as_str() {
        "rs" => "rust",
        "ts" | "tsx" | "mts" | "cts" => "typescript",
        "js" | "jsx" | "mjs" | "cjs" => "javascript",
        "py" => "python",
        "go" => "go",
        "java" => "java",
        "kt" | "kts" => "kotlin",
        "c" | "h" => "c",
        "cc" | "cpp" | "cxx" | "hpp" => "cpp",
        "cs" => "csharp",
        "swift" => "swift",
        "json" => "json",
        _ => return None,
    };
    Some(lang)
}

/// Accepts everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopValidator;

impl SyntaxValidator for NoopValidator {
    fn validate(&self, path: &str, _content: &str) -> SyntaxValidationResult {
        SyntaxValidationResult::valid(path, detect_language(path).unwrap_or("unknown"))
    }
}

/// Delimiter balance check for brace-based languages
#[derive(Debug, Clone, Default)]
pub struct BracketValidator {
    /// Restrict checking to these languages (empty = all supported)
    languages: Vec<String>,
}

impl BracketValidator {
    pub fn new(languages: Vec<String>) -> Self {
        Self { languages }
    }

    fn enabled_for(&self, language: &str) -> bool {
        self.languages.is_empty() || self.languages.iter().any(|l| l.eq_ignore_ascii_case(language))
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Scan {
    Code,
    LineComment,
    BlockComment,
    Str(char),
}

fn check_balance(content: &str, language: &str) -> Vec<SyntaxDiagnostic> {
    let hash_comments = matches!(language, "python");
    let single_quote_strings = !matches!(language, "rust" | "json");

    let mut stack: Vec<(char, u32, u32)> = Vec::new();
    let mut errors = Vec::new();
    let mut state = Scan::Code;
    let mut line = 1u32;
    let mut column = 0u32;
    let mut chars = content.chars().peekable();

    while let Some(c) = chars.next() {
        column += 1;
        if c == '\n' {
            line += 1;
            column = 0;
            if state == Scan::LineComment {
                state = Scan::Code;
            }
            continue;
        }

        match state {
            Scan::LineComment => {}
            Scan::BlockComment => {
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    column += 1;
                    state = Scan::Code;
                }
            }
            Scan::Str(quote) => {
                if c == '\\' {
                    chars.next();
                    column += 1;
                } else if c == quote {
                    state = Scan::Code;
                }
            }
            Scan::Code => match c {
                '/' if !hash_comments && chars.peek() == Some(&'/') => state = Scan::LineComment,
                '/' if !hash_comments && chars.peek() == Some(&'*') => {
                    chars.next();
                    column += 1;
                    state = Scan::BlockComment;
                }
                '#' if hash_comments => state = Scan::LineComment,
                '"' | '`' => state = Scan::Str(c),
                '\'' if single_quote_strings => state = Scan::Str(c),
                // Rust char literals; lifetimes fall through
                '\'' => {
                    let mut look = chars.clone();
                    let skip = match (look.next(), look.next()) {
                        (Some('\\'), Some(_)) => look
                            .take_while(|ch| *ch != '\n')
                            .take(9)
                            .position(|ch| ch == '\'')
                            .map(|i| i + 3)
                            .unwrap_or(0),
                        (Some(_), Some('\'')) => 2,
                        _ => 0,
                    };
                    for _ in 0..skip {
                        chars.next();
                        column += 1;
                    }
                }
                '(' | '[' | '{' => stack.push((c, line, column)),
                ')' | ']' | '}' => {
                    let expected = match c {
                        ')' => '(',
                        ']' => '[',
                        _ => '{',
                    };
                    match stack.pop() {
                        Some((open, _, _)) if open == expected => {}
                        Some((open, l, col)) => {
                            errors.push(SyntaxDiagnostic {
                                line,
                                column,
                                message: format!(
                                    "mismatched '{}' (opened '{}' at {}:{})",
                                    c, open, l, col
                                ),
                            });
                            return errors;
                        }
                        None => {
                            errors.push(SyntaxDiagnostic {
                                line,
                                column,
                                message: format!("unexpected '{}'", c),
                            });
                            return errors;
                        }
                    }
                }
                _ => {}
            },
        }
    }

    if let Some((open, l, col)) = stack.pop() {
        errors.push(SyntaxDiagnostic {
            line: l,
            column: col,
            message: format!("unclosed '{}'", open),
        });
    }
    if let Scan::Str(quote) = state {
        errors.push(SyntaxDiagnostic {
            line,
            column,
            message: format!("unterminated string starting with {}", quote),
        });
    }
    errors
}

impl SyntaxValidator for BracketValidator {
    fn validate(&self, path: &str, content: &str) -> SyntaxValidationResult {
        let Some(language) = detect_language(path) else {
            return SyntaxValidationResult::valid(path, "unknown");
        };
        if !self.enabled_for(language) {
            return SyntaxValidationResult::valid(path, language);
        }

        let errors = check_balance(content, language);
        SyntaxValidationResult {
            file: path.to_string(),
            language: language.to_string(),
            valid: errors.is_empty(),
            errors,
        }
    }
}

const REFUSAL_MARKERS: &[&str] = &[
    "i'm sorry",
    "i am sorry",
    "as an ai",
    "i cannot",
    "i can't help",
];

/// Cheap check that content is plausibly code rather than prose or a refusal
///
/// When this fails, a fix attempt asks for full regeneration instead of a
/// targeted edit.
pub fn looks_like_code(content: &str) -> bool {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return false;
    }

    let head = trimmed
        .chars()
        .take(200)
        .collect::<String>()
        .to_lowercase();
    if REFUSAL_MARKERS.iter().any(|m| head.starts_with(m)) {
        return false;
    }

    let lines: Vec<&str> = trimmed.lines().filter(|l| !l.trim().is_empty()).collect();
    let code_like = lines
        .iter()
        .filter(|l| {
            let l = l.trim_end();
            l.ends_with(['{', '}', ';', ')', ',', ':', ']', '('])
                || l.contains('=')
                || l.trim_start().starts_with(['#', '/', '@', '*'])
                || l.starts_with(' ')
                || l.starts_with('\t')
        })
        .count();

    code_like * 3 >= lines.len()
}
