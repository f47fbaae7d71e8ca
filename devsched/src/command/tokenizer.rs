/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Quote-aware splitting and joining of command lines.
//!
//! Whitespace separates tokens except inside double quotes; a backslash
//! escapes the next character (so `\"` and `\ ` survive as literals).

use super::error::ConfigError;

/// Split `line` into tokens.
///
/// # Errors
/// [`ConfigError::UnterminatedQuote`] if a double quote is never closed.
pub fn tokenize(line: &str) -> Result<Vec<String>, ConfigError> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quoted = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    in_token = true;
                }
            }
            '"' => {
                quoted = !quoted;
                in_token = true;
            }
            c if c.is_whitespace() && !quoted => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            c => {
                current.push(c);
                in_token = true;
            }
        }
    }

    if quoted {
        return Err(ConfigError::UnterminatedQuote(line.to_string()));
    }
    if in_token {
        tokens.push(current);
    }
    Ok(tokens)
}

/// Join tokens back into a single display line, quoting any token that
/// contains whitespace (or is empty) so that [`tokenize`] round-trips it.
pub fn combine_tokens<S: AsRef<str>>(tokens: &[S]) -> String {
    tokens
        .iter()
        .map(|t| {
            let t = t.as_ref();
            if t.is_empty() || t.chars().any(char::is_whitespace) {
                format!("\"{}\"", t.replace('"', "\\\""))
            } else {
                t.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

// ── Tests ─────────────────────────────────────────────────────────────────────
