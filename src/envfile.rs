//! Generation of the `env` file.
//!
//! Written to the working directory on every start: one `KEY="value"` line
//! per configured environment key, where a value set in the supervisor's
//! real environment wins over the configured default. Values are quoted so
//! that sourcing the file from a shell restores them byte-for-byte.

use anyhow::{Context, Result};
use indexmap::IndexMap;
use std::fmt::Write;
use std::path::Path;

pub fn write_env_file(path: &Path, environment: &IndexMap<String, String>) -> Result<()> {
    let mut out = String::new();
    for (key, default) in environment {
        let value = std::env::var(key).unwrap_or_else(|_| default.clone());
        let _ = writeln!(out, "{key}={}", shell_quote(&value));
    }
    std::fs::write(path, out).with_context(|| format!("write env file {}", path.display()))
}

/// Double-quote `value`, backslash-escaping the characters the shell still
/// interprets inside double quotes.
pub fn shell_quote(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 2);
    quoted.push('"');
    for c in value.chars() {
        match c {
            '"' | '\\' | '$' | '`' => {
                quoted.push('\\');
                quoted.push(c);
            }
            _ => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}
