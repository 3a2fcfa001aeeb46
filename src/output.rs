// SPDX-License-Identifier: MIT OR Apache-2.0

//! Output and color utilities for consistent terminal formatting
//!
//! Provides shared color functions respecting NO_COLOR environment variable.

use colored::Colorize;
use serde::Serialize;

/// Check if colors should be used (respects NO_COLOR env var)
pub fn use_colors() -> bool {
    std::env::var("NO_COLOR").is_err()
}

/// Colorize file path (cyan)
pub fn colorize_path(text: &str, use_color: bool) -> String {
    if use_color {
        text.cyan().to_string()
    } else {
        text.to_string()
    }
}

/// Colorize a count or percentage (yellow)
pub fn colorize_number(text: &str, use_color: bool) -> String {
    if use_color {
        text.yellow().to_string()
    } else {
        text.to_string()
    }
}

/// Colorize a section label (bold)
pub fn colorize_label(text: &str, use_color: bool) -> String {
    if use_color {
        text.bold().to_string()
    } else {
        text.to_string()
    }
}

/// Success marker
pub fn success_mark(use_color: bool) -> String {
    if use_color {
        "✓".green().to_string()
    } else {
        "✓".to_string()
    }
}

/// Warning marker
pub fn warning_mark(use_color: bool) -> String {
    if use_color {
        "!".yellow().bold().to_string()
    } else {
        "!".to_string()
    }
}

/// Serializes `value` as JSON, pretty unless `compact`.
pub fn to_json<T: Serialize>(value: &T, compact: bool) -> serde_json::Result<String> {
    if compact {
        serde_json::to_string(value)
    } else {
        serde_json::to_string_pretty(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_output_without_color() {
        assert_eq!(colorize_path("src/a.rs", false), "src/a.rs");
        assert_eq!(colorize_number("42", false), "42");
        assert_eq!(success_mark(false), "✓");
    }

    #[test]
    fn compact_json_has_no_newlines() {
        let value = serde_json::json!({ "a": 1, "b": [1, 2] });
        assert!(!to_json(&value, true).unwrap().contains('\n'));
        assert!(to_json(&value, false).unwrap().contains('\n'));
    }
}
