//! Input sanitization for task content accepted over the HTTP API (§3, §9).
//! Tasks describe work for an agent that will execute arbitrary shell
//! commands and file edits on the caller's behalf, so `description` and the
//! opaque `data` map are treated as an untrusted boundary: length-capped,
//! checked against a denylist of injection patterns, and HTML-escaped
//! before they're persisted or echoed back through the API or `fleetctl`.

use crate::FleetError;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

pub const MAX_DESCRIPTION_LENGTH: usize = 10_000;
pub const MAX_DATA_KEY_LENGTH: usize = 100;
pub const MAX_DATA_VALUE_LENGTH: usize = 1_000;

static SAFE_CONTENT_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9\s.,!?:;()\[\]{}\-_+=@#$%^&*|\\/<>'`~\n\r\t]+$")
        .expect("safe content pattern is a valid regex")
});

static DANGEROUS_PATTERNS: &[&str] = &[
    "<script",
    "javascript:",
    "data:text/html",
    "&&",
    "||",
    ";rm",
    ";del",
    "`rm",
    "$(rm",
    "union select",
    "drop table",
    "delete from",
    "../",
    "..\\",
    "file://",
    "/etc/passwd",
    "/etc/shadow",
];

pub struct TaskContentValidator {
    dangerous_patterns: HashSet<&'static str>,
}

impl TaskContentValidator {
    pub fn new() -> Self {
        Self {
            dangerous_patterns: DANGEROUS_PATTERNS.iter().copied().collect(),
        }
    }

    fn reject_dangerous(&self, content: &str) -> Result<(), FleetError> {
        let lower = content.to_lowercase();
        for pattern in &self.dangerous_patterns {
            if lower.contains(pattern) {
                return Err(FleetError::Validation(
                    "content contains a disallowed pattern".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Validates and HTML-escapes a task description. Empty descriptions
    /// are allowed (not every task needs one); whitespace-only is not.
    pub fn sanitize_description(&self, description: &str) -> Result<String, FleetError> {
        if description.len() > MAX_DESCRIPTION_LENGTH {
            return Err(FleetError::Validation(format!(
                "description exceeds {MAX_DESCRIPTION_LENGTH} characters"
            )));
        }
        if description.is_empty() {
            return Ok(String::new());
        }
        if description.trim().is_empty() {
            return Err(FleetError::Validation(
                "description cannot be only whitespace".to_string(),
            ));
        }
        self.reject_dangerous(description)?;
        if !SAFE_CONTENT_REGEX.is_match(description) {
            return Err(FleetError::Validation(
                "description contains unsupported characters".to_string(),
            ));
        }
        Ok(html_escape::encode_text(description).to_string())
    }

    /// Validates and escapes a single `Task.data` key/value pair, matching
    /// the key-set `Task::decision_context` later reads back out.
    pub fn sanitize_data_entry(&self, key: &str, value: &str) -> Result<(String, String), FleetError> {
        if key.is_empty() || key.len() > MAX_DATA_KEY_LENGTH {
            return Err(FleetError::Validation(format!(
                "data key must be non-empty and under {MAX_DATA_KEY_LENGTH} characters"
            )));
        }
        if !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
            return Err(FleetError::Validation(
                "data keys may only contain alphanumeric characters and underscores".to_string(),
            ));
        }
        if value.len() > MAX_DATA_VALUE_LENGTH {
            return Err(FleetError::Validation(format!(
                "data value exceeds {MAX_DATA_VALUE_LENGTH} characters"
            )));
        }
        self.reject_dangerous(value)?;
        Ok((key.to_string(), html_escape::encode_text(value).to_string()))
    }
}

impl Default for TaskContentValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_description_passes_through_unescaped() {
        let validator = TaskContentValidator::new();
        let sanitized = validator
            .sanitize_description("add a hello world endpoint")
            .unwrap();
        assert_eq!(sanitized, "add a hello world endpoint");
    }

    #[test]
    fn script_tag_is_rejected() {
        let validator = TaskContentValidator::new();
        assert!(validator
            .sanitize_description("<script>alert(1)</script>")
            .is_err());
    }

    #[test]
    fn command_chaining_is_rejected() {
        let validator = TaskContentValidator::new();
        assert!(validator
            .sanitize_description("write a file && rm -rf /")
            .is_err());
    }

    #[test]
    fn whitespace_only_description_is_rejected() {
        let validator = TaskContentValidator::new();
        assert!(validator.sanitize_description("   ").is_err());
    }

    #[test]
    fn oversized_description_is_rejected() {
        let validator = TaskContentValidator::new();
        let long = "x".repeat(MAX_DESCRIPTION_LENGTH + 1);
        assert!(validator.sanitize_description(&long).is_err());
    }

    #[test]
    fn data_key_rejects_non_alphanumeric() {
        let validator = TaskContentValidator::new();
        assert!(validator.sanitize_data_entry("bad key!", "value").is_err());
    }

    #[test]
    fn data_value_is_escaped() {
        let validator = TaskContentValidator::new();
        let (_, value) = validator.sanitize_data_entry("note", "<b>hi</b>").unwrap();
        assert_eq!(value, "&lt;b&gt;hi&lt;/b&gt;");
    }
}
