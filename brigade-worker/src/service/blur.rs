//! Secret blurring
//!
//! Replaces every known secret value found in outgoing text with a fixed
//! placeholder before it leaves the worker.

use brigade_core::domain::action::Variable;
use serde_json::Value as JsonValue;

/// Text written in place of a secret
pub const BLUR_PLACEHOLDER: &str = "**********";

/// Secrets shorter than this are not blurred: they would match too much text
pub const MIN_SECRET_LENGTH: usize = 6;

/// Redacts the secrets of one job
#[derive(Debug, Clone, Default)]
pub struct SecretBlurrer {
    /// Longest first, so a secret containing another is replaced whole
    secrets: Vec<String>,
}

impl SecretBlurrer {
    pub fn new(secrets: &[Variable]) -> Self {
        let mut values: Vec<String> = secrets
            .iter()
            .filter(|s| s.value.len() >= MIN_SECRET_LENGTH)
            .map(|s| s.value.clone())
            .collect();

        // Multi-line secrets (keys) also leak line by line
        let lines: Vec<String> = values
            .iter()
            .flat_map(|v| v.lines())
            .map(str::trim)
            .filter(|l| l.len() >= MIN_SECRET_LENGTH)
            .map(str::to_string)
            .collect();
        values.extend(lines);

        values.sort_by(|a, b| b.len().cmp(&a.len()));
        values.dedup();

        Self { secrets: values }
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    /// Returns `text` with every secret replaced by the placeholder
    pub fn blur_str(&self, text: &str) -> String {
        let mut blurred = text.to_string();
        for secret in &self.secrets {
            if blurred.contains(secret.as_str()) {
                blurred = blurred.replace(secret.as_str(), BLUR_PLACEHOLDER);
            }
        }
        blurred
    }

    /// Returns a copy of `value` with secrets blurred in every string and key
    pub fn blur_value(&self, value: &JsonValue) -> JsonValue {
        match value {
            JsonValue::String(s) => JsonValue::String(self.blur_str(s)),
            JsonValue::Array(items) => {
                JsonValue::Array(items.iter().map(|v| self.blur_value(v)).collect())
            }
            JsonValue::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (self.blur_str(k), self.blur_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}
