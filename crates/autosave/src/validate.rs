/// Content validation run before every save.
use serde::{Deserialize, Serialize};
use store::EngineConfig;

/// Share of a limit above which a warning is reported
const WARN_RATIO: f64 = 0.9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentLimits {
    pub max_chars: usize,
    pub max_words: usize,
}

impl ContentLimits {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_chars: config.max_content_chars,
            max_words: config.max_word_count,
        }
    }
}

impl Default for ContentLimits {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    /// Cleaned content, when it differs from the input
    pub sanitized_content: Option<String>,
}

impl ValidationReport {
    /// The content that should be persisted.
    pub fn content_or<'a>(&'a self, original: &'a str) -> &'a str {
        self.sanitized_content.as_deref().unwrap_or(original)
    }

    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }
}

pub trait ContentValidator: Send + Sync {
    fn validate(&self, content: &str, limits: &ContentLimits) -> ValidationReport;
}

/// Size limits plus control-character stripping.
#[derive(Debug, Default, Clone, Copy)]
pub struct LimitsValidator;

impl ContentValidator for LimitsValidator {
    fn validate(&self, content: &str, limits: &ContentLimits) -> ValidationReport {
        let mut report = ValidationReport::default();

        let stripped: String = content
            .chars()
            .filter(|c| !c.is_control() || c.is_whitespace())
            .collect();
        let removed = content.chars().count() - stripped.chars().count();
        if removed > 0 {
            report
                .warnings
                .push(format!("removed {removed} control character(s)"));
            report.sanitized_content = Some(stripped);
        }
        let text = report.content_or(content);

        let chars = text.chars().count();
        let words = store::word_count(text);
        if chars > limits.max_chars {
            report.errors.push(format!(
                "content is {chars} characters, limit is {}",
                limits.max_chars
            ));
        } else if chars as f64 > limits.max_chars as f64 * WARN_RATIO {
            report.warnings.push(format!(
                "content is close to the {} character limit",
                limits.max_chars
            ));
        }
        if words > limits.max_words {
            report.errors.push(format!(
                "content is {words} words, limit is {}",
                limits.max_words
            ));
        } else if words as f64 > limits.max_words as f64 * WARN_RATIO {
            report.warnings.push(format!(
                "content is close to the {} word limit",
                limits.max_words
            ));
        }

        report.is_valid = report.errors.is_empty();
        report
    }
}
