use serde::{Deserialize, Serialize};

use crate::error::Rejection;
use crate::limiter::LimitOverrides;

/// One request to execute source code
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub language: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
    /// Caller overrides; may only tighten the language limits
    #[serde(default)]
    pub limits: LimitOverrides,
}

impl Submission {
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
            stdin: None,
            limits: LimitOverrides::default(),
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_limits(mut self, limits: LimitOverrides) -> Self {
        self.limits = limits;
        self
    }

    /// Check sizes against the ingress maxima
    pub fn validate(&self, max_source_bytes: usize, max_stdin_bytes: usize) -> Result<(), Rejection> {
        if self.source.trim().is_empty() {
            return Err(Rejection::InvalidInput("source is empty".into()));
        }
        if self.source.len() > max_source_bytes {
            return Err(Rejection::InvalidInput(format!(
                "source is {} bytes, limit is {}",
                self.source.len(),
                max_source_bytes
            )));
        }
        if let Some(stdin) = &self.stdin {
            if stdin.len() > max_stdin_bytes {
                return Err(Rejection::InvalidInput(format!(
                    "stdin is {} bytes, limit is {}",
                    stdin.len(),
                    max_stdin_bytes
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert!(Submission::new("cpp", "int main(){}").validate(64, 64).is_ok());
        assert!(matches!(
            Submission::new("cpp", "   \n").validate(64, 64),
            Err(Rejection::InvalidInput(_))
        ));
        assert!(Submission::new("cpp", "x".repeat(65)).validate(64, 64).is_err());
        assert!(Submission::new("cpp", "x")
            .with_stdin("y".repeat(65))
            .validate(64, 64)
            .is_err());
    }

    #[test]
    fn test_deserialize_minimal() {
        let submission: Submission =
            serde_json::from_str(r#"{"language":"cpp","source":"int main(){}"}"#).unwrap();
        assert_eq!(submission.stdin, None);
        assert_eq!(submission.limits, LimitOverrides::default());
    }
}
