// Scoring configuration shared by the engine, worker and CLI

use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Tunables for scoring.
///
/// The neutral scores are not principled values. Set them to 0 to fail closed.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    /// Score for a coding question that has no test cases
    pub neutral_coding_score: f64,
    /// Score for a subjective question without a model answer
    pub neutral_subjective_score: f64,
    /// `anomaly_detected` is raised when the plagiarism score exceeds this
    pub plagiarism_threshold: f64,
    pub sandbox_timeout_ms: u64,
    pub max_parallel_answers: usize,
    /// Used when a job record carries no cutoff
    pub default_cutoff_score: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            neutral_coding_score: 50.0,
            neutral_subjective_score: 50.0,
            plagiarism_threshold: 0.8,
            sandbox_timeout_ms: 5000,
            max_parallel_answers: 4,
            default_cutoff_score: 70.0,
        }
    }
}

impl ScoringConfig {
    /// Load from `SKILLGRADE_*` environment variables, falling back to defaults
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load through an arbitrary key lookup (environment, test map, ...)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let config = Self {
            neutral_coding_score: parse_or(
                &lookup,
                "SKILLGRADE_NEUTRAL_CODING_SCORE",
                defaults.neutral_coding_score,
            )?,
            neutral_subjective_score: parse_or(
                &lookup,
                "SKILLGRADE_NEUTRAL_SUBJECTIVE_SCORE",
                defaults.neutral_subjective_score,
            )?,
            plagiarism_threshold: parse_or(
                &lookup,
                "SKILLGRADE_PLAGIARISM_THRESHOLD",
                defaults.plagiarism_threshold,
            )?,
            sandbox_timeout_ms: parse_or(
                &lookup,
                "SKILLGRADE_SANDBOX_TIMEOUT_MS",
                defaults.sandbox_timeout_ms,
            )?,
            max_parallel_answers: parse_or(
                &lookup,
                "SKILLGRADE_MAX_PARALLEL_ANSWERS",
                defaults.max_parallel_answers,
            )?,
            default_cutoff_score: parse_or(
                &lookup,
                "SKILLGRADE_DEFAULT_CUTOFF",
                defaults.default_cutoff_score,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [
            ("SKILLGRADE_NEUTRAL_CODING_SCORE", self.neutral_coding_score),
            ("SKILLGRADE_NEUTRAL_SUBJECTIVE_SCORE", self.neutral_subjective_score),
            ("SKILLGRADE_DEFAULT_CUTOFF", self.default_cutoff_score),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(invalid(key, value, "must be within [0, 100]"));
            }
        }
        if !(0.0..=1.0).contains(&self.plagiarism_threshold) {
            return Err(invalid(
                "SKILLGRADE_PLAGIARISM_THRESHOLD",
                self.plagiarism_threshold,
                "must be within [0, 1]",
            ));
        }
        if self.sandbox_timeout_ms == 0 {
            return Err(invalid("SKILLGRADE_SANDBOX_TIMEOUT_MS", 0, "must be positive"));
        }
        if self.max_parallel_answers == 0 {
            return Err(invalid("SKILLGRADE_MAX_PARALLEL_ANSWERS", 0, "must be positive"));
        }
        Ok(())
    }
}

fn parse_or<F, T>(lookup: &F, key: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

fn invalid(key: &'static str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let config = ScoringConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, ScoringConfig::default());
        assert_eq!(config.sandbox_timeout_ms, 5000);
        assert_eq!(config.plagiarism_threshold, 0.8);
    }

    #[test]
    fn test_overrides() {
        let config = ScoringConfig::from_lookup(lookup_from(&[
            ("SKILLGRADE_NEUTRAL_CODING_SCORE", "0"),
            ("SKILLGRADE_SANDBOX_TIMEOUT_MS", " 2500 "),
        ]))
        .unwrap();

        assert_eq!(config.neutral_coding_score, 0.0);
        assert_eq!(config.sandbox_timeout_ms, 2500);
        assert_eq!(config.neutral_subjective_score, 50.0);
    }

    #[test]
    fn test_unparsable_value_is_error() {
        let err = ScoringConfig::from_lookup(lookup_from(&[(
            "SKILLGRADE_MAX_PARALLEL_ANSWERS",
            "many",
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("SKILLGRADE_MAX_PARALLEL_ANSWERS"));
    }

    #[test]
    fn test_out_of_range_threshold_is_error() {
        let result = ScoringConfig::from_lookup(lookup_from(&[(
            "SKILLGRADE_PLAGIARISM_THRESHOLD",
            "1.5",
        )]));
        assert!(result.is_err());
    }
}
