// Language registry for the sandbox
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

pub const DEFAULT_LANGUAGES_PATH: &str = "config/languages.json";

/// How a test case's produced output is compared with its expected output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    /// The candidate defines `solution(...)`; a driver stringifies its return value
    /// and the expected literal with the same convention.
    FunctionResult,
    /// The program reads stdin and prints; trimmed stdout must equal the trimmed expectation.
    Stdout,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    pub image: String,
    /// File name the program is written to inside the scratch area
    pub file_name: String,
    #[serde(default)]
    pub compile: Option<String>,
    pub run: String,
    pub comparison: Comparison,
    pub memory_limit_mb: u32,
    pub cpu_limit: f64,
    /// Overrides the scoring config's sandbox timeout for slow toolchains
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,
}

fn default_pids_limit() -> i64 {
    64
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Supported languages, keyed by lowercase name
#[derive(Debug, Clone, Default)]
pub struct LanguageRegistry {
    configs: HashMap<String, LanguageConfig>,
}

impl LanguageRegistry {
    /// Load language configurations from languages.json
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;

        Self::from_json(&content)
    }

    /// Load from `SKILLGRADE_LANGUAGES` or config/languages.json
    pub fn load_default() -> Result<Self> {
        let path = std::env::var("SKILLGRADE_LANGUAGES")
            .unwrap_or_else(|_| DEFAULT_LANGUAGES_PATH.to_string());
        Self::load(Path::new(&path))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let languages_json: LanguagesJson =
            serde_json::from_str(content).context("Failed to parse languages.json")?;

        Self::from_configs(languages_json.languages)
    }

    pub fn from_configs(languages: Vec<LanguageConfig>) -> Result<Self> {
        let mut configs = HashMap::new();
        for lang in languages {
            if lang.image.is_empty() || lang.run.is_empty() || lang.file_name.is_empty() {
                bail!("Language '{}' is missing image, run command or file name", lang.name);
            }
            let key = lang.name.to_lowercase();
            if configs.insert(key, lang).is_some() {
                bail!("Duplicate language entry in languages.json");
            }
        }

        if configs.is_empty() {
            bail!("No languages configured in languages.json");
        }

        Ok(Self { configs })
    }

    /// Case-insensitive lookup
    pub fn get(&self, language: &str) -> Option<&LanguageConfig> {
        self.configs.get(&language.trim().to_lowercase())
    }

    /// List all supported languages
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().cloned().collect();
        names.sort();
        names
    }
}
