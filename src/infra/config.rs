// src/infra/config.rs — Configuration loading (TOML)

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub cycle: CycleConfig,

    #[serde(default)]
    pub context: ContextConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// API key for the model provider. Must be at least 10 characters.
    pub key: String,
    pub core_model: String,
    pub critique_model: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            key: String::new(),
            core_model: "gemini-2.5-pro".into(),
            critique_model: "gemini-2.5-flash".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Retries per iteration before escalating to a human.
    pub max_retries: u32,
    /// Hard cap on total cycles (0 = unlimited).
    pub max_cycles: u64,
    /// Force a human pause every N cycles (0 = never).
    pub pause_after_cycles: u64,
    /// Iterations exceeding this wall-clock bound escalate to a human.
    pub max_cycle_time_secs: u64,
    /// Confidence below this threshold escalates to a human.
    pub auto_critique_thresh: f64,
    /// Percent chance (0-100) of a random human review.
    pub human_review_prob: u32,
    /// Percent chance (0-100) of running the automated critique.
    pub llm_critique_prob: u32,
    /// Persona balance ratio (0-100); >= 50 selects the divergent persona.
    pub persona_balance: u32,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            max_retries: 1,
            max_cycles: 0,
            pause_after_cycles: 0,
            max_cycle_time_secs: 600,
            auto_critique_thresh: 0.75,
            human_review_prob: 0,
            llm_critique_prob: 50,
            persona_balance: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    /// Warn when the running context-token estimate crosses this line.
    pub token_warn_threshold: u64,
    /// Artifact snippets included in the core prompt.
    pub snippet_limit: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            token_warn_threshold: 925_000,
            snippet_limit: 10,
        }
    }
}

impl Config {
    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_reasonable() {
        let c = Config::default();
        assert_eq!(c.cycle.max_retries, 1);
        assert_eq!(c.cycle.pause_after_cycles, 0);
        assert_eq!(c.cycle.max_cycle_time_secs, 600);
        assert!((c.cycle.auto_critique_thresh - 0.75).abs() < 0.001);
        assert_eq!(c.cycle.human_review_prob, 0);
        assert_eq!(c.cycle.llm_critique_prob, 50);
        assert_eq!(c.cycle.persona_balance, 50);
        assert_eq!(c.context.token_warn_threshold, 925_000);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.cycle.max_retries, 1);
        assert_eq!(config.api.core_model, "gemini-2.5-pro");
    }

    #[test]
    fn test_parse_full_toml() {
        let toml_str = r#"
[api]
key = "test-key-0123456789"
core_model = "gemini-2.5-pro"
critique_model = "gemini-2.5-flash"

[cycle]
max_retries = 3
max_cycles = 100
pause_after_cycles = 5
max_cycle_time_secs = 300
auto_critique_thresh = 0.9
human_review_prob = 10
llm_critique_prob = 80
persona_balance = 30

[context]
token_warn_threshold = 500000
snippet_limit = 5
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.api.key, "test-key-0123456789");
        assert_eq!(config.cycle.max_retries, 3);
        assert_eq!(config.cycle.max_cycles, 100);
        assert_eq!(config.cycle.pause_after_cycles, 5);
        assert!((config.cycle.auto_critique_thresh - 0.9).abs() < 0.001);
        assert_eq!(config.cycle.persona_balance, 30);
        assert_eq!(config.context.token_warn_threshold, 500_000);
        assert_eq!(config.context.snippet_limit, 5);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = Config::default();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(deserialized.cycle.max_retries, config.cycle.max_retries);
        assert_eq!(
            deserialized.context.token_warn_threshold,
            config.context.token_warn_threshold
        );
    }

    #[test]
    fn test_load_nonexistent_file() {
        let result = Config::load_from(Path::new("/nonexistent/config.toml"));
        assert!(result.is_err());
    }
}
