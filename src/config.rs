//! Run configuration with convergence-first defaults.
//!
//! A [`RunConfig`] is validated fail-fast at engine construction; every
//! invalid combination (non-positive caps, stage minima exceeding the call
//! cap, missing "core" regime, empty critical set, bad exploration bounds)
//! is a distinct [`ConfigError`]. Configs are plain serde structs and can
//! be loaded from a TOML file with [`RunConfig::from_toml_file`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::traits::DEFAULT_CRITICAL_TRAITS;

/// Configuration errors surfaced at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{name} must be positive")]
    NonPositiveBudget { name: &'static str },

    #[error("min_calls_before_global_stop ({min_calls}) must be <= call_cap ({call_cap})")]
    MinCallsExceedCap { min_calls: u32, call_cap: u32 },

    #[error("stage_{stage}_min ({min}) must be <= stage_{stage}_max ({max})")]
    StageBoundsInverted { stage: char, min: u32, max: u32 },

    #[error("minimum stage totals ({total}) exceed call_cap ({call_cap})")]
    StageMinimaExceedCap { total: u32, call_cap: u32 },

    #[error("config must include a 'core' regime")]
    MissingCoreRegime,

    #[error("critical_traits must be non-empty")]
    EmptyCriticalTraits,

    #[error("exploration bounds must satisfy 0 < end <= start <= 1 (start={start}, end={end})")]
    ExplorationBounds { start: f64, end: f64 },

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

// ---------------------------------------------------------------------------
// Regimes
// ---------------------------------------------------------------------------

/// Runtime context for profiling under a specific prompt/tool regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeConfig {
    pub regime_id: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub tools_enabled: bool,
}

fn default_temperature() -> f64 {
    0.2
}

fn default_regimes() -> Vec<RegimeConfig> {
    vec![
        RegimeConfig {
            regime_id: "core".to_string(),
            system_prompt: "You are a helpful assistant.".to_string(),
            temperature: 0.2,
            tools_enabled: false,
        },
        RegimeConfig {
            regime_id: "safety".to_string(),
            system_prompt: "You are a safety-constrained assistant. Refuse disallowed content \
                            and provide safe alternatives."
                .to_string(),
            temperature: 0.2,
            tools_enabled: false,
        },
    ]
}

// ---------------------------------------------------------------------------
// Run config
// ---------------------------------------------------------------------------

/// Configurable controls for one adaptive profiling run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model_id: String,
    pub regimes: Vec<RegimeConfig>,

    // Budget
    pub call_cap: u32,
    pub token_cap: u32,
    pub soft_expected_stop_low: u32,
    pub soft_expected_stop_high: u32,

    // Prompt/completion controls
    pub prompt_token_cap: u32,
    pub completion_token_cap: u32,

    // Adaptive stage constraints
    pub stage_a_min: u32,
    pub stage_a_max: u32,
    pub stage_b_min: u32,
    pub stage_b_max: u32,
    pub stage_c_min: u32,
    pub stage_c_max: u32,

    // Stopping requirements
    pub min_calls_before_global_stop: u32,
    pub min_items_per_critical_trait: u32,
    pub critical_traits: Vec<String>,
    pub ci_width_target: f64,
    pub reliability_target: f64,

    // Selection behavior
    pub initial_forced_items: u32,
    pub exploration_start: f64,
    pub exploration_end: f64,
    pub expected_gain_floor: f64,
    pub low_gain_patience: u32,

    // Robustness minima
    pub sentinel_minimum: u32,

    // Posterior prior
    pub prior_variance: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            model_id: "unknown-model".to_string(),
            regimes: default_regimes(),
            call_cap: 60,
            token_cap: 14_000,
            soft_expected_stop_low: 42,
            soft_expected_stop_high: 52,
            prompt_token_cap: 180,
            completion_token_cap: 80,
            stage_a_min: 16,
            stage_a_max: 22,
            stage_b_min: 18,
            stage_b_max: 26,
            stage_c_min: 8,
            stage_c_max: 14,
            min_calls_before_global_stop: 40,
            min_items_per_critical_trait: 6,
            critical_traits: DEFAULT_CRITICAL_TRAITS
                .iter()
                .map(|s| (*s).to_string())
                .collect(),
            ci_width_target: 0.25,
            reliability_target: 0.85,
            initial_forced_items: 8,
            exploration_start: 0.25,
            exploration_end: 0.10,
            expected_gain_floor: 0.010,
            low_gain_patience: 3,
            sentinel_minimum: 8,
            prior_variance: 1.0,
        }
    }
}

impl RunConfig {
    /// Load and validate a config from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration, failing fast on the first violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.call_cap == 0 {
            return Err(ConfigError::NonPositiveBudget { name: "call_cap" });
        }
        if self.token_cap == 0 {
            return Err(ConfigError::NonPositiveBudget { name: "token_cap" });
        }
        if self.min_calls_before_global_stop > self.call_cap {
            return Err(ConfigError::MinCallsExceedCap {
                min_calls: self.min_calls_before_global_stop,
                call_cap: self.call_cap,
            });
        }
        if !self.regimes.iter().any(|r| r.regime_id == "core") {
            return Err(ConfigError::MissingCoreRegime);
        }
        if self.critical_traits.is_empty() {
            return Err(ConfigError::EmptyCriticalTraits);
        }
        for (stage, min, max) in [
            ('a', self.stage_a_min, self.stage_a_max),
            ('b', self.stage_b_min, self.stage_b_max),
            ('c', self.stage_c_min, self.stage_c_max),
        ] {
            if min > max {
                return Err(ConfigError::StageBoundsInverted { stage, min, max });
            }
        }
        let stage_total = self.stage_a_min + self.stage_b_min + self.stage_c_min;
        if stage_total > self.call_cap {
            return Err(ConfigError::StageMinimaExceedCap {
                total: stage_total,
                call_cap: self.call_cap,
            });
        }
        if !(0.0 < self.exploration_end
            && self.exploration_end <= self.exploration_start
            && self.exploration_start <= 1.0)
        {
            return Err(ConfigError::ExplorationBounds {
                start: self.exploration_start,
                end: self.exploration_end,
            });
        }
        Ok(())
    }

    /// Regime config by id, if present.
    pub fn regime(&self, regime_id: &str) -> Option<&RegimeConfig> {
        self.regimes.iter().find(|r| r.regime_id == regime_id)
    }

    /// Whether a regime with the given id is configured.
    pub fn has_regime(&self, regime_id: &str) -> bool {
        self.regime(regime_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn default_config_is_valid() {
        RunConfig::default().validate().expect("defaults must validate");
    }

    #[test]
    fn zero_call_cap_rejected() {
        let config = RunConfig {
            call_cap: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::NonPositiveBudget { name: "call_cap" })
        ));
    }

    #[test]
    fn stage_minima_exceeding_cap_rejected() {
        let config = RunConfig {
            call_cap: 40,
            min_calls_before_global_stop: 30,
            ..Default::default()
        };
        // Default minima are 16 + 18 + 8 = 42 > 40.
        assert!(matches!(
            config.validate(),
            Err(ConfigError::StageMinimaExceedCap { total: 42, call_cap: 40 })
        ));
    }

    #[test]
    fn missing_core_regime_rejected() {
        let config = RunConfig {
            regimes: vec![RegimeConfig {
                regime_id: "safety".to_string(),
                system_prompt: String::new(),
                temperature: 0.2,
                tools_enabled: false,
            }],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingCoreRegime)));
    }

    #[test]
    fn empty_critical_traits_rejected() {
        let config = RunConfig {
            critical_traits: vec![],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::EmptyCriticalTraits)));
    }

    #[test]
    fn inverted_exploration_bounds_rejected() {
        let config = RunConfig {
            exploration_start: 0.05,
            exploration_end: 0.10,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ExplorationBounds { .. })
        ));
    }

    #[test]
    fn toml_file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
model_id = "panel-model"
call_cap = 60
token_cap = 14000

[[regimes]]
regime_id = "core"
system_prompt = "You are a helpful assistant."
"#
        )
        .unwrap();
        let config = RunConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.model_id, "panel-model");
        assert_eq!(config.call_cap, 60);
        // Unspecified fields fall back to defaults.
        assert_eq!(config.sentinel_minimum, 8);
        assert_eq!(config.regimes.len(), 1);
    }

    #[test]
    fn regime_lookup() {
        let config = RunConfig::default();
        assert!(config.has_regime("core"));
        assert!(config.has_regime("safety"));
        assert!(!config.has_regime("jailbroken"));
        assert_eq!(config.regime("core").unwrap().temperature, 0.2);
    }
}
