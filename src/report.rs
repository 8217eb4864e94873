//! Profile report and trace records.
//!
//! The report is materialized once, at stop, and never mutated. Its JSON
//! envelope is a stable public shape:
//!
//! ```text
//! { run_id, model_id,
//!   regimes: [{ regime_id, trait_estimates: [{ trait, mean, sd, ci95, reliability }] }],
//!   diagnostics: {...}, risk_flags: {...},
//!   budget: { calls_used, tokens_prompt, tokens_completion },
//!   stop_reason, records: [...] }
//! ```
//!
//! Records are append-only during the run and carry full pre/post posterior
//! snapshots plus the selection context at decision time, so a trace can be
//! replayed or audited without the engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::posterior::{PosteriorSnapshot, PosteriorState};
use crate::engine::selector::{Stage, StageCounts};
use crate::engine::stopping::StopReason;
use crate::item::ScoringKind;
use crate::traits::TraitRegistry;

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Selection state captured at the moment an item was chosen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionContext {
    pub stage: Stage,
    pub expected_gain: f64,
    pub utility: f64,
    pub epsilon: f64,
    pub stage_counts_before: StageCounts,
    pub sentinel_count_before: u32,
    pub critical_trait_counts_before: BTreeMap<String, u32>,
}

/// Execution trace for one administered item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseRecord {
    pub call_index: u32,
    pub stage: Stage,
    pub regime_id: String,
    pub item_id: String,
    pub family: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
    pub expected_probability: f64,
    pub score: f64,
    pub score_components: BTreeMap<String, f64>,
    pub prompt_text: String,
    pub response_text: String,
    pub scoring_type: ScoringKind,
    pub trait_loadings: BTreeMap<String, f64>,
    pub item_metadata: serde_json::Map<String, serde_json::Value>,
    pub posterior_before: PosteriorSnapshot,
    pub posterior_after: PosteriorSnapshot,
    pub selection_context: SelectionContext,
}

// ---------------------------------------------------------------------------
// Estimates
// ---------------------------------------------------------------------------

/// Final estimate for one trait under one regime.
///
/// `ci95` is the latent-scale interval µ ± 1.96σ; the stopping policy's CI
/// check uses the logistic-scale width instead. The two units are
/// intentional and must not be merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitEstimate {
    #[serde(rename = "trait")]
    pub trait_code: String,
    pub mean: f64,
    pub sd: f64,
    pub ci95: (f64, f64),
    pub reliability: f64,
}

/// Final report section for one regime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeReport {
    pub regime_id: String,
    pub trait_estimates: Vec<TraitEstimate>,
}

impl RegimeReport {
    /// Build the per-trait estimates for one regime's posterior.
    pub fn from_posterior(
        regime_id: &str,
        posterior: &PosteriorState,
        registry: &TraitRegistry,
    ) -> Self {
        let trait_estimates = registry
            .codes()
            .iter()
            .enumerate()
            .map(|(idx, code)| {
                let mean = posterior.mean(idx);
                let sd = posterior.sd(idx);
                let delta = 1.96 * sd;
                TraitEstimate {
                    trait_code: code.clone(),
                    mean,
                    sd,
                    ci95: (mean - delta, mean + delta),
                    reliability: posterior.reliability(idx),
                }
            })
            .collect();
        Self {
            regime_id: regime_id.to_string(),
            trait_estimates,
        }
    }
}

// ---------------------------------------------------------------------------
// Diagnostics, flags, budget
// ---------------------------------------------------------------------------

/// Post-run diagnostics block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDiagnostics {
    pub critical_reliability_met: bool,
    pub critical_ci_met: bool,
    pub critical_coverage_met: bool,
    pub sentinel_items_sampled: u32,
    pub bti: f64,
    pub ood_gap: f64,
    pub paraphrase_consistency: f64,
    pub calls_in_stage_a: u32,
    pub calls_in_stage_b: u32,
    pub calls_in_stage_c: u32,
    pub in_bank_mean: f64,
    pub ood_mean: f64,
    pub person_fit_anomaly: f64,
    pub refusal_error_rate: f64,
}

/// Risk flags derived from diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskFlags {
    pub benchmark_overfit: bool,
    pub instability: bool,
    pub calibration_risk: bool,
    pub refusal_risk: bool,
}

/// Budget usage for one profile run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetStats {
    pub calls_used: u32,
    #[serde(rename = "tokens_prompt")]
    pub prompt_tokens: u32,
    #[serde(rename = "tokens_completion")]
    pub completion_tokens: u32,
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

/// Top-level profile output. Immutable once materialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileReport {
    pub run_id: String,
    pub model_id: String,
    pub regimes: Vec<RegimeReport>,
    pub diagnostics: RunDiagnostics,
    pub risk_flags: RiskFlags,
    pub budget: BudgetStats,
    pub stop_reason: StopReason,
    pub records: Vec<ResponseRecord>,
}

impl ProfileReport {
    /// Estimates for one regime, if it was profiled.
    pub fn regime(&self, regime_id: &str) -> Option<&RegimeReport> {
        self.regimes.iter().find(|r| r.regime_id == regime_id)
    }
}
