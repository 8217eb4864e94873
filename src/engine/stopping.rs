//! Multi-predicate stopping policy.
//!
//! Evaluated after every record, in a fixed order where the first matching
//! predicate wins: hard caps first, then floors (minimum calls, stage-C
//! minimum, sentinel minimum, gain patience), then convergence checks on
//! the critical traits (coverage, reliability, CI width). Terminal and
//! continuation outcomes are distinct types, so a report can never carry a
//! continuation code as its stop reason.

use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::engine::posterior::PosteriorState;
use crate::engine::selector::StageCounts;
use crate::traits::TraitRegistry;

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal reasons a run can stop with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    CallCapReached,
    TokenCapReached,
    ItemPoolExhausted,
    GlobalUncertaintyThresholdMet,
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CallCapReached => "call_cap_reached",
            Self::TokenCapReached => "token_cap_reached",
            Self::ItemPoolExhausted => "item_pool_exhausted",
            Self::GlobalUncertaintyThresholdMet => "global_uncertainty_threshold_met",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Continuation reasons: why the run is not allowed to stop yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    MinCallsNotMet,
    StageCMinNotMet,
    SentinelMinimumNotMet,
    GainFloorNotMet,
    CriticalCoverageNotMet,
    ReliabilityNotMet,
    CiNotMet,
}

impl HoldReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MinCallsNotMet => "min_calls_not_met",
            Self::StageCMinNotMet => "stage_c_min_not_met",
            Self::SentinelMinimumNotMet => "sentinel_minimum_not_met",
            Self::GainFloorNotMet => "gain_floor_not_met",
            Self::CriticalCoverageNotMet => "critical_coverage_not_met",
            Self::ReliabilityNotMet => "reliability_not_met",
            Self::CiNotMet => "ci_not_met",
        }
    }
}

impl std::fmt::Display for HoldReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict of one stop evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Stop(StopReason),
    Hold(HoldReason),
}

impl Verdict {
    pub fn reason_str(&self) -> &'static str {
        match self {
            Self::Stop(r) => r.as_str(),
            Self::Hold(r) => r.as_str(),
        }
    }
}

/// Convergence status of the critical traits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CriticalStatus {
    pub reliability_ok: bool,
    pub ci_ok: bool,
    pub coverage_ok: bool,
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// Inputs to one stop evaluation, captured after a record is appended.
#[derive(Debug, Clone, Copy)]
pub struct StopInputs<'a> {
    pub total_calls: u32,
    pub stage_counts: &'a StageCounts,
    pub low_gain_streak: u32,
    pub sentinel_count: u32,
}

/// Check reliability/CI/coverage of every critical trait.
///
/// Convergence is anchored on the core-regime posterior when core has been
/// seen; otherwise every seen regime must satisfy the targets. An empty
/// active set fails all three checks.
pub fn critical_status<'a>(
    config: &RunConfig,
    registry: &TraitRegistry,
    active_posteriors: &[&'a PosteriorState],
    trait_counts: &[u32],
) -> CriticalStatus {
    if active_posteriors.is_empty() {
        return CriticalStatus {
            reliability_ok: false,
            ci_ok: false,
            coverage_ok: false,
        };
    }

    let mut status = CriticalStatus {
        reliability_ok: true,
        ci_ok: true,
        coverage_ok: true,
    };

    for code in &config.critical_traits {
        let Some(idx) = registry.index_of(code) else {
            status.coverage_ok = false;
            continue;
        };
        if trait_counts[idx] < config.min_items_per_critical_trait {
            status.coverage_ok = false;
        }
        for posterior in active_posteriors {
            if posterior.reliability(idx) < config.reliability_target {
                status.reliability_ok = false;
            }
            if posterior.ci95_width(idx) > config.ci_width_target {
                status.ci_ok = false;
            }
        }
    }

    status
}

/// Evaluate the ordered stop predicates; the first match wins.
pub fn evaluate(config: &RunConfig, inputs: &StopInputs<'_>, critical: CriticalStatus) -> Verdict {
    if inputs.total_calls >= config.call_cap {
        return Verdict::Stop(StopReason::CallCapReached);
    }
    if inputs.total_calls < config.min_calls_before_global_stop {
        return Verdict::Hold(HoldReason::MinCallsNotMet);
    }
    if inputs.stage_counts.c < config.stage_c_min {
        return Verdict::Hold(HoldReason::StageCMinNotMet);
    }
    if inputs.sentinel_count < config.sentinel_minimum {
        return Verdict::Hold(HoldReason::SentinelMinimumNotMet);
    }
    if inputs.low_gain_streak < config.low_gain_patience {
        return Verdict::Hold(HoldReason::GainFloorNotMet);
    }
    if !critical.coverage_ok {
        return Verdict::Hold(HoldReason::CriticalCoverageNotMet);
    }
    if !critical.reliability_ok {
        return Verdict::Hold(HoldReason::ReliabilityNotMet);
    }
    if !critical.ci_ok {
        return Verdict::Hold(HoldReason::CiNotMet);
    }
    Verdict::Stop(StopReason::GlobalUncertaintyThresholdMet)
}
