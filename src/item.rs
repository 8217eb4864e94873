//! Probe item model.
//!
//! An [`Item`] is an immutable probe descriptor: the prompt, how to score
//! the response, which traits it loads, and the robustness flags the
//! selector and diagnostics care about. Items live in a static bank loaded
//! once per run; nothing mutates them afterwards.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Loading at or above this threshold counts as a primary exposure for the
/// trait's coverage counter.
pub const PRIMARY_LOADING: f64 = 0.4;

// ---------------------------------------------------------------------------
// Scoring kinds
// ---------------------------------------------------------------------------

/// Deterministic scoring contract attached to an item.
///
/// One variant per canonical scoring type; `Unknown` catches unrecognized
/// tags so a data-driven bank still loads, and the scorer handles it via
/// the bare-scalar fallback path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringKind {
    ExactText,
    FinalLineExact,
    JsonMatch,
    JsonReasonedAnswer,
    WordLimitKeywords,
    CalibrationTruth,
    UnknownCalibration,
    SingleQuestion,
    StepsAndWarning,
    ClassifyAction,
    ContainsKeywords,
    ToolGrounded,
    AbstainRequired,
    YamlEnumReason,
    ClassWithConfidence,
    ConstraintScore,
    InvariancePair,
    DriftRepeat,
    #[serde(other)]
    Unknown,
}

impl ScoringKind {
    /// Wire tag for this scoring kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExactText => "exact_text",
            Self::FinalLineExact => "final_line_exact",
            Self::JsonMatch => "json_match",
            Self::JsonReasonedAnswer => "json_reasoned_answer",
            Self::WordLimitKeywords => "word_limit_keywords",
            Self::CalibrationTruth => "calibration_truth",
            Self::UnknownCalibration => "unknown_calibration",
            Self::SingleQuestion => "single_question",
            Self::StepsAndWarning => "steps_and_warning",
            Self::ClassifyAction => "classify_action",
            Self::ContainsKeywords => "contains_keywords",
            Self::ToolGrounded => "tool_grounded",
            Self::AbstainRequired => "abstain_required",
            Self::YamlEnumReason => "yaml_enum_reason",
            Self::ClassWithConfidence => "class_with_confidence",
            Self::ConstraintScore => "constraint_score",
            Self::InvariancePair => "invariance_pair",
            Self::DriftRepeat => "drift_repeat",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ScoringKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Action classes
// ---------------------------------------------------------------------------

/// Expected response class for `classify_action` items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionClass {
    Refuse,
    Clarify,
    Comply,
}

impl std::fmt::Display for ActionClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Refuse => f.write_str("refuse"),
            Self::Clarify => f.write_str("clarify"),
            Self::Comply => f.write_str("comply"),
        }
    }
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

fn default_regime_tags() -> Vec<String> {
    vec!["core".to_string(), "safety".to_string()]
}

/// Immutable probe descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub item_id: String,
    pub family: String,
    pub prompt: String,
    pub scoring_type: ScoringKind,
    /// Trait code → loading. Loadings on codes absent from the registry
    /// are ignored by the kernel.
    pub trait_loadings: BTreeMap<String, f64>,
    #[serde(default)]
    pub difficulty: f64,
    /// Pseudo-guessing floor, clamped to [0, 0.35] by the kernel.
    #[serde(default)]
    pub guessing: f64,
    /// Regimes this item may be administered under.
    #[serde(default = "default_regime_tags")]
    pub regime_tags: Vec<String>,
    #[serde(default)]
    pub paraphrase_group: Option<String>,
    #[serde(default)]
    pub is_ood: bool,
    #[serde(default)]
    pub is_sentinel: bool,
    #[serde(default)]
    pub expected_class: Option<ActionClass>,
    /// Free-form scoring metadata: expected answers, keyword lists,
    /// thresholds.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Item {
    /// Whether this item is eligible under the given regime.
    pub fn allows_regime(&self, regime_id: &str) -> bool {
        self.regime_tags.iter().any(|t| t == regime_id)
    }

    /// Whether this item counts toward the robustness reservoir.
    ///
    /// Sentinel, OOD, and paraphrase-group items share one reservoir; the
    /// sentinel minimum is tuned against the union, not the parts.
    pub fn is_robustness_probe(&self) -> bool {
        self.is_sentinel || self.is_ood || self.paraphrase_group.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_item(id: &str) -> Item {
        Item {
            item_id: id.to_string(),
            family: "deterministic_qa_math_logic".to_string(),
            prompt: "Return only integer: 1+1".to_string(),
            scoring_type: ScoringKind::ExactText,
            trait_loadings: BTreeMap::from([("T1".to_string(), 1.0)]),
            difficulty: 0.0,
            guessing: 0.0,
            regime_tags: vec!["core".to_string()],
            paraphrase_group: None,
            is_ood: false,
            is_sentinel: false,
            expected_class: None,
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn scoring_kind_round_trips_through_wire_tag() {
        let kinds = [
            ScoringKind::ExactText,
            ScoringKind::JsonReasonedAnswer,
            ScoringKind::ClassWithConfidence,
            ScoringKind::DriftRepeat,
        ];
        for kind in kinds {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
            let back: ScoringKind = serde_json::from_str(&json).unwrap();
            assert_eq!(back, kind);
        }
    }

    #[test]
    fn unrecognized_scoring_tag_loads_as_unknown() {
        let kind: ScoringKind = serde_json::from_str("\"holographic_rubric\"").unwrap();
        assert_eq!(kind, ScoringKind::Unknown);
    }

    #[test]
    fn regime_eligibility() {
        let item = minimal_item("I-1");
        assert!(item.allows_regime("core"));
        assert!(!item.allows_regime("safety"));
    }

    #[test]
    fn robustness_probe_union() {
        let mut item = minimal_item("I-2");
        assert!(!item.is_robustness_probe());
        item.is_ood = true;
        assert!(item.is_robustness_probe());
        item.is_ood = false;
        item.paraphrase_group = Some("pg_1".to_string());
        assert!(item.is_robustness_probe());
    }

    #[test]
    fn item_deserializes_with_defaults() {
        let json = r#"{
            "item_id": "I-3",
            "family": "grounding_traps",
            "prompt": "Quote the context.",
            "scoring_type": "contains_keywords",
            "trait_loadings": {"T6": 0.7}
        }"#;
        let item: Item = serde_json::from_str(json).unwrap();
        assert_eq!(item.regime_tags, vec!["core", "safety"]);
        assert_eq!(item.difficulty, 0.0);
        assert!(item.expected_class.is_none());
    }
}
