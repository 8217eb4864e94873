//! Stage-aware adaptive item selection.
//!
//! Utility maximization with ε-greedy exploration over the unused,
//! regime-eligible slice of the bank. Three ordered stages shape the
//! weights: A chases broad coverage, B chases uncertainty reduction, C
//! chases safety and robustness probes. A sentinel-injection window every
//! fourth call (and a stage-C deficit filter) keeps the robustness
//! reservoir filling even when sentinels lose on raw utility.
//!
//! The RNG is an injected, per-run seeded `StdRng` — the sole source of
//! non-determinism in the engine. Candidate sorting is stable, so ties
//! keep the pool's insertion order and runs replay byte-identically under
//! a fixed seed.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::config::RunConfig;
use crate::engine::mirt::DiagonalMirt;
use crate::engine::posterior::PosteriorState;
use crate::item::Item;
use crate::traits::TraitRegistry;

/// Per-critical-trait coverage weight in the utility bonus.
const COVERAGE_WEIGHT: f64 = 0.035;
/// Exposure penalty scale (√count).
const EXPOSURE_WEIGHT: f64 = 0.04;
/// Novelty bonus for sentinels.
const NOVELTY_SENTINEL: f64 = 0.09;
/// Novelty bonus for OOD or paraphrase-group items.
const NOVELTY_OOD_OR_PARAPHRASE: f64 = 0.05;

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

/// Selection phase within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    /// Broad coverage.
    A,
    /// Uncertainty-driven refinement.
    B,
    /// Safety and robustness validation.
    C,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => f.write_str("A"),
            Self::B => f.write_str("B"),
            Self::C => f.write_str("C"),
        }
    }
}

/// Calls administered per stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageCounts {
    #[serde(rename = "A")]
    pub a: u32,
    #[serde(rename = "B")]
    pub b: u32,
    #[serde(rename = "C")]
    pub c: u32,
}

impl StageCounts {
    pub fn get(&self, stage: Stage) -> u32 {
        match stage {
            Stage::A => self.a,
            Stage::B => self.b,
            Stage::C => self.c,
        }
    }

    pub fn increment(&mut self, stage: Stage) {
        match stage {
            Stage::A => self.a += 1,
            Stage::B => self.b += 1,
            Stage::C => self.c += 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Selection decision
// ---------------------------------------------------------------------------

/// Outcome of one selection step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionDecision {
    /// Index of the chosen item in the bank.
    pub item_index: usize,
    pub expected_gain: f64,
    pub utility: f64,
    pub epsilon: f64,
    pub stage: Stage,
}

#[derive(Debug, Clone, Copy)]
struct ScoredCandidate {
    item_index: usize,
    utility: f64,
    expected_gain: f64,
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Stage-aware utility maximization with ε exploration.
#[derive(Debug)]
pub struct Selector {
    config: Arc<RunConfig>,
    mirt: DiagonalMirt,
    rng: StdRng,
}

impl Selector {
    pub fn new(config: Arc<RunConfig>, mirt: DiagonalMirt, seed: u64) -> Self {
        Self {
            config,
            mirt,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Decide the current stage from stage counts and critical coverage.
    ///
    /// A runs to its minimum, then extends to its maximum while any
    /// critical trait has fewer than two primary exposures; B likewise
    /// extends while any critical trait is short of
    /// `min_items_per_critical_trait`; everything after is C.
    pub fn current_stage(
        &self,
        stage_counts: &StageCounts,
        trait_counts: &[u32],
        registry: &TraitRegistry,
    ) -> Stage {
        let min_critical = self
            .config
            .critical_traits
            .iter()
            .filter_map(|code| registry.index_of(code))
            .map(|idx| trait_counts[idx])
            .min()
            .unwrap_or(0);

        if stage_counts.a < self.config.stage_a_min {
            return Stage::A;
        }
        if stage_counts.a < self.config.stage_a_max && min_critical < 2 {
            return Stage::A;
        }

        if stage_counts.b < self.config.stage_b_min {
            return Stage::B;
        }
        if stage_counts.b < self.config.stage_b_max
            && min_critical < self.config.min_items_per_critical_trait
        {
            return Stage::B;
        }

        Stage::C
    }

    fn epsilon(&self, call_index: u32) -> f64 {
        let denom = self.config.call_cap.saturating_sub(1).max(1);
        let frac = (f64::from(call_index) / f64::from(denom)).clamp(0.0, 1.0);
        self.config.exploration_start
            + frac * (self.config.exploration_end - self.config.exploration_start)
    }

    fn coverage_bonus(&self, item: &Item, trait_counts: &[u32], registry: &TraitRegistry) -> f64 {
        let mut bonus = 0.0;
        for (code, loading) in &item.trait_loadings {
            if !self.config.critical_traits.iter().any(|c| c == code) {
                continue;
            }
            let count = registry
                .index_of(code)
                .map_or(0, |idx| trait_counts[idx]);
            let deficit = self.config.min_items_per_critical_trait.saturating_sub(count);
            bonus += loading * COVERAGE_WEIGHT * f64::from(deficit);
        }
        bonus
    }

    fn novelty_bonus(item: &Item) -> f64 {
        if item.is_sentinel {
            NOVELTY_SENTINEL
        } else if item.is_ood || item.paraphrase_group.is_some() {
            NOVELTY_OOD_OR_PARAPHRASE
        } else {
            0.0
        }
    }

    fn utility(
        &self,
        item: &Item,
        posterior: &PosteriorState,
        registry: &TraitRegistry,
        trait_counts: &[u32],
        stage: Stage,
        exposure_count: u32,
    ) -> (f64, f64) {
        let expected_gain = self.mirt.expected_information_gain(item, posterior, registry);
        let coverage = self.coverage_bonus(item, trait_counts, registry);
        let novelty = Self::novelty_bonus(item);

        let (w_info, w_coverage, w_novelty) = match stage {
            Stage::A => (0.7, 1.5, 0.7),
            Stage::B => (1.4, 1.0, 0.8),
            Stage::C => (1.0, 0.8, 1.6),
        };

        let exposure_penalty = EXPOSURE_WEIGHT * f64::from(exposure_count).sqrt();
        let utility =
            w_info * expected_gain + w_coverage * coverage + w_novelty * novelty - exposure_penalty;
        (utility, expected_gain)
    }

    /// Pick the next item for the current regime, or `None` when the pool
    /// is exhausted.
    #[allow(clippy::too_many_arguments)]
    pub fn select_next_item(
        &mut self,
        bank: &[Item],
        posterior: &PosteriorState,
        registry: &TraitRegistry,
        regime_id: &str,
        trait_counts: &[u32],
        used: &[bool],
        exposure_counts: &[u32],
        call_index: u32,
        stage: Stage,
        sentinel_count: u32,
    ) -> Option<SelectionDecision> {
        let sentinel_deficit = sentinel_count < self.config.sentinel_minimum;
        let must_inject_sentinel = (call_index + 1) % 4 == 0 && sentinel_deficit;

        let mut pool: Vec<usize> = (0..bank.len())
            .filter(|&i| !used[i] && bank[i].allows_regime(regime_id))
            .collect();

        if must_inject_sentinel {
            let sentinel_pool: Vec<usize> = pool
                .iter()
                .copied()
                .filter(|&i| bank[i].is_robustness_probe())
                .collect();
            if !sentinel_pool.is_empty() {
                pool = sentinel_pool;
            }
        }

        if stage == Stage::C && sentinel_deficit {
            let stage_c_pool: Vec<usize> = pool
                .iter()
                .copied()
                .filter(|&i| bank[i].is_robustness_probe())
                .collect();
            if !stage_c_pool.is_empty() {
                pool = stage_c_pool;
            }
        }

        if pool.is_empty() {
            return None;
        }

        let mut scored: Vec<ScoredCandidate> = pool
            .iter()
            .map(|&item_index| {
                let (utility, expected_gain) = self.utility(
                    &bank[item_index],
                    posterior,
                    registry,
                    trait_counts,
                    stage,
                    exposure_counts[item_index],
                );
                ScoredCandidate {
                    item_index,
                    utility,
                    expected_gain,
                }
            })
            .collect();

        // Stable sort: equal utilities keep pool insertion order, which the
        // determinism contract depends on.
        scored.sort_by(|x, y| y.utility.total_cmp(&x.utility));

        let epsilon = self.epsilon(call_index);
        // Top-k of clamp(3, 8), capped by the pool size.
        let k = scored.len().min(8).max(3).min(scored.len());
        let top = &scored[..k];

        let selected = if self.rng.r#gen::<f64>() < epsilon {
            top[self.rng.gen_range(0..top.len())]
        } else {
            top[0]
        };

        tracing::debug!(
            stage = %stage,
            regime = regime_id,
            item = %bank[selected.item_index].item_id,
            utility = selected.utility,
            expected_gain = selected.expected_gain,
            epsilon,
            pool = pool.len(),
            forced_sentinel = must_inject_sentinel,
            "selected next probe"
        );

        Some(SelectionDecision {
            item_index: selected.item_index,
            expected_gain: selected.expected_gain,
            utility: selected.utility,
            epsilon,
            stage,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::item::ScoringKind;

    fn probe(id: &str, loadings: &[(&str, f64)]) -> Item {
        Item {
            item_id: id.to_string(),
            family: "deterministic_qa_math_logic".to_string(),
            prompt: "p".to_string(),
            scoring_type: ScoringKind::ExactText,
            trait_loadings: loadings
                .iter()
                .map(|(c, l)| ((*c).to_string(), *l))
                .collect::<BTreeMap<_, _>>(),
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

    fn selector(seed: u64) -> (Selector, TraitRegistry) {
        let config = Arc::new(RunConfig::default());
        (
            Selector::new(config, DiagonalMirt::default(), seed),
            TraitRegistry::standard(),
        )
    }

    #[test]
    fn stage_progression_respects_minima_and_coverage() {
        let (selector, registry) = selector(7);
        let zero_counts = vec![0_u32; registry.len()];

        let mut counts = StageCounts::default();
        assert_eq!(selector.current_stage(&counts, &zero_counts, &registry), Stage::A);

        // Past the A minimum with no critical coverage: A extends.
        counts.a = 16;
        assert_eq!(selector.current_stage(&counts, &zero_counts, &registry), Stage::A);

        // Coverage satisfied: B begins.
        let covered = vec![6_u32; registry.len()];
        assert_eq!(selector.current_stage(&counts, &covered, &registry), Stage::B);

        counts.b = 18;
        assert_eq!(selector.current_stage(&counts, &covered, &registry), Stage::C);

        // B extends to its max while critical coverage is short.
        let thin = vec![3_u32; registry.len()];
        assert_eq!(selector.current_stage(&counts, &thin, &registry), Stage::B);
        counts.b = 26;
        assert_eq!(selector.current_stage(&counts, &thin, &registry), Stage::C);
    }

    #[test]
    fn epsilon_interpolates_from_start_to_end() {
        let (selector, _) = selector(7);
        assert!((selector.epsilon(0) - 0.25).abs() < 1e-12);
        assert!((selector.epsilon(59) - 0.10).abs() < 1e-12);
        let mid = selector.epsilon(30);
        assert!(mid < 0.25 && mid > 0.10);
    }

    #[test]
    fn empty_pool_returns_none() {
        let (mut selector, registry) = selector(7);
        let bank = vec![probe("i1", &[("T1", 1.0)])];
        let posterior = PosteriorState::prior(registry.len(), 1.0);
        let counts = vec![0_u32; registry.len()];
        let decision = selector.select_next_item(
            &bank,
            &posterior,
            &registry,
            "core",
            &counts,
            &[true],
            &[0],
            0,
            Stage::A,
            0,
        );
        assert!(decision.is_none());
    }

    #[test]
    fn regime_tags_filter_the_pool() {
        let (mut selector, registry) = selector(7);
        let mut safety_only = probe("safety-only", &[("T8", 1.0)]);
        safety_only.regime_tags = vec!["safety".to_string()];
        let bank = vec![safety_only, probe("core-1", &[("T1", 1.0)])];
        let posterior = PosteriorState::prior(registry.len(), 1.0);
        let counts = vec![0_u32; registry.len()];
        let decision = selector
            .select_next_item(
                &bank,
                &posterior,
                &registry,
                "core",
                &counts,
                &[false, false],
                &[0, 0],
                0,
                Stage::A,
                0,
            )
            .expect("core pool is non-empty");
        assert_eq!(bank[decision.item_index].item_id, "core-1");
    }

    #[test]
    fn sentinel_injection_window_filters_to_robustness_probes() {
        let (mut selector, registry) = selector(7);
        let mut sentinel = probe("sent-1", &[("T7", 0.2)]);
        sentinel.is_sentinel = true;
        let bank = vec![probe("plain-1", &[("T1", 1.0)]), sentinel];
        let posterior = PosteriorState::prior(registry.len(), 1.0);
        let counts = vec![0_u32; registry.len()];
        // call_index 3 → (3 + 1) % 4 == 0 with a sentinel deficit.
        let decision = selector
            .select_next_item(
                &bank,
                &posterior,
                &registry,
                "core",
                &counts,
                &[false, false],
                &[0, 0],
                3,
                Stage::A,
                0,
            )
            .expect("sentinel pool is non-empty");
        assert_eq!(bank[decision.item_index].item_id, "sent-1");
    }

    #[test]
    fn coverage_bonus_prefers_deficient_critical_traits() {
        // Exploration effectively disabled so the greedy pick is observable.
        let config = Arc::new(RunConfig {
            exploration_start: 1e-9,
            exploration_end: 1e-9,
            ..Default::default()
        });
        let mut selector = Selector::new(config, DiagonalMirt::default(), 7);
        let registry = TraitRegistry::standard();
        let bank = vec![
            probe("noncritical", &[("T1", 1.0)]),
            probe("critical", &[("T8", 1.0)]),
        ];
        let posterior = PosteriorState::prior(registry.len(), 1.0);
        let counts = vec![0_u32; registry.len()];
        // Stage A weights coverage highest; T8 is critical and uncovered.
        let decision = selector
            .select_next_item(
                &bank,
                &posterior,
                &registry,
                "core",
                &counts,
                &[false, false],
                &[0, 0],
                0,
                Stage::A,
                8, // no sentinel pressure
            )
            .expect("pool is non-empty");
        assert_eq!(bank[decision.item_index].item_id, "critical");
        assert!(decision.utility > 0.0);
    }

    #[test]
    fn same_seed_replays_identical_choices() {
        let registry = TraitRegistry::standard();
        let bank: Vec<Item> = (0..20)
            .map(|i| probe(&format!("i{i}"), &[("T1", 0.5 + 0.02 * i as f64)]))
            .collect();
        let posterior = PosteriorState::prior(registry.len(), 1.0);
        let counts = vec![0_u32; registry.len()];
        let exposure = vec![0_u32; bank.len()];

        let picks = |seed: u64| -> Vec<usize> {
            let config = Arc::new(RunConfig::default());
            let mut sel = Selector::new(config, DiagonalMirt::default(), seed);
            let mut used = vec![false; bank.len()];
            let mut out = Vec::new();
            for call in 0..10 {
                let d = sel
                    .select_next_item(
                        &bank, &posterior, &registry, "core", &counts, &used, &exposure,
                        call, Stage::A, 8,
                    )
                    .unwrap();
                used[d.item_index] = true;
                out.push(d.item_index);
            }
            out
        };

        assert_eq!(picks(1234), picks(1234));
    }
}
