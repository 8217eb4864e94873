//! Diagonal multidimensional IRT kernel.
//!
//! A 2PL-with-guessing response model over the trait vector, kept cheap
//! and stable for online adaptive testing: expected probability, a
//! log1p information-gain surrogate, and a one-step Laplace update with
//! additive precision. No matrix inverse, no line search; traits the item
//! does not load are untouched.
//!
//! The gain surrogate (0.35·log1p(p(1−p)·Σ a²σ²)) is deliberately not the
//! closed-form Fisher information — the selector's stage weight table is
//! tuned against this exact form.

use crate::engine::posterior::PosteriorState;
use crate::item::Item;
use crate::traits::TraitRegistry;

/// Curvature contributions never fall below this floor.
const CURVATURE_FLOOR: f64 = 1e-6;

/// Branch-correct logistic function, stable for large |x|.
pub fn logistic(x: f64) -> f64 {
    if x >= 0.0 {
        let z = (-x).exp();
        1.0 / (1.0 + z)
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

/// Lightweight diagonal approximation for MIRT updates.
#[derive(Debug, Clone)]
pub struct DiagonalMirt {
    information_scale: f64,
}

impl Default for DiagonalMirt {
    fn default() -> Self {
        Self::new(25.0)
    }
}

impl DiagonalMirt {
    pub fn new(information_scale: f64) -> Self {
        Self {
            information_scale: information_scale.max(1.0),
        }
    }

    /// Linear predictor η = −difficulty + Σ loading·µ over registered
    /// traits. Loadings on unregistered codes are ignored.
    fn eta(&self, item: &Item, posterior: &PosteriorState, registry: &TraitRegistry) -> f64 {
        let mut eta = -item.difficulty;
        for (code, loading) in &item.trait_loadings {
            if let Some(idx) = registry.index_of(code) {
                eta += loading * posterior.mean(idx);
            }
        }
        eta
    }

    /// Expected response probability p = g + (1 − g)·σ(η), with the
    /// guessing floor clamped to [0, 0.35].
    pub fn expected_probability(
        &self,
        item: &Item,
        posterior: &PosteriorState,
        registry: &TraitRegistry,
    ) -> f64 {
        let base = logistic(self.eta(item, posterior, registry));
        let guess = item.guessing.clamp(0.0, 0.35);
        guess + (1.0 - guess) * base
    }

    /// Cheap monotone surrogate for posterior variance reduction under a
    /// proposed item.
    pub fn expected_information_gain(
        &self,
        item: &Item,
        posterior: &PosteriorState,
        registry: &TraitRegistry,
    ) -> f64 {
        let p = self.expected_probability(item, posterior, registry);
        let fisher_scale = (p * (1.0 - p)).max(1e-6);
        let mut variance_term = 0.0;
        for (code, loading) in &item.trait_loadings {
            if let Some(idx) = registry.index_of(code) {
                variance_term += loading * loading * posterior.variance(idx);
            }
        }
        0.35 * (fisher_scale * variance_term).ln_1p()
    }

    /// One-step online update for a score in [0, 1].
    ///
    /// The score may be binary or partial credit. The update is a Laplace
    /// step around the current mean with a diagonal curvature bound:
    /// precision gains h = k·(1−g)²·p(1−p)·a², mean moves by σ²·a·(s − p).
    /// Variance strictly shrinks for every trait with a nonzero loading.
    pub fn update(
        &self,
        posterior: &PosteriorState,
        item: &Item,
        score: f64,
        registry: &TraitRegistry,
    ) -> PosteriorState {
        let score = score.clamp(0.0, 1.0);
        let mut out = posterior.clone();
        let p = self.expected_probability(item, posterior, registry);
        let error = score - p;
        let guess = item.guessing.clamp(0.0, 0.35);

        for (code, loading) in &item.trait_loadings {
            let Some(idx) = registry.index_of(code) else {
                continue;
            };
            let prev_var = out.variance(idx).max(crate::engine::posterior::VARIANCE_FLOOR);
            let prev_prec = 1.0 / prev_var;

            let h_diag = (self.information_scale
                * (1.0 - guess).powi(2)
                * p
                * (1.0 - p)
                * (loading * loading))
                .max(CURVATURE_FLOOR);
            let new_prec = prev_prec + h_diag;
            let new_var = 1.0 / new_prec;

            let delta = new_var * loading * error;
            out.set(idx, out.mean(idx) + delta, new_var);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::item::ScoringKind;

    fn item_with_loadings(loadings: &[(&str, f64)], difficulty: f64, guessing: f64) -> Item {
        Item {
            item_id: "probe".to_string(),
            family: "deterministic_qa_math_logic".to_string(),
            prompt: "p".to_string(),
            scoring_type: ScoringKind::ExactText,
            trait_loadings: loadings
                .iter()
                .map(|(c, l)| ((*c).to_string(), *l))
                .collect::<BTreeMap<_, _>>(),
            difficulty,
            guessing,
            regime_tags: vec!["core".to_string()],
            paraphrase_group: None,
            is_ood: false,
            is_sentinel: false,
            expected_class: None,
            metadata: serde_json::Map::new(),
        }
    }

    #[test]
    fn logistic_is_branch_correct_at_extremes() {
        assert!(logistic(40.0) > 0.999_999);
        assert!(logistic(-40.0) < 1e-6);
        assert!((logistic(0.0) - 0.5).abs() < 1e-12);
        // No NaN even far into saturation.
        assert!(logistic(800.0).is_finite());
        assert!(logistic(-800.0).is_finite());
    }

    #[test]
    fn expected_probability_respects_guessing_floor() {
        let registry = TraitRegistry::standard();
        let posterior = PosteriorState::prior(registry.len(), 1.0);
        let item = item_with_loadings(&[("T1", 1.0)], 10.0, 0.2);
        let p = DiagonalMirt::default().expected_probability(&item, &posterior, &registry);
        // σ(η) ≈ 0 at difficulty 10, so p collapses to the guessing floor.
        assert!((p - 0.2).abs() < 1e-3);
    }

    #[test]
    fn update_shrinks_loaded_variances_only() {
        let registry = TraitRegistry::standard();
        let posterior = PosteriorState::prior(registry.len(), 1.0);
        let item = item_with_loadings(&[("T1", 0.9), ("T3", 0.4)], 0.0, 0.0);
        let mirt = DiagonalMirt::default();
        let after = mirt.update(&posterior, &item, 1.0, &registry);

        let t1 = registry.index_of("T1").unwrap();
        let t3 = registry.index_of("T3").unwrap();
        let t2 = registry.index_of("T2").unwrap();
        assert!(after.variance(t1) < posterior.variance(t1));
        assert!(after.variance(t3) < posterior.variance(t3));
        assert_eq!(after.variance(t2), posterior.variance(t2));
        assert_eq!(after.mean(t2), posterior.mean(t2));
    }

    #[test]
    fn update_moves_mean_toward_score() {
        let registry = TraitRegistry::standard();
        let posterior = PosteriorState::prior(registry.len(), 1.0);
        let item = item_with_loadings(&[("T1", 1.0)], 0.0, 0.0);
        let mirt = DiagonalMirt::default();
        let t1 = registry.index_of("T1").unwrap();

        let up = mirt.update(&posterior, &item, 1.0, &registry);
        assert!(up.mean(t1) > 0.0, "success should raise the mean");

        let down = mirt.update(&posterior, &item, 0.0, &registry);
        assert!(down.mean(t1) < 0.0, "failure should lower the mean");
    }

    #[test]
    fn reliability_is_monotone_across_updates() {
        let registry = TraitRegistry::standard();
        let mut posterior = PosteriorState::prior(registry.len(), 1.0);
        let item = item_with_loadings(&[("T4", 0.8)], 0.0, 0.0);
        let mirt = DiagonalMirt::default();
        let t4 = registry.index_of("T4").unwrap();

        let mut last = posterior.reliability(t4);
        for step in 0..10 {
            posterior = mirt.update(&posterior, &item, f64::from(step % 2), &registry);
            let rel = posterior.reliability(t4);
            assert!(rel >= last, "reliability regressed at step {step}");
            last = rel;
        }
    }

    #[test]
    fn unregistered_loadings_are_ignored() {
        let registry = TraitRegistry::standard();
        let posterior = PosteriorState::prior(registry.len(), 1.0);
        let item = item_with_loadings(&[("T99", 1.0)], 0.0, 0.0);
        let mirt = DiagonalMirt::default();
        let after = mirt.update(&posterior, &item, 1.0, &registry);
        assert_eq!(after, posterior);
    }

    #[test]
    fn gain_grows_with_posterior_variance() {
        let registry = TraitRegistry::standard();
        let uncertain = PosteriorState::prior(registry.len(), 1.0);
        let mut confident = PosteriorState::prior(registry.len(), 1.0);
        for idx in 0..registry.len() {
            confident.set(idx, 0.0, 0.01);
        }
        let item = item_with_loadings(&[("T1", 1.0)], 0.0, 0.0);
        let mirt = DiagonalMirt::default();
        let gain_hi = mirt.expected_information_gain(&item, &uncertain, &registry);
        let gain_lo = mirt.expected_information_gain(&item, &confident, &registry);
        assert!(gain_hi > gain_lo);
        assert!(gain_lo > 0.0);
    }
}
