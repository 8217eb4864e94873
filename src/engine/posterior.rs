//! Diagonal Gaussian posterior over the trait vector.
//!
//! One [`PosteriorState`] per regime. The store carries only per-trait
//! means and variances plus the prior-variance anchor; no covariance is
//! retained. Traits are addressed by registry index, so all hot-path access
//! is vector indexing; conversion to trait-keyed maps happens only at the
//! reporting boundary.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::engine::mirt::logistic;
use crate::traits::TraitRegistry;

/// Variances never collapse below this floor.
pub const VARIANCE_FLOOR: f64 = 1e-9;

/// Diagonal Gaussian approximation for the trait posterior of one regime.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorState {
    mean: Vec<f64>,
    variance: Vec<f64>,
    prior_variance: f64,
}

/// Trait-keyed snapshot of a posterior, rounded for trace records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorSnapshot {
    pub mean: BTreeMap<String, f64>,
    pub variance: BTreeMap<String, f64>,
}

impl PosteriorState {
    /// Neutral prior: µ = 0, σ² = `prior_variance` for every trait.
    pub fn prior(dims: usize, prior_variance: f64) -> Self {
        Self {
            mean: vec![0.0; dims],
            variance: vec![prior_variance; dims],
            prior_variance,
        }
    }

    /// Number of traits tracked.
    pub fn dims(&self) -> usize {
        self.mean.len()
    }

    pub fn prior_variance(&self) -> f64 {
        self.prior_variance
    }

    pub fn mean(&self, idx: usize) -> f64 {
        self.mean[idx]
    }

    pub fn variance(&self, idx: usize) -> f64 {
        self.variance[idx]
    }

    pub fn sd(&self, idx: usize) -> f64 {
        self.variance[idx].max(VARIANCE_FLOOR).sqrt()
    }

    /// Overwrite one trait's parameters. Callers are the MIRT kernel only;
    /// the variance floor is applied here so no path can underflow.
    pub(crate) fn set(&mut self, idx: usize, mean: f64, variance: f64) {
        self.mean[idx] = mean;
        self.variance[idx] = variance.max(VARIANCE_FLOOR);
    }

    /// New state with every variance multiplied by `factor`.
    ///
    /// Used for hierarchical warm starts: a non-core regime begins at the
    /// core posterior with inflated uncertainty.
    pub fn inflated(&self, factor: f64) -> Self {
        let mut out = self.clone();
        for v in &mut out.variance {
            *v = (*v * factor).max(VARIANCE_FLOOR);
        }
        out
    }

    /// Posterior certainty relative to the prior: 1 − σ²/v₀, clamped to
    /// [0, 1]. Monotone non-decreasing across updates because precision is
    /// additive.
    pub fn reliability(&self, idx: usize) -> f64 {
        let ratio = self.variance[idx] / self.prior_variance.max(VARIANCE_FLOOR);
        (1.0 - ratio).clamp(0.0, 1.0)
    }

    /// 95% credible-interval width measured on the logistic scale.
    ///
    /// The latent interval µ ± 1.96σ is pushed through the logistic so
    /// cross-trait stop thresholds share a bounded unit. The latent-scale
    /// interval itself is what the report carries; both units are
    /// intentional.
    pub fn ci95_width(&self, idx: usize) -> f64 {
        let sd = self.sd(idx);
        let mean = self.mean[idx];
        let lo = logistic(mean - 1.96 * sd);
        let hi = logistic(mean + 1.96 * sd);
        hi - lo
    }

    /// Trait-keyed snapshot with values rounded to six decimals.
    pub fn snapshot(&self, registry: &TraitRegistry) -> PosteriorSnapshot {
        let round6 = |x: f64| (x * 1e6).round() / 1e6;
        let mut mean = BTreeMap::new();
        let mut variance = BTreeMap::new();
        for (idx, code) in registry.codes().iter().enumerate() {
            mean.insert(code.clone(), round6(self.mean[idx]));
            variance.insert(code.clone(), round6(self.variance[idx]));
        }
        PosteriorSnapshot { mean, variance }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prior_starts_neutral() {
        let p = PosteriorState::prior(12, 1.0);
        for idx in 0..12 {
            assert_eq!(p.mean(idx), 0.0);
            assert_eq!(p.variance(idx), 1.0);
            assert_eq!(p.reliability(idx), 0.0);
        }
    }

    #[test]
    fn reliability_clamps_to_unit_interval() {
        let mut p = PosteriorState::prior(1, 1.0);
        p.set(0, 0.0, 2.0); // inflated beyond the prior
        assert_eq!(p.reliability(0), 0.0);
        p.set(0, 0.0, 0.0); // floored, near-certain
        assert!(p.reliability(0) > 0.999);
        assert!(p.reliability(0) <= 1.0);
    }

    #[test]
    fn variance_floor_holds() {
        let mut p = PosteriorState::prior(1, 1.0);
        p.set(0, 0.3, 0.0);
        assert!(p.variance(0) >= VARIANCE_FLOOR);
        assert!(p.sd(0) > 0.0);
    }

    #[test]
    fn inflation_scales_variance_only() {
        let mut p = PosteriorState::prior(2, 1.0);
        p.set(0, 0.5, 0.4);
        let inflated = p.inflated(1.2);
        assert_eq!(inflated.mean(0), 0.5);
        assert!((inflated.variance(0) - 0.48).abs() < 1e-12);
        assert!((inflated.variance(1) - 1.2).abs() < 1e-12);
    }

    #[test]
    fn ci95_width_is_bounded_and_shrinks_with_variance() {
        let mut p = PosteriorState::prior(1, 1.0);
        let wide = p.ci95_width(0);
        p.set(0, 0.0, 0.05);
        let narrow = p.ci95_width(0);
        assert!(wide > narrow);
        assert!(narrow > 0.0);
        assert!(wide < 1.0);
    }

    #[test]
    fn snapshot_rounds_and_keys_by_code() {
        let registry = crate::traits::TraitRegistry::standard();
        let mut p = PosteriorState::prior(registry.len(), 1.0);
        p.set(0, 0.123_456_789, 0.987_654_321);
        let snap = p.snapshot(&registry);
        assert_eq!(snap.mean["T1"], 0.123_457);
        assert_eq!(snap.variance["T1"], 0.987_654);
        assert_eq!(snap.mean.len(), registry.len());
    }
}
