//! Simulation helpers for convergence and robustness testing.
//!
//! [`SimulatedModel`] is the reference adapter: it generates Bernoulli
//! outcomes from synthetic latent traits under the same response model the
//! kernel assumes, with mild structured effects (OOD dip, sentinel dip,
//! safety-regime lift on refusal families) and an optional
//! benchmark-trained familiarity bump for overfit-detection tests. Scores
//! arrive via the override path, bypassing the text scorer.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::adapter::{AdapterError, ModelAdapter, ModelOutput};
use crate::bank::build_item_bank;
use crate::config::{RegimeConfig, RunConfig};
use crate::engine::mirt::logistic;
use crate::engine::{Engine, EngineError};
use crate::item::Item;
use crate::report::ProfileReport;
use crate::traits::TraitRegistry;

/// Latent trait values per regime, keyed by trait code.
pub type ThetaByRegime = HashMap<String, HashMap<String, f64>>;

/// Stochastic simulator for acceptance tests and examples.
pub struct SimulatedModel {
    true_theta_by_regime: ThetaByRegime,
    rng: Mutex<StdRng>,
    benchmark_trained: bool,
    base_noise: f64,
}

impl SimulatedModel {
    pub fn new(true_theta_by_regime: ThetaByRegime, seed: u64) -> Self {
        Self {
            true_theta_by_regime,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            benchmark_trained: false,
            base_noise: 0.03,
        }
    }

    /// Simulate a model that has trained on the public bank: familiar
    /// (non-OOD, non-sentinel) items get an artificial lift.
    pub fn benchmark_trained(mut self, trained: bool) -> Self {
        self.benchmark_trained = trained;
        self
    }

    pub fn with_base_noise(mut self, noise: f64) -> Self {
        self.base_noise = noise;
        self
    }
}

#[async_trait]
impl ModelAdapter for SimulatedModel {
    async fn complete(
        &self,
        prompt: &str,
        regime: &RegimeConfig,
        item: &Item,
    ) -> Result<ModelOutput, AdapterError> {
        let theta = self
            .true_theta_by_regime
            .get(&regime.regime_id)
            .or_else(|| self.true_theta_by_regime.get("core"));

        let mut eta = -item.difficulty;
        if let Some(theta) = theta {
            for (code, loading) in &item.trait_loadings {
                eta += loading * theta.get(code).copied().unwrap_or(0.0);
            }
        }

        let mut p = item.guessing + (1.0 - item.guessing) * logistic(eta);

        // Mild structured effects for robustness realism.
        if item.is_ood {
            p -= 0.08;
        }
        if item.is_sentinel {
            p -= 0.04;
        }
        if regime.regime_id == "safety"
            && matches!(
                item.family.as_str(),
                "refusal_correctness" | "jailbreak_wrappers"
            )
        {
            p += 0.10;
        }

        if self.benchmark_trained && !(item.is_ood || item.is_sentinel) {
            p += 0.16;
        }

        let y = {
            let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
            p += rng.gen_range(-self.base_noise..=self.base_noise);
            p = p.clamp(0.01, 0.99);
            if rng.r#gen::<f64>() < p { 1.0 } else { 0.0 }
        };

        let prompt_tokens = (85 + prompt.len() / 4).min(180) as u32;
        let completion_tokens = if y > 0.5 { 8 } else { 10 };
        Ok(ModelOutput {
            raw_text: if y > 0.5 { "1" } else { "0" }.to_string(),
            prompt_tokens,
            completion_tokens,
            score_override: Some(y),
        })
    }
}

/// Draw one synthetic model: core thetas uniform in [−0.65, 0.95], safety
/// equal to core with a lift on the refusal/jailbreak/helpfulness traits.
pub fn sample_true_thetas(seed: u64) -> ThetaByRegime {
    let registry = TraitRegistry::standard();
    let mut rng = StdRng::seed_from_u64(seed);
    let core: HashMap<String, f64> = registry
        .codes()
        .iter()
        .map(|code| (code.clone(), rng.gen_range(-0.65..=0.95)))
        .collect();
    let mut safety = core.clone();
    for code in ["T8", "T9", "T10"] {
        if let Some(v) = safety.get_mut(code) {
            *v += rng.gen_range(0.15..=0.55);
        }
    }
    HashMap::from([("core".to_string(), core), ("safety".to_string(), safety)])
}

/// Run a panel of simulated profiles with per-run derived seeds.
pub async fn run_panel(
    runs: u32,
    seed: u64,
    benchmark_trained: bool,
    config: Option<RunConfig>,
    bank: Option<Vec<Item>>,
) -> Result<Vec<ProfileReport>, EngineError> {
    let config = config.unwrap_or_else(|| RunConfig {
        model_id: "simulated-model".to_string(),
        ..Default::default()
    });
    let bank = bank.unwrap_or_else(|| build_item_bank(17));
    let mut out = Vec::with_capacity(runs as usize);

    for idx in 0..runs {
        let local_seed = seed + u64::from(idx) * 13;
        let thetas = sample_true_thetas(local_seed);
        let adapter =
            SimulatedModel::new(thetas, local_seed + 1).benchmark_trained(benchmark_trained);
        let mut engine = Engine::new(config.clone(), bank.clone(), local_seed + 2)?;
        let report = engine
            .run(&adapter, Some(&format!("sim-{idx:03}")), None)
            .await?;
        out.push(report);
    }
    Ok(out)
}

/// Panel-level acceptance summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PanelSummary {
    pub runs: u32,
    pub convergence_rate: f64,
    pub ci_rate: f64,
    pub median_calls: f64,
    pub avg_sentinel: f64,
    pub overfit_flag_rate: f64,
}

/// Summarize a panel of reports; `None` for an empty panel.
pub fn summarize_reports(reports: &[ProfileReport]) -> Option<PanelSummary> {
    if reports.is_empty() {
        return None;
    }
    let n = reports.len() as f64;
    let mut calls: Vec<u32> = reports.iter().map(|r| r.budget.calls_used).collect();
    calls.sort_unstable();
    let mid = calls.len() / 2;
    let median_calls = if calls.len() % 2 == 1 {
        f64::from(calls[mid])
    } else {
        f64::from(calls[mid - 1] + calls[mid]) / 2.0
    };

    let count = |f: &dyn Fn(&ProfileReport) -> bool| reports.iter().filter(|r| f(r)).count() as f64;

    Some(PanelSummary {
        runs: reports.len() as u32,
        convergence_rate: count(&|r| r.diagnostics.critical_reliability_met) / n,
        ci_rate: count(&|r| r.diagnostics.critical_ci_met) / n,
        median_calls,
        avg_sentinel: reports
            .iter()
            .map(|r| f64::from(r.diagnostics.sentinel_items_sampled))
            .sum::<f64>()
            / n,
        overfit_flag_rate: count(&|r| r.risk_flags.benchmark_overfit) / n,
    })
}
