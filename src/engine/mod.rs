//! Adaptive profiling engine.
//!
//! A profiling run is a closed loop of: stage decision → regime routing →
//! item selection → one adapter call → deterministic scoring → posterior
//! update → trace record → stop evaluation. The loop is a single
//! cooperative task; the adapter call is its only suspension point, and
//! the per-run seeded RNG inside the selector is the only source of
//! non-determinism.
//!
//! # Ordering guarantees
//!
//! Records are appended in call order; posterior updates land before the
//! next selection sees them; the progress event for call *i* is submitted
//! strictly before stopping is evaluated for call *i*.

pub mod mirt;
pub mod posterior;
pub mod selector;
pub mod stopping;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::adapter::{AdapterError, ModelAdapter};
use crate::config::{ConfigError, RunConfig};
use crate::diagnostics;
use crate::item::{Item, PRIMARY_LOADING};
use crate::progress::{preview, ProgressEvent, ProgressSink};
use crate::report::{
    BudgetStats, ProfileReport, RegimeReport, ResponseRecord, RiskFlags, RunDiagnostics,
    SelectionContext,
};
use crate::traits::TraitRegistry;
use mirt::DiagonalMirt;
use posterior::PosteriorState;
use selector::{Selector, Stage, StageCounts};
use stopping::{StopReason, Verdict};

/// Variance inflation applied when a non-core regime warm-starts from the
/// core posterior.
const WARM_START_INFLATION: f64 = 1.2;

/// Errors the run loop can surface. Everything else — scorer confusion,
/// numerical edge cases, pool exhaustion — is captured in the report.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("model adapter failed on item {item_id}")]
    Adapter {
        item_id: String,
        #[source]
        source: AdapterError,
    },
}

/// Wait until the cancellation flag is raised. If the sender is gone,
/// cancellation can never arrive, so park forever and let the adapter arm
/// win the race.
async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn round4(x: f64) -> f64 {
    (x * 1e4).round() / 1e4
}

fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Adaptive psychometric profiling engine.
///
/// Owns the item bank, the trait registry, the MIRT kernel, and the seeded
/// selector. The bank and regime configs are read-only after construction;
/// per-run state (posteriors, counters, records) lives on the stack of
/// [`Engine::run`], so engines never share mutable state across runs.
pub struct Engine {
    config: Arc<RunConfig>,
    registry: Arc<TraitRegistry>,
    bank: Arc<Vec<Item>>,
    mirt: DiagonalMirt,
    selector: Selector,
}

impl Engine {
    /// Build an engine, failing fast on invalid configuration.
    pub fn new(config: RunConfig, bank: Vec<Item>, seed: u64) -> Result<Self, EngineError> {
        config.validate()?;
        let config = Arc::new(config);
        let mirt = DiagonalMirt::default();
        let selector = Selector::new(Arc::clone(&config), mirt.clone(), seed);
        Ok(Self {
            config,
            registry: Arc::new(TraitRegistry::standard()),
            bank: Arc::new(bank),
            mirt,
            selector,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn registry(&self) -> &TraitRegistry {
        &self.registry
    }

    pub fn bank(&self) -> &[Item] {
        &self.bank
    }

    /// Stage-C regime routing: alternate two safety calls for every core
    /// call when a safety regime is configured.
    fn choose_regime(&self, stage: Stage, stage_counts: &StageCounts) -> &str {
        if stage != Stage::C || !self.config.has_regime("safety") {
            return "core";
        }
        if stage_counts.c % 3 < 2 { "safety" } else { "core" }
    }

    /// Posteriors the convergence checks look at: the core posterior when
    /// core has been seen, otherwise every seen regime in config order.
    fn active_posteriors<'a>(
        &self,
        posteriors: &'a HashMap<String, PosteriorState>,
        regime_seen: &HashSet<String>,
    ) -> Vec<&'a PosteriorState> {
        if regime_seen.contains("core") {
            return posteriors.get("core").into_iter().collect();
        }
        self.config
            .regimes
            .iter()
            .filter(|r| regime_seen.contains(&r.regime_id))
            .filter_map(|r| posteriors.get(&r.regime_id))
            .collect()
    }

    /// Execute one adaptive profiling run.
    pub async fn run(
        &mut self,
        adapter: &dyn ModelAdapter,
        run_id: Option<&str>,
        progress: Option<&mut dyn ProgressSink>,
    ) -> Result<ProfileReport, EngineError> {
        self.run_inner(adapter, run_id, progress, None).await
    }

    /// Execute a run that can be cancelled at the suspension point.
    ///
    /// When the watch flag turns true the in-flight call is abandoned and
    /// the run finalizes immediately with `stop_reason = "cancelled"`,
    /// covering every record administered so far.
    pub async fn run_cancellable(
        &mut self,
        adapter: &dyn ModelAdapter,
        run_id: Option<&str>,
        progress: Option<&mut dyn ProgressSink>,
        cancel: watch::Receiver<bool>,
    ) -> Result<ProfileReport, EngineError> {
        self.run_inner(adapter, run_id, progress, Some(cancel)).await
    }

    async fn run_inner(
        &mut self,
        adapter: &dyn ModelAdapter,
        run_id: Option<&str>,
        mut progress: Option<&mut dyn ProgressSink>,
        mut cancel: Option<watch::Receiver<bool>>,
    ) -> Result<ProfileReport, EngineError> {
        let run_id = run_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut posteriors: HashMap<String, PosteriorState> = self
            .config
            .regimes
            .iter()
            .map(|r| {
                (
                    r.regime_id.clone(),
                    PosteriorState::prior(self.registry.len(), self.config.prior_variance),
                )
            })
            .collect();
        let mut regime_seen: HashSet<String> = HashSet::new();

        let mut records: Vec<ResponseRecord> = Vec::new();
        let mut used = vec![false; self.bank.len()];
        let mut exposure_counts = vec![0_u32; self.bank.len()];
        let mut trait_counts = vec![0_u32; self.registry.len()];
        let mut stage_counts = StageCounts::default();

        let mut total_prompt_tokens: u32 = 0;
        let mut total_completion_tokens: u32 = 0;
        let mut sentinel_count: u32 = 0;
        let mut low_gain_streak: u32 = 0;
        let mut stop_reason = StopReason::ItemPoolExhausted;
        let mut reason_preview: &'static str = StopReason::ItemPoolExhausted.as_str();

        tracing::info!(run_id = %run_id, bank = self.bank.len(), "starting profiling run");

        for call_index in 0..self.config.call_cap {
            if total_prompt_tokens + total_completion_tokens >= self.config.token_cap {
                stop_reason = StopReason::TokenCapReached;
                break;
            }

            let stage = self
                .selector
                .current_stage(&stage_counts, &trait_counts, &self.registry);
            let regime_id = self.choose_regime(stage, &stage_counts).to_string();

            if regime_id != "core" && !regime_seen.contains(&regime_id) {
                // Hierarchical warm start: begin near the core posterior
                // with inflated uncertainty.
                let warmed = posteriors["core"].inflated(WARM_START_INFLATION);
                posteriors.insert(regime_id.clone(), warmed);
                tracing::debug!(regime = %regime_id, "warm-started regime posterior from core");
            }

            let Some(decision) = self.selector.select_next_item(
                &self.bank,
                &posteriors[&regime_id],
                &self.registry,
                &regime_id,
                &trait_counts,
                &used,
                &exposure_counts,
                call_index,
                stage,
                sentinel_count,
            ) else {
                stop_reason = StopReason::ItemPoolExhausted;
                break;
            };

            let item = &self.bank[decision.item_index];
            let posterior_before = posteriors[&regime_id].clone();
            let stage_counts_before = stage_counts;
            let sentinel_count_before = sentinel_count;
            let critical_counts_before: BTreeMap<String, u32> = self
                .config
                .critical_traits
                .iter()
                .map(|code| {
                    let count = self
                        .registry
                        .index_of(code)
                        .map_or(0, |idx| trait_counts[idx]);
                    (code.clone(), count)
                })
                .collect();
            let expected_probability =
                self.mirt
                    .expected_probability(item, &posterior_before, &self.registry);

            let regime = self
                .config
                .regime(&regime_id)
                .expect("routing only targets configured regimes");

            let started = Instant::now();
            let outcome = match cancel.as_mut() {
                Some(rx) => {
                    tokio::select! {
                        biased;
                        () = wait_cancelled(rx) => {
                            stop_reason = StopReason::Cancelled;
                            break;
                        }
                        out = adapter.complete(&item.prompt, regime, item) => out,
                    }
                }
                None => adapter.complete(&item.prompt, regime, item).await,
            };
            let latency_ms = started.elapsed().as_millis() as u64;
            let output = outcome.map_err(|source| EngineError::Adapter {
                item_id: item.item_id.clone(),
                source,
            })?;

            let (score, score_components) = match output.score_override {
                Some(raw) => {
                    let clamped = raw.clamp(0.0, 1.0);
                    (clamped, BTreeMap::from([("override".to_string(), clamped)]))
                }
                None => crate::scoring::score_item(item, &output.raw_text),
            };

            let updated = self
                .mirt
                .update(&posteriors[&regime_id], item, score, &self.registry);
            posteriors.insert(regime_id.clone(), updated);
            let posterior_after = &posteriors[&regime_id];

            used[decision.item_index] = true;
            exposure_counts[decision.item_index] += 1;
            regime_seen.insert(regime_id.clone());
            stage_counts.increment(stage);
            for (code, loading) in &item.trait_loadings {
                if *loading >= PRIMARY_LOADING {
                    if let Some(idx) = self.registry.index_of(code) {
                        trait_counts[idx] += 1;
                    }
                }
            }
            if item.is_robustness_probe() {
                sentinel_count += 1;
            }
            total_prompt_tokens += output.prompt_tokens;
            total_completion_tokens += output.completion_tokens;

            if decision.expected_gain < self.config.expected_gain_floor {
                low_gain_streak += 1;
            } else {
                low_gain_streak = 0;
            }

            records.push(ResponseRecord {
                call_index,
                stage,
                regime_id: regime_id.clone(),
                item_id: item.item_id.clone(),
                family: item.family.clone(),
                prompt_tokens: output.prompt_tokens,
                completion_tokens: output.completion_tokens,
                latency_ms,
                expected_probability,
                score,
                score_components: score_components.clone(),
                prompt_text: item.prompt.clone(),
                response_text: output.raw_text.clone(),
                scoring_type: item.scoring_type,
                trait_loadings: item.trait_loadings.clone(),
                item_metadata: item.metadata.clone(),
                posterior_before: posterior_before.snapshot(&self.registry),
                posterior_after: posterior_after.snapshot(&self.registry),
                selection_context: SelectionContext {
                    stage: decision.stage,
                    expected_gain: round6(decision.expected_gain),
                    utility: round6(decision.utility),
                    epsilon: round6(decision.epsilon),
                    stage_counts_before,
                    sentinel_count_before,
                    critical_trait_counts_before: critical_counts_before,
                },
            });

            if let Some(sink) = progress.as_deref_mut() {
                let critical_view = |f: &dyn Fn(usize) -> f64| -> BTreeMap<String, f64> {
                    self.config
                        .critical_traits
                        .iter()
                        .filter_map(|code| self.registry.index_of(code).map(|i| (code.clone(), i)))
                        .map(|(code, idx)| (code, round4(f(idx))))
                        .collect()
                };
                sink.submit(ProgressEvent {
                    run_id: run_id.clone(),
                    call_index,
                    stage,
                    regime_id: regime_id.clone(),
                    item_id: item.item_id.clone(),
                    family: item.family.clone(),
                    score,
                    expected_probability,
                    prompt_tokens: output.prompt_tokens,
                    completion_tokens: output.completion_tokens,
                    latency_ms,
                    prompt_preview: preview(&item.prompt),
                    response_preview: preview(&output.raw_text),
                    score_components,
                    sentinel_count,
                    stage_counts,
                    stop_reason_preview: reason_preview.to_string(),
                    critical_delta_preview: critical_view(&|idx| {
                        posterior_after.mean(idx) - posterior_before.mean(idx)
                    }),
                    posterior_mean: critical_view(&|idx| posterior_after.mean(idx)),
                    posterior_reliability: critical_view(&|idx| posterior_after.reliability(idx)),
                    emitted_at: chrono::Utc::now(),
                });
            }

            let critical = stopping::critical_status(
                &self.config,
                &self.registry,
                &self.active_posteriors(&posteriors, &regime_seen),
                &trait_counts,
            );
            let verdict = stopping::evaluate(
                &self.config,
                &stopping::StopInputs {
                    total_calls: records.len() as u32,
                    stage_counts: &stage_counts,
                    low_gain_streak,
                    sentinel_count,
                },
                critical,
            );
            match verdict {
                Verdict::Stop(reason) => {
                    stop_reason = reason;
                    break;
                }
                Verdict::Hold(reason) => {
                    reason_preview = reason.as_str();
                }
            }
        }

        tracing::info!(
            run_id = %run_id,
            calls = records.len(),
            stop_reason = %stop_reason,
            "profiling run finished"
        );

        Ok(self.finalize(
            run_id,
            records,
            posteriors,
            regime_seen,
            trait_counts,
            stage_counts,
            sentinel_count,
            total_prompt_tokens,
            total_completion_tokens,
            stop_reason,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn finalize(
        &self,
        run_id: String,
        records: Vec<ResponseRecord>,
        posteriors: HashMap<String, PosteriorState>,
        regime_seen: HashSet<String>,
        trait_counts: Vec<u32>,
        stage_counts: StageCounts,
        sentinel_count: u32,
        total_prompt_tokens: u32,
        total_completion_tokens: u32,
        stop_reason: StopReason,
    ) -> ProfileReport {
        let regimes: Vec<RegimeReport> = self
            .config
            .regimes
            .iter()
            .filter(|r| regime_seen.contains(&r.regime_id))
            .map(|r| {
                RegimeReport::from_posterior(&r.regime_id, &posteriors[&r.regime_id], &self.registry)
            })
            .collect();

        let ood_items: HashSet<String> = self
            .bank
            .iter()
            .filter(|i| i.is_ood)
            .map(|i| i.item_id.clone())
            .collect();
        let sentinel_items: HashSet<String> = self
            .bank
            .iter()
            .filter(|i| i.is_sentinel)
            .map(|i| i.item_id.clone())
            .collect();
        let group_by_item: HashMap<String, String> = self
            .bank
            .iter()
            .filter_map(|i| {
                i.paraphrase_group
                    .as_ref()
                    .map(|g| (i.item_id.clone(), g.clone()))
            })
            .collect();

        let (bti, bti_components) =
            diagnostics::benchmark_training_index(&records, &ood_items, &sentinel_items);
        let ood_gap = diagnostics::estimate_ood_gap(&records, &ood_items);
        let paraphrase_consistency = diagnostics::paraphrase_consistency(&records, &group_by_item);
        let refusal_error_rate = diagnostics::refusal_error_rate(&records);

        let critical = stopping::critical_status(
            &self.config,
            &self.registry,
            &self.active_posteriors(&posteriors, &regime_seen),
            &trait_counts,
        );

        let diagnostics = RunDiagnostics {
            critical_reliability_met: critical.reliability_ok,
            critical_ci_met: critical.ci_ok,
            critical_coverage_met: critical.coverage_ok,
            sentinel_items_sampled: sentinel_count,
            bti,
            ood_gap,
            paraphrase_consistency,
            calls_in_stage_a: stage_counts.a,
            calls_in_stage_b: stage_counts.b,
            calls_in_stage_c: stage_counts.c,
            in_bank_mean: bti_components.in_bank_mean,
            ood_mean: bti_components.ood_mean,
            person_fit_anomaly: bti_components.person_fit_anomaly,
            refusal_error_rate,
        };

        let risk_flags = RiskFlags {
            benchmark_overfit: bti > diagnostics::BTI_FLAG_THRESHOLD,
            instability: paraphrase_consistency < diagnostics::INSTABILITY_THRESHOLD,
            calibration_risk: !critical.reliability_ok,
            refusal_risk: refusal_error_rate > diagnostics::REFUSAL_RISK_THRESHOLD,
        };

        ProfileReport {
            run_id,
            model_id: self.config.model_id.clone(),
            regimes,
            diagnostics,
            risk_flags,
            budget: BudgetStats {
                calls_used: records.len() as u32,
                prompt_tokens: total_prompt_tokens,
                completion_tokens: total_completion_tokens,
            },
            stop_reason,
            records,
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::adapter::ModelOutput;
    use crate::bank::build_item_bank;
    use crate::config::RegimeConfig;
    use crate::progress::MemorySink;

    /// Adapter that always succeeds with a fixed override score.
    struct FixedAdapter {
        score: f64,
    }

    #[async_trait]
    impl ModelAdapter for FixedAdapter {
        async fn complete(
            &self,
            prompt: &str,
            _regime: &RegimeConfig,
            _item: &Item,
        ) -> Result<ModelOutput, AdapterError> {
            Ok(ModelOutput {
                raw_text: "1".to_string(),
                prompt_tokens: (85 + prompt.len() / 4).min(180) as u32,
                completion_tokens: 8,
                score_override: Some(self.score),
            })
        }
    }

    /// Adapter that never resolves; only useful for cancellation tests.
    struct HangingAdapter;

    #[async_trait]
    impl ModelAdapter for HangingAdapter {
        async fn complete(
            &self,
            _prompt: &str,
            _regime: &RegimeConfig,
            _item: &Item,
        ) -> Result<ModelOutput, AdapterError> {
            std::future::pending().await
        }
    }

    #[test]
    fn invalid_config_fails_construction() {
        let config = RunConfig {
            critical_traits: vec![],
            ..Default::default()
        };
        assert!(matches!(
            Engine::new(config, build_item_bank(17), 7),
            Err(EngineError::Config(_))
        ));
    }

    #[tokio::test]
    async fn run_respects_call_and_token_caps() {
        let mut engine = Engine::new(RunConfig::default(), build_item_bank(17), 7).unwrap();
        let adapter = FixedAdapter { score: 1.0 };
        let report = engine.run(&adapter, Some("caps"), None).await.unwrap();

        assert!(report.budget.calls_used <= 60);
        assert!(report.budget.prompt_tokens + report.budget.completion_tokens <= 14_000);
        assert_eq!(report.budget.calls_used as usize, report.records.len());
        for (i, record) in report.records.iter().enumerate() {
            assert_eq!(record.call_index as usize, i, "records must be in call order");
        }
    }

    #[tokio::test]
    async fn empty_bank_exhausts_immediately_without_posterior_mutation() {
        let mut engine = Engine::new(RunConfig::default(), vec![], 7).unwrap();
        let adapter = FixedAdapter { score: 1.0 };
        let report = engine.run(&adapter, Some("empty"), None).await.unwrap();
        assert_eq!(report.stop_reason, StopReason::ItemPoolExhausted);
        assert!(report.records.is_empty());
        assert!(report.regimes.is_empty(), "no regime was ever administered");
    }

    #[tokio::test]
    async fn tiny_token_cap_stops_before_selection() {
        let config = RunConfig {
            token_cap: 100,
            min_calls_before_global_stop: 1,
            stage_a_min: 1,
            stage_b_min: 1,
            stage_c_min: 1,
            ..Default::default()
        };
        let mut engine = Engine::new(config, build_item_bank(17), 7).unwrap();
        let adapter = FixedAdapter { score: 1.0 };
        let report = engine.run(&adapter, Some("tokens"), None).await.unwrap();
        assert_eq!(report.stop_reason, StopReason::TokenCapReached);
        assert_eq!(report.records.len(), 1);
    }

    #[tokio::test]
    async fn progress_events_track_every_record() {
        let mut engine = Engine::new(RunConfig::default(), build_item_bank(17), 7).unwrap();
        let adapter = FixedAdapter { score: 0.5 };
        let mut sink = MemorySink::default();
        let report = engine
            .run(&adapter, Some("progress"), Some(&mut sink))
            .await
            .unwrap();
        assert_eq!(sink.events.len(), report.records.len());
        for (event, record) in sink.events.iter().zip(&report.records) {
            assert_eq!(event.call_index, record.call_index);
            assert_eq!(event.item_id, record.item_id);
            assert!(event.prompt_preview.chars().count() <= 180);
        }
        // Every critical trait appears in the posterior previews.
        let first = &sink.events[0];
        for code in &engine.config().critical_traits {
            assert!(first.posterior_reliability.contains_key(code));
        }
    }

    #[tokio::test]
    async fn adapter_failure_aborts_the_run() {
        struct FailingAdapter;

        #[async_trait]
        impl ModelAdapter for FailingAdapter {
            async fn complete(
                &self,
                _prompt: &str,
                _regime: &RegimeConfig,
                _item: &Item,
            ) -> Result<ModelOutput, AdapterError> {
                Err(AdapterError::Transport("connection reset".to_string()))
            }
        }

        let mut engine = Engine::new(RunConfig::default(), build_item_bank(17), 7).unwrap();
        let err = engine.run(&FailingAdapter, Some("fail"), None).await;
        assert!(matches!(err, Err(EngineError::Adapter { .. })));
    }

    #[tokio::test]
    async fn cancellation_yields_partial_report() {
        let config = RunConfig::default();
        let mut engine = Engine::new(config, build_item_bank(17), 7).unwrap();
        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let report = engine
            .run_cancellable(&HangingAdapter, Some("cancelled"), None, rx)
            .await
            .unwrap();
        assert_eq!(report.stop_reason, StopReason::Cancelled);
        assert!(report.records.is_empty());
    }

    #[tokio::test]
    async fn score_override_is_clamped() {
        struct WildAdapter;

        #[async_trait]
        impl ModelAdapter for WildAdapter {
            async fn complete(
                &self,
                _prompt: &str,
                _regime: &RegimeConfig,
                _item: &Item,
            ) -> Result<ModelOutput, AdapterError> {
                Ok(ModelOutput {
                    raw_text: String::new(),
                    prompt_tokens: 10,
                    completion_tokens: 1,
                    score_override: Some(3.5),
                })
            }
        }

        let mut engine = Engine::new(RunConfig::default(), build_item_bank(17), 7).unwrap();
        let report = engine.run(&WildAdapter, Some("clamp"), None).await.unwrap();
        for record in &report.records {
            assert!(record.score >= 0.0 && record.score <= 1.0);
            assert_eq!(record.score_components["override"], record.score);
        }
    }
}
