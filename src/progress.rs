//! Progress event sink.
//!
//! A run can surface one compact event per call to an optional
//! [`ProgressSink`]. The sink is a one-way channel: the engine never reads
//! back from it, and events must not meaningfully block the loop — a sink
//! that persists events should buffer. Because a run is a single
//! cooperative task, the sink is taken as `&mut` and is **not** required to
//! be thread-safe.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::selector::{Stage, StageCounts};

/// Preview truncation limit, in characters.
const PREVIEW_LIMIT: usize = 180;

/// Collapse whitespace and truncate to the preview limit.
pub fn preview(text: &str) -> String {
    let compact = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if compact.chars().count() <= PREVIEW_LIMIT {
        return compact;
    }
    let cut: String = compact.chars().take(PREVIEW_LIMIT.saturating_sub(3)).collect();
    format!("{cut}...")
}

/// Compact per-call progress event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: String,
    pub call_index: u32,
    pub stage: Stage,
    pub regime_id: String,
    pub item_id: String,
    pub family: String,
    pub score: f64,
    pub expected_probability: f64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub latency_ms: u64,
    pub prompt_preview: String,
    pub response_preview: String,
    pub score_components: BTreeMap<String, f64>,
    pub sentinel_count: u32,
    pub stage_counts: StageCounts,
    /// Stop-policy reason from the previous evaluation, as a preview of
    /// where the run stands.
    pub stop_reason_preview: String,
    /// Critical-trait mean deltas produced by this call, rounded.
    pub critical_delta_preview: BTreeMap<String, f64>,
    /// Critical-trait posterior means after this call, rounded.
    pub posterior_mean: BTreeMap<String, f64>,
    /// Critical-trait reliabilities after this call, rounded.
    pub posterior_reliability: BTreeMap<String, f64>,
    pub emitted_at: DateTime<Utc>,
}

/// One-way sink for progress events.
pub trait ProgressSink {
    fn submit(&mut self, event: ProgressEvent);
}

/// In-memory sink collecting every event; handy for tests and the CLI.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub events: Vec<ProgressEvent>,
}

impl ProgressSink for MemorySink {
    fn submit(&mut self, event: ProgressEvent) {
        self.events.push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_collapses_whitespace() {
        assert_eq!(preview("  a\n b\t c  "), "a b c");
    }

    #[test]
    fn preview_truncates_long_text_with_ellipsis() {
        let long = "word ".repeat(100);
        let p = preview(&long);
        assert_eq!(p.chars().count(), 180);
        assert!(p.ends_with("..."));
    }

    #[test]
    fn short_text_is_untouched() {
        assert_eq!(preview("Return only integer: 37*14-19"), "Return only integer: 37*14-19");
    }
}
