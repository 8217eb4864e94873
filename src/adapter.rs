//! Model adapter seam.
//!
//! The engine never talks to a model API directly; it hands one prompt at a
//! time to a [`ModelAdapter`] and gets back raw text plus token counts. The
//! adapter call is the run loop's only suspension point. The optional score
//! override exists so simulators can bypass the scorer cleanly; real
//! transports leave it `None`.
//!
//! An adapter that fails aborts the run: the engine does not retry or
//! swallow per-call failures, and no partial posterior update happens for a
//! failed call. Timeouts are the adapter's responsibility. An adapter that
//! returns incomplete output (empty text) must still return token counts;
//! the scorer's fallback path handles empty text deterministically.

use async_trait::async_trait;
use thiserror::Error;

use crate::config::RegimeConfig;
use crate::item::Item;

/// Errors surfaced by a model adapter.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Transport-level failure (connection, auth, rate limit the adapter
    /// chose not to absorb).
    #[error("transport error: {0}")]
    Transport(String),

    /// The upstream response did not conform to the adapter contract.
    #[error("non-conforming model output: {0}")]
    Contract(String),
}

/// Single model completion result used by the adaptive engine.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelOutput {
    pub raw_text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// When set, the engine clamps this to [0, 1] and skips the scorer.
    pub score_override: Option<f64>,
}

impl ModelOutput {
    /// Plain text output with no override.
    pub fn text(raw_text: impl Into<String>, prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            raw_text: raw_text.into(),
            prompt_tokens,
            completion_tokens,
            score_override: None,
        }
    }
}

/// One-prompt-at-a-time model execution.
///
/// Implementations must be `Send + Sync` so runs can be driven from any
/// task; the engine itself administers probes strictly sequentially and
/// never issues concurrent calls within a run.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    /// Execute one prompt under the given regime and return the completion.
    async fn complete(
        &self,
        prompt: &str,
        regime: &RegimeConfig,
        item: &Item,
    ) -> Result<ModelOutput, AdapterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_constructor_has_no_override() {
        let out = ModelOutput::text("499", 85, 8);
        assert_eq!(out.raw_text, "499");
        assert_eq!(out.score_override, None);
    }

    #[test]
    fn adapter_errors_render_kind() {
        let err = AdapterError::Contract("missing completion".to_string());
        assert!(err.to_string().contains("non-conforming"));
    }
}
