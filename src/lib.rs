//! Adaptive psychometric profiling for language models.
//!
//! traitscope administers probes from a fixed bank one at a time, updates a
//! diagonal multi-trait posterior online, and stops as soon as a
//! multi-constraint policy is satisfied — all under a strict call/token
//! budget. The result is a [`report::ProfileReport`]: per-regime trait
//! estimates, robustness diagnostics, risk flags, and a full per-call
//! trace.
//!
//! # Architecture
//!
//! ```text
//! Engine::run
//!   ├── Selector        stage-aware, ε-greedy item choice
//!   ├── ModelAdapter    one prompt → raw text (the only await point)
//!   ├── scoring         deterministic text → score ∈ [0, 1]
//!   ├── DiagonalMirt    online posterior update
//!   └── stopping        ordered stop predicates
//! diagnostics           once, after the loop
//! ```
//!
//! Model transports live behind [`adapter::ModelAdapter`];
//! [`simulate::SimulatedModel`] is the in-crate reference implementation.

pub mod adapter;
pub mod bank;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod item;
pub mod progress;
pub mod report;
pub mod scoring;
pub mod simulate;
pub mod traits;

pub use adapter::{AdapterError, ModelAdapter, ModelOutput};
pub use bank::{bank_stats, build_item_bank, BankStats};
pub use config::{ConfigError, RegimeConfig, RunConfig};
pub use engine::selector::{SelectionDecision, Stage, StageCounts};
pub use engine::stopping::{HoldReason, StopReason};
pub use engine::{Engine, EngineError};
pub use item::{ActionClass, Item, ScoringKind};
pub use progress::{MemorySink, ProgressEvent, ProgressSink};
pub use report::{BudgetStats, ProfileReport, RegimeReport, ResponseRecord, TraitEstimate};
pub use simulate::{run_panel, sample_true_thetas, summarize_reports, SimulatedModel};
pub use traits::TraitRegistry;
