pub mod evaluator;
pub mod metrics;
pub mod opponents;
pub mod pipeline;

pub use evaluator::{against_baseline, head_to_head, should_promote, EvaluationOutcome};
pub use metrics::{append_metrics, summarize_games, CycleMetrics};
pub use opponents::BaselineOpponent;
pub use pipeline::{CycleReport, RunContext, RunState, StopReason, TrainingPipeline};
