pub mod app;
pub mod config;
pub mod inference;
pub mod remote_runner;
pub mod stats;

pub use app::{evaluate, run, start_app, EvalSummary};
pub use inference::{Cycle, EvalError, EvalPlan, Evaluator};
