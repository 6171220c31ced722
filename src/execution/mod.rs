//! Multi-leg strategy orchestration: execution engine, range-breakout
//! trigger, dynamic hedging.

use thiserror::Error;

pub mod breakout;
pub mod engine;
pub mod hedge;
pub mod service;

pub use breakout::RangeBreakoutMonitor;
pub use engine::MultilegEngine;
pub use hedge::DynamicHedgeService;
pub use service::MultilegService;

/// Errors the orchestration layer reports. Concurrency conflicts are
/// expected and recoverable; callers must be able to tell "already running"
/// apart from "broken".
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("strategy is already being executed: {0}")]
    AlreadyExecuting(String),

    #[error("strategy is not active: {0}")]
    NotActive(String),

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("{0}")]
    Validation(String),

    #[error("{0} is not enabled for this strategy")]
    NotEnabled(&'static str),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
