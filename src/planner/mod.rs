//! Planning and execution.
//!
//! This module compares the desired graph with applied state, turns the
//! differences into an ordered plan and applies that plan against the
//! provider.

mod diff;
mod executor;
mod plan;
mod retry;

pub use diff::{DiffEngine, DEPENDS_ON_FIELD, DiffResult, DiffType, ResourceDiff};
pub use executor::{ActionResult, ActionStatus, ExecutionResult, PlanExecutor};
pub use plan::{ActionType, Plan, PlannedAction};
pub use retry::RetryPolicy;
