// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Converge
//!
//! A declarative, idempotent reconciler for managed Kubernetes cluster stacks.
//!
//! ## Overview
//!
//! A stack is described in a YAML spec: a cluster, its node groups, IAM
//! roles, add-ons, Kubernetes manifests, access grants and outputs. Converge
//! turns that spec into a dependency graph, compares it with the state it
//! last applied and drives a provider control plane until the two agree.
//!
//! ## Architecture
//!
//! 1. **Graph**: resources and their `depends_on` / `${name.attr}` edges
//! 2. **Plan**: Create, Update, Replace, Delete or Noop per resource, in
//!    dependency order
//! 3. **Execute**: bounded parallel apply with retries; a failure skips
//!    only the resources that depend on it
//! 4. **State**: a locked session that persists every successful step
//!
//! ## Modules
//!
//! - [`config`]: Spec parsing, validation and hashing
//! - [`resource`]: Resource types and their operation tables
//! - [`graph`]: Dependency graph construction and ordering
//! - [`planner`]: Diff, plan and execution
//! - [`provider`]: Provider control-plane clients
//! - [`state`]: State storage backends (local, S3) and sessions
//! - [`reconciler`]: The plan/apply/drift/destroy cycle
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: eks-sandbox
//!   environment: dev
//!
//! resources:
//!   cluster:
//!     type: cluster
//!     properties:
//!       name: eks-sandbox
//!       version: "1.30"
//!   ebs-csi-driver:
//!     type: addon
//!     properties:
//!       cluster_name: "${cluster.name}"
//!       addon_name: aws-ebs-csi-driver
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod config;
pub mod error;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod reconciler;
pub mod resource;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, StackSpec};
pub use error::{ConvergeError, Result};
pub use graph::{GraphBuilder, ResourceGraph};
pub use planner::{DiffEngine, ExecutionResult, Plan, PlanExecutor};
pub use provider::{HttpProvider, Provider, SimulatedProvider};
pub use reconciler::{ApplyOptions, ApplyReport, DriftReport, ReconcileContext};
pub use resource::ResourceType;
pub use state::{AppliedState, LocalStateStore, S3StateStore, StateStore};
