//! Output formatting for CLI commands.
//!
//! Every formatter returns a string; the binary decides where it goes.

use colored::Colorize;
use serde::Serialize;
use std::fmt::Write;
use tabled::{Table, Tabled};

use crate::config::{StackSpec, ValidationResult};
use crate::graph::ResourceGraph;
use crate::planner::{ActionStatus, ActionType, Plan};
use crate::reconciler::{ApplyReport, DriftReport, DriftStatus};
use crate::state::{AppliedState, LockInfo};

use super::commands::OutputFormat;

/// Output formatter for CLI.
#[derive(Debug)]
pub struct OutputFormatter {
    format: OutputFormat,
}

/// Plan action row for table display.
#[derive(Tabled)]
struct PlanActionRow {
    #[tabled(rename = "#")]
    index: usize,
    #[tabled(rename = "Action")]
    action: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Reason")]
    reason: String,
}

/// Applied resource row for table display.
#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Type")]
    resource_type: String,
    #[tabled(rename = "Physical ID")]
    physical_id: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

impl OutputFormatter {
    /// Creates a new output formatter.
    #[must_use]
    pub const fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Returns true for JSON output.
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == OutputFormat::Json
    }

    fn json<T: Serialize>(value: &T) -> String {
        serde_json::to_string_pretty(value).unwrap_or_default()
    }

    /// Formats a plan for display.
    #[must_use]
    pub fn format_plan(&self, plan: &Plan, detailed: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(plan),
            OutputFormat::Text => Self::format_plan_text(plan, detailed),
        }
    }

    fn format_plan_text(plan: &Plan, detailed: bool) -> String {
        if !plan.has_changes() {
            return format!("{} No changes required, infrastructure is up to date.\n", "✓".green());
        }

        let mut output = String::new();
        let _ = writeln!(output, "\nChange plan");
        let _ = writeln!(output, "   Spec hash: {}\n", short(&plan.spec_hash));

        let rows: Vec<PlanActionRow> = plan
            .actions
            .iter()
            .enumerate()
            .filter(|(_, a)| a.action_type != ActionType::Noop)
            .map(|(i, a)| PlanActionRow {
                index: i + 1,
                action: Self::format_action_type(a.action_type),
                resource: a.resource_name.clone(),
                resource_type: a.resource_type.to_string(),
                reason: truncate(&a.reason, 50),
            })
            .collect();
        output.push_str(&Table::new(rows).to_string());
        output.push('\n');

        if detailed {
            for action in plan.actions.iter().filter(|a| !a.details.is_empty()) {
                let _ = writeln!(output, "\n   {} {}:", Self::format_action_type(action.action_type), action.resource_name);
                for change in &action.details {
                    let old = change.old_value.as_ref().map_or_else(|| String::from("(none)"), ToString::to_string);
                    let new = change.new_value.as_ref().map_or_else(|| String::from("(none)"), ToString::to_string);
                    let marker = if change.forces_replacement {
                        " (forces replacement)".red().to_string()
                    } else {
                        String::new()
                    };
                    let _ = writeln!(output, "     {}: {old} -> {new}{marker}", change.field);
                }
            }
        }

        let _ = writeln!(
            output,
            "\nPlan: {} to create, {} to update, {} to replace, {} to destroy",
            plan.count(ActionType::Create).to_string().green(),
            plan.count(ActionType::Update).to_string().yellow(),
            plan.count(ActionType::Replace).to_string().magenta(),
            plan.count(ActionType::Delete).to_string().red()
        );
        let relinks = plan.count(ActionType::Relink);
        if relinks > 0 {
            let _ = writeln!(output, "      {relinks} with state-only dependency changes");
        }

        if !plan.passes_guardrails {
            let _ = writeln!(output, "\n{} Guardrail violations:", "⚠".yellow());
            for violation in &plan.guardrail_violations {
                let _ = writeln!(output, "   - {violation}");
            }
        }

        output
    }

    /// Formats validation results.
    #[must_use]
    pub fn format_validation(&self, spec: &StackSpec, result: &ValidationResult, show_warnings: bool) -> String {
        match self.format {
            OutputFormat::Json => Self::json(&ValidationJson {
                valid: result.is_valid(),
                project: spec.qualified_name(),
                resources: spec.resources.len(),
                errors: result.errors.iter().map(|e| format!("{}: {}", e.field, e.message)).collect(),
                warnings: result.warnings.clone(),
            }),
            OutputFormat::Text => {
                let mut output = String::new();
                if result.is_valid() {
                    let _ = writeln!(output, "{} Spec is valid", "✓".green());
                } else {
                    let _ = writeln!(output, "{} Spec has {} error(s):", "✗".red(), result.error_count());
                    for error in &result.errors {
                        let _ = writeln!(output, "   - {}: {}", error.field, error.message);
                    }
                }
                if show_warnings && !result.warnings.is_empty() {
                    let _ = writeln!(output, "\n{} Warnings:", "⚠".yellow());
                    for warning in &result.warnings {
                        let _ = writeln!(output, "   - {warning}");
                    }
                }
                let _ = writeln!(output, "\n   Project: {}", spec.project.name);
                let _ = writeln!(output, "   Environment: {}", spec.project.environment);
                let _ = writeln!(output, "   Resources: {}", spec.resources.len());
                output
            }
        }
    }

    /// Formats the resource graph as dependency levels.
    #[must_use]
    pub fn format_graph(&self, graph: &ResourceGraph) -> String {
        let levels = graph.levels();
        match self.format {
            OutputFormat::Json => Self::json(&GraphJson {
                order: graph.topological_order(),
                edges: graph
                    .nodes()
                    .flat_map(|n| graph.dependencies(&n.name).into_iter().map(move |d| (d.to_string(), n.name.clone())))
                    .collect(),
                levels,
            }),
            OutputFormat::Text => {
                let mut output = String::new();
                for (depth, level) in levels.iter().enumerate() {
                    let _ = writeln!(output, "Level {depth}:");
                    for name in level {
                        let deps = graph.dependencies(name);
                        if deps.is_empty() {
                            let _ = writeln!(output, "   {name}");
                        } else {
                            let _ = writeln!(output, "   {name} <- {}", deps.join(", ").dimmed());
                        }
                    }
                }
                output
            }
        }
    }

    /// Formats the outcome of an apply or destroy.
    #[must_use]
    pub fn format_apply(&self, report: &ApplyReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                let Some(result) = &report.execution else {
                    return if report.confirmed {
                        format!("{} No changes to apply.\n", "✓".green())
                    } else {
                        String::from("Apply cancelled.\n")
                    };
                };

                let mut output = String::new();
                for action in result.results.iter().filter(|r| r.action_type != ActionType::Noop) {
                    let status = match action.status {
                        ActionStatus::Succeeded => "✓".green(),
                        ActionStatus::Failed => "✗".red(),
                        ActionStatus::Skipped => "-".yellow(),
                        ActionStatus::Cancelled => "-".dimmed(),
                    };
                    let _ = write!(output, "{status} {} {}", action.action_type, action.resource_name);
                    if action.attempts > 1 {
                        let _ = write!(output, " ({} attempts)", action.attempts);
                    }
                    if let Some(error) = &action.error {
                        let _ = write!(output, ": {}", error.red());
                    }
                    output.push('\n');
                }

                let _ = writeln!(
                    output,
                    "\n{} succeeded, {} failed, {} skipped, {} cancelled in {}ms",
                    result.succeeded.to_string().green(),
                    result.failed.to_string().red(),
                    result.skipped.to_string().yellow(),
                    result.cancelled,
                    result.duration_ms
                );
                if let Some(reason) = &result.cancel_reason {
                    let _ = writeln!(output, "{} Run stopped: {reason}", "⚠".yellow());
                }
                output
            }
        }
    }

    /// Formats a drift report.
    #[must_use]
    pub fn format_drift(&self, report: &DriftReport) -> String {
        match self.format {
            OutputFormat::Json => Self::json(report),
            OutputFormat::Text => {
                let mut output = if report.is_converged() {
                    format!("{} No drift detected, state is converged.\n", "✓".green())
                } else {
                    let mut output = format!("{} Drift detected:\n\n", "⚠".yellow());
                    for entry in report.drifted() {
                        let status = match entry.status {
                            DriftStatus::Missing => entry.status.to_string().red(),
                            _ => entry.status.to_string().yellow(),
                        };
                        let _ = writeln!(output, "   - {} ({status})", entry.name);
                        for detail in &entry.details {
                            let _ = writeln!(output, "       {detail}");
                        }
                    }
                    let _ = write!(
                        output,
                        "\n{}/{} resources have drifted.\n",
                        report.drifted().len(),
                        report.entries.len()
                    );
                    output
                };
                if !report.unapplied.is_empty() {
                    let _ = writeln!(output, "Not yet applied: {}", report.unapplied.join(", "));
                }
                output
            }
        }
    }

    /// Formats applied state.
    #[must_use]
    pub fn format_state(&self, state: &AppliedState) -> String {
        match self.format {
            OutputFormat::Json => Self::json(state),
            OutputFormat::Text => {
                let mut output = String::new();
                let _ = writeln!(output, "\nState: {}/{}\n", state.project, state.environment);
                let _ = writeln!(output, "   Version: {}", state.version);
                let _ = writeln!(output, "   Serial: {}", state.serial);
                let _ = writeln!(output, "   Spec hash: {}", short(&state.spec_hash));
                let _ = writeln!(output, "   Last updated: {}", state.last_updated);

                if !state.resources.is_empty() {
                    let rows: Vec<ResourceRow> = state
                        .resources
                        .values()
                        .map(|r| ResourceRow {
                            name: r.name.clone(),
                            resource_type: r.resource_type.to_string(),
                            physical_id: truncate(&r.physical_id, 32),
                            updated: r.updated_at.format("%Y-%m-%d %H:%M").to_string(),
                        })
                        .collect();
                    output.push('\n');
                    output.push_str(&Table::new(rows).to_string());
                    output.push('\n');
                }

                if !state.history.is_empty() {
                    let _ = writeln!(output, "\n   Recent history ({}):", state.history.len());
                    for entry in state.history.iter().rev().take(5) {
                        let status = if entry.success { "✓".green() } else { "✗".red() };
                        let _ = writeln!(
                            output,
                            "     {status} {} - {} ({})",
                            entry.timestamp.format("%Y-%m-%d %H:%M"),
                            entry.operation,
                            entry.resources.join(", ")
                        );
                    }
                }

                output
            }
        }
    }

    /// Formats lock information.
    #[must_use]
    pub fn format_lock(&self, lock: &LockInfo) -> String {
        match self.format {
            OutputFormat::Json => Self::json(lock),
            OutputFormat::Text => format!(
                "State locked: {} (holder {}, expires in {}s)\n",
                lock.lock_id,
                lock.holder,
                lock.remaining_secs()
            ),
        }
    }

    fn format_action_type(action_type: ActionType) -> String {
        match action_type {
            ActionType::Create => "+create".green().to_string(),
            ActionType::Update => "~update".yellow().to_string(),
            ActionType::Replace => "±replace".magenta().to_string(),
            ActionType::Delete => "-delete".red().to_string(),
            ActionType::Teardown => "-teardown".red().dimmed().to_string(),
            ActionType::Relink => "=relink".cyan().to_string(),
            ActionType::Noop => "noop".dimmed().to_string(),
        }
    }
}

fn short(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}

#[derive(Serialize)]
struct ValidationJson {
    valid: bool,
    project: String,
    resources: usize,
    errors: Vec<String>,
    warnings: Vec<String>,
}

#[derive(Serialize)]
struct GraphJson {
    order: Vec<String>,
    levels: Vec<Vec<String>>,
    edges: Vec<(String, String)>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigParser;
    use crate::graph::GraphBuilder;
    use crate::planner::DiffEngine;

    const STACK: &str = r#"
project:
  name: eks-sandbox
resources:
  cluster:
    type: cluster
    properties:
      name: eks-sandbox
      version: "1.30"
  endpoint:
    type: output
    properties:
      value: "${cluster.endpoint}"
"#;

    fn plan() -> (ResourceGraph, Plan) {
        let spec = ConfigParser::new().parse_yaml(STACK, None).expect("parse");
        let graph = GraphBuilder::new().build(&spec).expect("graph");
        let state = AppliedState::new("eks-sandbox", "dev");
        let diff = DiffEngine::new().compute_diff(&graph, &state);
        let plan = Plan::from_diff(&diff, &graph, &state, None, "0123456789abcdef");
        (graph, plan)
    }

    #[test]
    fn test_text_plan_lists_actions() {
        colored::control::set_override(false);
        let (_, plan) = plan();
        let text = OutputFormatter::new(OutputFormat::Text).format_plan(&plan, false);
        assert!(text.contains("01234567"));
        assert!(text.contains("+create"));
        assert!(text.contains("endpoint"));
        assert!(text.contains("2 to create"));
    }

    #[test]
    fn test_json_plan_is_parseable() {
        let (_, plan) = plan();
        let json = OutputFormatter::new(OutputFormat::Json).format_plan(&plan, false);
        let value: serde_json::Value = serde_json::from_str(&json).expect("json");
        assert_eq!(value["actions"].as_array().map(Vec::len), Some(2));
        assert_eq!(value["actions"][0]["resource_name"], "cluster");
    }

    #[test]
    fn test_graph_levels() {
        colored::control::set_override(false);
        let (graph, _) = plan();
        let text = OutputFormatter::new(OutputFormat::Text).format_graph(&graph);
        assert!(text.contains("Level 0:\n   cluster"));
        assert!(text.contains("endpoint <- cluster"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a-rather-long-reason", 10), "a-rathe...");
        assert_eq!(short("abc"), "abc");
    }
}
