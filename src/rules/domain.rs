//! Built-in domain rules: signal combinations to plans, role selections,
//! token multipliers, and derived facts.
//!
//! Salience bands: domain rules fire in the 10..50 range, before the
//! policy (0) and system (negative) rules.

use serde_json::json;

use crate::fact::{
    Adaptation, Derived, Dimension, ExecutionPlan, Fact, FactData, PlanPrecedence,
    ResolutionEnvelope, ResultStrategy, RoleSelection, Strategy, TokenMultiplier,
};

use super::engine::{Condition, Rule};
use super::{signal_filter, wm_has_plan, wm_has_precedence};

/// Plan preference order emitted once per turn.
pub const DEFAULT_PRECEDENCE: [&str; 5] = [
    "ack-only-direct",
    "execute-task",
    "investigate-task",
    "red-team-forecast",
    "explore-analyze-par",
];

pub fn domain_rules() -> Vec<Rule> {
    vec![
        precedence_rule(),
        ack_only_rule(),
        red_team_forecast_rule(),
        unsupported_forecast_rule(),
        investigate_task_rule(),
        execute_task_rule(),
        explore_analyze_rule(),
    ]
}

fn precedence_rule() -> Rule {
    Rule::new(
        "plan-precedence",
        50,
        Condition::All(vec![
            Condition::at_least("plans", 1, super::is_plan),
            Condition::test(|wm| !wm_has_precedence(wm)),
        ]),
        |fx, _| {
            fx.add_fact(Fact::new(FactData::PlanPrecedence(PlanPrecedence {
                order: DEFAULT_PRECEDENCE.iter().map(|s| s.to_string()).collect(),
            })));
            Ok(())
        },
    )
}

fn ack_only_rule() -> Rule {
    Rule::new(
        "ack-only-direct",
        20,
        Condition::All(vec![
            Condition::at_least("ack", 1, signal_filter(Dimension::Contract, "ack-only", 0.75)),
            Condition::test(|wm| !wm_has_plan(wm, "ack-only-direct")),
        ]),
        |fx, _| {
            fx.add_fact(Fact::new(FactData::ExecutionPlan(
                ExecutionPlan::direct("ack-only-direct", "acknowledgement needs only a brief reply")
                    .with_role("assistant")
                    .with_length_level("brief"),
            )));
            fx.add_fact(Fact::new(FactData::TokenMultiplier(TokenMultiplier {
                value: 0.5,
                reason: Some("ack-only".to_string()),
            })));
            Ok(())
        },
    )
}

fn red_team_forecast_rule() -> Rule {
    Rule::new(
        "red-team-forecast",
        15,
        Condition::All(vec![
            Condition::at_least("forecast", 1, signal_filter(Dimension::Claim, "forecast", 0.7)),
            Condition::at_least(
                "certainty",
                1,
                signal_filter(Dimension::Calibration, "high-certainty", 0.75),
            ),
            Condition::test(|wm| !wm_has_plan(wm, "red-team-forecast")),
        ]),
        |fx, _| {
            fx.add_fact(Fact::new(FactData::ExecutionPlan(
                ExecutionPlan::new(
                    "red-team-forecast",
                    Strategy::Parallel,
                    "confident forecast deserves a constructive case and a red team",
                )
                .with_roles(vec!["planner".to_string(), "critic".to_string()])
                .with_result_strategy(ResultStrategy::Label),
            )));
            fx.add_fact(Fact::new(FactData::TokenMultiplier(TokenMultiplier {
                value: 1.1,
                reason: Some("red-team".to_string()),
            })));
            Ok(())
        },
    )
}

fn unsupported_forecast_rule() -> Rule {
    Rule::new(
        "unsupported-forecast",
        12,
        Condition::All(vec![
            Condition::at_least("forecast", 1, signal_filter(Dimension::Claim, "forecast", 0.7)),
            Condition::at_least(
                "unsupported",
                1,
                signal_filter(Dimension::Support, "unsupported", 0.6),
            ),
            Condition::test(|wm| {
                !wm.iter().any(|f| {
                    matches!(&f.data, FactData::Derived(d) if d.name == "unsupported-forecast")
                })
            }),
        ]),
        |fx, bindings| {
            let confidence = bindings
                .facts("forecast")
                .first()
                .and_then(|f| f.as_signal())
                .map(|s| s.confidence)
                .unwrap_or(0.0);
            fx.add_fact(Fact::new(FactData::Derived(Derived {
                name: "unsupported-forecast".to_string(),
                value: json!({ "confidence": confidence }),
            })));
            fx.add_fact(Fact::new(FactData::Adaptation(Adaptation {
                key: "evidence-request".to_string(),
            })));
            Ok(())
        },
    )
}

fn investigate_task_rule() -> Rule {
    Rule::new(
        "investigate-task",
        10,
        Condition::All(vec![
            Condition::at_least(
                "investigate",
                1,
                signal_filter(Dimension::Intent, "investigate", 0.7),
            ),
            Condition::test(|wm| !wm_has_plan(wm, "investigate-task")),
        ]),
        |fx, _| {
            fx.add_fact(Fact::new(FactData::ExecutionPlan(
                ExecutionPlan::new(
                    "investigate-task",
                    Strategy::Task,
                    "investigation needs tool access to gather evidence",
                )
                .with_role("investigator")
                .with_tools(vec![
                    "list_directory".to_string(),
                    "read_file".to_string(),
                    "search".to_string(),
                ])
                .with_resolution(ResolutionEnvelope {
                    max_cycles: 5,
                    ..ResolutionEnvelope::default()
                }),
            )));
            fx.add_fact(Fact::new(FactData::RoleSelection(RoleSelection {
                role: "investigator".to_string(),
                rationale: Some("investigate intent".to_string()),
            })));
            Ok(())
        },
    )
}

fn execute_task_rule() -> Rule {
    Rule::new(
        "execute-task",
        10,
        Condition::All(vec![
            Condition::at_least("execute", 1, signal_filter(Dimension::Intent, "execute", 0.7)),
            Condition::test(|wm| !wm_has_plan(wm, "execute-task")),
        ]),
        |fx, _| {
            fx.add_fact(Fact::new(FactData::ExecutionPlan(
                ExecutionPlan::new(
                    "execute-task",
                    Strategy::Task,
                    "concrete actions need a tool loop with verification",
                )
                .with_role("executor")
                .with_tools(vec![
                    "list_directory".to_string(),
                    "read_file".to_string(),
                    "write_file".to_string(),
                ]),
            )));
            fx.add_fact(Fact::new(FactData::RoleSelection(RoleSelection {
                role: "executor".to_string(),
                rationale: Some("execute intent".to_string()),
            })));
            Ok(())
        },
    )
}

fn explore_analyze_rule() -> Rule {
    Rule::new(
        "explore-analyze-par",
        10,
        Condition::All(vec![
            Condition::at_least("explore", 1, signal_filter(Dimension::Contract, "explore", 0.6)),
            Condition::at_least("analyze", 1, signal_filter(Dimension::Contract, "analyze", 0.6)),
            Condition::test(|wm| !wm_has_plan(wm, "explore-analyze-par")),
        ]),
        |fx, _| {
            fx.add_fact(Fact::new(FactData::ExecutionPlan(
                ExecutionPlan::new(
                    "explore-analyze-par",
                    Strategy::Parallel,
                    "broad exploration and focused analysis run side by side",
                )
                .with_roles(vec!["explorer".to_string(), "analyst".to_string()])
                .with_result_strategy(ResultStrategy::Label),
            )));
            Ok(())
        },
    )
}
