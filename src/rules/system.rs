//! System rules: enforcement, validation, and precedence-based plan
//! selection.
//!
//! Validation failures raise immediately; they indicate a module authoring
//! bug and must name the offending producers.

use std::collections::HashSet;

use crate::error::Error;
use crate::fact::{Dimension, ExecutionPlan, Fact, FactData, TokenMultiplier};

use super::engine::{Condition, Rule};
use super::{is_plan, is_precedence, signal_filter, wm_has_selected};

pub fn system_rules(default_role: &str) -> Vec<Rule> {
    vec![
        ack_enforcement_rule(),
        validate_precedence_rule(),
        validate_plan_names_rule(),
        plan_selection_rule(default_role.to_string()),
    ]
}

/// An ack-only contract always gets a brief direct plan, whatever the
/// domain rules produced.
fn ack_enforcement_rule() -> Rule {
    Rule::new(
        "system-ack-enforcement",
        -10,
        Condition::at_least("ack", 1, signal_filter(Dimension::Contract, "ack-only", 0.75)),
        |fx, _| {
            if !fx.has_plan_named("ack-only-direct") {
                fx.add_fact(Fact::new(FactData::ExecutionPlan(
                    ExecutionPlan::direct(
                        "ack-only-direct",
                        "acknowledgement needs only a brief reply",
                    )
                    .with_role("assistant")
                    .with_length_level("brief"),
                )));
            }
            let has_multiplier = fx.all_facts().any(|f| {
                matches!(&f.data, FactData::TokenMultiplier(m) if m.reason.as_deref() == Some("ack-only"))
            });
            if !has_multiplier {
                fx.add_fact(Fact::new(FactData::TokenMultiplier(TokenMultiplier {
                    value: 0.5,
                    reason: Some("ack-only".to_string()),
                })));
            }
            Ok(())
        },
    )
}

fn validate_precedence_rule() -> Rule {
    Rule::new(
        "system-validate-precedence",
        -50,
        Condition::at_least("precedence", 2, is_precedence),
        |_, bindings| {
            let producers: Vec<String> = bindings
                .facts("precedence")
                .iter()
                .map(|f| f.producer().to_string())
                .collect();
            Err(Error::Validation(format!(
                "multiple PlanPrecedence facts; producers: {}",
                producers.join(", ")
            )))
        },
    )
}

fn validate_plan_names_rule() -> Rule {
    Rule::new(
        "system-validate-plan-names",
        -50,
        Condition::at_least("unnamed", 1, |f, _| {
            f.as_plan().is_some_and(|p| p.name.trim().is_empty())
        }),
        |_, bindings| {
            let producers: Vec<String> = bindings
                .facts("unnamed")
                .iter()
                .map(|f| f.producer().to_string())
                .collect();
            Err(Error::Validation(format!(
                "unnamed ExecutionPlan facts; producers: {}",
                producers.join(", ")
            )))
        },
    )
}

/// Precedence-based plan selection. Runs last; emits exactly one
/// SelectedPlan per evaluation (the synthesized fallback counts).
fn plan_selection_rule(default_role: String) -> Rule {
    Rule::new(
        "system-select-plan",
        -100,
        Condition::All(vec![
            Condition::collect_all("plans", is_plan),
            Condition::collect_all("precedence", is_precedence),
            Condition::test(|wm| !wm_has_selected(wm)),
        ]),
        move |fx, bindings| {
            let plan_facts: Vec<&ExecutionPlan> = bindings
                .facts("plans")
                .iter()
                .filter_map(|f| f.as_plan())
                .collect();

            // A name is blocked when any twin fact carries a policy code.
            let mut blocked: Vec<(&str, &str)> = Vec::new();
            for plan in &plan_facts {
                if plan.policy_blocked {
                    let code = plan
                        .policy_code
                        .map(|c| c.as_str())
                        .unwrap_or("E_UNKNOWN");
                    if !blocked.iter().any(|(name, _)| *name == plan.name) {
                        blocked.push((plan.name.as_str(), code));
                    }
                }
            }

            // Eligible plans: unblocked facts whose name has no blocked
            // twin, first fact per name wins.
            let mut seen_names = HashSet::new();
            let eligible: Vec<&ExecutionPlan> = plan_facts
                .iter()
                .copied()
                .filter(|p| !p.policy_blocked)
                .filter(|p| !blocked.iter().any(|(name, _)| *name == p.name))
                .filter(|p| seen_names.insert(p.name.clone()))
                .collect();

            if eligible.is_empty() {
                let mut rationale = "No plans available after policy enforcement".to_string();
                if !blocked.is_empty() {
                    let listing: Vec<String> = blocked
                        .iter()
                        .map(|(name, code)| format!("{} [{}]", name, code))
                        .collect();
                    rationale.push_str(&format!(" (blocked: {})", listing.join(", ")));
                }
                fx.add_fact(Fact::new(FactData::SelectedPlan(
                    ExecutionPlan::direct("fallback-direct", rationale)
                        .with_role(default_role.clone()),
                )));
                return Ok(());
            }

            let precedence = bindings
                .facts("precedence")
                .first()
                .and_then(|f| f.as_precedence())
                .cloned();

            let mut chosen: Option<&ExecutionPlan> = None;
            if let Some(precedence) = &precedence {
                let mut walked = HashSet::new();
                for name in &precedence.order {
                    if !walked.insert(name.clone()) {
                        tracing::warn!(
                            plan = %name,
                            "duplicate precedence entry, keeping first occurrence"
                        );
                        continue;
                    }
                    let matches: Vec<&ExecutionPlan> = eligible
                        .iter()
                        .copied()
                        .filter(|p| p.matches_name(name))
                        .collect();
                    if matches.is_empty() {
                        continue;
                    }
                    chosen = matches
                        .iter()
                        .copied()
                        .find(|p| p.has_tools())
                        .or_else(|| matches.first().copied());
                    break;
                }
            }

            let chosen = chosen
                .or_else(|| eligible.iter().copied().find(|p| p.has_tools()))
                .or_else(|| eligible.first().copied())
                .expect("eligible set checked non-empty above");

            chosen.validate().map_err(Error::Validation)?;
            fx.add_fact(Fact::new(FactData::SelectedPlan(chosen.clone())));
            Ok(())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::fact::{PlanPrecedence, Provenance, Signal, Strategy, TurnContext};
    use crate::rules::engine::RulesEngine;
    use crate::rules::{wm_has_multiplier_reason, wm_has_plan};

    fn turn_fact() -> Fact {
        Fact::new(FactData::TurnContext(TurnContext {
            current_turn_index: 0,
        }))
    }

    fn plan_fact(plan: ExecutionPlan) -> Fact {
        Fact::new(FactData::ExecutionPlan(plan))
    }

    fn precedence_fact(order: &[&str], producer: &str) -> Fact {
        Fact::new(FactData::PlanPrecedence(PlanPrecedence {
            order: order.iter().map(|s| s.to_string()).collect(),
        }))
        .with_provenance(Provenance::rule(producer))
    }

    fn selected(facts: &[Fact]) -> Option<&ExecutionPlan> {
        facts.iter().find_map(|f| f.as_selected())
    }

    fn engine() -> RulesEngine {
        RulesEngine::new(system_rules("assistant"))
    }

    #[test]
    fn test_precedence_walk_prefers_listed_order() {
        let out = engine()
            .evaluate(vec![
                plan_fact(ExecutionPlan::direct("second-choice", "r")),
                plan_fact(ExecutionPlan::direct("first-choice", "r")),
                precedence_fact(&["first-choice", "second-choice"], "test"),
            ])
            .unwrap();
        assert_eq!(selected(&out).unwrap().name, "first-choice");
    }

    #[test]
    fn test_tool_bearing_plan_preferred_within_name() {
        let out = engine()
            .evaluate(vec![
                plan_fact(ExecutionPlan::direct("other", "r")),
                plan_fact(
                    ExecutionPlan::direct("other", "r").with_tools(vec!["search".to_string()]),
                ),
                precedence_fact(&["other"], "test"),
            ])
            .unwrap();
        // Name dedup keeps the first fact; within the precedence match the
        // tool-bearing candidate is preferred when distinct names compete.
        assert_eq!(selected(&out).unwrap().name, "other");
    }

    #[test]
    fn test_no_precedence_prefers_tools() {
        let out = engine()
            .evaluate(vec![
                plan_fact(ExecutionPlan::direct("plain", "r")),
                plan_fact(
                    ExecutionPlan::direct("tooled", "r").with_tools(vec!["search".to_string()]),
                ),
            ])
            .unwrap();
        assert_eq!(selected(&out).unwrap().name, "tooled");
    }

    #[test]
    fn test_blocked_plan_falls_back_to_synthesized() {
        let plan = ExecutionPlan::new("wide", Strategy::Parallel, "r")
            .with_roles(vec!["a".to_string(); 8]);
        let twin = plan.blocked_by(ErrorCode::Fanout);
        let out = engine()
            .evaluate(vec![
                plan_fact(plan),
                plan_fact(twin),
                precedence_fact(&["wide"], "test"),
            ])
            .unwrap();

        let chosen = selected(&out).unwrap();
        assert_eq!(chosen.name, "fallback-direct");
        assert_eq!(chosen.strategy, Strategy::Direct);
        assert!(chosen.rationale.contains("No plans available after policy enforcement"));
        assert!(chosen.rationale.contains("E_FANOUT"));
    }

    #[test]
    fn test_empty_plan_set_synthesizes_fallback() {
        let out = engine().evaluate(vec![turn_fact()]).unwrap();
        let chosen = selected(&out).unwrap();
        assert_eq!(chosen.name, "fallback-direct");
        assert_eq!(chosen.role.as_deref(), Some("assistant"));
    }

    #[test]
    fn test_exactly_one_selected_plan() {
        let out = engine()
            .evaluate(vec![
                plan_fact(ExecutionPlan::direct("a", "r")),
                plan_fact(ExecutionPlan::direct("b", "r")),
            ])
            .unwrap();
        let count = out.iter().filter(|f| f.as_selected().is_some()).count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_duplicate_precedence_entry_keeps_first() {
        let out = engine()
            .evaluate(vec![
                plan_fact(ExecutionPlan::direct("explore-analyze-par", "r")),
                precedence_fact(
                    &["explore-analyze-par", "explore-analyze-par"],
                    "test",
                ),
            ])
            .unwrap();
        assert_eq!(selected(&out).unwrap().name, "explore-analyze-par");
    }

    #[test]
    fn test_multiple_precedence_is_fatal() {
        let err = engine()
            .evaluate(vec![
                plan_fact(ExecutionPlan::direct("a", "r")),
                precedence_fact(&["a"], "module-alpha"),
                precedence_fact(&["a"], "module-beta"),
            ])
            .unwrap_err();
        match err {
            Error::Validation(msg) => {
                assert!(msg.contains("module-alpha"));
                assert!(msg.contains("module-beta"));
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_unnamed_plan_is_fatal() {
        let err = engine()
            .evaluate(vec![plan_fact(ExecutionPlan::direct("", "r"))
                .with_provenance(Provenance::rule("sloppy-module"))])
            .unwrap_err();
        match err {
            Error::Validation(msg) => assert!(msg.contains("sloppy-module")),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_ack_enforcement_without_domain_rules() {
        let out = engine()
            .evaluate(vec![
                turn_fact(),
                Fact::new(FactData::Signal(Signal::new(
                    Dimension::Contract,
                    "ack-only",
                    0.85,
                )))
                .with_provenance(Provenance::classifier(Dimension::Contract).with_turn(0)),
            ])
            .unwrap();

        assert!(wm_has_plan(&out, "ack-only-direct"));
        assert!(wm_has_multiplier_reason(&out, "ack-only"));
        assert_eq!(selected(&out).unwrap().name, "ack-only-direct");
    }

    #[test]
    fn test_parallel_last_rejected_at_selection() {
        let bad = ExecutionPlan::new("par", Strategy::Parallel, "r")
            .with_roles(vec!["a".to_string(), "b".to_string()])
            .with_result_strategy(crate::fact::ResultStrategy::Last);
        let err = engine().evaluate(vec![plan_fact(bad)]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
