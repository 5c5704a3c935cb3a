//! Policy rules auto-generated from [`PolicyLimits`].
//!
//! A violating plan is never mutated or removed. The rule emits a blocked
//! twin fact carrying the policy code; the selection rule treats any name
//! with a blocked twin as ineligible.

use crate::config::PolicyLimits;
use crate::error::ErrorCode;
use crate::fact::{Fact, FactData, Strategy};

use super::engine::{Condition, Rule, RuleEffects};

pub fn policy_rules(limits: PolicyLimits) -> Vec<Rule> {
    vec![
        max_fanout_rule(limits),
        max_children_rule(limits),
        max_depth_rule(limits),
    ]
}

fn already_blocked(fx: &RuleEffects<'_>, name: &str) -> bool {
    fx.all_facts()
        .any(|f| f.as_plan().is_some_and(|p| p.policy_blocked && p.name == name))
}

fn max_fanout_rule(limits: PolicyLimits) -> Rule {
    Rule::new(
        "policy-max-fanout",
        0,
        Condition::collect_all("plans", |f, _| {
            f.as_plan()
                .is_some_and(|p| p.strategy == Strategy::Parallel && !p.policy_blocked)
        }),
        move |fx, bindings| {
            for fact in bindings.facts("plans") {
                let plan = fact.as_plan().expect("binding filtered to plans");
                let fanout = plan.roles.as_ref().map(|r| r.len()).unwrap_or(0);
                if fanout > limits.max_fanout && !already_blocked(fx, &plan.name) {
                    tracing::warn!(
                        plan = %plan.name,
                        fanout,
                        max_fanout = limits.max_fanout,
                        "policy blocked parallel plan"
                    );
                    fx.add_fact(Fact::new(FactData::ExecutionPlan(
                        plan.blocked_by(ErrorCode::Fanout),
                    )));
                }
            }
            Ok(())
        },
    )
}

fn max_children_rule(limits: PolicyLimits) -> Rule {
    Rule::new(
        "policy-max-children",
        0,
        Condition::collect_all("plans", |f, _| {
            f.as_plan()
                .is_some_and(|p| p.strategy == Strategy::Sequential && !p.policy_blocked)
        }),
        move |fx, bindings| {
            for fact in bindings.facts("plans") {
                let plan = fact.as_plan().expect("binding filtered to plans");
                let children = plan.sequence.as_ref().map(|s| s.len()).unwrap_or(0);
                if children > limits.max_children && !already_blocked(fx, &plan.name) {
                    tracing::warn!(
                        plan = %plan.name,
                        children,
                        max_children = limits.max_children,
                        "policy blocked sequential plan"
                    );
                    fx.add_fact(Fact::new(FactData::ExecutionPlan(
                        plan.blocked_by(ErrorCode::Children),
                    )));
                }
            }
            Ok(())
        },
    )
}

/// A sequence step that is itself multi-call needs two extra levels of
/// nesting below the plan; block such plans when the depth budget cannot
/// accommodate them.
fn max_depth_rule(limits: PolicyLimits) -> Rule {
    Rule::new(
        "policy-max-depth",
        0,
        Condition::collect_all("plans", |f, _| {
            f.as_plan().is_some_and(|p| !p.policy_blocked)
        }),
        move |fx, bindings| {
            for fact in bindings.facts("plans") {
                let plan = fact.as_plan().expect("binding filtered to plans");
                let nested = plan
                    .sequence
                    .as_ref()
                    .is_some_and(|s| s.iter().any(|step| step.strategy != Strategy::Direct));
                if nested && limits.max_depth < 2 && !already_blocked(fx, &plan.name) {
                    tracing::warn!(
                        plan = %plan.name,
                        max_depth = limits.max_depth,
                        "policy blocked nested plan"
                    );
                    fx.add_fact(Fact::new(FactData::ExecutionPlan(
                        plan.blocked_by(ErrorCode::Depth),
                    )));
                }
            }
            Ok(())
        },
    )
}
