//! Rules engine integration: the engine itself, the built-in domain rules,
//! and the auto-generated policy and system rules.
//!
//! Rule sources are applied in a fixed order (domain, policy, enforcement,
//! validation, selection); salience bands keep that order during firing.

pub mod engine;

mod domain;
mod policy;
mod system;

pub use domain::{domain_rules, DEFAULT_PRECEDENCE};
pub use engine::{
    current_turn, Bindings, Condition, Rule, RuleEffects, RulesEngine, MAX_CYCLES,
};
pub use policy::policy_rules;
pub use system::system_rules;

use crate::config::PolicyLimits;
use crate::fact::{Dimension, Fact, FactData};

/// Assemble the full rule set for a turn.
pub fn build_rules(default_role: &str, limits: PolicyLimits) -> Vec<Rule> {
    let mut rules = domain_rules();
    rules.extend(policy_rules(limits));
    rules.extend(system_rules(default_role));
    rules
}

/// Filter matching a signal on a dimension at or above a confidence floor,
/// scoped to the current turn.
pub(crate) fn signal_filter(
    dimension: Dimension,
    name: &'static str,
    min_confidence: f64,
) -> impl Fn(&Fact, &[Fact]) -> bool + Send + Sync + 'static {
    move |fact, wm| {
        let in_turn = current_turn(wm).map_or(true, |t| fact.in_turn(t));
        in_turn
            && fact.as_signal().is_some_and(|s| {
                s.dimension == dimension && s.signal == name && s.confidence >= min_confidence
            })
    }
}

pub(crate) fn is_plan(fact: &Fact, _wm: &[Fact]) -> bool {
    matches!(fact.data, FactData::ExecutionPlan(_))
}

pub(crate) fn is_precedence(fact: &Fact, _wm: &[Fact]) -> bool {
    matches!(fact.data, FactData::PlanPrecedence(_))
}

pub(crate) fn wm_has_plan(wm: &[Fact], name: &str) -> bool {
    wm.iter().any(|f| f.as_plan().is_some_and(|p| p.name == name))
}

pub(crate) fn wm_has_selected(wm: &[Fact]) -> bool {
    wm.iter().any(|f| f.as_selected().is_some())
}

pub(crate) fn wm_has_precedence(wm: &[Fact]) -> bool {
    wm.iter().any(|f| f.as_precedence().is_some())
}

pub(crate) fn wm_has_multiplier_reason(wm: &[Fact], reason: &str) -> bool {
    wm.iter().any(|f| match &f.data {
        FactData::TokenMultiplier(m) => m.reason.as_deref() == Some(reason),
        _ => false,
    })
}
