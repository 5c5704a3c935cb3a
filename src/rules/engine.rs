//! Forward-chaining rules engine over the per-turn working memory.
//!
//! Rules carry a salience (higher fires first, ties by insertion order), a
//! condition tree with accumulators, and an action that emits new facts
//! through [`RuleEffects`]. Facts are never mutated: derivation always
//! appends. Each (rule, binding tuple) fires at most once per run, and the
//! whole evaluation is bounded by [`MAX_CYCLES`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::fact::{Fact, FactData, Provenance};

/// Hard cap on evaluation cycles. Overrun is a trappable loop-detected
/// outcome that still carries the accrued facts.
pub const MAX_CYCLES: u32 = 32;

/// Predicate over a single fact, with the full working memory available
/// for context (turn scoping reads the TurnContext fact).
pub type FactFilter = Arc<dyn Fn(&Fact, &[Fact]) -> bool + Send + Sync>;

/// Predicate over the whole working memory.
pub type FactTest = Arc<dyn Fn(&[Fact]) -> bool + Send + Sync>;

/// Rule action: reads the working memory view, emits facts.
pub type RuleAction = Arc<dyn Fn(&mut RuleEffects<'_>, &Bindings<'_>) -> Result<()> + Send + Sync>;

/// Condition tree for rule matching.
#[derive(Clone)]
pub enum Condition {
    /// Every sub-condition must match; bindings merge.
    All(Vec<Condition>),
    /// First matching sub-condition wins.
    Any(Vec<Condition>),
    /// Boolean predicate over the working memory; binds nothing.
    Test(FactTest),
    /// Accumulator: bind every matching fact under `var`. Always matches,
    /// possibly with an empty group.
    CollectAll { var: &'static str, filter: FactFilter },
    /// Accumulator: matches when at least `at_least` facts pass the filter.
    Count {
        var: &'static str,
        filter: FactFilter,
        at_least: usize,
    },
}

impl Condition {
    pub fn test(f: impl Fn(&[Fact]) -> bool + Send + Sync + 'static) -> Self {
        Self::Test(Arc::new(f))
    }

    pub fn collect_all(
        var: &'static str,
        f: impl Fn(&Fact, &[Fact]) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::CollectAll {
            var,
            filter: Arc::new(f),
        }
    }

    pub fn at_least(
        var: &'static str,
        n: usize,
        f: impl Fn(&Fact, &[Fact]) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::Count {
            var,
            filter: Arc::new(f),
            at_least: n,
        }
    }
}

/// Facts bound by a condition match, addressed by variable name.
pub struct Bindings<'a> {
    wm: &'a [Fact],
    vars: BTreeMap<&'static str, Vec<usize>>,
}

impl<'a> Bindings<'a> {
    fn empty(wm: &'a [Fact]) -> Self {
        Self {
            wm,
            vars: BTreeMap::new(),
        }
    }

    /// Facts bound under a variable, in working-memory order.
    pub fn facts(&self, var: &str) -> Vec<&'a Fact> {
        self.vars
            .get(var)
            .map(|ixs| ixs.iter().map(|&i| &self.wm[i]).collect())
            .unwrap_or_default()
    }

    pub fn count(&self, var: &str) -> usize {
        self.vars.get(var).map(|v| v.len()).unwrap_or(0)
    }

    fn merge(&mut self, other: Bindings<'a>) {
        for (var, ixs) in other.vars {
            self.vars.entry(var).or_default().extend(ixs);
        }
    }

    /// Refraction key: stable identity of the binding tuple.
    fn key(&self) -> String {
        let mut parts = Vec::with_capacity(self.vars.len());
        for (var, ixs) in &self.vars {
            let ix_str: Vec<String> = ixs.iter().map(|i| i.to_string()).collect();
            parts.push(format!("{}:{}", var, ix_str.join(",")));
        }
        parts.join(";")
    }
}

fn eval<'a>(condition: &Condition, wm: &'a [Fact]) -> Option<Bindings<'a>> {
    match condition {
        Condition::All(conds) => {
            let mut merged = Bindings::empty(wm);
            for cond in conds {
                merged.merge(eval(cond, wm)?);
            }
            Some(merged)
        }
        Condition::Any(conds) => conds.iter().find_map(|c| eval(c, wm)),
        Condition::Test(pred) => pred(wm).then(|| Bindings::empty(wm)),
        Condition::CollectAll { var, filter } => {
            let mut bindings = Bindings::empty(wm);
            bindings.vars.insert(var, matching_indices(wm, filter));
            Some(bindings)
        }
        Condition::Count {
            var,
            filter,
            at_least,
        } => {
            let matched = matching_indices(wm, filter);
            (matched.len() >= *at_least).then(|| {
                let mut bindings = Bindings::empty(wm);
                bindings.vars.insert(var, matched);
                bindings
            })
        }
    }
}

fn matching_indices(wm: &[Fact], filter: &FactFilter) -> Vec<usize> {
    wm.iter()
        .enumerate()
        .filter(|(_, fact)| filter(fact, wm))
        .map(|(i, _)| i)
        .collect()
}

/// Write handle handed to rule actions.
///
/// Reads see the working memory plus any facts already queued by this
/// firing. Writes inject rule provenance and enforce the signal
/// confidence floor.
pub struct RuleEffects<'a> {
    wm: &'a [Fact],
    rule_name: &'a str,
    turn_index: Option<u32>,
    pending: Vec<Fact>,
}

impl<'a> RuleEffects<'a> {
    fn new(wm: &'a [Fact], rule_name: &'a str, turn_index: Option<u32>) -> Self {
        Self {
            wm,
            rule_name,
            turn_index,
            pending: Vec::new(),
        }
    }

    /// Working memory plus pending additions from this firing.
    pub fn all_facts(&self) -> impl Iterator<Item = &Fact> {
        self.wm.iter().chain(self.pending.iter())
    }

    /// Whether any plan fact (existing or pending) carries this name.
    pub fn has_plan_named(&self, name: &str) -> bool {
        self.all_facts()
            .any(|f| f.as_plan().is_some_and(|p| p.name == name))
    }

    /// Queue a fact for insertion, stamping rule provenance.
    pub fn add_fact(&mut self, fact: Fact) {
        if let FactData::Signal(signal) = &fact.data {
            if !signal.in_range() {
                tracing::debug!(
                    rule = self.rule_name,
                    signal = %signal.signal,
                    confidence = signal.confidence,
                    "dropping out-of-range signal emitted by rule"
                );
                return;
            }
        }

        let provenance = match fact.provenance {
            None => {
                let mut p = Provenance::rule(self.rule_name);
                p.turn_index = self.turn_index;
                p
            }
            Some(mut p) => {
                if p.source.is_empty() {
                    p.source = "rule".to_string();
                }
                if p.producer.is_empty() {
                    p.producer = self.rule_name.to_string();
                }
                if p.turn_index.is_none() {
                    p.turn_index = self.turn_index;
                }
                p
            }
        };

        self.pending.push(Fact {
            data: fact.data,
            provenance: Some(provenance),
        });
    }

    fn into_pending(self) -> Vec<Fact> {
        self.pending
    }
}

/// A forward-chaining rule.
#[derive(Clone)]
pub struct Rule {
    pub name: String,
    pub salience: i32,
    pub condition: Condition,
    pub action: RuleAction,
}

impl Rule {
    pub fn new(
        name: impl Into<String>,
        salience: i32,
        condition: Condition,
        action: impl Fn(&mut RuleEffects<'_>, &Bindings<'_>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            salience,
            condition,
            action: Arc::new(action),
        }
    }
}

/// The engine: an ordered rule list evaluated to quiescence.
pub struct RulesEngine {
    rules: Vec<Rule>,
}

impl RulesEngine {
    /// Build an engine. Rules sort by descending salience; the sort is
    /// stable so insertion order breaks ties.
    pub fn new(mut rules: Vec<Rule>) -> Self {
        rules.sort_by_key(|r| std::cmp::Reverse(r.salience));
        Self { rules }
    }

    pub fn rule_names(&self) -> Vec<&str> {
        self.rules.iter().map(|r| r.name.as_str()).collect()
    }

    /// Run forward chaining over the seed facts until quiescence.
    ///
    /// Validation failures from rule actions propagate as-is. Exceeding
    /// [`MAX_CYCLES`] yields [`Error::RuleLoop`] carrying the accrued
    /// facts.
    pub fn evaluate(&self, seed: Vec<Fact>) -> Result<Vec<Fact>> {
        let mut wm = seed;
        let mut fired: HashSet<(String, String)> = HashSet::new();
        let mut cycles: u32 = 0;

        loop {
            cycles += 1;
            if cycles > MAX_CYCLES {
                return Err(Error::RuleLoop {
                    max_cycles: MAX_CYCLES,
                    facts: wm,
                });
            }

            let mut fired_this_cycle = false;
            for rule in &self.rules {
                let outcome = {
                    match eval(&rule.condition, &wm) {
                        None => None,
                        Some(bindings) => {
                            let key = (rule.name.clone(), bindings.key());
                            if fired.contains(&key) {
                                None
                            } else {
                                let turn = current_turn(&wm);
                                let mut effects = RuleEffects::new(&wm, &rule.name, turn);
                                (rule.action)(&mut effects, &bindings)?;
                                Some((key, effects.into_pending()))
                            }
                        }
                    }
                };

                if let Some((key, pending)) = outcome {
                    tracing::debug!(rule = %key.0, emitted = pending.len(), "rule fired");
                    fired.insert(key);
                    wm.extend(pending);
                    fired_this_cycle = true;
                }
            }

            if !fired_this_cycle {
                break;
            }
        }

        Ok(wm)
    }
}

/// The current turn index recorded in working memory, if any.
pub fn current_turn(wm: &[Fact]) -> Option<u32> {
    wm.iter().find_map(|f| match &f.data {
        FactData::TurnContext(t) => Some(t.current_turn_index),
        _ => None,
    })
}
