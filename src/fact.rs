//! Typed fact model for the per-turn working memory.
//!
//! Facts are immutable records: classifiers and rules only ever append new
//! facts, never mutate existing ones. Every fact optionally carries
//! [`Provenance`] describing who produced it; the rules engine injects
//! provenance automatically when rule actions emit facts.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorCode;

/// Minimum confidence a signal must carry to enter working memory.
pub const MIN_CONFIDENCE: f64 = 0.6;

/// Maximum confidence a signal may carry.
pub const MAX_CONFIDENCE: f64 = 1.0;

/// Where a fact came from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Provenance {
    /// Producing stage, e.g. "classifier" or "rule"
    pub source: String,
    /// The specific classifier dimension or rule name
    pub producer: String,
    /// Turn the fact belongs to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_index: Option<u32>,
    /// Active profile name, when relevant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    /// How long the producer took
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

impl Provenance {
    pub fn new(source: impl Into<String>, producer: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            producer: producer.into(),
            turn_index: None,
            profile: None,
            duration_ms: None,
        }
    }

    pub fn classifier(dimension: Dimension) -> Self {
        Self::new("classifier", dimension.as_str())
    }

    pub fn rule(name: impl Into<String>) -> Self {
        Self::new("rule", name)
    }

    pub fn with_turn(mut self, turn_index: u32) -> Self {
        self.turn_index = Some(turn_index);
        self
    }

    pub fn with_duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }
}

/// A named axis of classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    Claim,
    Support,
    Calibration,
    Temporal,
    Contract,
    Intent,
}

impl Dimension {
    pub const ALL: [Dimension; 6] = [
        Dimension::Claim,
        Dimension::Support,
        Dimension::Calibration,
        Dimension::Temporal,
        Dimension::Contract,
        Dimension::Intent,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claim => "claim",
            Self::Support => "support",
            Self::Calibration => "calibration",
            Self::Temporal => "temporal",
            Self::Contract => "contract",
            Self::Intent => "intent",
        }
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A classified signal on one dimension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub dimension: Dimension,
    pub signal: String,
    pub confidence: f64,
}

impl Signal {
    pub fn new(dimension: Dimension, signal: impl Into<String>, confidence: f64) -> Self {
        Self {
            dimension,
            signal: signal.into(),
            confidence,
        }
    }

    /// Whether the confidence lies within the admissible band.
    pub fn in_range(&self) -> bool {
        (MIN_CONFIDENCE..=MAX_CONFIDENCE).contains(&self.confidence)
    }
}

/// How a plan produces the turn's response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Direct,
    Sequential,
    Parallel,
    Task,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Sequential => "sequential",
            Self::Parallel => "parallel",
            Self::Task => "task",
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How multi-call plans aggregate their step or branch outputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStrategy {
    /// Keep only the final output
    Last,
    /// Join outputs in order
    Concat,
    /// Tagged sections, one per step or branch
    Label,
}

/// Bounds for one task-loop run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolutionEnvelope {
    pub max_cycles: u32,
    pub max_tokens: u64,
    pub max_tool_calls: u32,
    pub timeout_ms: u64,
}

impl Default for ResolutionEnvelope {
    fn default() -> Self {
        Self {
            max_cycles: 8,
            max_tokens: 16_000,
            max_tool_calls: 12,
            timeout_ms: 120_000,
        }
    }
}

/// One step of a sequential plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SequenceStep {
    pub role: String,
    pub strategy: Strategy,
    /// Prompt-table key spliced in as the step's user nudge
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adaptation_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    /// Reuse the accumulated thread instead of composing fresh
    #[serde(default)]
    pub build_thread: bool,
}

impl SequenceStep {
    pub fn direct(role: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            strategy: Strategy::Direct,
            adaptation_key: None,
            tools: None,
            build_thread: false,
        }
    }

    pub fn continuing(mut self) -> Self {
        self.build_thread = true;
        self
    }

    pub fn with_adaptation(mut self, key: impl Into<String>) -> Self {
        self.adaptation_key = Some(key.into());
        self
    }
}

/// A named recipe for producing the turn's response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub strategy: Strategy,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<Vec<SequenceStep>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionEnvelope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub length_level: Option<String>,
    pub rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_strategy: Option<ResultStrategy>,
    /// Set via a policy-blocked twin fact, never by mutation
    #[serde(default)]
    pub policy_blocked: bool,
    /// The policy code that blocked this plan, when blocked
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_code: Option<ErrorCode>,
}

impl ExecutionPlan {
    pub fn new(name: impl Into<String>, strategy: Strategy, rationale: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id: None,
            strategy,
            role: None,
            tools: None,
            sequence: None,
            roles: None,
            resolution: None,
            length_level: None,
            rationale: rationale.into(),
            result_strategy: None,
            policy_blocked: false,
            policy_code: None,
        }
    }

    pub fn direct(name: impl Into<String>, rationale: impl Into<String>) -> Self {
        Self::new(name, Strategy::Direct, rationale)
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_tools(mut self, tools: Vec<String>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_roles(mut self, roles: Vec<String>) -> Self {
        self.roles = Some(roles);
        self
    }

    pub fn with_sequence(mut self, sequence: Vec<SequenceStep>) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_resolution(mut self, resolution: ResolutionEnvelope) -> Self {
        self.resolution = Some(resolution);
        self
    }

    pub fn with_length_level(mut self, level: impl Into<String>) -> Self {
        self.length_level = Some(level.into());
        self
    }

    pub fn with_result_strategy(mut self, rs: ResultStrategy) -> Self {
        self.result_strategy = Some(rs);
        self
    }

    /// A copy of this plan marked blocked by the given policy code.
    /// Blocking is expressed as a new fact; the original stays untouched.
    pub fn blocked_by(&self, code: ErrorCode) -> Self {
        let mut twin = self.clone();
        twin.policy_blocked = true;
        twin.policy_code = Some(code);
        twin
    }

    /// Whether the plan declares any tool requirements.
    pub fn has_tools(&self) -> bool {
        self.tools.as_ref().is_some_and(|t| !t.is_empty())
            || self
                .sequence
                .as_ref()
                .is_some_and(|s| s.iter().any(|st| st.tools.as_ref().is_some_and(|t| !t.is_empty())))
    }

    /// Structural validation applied before dispatch.
    ///
    /// `Last` is rejected for parallel plans: branch ordering is undefined,
    /// so "the last branch" has no stable meaning.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("execution plan has an empty name".to_string());
        }
        if self.strategy == Strategy::Parallel && self.result_strategy == Some(ResultStrategy::Last)
        {
            return Err(format!(
                "plan '{}': result strategy 'last' is not allowed for parallel plans",
                self.name
            ));
        }
        Ok(())
    }

    /// Plans match precedence entries by name or explicit id.
    pub fn matches_name(&self, name: &str) -> bool {
        self.name == name || self.id.as_deref() == Some(name)
    }
}

/// Ordered plan-name preference; at most one per evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanPrecedence {
    pub order: Vec<String>,
}

/// Role chosen for the response by a rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoleSelection {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// Scales the composed token budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenMultiplier {
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Arbitrary derived datum for downstream rules or the composer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Derived {
    pub name: String,
    pub value: Value,
}

/// Extra adaptation key spliced into the composed instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Adaptation {
    pub key: String,
}

/// A tool capability available this turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Capability {
    pub name: String,
}

/// Scopes signal matching to the current turn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TurnContext {
    pub current_turn_index: u32,
}

/// The payload of a fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FactData {
    Signal(Signal),
    ExecutionPlan(ExecutionPlan),
    PlanPrecedence(PlanPrecedence),
    SelectedPlan(ExecutionPlan),
    RoleSelection(RoleSelection),
    TokenMultiplier(TokenMultiplier),
    Derived(Derived),
    Adaptation(Adaptation),
    Capability(Capability),
    TurnContext(TurnContext),
}

impl FactData {
    /// Short kind tag, used for grouping and logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Signal(_) => "signal",
            Self::ExecutionPlan(_) => "execution_plan",
            Self::PlanPrecedence(_) => "plan_precedence",
            Self::SelectedPlan(_) => "selected_plan",
            Self::RoleSelection(_) => "role_selection",
            Self::TokenMultiplier(_) => "token_multiplier",
            Self::Derived(_) => "derived",
            Self::Adaptation(_) => "adaptation",
            Self::Capability(_) => "capability",
            Self::TurnContext(_) => "turn_context",
        }
    }
}

/// An immutable record in the per-turn working memory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    #[serde(flatten)]
    pub data: FactData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
}

impl Fact {
    pub fn new(data: FactData) -> Self {
        Self {
            data,
            provenance: None,
        }
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = Some(provenance);
        self
    }

    pub fn kind(&self) -> &'static str {
        self.data.kind()
    }

    /// The producer recorded in provenance, or "unknown".
    pub fn producer(&self) -> &str {
        self.provenance
            .as_ref()
            .map(|p| p.producer.as_str())
            .unwrap_or("unknown")
    }

    pub fn as_signal(&self) -> Option<&Signal> {
        match &self.data {
            FactData::Signal(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_plan(&self) -> Option<&ExecutionPlan> {
        match &self.data {
            FactData::ExecutionPlan(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_precedence(&self) -> Option<&PlanPrecedence> {
        match &self.data {
            FactData::PlanPrecedence(p) => Some(p),
            _ => None,
        }
    }

    pub fn as_selected(&self) -> Option<&ExecutionPlan> {
        match &self.data {
            FactData::SelectedPlan(p) => Some(p),
            _ => None,
        }
    }

    /// Whether this fact belongs to the given turn. Facts without a turn
    /// stamp are considered current.
    pub fn in_turn(&self, turn_index: u32) -> bool {
        self.provenance
            .as_ref()
            .and_then(|p| p.turn_index)
            .map_or(true, |t| t == turn_index)
    }
}

/// Grouped view over a finished working memory, consumed by the composer
/// and the executor.
#[derive(Debug, Clone, Default)]
pub struct FactMap {
    pub signals: Vec<Signal>,
    pub plans: Vec<ExecutionPlan>,
    pub precedence: Option<PlanPrecedence>,
    pub selected: Option<ExecutionPlan>,
    pub role_selections: Vec<RoleSelection>,
    pub multipliers: Vec<TokenMultiplier>,
    pub derived: Vec<Derived>,
    pub adaptations: Vec<Adaptation>,
    pub capabilities: Vec<Capability>,
    pub turn: Option<TurnContext>,
}

impl FactMap {
    /// Group facts by kind, preserving insertion order within each group.
    pub fn from_facts(facts: &[Fact]) -> Self {
        let mut map = Self::default();
        for fact in facts {
            match &fact.data {
                FactData::Signal(s) => map.signals.push(s.clone()),
                FactData::ExecutionPlan(p) => map.plans.push(p.clone()),
                FactData::PlanPrecedence(p) => {
                    if map.precedence.is_none() {
                        map.precedence = Some(p.clone());
                    }
                }
                FactData::SelectedPlan(p) => {
                    if map.selected.is_none() {
                        map.selected = Some(p.clone());
                    }
                }
                FactData::RoleSelection(r) => map.role_selections.push(r.clone()),
                FactData::TokenMultiplier(m) => map.multipliers.push(m.clone()),
                FactData::Derived(d) => map.derived.push(d.clone()),
                FactData::Adaptation(a) => map.adaptations.push(a.clone()),
                FactData::Capability(c) => map.capabilities.push(c.clone()),
                FactData::TurnContext(t) => {
                    if map.turn.is_none() {
                        map.turn = Some(*t);
                    }
                }
            }
        }
        map
    }

    /// Signal names in insertion order, de-duplicated.
    pub fn signal_names(&self) -> Vec<&str> {
        let mut seen = std::collections::HashSet::new();
        self.signals
            .iter()
            .map(|s| s.signal.as_str())
            .filter(|name| seen.insert(*name))
            .collect()
    }

    /// Find a signal on a dimension at or above a confidence floor.
    pub fn signal(&self, dimension: Dimension, name: &str) -> Option<&Signal> {
        self.signals
            .iter()
            .find(|s| s.dimension == dimension && s.signal == name)
    }
}
