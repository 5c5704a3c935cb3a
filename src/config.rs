//! Engine configuration and the active profile.
//!
//! A [`Profile`] bundles everything the instruction composer and the domain
//! rules read: role configurations, adaptation and length-guidance prompt
//! tables, and signal-indexed token multipliers. [`EngineConfig`] wraps a
//! profile together with policy limits and classifier settings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Default token budget when a role does not specify one.
pub const DEFAULT_BASE_TOKENS: u32 = 500;

/// Configuration for one responder role.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleConfig {
    pub name: String,
    /// System instruction establishing the role
    pub system_prompt: String,
    /// Primary instruction presented before the user input
    pub primary_prompt: String,
    /// Base token budget before multipliers
    pub base_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
}

impl RoleConfig {
    pub fn new(
        name: impl Into<String>,
        system_prompt: impl Into<String>,
        primary_prompt: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            system_prompt: system_prompt.into(),
            primary_prompt: primary_prompt.into(),
            base_tokens: DEFAULT_BASE_TOKENS,
            temperature: None,
        }
    }

    pub fn with_base_tokens(mut self, tokens: u32) -> Self {
        self.base_tokens = tokens;
        self
    }
}

/// Limits enforced by the auto-generated policy rules and the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyLimits {
    /// Maximum plan nesting depth
    pub max_depth: u32,
    /// Maximum concurrent branches of a parallel plan
    pub max_fanout: usize,
    /// Maximum steps of a sequential plan
    pub max_children: usize,
}

impl Default for PolicyLimits {
    fn default() -> Self {
        Self {
            max_depth: 3,
            max_fanout: 4,
            max_children: 6,
        }
    }
}

/// Classifier bank settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Whether to run LLM enhancement behind the per-dimension gates
    pub enable_llm: bool,
    /// Model for enhancement calls; falls back to the engine model
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Soft per-dimension budget; overruns warn but never cancel
    pub soft_budget_ms: u64,
    /// How many recent messages a classifier sees besides the last one
    pub context_window: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            enable_llm: false,
            model: None,
            soft_budget_ms: 2_000,
            context_window: 3,
        }
    }
}

/// Prompt tables and role definitions for one domain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub default_role: String,
    pub roles: HashMap<String, RoleConfig>,
    /// Signal or adaptation key -> instruction fragment
    pub adaptations: HashMap<String, String>,
    /// Length level -> guidance fragment
    pub length_guidance: HashMap<String, String>,
    /// Signal name -> token budget multiplier
    pub signal_multipliers: HashMap<String, f64>,
}

impl Profile {
    /// Look up a role, falling back to the default role.
    pub fn role(&self, name: &str) -> Option<&RoleConfig> {
        self.roles.get(name)
    }

    pub fn role_or_default(&self, name: Option<&str>) -> &RoleConfig {
        name.and_then(|n| self.roles.get(n))
            .or_else(|| self.roles.get(&self.default_role))
            .expect("profile is missing its default role")
    }

    pub fn adaptation(&self, key: &str) -> Option<&str> {
        self.adaptations.get(key).map(|s| s.as_str())
    }

    pub fn length_guidance(&self, level: &str) -> Option<&str> {
        self.length_guidance.get(level).map(|s| s.as_str())
    }

    pub fn multiplier_for(&self, signal: &str) -> Option<f64> {
        self.signal_multipliers.get(signal).copied()
    }
}

impl Default for Profile {
    fn default() -> Self {
        let mut roles = HashMap::new();
        for role in builtin_roles() {
            roles.insert(role.name.clone(), role);
        }

        let adaptations: HashMap<String, String> = [
            ("ack-only", "Keep the reply to a single short sentence."),
            (
                "high-certainty",
                "The user sounds very certain. Surface at least one way the claim could fail.",
            ),
            (
                "forecast",
                "Treat forward-looking statements as predictions. State the horizon and the key assumptions.",
            ),
            ("hedged", "The user is hedging. Offer a clear recommendation."),
            (
                "unsupported",
                "No supporting evidence was offered. Suggest where evidence could be found when it matters.",
            ),
            (
                "time-specified",
                "A concrete time horizon is present. Anchor the answer to it.",
            ),
            (
                "investigate",
                "Ground every statement in something you actually inspected.",
            ),
            ("execute", "Confirm each action taken and its result."),
            (
                "evidence-request",
                "Name the evidence that would raise or lower confidence in the claim.",
            ),
            (
                "dig-deeper",
                "Go one level deeper on the most uncertain point from the previous step.",
            ),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let length_guidance: HashMap<String, String> = [
            ("brief", "Answer in one or two sentences."),
            ("standard", "Answer in a few short paragraphs."),
            ("extended", "A thorough, structured answer is appropriate."),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let signal_multipliers: HashMap<String, f64> = [("source-cited", 1.1), ("capture-only", 0.6)]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        Self {
            name: "default".to_string(),
            default_role: "assistant".to_string(),
            roles,
            adaptations,
            length_guidance,
            signal_multipliers,
        }
    }
}

fn builtin_roles() -> Vec<RoleConfig> {
    vec![
        RoleConfig::new(
            "assistant",
            "You are a careful assistant. Answer directly and say when you are unsure.",
            "Respond to the user's message.",
        ),
        RoleConfig::new(
            "investigator",
            "You investigate questions by inspecting the available material with tools before answering.",
            "Investigate the user's request. Use tools to gather evidence, then report what you found.",
        )
        .with_base_tokens(800),
        RoleConfig::new(
            "executor",
            "You carry out concrete actions with tools, one at a time, and verify each result.",
            "Perform the requested actions. Report exactly what was done.",
        )
        .with_base_tokens(700),
        RoleConfig::new(
            "planner",
            "You produce the strongest constructive case and a concrete path forward.",
            "Lay out the plan or argument supporting the user's position.",
        )
        .with_base_tokens(700),
        RoleConfig::new(
            "critic",
            "You stress-test claims. Find the weakest assumptions and the most likely failure modes.",
            "Challenge the user's claim. List what would have to be true for it to hold.",
        )
        .with_base_tokens(600),
        RoleConfig::new(
            "explorer",
            "You map the space of the question broadly before anyone commits to an answer.",
            "Explore the question. Enumerate the angles worth examining.",
        )
        .with_base_tokens(700),
        RoleConfig::new(
            "analyst",
            "You weigh evidence and produce a reasoned judgement with explicit uncertainty.",
            "Analyze the question and give a calibrated judgement.",
        )
        .with_base_tokens(700),
    ]
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub profile: Profile,
    pub limits: PolicyLimits,
    pub classifier: ClassifierConfig,
    /// Default model for plan execution and fallback calls
    pub model: String,
    pub temperature: Option<f64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            profile: Profile::default(),
            limits: PolicyLimits::default(),
            classifier: ClassifierConfig::default(),
            model: "claude-3-5-sonnet-20241022".to_string(),
            temperature: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_limits(mut self, limits: PolicyLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_profile(mut self, profile: Profile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }
}
