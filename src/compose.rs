//! Instruction composer: turns a selected plan plus the fact map into a
//! structured thread and a token budget.

use std::collections::HashMap;

use serde_json::{json, Value};

use crate::config::Profile;
use crate::error::{Error, Result};
use crate::fact::{ExecutionPlan, FactMap, Strategy};
use crate::thread::{Message, Thread};
use crate::tools::ToolDef;

/// Floor of the composed token budget.
pub const MIN_TOKENS: u32 = 50;

/// Ceiling of the composed token budget.
pub const MAX_TOKENS: u32 = 4000;

/// Short user turn separating the primary instruction from the user input.
pub const TEE_PROMPT: &str = "The following is your primary instruction for this session:";

const FRAME_ACK: &str = "Understood. I will maintain this context for the rest of the session.";

const TASK_ALIGNMENT_USER: &str = "You are beginning a multi-step task. Work in cycles: act, \
observe, and continue until the task is done, then state that you have completed your task.";

const TASK_ALIGNMENT_ASSISTANT: &str =
    "Understood. I will work in cycles and state completion when the task is done.";

/// How the thread is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionType {
    /// Full composition: frame, system, primary, tee, input.
    Default,
    /// Reuse a built thread, optionally appending a new user message.
    Continuation,
    /// Append system and primary to accumulated history, no new input.
    Accumulation,
}

impl CompositionType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Continuation => "continuation",
            Self::Accumulation => "accumulation",
        }
    }
}

/// Everything the composer needs for one composition.
pub struct ComposeRequest<'a> {
    pub plan: &'a ExecutionPlan,
    pub facts: &'a FactMap,
    pub input: &'a str,
    /// Optional framing text opening the conversation
    pub frame: Option<&'a str>,
    pub composition: CompositionType,
    pub cwd: Option<&'a str>,
    /// Built thread for continuation or accumulation
    pub existing: Option<&'a Thread>,
    /// Overrides the plan's role (sequential steps, parallel branches)
    pub role_override: Option<&'a str>,
    /// Tool definitions already filtered against the allowed set
    pub tool_defs: &'a [ToolDef],
}

impl<'a> ComposeRequest<'a> {
    pub fn new(plan: &'a ExecutionPlan, facts: &'a FactMap, input: &'a str) -> Self {
        Self {
            plan,
            facts,
            input,
            frame: None,
            composition: CompositionType::Default,
            cwd: None,
            existing: None,
            role_override: None,
            tool_defs: &[],
        }
    }
}

/// A composed instruction set ready for execution.
#[derive(Debug, Clone)]
pub struct Instructions {
    pub thread: Thread,
    /// Semantic position -> message index
    pub indices: HashMap<String, usize>,
    pub adaptations: String,
    pub length_guidance: String,
    pub tool_instructions: String,
    pub max_tokens: u32,
    pub metadata: HashMap<String, Value>,
}

/// Composes instruction threads from a profile's prompt tables.
pub struct InstructionComposer<'a> {
    profile: &'a Profile,
}

impl<'a> InstructionComposer<'a> {
    pub fn new(profile: &'a Profile) -> Self {
        Self { profile }
    }

    pub fn compose(&self, request: &ComposeRequest<'_>) -> Result<Instructions> {
        let role = self.profile.role_or_default(
            request
                .role_override
                .or(request.plan.role.as_deref())
                .or_else(|| {
                    request
                        .facts
                        .role_selections
                        .first()
                        .map(|r| r.role.as_str())
                }),
        );

        let adaptations = self.adaptations_text(request.facts);
        let length_guidance = request
            .plan
            .length_level
            .as_deref()
            .and_then(|level| self.profile.length_guidance(level))
            .unwrap_or_default()
            .to_string();
        let tool_instructions = tool_instructions_text(request.tool_defs, request.cwd);
        let max_tokens = token_budget(role.base_tokens, self.profile, request.facts);

        let mut thread = Thread::new();
        let mut indices = HashMap::new();

        match request.composition {
            CompositionType::Default => {
                if let Some(frame) = request.frame {
                    indices.insert("frame".to_string(), thread.len());
                    thread.push(Message::user(frame).with_tag("frame"));
                    thread.push(Message::assistant(FRAME_ACK).with_tag("frame-ack"));
                }

                indices.insert("system".to_string(), thread.len());
                thread.push(
                    Message::system(system_text(
                        &role.system_prompt,
                        &adaptations,
                        &length_guidance,
                        &tool_instructions,
                    ))
                    .with_tag("system"),
                );

                if request.plan.strategy == Strategy::Task {
                    indices.insert("task-alignment".to_string(), thread.len());
                    thread.push(Message::user(TASK_ALIGNMENT_USER).with_tag("task-alignment"));
                    thread.push(
                        Message::assistant(TASK_ALIGNMENT_ASSISTANT).with_tag("task-alignment-ack"),
                    );
                }

                indices.insert("primary".to_string(), thread.len());
                thread.push(Message::user(role.primary_prompt.clone()).with_tag("primary"));

                indices.insert("tee".to_string(), thread.len());
                thread.push(Message::user(TEE_PROMPT).with_tag("tee"));

                indices.insert("input".to_string(), thread.len());
                thread.push(Message::user(request.input).with_tag("input"));
            }
            CompositionType::Continuation => {
                let existing = request.existing.ok_or_else(|| {
                    Error::Config("continuation composition requires an existing thread".into())
                })?;
                thread = existing.clone();
                if !request.input.is_empty() {
                    indices.insert("input".to_string(), thread.len());
                    thread.push(Message::user(request.input).with_tag("continuation-input"));
                }
            }
            CompositionType::Accumulation => {
                if let Some(existing) = request.existing {
                    thread = existing.clone();
                }
                indices.insert("system".to_string(), thread.len());
                thread.push(
                    Message::system(system_text(
                        &role.system_prompt,
                        &adaptations,
                        &length_guidance,
                        &tool_instructions,
                    ))
                    .with_tag("system"),
                );
                indices.insert("primary".to_string(), thread.len());
                thread.push(Message::user(role.primary_prompt.clone()).with_tag("primary"));
            }
        }

        let metadata = HashMap::from([
            (
                "composition_type".to_string(),
                json!(request.composition.as_str()),
            ),
            ("role".to_string(), json!(role.name)),
            ("signal_count".to_string(), json!(request.facts.signals.len())),
        ]);

        Ok(Instructions {
            thread,
            indices,
            adaptations,
            length_guidance,
            tool_instructions,
            max_tokens,
            metadata,
        })
    }

    /// Adaptation fragments in deterministic order: signal insertion order
    /// first, then adaptation facts, de-duplicated by key.
    fn adaptations_text(&self, facts: &FactMap) -> String {
        let mut seen = std::collections::HashSet::new();
        let mut fragments = Vec::new();

        let keys = facts
            .signal_names()
            .into_iter()
            .map(str::to_string)
            .chain(facts.adaptations.iter().map(|a| a.key.clone()));

        for key in keys {
            if !seen.insert(key.clone()) {
                continue;
            }
            if let Some(text) = self.profile.adaptation(&key) {
                fragments.push(text.to_string());
            }
        }
        fragments.join("\n")
    }
}

fn system_text(
    system_prompt: &str,
    adaptations: &str,
    length_guidance: &str,
    tool_instructions: &str,
) -> String {
    let mut text = system_prompt.to_string();
    for section in [adaptations, length_guidance, tool_instructions] {
        if !section.is_empty() {
            text.push_str("\n\n");
            text.push_str(section);
        }
    }
    text
}

fn tool_instructions_text(tool_defs: &[ToolDef], cwd: Option<&str>) -> String {
    if tool_defs.is_empty() {
        return String::new();
    }
    let mut text = String::from("You may use these tools:\n");
    for def in tool_defs {
        text.push_str(&format!("- {}: {}\n", def.name, def.description));
    }
    if let Some(cwd) = cwd {
        text.push_str(&format!("Working directory: {}\n", cwd));
    }
    text.push_str("Request a tool call when it moves the task forward.");
    text
}

/// `clamp(round(base x product(multipliers)), 50, 4000)`.
///
/// Multipliers come from the profile's signal-indexed table and from
/// TokenMultiplier facts.
pub fn token_budget(base: u32, profile: &Profile, facts: &FactMap) -> u32 {
    let mut product = 1.0_f64;
    for name in facts.signal_names() {
        if let Some(multiplier) = profile.multiplier_for(name) {
            product *= multiplier;
        }
    }
    for multiplier in &facts.multipliers {
        product *= multiplier.value;
    }
    let raw = (base as f64 * product).round() as i64;
    raw.clamp(MIN_TOKENS as i64, MAX_TOKENS as i64) as u32
}
