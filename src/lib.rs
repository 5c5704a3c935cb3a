//! # turnwise-core
//!
//! A turn-level cognitive orchestration library: classify the user's
//! utterance into typed signals, derive an execution plan through a
//! forward-chaining rule base, and drive one or more LLM calls (direct,
//! sequential, parallel, or a tool-using task loop) to produce a single
//! response.
//!
//! ## Core Components
//!
//! - **Fact**: typed, immutable working-memory records for one turn
//! - **Classifiers**: per-dimension regex analyzers with optional LLM
//!   enhancement behind gates
//! - **Rules**: forward chaining with salience, accumulators, policy
//!   limits, and precedence-based plan selection
//! - **Compose**: structured instruction threads and token budgets
//! - **Executor**: plan dispatch, the task loop, approvals, fallback
//! - **Events**: boundary-structured observability stream
//!
//! ## Example
//!
//! ```rust,ignore
//! use turnwise_core::{CancelToken, Thread, Message, TurnRunner};
//!
//! let runner = TurnRunner::builder()
//!     .llm(llm_client)
//!     .tools(tool_registry)
//!     .build()?;
//!
//! let thread = Thread::from_messages(vec![Message::user("Find all test files.")]);
//! let response = runner.run_turn(&thread, 0, CancelToken::new()).await;
//! println!("{}", response.output);
//! ```

pub mod approval;
pub mod cancel;
pub mod classifiers;
pub mod compose;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod fact;
pub mod llm;
pub mod rules;
pub mod thread;
pub mod tools;
pub mod turn;

// Re-exports for convenience
pub use approval::{
    auto_resolver, ApprovalCoordinator, ApprovalDecision, ApprovalRequest,
};
pub use cancel::CancelToken;
pub use classifiers::{Classification, ClassifierBank};
pub use compose::{
    token_budget, ComposeRequest, CompositionType, InstructionComposer, Instructions,
};
pub use config::{ClassifierConfig, EngineConfig, PolicyLimits, Profile, RoleConfig};
pub use error::{Error, ErrorCode, Result};
pub use events::{Boundary, BoundaryType, EventRole, EventSink, ExecutionEvent};
pub use executor::{ExecScope, FallbackExecutor, PlanExecutor, TaskState, TurnResponse};
pub use fact::{
    Adaptation, Capability, Derived, Dimension, ExecutionPlan, Fact, FactData, FactMap,
    PlanPrecedence, Provenance, ResolutionEnvelope, ResultStrategy, RoleSelection, SequenceStep,
    Signal, Strategy, TokenMultiplier, TurnContext,
};
pub use llm::{
    FinishReason, HttpLlmClient, LlmClient, LlmRequest, LlmResponse, ProviderConfig, Usage,
};
pub use rules::{
    build_rules, domain_rules, policy_rules, system_rules, Condition, Rule, RulesEngine,
    DEFAULT_PRECEDENCE, MAX_CYCLES,
};
pub use thread::{Message, Role, Thread, ToolCallRequest};
pub use tools::{filter_allowed, NoTools, StaticToolRegistry, ToolDef, ToolRegistry};
pub use turn::{TurnRunner, TurnRunnerBuilder};
