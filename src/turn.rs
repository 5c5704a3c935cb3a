//! The turn runner: classify, evaluate, compose, execute, respond.
//!
//! One call to [`TurnRunner::run_turn`] takes a message thread and
//! produces the single response for that turn. Any error escaping the
//! pipeline lands in the fallback executor, so the runner itself never
//! fails.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tokio::sync::OnceCell;

use crate::approval::ApprovalCoordinator;
use crate::cancel::CancelToken;
use crate::classifiers::ClassifierBank;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{Boundary, BoundaryType, EventSink};
use crate::executor::{ExecScope, FallbackExecutor, PlanExecutor, TurnResponse};
use crate::fact::{Capability, Fact, FactData, FactMap, Provenance, TurnContext};
use crate::llm::LlmClient;
use crate::rules::{build_rules, RulesEngine};
use crate::thread::Thread;
use crate::tools::{NoTools, ToolDef, ToolRegistry};

/// Builder for [`TurnRunner`].
pub struct TurnRunnerBuilder {
    config: EngineConfig,
    llm: Option<Arc<dyn LlmClient>>,
    tools: Arc<dyn ToolRegistry>,
    sink: EventSink,
    approvals: Option<ApprovalCoordinator>,
}

impl TurnRunnerBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            llm: None,
            tools: Arc::new(NoTools),
            sink: EventSink::disabled(),
            approvals: None,
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn tools(mut self, tools: Arc<dyn ToolRegistry>) -> Self {
        self.tools = tools;
        self
    }

    pub fn event_sink(mut self, sink: EventSink) -> Self {
        self.sink = sink;
        self
    }

    /// Wire an approval coordinator whose request stream an external
    /// resolver drains. Without one, every tool call is denied.
    pub fn approvals(mut self, approvals: ApprovalCoordinator) -> Self {
        self.approvals = Some(approvals);
        self
    }

    pub fn build(self) -> Result<TurnRunner> {
        let llm = self
            .llm
            .ok_or_else(|| Error::Config("an LLM client is required".into()))?;

        let approvals = match self.approvals {
            Some(approvals) => approvals,
            None => {
                // No resolver configured: deny everything rather than hang.
                let (approvals, _requests) = ApprovalCoordinator::new();
                approvals.shutdown();
                approvals
            }
        };

        let mut bank = ClassifierBank::new(self.config.classifier.clone(), &self.config.model);
        if self.config.classifier.enable_llm {
            bank = bank.with_llm(llm.clone());
        }

        let rules = RulesEngine::new(build_rules(
            &self.config.profile.default_role,
            self.config.limits,
        ));

        let fallback = FallbackExecutor::new(self.config.model.clone()).with_llm(llm.clone());

        Ok(TurnRunner {
            config: self.config,
            llm,
            tools: self.tools,
            approvals,
            sink: self.sink,
            bank,
            rules,
            fallback,
            discovered: OnceCell::new(),
        })
    }
}

impl Default for TurnRunnerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives one turn through the whole pipeline.
pub struct TurnRunner {
    config: EngineConfig,
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolRegistry>,
    approvals: ApprovalCoordinator,
    sink: EventSink,
    bank: ClassifierBank,
    rules: RulesEngine,
    fallback: FallbackExecutor,
    discovered: OnceCell<HashMap<String, ToolDef>>,
}

impl std::fmt::Debug for TurnRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnRunner").finish_non_exhaustive()
    }
}

impl TurnRunner {
    pub fn builder() -> TurnRunnerBuilder {
        TurnRunnerBuilder::new()
    }

    /// The approval coordinator tool calls go through.
    pub fn approvals(&self) -> &ApprovalCoordinator {
        &self.approvals
    }

    /// Run one turn. Never fails: errors become fallback responses.
    #[tracing::instrument(skip_all, fields(turn_index = turn_index))]
    pub async fn run_turn(
        &self,
        thread: &Thread,
        turn_index: u32,
        cancel: CancelToken,
    ) -> TurnResponse {
        let started = Instant::now();
        let pipeline = self.sink.open(
            BoundaryType::Pipeline,
            "pipeline.turn",
            None,
            Some(json!({"turn_index": turn_index})),
        );

        let mut response = match self
            .run_inner(thread, turn_index, &cancel, &pipeline)
            .await
        {
            Ok(response) => response,
            Err(err) => self.fallback.recover(&err, &cancel).await,
        };

        response.metadata.insert(
            "duration_ms".to_string(),
            json!(started.elapsed().as_millis() as u64),
        );

        self.sink.close(
            &pipeline,
            Some(json!({
                "fallback": response.metadata.contains_key("fallback"),
                "tokens": response.usage.total(),
            })),
        );
        response
    }

    async fn run_inner(
        &self,
        thread: &Thread,
        turn_index: u32,
        cancel: &CancelToken,
        pipeline: &Boundary,
    ) -> Result<TurnResponse> {
        let available = self.discovered_tools().await?;
        let input = thread
            .last_user()
            .map(|m| m.content.clone())
            .unwrap_or_default();

        // Perception.
        let classify_boundary = self.sink.open(
            BoundaryType::Execution,
            "pipeline.classify",
            Some(pipeline.id.as_str()),
            None,
        );
        let mut seed: Vec<Fact> = vec![Fact::new(FactData::TurnContext(TurnContext {
            current_turn_index: turn_index,
        }))];
        for name in available.keys() {
            seed.push(
                Fact::new(FactData::Capability(Capability { name: name.clone() }))
                    .with_provenance(Provenance::new("session", "tool-discovery")),
            );
        }
        let signals = self.bank.classify(thread, turn_index, cancel).await;
        let signal_count = signals.len();
        seed.extend(signals);
        self.sink
            .close(&classify_boundary, Some(json!({"signals": signal_count})));

        // Evaluation and selection.
        let facts = self.rules.evaluate(seed)?;
        let fact_map = FactMap::from_facts(&facts);
        let selected = fact_map
            .selected
            .clone()
            .ok_or_else(|| Error::Internal("rule evaluation produced no selected plan".into()))?;
        self.sink.point(
            "pipeline.plan-selected",
            Some(pipeline),
            Some(json!({"plan": selected.name, "strategy": selected.strategy.as_str()})),
        );
        tracing::info!(
            plan = %selected.name,
            strategy = %selected.strategy,
            signals = signal_count,
            "plan selected"
        );

        // Execution.
        let executor = PlanExecutor::new(
            self.llm.clone(),
            self.tools.clone(),
            self.approvals.clone(),
            self.config.clone(),
            self.sink.clone(),
            available.clone(),
        );
        let role = selected.role.clone();
        let mut scope = ExecScope::root(fact_map, input, cancel.clone());
        scope.parent_boundary = Some(pipeline.id.clone());

        let mut response = executor.execute(&selected, scope).await?;
        if let Some(role) = role {
            response
                .metadata
                .entry("role".to_string())
                .or_insert_with(|| json!(role));
        }
        Ok(response)
    }

    /// Tool discovery runs once per runner lifetime.
    async fn discovered_tools(&self) -> Result<&HashMap<String, ToolDef>> {
        self.discovered
            .get_or_try_init(|| async {
                let map = self.tools.discover().await?;
                tracing::debug!(tools = map.len(), "tool discovery complete");
                Ok::<_, Error>(map)
            })
            .await
    }
}
