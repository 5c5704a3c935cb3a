//! Plan executor: dispatches the selected plan to one of the execution
//! strategies and shapes the final response.
//!
//! Every dispatch opens an execution boundary; sequential steps, parallel
//! branches, task cycles, and LLM exchanges open nested boundaries of
//! their own, so observers see a tree.

mod fallback;
mod task;

pub use fallback::FallbackExecutor;
pub use task::TaskState;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture, FutureExt};
use serde_json::{json, Value};

use crate::approval::ApprovalCoordinator;
use crate::cancel::CancelToken;
use crate::compose::{ComposeRequest, CompositionType, InstructionComposer, Instructions};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::events::{Boundary, BoundaryType, EventSink};
use crate::fact::{ExecutionPlan, FactMap, ResultStrategy, SequenceStep, Strategy};
use crate::llm::{LlmClient, LlmRequest, LlmResponse, Usage};
use crate::thread::{Message, Thread};
use crate::tools::{filter_allowed, ToolDef, ToolRegistry};

/// The single response a turn produces.
#[derive(Debug, Clone)]
pub struct TurnResponse {
    pub output: String,
    pub metadata: HashMap<String, Value>,
    pub usage: Usage,
}

impl TurnResponse {
    pub fn new(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            metadata: HashMap::new(),
            usage: Usage::default(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    fn add_usage(&mut self, usage: Usage) {
        self.usage.prompt += usage.prompt;
        self.usage.completion += usage.completion;
    }
}

/// Per-dispatch execution scope. Each branch of a parallel plan gets its
/// own clone, so fact snapshots never cross branches.
#[derive(Clone)]
pub struct ExecScope {
    pub depth: u32,
    pub parent_boundary: Option<String>,
    pub cancel: CancelToken,
    pub facts: FactMap,
    pub input: String,
    /// Accumulated thread threaded through continuation steps
    pub built: Option<Thread>,
}

impl ExecScope {
    pub fn root(facts: FactMap, input: impl Into<String>, cancel: CancelToken) -> Self {
        Self {
            depth: 0,
            parent_boundary: None,
            cancel,
            facts,
            input: input.into(),
            built: None,
        }
    }

    fn child(&self, parent_boundary: &Boundary) -> Self {
        let mut child = self.clone();
        child.depth += 1;
        child.parent_boundary = Some(parent_boundary.id.clone());
        child.built = None;
        child
    }
}

/// Dispatches selected plans.
pub struct PlanExecutor {
    llm: Arc<dyn LlmClient>,
    tools: Arc<dyn ToolRegistry>,
    approvals: ApprovalCoordinator,
    config: EngineConfig,
    sink: EventSink,
    available_tools: HashMap<String, ToolDef>,
}

impl PlanExecutor {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<dyn ToolRegistry>,
        approvals: ApprovalCoordinator,
        config: EngineConfig,
        sink: EventSink,
        available_tools: HashMap<String, ToolDef>,
    ) -> Self {
        Self {
            llm,
            tools,
            approvals,
            config,
            sink,
            available_tools,
        }
    }

    /// Execute a plan. Recursion happens through sequential steps and
    /// parallel branches, so the future is boxed.
    pub fn execute<'a>(
        &'a self,
        plan: &'a ExecutionPlan,
        scope: ExecScope,
    ) -> BoxFuture<'a, Result<TurnResponse>> {
        async move {
            if scope.cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            if scope.depth > self.config.limits.max_depth {
                return Err(Error::DepthExceeded {
                    depth: scope.depth,
                    max_depth: self.config.limits.max_depth,
                });
            }
            plan.validate().map_err(Error::Validation)?;

            let boundary = self.sink.open(
                BoundaryType::Execution,
                "execution.plan",
                scope.parent_boundary.as_deref(),
                Some(json!({
                    "plan": plan.name,
                    "strategy": plan.strategy.as_str(),
                    "depth": scope.depth,
                })),
            );

            let result = match plan.strategy {
                Strategy::Direct => self.run_direct(plan, &scope, &boundary).await,
                Strategy::Sequential => self.run_sequential(plan, &scope, &boundary).await,
                Strategy::Parallel => self.run_parallel(plan, &scope, &boundary).await,
                Strategy::Task => self.run_task(plan, &scope, &boundary).await,
            };

            match result {
                Ok(mut response) => {
                    response
                        .metadata
                        .insert("strategy".to_string(), json!(plan.strategy.as_str()));
                    response
                        .metadata
                        .insert("plan".to_string(), json!(plan.name));
                    self.sink.close(
                        &boundary,
                        Some(json!({"ok": true, "tokens": response.usage.total()})),
                    );
                    Ok(response)
                }
                Err(err) => {
                    self.sink.close(
                        &boundary,
                        Some(json!({"ok": false, "error": err.to_string()})),
                    );
                    Err(err)
                }
            }
        }
        .boxed()
    }

    async fn run_direct(
        &self,
        plan: &ExecutionPlan,
        scope: &ExecScope,
        boundary: &Boundary,
    ) -> Result<TurnResponse> {
        let tool_defs = self.allowed_tools(plan.tools.as_deref());
        let instructions = self.compose_default(plan, scope, None, &tool_defs)?;

        let request = self
            .base_request(instructions.thread.messages.clone(), instructions.max_tokens)
            .with_tools(tool_defs);
        let response = self.call_llm(request, &scope.cancel, boundary).await?;

        let mut turn = TurnResponse::new(response.output.clone());
        turn.add_usage(response.usage);
        turn.metadata
            .insert("finish_reason".to_string(), json!(response.finish_reason));
        if let Some(role) = instructions.metadata.get("role") {
            turn.metadata.insert("role".to_string(), role.clone());
        }
        Ok(turn)
    }

    async fn run_sequential(
        &self,
        plan: &ExecutionPlan,
        scope: &ExecScope,
        boundary: &Boundary,
    ) -> Result<TurnResponse> {
        let steps = plan
            .sequence
            .as_ref()
            .ok_or_else(|| Error::schema(format!("plan '{}' has no sequence", plan.name)))?;
        if steps.len() > self.config.limits.max_children {
            return Err(Error::ChildrenExceeded {
                children: steps.len(),
                max_children: self.config.limits.max_children,
            });
        }

        let mut outputs: Vec<(String, String)> = Vec::new();
        let mut built: Option<Thread> = scope.built.clone();
        let mut turn = TurnResponse::new("");

        for (index, step) in steps.iter().enumerate() {
            if scope.cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            let step_boundary = self.sink.open(
                BoundaryType::Step,
                "execution.step",
                Some(boundary.id.as_str()),
                Some(json!({"index": index, "role": step.role})),
            );

            let result = self
                .run_step(plan, step, index, scope, &mut built, &step_boundary)
                .await;
            match result {
                Ok((output, usage)) => {
                    turn.add_usage(usage);
                    outputs.push((step.role.clone(), output));
                    self.sink.close(&step_boundary, Some(json!({"ok": true})));
                }
                Err(err) => {
                    self.sink
                        .close(&step_boundary, Some(json!({"ok": false})));
                    return Err(err);
                }
            }
        }

        let strategy = plan.result_strategy.unwrap_or(ResultStrategy::Last);
        turn.output = aggregate(&outputs, strategy);
        turn.metadata
            .insert("steps".to_string(), json!(outputs.len()));
        Ok(turn)
    }

    async fn run_step(
        &self,
        plan: &ExecutionPlan,
        step: &SequenceStep,
        index: usize,
        scope: &ExecScope,
        built: &mut Option<Thread>,
        boundary: &Boundary,
    ) -> Result<(String, Usage)> {
        if step.strategy != Strategy::Direct {
            // Non-direct steps re-enter the executor as child plans.
            let mut child_plan = ExecutionPlan::new(
                format!("{}/{}", plan.name, index),
                step.strategy,
                plan.rationale.clone(),
            );
            child_plan.role = Some(step.role.clone());
            child_plan.tools = step.tools.clone();
            let response = self.execute(&child_plan, scope.child(boundary)).await?;
            return Ok((response.output, response.usage));
        }

        let tool_defs = self.allowed_tools(step.tools.as_deref());
        let composer = InstructionComposer::new(&self.config.profile);

        let instructions = if step.build_thread && built.is_some() {
            let nudge = step
                .adaptation_key
                .as_deref()
                .and_then(|key| self.config.profile.adaptation(key))
                .unwrap_or("Continue.")
                .to_string();
            let existing = built.as_ref().expect("built thread checked above");
            let mut request = ComposeRequest::new(plan, &scope.facts, &nudge);
            request.composition = CompositionType::Continuation;
            request.existing = Some(existing);
            request.role_override = Some(step.role.as_str());
            request.tool_defs = &tool_defs;
            composer.compose(&request)?
        } else {
            self.compose_default(plan, scope, Some(step.role.as_str()), &tool_defs)?
        };

        let request = self
            .base_request(instructions.thread.messages.clone(), instructions.max_tokens)
            .with_tools(tool_defs);
        let response = self.call_llm(request, &scope.cancel, boundary).await?;

        // Later continuation steps observe this step's exchange.
        let mut next = instructions.thread;
        next.push(Message::assistant(response.output.clone()));
        *built = Some(next);

        Ok((response.output, response.usage))
    }

    async fn run_parallel(
        &self,
        plan: &ExecutionPlan,
        scope: &ExecScope,
        boundary: &Boundary,
    ) -> Result<TurnResponse> {
        let roles = plan
            .roles
            .as_ref()
            .ok_or_else(|| Error::schema(format!("plan '{}' has no roles", plan.name)))?;
        if roles.len() > self.config.limits.max_fanout {
            return Err(Error::FanoutExceeded {
                fanout: roles.len(),
                max_fanout: self.config.limits.max_fanout,
            });
        }

        let branches = roles.iter().map(|role| {
            let branch_scope = scope.child(boundary);
            async move {
                let branch_boundary = self.sink.open(
                    BoundaryType::Branch,
                    "execution.branch",
                    Some(boundary.id.as_str()),
                    Some(json!({"role": role})),
                );
                let tool_defs = self.allowed_tools(plan.tools.as_deref());
                let result: Result<(String, Usage)> = async {
                    let instructions =
                        self.compose_default(plan, &branch_scope, Some(role.as_str()), &tool_defs)?;
                    let request = self
                        .base_request(
                            instructions.thread.messages.clone(),
                            instructions.max_tokens,
                        )
                        .with_tools(tool_defs.clone());
                    let response = self
                        .call_llm(request, &branch_scope.cancel, &branch_boundary)
                        .await?;
                    Ok((response.output, response.usage))
                }
                .await;
                self.sink.close(
                    &branch_boundary,
                    Some(json!({"ok": result.is_ok()})),
                );
                result.map(|(output, usage)| (role.clone(), output, usage))
            }
        });

        let results = join_all(branches).await;

        let mut outputs = Vec::new();
        let mut turn = TurnResponse::new("");
        for result in results {
            let (role, output, usage) = result?;
            turn.add_usage(usage);
            outputs.push((role, output));
        }

        // Parallel aggregation defaults to labeled sections; `last` was
        // rejected by plan validation.
        let strategy = plan.result_strategy.unwrap_or(ResultStrategy::Label);
        turn.output = aggregate(&outputs, strategy);
        turn.metadata
            .insert("branches".to_string(), json!(outputs.len()));
        Ok(turn)
    }

    async fn run_task(
        &self,
        plan: &ExecutionPlan,
        scope: &ExecScope,
        boundary: &Boundary,
    ) -> Result<TurnResponse> {
        let tool_defs = self.allowed_tools(plan.tools.as_deref());
        let instructions = self.compose_default(plan, scope, None, &tool_defs)?;

        task::run_task(
            task::TaskDeps {
                llm: self.llm.as_ref(),
                tools: self.tools.as_ref(),
                approvals: &self.approvals,
                sink: &self.sink,
                model: &self.config.model,
                temperature: self.config.temperature,
            },
            plan,
            instructions,
            tool_defs,
            &scope.cancel,
            boundary,
        )
        .await
    }

    fn allowed_tools(&self, requested: Option<&[String]>) -> Vec<ToolDef> {
        requested
            .map(|names| filter_allowed(names, &self.available_tools))
            .unwrap_or_default()
    }

    fn compose_default(
        &self,
        plan: &ExecutionPlan,
        scope: &ExecScope,
        role_override: Option<&str>,
        tool_defs: &[ToolDef],
    ) -> Result<Instructions> {
        let composer = InstructionComposer::new(&self.config.profile);
        let mut request = ComposeRequest::new(plan, &scope.facts, &scope.input);
        request.role_override = role_override;
        request.tool_defs = tool_defs;
        composer.compose(&request)
    }

    fn base_request(&self, messages: Vec<Message>, max_tokens: u32) -> LlmRequest {
        let mut request = LlmRequest::new(self.config.model.clone(), messages, max_tokens);
        if let Some(temperature) = self.config.temperature {
            request = request.with_temperature(temperature);
        }
        request
    }

    /// One LLM exchange within its own boundary, with a single retry on
    /// provider errors.
    async fn call_llm(
        &self,
        request: LlmRequest,
        cancel: &CancelToken,
        parent: &Boundary,
    ) -> Result<LlmResponse> {
        let boundary = self.sink.open(
            BoundaryType::LlmExchange,
            "execution.llm",
            Some(parent.id.as_str()),
            Some(json!({"model": request.model, "max_tokens": request.max_tokens})),
        );

        let mut result = self.llm.complete(request.clone(), cancel).await;
        if let Err(Error::Provider { .. }) = &result {
            if !cancel.is_cancelled() {
                tracing::warn!("provider error, retrying once");
                result = self.llm.complete(request, cancel).await;
            }
        }

        match &result {
            Ok(response) => self.sink.close(
                &boundary,
                Some(json!({
                    "ok": true,
                    "finish_reason": response.finish_reason,
                    "tokens": response.usage.total(),
                })),
            ),
            Err(err) => self
                .sink
                .close(&boundary, Some(json!({"ok": false, "error": err.to_string()}))),
        }
        result
    }
}

/// Aggregate (role/step, output) pairs.
fn aggregate(outputs: &[(String, String)], strategy: ResultStrategy) -> String {
    match strategy {
        ResultStrategy::Last => outputs
            .last()
            .map(|(_, output)| output.clone())
            .unwrap_or_default(),
        ResultStrategy::Concat => outputs
            .iter()
            .map(|(_, output)| output.as_str())
            .collect::<Vec<_>>()
            .join("\n\n"),
        ResultStrategy::Label => outputs
            .iter()
            .map(|(label, output)| format!("## {}\n{}", label, output))
            .collect::<Vec<_>>()
            .join("\n\n"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::thread::Role;
    use crate::tools::NoTools;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Scripted client: pops queued responses, recording each request.
    pub(crate) struct ScriptedClient {
        responses: Mutex<Vec<LlmResponse>>,
        pub requests: Mutex<Vec<LlmRequest>>,
    }

    impl ScriptedClient {
        pub(crate) fn new(mut responses: Vec<LlmResponse>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                requests: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn complete(
            &self,
            request: LlmRequest,
            cancel: &CancelToken,
        ) -> Result<LlmResponse> {
            if cancel.is_cancelled() {
                return Err(Error::Interrupted);
            }
            self.requests.lock().unwrap().push(request);
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| Error::provider("scripted", "no scripted response left"))
        }

        fn provider(&self) -> &str {
            "scripted"
        }
    }

    fn executor(responses: Vec<LlmResponse>) -> (PlanExecutor, Arc<ScriptedClient>) {
        let client = Arc::new(ScriptedClient::new(responses));
        let (approvals, _rx) = ApprovalCoordinator::new();
        let executor = PlanExecutor::new(
            client.clone(),
            Arc::new(NoTools),
            approvals,
            EngineConfig::default(),
            EventSink::disabled(),
            HashMap::new(),
        );
        (executor, client)
    }

    fn scope() -> ExecScope {
        ExecScope::root(FactMap::default(), "hello", CancelToken::new())
    }

    #[tokio::test]
    async fn test_direct_single_call() {
        let (executor, client) = executor(vec![
            LlmResponse::text("hi there", "m").with_usage(10, 5)
        ]);
        let plan = ExecutionPlan::direct("p", "r").with_role("assistant");
        let response = executor.execute(&plan, scope()).await.unwrap();

        assert_eq!(response.output, "hi there");
        assert_eq!(response.metadata["strategy"], json!("direct"));
        assert_eq!(response.usage.total(), 15);
        assert_eq!(client.requests.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_sequential_last_aggregation() {
        let (executor, client) = executor(vec![
            LlmResponse::text("first", "m"),
            LlmResponse::text("second", "m"),
        ]);
        let plan = ExecutionPlan::new("chain", Strategy::Sequential, "r").with_sequence(vec![
            SequenceStep::direct("explorer"),
            SequenceStep::direct("analyst").continuing(),
        ]);
        let response = executor.execute(&plan, scope()).await.unwrap();

        assert_eq!(response.output, "second");
        assert_eq!(response.metadata["steps"], json!(2));

        // The continuation step reuses the built thread: its request must
        // contain the first step's answer.
        let requests = client.requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        let second_thread = &requests[1].thread;
        assert!(second_thread
            .iter()
            .any(|m| m.role == Role::Assistant && m.content == "first"));
        assert_eq!(second_thread.last().unwrap().content, "Continue.");
    }

    #[tokio::test]
    async fn test_sequential_children_limit() {
        let (executor, _) = executor(vec![]);
        let steps = (0..9).map(|_| SequenceStep::direct("a")).collect();
        let plan =
            ExecutionPlan::new("long", Strategy::Sequential, "r").with_sequence(steps);
        let err = executor.execute(&plan, scope()).await.unwrap_err();
        assert!(matches!(err, Error::ChildrenExceeded { .. }));
    }

    #[tokio::test]
    async fn test_parallel_label_aggregation() {
        let (executor, _) = executor(vec![
            LlmResponse::text("case for", "m"),
            LlmResponse::text("case against", "m"),
        ]);
        let plan = ExecutionPlan::new("par", Strategy::Parallel, "r")
            .with_roles(vec!["planner".to_string(), "critic".to_string()]);
        let response = executor.execute(&plan, scope()).await.unwrap();

        assert!(response.output.contains("## planner"));
        assert!(response.output.contains("## critic"));
        assert_eq!(response.metadata["branches"], json!(2));
    }

    #[tokio::test]
    async fn test_parallel_fanout_limit() {
        let (executor, _) = executor(vec![]);
        let plan = ExecutionPlan::new("wide", Strategy::Parallel, "r")
            .with_roles((0..5).map(|i| format!("r{}", i)).collect());
        let err = executor.execute(&plan, scope()).await.unwrap_err();
        assert!(matches!(err, Error::FanoutExceeded { fanout: 5, .. }));
    }

    #[tokio::test]
    async fn test_parallel_last_rejected() {
        let (executor, _) = executor(vec![]);
        let plan = ExecutionPlan::new("par", Strategy::Parallel, "r")
            .with_roles(vec!["a".to_string(), "b".to_string()])
            .with_result_strategy(ResultStrategy::Last);
        let err = executor.execute(&plan, scope()).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_provider_error_retries_once() {
        let client = Arc::new(ScriptedClient::new(vec![]));
        let (approvals, _rx) = ApprovalCoordinator::new();
        let executor = PlanExecutor::new(
            client.clone(),
            Arc::new(NoTools),
            approvals,
            EngineConfig::default(),
            EventSink::disabled(),
            HashMap::new(),
        );
        let plan = ExecutionPlan::direct("p", "r");
        let err = executor.execute(&plan, scope()).await.unwrap_err();
        assert!(matches!(err, Error::Provider { .. }));
        // Initial attempt plus one retry.
        assert_eq!(client.requests.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_scope_interrupts() {
        let (executor, _) = executor(vec![LlmResponse::text("x", "m")]);
        let cancel = CancelToken::new();
        cancel.cancel();
        let plan = ExecutionPlan::direct("p", "r");
        let err = executor
            .execute(
                &plan,
                ExecScope::root(FactMap::default(), "hi", cancel),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }

    #[test]
    fn test_aggregate_strategies() {
        let outputs = vec![
            ("a".to_string(), "one".to_string()),
            ("b".to_string(), "two".to_string()),
        ];
        assert_eq!(aggregate(&outputs, ResultStrategy::Last), "two");
        assert_eq!(aggregate(&outputs, ResultStrategy::Concat), "one\n\ntwo");
        let labeled = aggregate(&outputs, ResultStrategy::Label);
        assert!(labeled.starts_with("## a\none"));
        assert!(labeled.contains("## b\ntwo"));
    }
}
