//! The task loop: multi-cycle tool use bounded by a resolution envelope.
//!
//! Each cycle checks the envelope, calls the LLM with the tool schemas,
//! routes any tool calls through the approval coordinator, and watches
//! plain-text responses for the completion affirmation. Cycle and
//! tool-call budgets are hard caps; the timeout is soft and forces a
//! synthesis pass at the next cycle edge.

use std::time::Instant;

use regex::Regex;
use serde_json::json;
use std::sync::LazyLock;

use crate::approval::ApprovalCoordinator;
use crate::cancel::CancelToken;
use crate::compose::Instructions;
use crate::error::{Error, Result};
use crate::events::{Boundary, BoundaryType, EventSink};
use crate::fact::ExecutionPlan;
use crate::llm::{LlmClient, LlmRequest, Usage};
use crate::thread::Message;
use crate::tools::{ToolDef, ToolRegistry};

use super::TurnResponse;

/// States of one task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Starting,
    Cycling,
    AwaitingApproval,
    Synthesizing,
    Complete,
    Interrupted,
    Failed,
    ForcedComplete,
}

static COMPLETION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bI have completed (my|the) task\b").expect("invalid regex")
});

const CONTINUE_NUDGE: &str = "Continue.";
const SYNTHESIS_PROMPT: &str = "What did you discover?";

fn transition(sink: &EventSink, parent: &Boundary, state: &mut TaskState, next: TaskState) {
    if *state != next {
        *state = next;
        sink.point(
            "execution.task.state",
            Some(parent),
            Some(json!({"state": next})),
        );
    }
}

pub(super) struct TaskDeps<'a> {
    pub llm: &'a dyn LlmClient,
    pub tools: &'a dyn ToolRegistry,
    pub approvals: &'a ApprovalCoordinator,
    pub sink: &'a EventSink,
    pub model: &'a str,
    pub temperature: Option<f64>,
}

impl TaskDeps<'_> {
    fn request(&self, messages: Vec<Message>, max_tokens: u32) -> LlmRequest {
        let mut request = LlmRequest::new(self.model.to_string(), messages, max_tokens);
        if let Some(temperature) = self.temperature {
            request = request.with_temperature(temperature);
        }
        request
    }
}

pub(super) async fn run_task(
    deps: TaskDeps<'_>,
    plan: &ExecutionPlan,
    instructions: Instructions,
    tool_defs: Vec<ToolDef>,
    cancel: &CancelToken,
    parent: &Boundary,
) -> Result<TurnResponse> {
    let envelope = plan.resolution.unwrap_or_default();
    let started = Instant::now();

    let mut thread = instructions.thread;
    let mut state = TaskState::Starting;
    let mut cycles: u32 = 0;
    let mut tool_calls_used: u32 = 0;
    let mut tokens_used: u64 = 0;
    let mut usage = Usage::default();
    let mut completion_seen = false;
    let mut last_text = String::new();

    loop {
        if cancel.is_cancelled() {
            deps.sink.point(
                "execution.task.interrupted",
                Some(parent),
                Some(json!({"cycles": cycles})),
            );
            return Err(Error::Interrupted);
        }

        // Envelope checks happen at cycle edges only.
        let timed_out = started.elapsed().as_millis() as u64 >= envelope.timeout_ms;
        let exhausted = cycles >= envelope.max_cycles
            || tokens_used >= envelope.max_tokens
            || tool_calls_used >= envelope.max_tool_calls
            || timed_out;
        if exhausted {
            if !completion_seen {
                tracing::info!(
                    plan = %plan.name,
                    cycles,
                    tokens_used,
                    tool_calls_used,
                    timed_out,
                    "task envelope exhausted, forcing synthesis"
                );
            }
            break;
        }
        if completion_seen {
            break;
        }

        cycles += 1;
        transition(deps.sink, parent, &mut state, TaskState::Cycling);
        let cycle_boundary = deps.sink.open(
            BoundaryType::Cycle,
            "execution.task.cycle",
            Some(parent.id.as_str()),
            Some(json!({"cycle": cycles})),
        );

        let request = deps
            .request(thread.messages.clone(), instructions.max_tokens)
            .with_tools(tool_defs.clone());
        let response = match deps.llm.complete(request, cancel).await {
            Ok(response) => response,
            Err(err) => {
                deps.sink
                    .close(&cycle_boundary, Some(json!({"ok": false})));
                return Err(err);
            }
        };
        tokens_used += response.usage.total();
        usage.prompt += response.usage.prompt;
        usage.completion += response.usage.completion;

        if let Some(calls) = response.tool_calls.as_ref().filter(|c| !c.is_empty()) {
            thread.push(
                Message::assistant(response.output.clone()).with_tool_calls(calls.clone()),
            );

            for call in calls {
                if cancel.is_cancelled() {
                    deps.sink
                        .close(&cycle_boundary, Some(json!({"ok": false})));
                    return Err(Error::Interrupted);
                }
                if tool_calls_used >= envelope.max_tool_calls {
                    thread.push(Message::tool(
                        call.name.clone(),
                        "Tool call budget exhausted; no further tools will run.",
                    ));
                    continue;
                }

                transition(deps.sink, parent, &mut state, TaskState::AwaitingApproval);
                let approval_id = uuid::Uuid::new_v4().to_string();
                deps.sink.point(
                    "execution.tool.approval-requested",
                    Some(&cycle_boundary),
                    Some(json!({
                        "approval_id": approval_id,
                        "tool": call.name,
                        "args": call.arguments,
                    })),
                );
                let (approval, decision) = deps
                    .approvals
                    .request_approval_with_id(
                        approval_id,
                        call.name.clone(),
                        call.arguments.clone(),
                        cancel,
                    )
                    .await?;
                deps.sink.point(
                    "execution.tool.approval-resolved",
                    Some(&cycle_boundary),
                    Some(json!({
                        "approval_id": approval.approval_id,
                        "approved": decision.approved(),
                    })),
                );

                if decision.approved() {
                    tool_calls_used += 1;
                    let body = match deps.tools.invoke(&call.name, &call.arguments).await {
                        Ok(body) => body,
                        Err(err) => {
                            tracing::warn!(tool = %call.name, error = %err, "tool invocation failed");
                            format!("Tool error: {}", err)
                        }
                    };
                    thread.push(Message::tool(call.name.clone(), body));
                } else {
                    thread.push(Message::tool(
                        call.name.clone(),
                        "Tool call denied by user.",
                    ));
                }
                transition(deps.sink, parent, &mut state, TaskState::Cycling);
            }
            deps.sink
                .close(&cycle_boundary, Some(json!({"ok": true, "tool_calls": calls.len()})));
            continue;
        }

        // No tool calls: candidate completion.
        last_text = response.output;
        if COMPLETION.is_match(&last_text) {
            completion_seen = true;
            thread.push(Message::assistant(last_text.clone()));
            deps.sink
                .close(&cycle_boundary, Some(json!({"ok": true, "complete": true})));
        } else {
            thread.push(Message::assistant(last_text.clone()));
            thread.push(Message::user(CONTINUE_NUDGE));
            deps.sink
                .close(&cycle_boundary, Some(json!({"ok": true, "complete": false})));
        }
    }

    // Synthesis: one final narrative call without tools.
    transition(deps.sink, parent, &mut state, TaskState::Synthesizing);
    thread.push(Message::user(SYNTHESIS_PROMPT).with_tag("task-synthesis"));
    let synthesis = deps
        .llm
        .complete(
            deps.request(thread.messages.clone(), instructions.max_tokens),
            cancel,
        )
        .await?;
    usage.prompt += synthesis.usage.prompt;
    usage.completion += synthesis.usage.completion;

    let final_state = if completion_seen {
        TaskState::Complete
    } else {
        TaskState::ForcedComplete
    };
    transition(deps.sink, parent, &mut state, final_state);

    let mut turn = TurnResponse::new(synthesis.output);
    turn.usage = usage;
    turn.metadata.insert("cycles".to_string(), json!(cycles));
    turn.metadata
        .insert("tool_calls".to_string(), json!(tool_calls_used));
    turn.metadata
        .insert("task_state".to_string(), json!(final_state));
    if final_state == TaskState::ForcedComplete {
        turn.metadata.insert("forced".to_string(), json!(true));
    }
    Ok(turn)
}

#[cfg(test)]
mod tests {
    use super::super::tests::ScriptedClient;
    use super::*;
    use crate::approval::{auto_resolver, ApprovalDecision};
    use crate::compose::{ComposeRequest, InstructionComposer};
    use crate::config::Profile;
    use crate::events::EventSink;
    use crate::fact::{FactMap, ResolutionEnvelope, Strategy};
    use crate::llm::LlmResponse;
    use crate::thread::{Role, ToolCallRequest};
    use crate::tools::StaticToolRegistry;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn task_plan(max_cycles: u32, max_tool_calls: u32) -> ExecutionPlan {
        ExecutionPlan::new("execute-task", Strategy::Task, "test")
            .with_role("executor")
            .with_tools(vec!["write_file".to_string()])
            .with_resolution(ResolutionEnvelope {
                max_cycles,
                max_tool_calls,
                ..ResolutionEnvelope::default()
            })
    }

    fn compose(plan: &ExecutionPlan, tools: &[ToolDef]) -> Instructions {
        let profile = Profile::default();
        let composer = InstructionComposer::new(&profile);
        let facts = FactMap::default();
        let mut request = ComposeRequest::new(plan, &facts, "Create a file x with content y.");
        request.tool_defs = tools;
        composer.compose(&request).unwrap()
    }

    fn write_tool(calls: Arc<Mutex<Vec<serde_json::Value>>>) -> StaticToolRegistry {
        StaticToolRegistry::new().register(
            ToolDef::new("write_file", "write a file", json!({"type": "object"})),
            move |args| {
                calls.lock().unwrap().push(args.clone());
                Ok("written".to_string())
            },
        )
    }

    fn tool_call_response(name: &str) -> LlmResponse {
        LlmResponse::text("", "m")
            .with_tool_calls(vec![ToolCallRequest::new(
                "c1",
                name,
                json!({"path": "x", "content": "y"}),
            )])
            .with_usage(10, 5)
    }

    async fn run(
        client: &ScriptedClient,
        registry: &StaticToolRegistry,
        plan: &ExecutionPlan,
        decision: ApprovalDecision,
        cancel: &CancelToken,
    ) -> Result<TurnResponse> {
        let tools = vec![ToolDef::new(
            "write_file",
            "write a file",
            json!({"type": "object"}),
        )];
        let instructions = compose(plan, &tools);
        let (approvals, requests) = ApprovalCoordinator::new();
        let resolver = auto_resolver(approvals.clone(), requests, decision);

        let sink = EventSink::disabled();
        let parent = sink.open(BoundaryType::Execution, "execution.plan", None, None);
        let result = run_task(
            TaskDeps {
                llm: client,
                tools: registry,
                approvals: &approvals,
                sink: &sink,
                model: "m",
                temperature: None,
            },
            plan,
            instructions,
            tools,
            cancel,
            &parent,
        )
        .await;
        approvals.shutdown();
        resolver.abort();
        result
    }

    #[tokio::test]
    async fn test_tool_call_approved_and_executed() {
        let invocations = Arc::new(Mutex::new(Vec::new()));
        let registry = write_tool(invocations.clone());
        let client = ScriptedClient::new(vec![
            tool_call_response("write_file"),
            LlmResponse::text("I have completed my task.", "m").with_usage(8, 4),
            LlmResponse::text("I created file x containing y.", "m").with_usage(6, 3),
        ]);
        let plan = task_plan(5, 5);

        let response = run(
            &client,
            &registry,
            &plan,
            ApprovalDecision::Approve,
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.output, "I created file x containing y.");
        assert_eq!(response.metadata["task_state"], json!("complete"));
        assert_eq!(response.metadata["tool_calls"], json!(1));
        assert_eq!(invocations.lock().unwrap().len(), 1);

        // The tool result landed in the thread of a later request.
        let requests = client.requests.lock().unwrap();
        assert!(requests.iter().any(|r| r
            .thread
            .iter()
            .any(|m| m.role == Role::Tool && m.content == "written")));
    }

    #[tokio::test]
    async fn test_denied_tool_call_has_no_side_effect() {
        let invocations = Arc::new(Mutex::new(Vec::new()));
        let registry = write_tool(invocations.clone());
        let client = ScriptedClient::new(vec![
            tool_call_response("write_file"),
            LlmResponse::text("I have completed my task.", "m"),
            LlmResponse::text("The write was denied, nothing changed.", "m"),
        ]);
        let plan = task_plan(5, 5);

        let response = run(
            &client,
            &registry,
            &plan,
            ApprovalDecision::Deny,
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert!(invocations.lock().unwrap().is_empty());
        assert_eq!(response.metadata["tool_calls"], json!(0));

        let requests = client.requests.lock().unwrap();
        assert!(requests.iter().any(|r| r
            .thread
            .iter()
            .any(|m| m.role == Role::Tool && m.content.contains("denied"))));
    }

    #[tokio::test]
    async fn test_cycle_cap_forces_synthesis() {
        let registry = write_tool(Arc::new(Mutex::new(Vec::new())));
        // Never affirms completion; the envelope forces synthesis.
        let client = ScriptedClient::new(vec![
            LlmResponse::text("still working", "m").with_usage(5, 5),
            LlmResponse::text("still working", "m").with_usage(5, 5),
            LlmResponse::text("ran out of cycles, here is what I found", "m"),
        ]);
        let plan = task_plan(2, 5);

        let response = run(
            &client,
            &registry,
            &plan,
            ApprovalDecision::Approve,
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.metadata["cycles"], json!(2));
        assert_eq!(response.metadata["task_state"], json!("forced_complete"));
        assert_eq!(response.metadata["forced"], json!(true));
    }

    #[tokio::test]
    async fn test_timeout_forces_synthesis_not_failure() {
        let registry = write_tool(Arc::new(Mutex::new(Vec::new())));
        let client = ScriptedClient::new(vec![LlmResponse::text("late synthesis", "m")]);
        let mut plan = task_plan(10, 5);
        plan.resolution = Some(ResolutionEnvelope {
            timeout_ms: 0,
            ..ResolutionEnvelope::default()
        });

        let response = run(
            &client,
            &registry,
            &plan,
            ApprovalDecision::Approve,
            &CancelToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(response.output, "late synthesis");
        assert_eq!(response.metadata["task_state"], json!("forced_complete"));
        assert_eq!(response.metadata["cycles"], json!(0));
    }

    #[tokio::test]
    async fn test_interrupt_at_cycle_boundary() {
        let registry = write_tool(Arc::new(Mutex::new(Vec::new())));
        let client = ScriptedClient::new(vec![]);
        let plan = task_plan(5, 5);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err = run(&client, &registry, &plan, ApprovalDecision::Approve, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }

    #[tokio::test]
    async fn test_completion_pattern() {
        assert!(COMPLETION.is_match("I have completed my task."));
        assert!(COMPLETION.is_match("Done: i have completed the task as requested"));
        assert!(!COMPLETION.is_match("I am still working on the task"));
    }

    #[tokio::test]
    async fn test_continue_nudge_between_cycles() {
        let registry = write_tool(Arc::new(Mutex::new(Vec::new())));
        let client = ScriptedClient::new(vec![
            LlmResponse::text("partial progress", "m"),
            LlmResponse::text("I have completed my task.", "m"),
            LlmResponse::text("summary", "m"),
        ]);
        let plan = task_plan(5, 5);

        run(
            &client,
            &registry,
            &plan,
            ApprovalDecision::Approve,
            &CancelToken::new(),
        )
        .await
        .unwrap();

        let requests = client.requests.lock().unwrap();
        let second = &requests[1];
        assert_eq!(second.thread.last().unwrap().content, CONTINUE_NUDGE);

        // The synthesis request carries the dedicated prompt and no tools.
        let synthesis = requests.last().unwrap();
        assert!(synthesis
            .thread
            .iter()
            .any(|m| m.content == SYNTHESIS_PROMPT));
        assert!(synthesis.tools.is_none());
    }
}
