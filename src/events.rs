//! Boundary-structured execution events.
//!
//! Every stage of a turn emits events that external consumers can render
//! or replay. Events come in start/end pairs delimiting a boundary, plus
//! point events inside a boundary. Boundary ids chain through
//! `parent_boundary_id`, so the stream reconstructs as a tree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Whether an event opens a boundary, closes one, or sits inside one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventRole {
    BoundaryStart,
    BoundaryEnd,
    Point,
}

/// The structured region an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BoundaryType {
    Session,
    Execution,
    Cycle,
    Step,
    Branch,
    LlmExchange,
    Pipeline,
}

impl BoundaryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Execution => "execution",
            Self::Cycle => "cycle",
            Self::Step => "step",
            Self::Branch => "branch",
            Self::LlmExchange => "llm_exchange",
            Self::Pipeline => "pipeline",
        }
    }
}

/// One event in the execution stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    /// Dotted event name, e.g. "execution.tool.approval-requested"
    pub event: String,
    pub event_role: EventRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boundary_type: Option<BoundaryType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boundary_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_boundary_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    pub time: DateTime<Utc>,
}

/// An open boundary handle. Closing emits the matching end event.
#[derive(Debug, Clone)]
pub struct Boundary {
    pub id: String,
    pub boundary_type: BoundaryType,
    pub parent_id: Option<String>,
    event: String,
}

impl Boundary {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// Cloneable emitter for execution events.
///
/// A disabled sink drops everything, so orchestration code can emit
/// unconditionally.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<ExecutionEvent>>,
}

impl EventSink {
    /// Create a sink and the receiving half for external consumers.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ExecutionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops all events.
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    fn emit(&self, event: ExecutionEvent) {
        if let Some(tx) = &self.tx {
            // A closed receiver is not an error; emission is best-effort.
            let _ = tx.send(event);
        }
    }

    /// Open a boundary, emitting its start event.
    pub fn open(
        &self,
        boundary_type: BoundaryType,
        event: impl Into<String>,
        parent: Option<&str>,
        data: Option<Value>,
    ) -> Boundary {
        let boundary = Boundary {
            id: Uuid::new_v4().to_string(),
            boundary_type,
            parent_id: parent.map(|p| p.to_string()),
            event: event.into(),
        };
        self.emit(ExecutionEvent {
            event: boundary.event.clone(),
            event_role: EventRole::BoundaryStart,
            boundary_type: Some(boundary_type),
            boundary_id: Some(boundary.id.clone()),
            parent_boundary_id: boundary.parent_id.clone(),
            data,
            time: Utc::now(),
        });
        boundary
    }

    /// Close a boundary, emitting its end event.
    pub fn close(&self, boundary: &Boundary, data: Option<Value>) {
        self.emit(ExecutionEvent {
            event: boundary.event.clone(),
            event_role: EventRole::BoundaryEnd,
            boundary_type: Some(boundary.boundary_type),
            boundary_id: Some(boundary.id.clone()),
            parent_boundary_id: boundary.parent_id.clone(),
            data,
            time: Utc::now(),
        });
    }

    /// Emit a point event inside a boundary.
    pub fn point(&self, event: impl Into<String>, within: Option<&Boundary>, data: Option<Value>) {
        self.emit(ExecutionEvent {
            event: event.into(),
            event_role: EventRole::Point,
            boundary_type: within.map(|b| b.boundary_type),
            boundary_id: within.map(|b| b.id.clone()),
            parent_boundary_id: within.and_then(|b| b.parent_id.clone()),
            data,
            time: Utc::now(),
        });
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_boundary_pairing() {
        let (sink, mut rx) = EventSink::channel();

        let outer = sink.open(BoundaryType::Execution, "execution.plan", None, None);
        let inner = sink.open(
            BoundaryType::LlmExchange,
            "execution.llm",
            Some(outer.id()),
            Some(json!({"model": "m"})),
        );
        sink.point("execution.llm.usage", Some(&inner), Some(json!({"tokens": 42})));
        sink.close(&inner, None);
        sink.close(&outer, None);

        let start = rx.try_recv().unwrap();
        assert_eq!(start.event_role, EventRole::BoundaryStart);
        assert_eq!(start.boundary_type, Some(BoundaryType::Execution));
        assert!(start.parent_boundary_id.is_none());

        let inner_start = rx.try_recv().unwrap();
        assert_eq!(inner_start.parent_boundary_id.as_deref(), Some(outer.id()));

        let point = rx.try_recv().unwrap();
        assert_eq!(point.event_role, EventRole::Point);
        assert_eq!(point.boundary_id.as_deref(), Some(inner.id()));

        let inner_end = rx.try_recv().unwrap();
        assert_eq!(inner_end.event_role, EventRole::BoundaryEnd);
        assert_eq!(inner_end.boundary_id, inner_start.boundary_id);

        let outer_end = rx.try_recv().unwrap();
        assert_eq!(outer_end.boundary_id.as_deref(), Some(outer.id()));
    }

    #[test]
    fn test_disabled_sink_drops() {
        let sink = EventSink::disabled();
        let b = sink.open(BoundaryType::Session, "session", None, None);
        sink.point("noop", Some(&b), None);
        sink.close(&b, None);
        // No receiver to assert on; the calls simply must not panic.
    }

    #[test]
    fn test_event_serialization() {
        let event = ExecutionEvent {
            event: "execution.tool.approval-requested".into(),
            event_role: EventRole::Point,
            boundary_type: Some(BoundaryType::Cycle),
            boundary_id: Some("b1".into()),
            parent_boundary_id: None,
            data: Some(json!({"tool": "write_file"})),
            time: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_role"], "point");
        assert_eq!(json["boundary_type"], "cycle");
        assert!(json.get("parent_boundary_id").is_none());
    }
}
