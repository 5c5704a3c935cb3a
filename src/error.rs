//! Error types for turnwise-core.

use thiserror::Error;

use crate::fact::Fact;

/// Result type alias using turnwise-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Stable, user-facing error codes carried on fallback responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E_DEPTH")]
    Depth,
    #[serde(rename = "E_FANOUT")]
    Fanout,
    #[serde(rename = "E_CHILDREN")]
    Children,
    #[serde(rename = "E_PROVIDER")]
    Provider,
    #[serde(rename = "E_TIMEOUT")]
    Timeout,
    #[serde(rename = "E_ABORT")]
    Abort,
    #[serde(rename = "E_SCHEMA")]
    Schema,
    #[serde(rename = "E_RULE_LOOP")]
    RuleLoop,
    #[serde(rename = "E_UNKNOWN")]
    Unknown,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Depth => "E_DEPTH",
            Self::Fanout => "E_FANOUT",
            Self::Children => "E_CHILDREN",
            Self::Provider => "E_PROVIDER",
            Self::Timeout => "E_TIMEOUT",
            Self::Abort => "E_ABORT",
            Self::Schema => "E_SCHEMA",
            Self::RuleLoop => "E_RULE_LOOP",
            Self::Unknown => "E_UNKNOWN",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Errors that can occur while orchestrating a turn.
#[derive(Error, Debug)]
pub enum Error {
    /// LLM adapter failure (HTTP, auth, malformed body)
    #[error("provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    /// Recursion depth exceeded during plan execution
    #[error("execution depth {depth} exceeds limit {max_depth}")]
    DepthExceeded { depth: u32, max_depth: u32 },

    /// Parallel plan fanout exceeded the configured limit
    #[error("parallel fanout {fanout} exceeds limit {max_fanout}")]
    FanoutExceeded { fanout: usize, max_fanout: usize },

    /// Sequential plan step count exceeded the configured limit
    #[error("sequential steps {children} exceed limit {max_children}")]
    ChildrenExceeded { children: usize, max_children: usize },

    /// Task wall-clock exhaustion
    #[error("task timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// External cancellation
    #[error("operation interrupted")]
    Interrupted,

    /// Malformed classifier output or tool arguments
    #[error("schema violation: {0}")]
    Schema(String),

    /// Rules engine hit its cycle cap. Carries whatever facts accrued so
    /// the caller can still inspect partial derivations.
    #[error("rule evaluation exceeded {max_cycles} cycles")]
    RuleLoop { max_cycles: u32, facts: Vec<Fact> },

    /// Module authoring bug surfaced by a validation rule
    #[error("rule validation failed: {0}")]
    Validation(String),

    /// Tool invocation failure
    #[error("tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a provider error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a tool error.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Create a schema violation error.
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema(message.into())
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// The user-facing code this error maps to on a fallback response.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Provider { .. } => ErrorCode::Provider,
            Self::DepthExceeded { .. } => ErrorCode::Depth,
            Self::FanoutExceeded { .. } => ErrorCode::Fanout,
            Self::ChildrenExceeded { .. } => ErrorCode::Children,
            Self::Timeout { .. } => ErrorCode::Timeout,
            Self::Interrupted => ErrorCode::Abort,
            Self::Schema(_) => ErrorCode::Schema,
            Self::RuleLoop { .. } => ErrorCode::RuleLoop,
            Self::Tool { .. } => ErrorCode::Schema,
            Self::Validation(_)
            | Self::Serialization(_)
            | Self::Config(_)
            | Self::Internal(_) => ErrorCode::Unknown,
        }
    }
}
