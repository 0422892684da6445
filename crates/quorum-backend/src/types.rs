use serde::{Deserialize, Serialize};

// ─── Message types ────────────────────────────────────────────────────────────

/// A single message in a turn sent to a backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
    /// Whether invoking this tool causes an irreversible external action.
    /// Backends that support the planning-mode filter drop irreversible
    /// tools from the request while planning mode is enabled.
    #[serde(default)]
    pub irreversible: bool,
}

/// One turn request sent to a backend.
#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
}

// ─── Stream events ────────────────────────────────────────────────────────────

/// A single streamed event from a backend.
///
/// Tool calls are emitted *complete*: drivers that receive argument deltas
/// accumulate them internally and emit one `ToolCall` per finished call, so
/// consumers never reassemble fragments.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A text delta streamed from the model
    TextDelta(String),
    /// A reasoning/thinking delta from the model
    ReasoningDelta(String),
    /// The model invoked a tool.  For tools the backend executes itself the
    /// matching `ToolResult` follows on the same stream.
    ToolCall {
        id: String,
        name: String,
        /// Complete JSON argument object
        arguments: String,
    },
    /// Result of a tool the backend executed itself
    ToolResult { id: String, content: String },
    /// The stream finished normally
    Done,
}

/// Capabilities a backend can be queried for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    WebSearch,
    CodeExec,
    ToolCalls,
    /// The backend honours `set_planning_mode` by suppressing irreversible
    /// tool calls.
    PlanningFilter,
    Snapshot,
}

// ─── Snapshots ────────────────────────────────────────────────────────────────

/// Opaque reference to a backend-owned workspace state.
///
/// The engine only attaches these to published answers and hands them back
/// for `restore`; the content is defined entirely by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRef(pub String);

impl SnapshotRef {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

impl std::fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(Message::system("s").role, Role::System);
        assert_eq!(Message::user("u").role, Role::User);
        assert_eq!(Message::assistant("a").role, Role::Assistant);
    }

    #[test]
    fn tool_schema_irreversible_defaults_false() {
        let json = r#"{"name":"t","description":"d","parameters":{"type":"object"}}"#;
        let t: ToolSchema = serde_json::from_str(json).unwrap();
        assert!(!t.irreversible);
    }

    #[test]
    fn tool_schema_round_trips_irreversible_flag() {
        let t = ToolSchema {
            name: "deploy".into(),
            description: "ship it".into(),
            parameters: serde_json::json!({ "type": "object" }),
            irreversible: true,
        };
        let json = serde_json::to_string(&t).unwrap();
        let back: ToolSchema = serde_json::from_str(&json).unwrap();
        assert!(back.irreversible);
    }

    #[test]
    fn snapshot_ref_displays_token() {
        let s = SnapshotRef::new("agent-a/v3");
        assert_eq!(s.to_string(), "agent-a/v3");
    }
}
