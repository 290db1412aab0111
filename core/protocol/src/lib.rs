//! Wire types shared by the loopwatch stream client and reconciler.
//!
//! Two sources speak these shapes: the polled runs snapshot (persisted,
//! backend-assigned ids) and the live event stream (one named SSE event per
//! occurrence). The backend remains the authority on both; this crate only
//! describes them so every client decodes them the same way.

use std::collections::{BTreeMap, HashSet};

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Lowest id a client-generated (live) event can carry.
///
/// Persisted ids are small sequential integers; anything at or above this
/// floor was synthesized from the live stream and is not yet confirmed.
pub const SYNTHETIC_ID_FLOOR: u64 = 1_000_000_000_000_000;

pub fn is_synthetic_id(id: u64) -> bool {
    id >= SYNTHETIC_ID_FLOOR
}

// ═══════════════════════════════════════════════════════════════════════════════
// Event vocabulary
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Text,
    ToolCall,
    ToolResult,
    Error,
    Status,
    Init,
    Complete,
    SessionStart,
    Heartbeat,
    Connected,
    Disconnected,
    Info,
    Thinking,
    Usage,
    #[serde(other)]
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Text => "text",
            EventKind::ToolCall => "tool_call",
            EventKind::ToolResult => "tool_result",
            EventKind::Error => "error",
            EventKind::Status => "status",
            EventKind::Init => "init",
            EventKind::Complete => "complete",
            EventKind::SessionStart => "session_start",
            EventKind::Heartbeat => "heartbeat",
            EventKind::Connected => "connected",
            EventKind::Disconnected => "disconnected",
            EventKind::Info => "info",
            EventKind::Thinking => "thinking",
            EventKind::Usage => "usage",
            EventKind::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "text" => EventKind::Text,
            "tool_call" => EventKind::ToolCall,
            "tool_result" => EventKind::ToolResult,
            "error" => EventKind::Error,
            "status" => EventKind::Status,
            "init" => EventKind::Init,
            "complete" => EventKind::Complete,
            "session_start" => EventKind::SessionStart,
            "heartbeat" => EventKind::Heartbeat,
            "connected" => EventKind::Connected,
            "disconnected" => EventKind::Disconnected,
            "info" => EventKind::Info,
            "thinking" => EventKind::Thinking,
            "usage" => EventKind::Usage,
            _ => EventKind::Unknown,
        }
    }

    /// Transport and informational kinds. These never enter the run tree.
    pub fn is_control(&self) -> bool {
        matches!(
            self,
            EventKind::Init
                | EventKind::SessionStart
                | EventKind::Heartbeat
                | EventKind::Connected
                | EventKind::Disconnected
                | EventKind::Info
                | EventKind::Unknown
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    Paused,
    Completed,
    Aborted,
    Failed,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "paused" => Some(RunStatus::Paused),
            "completed" => Some(RunStatus::Completed),
            "aborted" => Some(RunStatus::Aborted),
            "failed" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, RunStatus::Running | RunStatus::Paused)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Aborted | RunStatus::Failed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Aborted,
    #[serde(other)]
    Unknown,
}

impl IterationStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            IterationStatus::Completed | IterationStatus::Failed | IterationStatus::Aborted
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Run tree
// ═══════════════════════════════════════════════════════════════════════════════

/// One thing that happened during one iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub id: u64,
    #[serde(default)]
    pub session_id: String,
    pub event_type: EventKind,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_use_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl SessionEvent {
    pub fn new(id: u64, session_id: impl Into<String>, event_type: EventKind) -> Self {
        Self {
            id,
            session_id: session_id.into(),
            event_type,
            timestamp: String::new(),
            content: None,
            tool_name: None,
            tool_input: None,
            tool_use_id: None,
            tool_result: None,
            success: None,
            error_message: None,
            metadata: None,
        }
    }

    pub fn is_live(&self) -> bool {
        is_synthetic_id(self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IterationData {
    #[serde(default)]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default)]
    pub status: IterationStatus,
    #[serde(default)]
    pub is_live: bool,
    #[serde(default)]
    pub events: Vec<SessionEvent>,
}

impl IterationData {
    pub fn event_ids(&self) -> HashSet<u64> {
        self.events.iter().map(|event| event.id).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunData {
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default)]
    pub loop_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    #[serde(default)]
    pub iteration_count: u32,
    #[serde(default)]
    pub event_count: u32,
    #[serde(default)]
    pub iterations: BTreeMap<u32, IterationData>,
}

impl RunData {
    pub fn total_events(&self) -> usize {
        self.iterations
            .values()
            .map(|iteration| iteration.events.len())
            .sum()
    }
}

/// Run id → run. The entire externally visible model.
pub type GroupedRuns = BTreeMap<String, RunData>;

/// Body of the polled snapshot endpoint.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunsSnapshot {
    #[serde(default)]
    pub runs: GroupedRuns,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Live stream
// ═══════════════════════════════════════════════════════════════════════════════

/// Identifiers a live payload may carry to pin it to a run/iteration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LiveRef {
    pub run_id: Option<String>,
    pub iteration: Option<u32>,
    pub session_id: Option<String>,
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamPayload {
    Status {
        status: Option<String>,
    },
    Text {
        content: String,
        role: Option<String>,
    },
    Thinking {
        content: String,
    },
    ToolCall {
        name: String,
        input: Value,
        id: Option<String>,
    },
    ToolResult {
        tool_use_id: Option<String>,
        result: Option<String>,
        success: Option<bool>,
    },
    Error {
        message: String,
    },
    Usage {
        usage: Value,
    },
    Complete {
        detail: Value,
    },
    Init,
    SessionStart,
    Heartbeat,
    Connected,
    Disconnected,
    Info {
        message: Option<String>,
    },
    Unknown {
        name: String,
    },
}

/// A parsed live message: what happened plus where it claims to belong.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub live: LiveRef,
    pub payload: StreamPayload,
}

impl StreamEvent {
    pub fn kind(&self) -> EventKind {
        match &self.payload {
            StreamPayload::Status { .. } => EventKind::Status,
            StreamPayload::Text { .. } => EventKind::Text,
            StreamPayload::Thinking { .. } => EventKind::Thinking,
            StreamPayload::ToolCall { .. } => EventKind::ToolCall,
            StreamPayload::ToolResult { .. } => EventKind::ToolResult,
            StreamPayload::Error { .. } => EventKind::Error,
            StreamPayload::Usage { .. } => EventKind::Usage,
            StreamPayload::Complete { .. } => EventKind::Complete,
            StreamPayload::Init => EventKind::Init,
            StreamPayload::SessionStart => EventKind::SessionStart,
            StreamPayload::Heartbeat => EventKind::Heartbeat,
            StreamPayload::Connected => EventKind::Connected,
            StreamPayload::Disconnected => EventKind::Disconnected,
            StreamPayload::Info { .. } => EventKind::Info,
            StreamPayload::Unknown { .. } => EventKind::Unknown,
        }
    }

    /// The server's "no active session" marker arrives as an `info` event.
    pub fn is_idle_marker(&self) -> bool {
        matches!(self.payload, StreamPayload::Info { .. })
    }
}

#[derive(Deserialize)]
struct StatusWire {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Deserialize)]
struct TextWire {
    #[serde(default)]
    content: String,
    #[serde(default)]
    role: Option<String>,
}

#[derive(Deserialize)]
struct ToolCallWire {
    #[serde(alias = "tool_name")]
    name: String,
    #[serde(default)]
    input: Value,
    #[serde(default)]
    id: Option<String>,
}

#[derive(Deserialize)]
struct ToolResultWire {
    #[serde(default)]
    tool_use_id: Option<String>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    preview: Option<Value>,
    #[serde(default)]
    success: Option<bool>,
}

#[derive(Deserialize)]
struct ErrorWire {
    #[serde(default, alias = "error")]
    message: String,
}

#[derive(Deserialize)]
struct InfoWire {
    #[serde(default)]
    message: Option<String>,
}

/// Parses one SSE frame into a typed event.
///
/// `name` is the SSE `event:` field. For the default `message` name the
/// payload's `type` field names the event instead. Returns `None` when the
/// data is not valid JSON or does not fit the named event's shape; callers
/// drop those silently.
pub fn parse_stream_event(name: &str, data: &str) -> Option<StreamEvent> {
    let value: Value = if data.trim().is_empty() {
        Value::Object(Map::new())
    } else {
        serde_json::from_str(data).ok()?
    };

    let name = if name.is_empty() || name == "message" {
        value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("message")
            .to_string()
    } else {
        name.to_string()
    };

    let kind = EventKind::parse(&name);
    if !kind.is_control() && !value.is_object() {
        return None;
    }

    let payload = match kind {
        EventKind::Status => {
            let wire: StatusWire = serde_json::from_value(value.clone()).ok()?;
            StreamPayload::Status {
                status: wire.status,
            }
        }
        EventKind::Text => {
            let wire: TextWire = serde_json::from_value(value.clone()).ok()?;
            StreamPayload::Text {
                content: wire.content,
                role: wire.role,
            }
        }
        EventKind::Thinking => {
            let wire: TextWire = serde_json::from_value(value.clone()).ok()?;
            StreamPayload::Thinking {
                content: wire.content,
            }
        }
        EventKind::ToolCall => {
            let wire: ToolCallWire = serde_json::from_value(value.clone()).ok()?;
            StreamPayload::ToolCall {
                name: wire.name,
                input: wire.input,
                id: wire.id,
            }
        }
        EventKind::ToolResult => {
            let wire: ToolResultWire = serde_json::from_value(value.clone()).ok()?;
            StreamPayload::ToolResult {
                tool_use_id: wire.tool_use_id,
                result: wire.result.or(wire.preview).map(render_result),
                success: wire.success,
            }
        }
        EventKind::Error => {
            let wire: ErrorWire = serde_json::from_value(value.clone()).ok()?;
            StreamPayload::Error {
                message: wire.message,
            }
        }
        EventKind::Usage => StreamPayload::Usage {
            usage: value.get("usage").cloned().unwrap_or_else(|| value.clone()),
        },
        EventKind::Complete => StreamPayload::Complete {
            detail: value.clone(),
        },
        EventKind::Init => StreamPayload::Init,
        EventKind::SessionStart => StreamPayload::SessionStart,
        EventKind::Heartbeat => StreamPayload::Heartbeat,
        EventKind::Connected => StreamPayload::Connected,
        EventKind::Disconnected => StreamPayload::Disconnected,
        EventKind::Info => {
            let message = serde_json::from_value::<InfoWire>(value.clone())
                .ok()
                .and_then(|wire| wire.message);
            StreamPayload::Info { message }
        }
        EventKind::Unknown => StreamPayload::Unknown { name },
    };

    Some(StreamEvent {
        live: live_ref(&value),
        payload,
    })
}

fn live_ref(value: &Value) -> LiveRef {
    let run_id = match value.get("run_id") {
        Some(Value::String(id)) if !id.trim().is_empty() => Some(id.clone()),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    };
    let iteration = match value.get("iteration") {
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    };
    let session_id = value
        .get("session_id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .map(str::to_string);
    let timestamp = value
        .get("timestamp")
        .and_then(Value::as_str)
        .filter(|ts| DateTime::parse_from_rfc3339(ts).is_ok())
        .map(str::to_string);

    LiveRef {
        run_id,
        iteration,
        session_id,
        timestamp,
    }
}

fn render_result(value: Value) -> String {
    match value {
        Value::String(text) => text,
        other => other.to_string(),
    }
}
