//! Envelope protocol: the message shape and routing-key grammar shared by
//! every component that touches the bus.
//!
//! Payloads are a tagged union keyed by `(kind, command|event name)` so the
//! worker dispatch switch is exhaustive at compile time. Every response
//! carries the `(user_id, request_id)` pair copied from the command that
//! caused it; correlation rests entirely on that pair, never on queue
//! isolation or arrival order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message kind, also the last token of a routing key.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Command,
    Event,
    Response,
}

impl EnvelopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Event => "event",
            Self::Response => "response",
        }
    }
}

/// Publish priority, mapped onto the broker's small integer scale.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

impl Priority {
    /// Broker priority value (low=1, medium=5, high=9).
    pub fn level(self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Medium => 5,
            Self::High => 9,
        }
    }
}

/// Commands a worker instance consumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "command", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandPayload {
    /// Run the opaque task capability over `message`.
    ProcessMessage {
        user_id: String,
        request_id: String,
        message: String,
    },
    /// Persist the worker's state blob before a freeze.
    SaveState {
        user_id: String,
        request_id: String,
    },
    /// Restore the worker's state blob after an unfreeze.
    LoadState {
        user_id: String,
        request_id: String,
    },
}

/// Events a worker instance consumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventPayload {
    /// Liveness probe; workers answer immediately with [`ResponseOutcome::Healthy`].
    HealthCheck {
        user_id: String,
        request_id: String,
    },
}

/// One chunk of structured output from the task capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskChunk {
    pub kind: TaskChunkKind,
    pub content: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskChunkKind {
    Agent,
    Tools,
}

/// What a worker reports back for one command or event.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResponseOutcome {
    /// PROCESS_MESSAGE succeeded.
    TaskOutput { chunks: Vec<TaskChunk> },
    /// SAVE_STATE succeeded.
    StateSaved,
    /// LOAD_STATE succeeded.
    StateLoaded,
    /// HEALTH_CHECK answer.
    Healthy,
    /// The command/event failed inside the worker; never escapes as an exception.
    Error { error: String },
}

/// Response payload. Structurally guarantees the correlation invariant:
/// there is no way to build a response without the originating
/// `(user_id, request_id)` pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponsePayload {
    pub user_id: String,
    pub request_id: String,
    #[serde(flatten)]
    pub outcome: ResponseOutcome,
}

/// Kind-specific payload union.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvelopeBody {
    Command(CommandPayload),
    Event(EventPayload),
    Response(ResponsePayload),
}

impl EnvelopeBody {
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Self::Command(_) => EnvelopeKind::Command,
            Self::Event(_) => EnvelopeKind::Event,
            Self::Response(_) => EnvelopeKind::Response,
        }
    }

    /// Originating user, present on every payload variant.
    pub fn user_id(&self) -> &str {
        match self {
            Self::Command(CommandPayload::ProcessMessage { user_id, .. })
            | Self::Command(CommandPayload::SaveState { user_id, .. })
            | Self::Command(CommandPayload::LoadState { user_id, .. })
            | Self::Event(EventPayload::HealthCheck { user_id, .. }) => user_id,
            Self::Response(payload) => &payload.user_id,
        }
    }

    /// Correlation token, present on every payload variant.
    pub fn request_id(&self) -> &str {
        match self {
            Self::Command(CommandPayload::ProcessMessage { request_id, .. })
            | Self::Command(CommandPayload::SaveState { request_id, .. })
            | Self::Command(CommandPayload::LoadState { request_id, .. })
            | Self::Event(EventPayload::HealthCheck { request_id, .. }) => request_id,
            Self::Response(payload) => &payload.request_id,
        }
    }
}

/// Envelope metadata stamped by the bus client at publish time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metadata {
    pub user_id: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Unique per envelope.
    pub message_id: String,
    #[serde(default)]
    pub priority: Priority,
    /// Incremented by the dead-letter consumer on each durable retry.
    #[serde(default)]
    pub delivery_attempts: u32,
}

/// The unit of communication on the bus.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(flatten)]
    pub body: EnvelopeBody,
    pub metadata: Metadata,
}

impl Envelope {
    /// Build a fully-stamped envelope. `instance_id` is the target instance
    /// chosen by the load tracker, absent for responses.
    pub fn stamped(
        body: EnvelopeBody,
        agent_id: &str,
        instance_id: Option<String>,
        priority: Priority,
    ) -> Self {
        let user_id = body.user_id().to_string();
        Self {
            body,
            metadata: Metadata {
                user_id,
                agent_id: agent_id.to_string(),
                instance_id,
                timestamp: Utc::now(),
                message_id: Uuid::new_v4().to_string(),
                priority,
                delivery_attempts: 0,
            },
        }
    }

    pub fn kind(&self) -> EnvelopeKind {
        self.body.kind()
    }

    /// Routing key this envelope was (or would be) published under.
    pub fn routing_key(&self) -> String {
        match &self.metadata.instance_id {
            Some(instance_id) => {
                routing::instance_key(&self.metadata.agent_id, instance_id, self.kind())
            }
            None => routing::agent_key(&self.metadata.agent_id, self.kind()),
        }
    }
}

/// Routing-key grammar: `agent.<agentId>.<type>`, or
/// `agent.<agentId>.<instanceId>.<type>` when addressing one instance.
/// Subscribers bind with a wildcard suffix so they receive every kind on
/// their scope.
pub mod routing {
    use super::EnvelopeKind;

    /// `agent.<agentId>.<type>`, instance-less (responses).
    pub fn agent_key(agent_id: &str, kind: EnvelopeKind) -> String {
        format!("agent.{agent_id}.{}", kind.as_str())
    }

    /// `agent.<agentId>.<instanceId>.<type>`, addressing one specific instance.
    pub fn instance_key(agent_id: &str, instance_id: &str, kind: EnvelopeKind) -> String {
        format!("agent.{agent_id}.{instance_id}.{}", kind.as_str())
    }

    /// `agent.<agentId>.#`, everything addressed to the agent.
    pub fn agent_binding(agent_id: &str) -> String {
        format!("agent.{agent_id}.#")
    }

    /// `agent.<agentId>.<instanceId>.#`, everything addressed to one instance.
    pub fn instance_binding(agent_id: &str, instance_id: &str) -> String {
        format!("agent.{agent_id}.{instance_id}.#")
    }

    /// Durable queue name for a worker instance.
    pub fn instance_queue(agent_id: &str, instance_id: &str) -> String {
        format!("agent.{agent_id}.{instance_id}")
    }

    /// Ephemeral queue name for a consumer-scoped subscription.
    pub fn consumer_queue(agent_id: &str, consumer_tag: &str) -> String {
        format!("agent.{agent_id}.{consumer_tag}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process_message(user: &str, rid: &str) -> EnvelopeBody {
        EnvelopeBody::Command(CommandPayload::ProcessMessage {
            user_id: user.into(),
            request_id: rid.into(),
            message: "buy the dip".into(),
        })
    }

    #[test]
    fn command_serializes_with_kind_and_name_tags() {
        let envelope = Envelope::stamped(process_message("u1", "r1"), "a1", None, Priority::High);
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["kind"], "command");
        assert_eq!(value["command"], "PROCESS_MESSAGE");
        assert_eq!(value["user_id"], "u1");
        assert_eq!(value["request_id"], "r1");
        assert_eq!(value["metadata"]["agent_id"], "a1");
        assert_eq!(value["metadata"]["priority"], "high");
        assert_eq!(value["metadata"]["delivery_attempts"], 0);
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = Envelope::stamped(
            EnvelopeBody::Response(ResponsePayload {
                user_id: "u1".into(),
                request_id: "r9".into(),
                outcome: ResponseOutcome::TaskOutput {
                    chunks: vec![TaskChunk {
                        kind: TaskChunkKind::Agent,
                        content: "done".into(),
                    }],
                },
            }),
            "a1",
            None,
            Priority::Medium,
        );
        let raw = serde_json::to_string(&envelope).unwrap();
        let parsed: Envelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn health_check_event_tag() {
        let body = EnvelopeBody::Event(EventPayload::HealthCheck {
            user_id: "system".into(),
            request_id: "r2".into(),
        });
        let value = serde_json::to_value(&body).unwrap();
        assert_eq!(value["kind"], "event");
        assert_eq!(value["event"], "HEALTH_CHECK");
    }

    #[test]
    fn response_outcome_tags() {
        let payload = ResponsePayload {
            user_id: "u1".into(),
            request_id: "r1".into(),
            outcome: ResponseOutcome::Error {
                error: "capability failed".into(),
            },
        };
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["outcome"], "error");
        assert_eq!(value["error"], "capability failed");
    }

    #[test]
    fn body_accessors() {
        let body = process_message("u7", "r7");
        assert_eq!(body.kind(), EnvelopeKind::Command);
        assert_eq!(body.user_id(), "u7");
        assert_eq!(body.request_id(), "r7");
    }

    #[test]
    fn priority_levels() {
        assert_eq!(Priority::Low.level(), 1);
        assert_eq!(Priority::Medium.level(), 5);
        assert_eq!(Priority::High.level(), 9);
    }

    #[test]
    fn routing_key_includes_instance_when_selected() {
        let with_instance = Envelope::stamped(
            process_message("u1", "r1"),
            "a1",
            Some("i1".into()),
            Priority::Medium,
        );
        assert_eq!(with_instance.routing_key(), "agent.a1.i1.command");

        let without = Envelope::stamped(process_message("u1", "r1"), "a1", None, Priority::Medium);
        assert_eq!(without.routing_key(), "agent.a1.command");
    }

    #[test]
    fn routing_grammar() {
        assert_eq!(routing::agent_binding("a1"), "agent.a1.#");
        assert_eq!(routing::instance_binding("a1", "i1"), "agent.a1.i1.#");
        assert_eq!(routing::instance_queue("a1", "i1"), "agent.a1.i1");
        assert_eq!(routing::consumer_queue("a1", "corr-1"), "agent.a1.corr-1");
        assert_eq!(
            routing::agent_key("a1", EnvelopeKind::Response),
            "agent.a1.response"
        );
    }

    #[test]
    fn unknown_command_name_fails_to_parse() {
        let raw = r#"{"kind":"command","command":"SELF_DESTRUCT","user_id":"u1","request_id":"r1"}"#;
        assert!(serde_json::from_str::<EnvelopeBody>(raw).is_err());
    }
}
