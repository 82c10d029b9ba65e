//! Event actions and the `{action, data}` envelope exchanged through the broker.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

/// Tag identifying what an event means to the client.
///
/// Serialized as a bare string. Tags this build does not know about are kept
/// verbatim in [`Action::Other`] so they pass through untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    TriggerUpdate,
    AccountUpdate,
    SequenceUpdate,
    SequenceGenerationCompletion,
    KeyPersonUpdate,
    CampaignUpdate,
    WorkflowUpdate,
    Notification,
    SystemMessage,
    KeyPeopleActivityCreated,
    EmailSent,
    EmailFailed,
    SequenceEmailSent,
    SequenceEmailFailed,
    InboxChanged,
    BotWorkflowStarted,
    BotTaskProgress,
    BotTaskCompleted,
    BotTaskFailed,
    BotWorkflowCompleted,
    AgentToolReady,
    AgentCompleted,
    AgentFailed,
    Heartbeat,
    Other(String),
}

const KNOWN_ACTIONS: &[(Action, &str)] = &[
    (Action::TriggerUpdate, "TRIGGER_UPDATE"),
    (Action::AccountUpdate, "ACCOUNT_UPDATE"),
    (Action::SequenceUpdate, "SEQUENCE_UPDATE"),
    (
        Action::SequenceGenerationCompletion,
        "SEQUENCE_GENERATION_COMPLETION",
    ),
    (Action::KeyPersonUpdate, "KEY_PERSON_UPDATE"),
    (Action::CampaignUpdate, "CAMPAIGN_UPDATE"),
    (Action::WorkflowUpdate, "WORKFLOW_UPDATE"),
    (Action::Notification, "NOTIFICATION"),
    (Action::SystemMessage, "SYSTEM_MESSAGE"),
    (Action::KeyPeopleActivityCreated, "KEY_PEOPLE_ACTIVITY_CREATED"),
    (Action::EmailSent, "EMAIL_MESSAGE_SENT"),
    (Action::EmailFailed, "EMAIL_MESSAGE_FAILED"),
    (Action::SequenceEmailSent, "SEQUENCE_EMAIL_SENT"),
    (Action::SequenceEmailFailed, "SEQUENCE_EMAIL_FAILED"),
    (Action::InboxChanged, "INBOX_CHANGED"),
    (Action::BotWorkflowStarted, "BOT_WORKFLOW_STARTED"),
    (Action::BotTaskProgress, "BOT_TASK_PROGRESS"),
    (Action::BotTaskCompleted, "BOT_TASK_COMPLETED"),
    (Action::BotTaskFailed, "BOT_TASK_FAILED"),
    (Action::BotWorkflowCompleted, "BOT_WORKFLOW_COMPLETED"),
    (Action::AgentToolReady, "AGENT_TOOL_READY"),
    (Action::AgentCompleted, "AGENT_COMPLETED"),
    (Action::AgentFailed, "AGENT_FAILED"),
    (Action::Heartbeat, "HEARTBEAT"),
];

impl Action {
    pub fn as_str(&self) -> &str {
        if let Action::Other(tag) = self {
            return tag;
        }
        KNOWN_ACTIONS
            .iter()
            .find(|(action, _)| action == self)
            .map(|(_, tag)| *tag)
            .unwrap_or_default()
    }
}

impl From<String> for Action {
    fn from(tag: String) -> Self {
        KNOWN_ACTIONS
            .iter()
            .find(|(_, known)| *known == tag)
            .map(|(action, _)| action.clone())
            .unwrap_or(Action::Other(tag))
    }
}

impl From<&str> for Action {
    fn from(tag: &str) -> Self {
        Action::from(tag.to_string())
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        match action {
            Action::Other(tag) => tag,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One event as it travels through the broker and out to clients.
///
/// Fields are private: an envelope is never changed after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    action: Action,
    #[serde(default)]
    data: Value,
}

impl Envelope {
    pub fn new(action: Action, data: Value) -> Self {
        Self { action, data }
    }

    /// Build an envelope from any serializable payload.
    pub fn from_payload<T: Serialize + ?Sized>(
        action: Action,
        data: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(action, serde_json::to_value(data)?))
    }

    /// Keep-alive frame carrying the server time.
    pub fn heartbeat(now: DateTime<Utc>) -> Self {
        Self::new(
            Action::Heartbeat,
            serde_json::json!({ "timestamp": rfc3339(now) }),
        )
    }

    /// First frame written on a new stream.
    pub fn connected(now: DateTime<Utc>) -> Self {
        Self::new(
            Action::SystemMessage,
            serde_json::json!({
                "message": "Connected to real-time events",
                "timestamp": rfc3339(now),
            }),
        )
    }

    pub fn action(&self) -> &Action {
        &self.action
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Encode as one server-sent-events record: `data: {json}\n\n`.
    ///
    /// Compact JSON never contains a raw newline, so one `data:` line suffices.
    pub fn to_sse_frame(&self) -> Result<Vec<u8>, serde_json::Error> {
        let json = self.encode()?;
        let mut frame = Vec::with_capacity(json.len() + 8);
        frame.extend_from_slice(b"data: ");
        frame.extend_from_slice(&json);
        frame.extend_from_slice(b"\n\n");
        Ok(frame)
    }
}

fn rfc3339(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}
