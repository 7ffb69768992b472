//! Message types for coordinator/worker communication.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Broadcast marker stored in the recipient column.
pub const BROADCAST: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Broadcast,
    Status,
    Artifact,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Request => "request",
            Self::Response => "response",
            Self::Broadcast => "broadcast",
            Self::Status => "status",
            Self::Artifact => "artifact",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "request" => Self::Request,
            "response" => Self::Response,
            "broadcast" => Self::Broadcast,
            "artifact" => Self::Artifact,
            _ => Self::Status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recipient {
    Worker(String),
    All,
}

impl Recipient {
    pub fn worker(id: impl Into<String>) -> Self {
        Self::Worker(id.into())
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Worker(id) => id,
            Self::All => BROADCAST,
        }
    }

    pub fn parse(s: &str) -> Self {
        if s == BROADCAST {
            Self::All
        } else {
            Self::Worker(s.to_string())
        }
    }

    pub fn is_broadcast(&self) -> bool {
        matches!(self, Self::All)
    }
}

/// A single exchanged message. Immutable once created apart from the
/// `read` flag; destroyed only by explicit inbox clearing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender: String,
    pub recipient: Recipient,
    pub kind: MessageKind,
    pub content: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

impl Message {
    pub fn new(
        sender: impl Into<String>,
        recipient: Recipient,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender: sender.into(),
            recipient,
            kind,
            content: content.into(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
            read: false,
        }
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient.is_broadcast()
    }

    pub fn is_for(&self, worker_id: &str) -> bool {
        match &self.recipient {
            Recipient::Worker(id) => id == worker_id,
            Recipient::All => true,
        }
    }
}
