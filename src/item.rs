// src/item.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Discrete state an item is in. Each stage owns one list in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Pending,
    Processing,
    Completed,
    Error,
    Failed,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Pending,
        Stage::Processing,
        Stage::Completed,
        Stage::Error,
        Stage::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Pending => "pending",
            Stage::Processing => "processing",
            Stage::Completed => "completed",
            Stage::Error => "error",
            Stage::Failed => "failed",
        }
    }

    /// Terminal stages are the only ones retention cleanup may touch.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Completed | Stage::Error)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unit of work moving through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub id: String,
    pub payload: Value,
    pub stage: Stage,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    /// Incremented on every claim. Also serves as the claim generation that
    /// `move_item` matches against.
    #[serde(default)]
    pub attempts: u32,
    /// Times stall recovery pulled this item back out of `processing`.
    #[serde(default)]
    pub stall_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Item {
    pub fn new(id: impl Into<String>, payload: Value, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            payload,
            stage: Stage::Pending,
            claimed_at: None,
            attempts: 0,
            stall_count: 0,
            last_error: None,
            result: None,
            enqueued_at: now,
            updated_at: now,
        }
    }

    /// String field from the payload; missing or non-string values read as "".
    pub fn payload_str(&self, field: &str) -> &str {
        payload_str(&self.payload, field)
    }
}

pub(crate) fn payload_str<'a>(payload: &'a Value, field: &str) -> &'a str {
    payload.get(field).and_then(Value::as_str).unwrap_or("")
}
