use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress of a block as shown to the operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockStatus {
    Started,
    Completed,
    Failed,
}

/// Identifiers of the program/cycle a run belongs to, read from run variables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunIdentifiers {
    pub execution_session_id: Option<String>,
    pub program_id: Option<String>,
    pub program_name: Option<String>,
    pub cycle_id: Option<String>,
    pub cycle_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockTiming {
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
}

/// Progress record for a UI-visible block
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockEvent {
    pub block_id: String,
    pub block_kind: String,
    pub block_name: String,
    pub device_name: Option<String>,
    pub device_type: Option<String>,
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub identifiers: RunIdentifiers,
    pub timing: BlockTiming,
    pub status: BlockStatus,
    pub result: Option<serde_json::Value>,
}
