//! Optional context enrichments attached to a snapshot.
//!
//! Enrichment stages (profile fetch, memory summarization, document
//! retrieval) produce these records; the engine itself only carries them.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// User profile attached to a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProfileEnrichment {
    pub user_id: Option<Uuid>,
    pub display_name: Option<String>,
    #[serde(default)]
    pub preferences: Map<String, Value>,
    #[serde(default)]
    pub goals: Vec<String>,
}

/// Summarized memory view attached to a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MemoryEnrichment {
    #[serde(default)]
    pub recent_topics: Vec<String>,
    #[serde(default)]
    pub key_facts: Vec<String>,
    pub interaction_history_summary: Option<String>,
}

/// A retrieved document attached to a run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DocumentEnrichment {
    pub document_id: Option<String>,
    pub document_type: Option<String>,
    #[serde(default)]
    pub blocks: Vec<Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}
