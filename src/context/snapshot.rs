//! Immutable run context passed to every stage.
//!
//! [`ContextSnapshot`] is the sole kind-agnostic input to a stage: run
//! identity, message history, enrichments, routing decision, raw input, and
//! open-ended extensions. It is frozen after construction and serializes
//! losslessly to JSON, so runs can be captured and replayed in tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::context::enrichments::{DocumentEnrichment, MemoryEnrichment, ProfileEnrichment};
use crate::error::Result;

/// Role of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One entry in the ordered message history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl Message {
    /// Create a message with no timestamp or metadata.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: None,
            metadata: Map::new(),
        }
    }

    /// Attach a timestamp.
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Which pipeline a router selected, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub agent_id: String,
    pub pipeline_name: String,
    pub topology: String,
    pub reason: Option<String>,
}

/// Immutable view of the world a pipeline run executes against.
///
/// Constructed once before `run`, shared by reference with every stage, and
/// never mutated. All identifiers are optional opaque UUIDs; they serialize
/// as lowercase hyphenated strings, and timestamps serialize as ISO-8601
/// with a UTC suffix. `to_value`/`from_value` round-trip is lossless for
/// every field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    // Run identity.
    pub pipeline_run_id: Option<Uuid>,
    pub request_id: Option<Uuid>,
    pub session_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub org_id: Option<Uuid>,
    pub interaction_id: Option<Uuid>,

    // Topology / execution mode.
    pub topology: Option<String>,
    pub execution_mode: Option<String>,

    /// Ordered message history. Ordering is stable across serialization.
    #[serde(default)]
    pub messages: Vec<Message>,

    pub routing_decision: Option<RoutingDecision>,

    // Enrichments.
    pub profile: Option<ProfileEnrichment>,
    pub memory: Option<MemoryEnrichment>,
    #[serde(default)]
    pub documents: Vec<DocumentEnrichment>,

    // Raw input.
    pub input_text: Option<String>,
    pub input_audio_duration_ms: Option<u64>,

    /// Application-specific extensions.
    #[serde(default)]
    pub extensions: Map<String, Value>,

    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ContextSnapshot {
    /// Create a new builder.
    pub fn builder() -> ContextSnapshotBuilder {
        ContextSnapshotBuilder::default()
    }

    /// Serialize to a canonical JSON value.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Deserialize from a JSON value produced by [`to_value`](Self::to_value).
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Derive a child snapshot for a subpipeline run.
    ///
    /// The child gets a freshly minted `pipeline_run_id`; every other
    /// identity field is copied. Topology and execution mode are overridden
    /// when provided. Messages and extensions are cloned by value, and the
    /// spawn linkage (parent run, spawning stage, correlation id) is
    /// recorded in the child's extensions.
    pub fn derive_child(
        &self,
        correlation_id: Uuid,
        parent_stage_id: &str,
        topology: Option<String>,
        execution_mode: Option<String>,
    ) -> ContextSnapshot {
        let mut extensions = self.extensions.clone();
        if let Some(parent) = self.pipeline_run_id {
            extensions.insert("parent_run_id".into(), Value::String(parent.to_string()));
        }
        extensions.insert(
            "parent_stage_id".into(),
            Value::String(parent_stage_id.to_string()),
        );
        extensions.insert(
            "correlation_id".into(),
            Value::String(correlation_id.to_string()),
        );

        ContextSnapshot {
            pipeline_run_id: Some(Uuid::new_v4()),
            request_id: self.request_id,
            session_id: self.session_id,
            user_id: self.user_id,
            org_id: self.org_id,
            interaction_id: self.interaction_id,
            topology: topology.or_else(|| self.topology.clone()),
            execution_mode: execution_mode.or_else(|| self.execution_mode.clone()),
            messages: self.messages.clone(),
            routing_decision: self.routing_decision.clone(),
            profile: self.profile.clone(),
            memory: self.memory.clone(),
            documents: self.documents.clone(),
            input_text: self.input_text.clone(),
            input_audio_duration_ms: self.input_audio_duration_ms,
            extensions,
            created_at: Utc::now(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Builder for [`ContextSnapshot`].
///
/// # Example
///
/// ```
/// use stageflow::ContextSnapshot;
/// use uuid::Uuid;
///
/// let snapshot = ContextSnapshot::builder()
///     .pipeline_run_id(Uuid::new_v4())
///     .topology("fast_kernel")
///     .input_text("hello")
///     .build();
/// ```
#[derive(Debug, Default)]
pub struct ContextSnapshotBuilder {
    pipeline_run_id: Option<Uuid>,
    request_id: Option<Uuid>,
    session_id: Option<Uuid>,
    user_id: Option<Uuid>,
    org_id: Option<Uuid>,
    interaction_id: Option<Uuid>,
    topology: Option<String>,
    execution_mode: Option<String>,
    messages: Vec<Message>,
    routing_decision: Option<RoutingDecision>,
    profile: Option<ProfileEnrichment>,
    memory: Option<MemoryEnrichment>,
    documents: Vec<DocumentEnrichment>,
    input_text: Option<String>,
    input_audio_duration_ms: Option<u64>,
    extensions: Map<String, Value>,
    metadata: Map<String, Value>,
}

impl ContextSnapshotBuilder {
    pub fn pipeline_run_id(mut self, id: Uuid) -> Self {
        self.pipeline_run_id = Some(id);
        self
    }

    pub fn request_id(mut self, id: Uuid) -> Self {
        self.request_id = Some(id);
        self
    }

    pub fn session_id(mut self, id: Uuid) -> Self {
        self.session_id = Some(id);
        self
    }

    pub fn user_id(mut self, id: Uuid) -> Self {
        self.user_id = Some(id);
        self
    }

    pub fn org_id(mut self, id: Uuid) -> Self {
        self.org_id = Some(id);
        self
    }

    pub fn interaction_id(mut self, id: Uuid) -> Self {
        self.interaction_id = Some(id);
        self
    }

    pub fn topology(mut self, topology: impl Into<String>) -> Self {
        self.topology = Some(topology.into());
        self
    }

    pub fn execution_mode(mut self, mode: impl Into<String>) -> Self {
        self.execution_mode = Some(mode.into());
        self
    }

    /// Append a message to the history.
    pub fn message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    /// Set the entire message history at once.
    pub fn messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    pub fn routing_decision(mut self, decision: RoutingDecision) -> Self {
        self.routing_decision = Some(decision);
        self
    }

    pub fn profile(mut self, profile: ProfileEnrichment) -> Self {
        self.profile = Some(profile);
        self
    }

    pub fn memory(mut self, memory: MemoryEnrichment) -> Self {
        self.memory = Some(memory);
        self
    }

    pub fn document(mut self, document: DocumentEnrichment) -> Self {
        self.documents.push(document);
        self
    }

    pub fn input_text(mut self, text: impl Into<String>) -> Self {
        self.input_text = Some(text.into());
        self
    }

    pub fn input_audio_duration_ms(mut self, ms: u64) -> Self {
        self.input_audio_duration_ms = Some(ms);
        self
    }

    /// Insert a single extension value.
    pub fn extension(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extensions.insert(key.into(), value);
        self
    }

    /// Insert a single metadata value.
    pub fn meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Build the snapshot. `created_at` is stamped now.
    pub fn build(self) -> ContextSnapshot {
        ContextSnapshot {
            pipeline_run_id: self.pipeline_run_id,
            request_id: self.request_id,
            session_id: self.session_id,
            user_id: self.user_id,
            org_id: self.org_id,
            interaction_id: self.interaction_id,
            topology: self.topology,
            execution_mode: self.execution_mode,
            messages: self.messages,
            routing_decision: self.routing_decision,
            profile: self.profile,
            memory: self.memory,
            documents: self.documents,
            input_text: self.input_text,
            input_audio_duration_ms: self.input_audio_duration_ms,
            extensions: self.extensions,
            created_at: Utc::now(),
            metadata: self.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_snapshot() -> ContextSnapshot {
        ContextSnapshot::builder()
            .pipeline_run_id(Uuid::new_v4())
            .request_id(Uuid::new_v4())
            .session_id(Uuid::new_v4())
            .user_id(Uuid::new_v4())
            .org_id(Uuid::new_v4())
            .interaction_id(Uuid::new_v4())
            .topology("fast_kernel")
            .execution_mode("practice")
            .message(Message::new(Role::User, "hello").with_timestamp(Utc::now()))
            .message(Message::new(Role::Assistant, "hi there"))
            .routing_decision(RoutingDecision {
                agent_id: "coach".into(),
                pipeline_name: "full".into(),
                topology: "fast_kernel".into(),
                reason: Some("default".into()),
            })
            .profile(ProfileEnrichment {
                user_id: Some(Uuid::new_v4()),
                display_name: Some("Alice".into()),
                preferences: Map::new(),
                goals: vec!["learn".into()],
            })
            .memory(MemoryEnrichment {
                recent_topics: vec!["rust".into()],
                key_facts: vec![],
                interaction_history_summary: Some("short".into()),
            })
            .document(DocumentEnrichment {
                document_id: Some("doc-1".into()),
                document_type: Some("note".into()),
                blocks: vec![json!({"text": "block"})],
                metadata: Map::new(),
            })
            .input_text("raw input")
            .input_audio_duration_ms(1500)
            .extension("feature_flag", json!(true))
            .meta("source", json!("test"))
            .build()
    }

    #[test]
    fn test_round_trip_preserves_every_field() {
        let snapshot = full_snapshot();
        let value = snapshot.to_value().unwrap();
        let restored = ContextSnapshot::from_value(value).unwrap();
        assert_eq!(snapshot, restored);
    }

    #[test]
    fn test_identifiers_serialize_as_lowercase_uuid_strings() {
        let id = Uuid::new_v4();
        let snapshot = ContextSnapshot::builder().pipeline_run_id(id).build();
        let value = snapshot.to_value().unwrap();
        let serialized = value["pipeline_run_id"].as_str().unwrap();
        assert_eq!(serialized, id.to_string());
        assert_eq!(serialized, serialized.to_lowercase());
    }

    #[test]
    fn test_message_ordering_is_stable() {
        let snapshot = ContextSnapshot::builder()
            .message(Message::new(Role::User, "first"))
            .message(Message::new(Role::Assistant, "second"))
            .message(Message::new(Role::User, "third"))
            .build();
        let restored = ContextSnapshot::from_value(snapshot.to_value().unwrap()).unwrap();
        let contents: Vec<&str> = restored.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_roles_serialize_lowercase() {
        let value = serde_json::to_value(Message::new(Role::System, "sys")).unwrap();
        assert_eq!(value["role"], "system");
    }

    #[test]
    fn test_created_at_serializes_with_utc_suffix() {
        let snapshot = ContextSnapshot::builder().build();
        let value = snapshot.to_value().unwrap();
        let created_at = value["created_at"].as_str().unwrap();
        assert!(created_at.ends_with('Z') || created_at.ends_with("+00:00"));
    }

    #[test]
    fn test_derive_child_mints_new_run_id() {
        let parent = full_snapshot();
        let correlation = Uuid::new_v4();
        let child = parent.derive_child(correlation, "dispatch", Some("slow_kernel".into()), None);

        assert_ne!(child.pipeline_run_id, parent.pipeline_run_id);
        assert!(child.pipeline_run_id.is_some());
        assert_eq!(child.session_id, parent.session_id);
        assert_eq!(child.user_id, parent.user_id);
        assert_eq!(child.topology.as_deref(), Some("slow_kernel"));
        assert_eq!(child.execution_mode, parent.execution_mode);
        assert_eq!(
            child.extensions["parent_run_id"],
            json!(parent.pipeline_run_id.unwrap().to_string())
        );
        assert_eq!(child.extensions["parent_stage_id"], json!("dispatch"));
        assert_eq!(child.extensions["correlation_id"], json!(correlation.to_string()));
    }

    #[test]
    fn test_derive_child_clones_not_aliases() {
        let parent = ContextSnapshot::builder()
            .message(Message::new(Role::User, "hello"))
            .extension("k", json!([1, 2, 3]))
            .build();
        let child = parent.derive_child(Uuid::new_v4(), "stage", None, None);
        assert_eq!(child.messages, parent.messages);
        assert_eq!(child.extensions["k"], parent.extensions["k"]);
    }
}
