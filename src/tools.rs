//! Tool registry: the seam through which agent stages execute actions.
//!
//! The engine does not interpret actions; it only offers discovery
//! (`lookup(action_type)`) and dispatch. Concrete tools live in the
//! application and register themselves here, either as instances or as
//! lazily-invoked factories.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};

use crate::error::Result;

/// An action an agent asked to perform.
#[derive(Debug, Clone)]
pub struct ToolInput {
    /// Action type, matched against registered tools.
    pub action_type: String,
    /// Action payload, interpreted by the tool.
    pub payload: Map<String, Value>,
}

impl ToolInput {
    pub fn new(action_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            action_type: action_type.into(),
            payload,
        }
    }
}

/// Result of one tool execution.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub success: bool,
    pub data: Map<String, Value>,
    pub error: Option<String>,
}

impl ToolOutput {
    pub fn ok(data: Map<String, Value>) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Map::new(),
            error: Some(error.into()),
        }
    }
}

/// A tool that can execute one action type.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The action type this tool handles.
    fn action_type(&self) -> &str;

    /// Execute the action.
    async fn execute(&self, input: ToolInput) -> Result<ToolOutput>;
}

type ToolFactory = Arc<dyn Fn() -> Arc<dyn Tool> + Send + Sync>;

/// Registry mapping action types to tools.
///
/// Tools register as instances or as factories; factories are invoked on
/// first lookup and the instance cached.
#[derive(Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    factories: RwLock<HashMap<String, ToolFactory>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool instance under its own action type.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        self.tools.write().insert(tool.action_type().to_string(), tool);
    }

    /// Register a factory for lazy tool creation.
    pub fn register_factory(
        &self,
        action_type: impl Into<String>,
        factory: impl Fn() -> Arc<dyn Tool> + Send + Sync + 'static,
    ) {
        self.factories.write().insert(action_type.into(), Arc::new(factory));
    }

    /// Look up the tool for an action type, instantiating from a factory
    /// if needed.
    pub fn lookup(&self, action_type: &str) -> Option<Arc<dyn Tool>> {
        if let Some(tool) = self.tools.read().get(action_type) {
            return Some(Arc::clone(tool));
        }
        let factory = self.factories.read().get(action_type).cloned()?;
        let tool = factory();
        self.tools
            .write()
            .insert(action_type.to_string(), Arc::clone(&tool));
        Some(tool)
    }

    /// Whether an action type has a registered tool or factory.
    pub fn can_execute(&self, action_type: &str) -> bool {
        self.tools.read().contains_key(action_type)
            || self.factories.read().contains_key(action_type)
    }

    /// Dispatch an action to its tool. An unknown action type is a failed
    /// output, not an error.
    pub async fn execute(&self, input: ToolInput) -> Result<ToolOutput> {
        match self.lookup(&input.action_type) {
            Some(tool) => tool.execute(input).await,
            None => Ok(ToolOutput::failed(format!(
                "No tool registered for action type: {}",
                input.action_type
            ))),
        }
    }

    /// Registered action types, sorted.
    pub fn action_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .tools
            .read()
            .keys()
            .chain(self.factories.read().keys())
            .cloned()
            .collect();
        types.sort();
        types.dedup();
        types
    }

    /// Drop all registrations. Test hook for the process-scoped instance.
    pub fn clear(&self) {
        self.tools.write().clear();
        self.factories.write().clear();
    }
}

static GLOBAL_TOOLS: RwLock<Option<Arc<ToolRegistry>>> = RwLock::new(None);

/// Process-scoped tool registry, created lazily.
pub fn global_tool_registry() -> Arc<ToolRegistry> {
    if let Some(registry) = GLOBAL_TOOLS.read().as_ref() {
        return Arc::clone(registry);
    }
    let mut slot = GLOBAL_TOOLS.write();
    slot.get_or_insert_with(|| Arc::new(ToolRegistry::new())).clone()
}
