//! Name-keyed pipeline registry.
//!
//! The seam through which callers select a pipeline by name before a run.
//! Registration is the only write; the core consumes `get` only.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::pipeline::Pipeline;

/// Registry mapping pipeline names to their definitions.
#[derive(Default)]
pub struct PipelineRegistry {
    pipelines: RwLock<HashMap<String, Pipeline>>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pipeline under a name. Re-registering replaces.
    pub fn register(&self, name: impl Into<String>, pipeline: Pipeline) {
        self.pipelines.write().insert(name.into(), pipeline);
    }

    /// Look up a pipeline by name.
    pub fn get(&self, name: &str) -> Option<Pipeline> {
        self.pipelines.read().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.pipelines.read().contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pipelines.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove every registration. Test hook for the process-scoped
    /// instance.
    pub fn clear(&self) {
        self.pipelines.write().clear();
    }
}

static GLOBAL_REGISTRY: RwLock<Option<Arc<PipelineRegistry>>> = RwLock::new(None);

/// Process-scoped registry, created lazily.
pub fn global_pipeline_registry() -> Arc<PipelineRegistry> {
    if let Some(registry) = GLOBAL_REGISTRY.read().as_ref() {
        return Arc::clone(registry);
    }
    let mut slot = GLOBAL_REGISTRY.write();
    slot.get_or_insert_with(|| Arc::new(PipelineRegistry::new())).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::StageSpec;
    use crate::stage::StageKind;
    use crate::testing::ok_stage;
    use parking_lot::Mutex;

    fn sample_pipeline() -> Pipeline {
        let log = Arc::new(Mutex::new(Vec::new()));
        Pipeline::new().with_stage(StageSpec::new("echo", ok_stage("echo", log), StageKind::Work))
    }

    #[test]
    fn test_register_and_get() {
        let registry = PipelineRegistry::new();
        registry.register("simple", sample_pipeline());

        assert!(registry.contains("simple"));
        assert_eq!(registry.get("simple").unwrap().names(), vec!["echo"]);
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.names(), vec!["simple"]);
    }

    #[test]
    fn test_reregister_replaces() {
        let registry = PipelineRegistry::new();
        registry.register("p", Pipeline::new());
        registry.register("p", sample_pipeline());
        assert_eq!(registry.get("p").unwrap().len(), 1);
    }
}
