//! Fluent, persistent pipeline assembly and build-time validation.
//!
//! A [`Pipeline`] is an immutable mapping from stage name to [`StageSpec`]
//! with stable insertion order. [`Pipeline::with_stage`] returns a new
//! pipeline and never mutates the receiver, so partial pipelines can be
//! shared and extended independently. [`Pipeline::build`] validates
//! (non-empty, dependency closure, acyclicity) and compiles to a runnable
//! [`StageGraph`]; validation failures never surface during a run.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use crate::breaker::global_circuit_breaker;
use crate::config::StageflowConfig;
use crate::error::{Result, StageflowError};
use crate::graph::StageGraph;
use crate::interceptor::{default_interceptors, Interceptor};
use crate::stage::{Stage, StageKind};

/// Immutable declaration of one stage in a pipeline.
#[derive(Clone)]
pub struct StageSpec {
    /// Unique name within the pipeline.
    pub name: String,
    /// The stage implementation invoked for each run.
    pub runner: Arc<dyn Stage>,
    /// Kind categorization (informational; never alters scheduling).
    pub kind: StageKind,
    /// Names of stages whose outputs this stage consumes. Duplicates
    /// collapse.
    pub dependencies: BTreeSet<String>,
    /// Skip this stage automatically when any dependency signals skip.
    pub conditional: bool,
    /// Provider hint for the circuit-breaker interceptor.
    pub provider: Option<String>,
    /// Model hint for the circuit-breaker interceptor.
    pub model_id: Option<String>,
    /// Per-stage wall-clock budget override.
    pub timeout: Option<Duration>,
}

impl StageSpec {
    pub fn new(name: impl Into<String>, runner: Arc<dyn Stage>, kind: StageKind) -> Self {
        Self {
            name: name.into(),
            runner,
            kind,
            dependencies: BTreeSet::new(),
            conditional: false,
            provider: None,
            model_id: None,
            timeout: None,
        }
    }

    /// Build a spec from a stage's own name and kind.
    pub fn from_stage(runner: Arc<dyn Stage>) -> Self {
        let name = runner.name().to_string();
        let kind = runner.kind();
        Self::new(name, runner, kind)
    }

    /// Declare dependencies. Duplicates collapse.
    pub fn with_dependencies<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    /// Mark the stage conditional: it is skipped when any dependency's
    /// output has status SKIP or carries a truthy `skip_reason`.
    pub fn conditional(mut self) -> Self {
        self.conditional = true;
        self
    }

    /// Attach provider/model hints so the breaker interceptor gates this
    /// stage under the key `(stage_name, provider, model_id)`.
    pub fn with_provider_hint(
        mut self,
        provider: impl Into<String>,
        model_id: Option<String>,
    ) -> Self {
        self.provider = Some(provider.into());
        self.model_id = model_id;
        self
    }

    /// Override the per-stage timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

impl std::fmt::Debug for StageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("dependencies", &self.dependencies)
            .field("conditional", &self.conditional)
            .finish()
    }
}

/// Immutable pipeline under assembly.
///
/// # Example
///
/// ```ignore
/// let graph = Pipeline::new()
///     .with_stage(StageSpec::new("stt", stt, StageKind::Transform))
///     .with_stage(StageSpec::new("llm", llm, StageKind::Transform).with_dependencies(["stt"]))
///     .build()?;
/// ```
#[derive(Clone, Default)]
pub struct Pipeline {
    stages: Vec<StageSpec>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a new pipeline with the spec added. The receiver is not
    /// mutated. If a stage with the same name exists, the later definition
    /// wins, keeping the original position in iteration order.
    pub fn with_stage(&self, spec: StageSpec) -> Pipeline {
        let mut stages = self.stages.clone();
        match stages.iter_mut().find(|s| s.name == spec.name) {
            Some(existing) => *existing = spec,
            None => stages.push(spec),
        }
        Pipeline { stages }
    }

    /// Merge two pipelines by key-union. On a name conflict the definition
    /// from `other` wins.
    pub fn compose(&self, other: &Pipeline) -> Pipeline {
        let mut merged = self.clone();
        for spec in &other.stages {
            merged = merged.with_stage(spec.clone());
        }
        merged
    }

    /// Stage names in insertion order.
    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Look up a stage spec by name.
    pub fn get(&self, name: &str) -> Option<&StageSpec> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Validate and compile to a runnable graph with the default
    /// interceptor chain and configuration.
    pub fn build(&self) -> Result<StageGraph> {
        self.build_with(&StageflowConfig::default())
    }

    /// Validate and compile with explicit configuration.
    pub fn build_with(&self, config: &StageflowConfig) -> Result<StageGraph> {
        self.validate()?;
        let interceptors: Vec<Arc<dyn Interceptor>> = default_interceptors(
            config.default_stage_timeout,
            global_circuit_breaker(),
        );
        Ok(StageGraph::from_specs(
            self.stages.clone(),
            interceptors,
            config.default_stage_timeout,
        ))
    }

    fn validate(&self) -> Result<()> {
        if self.stages.is_empty() {
            return Err(StageflowError::EmptyPipeline);
        }

        let names: BTreeSet<&str> = self.stages.iter().map(|s| s.name.as_str()).collect();
        for spec in &self.stages {
            for dep in &spec.dependencies {
                if !names.contains(dep.as_str()) {
                    return Err(StageflowError::MissingDependency {
                        stage: spec.name.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }

        self.check_acyclic()
    }

    /// Three-color DFS; a back-edge means a cycle, reported with the full
    /// path around it.
    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }

        fn visit(
            name: &str,
            deps_of: &HashMap<&str, &BTreeSet<String>>,
            colors: &mut HashMap<String, Color>,
            path: &mut Vec<String>,
        ) -> Result<()> {
            colors.insert(name.to_string(), Color::Gray);
            path.push(name.to_string());

            for dep in deps_of[name] {
                match colors.get(dep.as_str()).copied().unwrap_or(Color::White) {
                    Color::Gray => {
                        let start = path.iter().position(|n| n == dep).unwrap_or(0);
                        let mut cycle: Vec<String> = path[start..].to_vec();
                        cycle.push(dep.clone());
                        return Err(StageflowError::CycleDetected { cycle });
                    }
                    Color::White => visit(dep, deps_of, colors, path)?,
                    Color::Black => {}
                }
            }

            path.pop();
            colors.insert(name.to_string(), Color::Black);
            Ok(())
        }

        let deps_of: HashMap<&str, &BTreeSet<String>> = self
            .stages
            .iter()
            .map(|s| (s.name.as_str(), &s.dependencies))
            .collect();
        let mut colors: HashMap<String, Color> = HashMap::new();
        let mut path = Vec::new();

        for spec in &self.stages {
            if colors.get(spec.name.as_str()).copied().unwrap_or(Color::White) == Color::White {
                visit(&spec.name, &deps_of, &mut colors, &mut path)?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").field("stages", &self.names()).finish()
    }
}
