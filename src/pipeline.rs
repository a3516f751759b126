//! The ordered stage registry.
//!
//! A [`Pipeline`] is built once at startup and shared read-only by every
//! runner. Stages run strictly in registration order; ordinals are 1-based.
//! A pipeline with a checkpoint uses the interactive state machine shape,
//! one without uses the non-interactive shape.
//!
//! # Example
//!
//! ```
//! use jobline::{Pipeline, Result, StageContext, StageHandler, StageOutput};
//! use async_trait::async_trait;
//! use serde_json::json;
//!
//! #[derive(Debug)]
//! struct Analyze;
//!
//! #[async_trait]
//! impl StageHandler for Analyze {
//!     async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
//!         Ok(StageOutput::new(json!({ "product": ctx.topic() })))
//!     }
//! }
//!
//! #[derive(Debug)]
//! struct Publish;
//!
//! #[async_trait]
//! impl StageHandler for Publish {
//!     async fn execute(&self, _ctx: &StageContext) -> Result<StageOutput> {
//!         Ok(StageOutput::default())
//!     }
//! }
//!
//! let pipeline = Pipeline::builder()
//!     .stage("analyze", Analyze)
//!     .soft_fail_stage("publish", Publish)
//!     .label("analyze", "Product analysis")
//!     .checkpoint("analyze")
//!     .build()?;
//!
//! assert_eq!(pipeline.len(), 2);
//! # Ok::<(), jobline::JoblineError>(())
//! ```

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::stage::{FailurePolicy, StageHandler};
use crate::state::PipelineShape;
use crate::{JoblineError, Result};

/// An immutable registry entry.
#[derive(Debug, Clone)]
pub struct StageDescriptor {
    ordinal: u32,
    name: String,
    label: String,
    policy: FailurePolicy,
    handler: Arc<dyn StageHandler>,
}

impl StageDescriptor {
    /// 1-based position in the pipeline.
    pub fn ordinal(&self) -> u32 {
        self.ordinal
    }

    /// Stable stage name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Human-readable label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// How failures of this stage are treated.
    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// The bound handler.
    pub fn handler(&self) -> &Arc<dyn StageHandler> {
        &self.handler
    }
}

/// Serializable catalog row describing one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageInfo {
    /// 1-based position.
    pub ordinal: u32,
    /// Stable name.
    pub name: String,
    /// Human-readable label.
    pub label: String,
    /// Failure policy.
    pub policy: FailurePolicy,
    /// Whether the pipeline pauses after this stage.
    pub checkpoint: bool,
}

/// An ordered, validated sequence of stages.
#[derive(Debug)]
pub struct Pipeline {
    stages: Vec<StageDescriptor>,
    checkpoint: Option<usize>,
    shape: PipelineShape,
}

impl Pipeline {
    /// Creates a new pipeline builder.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// The state machine shape jobs of this pipeline follow.
    pub fn shape(&self) -> PipelineShape {
        self.shape
    }

    /// Stages in execution order.
    pub fn stages(&self) -> &[StageDescriptor] {
        &self.stages
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the pipeline has no stages.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Looks up a stage by name.
    pub fn get(&self, name: &str) -> Option<&StageDescriptor> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Index of the checkpoint stage, if any.
    pub fn checkpoint_index(&self) -> Option<usize> {
        self.checkpoint
    }

    /// Returns true if the job pauses after the stage at `index`.
    pub fn is_checkpoint(&self, index: usize) -> bool {
        self.checkpoint == Some(index)
    }

    /// The ordered stage catalog.
    pub fn catalog(&self) -> Vec<StageInfo> {
        self.stages
            .iter()
            .enumerate()
            .map(|(index, stage)| StageInfo {
                ordinal: stage.ordinal,
                name: stage.name.clone(),
                label: stage.label.clone(),
                policy: stage.policy,
                checkpoint: self.is_checkpoint(index),
            })
            .collect()
    }
}

/// Builder for [`Pipeline`].
#[derive(Debug, Default)]
pub struct PipelineBuilder {
    stages: Vec<StageDescriptor>,
    labels: Vec<(String, String)>,
    checkpoint: Option<String>,
    requires_input: bool,
}

impl PipelineBuilder {
    fn new() -> Self {
        Self::default()
    }

    /// Appends a fatal-on-error stage.
    ///
    /// # Panics
    ///
    /// Panics if a stage with the same name already exists. Use
    /// [`try_stage`](Self::try_stage) for a fallible version.
    pub fn stage(self, name: impl Into<String>, handler: impl StageHandler + 'static) -> Self {
        self.push_or_panic(name.into(), FailurePolicy::Fatal, Arc::new(handler))
    }

    /// Appends a soft-fail stage.
    ///
    /// # Panics
    ///
    /// Panics if a stage with the same name already exists.
    pub fn soft_fail_stage(
        self,
        name: impl Into<String>,
        handler: impl StageHandler + 'static,
    ) -> Self {
        self.push_or_panic(name.into(), FailurePolicy::SoftFail, Arc::new(handler))
    }

    /// Appends a stage with an explicit policy, returning an error on duplicate.
    pub fn try_stage(
        mut self,
        name: impl Into<String>,
        policy: FailurePolicy,
        handler: Arc<dyn StageHandler>,
    ) -> Result<Self> {
        let name = name.into();
        if self.stages.iter().any(|s| s.name == name) {
            return Err(JoblineError::DuplicateStage(name));
        }
        let ordinal = self.stages.len() as u32 + 1;
        self.stages.push(StageDescriptor {
            ordinal,
            label: name.clone(),
            name,
            policy,
            handler,
        });
        Ok(self)
    }

    /// Sets the human label of a stage. Validated at build time.
    pub fn label(mut self, stage: impl Into<String>, label: impl Into<String>) -> Self {
        self.labels.push((stage.into(), label.into()));
        self
    }

    /// Pauses jobs after `stage` when they run in confirmation mode.
    pub fn checkpoint(mut self, stage: impl Into<String>) -> Self {
        self.checkpoint = Some(stage.into());
        self
    }

    /// Makes jobs wait for submit-input before the first stage.
    pub fn requires_input(mut self) -> Self {
        self.requires_input = true;
        self
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// - [`JoblineError::InvalidPipeline`] if the pipeline has no stages, or
    ///   requires input without declaring a checkpoint
    /// - [`JoblineError::StageNotFound`] if a label or the checkpoint names
    ///   an unknown stage
    pub fn build(mut self) -> Result<Pipeline> {
        if self.stages.is_empty() {
            return Err(JoblineError::InvalidPipeline(
                "a pipeline needs at least one stage".to_string(),
            ));
        }

        let index: HashMap<String, usize> = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();

        for (stage, label) in std::mem::take(&mut self.labels) {
            let i = *index
                .get(&stage)
                .ok_or_else(|| JoblineError::StageNotFound(stage.clone()))?;
            self.stages[i].label = label;
        }

        let checkpoint = match &self.checkpoint {
            Some(name) => Some(
                *index
                    .get(name)
                    .ok_or_else(|| JoblineError::StageNotFound(name.clone()))?,
            ),
            None => None,
        };

        let shape = match (checkpoint, self.requires_input) {
            (None, true) => {
                return Err(JoblineError::InvalidPipeline(
                    "requires_input needs a checkpoint stage".to_string(),
                ))
            }
            (None, false) => PipelineShape::NonInteractive,
            (Some(_), requires_input) => PipelineShape::Interactive { requires_input },
        };

        Ok(Pipeline {
            stages: self.stages,
            checkpoint,
            shape,
        })
    }

    fn push_or_panic(
        self,
        name: String,
        policy: FailurePolicy,
        handler: Arc<dyn StageHandler>,
    ) -> Self {
        match self.try_stage(name, policy, handler) {
            Ok(builder) => builder,
            Err(e) => panic!("{e}"),
        }
    }
}
