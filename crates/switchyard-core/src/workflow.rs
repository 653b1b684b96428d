// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow definitions.
//!
//! A [`Workflow`] is an explicit, ordered list of [`StepDescriptor`]s built
//! with [`WorkflowBuilder`]. Each descriptor owns its handler, retry policy,
//! timeout and resume schema. Steps may name predecessors; by default a step
//! depends on the step declared before it, so a plain list is a linear chain.
//!
//! ```ignore
//! let workflow = Workflow::builder("expense")
//!     .step(StepDescriptor::new("validate", step_fn(validate)))
//!     .step(StepDescriptor::new("persist", step_fn(persist)))
//!     .step(StepDescriptor::new("notify", step_fn(notify)))
//!     .build()?;
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::error::CoreError;
use crate::retry::{ErrorClass, RetryPolicy};

/// Error code used when a step exceeds its wall-clock bound.
pub const STEP_TIMEOUT_CODE: &str = "STEP_TIMEOUT";

/// Code of the error recorded when a step panics.
pub const STEP_PANICKED_CODE: &str = "STEP_PANICKED";

/// What a step asks the runtime to do next.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Step finished; the value is memoized as its output.
    Complete(Value),
    /// Step needs external input. The value is stored as the suspend payload
    /// and handed to whoever resumes the run.
    Suspend(Value),
}

/// Failure raised by a step.
#[derive(Debug, Clone, Error, PartialEq, Serialize)]
#[error("{code}: {message}")]
pub struct StepError {
    /// Machine-readable code, matched against `RetryPolicy::permanent_codes`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Class reported by the step.
    pub class: ErrorClass,
}

impl StepError {
    /// A failure that may succeed on a later attempt.
    pub fn transient(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            class: ErrorClass::Retriable,
        }
    }

    /// A failure retrying cannot fix.
    pub fn permanent(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            class: ErrorClass::NonRetriable,
        }
    }

    /// The step ran past its wall-clock bound.
    pub fn timeout(after: Duration) -> Self {
        Self::transient(
            STEP_TIMEOUT_CODE,
            format!("step timed out after {}ms", after.as_millis()),
        )
    }

    /// The step panicked. Retriable: the panic may depend on the input
    /// of this attempt.
    pub fn panicked(message: impl Into<String>) -> Self {
        Self::transient(STEP_PANICKED_CODE, message)
    }
}

/// Everything a step sees when it runs.
#[derive(Debug, Clone)]
pub struct StepContext {
    /// Run being advanced.
    pub run_id: Uuid,
    /// Workflow the run belongs to.
    pub workflow_id: String,
    /// This step.
    pub step_id: String,
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Input computed from predecessors (resume data merged in on resume).
    pub input: Value,
    /// Input the run was created with.
    pub run_input: Value,
    /// Resume data, when this execution follows a resume.
    pub resume: Option<Value>,
    /// Memoized outputs of steps that already succeeded.
    pub outputs: BTreeMap<String, Value>,
}

impl StepContext {
    /// Output of an earlier step.
    pub fn output_of(&self, step_id: &str) -> Option<&Value> {
        self.outputs.get(step_id)
    }
}

/// Executable logic of one step.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Run the step.
    async fn execute(&self, ctx: StepContext) -> Result<StepOutcome, StepError>;
}

/// Adapter turning an async closure into a [`StepHandler`].
pub struct FnStep<F>(F);

/// Wrap an async function or closure as a step handler.
pub fn step_fn<F, Fut>(f: F) -> FnStep<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutcome, StepError>> + Send + 'static,
{
    FnStep(f)
}

#[async_trait]
impl<F, Fut> StepHandler for FnStep<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StepOutcome, StepError>> + Send + 'static,
{
    async fn execute(&self, ctx: StepContext) -> Result<StepOutcome, StepError> {
        (self.0)(ctx).await
    }
}

/// Details handed to a [`FailureHook`] when a run fails permanently.
#[derive(Debug, Clone)]
pub struct RunFailure {
    /// Failed run.
    pub run_id: Uuid,
    /// Its workflow.
    pub workflow_id: String,
    /// Step whose failure ended the run.
    pub step_id: String,
    /// The final error.
    pub error: StepError,
    /// Input the run was created with.
    pub run_input: Value,
}

/// Called once when a run transitions to `Failed`.
#[async_trait]
pub trait FailureHook: Send + Sync {
    /// React to a permanent failure, typically by notifying the user.
    async fn on_failure(&self, failure: &RunFailure);
}

/// One step of a workflow.
pub struct StepDescriptor {
    id: String,
    handler: Arc<dyn StepHandler>,
    retry: Option<RetryPolicy>,
    timeout: Option<Duration>,
    resume_schema: Option<Arc<jsonschema::Validator>>,
    resume_schema_source: Option<Value>,
    after: Option<Vec<String>>,
}

impl StepDescriptor {
    /// Create a descriptor with inherited retry and timeout settings.
    pub fn new(id: impl Into<String>, handler: impl StepHandler + 'static) -> Self {
        Self {
            id: id.into(),
            handler: Arc::new(handler),
            retry: None,
            timeout: None,
            resume_schema: None,
            resume_schema_source: None,
            after: None,
        }
    }

    /// Step-specific retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Step-specific wall-clock bound.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// JSON Schema resume data must satisfy. Compiled at build time.
    pub fn with_resume_schema(mut self, schema: Value) -> Self {
        self.resume_schema_source = Some(schema);
        self
    }

    /// Explicit predecessors. An empty list makes this a root step.
    pub fn after<I, S>(mut self, predecessors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.after = Some(predecessors.into_iter().map(Into::into).collect());
        self
    }

    /// Step identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Handler to execute.
    pub fn handler(&self) -> &Arc<dyn StepHandler> {
        &self.handler
    }

    /// Step-specific retry policy, if any.
    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// Step-specific timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Resolved predecessors. Only meaningful once the workflow is built.
    pub fn predecessors(&self) -> &[String] {
        self.after.as_deref().unwrap_or(&[])
    }

    /// Check resume data against the resume schema.
    ///
    /// Steps without a schema accept anything.
    pub fn validate_resume(&self, data: &Value) -> Result<(), String> {
        let Some(validator) = &self.resume_schema else {
            return Ok(());
        };
        let errors: Vec<String> = validator
            .iter_errors(data)
            .map(|e| {
                let at = e.instance_path.to_string();
                if at.is_empty() {
                    e.to_string()
                } else {
                    format!("{at}: {e}")
                }
            })
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

impl fmt::Debug for StepDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepDescriptor")
            .field("id", &self.id)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("resume_schema", &self.resume_schema_source)
            .field("after", &self.after)
            .finish_non_exhaustive()
    }
}

/// A validated workflow definition.
pub struct Workflow {
    id: String,
    steps: Vec<StepDescriptor>,
    retry: Option<RetryPolicy>,
    on_failure: Option<Arc<dyn FailureHook>>,
}

impl Workflow {
    /// Start building a workflow.
    pub fn builder(id: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder {
            id: id.into(),
            steps: Vec::new(),
            retry: None,
            on_failure: None,
        }
    }

    /// Workflow identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Steps in declared (topological) order.
    pub fn steps(&self) -> &[StepDescriptor] {
        &self.steps
    }

    /// Step by id.
    pub fn step(&self, step_id: &str) -> Option<&StepDescriptor> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Workflow-wide retry policy, if set.
    pub fn retry(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// Hook invoked on permanent failure.
    pub fn failure_hook(&self) -> Option<&Arc<dyn FailureHook>> {
        self.on_failure.as_ref()
    }

    /// Input for a step given the run input and the memoized outputs.
    ///
    /// Root steps get the run input, a single predecessor hands over its
    /// output, several predecessors are collected into an object keyed by id.
    pub fn input_for(
        &self,
        step: &StepDescriptor,
        run_input: &Value,
        outputs: &BTreeMap<String, Value>,
    ) -> Value {
        match step.predecessors() {
            [] => run_input.clone(),
            [only] => outputs.get(only).cloned().unwrap_or(Value::Null),
            many => Value::Object(
                many.iter()
                    .map(|p| (p.clone(), outputs.get(p).cloned().unwrap_or(Value::Null)))
                    .collect(),
            ),
        }
    }
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("id", &self.id)
            .field("steps", &self.steps)
            .field("retry", &self.retry)
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

/// Merge resume data into a step input.
///
/// Two objects are merged with resume keys winning. Anything else becomes
/// `{"input": <input>, "resume": <data>}`.
pub fn merge_resume(input: Value, resume: &Value) -> Value {
    match (input, resume) {
        (Value::Object(mut base), Value::Object(extra)) => {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
            Value::Object(base)
        }
        (input, resume) => {
            let mut wrapped = Map::new();
            wrapped.insert("input".to_string(), input);
            wrapped.insert("resume".to_string(), resume.clone());
            Value::Object(wrapped)
        }
    }
}

/// Builder for [`Workflow`].
pub struct WorkflowBuilder {
    id: String,
    steps: Vec<StepDescriptor>,
    retry: Option<RetryPolicy>,
    on_failure: Option<Arc<dyn FailureHook>>,
}

impl WorkflowBuilder {
    /// Append a step.
    pub fn step(mut self, step: StepDescriptor) -> Self {
        self.steps.push(step);
        self
    }

    /// Retry policy for steps without their own.
    pub fn default_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Hook called when a run fails permanently.
    pub fn on_failure(mut self, hook: impl FailureHook + 'static) -> Self {
        self.on_failure = Some(Arc::new(hook));
        self
    }

    /// Validate and build.
    ///
    /// Rejects empty workflows, duplicate step ids, predecessors that are not
    /// declared earlier and resume schemas that do not compile.
    pub fn build(self) -> Result<Workflow, CoreError> {
        let invalid = |reason: String| CoreError::InvalidWorkflow {
            workflow_id: self.id.clone(),
            reason,
        };
        if self.id.trim().is_empty() {
            return Err(invalid("workflow id is empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(invalid("workflow has no steps".to_string()));
        }

        let mut seen: HashSet<String> = HashSet::new();
        let mut previous: Option<String> = None;
        let mut steps = Vec::with_capacity(self.steps.len());
        for mut step in self.steps {
            if step.id.trim().is_empty() {
                return Err(invalid("step id is empty".to_string()));
            }
            if seen.contains(&step.id) {
                return Err(invalid(format!("duplicate step id '{}'", step.id)));
            }
            let predecessors = match step.after.take() {
                Some(explicit) => explicit,
                None => previous.iter().cloned().collect(),
            };
            if let Some(unknown) = predecessors.iter().find(|p| !seen.contains(*p)) {
                return Err(invalid(format!(
                    "step '{}' depends on '{}', which is not declared before it",
                    step.id, unknown
                )));
            }
            step.after = Some(predecessors);

            if let Some(schema) = &step.resume_schema_source {
                let validator = jsonschema::validator_for(schema).map_err(|e| {
                    invalid(format!("resume schema of step '{}': {}", step.id, e))
                })?;
                step.resume_schema = Some(Arc::new(validator));
            }

            seen.insert(step.id.clone());
            previous = Some(step.id.clone());
            steps.push(step);
        }

        Ok(Workflow {
            id: self.id,
            steps,
            retry: self.retry,
            on_failure: self.on_failure,
        })
    }
}

/// Workflows known to the runtime, by id.
#[derive(Debug, Default)]
pub struct WorkflowCatalog {
    workflows: HashMap<String, Arc<Workflow>>,
}

impl WorkflowCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a workflow. Ids must be unique.
    pub fn register(&mut self, workflow: Workflow) -> Result<(), CoreError> {
        if self.workflows.contains_key(workflow.id()) {
            return Err(CoreError::DuplicateWorkflow {
                workflow_id: workflow.id().to_string(),
            });
        }
        self.workflows
            .insert(workflow.id().to_string(), Arc::new(workflow));
        Ok(())
    }

    /// Workflow by id.
    pub fn get(&self, workflow_id: &str) -> Option<Arc<Workflow>> {
        self.workflows.get(workflow_id).cloned()
    }

    /// Whether a workflow is registered.
    pub fn contains(&self, workflow_id: &str) -> bool {
        self.workflows.contains_key(workflow_id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.workflows.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}
