// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow run and step result types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use crate::error::CoreError;
use crate::persistence::{RunRecord, StepResultRecord};

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Steps are being executed or a retry is pending.
    Running,
    /// Waiting for `resume`.
    Suspended,
    /// Every step succeeded.
    Success,
    /// A step failed permanently.
    Failed,
    /// Stopped by an operator.
    Canceled,
}

impl RunStatus {
    /// Stored representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Suspended => "suspended",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    /// True once no further step may execute.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "suspended" => Ok(Self::Suspended),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "canceled" => Ok(Self::Canceled),
            other => Err(CoreError::Serialization(format!(
                "unknown run status '{other}'"
            ))),
        }
    }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet succeeded; waiting for (another) attempt.
    Pending,
    /// Output memoized.
    Success,
    /// Failed permanently.
    Failed,
    /// Waiting for resume data.
    Suspended,
}

impl StepStatus {
    /// Stored representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Suspended => "suspended",
        }
    }
}

impl FromStr for StepStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "suspended" => Ok(Self::Suspended),
            other => Err(CoreError::Serialization(format!(
                "unknown step status '{other}'"
            ))),
        }
    }
}

/// Recorded outcome of a step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResult {
    /// Step identifier.
    pub step_id: String,
    /// Current status.
    pub status: StepStatus,
    /// Output (on success) or suspend payload (when suspended).
    pub output: Option<Value>,
    /// 1-indexed attempt number.
    pub attempt: u32,
    /// Last failure message.
    pub error: Option<String>,
}

impl TryFrom<StepResultRecord> for StepResult {
    type Error = CoreError;

    fn try_from(record: StepResultRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            step_id: record.step_id,
            status: record.status.parse()?,
            output: record
                .output
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()?,
            attempt: u32::try_from(record.attempt).unwrap_or(1),
            error: record.error,
        })
    }
}

/// A workflow run with its step results.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowRun {
    /// Run identifier.
    pub run_id: Uuid,
    /// Workflow executed.
    pub workflow_id: String,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Run input.
    pub input: Value,
    /// Final output once `Success`.
    pub output: Option<Value>,
    /// Failure or cancellation reason.
    pub error: Option<String>,
    /// Step the run waits at while `Suspended`.
    pub suspended_step_id: Option<String>,
    /// Payload the suspended step published.
    pub suspend_payload: Option<Value>,
    /// When the sweeper will retry a pending step.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Step results by step id.
    pub step_results: BTreeMap<String, StepResult>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last state change.
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    /// Assemble a run from its stored rows.
    pub fn from_records(
        record: RunRecord,
        steps: Vec<StepResultRecord>,
    ) -> Result<Self, CoreError> {
        let run_id = Uuid::parse_str(&record.run_id)
            .map_err(|e| CoreError::Serialization(format!("invalid run id: {e}")))?;
        let step_results = steps
            .into_iter()
            .map(|s| StepResult::try_from(s).map(|r| (r.step_id.clone(), r)))
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(Self {
            run_id,
            workflow_id: record.workflow_id,
            status: record.status.parse()?,
            input: serde_json::from_str(&record.input)?,
            output: record
                .output
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()?,
            error: record.error,
            suspended_step_id: record.suspended_step_id,
            suspend_payload: record
                .suspend_payload
                .as_deref()
                .map(serde_json::from_str::<Value>)
                .transpose()?,
            next_retry_at: record.next_retry_at,
            step_results,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    /// Memoized outputs of succeeded steps.
    pub fn outputs(&self) -> BTreeMap<String, Value> {
        self.step_results
            .values()
            .filter(|r| r.status == StepStatus::Success)
            .map(|r| (r.step_id.clone(), r.output.clone().unwrap_or(Value::Null)))
            .collect()
    }
}
