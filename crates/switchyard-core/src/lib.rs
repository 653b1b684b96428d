// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Switchyard Core - Trigger Routing & Durable Execution
//!
//! This crate turns inbound events (webhook payloads and cron ticks) into
//! durable workflow runs. It resolves events to channels, forwards them to
//! workflow-start handlers with retry and error classification, and executes
//! runs step by step with memoized outputs so a redelivered trigger resumes
//! where the previous attempt stopped.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────┐      ┌────────────────────┐
//! │  Inbound webhook   │      │    Cron source     │
//! │  (mount path)      │      │  (croner ticks)    │
//! └────────────────────┘      └────────────────────┘
//!           │ connector                  │ create_run + run id
//!           ▼                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Delivery queue                       │
//! │          (bounded mpsc, at-least-once redelivery)       │
//! └─────────────────────────────────────────────────────────┘
//!           │
//!           ▼
//! ┌───────────────────────┐  lookup   ┌────────────────────────┐
//! │   Event dispatcher    │──────────►│    Trigger registry    │
//! │   + EventForwarder    │           │ channel -> function    │
//! └───────────────────────┘           └────────────────────────┘
//!           │ HTTP (loopback)
//!           ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │        Workflow-start handler (server crate)            │
//! └─────────────────────────────────────────────────────────┘
//!           │
//!           ▼
//! ┌───────────────────────┐           ┌────────────────────────┐
//! │     Step runtime      │◄──────────│     Retry sweeper      │
//! │  memoized step results│           │   (next_retry_at due)  │
//! └───────────────────────┘           └────────────────────────┘
//!           │
//!           ▼
//! ┌───────────────────────┐
//! │  SQLite / PostgreSQL  │
//! │  runs, steps, events, │
//! │  alert dedup keys     │
//! └───────────────────────┘
//! ```
//!
//! # Run Status State Machine
//!
//! ```text
//!                 ┌──────────► success
//!                 │
//! create ──► running ──► suspended ──(resume)──► running
//!                 │
//!                 ├──────────► failed
//!                 │
//!                 └──(cancel)─► canceled
//! ```
//!
//! `success`, `failed` and `canceled` are terminal: nothing writes a terminal
//! run again, and `advance` or `resume` on one fails with
//! [`CoreError::RunTerminal`].
//!
//! # Step Memoization
//!
//! | Stored step status | On the next `advance` |
//! |--------------------|-----------------------|
//! | `success` | skipped, stored output reused |
//! | `pending` | executed with the stored attempt number (and resume data, if any) |
//! | `suspended` | run waits for `resume` |
//! | `failed` | run is terminal |
//!
//! # Modules
//!
//! - [`registry`] / [`connector`]: boot-time trigger registration
//! - [`forwarder`] / [`delivery`]: HTTP forwarding and the delivery queue
//! - [`runtime`] / [`workflow`] / [`run`]: step execution
//! - [`cron`] / [`retry_sweeper`]: background sources
//! - [`alerts`]: effectively-once threshold notifications
//! - [`persistence`]: storage backends

#![deny(missing_docs)]

/// Threshold alerts deduplicated per subject, category, period and threshold.
pub mod alerts;

/// Connector name resolution from mount paths.
pub mod connector;

/// Cron trigger source and manual test event.
pub mod cron;

/// Delivery queue and event dispatcher.
pub mod delivery;

/// Error types with stable error codes.
pub mod error;

/// Inbound events and the HTTP forwarder.
pub mod forwarder;

/// Embedded database migrations.
pub mod migrations;

/// Persistence trait with SQLite and PostgreSQL backends.
pub mod persistence;

/// Boot-time registration of API routes and cron triggers.
pub mod registry;

/// Retry policies and error classification.
pub mod retry;

/// Background task advancing runs whose retry is due.
pub mod retry_sweeper;

/// Run and step status types.
pub mod run;

/// The step execution runtime.
pub mod runtime;

/// Workflow definitions, steps and the workflow catalog.
pub mod workflow;

pub use alerts::{AlertDispatcher, AlertEvaluation, AlertOutcome, NotificationChannel};
pub use cron::{CronSource, FireSource};
pub use delivery::{DeliveryQueue, EventDispatcher};
pub use error::{CoreError, Result};
pub use forwarder::{DeliveryError, EventForwarder, InboundEvent, RUN_ID_HEADER};
pub use persistence::Persistence;
pub use registry::{HandlerSpec, RegistrationError, TriggerRegistry};
pub use retry::{ErrorClass, ExecutionMode, RetryPolicy};
pub use retry_sweeper::{RetrySweeper, RetrySweeperConfig};
pub use run::{RunStatus, StepStatus, WorkflowRun};
pub use runtime::{AdvanceOutcome, StepRuntime, StepRuntimeConfig};
pub use workflow::{
    FailureHook, RunFailure, StepContext, StepDescriptor, StepError, StepHandler, StepOutcome,
    Workflow, WorkflowCatalog, step_fn,
};
