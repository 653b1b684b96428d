// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Switchyard Server - HTTP boundary
//!
//! Runs two listeners over one [`switchyard_core::StepRuntime`]:
//!
//! ```text
//!  webhook senders                        loopback only
//!        │ ▲ 202 / 503                          ▲
//!        ▼ │                                    │ forward (run-id header)
//! ┌──────────────────┐   deliver   ┌────────────┴─────┐   ┌──────────────┐
//! │ public listener  │────────────►│ dispatcher       │◄──│ delivery     │
//! │ /health          │             │ + forwarder      │   │ queue (cron, │
//! │ <mount paths>    │             └──────────────────┘   │ injected)    │
//! └──────────────────┘                      │             └──────────────┘
//!                                           ▼
//!                              ┌──────────────────────────┐
//!                              │ internal listener        │
//!                              │ <mount paths> → start    │
//!                              │ /_internal/workflows/... │
//!                              │ /_internal/runs/...      │
//!                              │ /_internal/events        │
//!                              └──────────────────────────┘
//! ```
//!
//! A webhook is acknowledged only after the start handler accepted it.
//!
//! Cron schedules and the retry sweeper run as background tasks next to the
//! listeners and stop on the same shutdown signal.

#![deny(missing_docs)]

/// Environment configuration.
pub mod config;
/// HTTP error mapping.
pub mod error;
/// Notification channels.
pub mod notify;
/// Routers and handlers.
pub mod routes;
/// Reference workflows and trigger registration.
pub mod workflows;

pub use config::{Config, ConfigError};
pub use error::AppError;
pub use routes::{AppState, build_internal_router, build_public_router};
