// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trigger registry.
//!
//! Holds the forwarding functions and cron triggers for the process lifetime.
//! The registry is built once at boot (registration takes `&mut self`) and
//! then shared read-only behind an `Arc`, so nothing can register after the
//! listeners start accepting traffic.
//!
//! Registration is idempotent: repeating a call with identical arguments is a
//! no-op, while a call that would change an existing binding fails with
//! [`RegistrationError::Conflict`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use croner::Cron;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connector;
use crate::retry::RetryPolicy;

/// Mount paths under this prefix are reserved for the internal listener.
pub const INTERNAL_PREFIX: &str = "/_internal";

/// Errors raised while registering triggers. All of them are fatal at boot.
#[derive(Debug, Error, PartialEq)]
#[non_exhaustive]
pub enum RegistrationError {
    /// Mount path has no connector segment.
    #[error("Mount path '{0}' is empty")]
    EmptyPath(String),

    /// Mount path collides with the internal route namespace.
    #[error("Mount path '{0}' is reserved")]
    ReservedPath(String),

    /// Same identifier registered again with different arguments.
    #[error("Conflicting registration for '{identifier}': {reason}")]
    Conflict {
        /// The identifier registered twice.
        identifier: String,
        /// What differs between the two registrations.
        reason: String,
    },

    /// Cron expression could not be parsed.
    #[error("Invalid schedule '{schedule}' for '{identifier}': {reason}")]
    InvalidSchedule {
        /// The cron trigger identifier.
        identifier: String,
        /// The rejected expression.
        schedule: String,
        /// Parser message.
        reason: String,
    },
}

/// What a mounted route starts.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerSpec {
    /// Workflow started for each delivery on this route.
    pub workflow_id: String,
    /// Retry policy for forwarding deliveries to the route.
    pub retry: RetryPolicy,
}

impl HandlerSpec {
    /// Start `workflow_id` with the default retry policy.
    pub fn new(workflow_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            retry: RetryPolicy::default(),
        }
    }

    /// Override the forwarding retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// A forwarding function: one per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct TriggerRegistration {
    /// `api-<connector>` or the cron identifier.
    pub identifier: String,
    /// Channel the function listens on.
    pub channel_name: String,
    /// Default forwarding target (the first mount path bound to the channel).
    pub target_path: String,
    /// Retry policy for deliveries on this channel.
    pub retry: RetryPolicy,
    /// Every mount path served by this function.
    pub mount_paths: Vec<String>,
}

impl TriggerRegistration {
    /// Target for an event, preferring the path the event arrived on.
    pub fn target_for(&self, event_path: Option<&str>) -> &str {
        event_path
            .and_then(|p| self.mount_paths.iter().find(|m| m.as_str() == p))
            .map(String::as_str)
            .unwrap_or(&self.target_path)
    }
}

/// Handle returned by [`TriggerRegistry::register_api_route`] describing
/// the concrete route to mount.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteHandle {
    /// Normalized mount path, always starting with `/`.
    pub mount_path: String,
    /// Channel the route publishes to.
    pub channel_name: String,
    /// Forwarding function serving the channel.
    pub function_id: String,
    /// What the route starts.
    pub handler: HandlerSpec,
}

/// A cron trigger bound to a workflow.
pub struct CronRegistration {
    /// Unique trigger identifier.
    pub identifier: String,
    /// Expression as registered.
    pub schedule: String,
    /// Workflow started on each tick.
    pub workflow_id: String,
    /// `event/cron.<identifier>`.
    pub channel_name: String,
    /// `/_internal/workflows/<workflow_id>/start`.
    pub target_path: String,
    cron: Cron,
}

impl CronRegistration {
    /// Next tick strictly after `after`.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.cron.find_next_occurrence(after, false).ok()
    }
}

impl fmt::Debug for CronRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CronRegistration")
            .field("identifier", &self.identifier)
            .field("schedule", &self.schedule)
            .field("workflow_id", &self.workflow_id)
            .field("channel_name", &self.channel_name)
            .finish()
    }
}

/// Internal target that starts a workflow by id.
pub fn workflow_start_path(workflow_id: &str) -> String {
    format!("{INTERNAL_PREFIX}/workflows/{workflow_id}/start")
}

/// Registry of forwarding functions, routes and cron triggers.
#[derive(Debug, Default)]
pub struct TriggerRegistry {
    functions: BTreeMap<String, TriggerRegistration>,
    routes: BTreeMap<String, RouteHandle>,
    crons: BTreeMap<String, CronRegistration>,
}

impl TriggerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a webhook mount path.
    ///
    /// The first route on a channel creates the `api-<connector>` forwarding
    /// function; later routes on the same channel join it and log a warning.
    pub fn register_api_route(
        &mut self,
        path: &str,
        handler: HandlerSpec,
    ) -> Result<RouteHandle, RegistrationError> {
        let mount_path = normalize_path(path);
        if mount_path == INTERNAL_PREFIX || mount_path.starts_with(&format!("{INTERNAL_PREFIX}/"))
        {
            return Err(RegistrationError::ReservedPath(mount_path));
        }
        let connector = connector::resolve(&mount_path)
            .ok_or_else(|| RegistrationError::EmptyPath(path.to_string()))?;
        let channel_name = connector::channel_name(connector);
        let function_id = connector::function_identifier(connector);

        if let Some(existing) = self.routes.get(&mount_path) {
            if existing.handler == handler {
                debug!(mount_path = %mount_path, "Route already registered");
                return Ok(existing.clone());
            }
            return Err(RegistrationError::Conflict {
                identifier: mount_path,
                reason: format!(
                    "already bound to workflow '{}' with a different handler",
                    existing.handler.workflow_id
                ),
            });
        }

        if self.crons.contains_key(&function_id) {
            return Err(RegistrationError::Conflict {
                identifier: function_id,
                reason: "identifier already used by a cron trigger".to_string(),
            });
        }

        match self.functions.get_mut(&channel_name) {
            Some(function) => {
                // Deliveries on a channel use one policy; a second one would be ignored
                if function.retry != handler.retry {
                    return Err(RegistrationError::Conflict {
                        identifier: function.identifier.clone(),
                        reason: format!(
                            "mount path '{mount_path}' joins channel '{channel_name}' with a \
                             different retry policy ({:?} vs {:?})",
                            handler.retry, function.retry
                        ),
                    });
                }
                warn!(
                    channel = %channel_name,
                    function_id = %function.identifier,
                    existing_paths = ?function.mount_paths,
                    mount_path = %mount_path,
                    "Mount path shares a channel with another route; one forwarding function serves both"
                );
                function.mount_paths.push(mount_path.clone());
            }
            None => {
                info!(
                    channel = %channel_name,
                    function_id = %function_id,
                    mount_path = %mount_path,
                    "Registered forwarding function"
                );
                self.functions.insert(
                    channel_name.clone(),
                    TriggerRegistration {
                        identifier: function_id.clone(),
                        channel_name: channel_name.clone(),
                        target_path: mount_path.clone(),
                        retry: handler.retry.clone(),
                        mount_paths: vec![mount_path.clone()],
                    },
                );
            }
        }

        let handle = RouteHandle {
            mount_path: mount_path.clone(),
            channel_name,
            function_id,
            handler,
        };
        self.routes.insert(mount_path, handle.clone());
        Ok(handle)
    }

    /// Register a cron trigger that starts `workflow_id` on `schedule`.
    ///
    /// Accepts 5-field expressions and 6-field expressions with seconds.
    pub fn register_cron_trigger(
        &mut self,
        identifier: &str,
        schedule: &str,
        workflow_id: &str,
        retry: RetryPolicy,
    ) -> Result<&CronRegistration, RegistrationError> {
        if let Some(existing) = self.crons.get(identifier) {
            if existing.schedule != schedule || existing.workflow_id != workflow_id {
                return Err(RegistrationError::Conflict {
                    identifier: identifier.to_string(),
                    reason: format!(
                        "already scheduled as '{}' for workflow '{}'",
                        existing.schedule, existing.workflow_id
                    ),
                });
            }
            if let Some(function) = self.functions.get(&existing.channel_name)
                && function.retry != retry
            {
                return Err(RegistrationError::Conflict {
                    identifier: identifier.to_string(),
                    reason: format!(
                        "already registered with retry policy {:?}",
                        function.retry
                    ),
                });
            }
            debug!(identifier, "Cron trigger already registered");
            return Ok(&self.crons[identifier]);
        }
        if self.functions.values().any(|f| f.identifier == identifier) {
            return Err(RegistrationError::Conflict {
                identifier: identifier.to_string(),
                reason: "identifier already used by a forwarding function".to_string(),
            });
        }

        let cron = Cron::new(schedule)
            .with_seconds_optional()
            .parse()
            .map_err(|e| RegistrationError::InvalidSchedule {
                identifier: identifier.to_string(),
                schedule: schedule.to_string(),
                reason: e.to_string(),
            })?;

        let channel_name = format!("event/cron.{identifier}");
        let target_path = workflow_start_path(workflow_id);
        self.functions.insert(
            channel_name.clone(),
            TriggerRegistration {
                identifier: identifier.to_string(),
                channel_name: channel_name.clone(),
                target_path: target_path.clone(),
                retry,
                mount_paths: Vec::new(),
            },
        );
        info!(identifier, schedule, workflow_id, "Registered cron trigger");
        self.crons.insert(
            identifier.to_string(),
            CronRegistration {
                identifier: identifier.to_string(),
                schedule: schedule.to_string(),
                workflow_id: workflow_id.to_string(),
                channel_name,
                target_path,
                cron,
            },
        );
        Ok(&self.crons[identifier])
    }

    /// Forwarding function listening on a channel.
    pub fn function(&self, channel_name: &str) -> Option<&TriggerRegistration> {
        self.functions.get(channel_name)
    }

    /// All forwarding functions, ordered by channel.
    pub fn functions(&self) -> impl Iterator<Item = &TriggerRegistration> {
        self.functions.values()
    }

    /// Route bound to a mount path.
    pub fn route(&self, mount_path: &str) -> Option<&RouteHandle> {
        self.routes.get(mount_path)
    }

    /// All routes, ordered by mount path.
    pub fn routes(&self) -> impl Iterator<Item = &RouteHandle> {
        self.routes.values()
    }

    /// Cron trigger by identifier.
    pub fn cron(&self, identifier: &str) -> Option<&CronRegistration> {
        self.crons.get(identifier)
    }

    /// All cron triggers, ordered by identifier.
    pub fn crons(&self) -> impl Iterator<Item = &CronRegistration> {
        self.crons.values()
    }
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}
