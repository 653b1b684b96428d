// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the switchyard server.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use switchyard_core::ExecutionMode;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// `sqlite:` or `postgres://` URL.
    pub database_url: String,
    /// Public webhook listener (all interfaces).
    pub public_addr: SocketAddr,
    /// Loopback listener for workflow-start handlers and run management.
    pub internal_addr: SocketAddr,
    /// Retry profile.
    pub mode: ExecutionMode,
    /// Database pool size.
    pub max_connections: u32,
    /// Wall-clock bound per step.
    pub step_timeout: Duration,
    /// HTTP timeout for forwarding calls.
    pub forward_timeout: Duration,
    /// Retry sweeper poll interval.
    pub retry_poll_interval: Duration,
    /// Notifications are POSTed here when set, logged otherwise.
    pub notify_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("SWITCHYARD_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("SWITCHYARD_DATABASE_URL"))?;

        let port: u16 = parse_var("SWITCHYARD_PORT", 8080)?;
        let internal_port: u16 = parse_var("SWITCHYARD_INTERNAL_PORT", 8081)?;
        if port == internal_port {
            return Err(ConfigError::Invalid(
                "SWITCHYARD_INTERNAL_PORT",
                "must differ from SWITCHYARD_PORT".to_string(),
            ));
        }

        let mode = match std::env::var("SWITCHYARD_MODE") {
            Ok(raw) => ExecutionMode::from_str(&raw)
                .map_err(|reason| ConfigError::Invalid("SWITCHYARD_MODE", reason))?,
            Err(_) => ExecutionMode::Production,
        };

        let max_connections: u32 = parse_var("SWITCHYARD_MAX_CONNECTIONS", 10)?;
        if max_connections == 0 {
            return Err(ConfigError::Invalid(
                "SWITCHYARD_MAX_CONNECTIONS",
                "must be at least 1".to_string(),
            ));
        }

        let notify_url = std::env::var("SWITCHYARD_NOTIFY_URL")
            .ok()
            .filter(|u| !u.trim().is_empty());

        Ok(Self {
            database_url,
            public_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            internal_addr: SocketAddr::from(([127, 0, 0, 1], internal_port)),
            mode,
            max_connections,
            step_timeout: Duration::from_secs(parse_var("SWITCHYARD_STEP_TIMEOUT_SECS", 300)?),
            forward_timeout: Duration::from_secs(parse_var("SWITCHYARD_FORWARD_TIMEOUT_SECS", 30)?),
            retry_poll_interval: Duration::from_secs(parse_var("SWITCHYARD_RETRY_POLL_SECS", 5)?),
            notify_url,
        })
    }

    /// Base URL the forwarder calls, e.g. `http://127.0.0.1:8081`.
    pub fn internal_base_url(&self) -> String {
        format!("http://{}", self.internal_addr)
    }
}

fn parse_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::Invalid(name, format!("'{raw}': {e}"))),
        Err(_) => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    /// An environment variable holds an unusable value.
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}
