// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Connector name resolution.
//!
//! A mount path such as `/api/github/events` maps to the connector `github`
//! and the event channel `event/api.webhooks.github.action`. Only the first
//! segment after an optional `api/` prefix counts, so `/webhooks/slack/action`
//! and `/webhooks/telegram/action` share the connector `webhooks`.

/// Prefix segment dropped before picking the connector.
const API_PREFIX: &str = "api/";

/// Resolve the connector name for a mount path.
///
/// Returns `None` when nothing is left after stripping, which callers treat
/// as an invalid mount path.
pub fn resolve(path: &str) -> Option<&str> {
    let trimmed = path.trim_start_matches('/');
    let trimmed = trimmed.strip_prefix(API_PREFIX).unwrap_or(trimmed);
    trimmed.split('/').next().filter(|segment| !segment.is_empty())
}

/// Channel name carrying events for a connector.
pub fn channel_name(connector: &str) -> String {
    format!("event/api.webhooks.{connector}.action")
}

/// Identifier of the forwarding function that serves a connector.
pub fn function_identifier(connector: &str) -> String {
    format!("api-{connector}")
}

/// Resolve a mount path straight to its channel name.
pub fn channel_for_path(path: &str) -> Option<String> {
    resolve(path).map(channel_name)
}
