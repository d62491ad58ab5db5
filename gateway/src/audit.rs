//! Audit trail for edge security decisions.
//!
//! Every rejection by the filter chain and every administrative blacklist
//! change is emitted on the `audit` tracing target and kept in a bounded
//! in-memory buffer for inspection.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    /// Missing, malformed, or invalid credential
    AuthFailure,
    /// Valid credential without the role the path needs
    AccessDenied,
    /// Request from a blacklisted IP or user
    Blacklisted,
    RateLimited,
    /// Request admitted because the shared store did not answer
    StoreFailOpen,
    /// Request refused because the shared store did not answer
    StoreFailClosed,
    BlacklistAdd,
    BlacklistRemove,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuditOutcome {
    Success,
    Failure,
    Denied,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub outcome: AuditOutcome,
    /// User id, client IP, or "anonymous"
    pub actor: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    /// Request path or blacklist key
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, outcome: AuditOutcome, actor: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            action,
            outcome,
            actor: actor.into(),
            request_id: None,
            client_ip: None,
            resource: None,
            details: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_client_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Clone)]
pub struct AuditLogger {
    events: Arc<RwLock<VecDeque<AuditEvent>>>,
    max_events: usize,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl AuditLogger {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(VecDeque::with_capacity(max_events))),
            max_events,
        }
    }

    pub async fn log(&self, event: AuditEvent) {
        tracing::info!(
            target: "audit",
            event_id = %event.id,
            action = ?event.action,
            outcome = ?event.outcome,
            actor = %event.actor,
            request_id = ?event.request_id,
            client_ip = ?event.client_ip,
            resource = ?event.resource,
            details = ?event.details,
            "audit_event"
        );

        let mut events = self.events.write().await;
        if events.len() >= self.max_events {
            events.pop_front();
        }
        events.push_back(event);
    }

    /// Most recent first.
    pub async fn get_recent(&self, limit: usize) -> Vec<AuditEvent> {
        let events = self.events.read().await;
        events.iter().rev().take(limit).cloned().collect()
    }

    pub async fn get_by_action(&self, action: AuditAction, limit: usize) -> Vec<AuditEvent> {
        let events = self.events.read().await;
        events
            .iter()
            .rev()
            .filter(|e| e.action == action)
            .take(limit)
            .cloned()
            .collect()
    }
}
