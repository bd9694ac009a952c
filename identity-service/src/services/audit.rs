//! Security audit events.
//!
//! The core emits events and never reads them back. Sinks must not block the
//! caller; slow sinks should hand events off to a background task.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    /// A used authorization code was presented again
    CodeReplayDetected,
    /// A consumed refresh token was presented again
    RefreshReuseDetected,
    /// Refresh token presented from a different client fingerprint
    BindingAnomaly,
    FamilyRevoked,
    SessionsRevoked,
    TokenRevoked,
    /// Attempt to attach another organization's permission to a role
    CrossOrganizationAssignmentRejected,
    RateLimited,
    LoginFailed,
    ApiKeyIssued,
    ApiKeyRevoked,
}

impl AuditEventKind {
    pub fn severity(&self) -> &'static str {
        match self {
            AuditEventKind::CodeReplayDetected
            | AuditEventKind::RefreshReuseDetected
            | AuditEventKind::CrossOrganizationAssignmentRejected => "critical",
            AuditEventKind::BindingAnomaly
            | AuditEventKind::RateLimited
            | AuditEventKind::LoginFailed => "warning",
            _ => "info",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub kind: AuditEventKind,
    pub user_id: Option<Uuid>,
    pub organization_id: Option<Uuid>,
    pub family_id: Option<Uuid>,
    pub client_id: Option<String>,
    pub details: String,
    pub occurred_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn new(kind: AuditEventKind, details: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            user_id: None,
            organization_id: None,
            family_id: None,
            client_id: None,
            details: details.into(),
            occurred_at: Utc::now(),
        }
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn organization(mut self, organization_id: Uuid) -> Self {
        self.organization_id = Some(organization_id);
        self
    }

    pub fn family(mut self, family_id: Uuid) -> Self {
        self.family_id = Some(family_id);
        self
    }

    pub fn client(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }
}

pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes events to the structured log under the `audit` target.
#[derive(Debug, Default, Clone)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        let user_id = event.user_id.map(|id| id.to_string()).unwrap_or_default();
        let organization_id = event
            .organization_id
            .map(|id| id.to_string())
            .unwrap_or_default();
        let family_id = event.family_id.map(|id| id.to_string()).unwrap_or_default();
        let client_id = event.client_id.as_deref().unwrap_or_default();

        match event.kind.severity() {
            "critical" | "warning" => tracing::warn!(
                target: "audit",
                event_id = %event.id,
                event_type = ?event.kind,
                severity = event.kind.severity(),
                user_id = %user_id,
                organization_id = %organization_id,
                family_id = %family_id,
                client_id = %client_id,
                details = %event.details,
                "Security event"
            ),
            _ => tracing::info!(
                target: "audit",
                event_id = %event.id,
                event_type = ?event.kind,
                user_id = %user_id,
                organization_id = %organization_id,
                family_id = %family_id,
                client_id = %client_id,
                details = %event.details,
                "Audit event"
            ),
        }
    }
}

/// Keeps events in memory so tests can assert on them.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, kind: AuditEventKind) -> usize {
        self.events().iter().filter(|e| e.kind == kind).count()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
