use log::{error, info, warn};

use crate::{
    error::Result,
    model::audit::{AuditEvent, AuditEventType, AuditFilter},
};

use super::Context;

/// Append-only log of security relevant events.
///
/// Recording never fails the operation being audited: a write that fails
/// twice is logged at `error` instead.
#[derive(Clone)]
pub struct AuditLog {
    ctx: Context,
}

impl AuditLog {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Build an event stamped with the current time.
    pub fn event(
        &self,
        event_type: AuditEventType,
        actor: impl Into<String>,
        subject: impl Into<String>,
        detail: impl Into<String>,
    ) -> AuditEvent {
        AuditEvent {
            ts: self.ctx.now(),
            event_type,
            actor: actor.into(),
            subject: subject.into(),
            detail: detail.into(),
            block_index: None,
        }
    }

    pub async fn record(&self, event: AuditEvent) {
        let line = format!(
            "audit {} actor={} subject={} {}",
            event.event_type.as_str(),
            event.actor,
            event.subject,
            event.detail
        );
        match event.event_type {
            AuditEventType::IntegrityViolation => error!("{line}"),
            AuditEventType::BallotRejected | AuditEventType::ElectionSuspended => warn!("{line}"),
            _ => info!("{line}"),
        }

        if let Err(first) = self.ctx.store.append_audit(&event).await {
            warn!("Audit write failed, retrying: {first}");
            if let Err(e) = self.ctx.store.append_audit(&event).await {
                error!("Audit event lost ({line}): {e}");
            }
        }
    }

    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEvent>> {
        self.ctx.store.query_audit(filter).await
    }
}
