//! Append-only audit trail of privileged mutations.

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::error::{PracticeError, Result};
use crate::models::{AuditAction, AuditEntry, Caller, EntityType};
use crate::store::{AuditFilter, AuditWrite, Page, PracticeStore, DEDUPE_KEY_FIELD};

pub const MAX_DESCRIPTION_LEN: usize = 1000;

pub fn entry(
    caller: &Caller,
    action: AuditAction,
    entity_type: EntityType,
    entity_id: impl Into<String>,
    description: impl Into<String>,
    metadata: Value,
) -> AuditEntry {
    AuditEntry {
        id: Uuid::new_v4(),
        actor_user_id: caller.user_id,
        action,
        entity_type,
        entity_id: entity_id.into(),
        description: description.into(),
        metadata: if metadata.is_null() { json!({}) } else { metadata },
        occurred_at: Utc::now(),
        request_origin: caller.origin.clone(),
    }
}

pub fn practice_entry(
    caller: &Caller,
    action: AuditAction,
    practice_id: Uuid,
    description: impl Into<String>,
    metadata: Value,
) -> AuditEntry {
    entry(
        caller,
        action,
        EntityType::Practice,
        practice_id.to_string(),
        description,
        metadata,
    )
}

fn validate(entry: &AuditEntry) -> Result<()> {
    if entry.entity_id.trim().is_empty() {
        return Err(PracticeError::validation("audit entry needs an entity id"));
    }
    if entry.description.trim().is_empty() || entry.description.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(PracticeError::validation(format!(
            "audit description must be 1-{MAX_DESCRIPTION_LEN} characters"
        )));
    }
    if !entry.metadata.is_object() {
        return Err(PracticeError::validation("audit metadata must be a key/value object"));
    }
    Ok(())
}

/// Standalone audit access for mutations that do not ride a lifecycle commit.
#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn PracticeStore>,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn PracticeStore>) -> Self {
        Self { store }
    }

    /// Persistence failures propagate; an audit gap is never swallowed.
    /// A notification attached to the write is queued only if the entry lands.
    pub async fn record(&self, write: impl Into<AuditWrite>) -> Result<()> {
        let write = write.into();
        validate(&write.entry)?;
        if let Some(dedupe) = &write.dedupe {
            if write.entry.metadata.get(DEDUPE_KEY_FIELD).and_then(Value::as_str) != Some(dedupe.key.as_str()) {
                return Err(PracticeError::Internal(format!(
                    "audit entry {} does not carry its dedupe key",
                    write.entry.id
                )));
            }
        }
        let (action, entity_id) = (write.entry.action, write.entry.entity_id.clone());
        let queued = write.notification.is_some();
        self.store.record_audit(write).await?;
        info!(action = %action, entity_id = %entity_id, queued, "audit entry recorded");
        Ok(())
    }

    pub async fn query(&self, filter: &AuditFilter, page: Page) -> Result<Vec<AuditEntry>> {
        if let (Some(from), Some(to)) = (filter.from, filter.to) {
            if from > to {
                return Err(PracticeError::validation("audit date range starts after it ends"));
            }
        }
        self.store.query_audit(filter, page.bounded()).await
    }
}
