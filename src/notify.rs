use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientKind {
    Student,
    Supervisor,
    Coordinator,
}

impl RecipientKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RecipientKind::Student => "student",
            RecipientKind::Supervisor => "supervisor",
            RecipientKind::Coordinator => "coordinator",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub practice_id: Uuid,
    pub recipient_kind: RecipientKind,
    pub recipient_id: i64,
    pub subject: String,
    pub body: String,
}

/// Delivery is external; implementations only hand the message off.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<()>;
}
