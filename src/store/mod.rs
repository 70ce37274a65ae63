//! Record store abstraction.
//!
//! The lifecycle controller never writes piecemeal: each operation builds a
//! [`Commit`] that the backend applies atomically, so a practice transition,
//! its evaluation or final record, and its audit entry land together or not
//! at all.

#[cfg(test)]
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Account, AuditAction, AuditEntry, EmployerEvaluation, EntityType, ExportRow, FinalRecord,
    Practice, PracticeState, ReportEvaluation, WeightPolicy,
};
use crate::notify::Notification;

pub const DEFAULT_PAGE_SIZE: usize = 25;
pub const MAX_PAGE_SIZE: usize = 100;

/// Metadata field a [`DedupeCheck`] compares against.
pub const DEDUPE_KEY_FIELD: &str = "dedupe_key";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanScope {
    #[default]
    All,
    Program(i64),
    Campus(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PracticeWrite {
    Insert(Practice),
    /// Compare-and-set keyed by `(id, expected_state, expected_revision)`.
    Transition {
        expected_state: PracticeState,
        expected_revision: i64,
        next: Practice,
    },
}

impl PracticeWrite {
    pub fn practice(&self) -> &Practice {
        match self {
            PracticeWrite::Insert(practice) => practice,
            PracticeWrite::Transition { next, .. } => next,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Commit {
    pub practice: PracticeWrite,
    pub employer_evaluation: Option<EmployerEvaluation>,
    pub report_evaluation: Option<ReportEvaluation>,
    pub final_record: Option<FinalRecord>,
    pub audit: AuditEntry,
}

impl Commit {
    pub fn new(practice: PracticeWrite, audit: AuditEntry) -> Self {
        Self {
            practice,
            employer_evaluation: None,
            report_evaluation: None,
            final_record: None,
            audit,
        }
    }
}

/// Rejects an audit write when an entry with the same entity, action and
/// `metadata.dedupe_key` was recorded at or after `since`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupeCheck {
    pub key: String,
    pub since: DateTime<Utc>,
}

/// An audit entry plus the side effects that must land with it.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditWrite {
    pub entry: AuditEntry,
    pub notification: Option<Notification>,
    pub dedupe: Option<DedupeCheck>,
}

impl AuditWrite {
    pub fn with_notification(mut self, notification: Notification) -> Self {
        self.notification = Some(notification);
        self
    }

    pub fn deduplicated(mut self, dedupe: Option<DedupeCheck>) -> Self {
        self.dedupe = dedupe;
        self
    }
}

impl From<AuditEntry> for AuditWrite {
    fn from(entry: AuditEntry) -> Self {
        Self {
            entry,
            notification: None,
            dedupe: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuditFilter {
    pub entity_type: Option<EntityType>,
    pub entity_id: Option<String>,
    pub actor_user_id: Option<i64>,
    pub action: Option<AuditAction>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[cfg(test)]
impl AuditFilter {
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.entity_type.map_or(true, |value| entry.entity_type == value)
            && self
                .entity_id
                .as_deref()
                .map_or(true, |value| entry.entity_id == value)
            && self.actor_user_id.map_or(true, |value| entry.actor_user_id == value)
            && self.action.map_or(true, |value| entry.action == value)
            && self.from.map_or(true, |value| entry.occurred_at >= value)
            && self.to.map_or(true, |value| entry.occurred_at <= value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: usize,
    pub offset: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl Page {
    pub fn new(limit: usize, offset: usize) -> Self {
        Self { limit, offset }.bounded()
    }

    /// Clamps the limit to `1..=MAX_PAGE_SIZE`.
    pub fn bounded(self) -> Self {
        Self {
            limit: self.limit.clamp(1, MAX_PAGE_SIZE),
            offset: self.offset,
        }
    }
}

#[async_trait]
pub trait PracticeStore: Send + Sync {
    async fn get_practice(&self, id: Uuid) -> Result<Option<Practice>>;

    async fn list_practices(&self, scope: ScanScope) -> Result<Vec<Practice>>;

    async fn get_account(&self, id: i64) -> Result<Option<Account>>;

    /// Disabled student and user accounts attached to programs in scope.
    async fn count_inactive_accounts(&self, scope: ScanScope) -> Result<usize>;

    /// Active coordinator accounts for a program.
    async fn program_coordinators(&self, program_id: i64) -> Result<Vec<Account>>;

    async fn get_employer_evaluation(&self, practice_id: Uuid) -> Result<Option<EmployerEvaluation>>;

    async fn get_report_evaluation(&self, practice_id: Uuid) -> Result<Option<ReportEvaluation>>;

    async fn get_final_record(&self, practice_id: Uuid) -> Result<Option<FinalRecord>>;

    /// Applies every write in `commit` in one transaction.
    ///
    /// Fails with `ConcurrentModification` when the CAS key no longer matches
    /// and with `Validation` when an evaluation or final record already exists.
    async fn commit(&self, commit: Commit) -> Result<()>;

    async fn current_policy(&self) -> Result<WeightPolicy>;

    /// Replaces the policy if its stored version still equals `expected_version`.
    async fn replace_policy(&self, expected_version: i64, next: WeightPolicy, audit: AuditEntry) -> Result<()>;

    /// Appends the entry, and queues its notification, in one transaction.
    ///
    /// Fails with `Validation` when the dedupe check finds an earlier entry
    /// for the same entity, action and key inside the window; the check and
    /// the write are serialized per entity.
    async fn record_audit(&self, write: AuditWrite) -> Result<()>;

    /// Newest first.
    async fn query_audit(&self, filter: &AuditFilter, page: Page) -> Result<Vec<AuditEntry>>;

    async fn export_rows(&self, scope: ScanScope) -> Result<Vec<ExportRow>>;
}
