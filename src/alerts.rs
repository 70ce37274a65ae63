//! Operational alerts derived from practice state, plus manual alert dispatch.
//!
//! The scan is read-only and recomputed on every call, so running it twice
//! without intervening transitions yields the same alerts.

use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::{self, AuditRecorder};
use crate::config::Settings;
use crate::error::{PracticeError, Result};
use crate::models::{Alert, AlertLevel, AuditAction, Caller, EntityType, Practice, PracticeState, Role};
use crate::notify::{Notification, RecipientKind};
use crate::store::{AuditWrite, DedupeCheck, PracticeStore, ScanScope, DEDUPE_KEY_FIELD};

pub const UNSUPERVISED_PRACTICES: &str = "unsupervised-practices";
pub const PENDING_SUPERVISOR_DECISION: &str = "pending-supervisor-decision";
pub const APPROACHING_DEADLINE: &str = "approaching-deadline";
pub const OVERDUE_PRACTICES: &str = "overdue-practices";
pub const STALLED_EVALUATIONS: &str = "stalled-evaluations";
pub const INACTIVE_ACCOUNTS: &str = "inactive-accounts";

pub const MAX_SUBJECT_LEN: usize = 150;
pub const MAX_MESSAGE_LEN: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanSettings {
    pub deadline_horizon_days: i64,
    pub stalled_eval_days: i64,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for ScanSettings {
    fn from(settings: &Settings) -> Self {
        Self {
            deadline_horizon_days: settings.deadline_horizon_days,
            stalled_eval_days: settings.stalled_eval_days,
        }
    }
}

fn alert(id: &str, level: AlertLevel, title: &str, description: String, count: usize) -> Option<Alert> {
    (count > 0).then(|| Alert {
        id: id.to_string(),
        level,
        title: title.to_string(),
        description,
        count,
    })
}

fn plural(count: usize, one: &str, many: &str) -> String {
    if count == 1 {
        format!("1 {one}")
    } else {
        format!("{count} {many}")
    }
}

pub fn scan_practices(
    practices: &[Practice],
    inactive_accounts: usize,
    today: NaiveDate,
    settings: &ScanSettings,
) -> Vec<Alert> {
    let horizon = today + Duration::days(settings.deadline_horizon_days);
    let stalled_before = today - Duration::days(settings.stalled_eval_days);

    let count = |predicate: &dyn Fn(&Practice) -> bool| practices.iter().filter(|p| predicate(p)).count();

    let unsupervised = count(&|p| {
        matches!(
            p.state,
            PracticeState::Pendiente | PracticeState::PendienteAceptacionDocente
        ) && p.supervisor_id.is_none()
    });
    let pending_decision = count(&|p| p.state == PracticeState::PendienteAceptacionDocente);
    let approaching = count(&|p| {
        p.state == PracticeState::EnCurso && p.end_date >= today && p.end_date <= horizon
    });
    let overdue = count(&|p| p.state == PracticeState::EnCurso && p.end_date < today);
    let stalled = count(&|p| {
        p.state == PracticeState::FinalizadaPendienteEval && p.updated_at.date_naive() < stalled_before
    });

    [
        alert(
            UNSUPERVISED_PRACTICES,
            AlertLevel::Warning,
            "Practices without supervisor",
            format!(
                "{} waiting for a supervisor to be assigned",
                plural(unsupervised, "practice is", "practices are")
            ),
            unsupervised,
        ),
        alert(
            PENDING_SUPERVISOR_DECISION,
            AlertLevel::Info,
            "Pending supervisor decision",
            format!(
                "{} waiting for the assigned supervisor to accept or decline",
                plural(pending_decision, "practice is", "practices are")
            ),
            pending_decision,
        ),
        alert(
            APPROACHING_DEADLINE,
            AlertLevel::Warning,
            "Practices ending soon",
            format!(
                "{} in progress end within {} days",
                plural(approaching, "practice", "practices"),
                settings.deadline_horizon_days
            ),
            approaching,
        ),
        alert(
            OVERDUE_PRACTICES,
            AlertLevel::Warning,
            "Practices past their end date",
            format!(
                "{} still in progress after the end date without a submitted report",
                plural(overdue, "practice is", "practices are")
            ),
            overdue,
        ),
        alert(
            STALLED_EVALUATIONS,
            AlertLevel::Warning,
            "Evaluations stalled",
            format!(
                "{} waiting for evaluations for more than {} days",
                plural(stalled, "practice has been", "practices have been"),
                settings.stalled_eval_days
            ),
            stalled,
        ),
        alert(
            INACTIVE_ACCOUNTS,
            AlertLevel::Warning,
            "Inactive accounts",
            format!(
                "{} disabled in this scope",
                plural(inactive_accounts, "account is", "accounts are")
            ),
            inactive_accounts,
        ),
    ]
    .into_iter()
    .flatten()
    .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualAlert {
    pub practice_id: Uuid,
    pub recipient: RecipientKind,
    pub subject: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReceipt {
    pub recipient_kind: RecipientKind,
    pub recipient_id: i64,
    pub audit_id: Uuid,
}

fn check_text(field: &str, value: &str, max: usize) -> Result<()> {
    let length = value.trim().chars().count();
    if length == 0 || length > max {
        return Err(PracticeError::validation(format!(
            "{field} must be 1-{max} characters, got {length}"
        )));
    }
    Ok(())
}

pub struct AlertEngine {
    store: Arc<dyn PracticeStore>,
    recorder: AuditRecorder,
    settings: ScanSettings,
    dedupe_window: Option<Duration>,
}

impl AlertEngine {
    /// Manual alerts are queued in the store's outbox together with their
    /// audit entry.
    pub fn new(store: Arc<dyn PracticeStore>) -> Self {
        Self {
            recorder: AuditRecorder::new(store.clone()),
            store,
            settings: ScanSettings::default(),
            dedupe_window: Some(Duration::hours(24)),
        }
    }

    pub fn with_settings(mut self, settings: &Settings) -> Self {
        self.settings = ScanSettings::from(settings);
        self.dedupe_window = (settings.alert_dedupe_hours > 0).then(|| Duration::hours(settings.alert_dedupe_hours));
        self
    }

    pub async fn scan(&self, scope: ScanScope, today: NaiveDate) -> Result<Vec<Alert>> {
        let practices = self.store.list_practices(scope).await?;
        let inactive = self.store.count_inactive_accounts(scope).await?;
        let alerts = scan_practices(&practices, inactive, today, &self.settings);
        debug!(?scope, practices = practices.len(), alerts = alerts.len(), "alert scan finished");
        Ok(alerts)
    }

    pub async fn dispatch(&self, caller: &Caller, request: ManualAlert) -> Result<DispatchReceipt> {
        check_text("subject", &request.subject, MAX_SUBJECT_LEN)?;
        check_text("message", &request.message, MAX_MESSAGE_LEN)?;

        let practice = self
            .store
            .get_practice(request.practice_id)
            .await?
            .ok_or(PracticeError::PracticeNotFound(request.practice_id))?;
        let privileged = matches!(
            caller.role,
            Role::Coordinator | Role::ProgramDirector | Role::SuperAdmin
        ) && caller.owns_program(practice.program_id);
        if !privileged {
            return Err(PracticeError::unauthorized(format!(
                "{} {} cannot send alerts for practice {}",
                caller.role, caller.user_id, practice.id
            )));
        }

        let recipient_id = match request.recipient {
            RecipientKind::Student => practice.student_id,
            RecipientKind::Supervisor => practice.supervisor_id.ok_or_else(|| {
                PracticeError::validation(format!("practice {} has no supervisor assigned", practice.id))
            })?,
            RecipientKind::Coordinator => {
                return Err(PracticeError::validation(
                    "manual alerts go to the student or the supervisor",
                ))
            }
        };

        let subject = request.subject.trim().to_string();
        let notification = Notification {
            practice_id: practice.id,
            recipient_kind: request.recipient,
            recipient_id,
            subject: subject.clone(),
            body: request.message.trim().to_string(),
        };
        let key = subject_key(&subject);
        let entry = audit::entry(
            caller,
            AuditAction::ManualAlertDispatched,
            EntityType::Practice,
            practice.id.to_string(),
            format!("manual alert sent to {} {recipient_id}", request.recipient.as_str()),
            json!({
                "subject": subject,
                DEDUPE_KEY_FIELD: key,
                "recipient_kind": request.recipient,
                "recipient_id": recipient_id,
                "state": practice.state,
            }),
        );
        let audit_id = entry.id;
        let dedupe = self.dedupe_window.map(|window| DedupeCheck {
            key,
            since: Utc::now() - window,
        });

        let write = AuditWrite::from(entry)
            .with_notification(notification)
            .deduplicated(dedupe);
        match self.recorder.record(write).await {
            Ok(()) => {}
            Err(PracticeError::Validation(_)) if self.dedupe_window.is_some() => {
                let hours = self.dedupe_window.map_or(0, |window| window.num_hours());
                warn!(practice_id = %practice.id, %subject, "duplicate manual alert suppressed");
                return Err(PracticeError::validation(format!(
                    "an alert with subject \"{subject}\" was already sent for this practice within {hours} hours"
                )));
            }
            Err(err) => return Err(err),
        }
        info!(practice_id = %practice.id, recipient_id, "manual alert dispatched");

        Ok(DispatchReceipt {
            recipient_kind: request.recipient,
            recipient_id,
            audit_id,
        })
    }
}

/// Subjects that differ only in case or surrounding space count as the same alert.
pub fn subject_key(subject: &str) -> String {
    subject.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PracticeKind;
    use crate::store::memory::MemoryStore;

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    fn practice(state: PracticeState, supervisor_id: Option<i64>, end_offset_days: i64) -> Practice {
        let now = Utc::now();
        Practice {
            id: Uuid::new_v4(),
            student_id: 300,
            supervisor_id,
            program_id: 1,
            host_organization_id: Some(900),
            kind: PracticeKind::Labor,
            start_date: today() - Duration::days(60),
            end_date: today() + Duration::days(end_offset_days),
            state,
            report_document_ref: None,
            computed_grade: None,
            policy_version: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    fn coordinator() -> Caller {
        Caller::new(100, Role::Coordinator, Some(1))
    }

    #[test]
    fn practice_ending_in_three_days_raises_one_warning() {
        let practices = vec![practice(PracticeState::EnCurso, Some(200), 3)];
        let first = scan_practices(&practices, 0, today(), &ScanSettings::default());
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, APPROACHING_DEADLINE);
        assert_eq!(first[0].level, AlertLevel::Warning);
        assert_eq!(first[0].count, 1);

        let second = scan_practices(&practices, 0, today(), &ScanSettings::default());
        assert_eq!(first, second);
    }

    #[test]
    fn every_category_is_counted() {
        let mut stalled = practice(PracticeState::FinalizadaPendienteEval, Some(200), -30);
        stalled.updated_at = Utc::now() - Duration::days(30);
        let practices = vec![
            practice(PracticeState::Pendiente, None, 40),
            practice(PracticeState::Pendiente, None, 40),
            practice(PracticeState::PendienteAceptacionDocente, Some(200), 40),
            practice(PracticeState::EnCurso, Some(200), 7),
            practice(PracticeState::EnCurso, Some(200), 8),
            practice(PracticeState::EnCurso, Some(200), -2),
            stalled,
            practice(PracticeState::Cerrada, Some(200), -90),
        ];
        let alerts = scan_practices(&practices, 3, today(), &ScanSettings::default());
        let summary: Vec<(&str, AlertLevel, usize)> = alerts
            .iter()
            .map(|a| (a.id.as_str(), a.level, a.count))
            .collect();
        assert_eq!(
            summary,
            vec![
                (UNSUPERVISED_PRACTICES, AlertLevel::Warning, 2),
                (PENDING_SUPERVISOR_DECISION, AlertLevel::Info, 1),
                (APPROACHING_DEADLINE, AlertLevel::Warning, 1),
                (OVERDUE_PRACTICES, AlertLevel::Warning, 1),
                (STALLED_EVALUATIONS, AlertLevel::Warning, 1),
                (INACTIVE_ACCOUNTS, AlertLevel::Warning, 3),
            ]
        );
        assert_eq!(alerts[0].description, "2 practices are waiting for a supervisor to be assigned");
    }

    #[test]
    fn quiet_scope_raises_nothing() {
        let practices = vec![practice(PracticeState::EnCurso, Some(200), 30)];
        assert!(scan_practices(&practices, 0, today(), &ScanSettings::default()).is_empty());
        assert!(scan_practices(&[], 0, today(), &ScanSettings::default()).is_empty());
    }

    fn engine() -> (Arc<MemoryStore>, AlertEngine) {
        let store = Arc::new(MemoryStore::new());
        store.add_program(1, "Civil Engineering", 10);
        store.add_program(2, "Nursing", 20);
        let engine = AlertEngine::new(store.clone());
        (store, engine)
    }

    #[tokio::test]
    async fn engine_scan_respects_scope() {
        let (store, engine) = engine();
        store.put_practice(practice(PracticeState::Pendiente, None, 30));
        let mut other_program = practice(PracticeState::Pendiente, None, 30);
        other_program.program_id = 2;
        store.put_practice(other_program);
        store.add_account(501, Role::Student, Some(2), false);

        let all = engine.scan(ScanScope::All, today()).await.unwrap();
        assert_eq!(all[0].count, 2);
        assert_eq!(all.len(), 2);

        let campus = engine.scan(ScanScope::Campus(10), today()).await.unwrap();
        assert_eq!(campus.len(), 1);
        assert_eq!(campus[0].count, 1);

        let nursing = engine.scan(ScanScope::Program(2), today()).await.unwrap();
        assert_eq!(nursing.iter().map(|a| a.id.as_str()).collect::<Vec<_>>(), vec![
            UNSUPERVISED_PRACTICES,
            INACTIVE_ACCOUNTS
        ]);
    }

    fn request(practice_id: Uuid, recipient: RecipientKind, subject: &str) -> ManualAlert {
        ManualAlert {
            practice_id,
            recipient,
            subject: subject.to_string(),
            message: "Please upload your final report this week.".to_string(),
        }
    }

    #[tokio::test]
    async fn dispatch_notifies_and_audits() {
        let (store, engine) = engine();
        let target = practice(PracticeState::EnCurso, Some(200), -1);
        store.put_practice(target.clone());

        let receipt = engine
            .dispatch(&coordinator(), request(target.id, RecipientKind::Supervisor, "Report overdue"))
            .await
            .unwrap();
        assert_eq!(receipt.recipient_id, 200);

        let sent = store.outbox();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, "Report overdue");

        let entries = store.audit_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, receipt.audit_id);
        assert_eq!(entries[0].action, AuditAction::ManualAlertDispatched);
        assert_eq!(entries[0].metadata["recipient_kind"], "supervisor");
    }

    #[tokio::test]
    async fn dispatch_validates_inputs() {
        let (store, engine) = engine();
        let unassigned = practice(PracticeState::Pendiente, None, 20);
        store.put_practice(unassigned.clone());

        assert!(matches!(
            engine
                .dispatch(&coordinator(), request(Uuid::new_v4(), RecipientKind::Student, "Hello"))
                .await,
            Err(PracticeError::PracticeNotFound(_))
        ));
        assert!(matches!(
            engine
                .dispatch(&coordinator(), request(unassigned.id, RecipientKind::Supervisor, "Hello"))
                .await,
            Err(PracticeError::Validation(_))
        ));
        let long_subject = "s".repeat(MAX_SUBJECT_LEN + 1);
        assert!(matches!(
            engine
                .dispatch(&coordinator(), request(unassigned.id, RecipientKind::Student, &long_subject))
                .await,
            Err(PracticeError::Validation(_))
        ));
        assert!(matches!(
            engine
                .dispatch(&coordinator(), request(unassigned.id, RecipientKind::Student, "   "))
                .await,
            Err(PracticeError::Validation(_))
        ));
        let student = Caller::new(300, Role::Student, None);
        assert!(matches!(
            engine
                .dispatch(&student, request(unassigned.id, RecipientKind::Student, "Hello"))
                .await,
            Err(PracticeError::Unauthorized(_))
        ));
        assert!(store.outbox().is_empty());
        assert!(store.audit_entries().is_empty());
    }

    #[tokio::test]
    async fn repeated_subjects_are_deduplicated_within_the_window() {
        let (store, engine) = engine();
        let target = practice(PracticeState::EnCurso, Some(200), 2);
        store.put_practice(target.clone());

        engine
            .dispatch(&coordinator(), request(target.id, RecipientKind::Student, "Deadline"))
            .await
            .unwrap();
        assert!(matches!(
            engine
                .dispatch(&coordinator(), request(target.id, RecipientKind::Student, "deadline "))
                .await,
            Err(PracticeError::Validation(_))
        ));
        engine
            .dispatch(&coordinator(), request(target.id, RecipientKind::Student, "Missing documents"))
            .await
            .unwrap();
        assert_eq!(store.outbox().len(), 2);
    }

    #[tokio::test]
    async fn dedupe_can_be_disabled() {
        let (store, engine) = engine();
        let settings = Settings {
            alert_dedupe_hours: 0,
            ..Settings::default()
        };
        let engine = engine.with_settings(&settings);
        let target = practice(PracticeState::EnCurso, Some(200), 2);
        store.put_practice(target.clone());

        for _ in 0..2 {
            engine
                .dispatch(&coordinator(), request(target.id, RecipientKind::Student, "Deadline"))
                .await
                .unwrap();
        }
        assert_eq!(store.outbox().len(), 2);
    }

    #[tokio::test]
    async fn failed_write_queues_nothing() {
        let (store, engine) = engine();
        let target = practice(PracticeState::EnCurso, Some(200), 2);
        store.put_practice(target.clone());
        store.fail_writes(true);

        let err = engine
            .dispatch(&coordinator(), request(target.id, RecipientKind::Student, "Deadline"))
            .await
            .unwrap_err();
        assert!(matches!(err, PracticeError::Persistence(_)));
        assert!(store.outbox().is_empty());
        assert!(store.audit_entries().is_empty());

        store.fail_writes(false);
        engine
            .dispatch(&coordinator(), request(target.id, RecipientKind::Student, "Deadline"))
            .await
            .unwrap();
        assert_eq!(store.outbox().len(), 1);
    }

    #[tokio::test]
    async fn simultaneous_duplicates_send_once() {
        let (store, engine) = engine();
        let target = practice(PracticeState::EnCurso, Some(200), 2);
        store.put_practice(target.clone());
        store.gate_practice_reads(2);

        let caller = coordinator();
        let (first, second) = tokio::join!(
            engine.dispatch(&caller, request(target.id, RecipientKind::Student, "Deadline")),
            engine.dispatch(&caller, request(target.id, RecipientKind::Student, "DEADLINE")),
        );
        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|outcome| matches!(outcome, Err(PracticeError::Validation(_)))));
        assert_eq!(store.outbox().len(), 1);
        assert_eq!(store.audit_entries().len(), 1);
    }

    #[tokio::test]
    async fn accented_subjects_match_regardless_of_case() {
        let (store, engine) = engine();
        let target = practice(PracticeState::EnCurso, Some(200), 2);
        store.put_practice(target.clone());

        engine
            .dispatch(&coordinator(), request(target.id, RecipientKind::Student, "Práctica vencida"))
            .await
            .unwrap();
        assert!(matches!(
            engine
                .dispatch(&coordinator(), request(target.id, RecipientKind::Student, "PRÁCTICA VENCIDA"))
                .await,
            Err(PracticeError::Validation(_))
        ));
        assert_eq!(subject_key("  ÉXITO "), "éxito");
        assert_eq!(store.outbox().len(), 1);
    }
}
