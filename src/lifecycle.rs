//! Practice lifecycle controller.
//!
//! The state machine is the [`TRANSITIONS`] table: every event is looked up
//! against the current state, its guard is checked against the caller, and
//! the resulting write is a compare-and-set on `(id, state, revision)` that
//! carries exactly one audit entry.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::audit;
use crate::error::{PracticeError, Result};
use crate::models::{
    AuditAction, Caller, CriterionScore, EmployerEvaluation, FinalRecord, NewPractice, Practice,
    PracticeState, ReportEvaluation, Role,
};
use crate::notify::{Notification, Notifier, RecipientKind};
use crate::scoring;
use crate::store::{Commit, PracticeStore, PracticeWrite};

pub const MAX_COMMENT_LEN: usize = 2000;
pub const MAX_REPORT_REF_LEN: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    AssignSupervisor,
    SupervisorAccepts,
    SupervisorDeclines,
    SubmitReport,
    EvaluationsRecorded,
    Close,
}

impl Event {
    #[cfg(test)]
    pub const ALL: [Event; 6] = [
        Event::AssignSupervisor,
        Event::SupervisorAccepts,
        Event::SupervisorDeclines,
        Event::SubmitReport,
        Event::EvaluationsRecorded,
        Event::Close,
    ];

    /// State the event leads to when it is legal.
    pub fn target(self) -> PracticeState {
        match self {
            Event::AssignSupervisor => PracticeState::PendienteAceptacionDocente,
            Event::SupervisorAccepts => PracticeState::EnCurso,
            Event::SupervisorDeclines => PracticeState::Pendiente,
            Event::SubmitReport => PracticeState::FinalizadaPendienteEval,
            Event::EvaluationsRecorded => PracticeState::EvaluacionCompleta,
            Event::Close => PracticeState::Cerrada,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Guard {
    ProgramOwner,
    AssignedSupervisor,
    OwningStudent,
    /// Only reachable from inside the controller.
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: PracticeState,
    pub event: Event,
    pub guard: Guard,
    pub to: PracticeState,
}

pub const TRANSITIONS: [Transition; 6] = [
    Transition {
        from: PracticeState::Pendiente,
        event: Event::AssignSupervisor,
        guard: Guard::ProgramOwner,
        to: PracticeState::PendienteAceptacionDocente,
    },
    Transition {
        from: PracticeState::PendienteAceptacionDocente,
        event: Event::SupervisorAccepts,
        guard: Guard::AssignedSupervisor,
        to: PracticeState::EnCurso,
    },
    Transition {
        from: PracticeState::PendienteAceptacionDocente,
        event: Event::SupervisorDeclines,
        guard: Guard::AssignedSupervisor,
        to: PracticeState::Pendiente,
    },
    Transition {
        from: PracticeState::EnCurso,
        event: Event::SubmitReport,
        guard: Guard::OwningStudent,
        to: PracticeState::FinalizadaPendienteEval,
    },
    Transition {
        from: PracticeState::FinalizadaPendienteEval,
        event: Event::EvaluationsRecorded,
        guard: Guard::System,
        to: PracticeState::EvaluacionCompleta,
    },
    Transition {
        from: PracticeState::EvaluacionCompleta,
        event: Event::Close,
        guard: Guard::ProgramOwner,
        to: PracticeState::Cerrada,
    },
];

pub fn transition_for(from: PracticeState, event: Event) -> Result<&'static Transition> {
    TRANSITIONS
        .iter()
        .find(|transition| transition.from == from && transition.event == event)
        .ok_or(PracticeError::InvalidStateTransition {
            current: from,
            requested: event.target(),
        })
}

pub fn check_guard(guard: Guard, caller: &Caller, practice: &Practice) -> Result<()> {
    let allowed = match guard {
        Guard::ProgramOwner => caller.owns_program(practice.program_id),
        Guard::AssignedSupervisor => {
            caller.role == Role::Supervisor && practice.supervisor_id == Some(caller.user_id)
        }
        Guard::OwningStudent => caller.role == Role::Student && practice.student_id == caller.user_id,
        Guard::System => true,
    };
    if allowed {
        Ok(())
    } else {
        Err(PracticeError::unauthorized(format!(
            "{} {} cannot act as {:?} on practice {}",
            caller.role, caller.user_id, guard, practice.id
        )))
    }
}

fn authorize(caller: &Caller, practice: &Practice, event: Event) -> Result<&'static Transition> {
    let transition = transition_for(practice.state, event)?;
    if transition.guard == Guard::System {
        return Err(PracticeError::unauthorized(format!(
            "{event:?} is applied by the system only"
        )));
    }
    check_guard(transition.guard, caller, practice)?;
    Ok(transition)
}

fn advance(practice: &Practice, to: PracticeState) -> Practice {
    let mut next = practice.clone();
    next.state = to;
    next.revision = practice.revision + 1;
    next.updated_at = Utc::now();
    next
}

fn cas(current: &Practice, next: Practice) -> PracticeWrite {
    PracticeWrite::Transition {
        expected_state: current.state,
        expected_revision: current.revision,
        next,
    }
}

fn check_comments(comments: Option<&str>) -> Result<()> {
    match comments {
        Some(text) if text.chars().count() > MAX_COMMENT_LEN => Err(PracticeError::validation(format!(
            "comments exceed {MAX_COMMENT_LEN} characters"
        ))),
        _ => Ok(()),
    }
}

fn trimmed(comments: Option<String>) -> Option<String> {
    comments
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationOutcome {
    pub practice: Practice,
    pub score: f64,
    /// True when this evaluation was the second one and the practice moved
    /// to EVALUACION_COMPLETA.
    pub completed: bool,
}

/// Re-runs `op` while it fails with a concurrent modification.
pub async fn retry_on_conflict<T, F, Fut>(max_attempts: usize, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                warn!(attempt, error = %err, "retrying after concurrent modification");
                attempt += 1;
            }
            outcome => return outcome,
        }
    }
}

pub struct LifecycleController {
    store: Arc<dyn PracticeStore>,
    notifier: Arc<dyn Notifier>,
    notify_on_decline: bool,
}

impl LifecycleController {
    pub fn new(store: Arc<dyn PracticeStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            notify_on_decline: false,
        }
    }

    pub fn with_decline_notifications(mut self, enabled: bool) -> Self {
        self.notify_on_decline = enabled;
        self
    }

    pub async fn practice(&self, id: Uuid) -> Result<Practice> {
        self.store
            .get_practice(id)
            .await?
            .ok_or(PracticeError::PracticeNotFound(id))
    }

    async fn apply(&self, commit: Commit) -> Result<()> {
        let practice_id = commit.practice.practice().id;
        let action = commit.audit.action;
        match self.store.commit(commit).await {
            Ok(()) => Ok(()),
            Err(err @ PracticeError::ConcurrentModification(_)) => {
                warn!(%practice_id, %action, "compare-and-set lost, practice changed underneath");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub async fn create(&self, caller: &Caller, input: NewPractice) -> Result<Practice> {
        if !caller.owns_program(input.program_id) {
            return Err(PracticeError::unauthorized(format!(
                "{} {} does not coordinate program {}",
                caller.role, caller.user_id, input.program_id
            )));
        }
        if input.end_date < input.start_date {
            return Err(PracticeError::validation(format!(
                "end date {} is before start date {}",
                input.end_date, input.start_date
            )));
        }
        let student = self
            .store
            .get_account(input.student_id)
            .await?
            .ok_or_else(|| PracticeError::NotFound {
                entity: "student",
                id: input.student_id.to_string(),
            })?;
        if student.role != Role::Student {
            return Err(PracticeError::validation(format!(
                "account {} is a {}, not a student",
                student.id, student.role
            )));
        }

        let now = Utc::now();
        let practice = Practice {
            id: Uuid::new_v4(),
            student_id: input.student_id,
            supervisor_id: None,
            program_id: input.program_id,
            host_organization_id: input.host_organization_id,
            kind: input.kind,
            start_date: input.start_date,
            end_date: input.end_date,
            state: PracticeState::Pendiente,
            report_document_ref: None,
            computed_grade: None,
            policy_version: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        };
        let entry = audit::practice_entry(
            caller,
            AuditAction::PracticeCreated,
            practice.id,
            format!("practice created for student {}", practice.student_id),
            json!({
                "student_id": practice.student_id,
                "program_id": practice.program_id,
                "kind": practice.kind,
                "start_date": practice.start_date,
                "end_date": practice.end_date,
            }),
        );
        self.apply(Commit::new(PracticeWrite::Insert(practice.clone()), entry))
            .await?;
        info!(practice_id = %practice.id, student_id = practice.student_id, "practice created");
        Ok(practice)
    }

    pub async fn assign_supervisor(&self, caller: &Caller, id: Uuid, supervisor_id: i64) -> Result<Practice> {
        let practice = self.practice(id).await?;
        let transition = authorize(caller, &practice, Event::AssignSupervisor)?;

        let supervisor = self
            .store
            .get_account(supervisor_id)
            .await?
            .ok_or_else(|| PracticeError::NotFound {
                entity: "supervisor",
                id: supervisor_id.to_string(),
            })?;
        if supervisor.role != Role::Supervisor {
            return Err(PracticeError::validation(format!(
                "account {supervisor_id} is a {}, not a supervisor",
                supervisor.role
            )));
        }
        if !supervisor.active {
            return Err(PracticeError::validation(format!(
                "supervisor {supervisor_id} account is disabled"
            )));
        }

        let mut next = advance(&practice, transition.to);
        next.supervisor_id = Some(supervisor_id);
        let entry = audit::practice_entry(
            caller,
            AuditAction::SupervisorAssigned,
            id,
            format!("supervisor {supervisor_id} assigned"),
            json!({
                "from": practice.state,
                "to": next.state,
                "supervisor_id": supervisor_id,
            }),
        );
        self.apply(Commit::new(cas(&practice, next.clone()), entry)).await?;
        info!(practice_id = %id, supervisor_id, "supervisor assigned");
        Ok(next)
    }

    pub async fn accept_by_supervisor(&self, caller: &Caller, id: Uuid) -> Result<Practice> {
        let practice = self.practice(id).await?;
        let transition = authorize(caller, &practice, Event::SupervisorAccepts)?;

        let next = advance(&practice, transition.to);
        let entry = audit::practice_entry(
            caller,
            AuditAction::SupervisorAccepted,
            id,
            "supervisor accepted the assignment",
            json!({ "from": practice.state, "to": next.state }),
        );
        self.apply(Commit::new(cas(&practice, next.clone()), entry)).await?;
        info!(practice_id = %id, supervisor_id = caller.user_id, "practice in progress");
        Ok(next)
    }

    pub async fn decline_by_supervisor(&self, caller: &Caller, id: Uuid, reason: Option<String>) -> Result<Practice> {
        let practice = self.practice(id).await?;
        let transition = authorize(caller, &practice, Event::SupervisorDeclines)?;
        let reason = trimmed(reason);
        check_comments(reason.as_deref())?;

        let mut next = advance(&practice, transition.to);
        next.supervisor_id = None;
        let entry = audit::practice_entry(
            caller,
            AuditAction::SupervisorDeclined,
            id,
            "supervisor declined the assignment",
            json!({
                "from": practice.state,
                "to": next.state,
                "declined_supervisor_id": caller.user_id,
                "reason": reason,
            }),
        );
        self.apply(Commit::new(cas(&practice, next.clone()), entry)).await?;
        info!(practice_id = %id, supervisor_id = caller.user_id, "supervisor declined");

        if self.notify_on_decline {
            self.notify_coordinators_of_decline(&practice, caller.user_id, reason.as_deref())
                .await;
        }
        Ok(next)
    }

    /// The decline is already committed here, so delivery problems are logged
    /// instead of failing the operation.
    async fn notify_coordinators_of_decline(&self, practice: &Practice, supervisor_id: i64, reason: Option<&str>) {
        let coordinators = match self.store.program_coordinators(practice.program_id).await {
            Ok(coordinators) => coordinators,
            Err(err) => {
                warn!(practice_id = %practice.id, error = %err, "could not resolve coordinators for decline notice");
                return;
            }
        };
        for coordinator in coordinators {
            let notification = Notification {
                practice_id: practice.id,
                recipient_kind: RecipientKind::Coordinator,
                recipient_id: coordinator.id,
                subject: "Supervisor declined a practice".to_string(),
                body: format!(
                    "Supervisor {supervisor_id} declined practice {} for student {}. Reason: {}",
                    practice.id,
                    practice.student_id,
                    reason.unwrap_or("not given")
                ),
            };
            if let Err(err) = self.notifier.send(&notification).await {
                warn!(practice_id = %practice.id, coordinator_id = coordinator.id, error = %err, "decline notice not delivered");
            }
        }
    }

    pub async fn submit_report(&self, caller: &Caller, id: Uuid, report_ref: &str) -> Result<Practice> {
        let practice = self.practice(id).await?;
        let transition = authorize(caller, &practice, Event::SubmitReport)?;

        let report_ref = report_ref.trim();
        if report_ref.is_empty() || report_ref.len() > MAX_REPORT_REF_LEN {
            return Err(PracticeError::validation(format!(
                "report reference must be 1-{MAX_REPORT_REF_LEN} characters"
            )));
        }
        let today = Utc::now().date_naive();
        if today < practice.end_date {
            return Err(PracticeError::validation(format!(
                "practice ends on {}, the report can be submitted from that date",
                practice.end_date
            )));
        }

        let mut next = advance(&practice, transition.to);
        next.report_document_ref = Some(report_ref.to_string());
        let entry = audit::practice_entry(
            caller,
            AuditAction::ReportSubmitted,
            id,
            "final report submitted",
            json!({ "from": practice.state, "to": next.state, "report_ref": report_ref }),
        );
        self.apply(Commit::new(cas(&practice, next.clone()), entry)).await?;
        info!(practice_id = %id, "report submitted, awaiting evaluations");
        Ok(next)
    }

    fn expect_evaluation_window(practice: &Practice) -> Result<()> {
        if practice.state != PracticeState::FinalizadaPendienteEval {
            return Err(PracticeError::InvalidStateTransition {
                current: practice.state,
                requested: Event::EvaluationsRecorded.target(),
            });
        }
        Ok(())
    }

    /// Next practice revision after one evaluation lands. When both scores are
    /// known the system transition fires and the final grade is computed with
    /// the current policy snapshot.
    async fn after_evaluation(&self, practice: &Practice, employer_score: f64, report_score: Option<f64>) -> Result<Practice> {
        let Some(report_score) = report_score else {
            return Ok(advance(practice, practice.state));
        };
        let transition = transition_for(practice.state, Event::EvaluationsRecorded)?;
        let policy = crate::policy::current_policy(self.store.as_ref()).await?;
        let grade = scoring::compute_final_grade(employer_score, report_score, &policy)?;

        let mut next = advance(practice, transition.to);
        next.computed_grade = Some(grade);
        next.policy_version = Some(policy.version);
        Ok(next)
    }

    pub async fn record_employer_evaluation(
        &self,
        caller: &Caller,
        id: Uuid,
        scores: Vec<CriterionScore>,
        comments: Option<String>,
    ) -> Result<EvaluationOutcome> {
        let practice = self.practice(id).await?;
        Self::expect_evaluation_window(&practice)?;
        let is_host = caller.role == Role::Employer
            && caller.scope_id.is_some()
            && caller.scope_id == practice.host_organization_id;
        if !is_host && !caller.owns_program(practice.program_id) {
            return Err(PracticeError::unauthorized(format!(
                "{} {} cannot evaluate practice {} for the host organization",
                caller.role, caller.user_id, id
            )));
        }
        let comments = trimmed(comments);
        check_comments(comments.as_deref())?;
        let final_score = scoring::compute_employer_score(&scores)?;

        if self.store.get_employer_evaluation(id).await?.is_some() {
            return Err(PracticeError::validation("employer evaluation already recorded"));
        }
        let report_score = self
            .store
            .get_report_evaluation(id)
            .await?
            .map(|evaluation| evaluation.score);
        let next = self.after_evaluation(&practice, final_score, report_score).await?;
        let completed = next.state == PracticeState::EvaluacionCompleta;

        let entry = audit::practice_entry(
            caller,
            AuditAction::EmployerEvaluationRecorded,
            id,
            format!("employer evaluation recorded with score {final_score:.2}"),
            json!({
                "from": practice.state,
                "to": next.state,
                "final_score": final_score,
                "computed_grade": next.computed_grade,
                "policy_version": next.policy_version,
            }),
        );
        let mut commit = Commit::new(cas(&practice, next.clone()), entry);
        commit.employer_evaluation = Some(EmployerEvaluation {
            practice_id: id,
            scores,
            comments,
            final_score,
            submitted_by: caller.user_id,
            submitted_at: Utc::now(),
        });
        self.apply(commit).await?;
        info!(practice_id = %id, final_score, completed, "employer evaluation recorded");

        Ok(EvaluationOutcome {
            practice: next,
            score: final_score,
            completed,
        })
    }

    pub async fn record_report_evaluation(
        &self,
        caller: &Caller,
        id: Uuid,
        score: f64,
        comments: Option<String>,
    ) -> Result<EvaluationOutcome> {
        let practice = self.practice(id).await?;
        Self::expect_evaluation_window(&practice)?;
        check_guard(Guard::AssignedSupervisor, caller, &practice)?;
        let comments = trimmed(comments);
        check_comments(comments.as_deref())?;
        let score = scoring::normalize_report_score(score)?;

        if self.store.get_report_evaluation(id).await?.is_some() {
            return Err(PracticeError::validation("report evaluation already recorded"));
        }
        let employer_score = self
            .store
            .get_employer_evaluation(id)
            .await?
            .map(|evaluation| evaluation.final_score);
        let next = match employer_score {
            Some(employer_score) => self.after_evaluation(&practice, employer_score, Some(score)).await?,
            None => advance(&practice, practice.state),
        };
        let completed = next.state == PracticeState::EvaluacionCompleta;

        let entry = audit::practice_entry(
            caller,
            AuditAction::ReportEvaluationRecorded,
            id,
            format!("report evaluation recorded with score {score:.2}"),
            json!({
                "from": practice.state,
                "to": next.state,
                "score": score,
                "computed_grade": next.computed_grade,
                "policy_version": next.policy_version,
            }),
        );
        let mut commit = Commit::new(cas(&practice, next.clone()), entry);
        commit.report_evaluation = Some(ReportEvaluation {
            practice_id: id,
            score,
            comments,
            submitted_by: caller.user_id,
            submitted_at: Utc::now(),
        });
        self.apply(commit).await?;
        info!(practice_id = %id, score, completed, "report evaluation recorded");

        Ok(EvaluationOutcome {
            practice: next,
            score,
            completed,
        })
    }

    pub async fn close(&self, caller: &Caller, id: Uuid) -> Result<FinalRecord> {
        let practice = self.practice(id).await?;
        match practice.state {
            PracticeState::EvaluacionCompleta => {}
            PracticeState::Cerrada => {
                return Err(PracticeError::InvalidStateTransition {
                    current: practice.state,
                    requested: Event::Close.target(),
                })
            }
            other => return Err(PracticeError::PrematureClose(other)),
        }
        let transition = authorize(caller, &practice, Event::Close)?;

        let (Some(final_grade), Some(policy_version)) = (practice.computed_grade, practice.policy_version) else {
            return Err(PracticeError::Internal(format!(
                "practice {id} reached {} without a computed grade",
                practice.state
            )));
        };
        let record = FinalRecord {
            practice_id: id,
            final_grade,
            policy_version,
            closed_by: caller.user_id,
            closed_at: Utc::now(),
        };

        let next = advance(&practice, transition.to);
        let entry = audit::practice_entry(
            caller,
            AuditAction::PracticeClosed,
            id,
            format!("practice closed with final grade {final_grade:.2}"),
            json!({
                "from": practice.state,
                "to": next.state,
                "final_grade": final_grade,
                "policy_version": policy_version,
            }),
        );
        let mut commit = Commit::new(cas(&practice, next), entry);
        commit.final_record = Some(record.clone());
        self.apply(commit).await?;
        info!(practice_id = %id, final_grade, "practice closed");
        Ok(record)
    }
}
