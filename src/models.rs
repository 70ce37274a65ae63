use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PracticeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PracticeState {
    Pendiente,
    PendienteAceptacionDocente,
    EnCurso,
    FinalizadaPendienteEval,
    EvaluacionCompleta,
    Cerrada,
}

impl PracticeState {
    pub const ALL: [PracticeState; 6] = [
        PracticeState::Pendiente,
        PracticeState::PendienteAceptacionDocente,
        PracticeState::EnCurso,
        PracticeState::FinalizadaPendienteEval,
        PracticeState::EvaluacionCompleta,
        PracticeState::Cerrada,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PracticeState::Pendiente => "PENDIENTE",
            PracticeState::PendienteAceptacionDocente => "PENDIENTE_ACEPTACION_DOCENTE",
            PracticeState::EnCurso => "EN_CURSO",
            PracticeState::FinalizadaPendienteEval => "FINALIZADA_PENDIENTE_EVAL",
            PracticeState::EvaluacionCompleta => "EVALUACION_COMPLETA",
            PracticeState::Cerrada => "CERRADA",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == PracticeState::Cerrada
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PracticeKind {
    Labor,
    Professional,
}

impl PracticeKind {
    pub const ALL: [PracticeKind; 2] = [PracticeKind::Labor, PracticeKind::Professional];

    pub fn as_str(self) -> &'static str {
        match self {
            PracticeKind::Labor => "LABOR",
            PracticeKind::Professional => "PROFESSIONAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Student,
    Supervisor,
    Coordinator,
    ProgramDirector,
    SuperAdmin,
    Employer,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::Student,
        Role::Supervisor,
        Role::Coordinator,
        Role::ProgramDirector,
        Role::SuperAdmin,
        Role::Employer,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Student => "STUDENT",
            Role::Supervisor => "SUPERVISOR",
            Role::Coordinator => "COORDINATOR",
            Role::ProgramDirector => "PROGRAM_DIRECTOR",
            Role::SuperAdmin => "SUPER_ADMIN",
            Role::Employer => "EMPLOYER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditAction {
    PracticeCreated,
    SupervisorAssigned,
    SupervisorAccepted,
    SupervisorDeclined,
    ReportSubmitted,
    EmployerEvaluationRecorded,
    ReportEvaluationRecorded,
    PracticeClosed,
    ManualAlertDispatched,
    PolicyUpdated,
}

impl AuditAction {
    pub const ALL: [AuditAction; 10] = [
        AuditAction::PracticeCreated,
        AuditAction::SupervisorAssigned,
        AuditAction::SupervisorAccepted,
        AuditAction::SupervisorDeclined,
        AuditAction::ReportSubmitted,
        AuditAction::EmployerEvaluationRecorded,
        AuditAction::ReportEvaluationRecorded,
        AuditAction::PracticeClosed,
        AuditAction::ManualAlertDispatched,
        AuditAction::PolicyUpdated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::PracticeCreated => "PRACTICE_CREATED",
            AuditAction::SupervisorAssigned => "SUPERVISOR_ASSIGNED",
            AuditAction::SupervisorAccepted => "SUPERVISOR_ACCEPTED",
            AuditAction::SupervisorDeclined => "SUPERVISOR_DECLINED",
            AuditAction::ReportSubmitted => "REPORT_SUBMITTED",
            AuditAction::EmployerEvaluationRecorded => "EMPLOYER_EVALUATION_RECORDED",
            AuditAction::ReportEvaluationRecorded => "REPORT_EVALUATION_RECORDED",
            AuditAction::PracticeClosed => "PRACTICE_CLOSED",
            AuditAction::ManualAlertDispatched => "MANUAL_ALERT_DISPATCHED",
            AuditAction::PolicyUpdated => "POLICY_UPDATED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Practice,
    WeightPolicy,
}

impl EntityType {
    pub const ALL: [EntityType; 2] = [EntityType::Practice, EntityType::WeightPolicy];

    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::Practice => "PRACTICE",
            EntityType::WeightPolicy => "WEIGHT_POLICY",
        }
    }
}

macro_rules! wire_string {
    ($($ty:ident => $label:literal),* $(,)?) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }

            impl FromStr for $ty {
                type Err = PracticeError;

                fn from_str(value: &str) -> Result<Self, Self::Err> {
                    let wanted = value.trim().to_ascii_uppercase().replace('-', "_");
                    $ty::ALL
                        .iter()
                        .copied()
                        .find(|candidate| candidate.as_str() == wanted)
                        .ok_or_else(|| {
                            PracticeError::Validation(format!("unknown {}: {value}", $label))
                        })
                }
            }
        )*
    };
}

wire_string!(
    PracticeState => "practice state",
    PracticeKind => "practice kind",
    Role => "role",
    AuditAction => "audit action",
    EntityType => "entity type",
);

/// Identity resolved by the external authorization gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: i64,
    pub role: Role,
    pub scope_id: Option<i64>,
    pub origin: String,
}

impl Caller {
    pub fn new(user_id: i64, role: Role, scope_id: Option<i64>) -> Self {
        Self {
            user_id,
            role,
            scope_id,
            origin: "internal".to_string(),
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Coordinators and directors own the program matching their scope;
    /// super admins own every program.
    pub fn owns_program(&self, program_id: i64) -> bool {
        match self.role {
            Role::SuperAdmin => true,
            Role::Coordinator | Role::ProgramDirector => self.scope_id == Some(program_id),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Practice {
    pub id: Uuid,
    pub student_id: i64,
    pub supervisor_id: Option<i64>,
    pub program_id: i64,
    pub host_organization_id: Option<i64>,
    pub kind: PracticeKind,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub state: PracticeState,
    pub report_document_ref: Option<String>,
    pub computed_grade: Option<f64>,
    pub policy_version: Option<i64>,
    pub revision: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPractice {
    pub student_id: i64,
    pub program_id: i64,
    pub host_organization_id: Option<i64>,
    pub kind: PracticeKind,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriterionScore {
    pub criterion_id: String,
    pub score: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EmployerEvaluation {
    pub practice_id: Uuid,
    pub scores: Vec<CriterionScore>,
    pub comments: Option<String>,
    pub final_score: f64,
    pub submitted_by: i64,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReportEvaluation {
    pub practice_id: Uuid,
    pub score: f64,
    pub comments: Option<String>,
    pub submitted_by: i64,
    pub submitted_at: DateTime<Utc>,
}

/// Versioned snapshot of the employer/report weighting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightPolicy {
    pub version: i64,
    pub employer_weight_pct: i32,
    pub report_weight_pct: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinalRecord {
    pub practice_id: Uuid,
    pub final_grade: f64,
    pub policy_version: i64,
    pub closed_by: i64,
    pub closed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub id: i64,
    pub full_name: String,
    pub email: String,
    pub role: Role,
    pub program_id: Option<i64>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub level: AlertLevel,
    pub title: String,
    pub description: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub actor_user_id: i64,
    pub action: AuditAction,
    pub entity_type: EntityType,
    pub entity_id: String,
    pub description: String,
    pub metadata: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub request_origin: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateSummary {
    pub state: PracticeState,
    pub count: usize,
    pub avg_grade: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportRow {
    pub practice_id: Uuid,
    pub student_id: i64,
    pub student_name: String,
    pub student_email: String,
    pub program: String,
    pub kind: PracticeKind,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub state: PracticeState,
    pub final_grade: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_parse_from_wire_strings() {
        for state in PracticeState::ALL {
            assert_eq!(state.as_str().parse::<PracticeState>(), Ok(state));
        }
        assert_eq!(
            "pendiente-aceptacion-docente".parse::<PracticeState>(),
            Ok(PracticeState::PendienteAceptacionDocente)
        );
        assert!("ARCHIVADA".parse::<PracticeState>().is_err());
    }

    #[test]
    fn serde_uses_the_same_wire_names() {
        let json = serde_json::to_string(&PracticeState::FinalizadaPendienteEval).unwrap();
        assert_eq!(json, "\"FINALIZADA_PENDIENTE_EVAL\"");
        let role: Role = serde_json::from_str("\"PROGRAM_DIRECTOR\"").unwrap();
        assert_eq!(role, Role::ProgramDirector);
    }

    #[test]
    fn program_ownership_follows_scope() {
        let coordinator = Caller::new(10, Role::Coordinator, Some(3));
        assert!(coordinator.owns_program(3));
        assert!(!coordinator.owns_program(4));
        assert!(Caller::new(1, Role::SuperAdmin, None).owns_program(4));
        assert!(!Caller::new(20, Role::Student, Some(3)).owns_program(3));
    }
}
