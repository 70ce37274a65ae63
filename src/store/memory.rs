//! In-memory record store used by the unit tests.
//!
//! Mirrors the PostgreSQL backend's CAS and uniqueness rules under a single
//! mutex, and can hold practice reads at a barrier to force races.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Barrier;
use uuid::Uuid;

use crate::error::{PracticeError, Result};
use crate::models::{
    Account, AuditEntry, EmployerEvaluation, ExportRow, FinalRecord, Practice, ReportEvaluation,
    Role, WeightPolicy,
};
use crate::notify::Notification;
use crate::store::{
    AuditFilter, AuditWrite, Commit, Page, PracticeStore, PracticeWrite, ScanScope, DEDUPE_KEY_FIELD,
};

struct Program {
    name: String,
    campus_id: i64,
}

struct MemoryState {
    programs: HashMap<i64, Program>,
    accounts: HashMap<i64, Account>,
    practices: HashMap<Uuid, Practice>,
    employer_evaluations: HashMap<Uuid, EmployerEvaluation>,
    report_evaluations: HashMap<Uuid, ReportEvaluation>,
    final_records: HashMap<Uuid, FinalRecord>,
    policy: WeightPolicy,
    audit: Vec<AuditEntry>,
    outbox: Vec<Notification>,
}

impl MemoryState {
    fn in_scope(&self, program_id: i64, scope: ScanScope) -> bool {
        match scope {
            ScanScope::All => true,
            ScanScope::Program(id) => program_id == id,
            ScanScope::Campus(campus) => self
                .programs
                .get(&program_id)
                .is_some_and(|program| program.campus_id == campus),
        }
    }
}

pub struct MemoryStore {
    state: Mutex<MemoryState>,
    read_gate: Mutex<Option<Arc<Barrier>>>,
    fail_writes: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                programs: HashMap::new(),
                accounts: HashMap::new(),
                practices: HashMap::new(),
                employer_evaluations: HashMap::new(),
                report_evaluations: HashMap::new(),
                final_records: HashMap::new(),
                policy: WeightPolicy {
                    version: 1,
                    employer_weight_pct: 50,
                    report_weight_pct: 50,
                },
                audit: Vec::new(),
                outbox: Vec::new(),
            }),
            read_gate: Mutex::new(None),
            fail_writes: AtomicBool::new(false),
        }
    }

    pub fn add_program(&self, id: i64, name: &str, campus_id: i64) {
        self.state.lock().unwrap().programs.insert(
            id,
            Program {
                name: name.to_string(),
                campus_id,
            },
        );
    }

    pub fn add_account(&self, id: i64, role: Role, program_id: Option<i64>, active: bool) {
        let account = Account {
            id,
            full_name: format!("User {id}"),
            email: format!("user{id}@example.edu"),
            role,
            program_id,
            active,
        };
        self.state.lock().unwrap().accounts.insert(id, account);
    }

    pub fn put_practice(&self, practice: Practice) {
        self.state
            .lock()
            .unwrap()
            .practices
            .insert(practice.id, practice);
    }

    pub fn set_policy(&self, policy: WeightPolicy) {
        self.state.lock().unwrap().policy = policy;
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state.lock().unwrap().audit.clone()
    }

    /// Notifications queued alongside audit entries.
    pub fn outbox(&self) -> Vec<Notification> {
        self.state.lock().unwrap().outbox.clone()
    }

    /// The next `parties` practice reads wait for each other before returning.
    pub fn gate_practice_reads(&self, parties: usize) {
        *self.read_gate.lock().unwrap() = Some(Arc::new(Barrier::new(parties)));
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PracticeError::Persistence("simulated write failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl PracticeStore for MemoryStore {
    async fn get_practice(&self, id: Uuid) -> Result<Option<Practice>> {
        let practice = self.state.lock().unwrap().practices.get(&id).cloned();
        let gate = self.read_gate.lock().unwrap().take();
        if let Some(barrier) = gate {
            // hand the same barrier to the other waiting readers
            *self.read_gate.lock().unwrap() = Some(barrier.clone());
            if barrier.wait().await.is_leader() {
                self.read_gate.lock().unwrap().take();
            }
        }
        Ok(practice)
    }

    async fn list_practices(&self, scope: ScanScope) -> Result<Vec<Practice>> {
        let state = self.state.lock().unwrap();
        let mut practices: Vec<Practice> = state
            .practices
            .values()
            .filter(|practice| state.in_scope(practice.program_id, scope))
            .cloned()
            .collect();
        practices.sort_by_key(|practice| practice.created_at);
        Ok(practices)
    }

    async fn get_account(&self, id: i64) -> Result<Option<Account>> {
        Ok(self.state.lock().unwrap().accounts.get(&id).cloned())
    }

    async fn count_inactive_accounts(&self, scope: ScanScope) -> Result<usize> {
        let state = self.state.lock().unwrap();
        Ok(state
            .accounts
            .values()
            .filter(|account| !account.active)
            .filter(|account| match account.program_id {
                Some(program_id) => state.in_scope(program_id, scope),
                None => scope == ScanScope::All,
            })
            .count())
    }

    async fn program_coordinators(&self, program_id: i64) -> Result<Vec<Account>> {
        let state = self.state.lock().unwrap();
        let mut coordinators: Vec<Account> = state
            .accounts
            .values()
            .filter(|account| {
                account.active
                    && account.role == Role::Coordinator
                    && account.program_id == Some(program_id)
            })
            .cloned()
            .collect();
        coordinators.sort_by_key(|account| account.id);
        Ok(coordinators)
    }

    async fn get_employer_evaluation(&self, practice_id: Uuid) -> Result<Option<EmployerEvaluation>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .employer_evaluations
            .get(&practice_id)
            .cloned())
    }

    async fn get_report_evaluation(&self, practice_id: Uuid) -> Result<Option<ReportEvaluation>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .report_evaluations
            .get(&practice_id)
            .cloned())
    }

    async fn get_final_record(&self, practice_id: Uuid) -> Result<Option<FinalRecord>> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .final_records
            .get(&practice_id)
            .cloned())
    }

    async fn commit(&self, commit: Commit) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let practice_id = commit.practice.practice().id;

        match &commit.practice {
            PracticeWrite::Insert(practice) => {
                if state.practices.contains_key(&practice.id) {
                    return Err(PracticeError::validation(format!(
                        "practice {} already exists",
                        practice.id
                    )));
                }
            }
            PracticeWrite::Transition {
                expected_state,
                expected_revision,
                ..
            } => {
                let current = state
                    .practices
                    .get(&practice_id)
                    .ok_or(PracticeError::PracticeNotFound(practice_id))?;
                if current.state != *expected_state || current.revision != *expected_revision {
                    return Err(PracticeError::ConcurrentModification(practice_id));
                }
            }
        }
        if commit.employer_evaluation.is_some()
            && state.employer_evaluations.contains_key(&practice_id)
        {
            return Err(PracticeError::validation("employer evaluation already recorded"));
        }
        if commit.report_evaluation.is_some() && state.report_evaluations.contains_key(&practice_id) {
            return Err(PracticeError::validation("report evaluation already recorded"));
        }
        if commit.final_record.is_some() && state.final_records.contains_key(&practice_id) {
            return Err(PracticeError::validation("final record already exists"));
        }
        self.check_writable()?;

        let practice = match commit.practice {
            PracticeWrite::Insert(practice) => practice,
            PracticeWrite::Transition { next, .. } => next,
        };
        state.practices.insert(practice.id, practice);
        if let Some(evaluation) = commit.employer_evaluation {
            state.employer_evaluations.insert(practice_id, evaluation);
        }
        if let Some(evaluation) = commit.report_evaluation {
            state.report_evaluations.insert(practice_id, evaluation);
        }
        if let Some(record) = commit.final_record {
            state.final_records.insert(practice_id, record);
        }
        state.audit.push(commit.audit);
        Ok(())
    }

    async fn current_policy(&self) -> Result<WeightPolicy> {
        Ok(self.state.lock().unwrap().policy)
    }

    async fn replace_policy(&self, expected_version: i64, next: WeightPolicy, audit: AuditEntry) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.policy.version != expected_version {
            return Err(PracticeError::validation(format!(
                "policy version {} is stale, current is {}",
                expected_version, state.policy.version
            )));
        }
        self.check_writable()?;
        state.policy = next;
        state.audit.push(audit);
        Ok(())
    }

    async fn record_audit(&self, write: AuditWrite) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(dedupe) = &write.dedupe {
            let entry = &write.entry;
            let duplicate = state.audit.iter().any(|previous| {
                previous.entity_type == entry.entity_type
                    && previous.entity_id == entry.entity_id
                    && previous.action == entry.action
                    && previous.occurred_at >= dedupe.since
                    && previous.metadata.get(DEDUPE_KEY_FIELD).and_then(Value::as_str)
                        == Some(dedupe.key.as_str())
            });
            if duplicate {
                return Err(PracticeError::validation(format!(
                    "{} for {} {} already recorded since {}",
                    entry.action, entry.entity_type, entry.entity_id, dedupe.since
                )));
            }
        }
        self.check_writable()?;

        if let Some(notification) = write.notification {
            state.outbox.push(notification);
        }
        state.audit.push(write.entry);
        Ok(())
    }

    async fn query_audit(&self, filter: &AuditFilter, page: Page) -> Result<Vec<AuditEntry>> {
        let page = page.bounded();
        let state = self.state.lock().unwrap();
        let mut entries: Vec<AuditEntry> = state
            .audit
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        entries.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        Ok(entries
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect())
    }

    async fn export_rows(&self, scope: ScanScope) -> Result<Vec<ExportRow>> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<ExportRow> = state
            .practices
            .values()
            .filter(|practice| state.in_scope(practice.program_id, scope))
            .map(|practice| {
                let student = state.accounts.get(&practice.student_id);
                ExportRow {
                    practice_id: practice.id,
                    student_id: practice.student_id,
                    student_name: student.map(|a| a.full_name.clone()).unwrap_or_default(),
                    student_email: student.map(|a| a.email.clone()).unwrap_or_default(),
                    program: state
                        .programs
                        .get(&practice.program_id)
                        .map(|p| p.name.clone())
                        .unwrap_or_default(),
                    kind: practice.kind,
                    start_date: practice.start_date,
                    end_date: practice.end_date,
                    state: practice.state,
                    final_grade: state
                        .final_records
                        .get(&practice.id)
                        .map(|record| record.final_grade),
                }
            })
            .collect();
        rows.sort_by_key(|row| (row.start_date, row.practice_id));
        Ok(rows)
    }
}
