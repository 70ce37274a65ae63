use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgExecutor, PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PracticeError, Result};
use crate::models::{
    Account, AuditEntry, CriterionScore, EmployerEvaluation, ExportRow, FinalRecord, Practice,
    ReportEvaluation, Role, WeightPolicy,
};
use crate::notify::{Notification, Notifier};
use crate::store::{
    AuditFilter, AuditWrite, Commit, Page, PracticeStore, PracticeWrite, ScanScope, DEDUPE_KEY_FIELD,
};

const PRACTICE_COLUMNS: &str = "p.id, p.student_id, p.supervisor_id, p.program_id, \
     p.host_organization_id, p.kind, p.start_date, p.end_date, p.state, \
     p.report_document_ref, p.computed_grade, p.policy_version, p.revision, \
     p.created_at, p.updated_at";

const AUDIT_COLUMNS: &str = "id, actor_user_id, action, entity_type, entity_id, description, \
     metadata, occurred_at, request_origin";

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let programs = vec![
        (1_i64, "Ingenieria Civil Industrial", 10_i64),
        (2, "Enfermeria", 10),
        (3, "Construccion Civil", 20),
    ];

    for (id, name, campus_id) in programs {
        sqlx::query(
            r#"
            INSERT INTO practice_lifecycle.programs (id, name, campus_id)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, campus_id = EXCLUDED.campus_id
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(campus_id)
        .execute(pool)
        .await?;
    }

    let accounts = vec![
        (100_i64, "Marcela Rojas", "marcela.rojas@example.edu", Role::Coordinator, Some(1_i64), true),
        (101, "Tomas Fuentes", "tomas.fuentes@example.edu", Role::Coordinator, Some(2), true),
        (150, "Ines Araya", "ines.araya@example.edu", Role::SuperAdmin, None, true),
        (200, "Patricio Vidal", "patricio.vidal@example.edu", Role::Supervisor, Some(1), true),
        (201, "Carla Munoz", "carla.munoz@example.edu", Role::Supervisor, Some(2), true),
        (300, "Diego Soto", "diego.soto@example.edu", Role::Student, Some(1), true),
        (301, "Valentina Perez", "valentina.perez@example.edu", Role::Student, Some(1), true),
        (302, "Josefa Herrera", "josefa.herrera@example.edu", Role::Student, Some(2), false),
        (400, "Constructora Andes", "rrhh@constructora-andes.example.com", Role::Employer, None, true),
    ];

    for (id, name, email, role, program_id, active) in accounts {
        sqlx::query(
            r#"
            INSERT INTO practice_lifecycle.accounts (id, full_name, email, role, program_id, active)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE
            SET full_name = EXCLUDED.full_name, email = EXCLUDED.email, role = EXCLUDED.role,
                program_id = EXCLUDED.program_id, active = EXCLUDED.active
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(email)
        .bind(role.as_str())
        .bind(program_id)
        .bind(active)
        .execute(pool)
        .await?;
    }

    Ok(())
}

fn scope_binds(scope: ScanScope) -> (Option<i64>, Option<i64>) {
    match scope {
        ScanScope::All => (None, None),
        ScanScope::Program(id) => (Some(id), None),
        ScanScope::Campus(id) => (None, Some(id)),
    }
}

fn practice_from_row(row: &PgRow) -> Result<Practice> {
    Ok(Practice {
        id: row.try_get("id")?,
        student_id: row.try_get("student_id")?,
        supervisor_id: row.try_get("supervisor_id")?,
        program_id: row.try_get("program_id")?,
        host_organization_id: row.try_get("host_organization_id")?,
        kind: row.try_get::<String, _>("kind")?.parse()?,
        start_date: row.try_get("start_date")?,
        end_date: row.try_get("end_date")?,
        state: row.try_get::<String, _>("state")?.parse()?,
        report_document_ref: row.try_get("report_document_ref")?,
        computed_grade: row.try_get("computed_grade")?,
        policy_version: row.try_get("policy_version")?,
        revision: row.try_get("revision")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    Ok(Account {
        id: row.try_get("id")?,
        full_name: row.try_get("full_name")?,
        email: row.try_get("email")?,
        role: row.try_get::<String, _>("role")?.parse()?,
        program_id: row.try_get("program_id")?,
        active: row.try_get("active")?,
    })
}

fn audit_from_row(row: &PgRow) -> Result<AuditEntry> {
    Ok(AuditEntry {
        id: row.try_get("id")?,
        actor_user_id: row.try_get("actor_user_id")?,
        action: row.try_get::<String, _>("action")?.parse()?,
        entity_type: row.try_get::<String, _>("entity_type")?.parse()?,
        entity_id: row.try_get("entity_id")?,
        description: row.try_get("description")?,
        metadata: row.try_get("metadata")?,
        occurred_at: row.try_get("occurred_at")?,
        request_origin: row.try_get("request_origin")?,
    })
}

async fn insert_audit<'e, E: PgExecutor<'e>>(executor: E, entry: &AuditEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO practice_lifecycle.audit_log
        (id, actor_user_id, action, entity_type, entity_id, description, metadata, occurred_at, request_origin)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(entry.id)
    .bind(entry.actor_user_id)
    .bind(entry.action.as_str())
    .bind(entry.entity_type.as_str())
    .bind(&entry.entity_id)
    .bind(&entry.description)
    .bind(&entry.metadata)
    .bind(entry.occurred_at)
    .bind(&entry.request_origin)
    .execute(executor)
    .await?;
    Ok(())
}

async fn insert_notification<'e, E: PgExecutor<'e>>(executor: E, notification: &Notification) -> Result<()> {
    let queued_at: DateTime<Utc> = Utc::now();
    sqlx::query(
        r#"
        INSERT INTO practice_lifecycle.notification_outbox
        (id, practice_id, recipient_kind, recipient_id, subject, body, queued_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(notification.practice_id)
    .bind(notification.recipient_kind.as_str())
    .bind(notification.recipient_id)
    .bind(&notification.subject)
    .bind(&notification.body)
    .bind(queued_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn write_practice(tx: &mut Transaction<'_, Postgres>, write: &PracticeWrite) -> Result<()> {
        match write {
            PracticeWrite::Insert(p) => {
                sqlx::query(
                    r#"
                    INSERT INTO practice_lifecycle.practices
                    (id, student_id, supervisor_id, program_id, host_organization_id, kind,
                     start_date, end_date, state, report_document_ref, computed_grade,
                     policy_version, revision, created_at, updated_at)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
                    "#,
                )
                .bind(p.id)
                .bind(p.student_id)
                .bind(p.supervisor_id)
                .bind(p.program_id)
                .bind(p.host_organization_id)
                .bind(p.kind.as_str())
                .bind(p.start_date)
                .bind(p.end_date)
                .bind(p.state.as_str())
                .bind(&p.report_document_ref)
                .bind(p.computed_grade)
                .bind(p.policy_version)
                .bind(p.revision)
                .bind(p.created_at)
                .bind(p.updated_at)
                .execute(&mut **tx)
                .await?;
            }
            PracticeWrite::Transition {
                expected_state,
                expected_revision,
                next,
            } => {
                let result = sqlx::query(
                    r#"
                    UPDATE practice_lifecycle.practices
                    SET supervisor_id = $2, host_organization_id = $3, state = $4,
                        report_document_ref = $5, computed_grade = $6, policy_version = $7,
                        revision = $8, updated_at = $9
                    WHERE id = $1 AND state = $10 AND revision = $11
                    "#,
                )
                .bind(next.id)
                .bind(next.supervisor_id)
                .bind(next.host_organization_id)
                .bind(next.state.as_str())
                .bind(&next.report_document_ref)
                .bind(next.computed_grade)
                .bind(next.policy_version)
                .bind(next.revision)
                .bind(next.updated_at)
                .bind(expected_state.as_str())
                .bind(*expected_revision)
                .execute(&mut **tx)
                .await?;

                if result.rows_affected() == 0 {
                    let exists = sqlx::query("SELECT 1 FROM practice_lifecycle.practices WHERE id = $1")
                        .bind(next.id)
                        .fetch_optional(&mut **tx)
                        .await?
                        .is_some();
                    return Err(if exists {
                        PracticeError::ConcurrentModification(next.id)
                    } else {
                        PracticeError::PracticeNotFound(next.id)
                    });
                }
            }
        }
        Ok(())
    }

    async fn write_employer_evaluation(
        tx: &mut Transaction<'_, Postgres>,
        evaluation: &EmployerEvaluation,
    ) -> Result<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO practice_lifecycle.employer_evaluations
            (practice_id, comments, final_score, submitted_by, submitted_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (practice_id) DO NOTHING
            "#,
        )
        .bind(evaluation.practice_id)
        .bind(&evaluation.comments)
        .bind(evaluation.final_score)
        .bind(evaluation.submitted_by)
        .bind(evaluation.submitted_at)
        .execute(&mut **tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(PracticeError::validation("employer evaluation already recorded"));
        }

        for (position, entry) in evaluation.scores.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO practice_lifecycle.employer_evaluation_scores
                (practice_id, position, criterion_id, score)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(evaluation.practice_id)
            .bind(position as i32)
            .bind(&entry.criterion_id)
            .bind(entry.score as i16)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    async fn write_report_evaluation(tx: &mut Transaction<'_, Postgres>, evaluation: &ReportEvaluation) -> Result<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO practice_lifecycle.report_evaluations
            (practice_id, score, comments, submitted_by, submitted_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (practice_id) DO NOTHING
            "#,
        )
        .bind(evaluation.practice_id)
        .bind(evaluation.score)
        .bind(&evaluation.comments)
        .bind(evaluation.submitted_by)
        .bind(evaluation.submitted_at)
        .execute(&mut **tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(PracticeError::validation("report evaluation already recorded"));
        }
        Ok(())
    }

    async fn write_final_record(tx: &mut Transaction<'_, Postgres>, record: &FinalRecord) -> Result<()> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO practice_lifecycle.final_records
            (practice_id, final_grade, policy_version, closed_by, closed_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (practice_id) DO NOTHING
            "#,
        )
        .bind(record.practice_id)
        .bind(record.final_grade)
        .bind(record.policy_version)
        .bind(record.closed_by)
        .bind(record.closed_at)
        .execute(&mut **tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(PracticeError::validation("final record already exists"));
        }
        Ok(())
    }
}

#[async_trait]
impl PracticeStore for PgStore {
    async fn get_practice(&self, id: Uuid) -> Result<Option<Practice>> {
        let query = format!("SELECT {PRACTICE_COLUMNS} FROM practice_lifecycle.practices p WHERE p.id = $1");
        let row = sqlx::query(&query).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(practice_from_row).transpose()
    }

    async fn list_practices(&self, scope: ScanScope) -> Result<Vec<Practice>> {
        let (program_id, campus_id) = scope_binds(scope);
        let query = format!(
            "SELECT {PRACTICE_COLUMNS} FROM practice_lifecycle.practices p \
             JOIN practice_lifecycle.programs pr ON pr.id = p.program_id \
             WHERE ($1::BIGINT IS NULL OR p.program_id = $1) \
             AND ($2::BIGINT IS NULL OR pr.campus_id = $2) \
             ORDER BY p.created_at"
        );
        let rows = sqlx::query(&query)
            .bind(program_id)
            .bind(campus_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(practice_from_row).collect()
    }

    async fn get_account(&self, id: i64) -> Result<Option<Account>> {
        let row = sqlx::query(
            "SELECT id, full_name, email, role, program_id, active FROM practice_lifecycle.accounts WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn count_inactive_accounts(&self, scope: ScanScope) -> Result<usize> {
        let (program_id, campus_id) = scope_binds(scope);
        let count: i64 = sqlx::query(
            r#"
            SELECT COUNT(*) AS inactive
            FROM practice_lifecycle.accounts a
            LEFT JOIN practice_lifecycle.programs pr ON pr.id = a.program_id
            WHERE NOT a.active
              AND ($1::BIGINT IS NULL OR a.program_id = $1)
              AND ($2::BIGINT IS NULL OR pr.campus_id = $2)
            "#,
        )
        .bind(program_id)
        .bind(campus_id)
        .fetch_one(&self.pool)
        .await?
        .try_get("inactive")?;
        Ok(count.max(0) as usize)
    }

    async fn program_coordinators(&self, program_id: i64) -> Result<Vec<Account>> {
        let rows = sqlx::query(
            r#"
            SELECT id, full_name, email, role, program_id, active
            FROM practice_lifecycle.accounts
            WHERE program_id = $1 AND role = $2 AND active
            ORDER BY id
            "#,
        )
        .bind(program_id)
        .bind(Role::Coordinator.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(account_from_row).collect()
    }

    async fn get_employer_evaluation(&self, practice_id: Uuid) -> Result<Option<EmployerEvaluation>> {
        let Some(row) = sqlx::query(
            r#"
            SELECT practice_id, comments, final_score, submitted_by, submitted_at
            FROM practice_lifecycle.employer_evaluations
            WHERE practice_id = $1
            "#,
        )
        .bind(practice_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let score_rows = sqlx::query(
            r#"
            SELECT criterion_id, score
            FROM practice_lifecycle.employer_evaluation_scores
            WHERE practice_id = $1
            ORDER BY position
            "#,
        )
        .bind(practice_id)
        .fetch_all(&self.pool)
        .await?;
        let mut scores = Vec::with_capacity(score_rows.len());
        for score_row in score_rows {
            scores.push(CriterionScore {
                criterion_id: score_row.try_get("criterion_id")?,
                score: i32::from(score_row.try_get::<i16, _>("score")?),
            });
        }

        Ok(Some(EmployerEvaluation {
            practice_id: row.try_get("practice_id")?,
            scores,
            comments: row.try_get("comments")?,
            final_score: row.try_get("final_score")?,
            submitted_by: row.try_get("submitted_by")?,
            submitted_at: row.try_get("submitted_at")?,
        }))
    }

    async fn get_report_evaluation(&self, practice_id: Uuid) -> Result<Option<ReportEvaluation>> {
        let row = sqlx::query(
            r#"
            SELECT practice_id, score, comments, submitted_by, submitted_at
            FROM practice_lifecycle.report_evaluations
            WHERE practice_id = $1
            "#,
        )
        .bind(practice_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<ReportEvaluation> {
            Ok(ReportEvaluation {
                practice_id: row.try_get("practice_id")?,
                score: row.try_get("score")?,
                comments: row.try_get("comments")?,
                submitted_by: row.try_get("submitted_by")?,
                submitted_at: row.try_get("submitted_at")?,
            })
        })
        .transpose()
    }

    async fn get_final_record(&self, practice_id: Uuid) -> Result<Option<FinalRecord>> {
        let row = sqlx::query(
            r#"
            SELECT practice_id, final_grade, policy_version, closed_by, closed_at
            FROM practice_lifecycle.final_records
            WHERE practice_id = $1
            "#,
        )
        .bind(practice_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| -> Result<FinalRecord> {
            Ok(FinalRecord {
                practice_id: row.try_get("practice_id")?,
                final_grade: row.try_get("final_grade")?,
                policy_version: row.try_get("policy_version")?,
                closed_by: row.try_get("closed_by")?,
                closed_at: row.try_get("closed_at")?,
            })
        })
        .transpose()
    }

    async fn commit(&self, commit: Commit) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        Self::write_practice(&mut tx, &commit.practice).await?;
        if let Some(evaluation) = &commit.employer_evaluation {
            Self::write_employer_evaluation(&mut tx, evaluation).await?;
        }
        if let Some(evaluation) = &commit.report_evaluation {
            Self::write_report_evaluation(&mut tx, evaluation).await?;
        }
        if let Some(record) = &commit.final_record {
            Self::write_final_record(&mut tx, record).await?;
        }
        insert_audit(&mut *tx, &commit.audit).await?;

        tx.commit().await?;
        debug!(practice_id = %commit.practice.practice().id, action = %commit.audit.action, "commit applied");
        Ok(())
    }

    async fn current_policy(&self) -> Result<WeightPolicy> {
        let row = sqlx::query(
            r#"
            SELECT version, employer_weight_pct, report_weight_pct
            FROM practice_lifecycle.weight_policy
            WHERE id = 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| PracticeError::NotFound {
            entity: "weight policy",
            id: "1".to_string(),
        })?;

        Ok(WeightPolicy {
            version: row.try_get("version")?,
            employer_weight_pct: i32::from(row.try_get::<i16, _>("employer_weight_pct")?),
            report_weight_pct: i32::from(row.try_get::<i16, _>("report_weight_pct")?),
        })
    }

    async fn replace_policy(&self, expected_version: i64, next: WeightPolicy, audit: AuditEntry) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE practice_lifecycle.weight_policy
            SET version = $1, employer_weight_pct = $2, report_weight_pct = $3, updated_at = $4
            WHERE id = 1 AND version = $5
            "#,
        )
        .bind(next.version)
        .bind(next.employer_weight_pct as i16)
        .bind(next.report_weight_pct as i16)
        .bind(Utc::now())
        .bind(expected_version)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(PracticeError::validation(format!(
                "policy version {expected_version} is stale, re-read the current policy"
            )));
        }
        insert_audit(&mut *tx, &audit).await?;
        tx.commit().await?;
        info!(version = next.version, "weight policy replaced");
        Ok(())
    }

    async fn record_audit(&self, write: AuditWrite) -> Result<()> {
        let entry = &write.entry;
        let mut tx = self.pool.begin().await?;

        if let Some(dedupe) = &write.dedupe {
            // concurrent writers for the same entity queue here until commit
            sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
                .bind(format!("audit:{}:{}", entry.entity_type, entry.entity_id))
                .execute(&mut *tx)
                .await?;
            let duplicate: bool = sqlx::query_scalar(
                r#"
                SELECT EXISTS (
                    SELECT 1 FROM practice_lifecycle.audit_log
                    WHERE entity_type = $1 AND entity_id = $2 AND action = $3
                      AND occurred_at >= $4 AND metadata ->> $5 = $6
                )
                "#,
            )
            .bind(entry.entity_type.as_str())
            .bind(&entry.entity_id)
            .bind(entry.action.as_str())
            .bind(dedupe.since)
            .bind(DEDUPE_KEY_FIELD)
            .bind(&dedupe.key)
            .fetch_one(&mut *tx)
            .await?;
            if duplicate {
                return Err(PracticeError::validation(format!(
                    "{} for {} {} already recorded since {}",
                    entry.action, entry.entity_type, entry.entity_id, dedupe.since
                )));
            }
        }

        if let Some(notification) = &write.notification {
            insert_notification(&mut *tx, notification).await?;
        }
        insert_audit(&mut *tx, entry).await?;
        tx.commit().await?;
        debug!(action = %entry.action, entity_id = %entry.entity_id, "audit entry committed");
        Ok(())
    }

    async fn query_audit(&self, filter: &AuditFilter, page: Page) -> Result<Vec<AuditEntry>> {
        let page = page.bounded();
        let query = format!(
            "SELECT {AUDIT_COLUMNS} FROM practice_lifecycle.audit_log \
             WHERE ($1::TEXT IS NULL OR entity_type = $1) \
             AND ($2::TEXT IS NULL OR entity_id = $2) \
             AND ($3::BIGINT IS NULL OR actor_user_id = $3) \
             AND ($4::TEXT IS NULL OR action = $4) \
             AND ($5::TIMESTAMPTZ IS NULL OR occurred_at >= $5) \
             AND ($6::TIMESTAMPTZ IS NULL OR occurred_at <= $6) \
             ORDER BY occurred_at DESC, id \
             LIMIT $7 OFFSET $8"
        );
        let rows = sqlx::query(&query)
            .bind(filter.entity_type.map(|value| value.as_str()))
            .bind(filter.entity_id.as_deref())
            .bind(filter.actor_user_id)
            .bind(filter.action.map(|value| value.as_str()))
            .bind(filter.from)
            .bind(filter.to)
            .bind(page.limit as i64)
            .bind(page.offset as i64)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(audit_from_row).collect()
    }

    async fn export_rows(&self, scope: ScanScope) -> Result<Vec<ExportRow>> {
        let (program_id, campus_id) = scope_binds(scope);
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.student_id, a.full_name, a.email, pr.name AS program, p.kind,
                   p.start_date, p.end_date, p.state, f.final_grade
            FROM practice_lifecycle.practices p
            JOIN practice_lifecycle.accounts a ON a.id = p.student_id
            JOIN practice_lifecycle.programs pr ON pr.id = p.program_id
            LEFT JOIN practice_lifecycle.final_records f ON f.practice_id = p.id
            WHERE ($1::BIGINT IS NULL OR p.program_id = $1)
              AND ($2::BIGINT IS NULL OR pr.campus_id = $2)
            ORDER BY p.start_date, p.id
            "#,
        )
        .bind(program_id)
        .bind(campus_id)
        .fetch_all(&self.pool)
        .await?;

        let mut export = Vec::with_capacity(rows.len());
        for row in rows {
            export.push(ExportRow {
                practice_id: row.try_get("id")?,
                student_id: row.try_get("student_id")?,
                student_name: row.try_get("full_name")?,
                student_email: row.try_get("email")?,
                program: row.try_get("program")?,
                kind: row.try_get::<String, _>("kind")?.parse()?,
                start_date: row.try_get("start_date")?,
                end_date: row.try_get("end_date")?,
                state: row.try_get::<String, _>("state")?.parse()?,
                final_grade: row.try_get("final_grade")?,
            });
        }
        Ok(export)
    }
}

/// Queues notifications in the outbox table for the external mailer.
#[derive(Clone)]
pub struct PgNotifier {
    pool: PgPool,
}

impl PgNotifier {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    async fn send(&self, notification: &Notification) -> Result<()> {
        insert_notification(&self.pool, notification).await?;
        info!(
            practice_id = %notification.practice_id,
            recipient_id = notification.recipient_id,
            "notification queued"
        );
        Ok(())
    }
}
