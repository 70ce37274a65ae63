use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Duration, NaiveDate, Utc};
use clap::{ArgGroup, Args, Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

mod alerts;
mod audit;
mod config;
mod csvio;
mod db;
mod error;
mod lifecycle;
mod models;
mod notify;
mod policy;
mod report;
mod scoring;
mod store;

use crate::alerts::{AlertEngine, ManualAlert};
use crate::audit::AuditRecorder;
use crate::config::Settings;
use crate::db::{PgNotifier, PgStore};
use crate::error::PracticeError;
use crate::lifecycle::{retry_on_conflict, LifecycleController};
use crate::models::{AuditAction, Caller, CriterionScore, EntityType, NewPractice, PracticeKind, Role};
use crate::notify::RecipientKind;
use crate::store::{AuditFilter, Page, PracticeStore, ScanScope};

/// An evaluation retries when the other evaluation commits first.
const EVALUATION_ATTEMPTS: usize = 3;

#[derive(Parser)]
#[command(name = "practice-lifecycle")]
#[command(about = "Internship practice lifecycle, grading and alerting", long_about = None)]
struct Cli {
    #[command(flatten)]
    identity: Identity,
    #[command(subcommand)]
    command: Commands,
}

/// Identity as resolved by the upstream authorization gate. These flags go
/// before the subcommand and have no defaults.
#[derive(Args)]
struct Identity {
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    role: Role,
    /// Program id for coordinators and directors, host organization id for employers.
    #[arg(long)]
    scope_id: Option<i64>,
    #[arg(long, default_value = "cli")]
    origin: String,
}

impl Identity {
    fn caller(&self) -> Caller {
        Caller::new(self.user_id, self.role, self.scope_id).with_origin(self.origin.clone())
    }
}

#[derive(Args)]
#[command(group(
    ArgGroup::new("scope")
        .args(["program", "campus"])
        .multiple(false)
))]
struct ScopeArgs {
    #[arg(long)]
    program: Option<i64>,
    #[arg(long)]
    campus: Option<i64>,
}

impl ScopeArgs {
    fn scope(&self) -> ScanScope {
        match (self.program, self.campus) {
            (Some(program), _) => ScanScope::Program(program),
            (None, Some(campus)) => ScanScope::Campus(campus),
            (None, None) => ScanScope::All,
        }
    }

    fn label(&self) -> Option<String> {
        match self.scope() {
            ScanScope::Program(program) => Some(format!("program {program}")),
            ScanScope::Campus(campus) => Some(format!("campus {campus}")),
            ScanScope::All => None,
        }
    }
}

#[derive(Subcommand)]
enum PolicyCommand {
    /// Print the active weight policy
    Show,
    /// Replace the weight policy (super admins only)
    Set {
        #[arg(long)]
        expected_version: i64,
        #[arg(long)]
        employer: i32,
        #[arg(long)]
        report: i32,
    },
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Register a practice in PENDIENTE
    Create {
        #[arg(long)]
        student: i64,
        #[arg(long)]
        program: i64,
        #[arg(long)]
        host_organization: Option<i64>,
        #[arg(long, default_value = "LABOR")]
        kind: PracticeKind,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
    },
    /// Assign a supervisor to a pending practice
    Assign {
        practice: Uuid,
        #[arg(long)]
        supervisor: i64,
    },
    /// Accept the supervision request as the assigned supervisor
    Accept { practice: Uuid },
    /// Decline the supervision request as the assigned supervisor
    Decline {
        practice: Uuid,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Submit the final report reference as the student
    SubmitReport {
        practice: Uuid,
        #[arg(long)]
        document: String,
    },
    /// Record the host organization's evaluation
    EmployerEval {
        practice: Uuid,
        /// Criterion score as `criterion=score`, once per criterion
        #[arg(long = "score", value_parser = parse_criterion_score, required = true)]
        scores: Vec<CriterionScore>,
        #[arg(long)]
        comments: Option<String>,
    },
    /// Record the supervisor's grade for the final report
    ReportEval {
        practice: Uuid,
        #[arg(long)]
        score: f64,
        #[arg(long)]
        comments: Option<String>,
    },
    /// Close an evaluated practice and issue its final record
    Close { practice: Uuid },
    /// Print a practice and its evaluations
    Show { practice: Uuid },
    /// Scan practices for operational alerts
    Alerts {
        #[command(flatten)]
        scope: ScopeArgs,
    },
    /// Send a manual alert to the student or supervisor of a practice
    SendAlert {
        practice: Uuid,
        #[arg(long, value_parser = parse_recipient)]
        to: RecipientKind,
        #[arg(long)]
        subject: String,
        #[arg(long)]
        message: String,
    },
    /// Query the audit log, newest first
    Audit {
        #[arg(long)]
        practice: Option<Uuid>,
        #[arg(long)]
        actor: Option<i64>,
        #[arg(long)]
        action: Option<AuditAction>,
        #[arg(long)]
        since_days: Option<i64>,
        #[arg(long, default_value_t = 25)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Inspect or change the evaluation weight policy
    Policy {
        #[command(subcommand)]
        command: PolicyCommand,
    },
    /// Export practices to CSV
    Export {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long, default_value = "practices.csv")]
        out: PathBuf,
    },
    /// Import practices from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Generate a markdown report
    Report {
        #[command(flatten)]
        scope: ScopeArgs,
        #[arg(long, default_value = "report.md")]
        out: PathBuf,
    },
}

fn parse_criterion_score(raw: &str) -> Result<CriterionScore, String> {
    let (criterion, score) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected criterion=score, got `{raw}`"))?;
    let score = score
        .trim()
        .parse::<i32>()
        .map_err(|err| format!("invalid score for {criterion}: {err}"))?;
    Ok(CriterionScore {
        criterion_id: criterion.trim().to_string(),
        score,
    })
}

fn parse_recipient(raw: &str) -> Result<RecipientKind, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "student" => Ok(RecipientKind::Student),
        "supervisor" => Ok(RecipientKind::Supervisor),
        other => Err(format!("alerts go to `student` or `supervisor`, not `{other}`")),
    }
}

struct App {
    pool: sqlx::PgPool,
    store: Arc<dyn PracticeStore>,
    controller: LifecycleController,
    engine: AlertEngine,
    recorder: AuditRecorder,
}

impl App {
    async fn connect(settings: &Settings) -> anyhow::Result<Self> {
        let database_url = settings.require_database_url()?;
        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .connect(database_url)
            .await
            .context("failed to connect to Postgres")?;

        let store: Arc<dyn PracticeStore> = Arc::new(PgStore::new(pool.clone()));
        let notifier = Arc::new(PgNotifier::new(pool.clone()));
        Ok(Self {
            controller: LifecycleController::new(store.clone(), notifier)
                .with_decline_notifications(settings.notify_on_decline),
            engine: AlertEngine::new(store.clone()).with_settings(settings),
            recorder: AuditRecorder::new(store.clone()),
            store,
            pool,
        })
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = Settings::from_env()?;
    let app = App::connect(&settings).await?;
    let caller = cli.identity.caller();
    let today = Utc::now().date_naive();

    match cli.command {
        Commands::InitDb => {
            db::init_db(&app.pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&app.pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Create {
            student,
            program,
            host_organization,
            kind,
            start,
            end,
        } => {
            let practice = app
                .controller
                .create(
                    &caller,
                    NewPractice {
                        student_id: student,
                        program_id: program,
                        host_organization_id: host_organization,
                        kind,
                        start_date: start,
                        end_date: end,
                    },
                )
                .await?;
            println!("Practice {} created in {}.", practice.id, practice.state);
        }
        Commands::Assign { practice, supervisor } => {
            let practice = app.controller.assign_supervisor(&caller, practice, supervisor).await?;
            println!("Practice {} is now {}.", practice.id, practice.state);
        }
        Commands::Accept { practice } => {
            let practice = app.controller.accept_by_supervisor(&caller, practice).await?;
            println!("Practice {} is now {}.", practice.id, practice.state);
        }
        Commands::Decline { practice, reason } => {
            let practice = app.controller.decline_by_supervisor(&caller, practice, reason).await?;
            println!("Practice {} is back in {}.", practice.id, practice.state);
        }
        Commands::SubmitReport { practice, document } => {
            let practice = app.controller.submit_report(&caller, practice, &document).await?;
            println!("Report stored, practice {} is now {}.", practice.id, practice.state);
        }
        Commands::EmployerEval {
            practice,
            scores,
            comments,
        } => {
            let controller = &app.controller;
            let caller = &caller;
            let outcome = retry_on_conflict(EVALUATION_ATTEMPTS, move || {
                let (scores, comments) = (scores.clone(), comments.clone());
                async move {
                    controller
                        .record_employer_evaluation(caller, practice, scores, comments)
                        .await
                }
            })
            .await?;
            print_evaluation("Employer", &outcome);
        }
        Commands::ReportEval {
            practice,
            score,
            comments,
        } => {
            let controller = &app.controller;
            let caller = &caller;
            let outcome = retry_on_conflict(EVALUATION_ATTEMPTS, move || {
                let comments = comments.clone();
                async move {
                    controller
                        .record_report_evaluation(caller, practice, score, comments)
                        .await
                }
            })
            .await?;
            print_evaluation("Report", &outcome);
        }
        Commands::Close { practice } => {
            let record = app.controller.close(&caller, practice).await?;
            println!(
                "Practice {} closed with final grade {:.2} (policy v{}).",
                record.practice_id, record.final_grade, record.policy_version
            );
        }
        Commands::Show { practice } => {
            let practice = app.controller.practice(practice).await?;
            println!("Practice {} ({})", practice.id, practice.kind);
            println!("- state: {} (revision {})", practice.state, practice.revision);
            println!("- student: {}", practice.student_id);
            match practice.supervisor_id {
                Some(supervisor) => println!("- supervisor: {supervisor}"),
                None => println!("- supervisor: unassigned"),
            }
            println!("- program: {}", practice.program_id);
            println!("- dates: {} to {}", practice.start_date, practice.end_date);
            if let Some(document) = &practice.report_document_ref {
                println!("- report: {document}");
            }
            if let Some(evaluation) = app.store.get_employer_evaluation(practice.id).await? {
                println!("- employer score: {:.2}", evaluation.final_score);
            }
            if let Some(evaluation) = app.store.get_report_evaluation(practice.id).await? {
                println!("- report score: {:.2}", evaluation.score);
            }
            if let (Some(grade), Some(version)) = (practice.computed_grade, practice.policy_version) {
                println!("- computed grade: {grade:.2} (policy v{version})");
            }
            if let Some(record) = app.store.get_final_record(practice.id).await? {
                println!("- closed on {} by {}", record.closed_at.date_naive(), record.closed_by);
            }
        }
        Commands::Alerts { scope } => {
            let alerts = app.engine.scan(scope.scope(), today).await?;
            if alerts.is_empty() {
                println!("No alerts for this scope.");
                return Ok(());
            }
            for alert in alerts {
                println!("- [{}] {}: {}", alert.id, alert.title, alert.description);
            }
        }
        Commands::SendAlert {
            practice,
            to,
            subject,
            message,
        } => {
            let receipt = app
                .engine
                .dispatch(
                    &caller,
                    ManualAlert {
                        practice_id: practice,
                        recipient: to,
                        subject,
                        message,
                    },
                )
                .await?;
            println!(
                "Alert sent to {} {} (audit {}).",
                receipt.recipient_kind.as_str(),
                receipt.recipient_id,
                receipt.audit_id
            );
        }
        Commands::Audit {
            practice,
            actor,
            action,
            since_days,
            limit,
            offset,
        } => {
            let filter = AuditFilter {
                entity_type: practice.map(|_| EntityType::Practice),
                entity_id: practice.map(|id| id.to_string()),
                actor_user_id: actor,
                action,
                from: since_days.map(|days| Utc::now() - Duration::days(days)),
                to: None,
            };
            let entries = app.recorder.query(&filter, Page::new(limit, offset)).await?;
            if entries.is_empty() {
                println!("No audit entries match.");
                return Ok(());
            }
            for entry in entries {
                println!(
                    "{} {} by {} on {} {}: {}",
                    entry.occurred_at.format("%Y-%m-%d %H:%M"),
                    entry.action,
                    entry.actor_user_id,
                    entry.entity_type,
                    entry.entity_id,
                    entry.description
                );
            }
        }
        Commands::Policy { command } => match command {
            PolicyCommand::Show => {
                let current = policy::current_policy(app.store.as_ref()).await?;
                println!(
                    "Policy v{}: employer {}% / report {}%",
                    current.version, current.employer_weight_pct, current.report_weight_pct
                );
            }
            PolicyCommand::Set {
                expected_version,
                employer,
                report,
            } => {
                let next =
                    policy::update_policy(app.store.as_ref(), &caller, expected_version, employer, report)
                        .await?;
                println!("Policy v{} is now active.", next.version);
            }
        },
        Commands::Export { scope, out } => {
            let rows = app.store.export_rows(scope.scope()).await?;
            let file = std::fs::File::create(&out)
                .with_context(|| format!("cannot create {}", out.display()))?;
            let written = csvio::write_export(file, &rows)?;
            println!("Exported {written} practices to {}.", out.display());
        }
        Commands::Import { csv } => {
            let created = csvio::import_practices(&app.controller, &caller, &csv).await?;
            println!("Created {created} practices from {}.", csv.display());
        }
        Commands::Report { scope, out } => {
            let practices = app.store.list_practices(scope.scope()).await?;
            let alerts = app.engine.scan(scope.scope(), today).await?;
            let label = scope.label();
            let report = report::build_report(label.as_deref(), today, &practices, &alerts);
            std::fs::write(&out, report)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}

fn print_evaluation(label: &str, outcome: &lifecycle::EvaluationOutcome) {
    println!("{label} evaluation recorded with score {:.2}.", outcome.score);
    match (outcome.completed, outcome.practice.computed_grade) {
        (true, Some(grade)) => println!(
            "Both evaluations are in; computed grade {grade:.2}, practice is {}.",
            outcome.practice.state
        ),
        _ => println!("Waiting for the other evaluation."),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            match err.downcast_ref::<PracticeError>() {
                Some(core) => eprintln!("{}: {core}", core.kind().code()),
                None => eprintln!("error: {err:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn criterion_scores_parse_from_pairs() {
        let score = parse_criterion_score("teamwork = 6").unwrap();
        assert_eq!(score.criterion_id, "teamwork");
        assert_eq!(score.score, 6);
        assert!(parse_criterion_score("teamwork").is_err());
        assert!(parse_criterion_score("teamwork=high").is_err());
    }

    #[test]
    fn identity_flags_build_the_caller() {
        let cli = Cli::parse_from([
            "practice-lifecycle",
            "--role",
            "coordinator",
            "--user-id",
            "100",
            "--scope-id",
            "1",
            "accept",
            "00000000-0000-0000-0000-000000000000",
        ]);
        let caller = cli.identity.caller();
        assert_eq!(caller.role, Role::Coordinator);
        assert!(caller.owns_program(1));
        assert_eq!(caller.origin, "cli");
    }

    #[test]
    fn commands_need_an_identity() {
        let missing_role = Cli::try_parse_from(["practice-lifecycle", "--user-id", "150", "policy", "show"]);
        assert!(matches!(
            missing_role.map(|_| ()).unwrap_err().kind(),
            clap::error::ErrorKind::MissingRequiredArgument
        ));
        let anonymous = Cli::try_parse_from([
            "practice-lifecycle",
            "close",
            "00000000-0000-0000-0000-000000000000",
        ]);
        assert!(anonymous.is_err());
    }

    #[test]
    fn recipients_are_student_or_supervisor() {
        assert_eq!(parse_recipient("Student").unwrap(), RecipientKind::Student);
        assert!(parse_recipient("coordinator").is_err());
    }
}
