use std::fmt::Write;

use chrono::NaiveDate;

use crate::models::{Alert, AlertLevel, Practice, PracticeState, StateSummary};

pub fn summarize_by_state(practices: &[Practice]) -> Vec<StateSummary> {
    PracticeState::ALL
        .iter()
        .filter_map(|state| {
            let in_state: Vec<&Practice> = practices.iter().filter(|p| p.state == *state).collect();
            if in_state.is_empty() {
                return None;
            }
            let grades: Vec<f64> = in_state.iter().filter_map(|p| p.computed_grade).collect();
            let avg_grade = if grades.is_empty() {
                None
            } else {
                Some(grades.iter().sum::<f64>() / grades.len() as f64)
            };
            Some(StateSummary {
                state: *state,
                count: in_state.len(),
                avg_grade,
            })
        })
        .collect()
}

pub fn build_report(scope: Option<&str>, today: NaiveDate, practices: &[Practice], alerts: &[Alert]) -> String {
    let summaries = summarize_by_state(practices);

    let mut output = String::new();
    let scope_label = scope.unwrap_or("all programs");
    let open = practices.iter().filter(|p| !p.state.is_terminal()).count();

    let _ = writeln!(output, "# Practice Operations Report");
    let _ = writeln!(
        output,
        "Generated for {} on {} ({} open of {} practices)",
        scope_label,
        today,
        open,
        practices.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Alerts");

    if alerts.is_empty() {
        let _ = writeln!(output, "No alerts for this scope.");
    } else {
        for alert in alerts {
            let marker = match alert.level {
                AlertLevel::Warning => "WARNING",
                AlertLevel::Info => "info",
            };
            let _ = writeln!(
                output,
                "- [{}] {} ({}): {}",
                marker, alert.title, alert.count, alert.description
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Practices by State");

    if summaries.is_empty() {
        let _ = writeln!(output, "No practices recorded for this scope.");
    } else {
        for summary in summaries.iter() {
            match summary.avg_grade {
                Some(avg) => {
                    let _ = writeln!(
                        output,
                        "- {}: {} (avg grade {:.2})",
                        summary.state, summary.count, avg
                    );
                }
                None => {
                    let _ = writeln!(output, "- {}: {}", summary.state, summary.count);
                }
            }
        }
    }

    let mut running: Vec<&Practice> = practices
        .iter()
        .filter(|p| p.state == PracticeState::EnCurso)
        .collect();
    running.sort_by_key(|p| p.end_date);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Ending Soonest");

    if running.is_empty() {
        let _ = writeln!(output, "No practices in progress.");
    } else {
        for practice in running.iter().take(5) {
            let days_left = (practice.end_date - today).num_days();
            let _ = writeln!(
                output,
                "- {} (student {}) ends {} ({} days)",
                practice.id, practice.student_id, practice.end_date, days_left
            );
        }
    }

    output
}
