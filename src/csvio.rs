use std::io::{Read, Write};
use std::path::Path;

use anyhow::Context;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::lifecycle::LifecycleController;
use crate::models::{Caller, ExportRow, NewPractice, PracticeKind};

#[derive(Serialize)]
struct CsvExportRow<'a> {
    practice_id: String,
    student_id: i64,
    student_name: &'a str,
    student_email: &'a str,
    program: &'a str,
    kind: &'static str,
    start_date: NaiveDate,
    end_date: NaiveDate,
    state: &'static str,
    final_grade: String,
}

/// One row per practice; the grade column stays empty until the practice is closed.
pub fn write_export<W: Write>(writer: W, rows: &[ExportRow]) -> anyhow::Result<usize> {
    let mut csv_writer = csv::Writer::from_writer(writer);
    for row in rows {
        csv_writer.serialize(CsvExportRow {
            practice_id: row.practice_id.to_string(),
            student_id: row.student_id,
            student_name: &row.student_name,
            student_email: &row.student_email,
            program: &row.program,
            kind: row.kind.as_str(),
            start_date: row.start_date,
            end_date: row.end_date,
            state: row.state.as_str(),
            final_grade: row
                .final_grade
                .map(|grade| format!("{grade:.2}"))
                .unwrap_or_default(),
        })?;
    }
    csv_writer.flush()?;
    Ok(rows.len())
}

#[derive(Deserialize)]
struct CsvImportRow {
    student_id: i64,
    program_id: i64,
    host_organization_id: Option<i64>,
    kind: String,
    start_date: NaiveDate,
    end_date: NaiveDate,
}

pub fn read_practices<R: Read>(reader: R) -> anyhow::Result<Vec<NewPractice>> {
    let mut csv_reader = csv::Reader::from_reader(reader);
    let mut practices = Vec::new();

    for (index, result) in csv_reader.deserialize::<CsvImportRow>().enumerate() {
        let line = index + 2;
        let row = result.with_context(|| format!("malformed practice row on line {line}"))?;
        let kind: PracticeKind = row
            .kind
            .parse()
            .with_context(|| format!("line {line}"))?;
        practices.push(NewPractice {
            student_id: row.student_id,
            program_id: row.program_id,
            host_organization_id: row.host_organization_id,
            kind,
            start_date: row.start_date,
            end_date: row.end_date,
        });
    }

    Ok(practices)
}

/// Creates every practice in the file through the controller so each one is
/// guarded and audited. Stops at the first rejected row.
pub async fn import_practices(
    controller: &LifecycleController,
    caller: &Caller,
    csv_path: &Path,
) -> anyhow::Result<usize> {
    let file = std::fs::File::open(csv_path)
        .with_context(|| format!("cannot open {}", csv_path.display()))?;
    let practices = read_practices(file)?;

    let mut created = 0usize;
    for (index, input) in practices.into_iter().enumerate() {
        let student_id = input.student_id;
        controller
            .create(caller, input)
            .await
            .with_context(|| format!("row {} (student {student_id}) was rejected", index + 1))?;
        created += 1;
    }
    info!(created, path = %csv_path.display(), "practices imported");
    Ok(created)
}
