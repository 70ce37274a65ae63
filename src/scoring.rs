//! Evaluation scoring engine.
//!
//! Pure functions only: criterion scores and a weight policy snapshot go in,
//! a grade rounded to two decimals comes out.

use std::collections::HashSet;

use crate::error::{PracticeError, Result};
use crate::models::{CriterionScore, WeightPolicy};

pub const MIN_GRADE: f64 = 1.0;
pub const MAX_GRADE: f64 = 7.0;
pub const MIN_CRITERION_SCORE: i32 = 1;
pub const MAX_CRITERION_SCORE: i32 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Criterion {
    pub id: &'static str,
    pub label: &'static str,
    pub weight_pct: i32,
}

/// Employer evaluation catalog. Weights sum to 100.
pub const EMPLOYER_CRITERIA: [Criterion; 7] = [
    Criterion {
        id: "punctuality",
        label: "Punctuality and attendance",
        weight_pct: 10,
    },
    Criterion {
        id: "responsibility",
        label: "Responsibility and commitment",
        weight_pct: 15,
    },
    Criterion {
        id: "teamwork",
        label: "Teamwork",
        weight_pct: 15,
    },
    Criterion {
        id: "communication",
        label: "Oral and written communication",
        weight_pct: 15,
    },
    Criterion {
        id: "technical_knowledge",
        label: "Technical knowledge applied to the role",
        weight_pct: 20,
    },
    Criterion {
        id: "problem_solving",
        label: "Problem solving",
        weight_pct: 15,
    },
    Criterion {
        id: "initiative",
        label: "Initiative and autonomy",
        weight_pct: 10,
    },
];

pub fn criterion(id: &str) -> Option<&'static Criterion> {
    EMPLOYER_CRITERIA.iter().find(|criterion| criterion.id == id)
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Weighted employer score over the full catalog.
pub fn compute_employer_score(scores: &[CriterionScore]) -> Result<f64> {
    let mut seen = HashSet::new();
    let mut weighted_total: i64 = 0;

    for entry in scores {
        let criterion = criterion(&entry.criterion_id).ok_or_else(|| {
            PracticeError::validation(format!("unknown criterion: {}", entry.criterion_id))
        })?;
        if !seen.insert(criterion.id) {
            return Err(PracticeError::validation(format!(
                "criterion {} scored more than once",
                criterion.id
            )));
        }
        if !(MIN_CRITERION_SCORE..=MAX_CRITERION_SCORE).contains(&entry.score) {
            return Err(PracticeError::ScoreOutOfRange {
                criterion: criterion.id.to_string(),
                score: entry.score,
            });
        }
        weighted_total += i64::from(entry.score) * i64::from(criterion.weight_pct);
    }

    let missing: Vec<String> = EMPLOYER_CRITERIA
        .iter()
        .filter(|criterion| !seen.contains(criterion.id))
        .map(|criterion| criterion.id.to_string())
        .collect();
    if !missing.is_empty() {
        return Err(PracticeError::IncompleteCriteria(missing));
    }

    Ok(round2(weighted_total as f64 / 100.0))
}

pub fn validate_policy(policy: &WeightPolicy) -> Result<()> {
    let employer = policy.employer_weight_pct;
    let report = policy.report_weight_pct;
    if employer < 0 || report < 0 || employer + report != 100 {
        return Err(PracticeError::InvalidPolicy { employer, report });
    }
    Ok(())
}

/// Checks a supervisor-assigned report grade and normalizes it to two decimals.
pub fn normalize_report_score(score: f64) -> Result<f64> {
    if !score.is_finite() || !(MIN_GRADE..=MAX_GRADE).contains(&score) {
        return Err(PracticeError::validation(format!(
            "report score {score} is outside 1.0-7.0"
        )));
    }
    Ok(round2(score))
}

pub fn compute_final_grade(employer_score: f64, report_score: f64, policy: &WeightPolicy) -> Result<f64> {
    validate_policy(policy)?;

    let weighted = employer_score * f64::from(policy.employer_weight_pct)
        + report_score * f64::from(policy.report_weight_pct);
    let grade = round2(weighted / 100.0);

    if !grade.is_finite() || !(MIN_GRADE..=MAX_GRADE).contains(&grade) {
        return Err(PracticeError::Internal(format!(
            "final grade {grade} from employer {employer_score} and report {report_score} is outside 1.0-7.0"
        )));
    }
    Ok(grade)
}
