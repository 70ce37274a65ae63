//! Weight policy administration.
//!
//! Readers get an immutable [`WeightPolicy`] snapshot from the store; writers
//! go through [`update_policy`], which validates the 100% split before the
//! versioned compare-and-set.

use serde_json::json;
use tracing::info;

use crate::audit;
use crate::error::{PracticeError, Result};
use crate::models::{AuditAction, Caller, EntityType, Role, WeightPolicy};
use crate::scoring;
use crate::store::PracticeStore;

pub async fn current_policy(store: &dyn PracticeStore) -> Result<WeightPolicy> {
    let policy = store.current_policy().await?;
    scoring::validate_policy(&policy)?;
    Ok(policy)
}

pub async fn update_policy(
    store: &dyn PracticeStore,
    caller: &Caller,
    expected_version: i64,
    employer_weight_pct: i32,
    report_weight_pct: i32,
) -> Result<WeightPolicy> {
    if caller.role != Role::SuperAdmin {
        return Err(PracticeError::unauthorized(format!(
            "{} {} cannot change the evaluation weights",
            caller.role, caller.user_id
        )));
    }
    let version = expected_version
        .checked_add(1)
        .ok_or_else(|| PracticeError::validation(format!("policy version {expected_version} cannot be advanced")))?;
    let next = WeightPolicy {
        version,
        employer_weight_pct,
        report_weight_pct,
    };
    scoring::validate_policy(&next)?;

    let entry = audit::entry(
        caller,
        AuditAction::PolicyUpdated,
        EntityType::WeightPolicy,
        next.version.to_string(),
        format!("evaluation weights set to employer {employer_weight_pct}% / report {report_weight_pct}%"),
        json!({
            "previous_version": expected_version,
            "employer_weight_pct": employer_weight_pct,
            "report_weight_pct": report_weight_pct,
        }),
    );
    store.replace_policy(expected_version, next, entry).await?;
    info!(version = next.version, employer_weight_pct, report_weight_pct, "weight policy updated");
    Ok(next)
}
