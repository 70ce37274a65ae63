use std::str::FromStr;

use anyhow::Context;

/// Runtime knobs read from the environment. The weight policy is not here:
/// it is versioned data owned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: Option<String>,
    pub max_connections: u32,
    pub deadline_horizon_days: i64,
    pub stalled_eval_days: i64,
    /// Zero disables manual alert deduplication.
    pub alert_dedupe_hours: i64,
    pub notify_on_decline: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: None,
            max_connections: 5,
            deadline_horizon_days: 7,
            stalled_eval_days: 14,
            alert_dedupe_hours: 24,
            notify_on_decline: false,
        }
    }
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Settings::default();
        let settings = Settings {
            database_url: lookup("DATABASE_URL").filter(|value| !value.trim().is_empty()),
            max_connections: parse_or(&lookup, "PRACTICE_DB_MAX_CONNECTIONS", defaults.max_connections)?,
            deadline_horizon_days: parse_or(
                &lookup,
                "PRACTICE_DEADLINE_HORIZON_DAYS",
                defaults.deadline_horizon_days,
            )?,
            stalled_eval_days: parse_or(&lookup, "PRACTICE_STALLED_EVAL_DAYS", defaults.stalled_eval_days)?,
            alert_dedupe_hours: parse_or(&lookup, "PRACTICE_ALERT_DEDUPE_HOURS", defaults.alert_dedupe_hours)?,
            notify_on_decline: parse_flag(&lookup, "PRACTICE_NOTIFY_ON_DECLINE", defaults.notify_on_decline)?,
        };

        anyhow::ensure!(settings.max_connections > 0, "PRACTICE_DB_MAX_CONNECTIONS must be positive");
        anyhow::ensure!(
            settings.deadline_horizon_days >= 0,
            "PRACTICE_DEADLINE_HORIZON_DAYS cannot be negative"
        );
        anyhow::ensure!(settings.stalled_eval_days > 0, "PRACTICE_STALLED_EVAL_DAYS must be positive");
        anyhow::ensure!(
            settings.alert_dedupe_hours >= 0,
            "PRACTICE_ALERT_DEDUPE_HOURS cannot be negative"
        );

        Ok(settings)
    }

    pub fn require_database_url(&self) -> anyhow::Result<&str> {
        self.database_url
            .as_deref()
            .context("DATABASE_URL must be set to a production Postgres instance")
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value: {raw}")),
        _ => Ok(default),
    }
}

fn parse_flag<F>(lookup: &F, key: &str, default: bool) -> anyhow::Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|raw| raw.trim().to_ascii_lowercase()) {
        None => Ok(default),
        Some(raw) => match raw.as_str() {
            "" => Ok(default),
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("{key} must be a boolean, got {raw}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let settings = Settings::from_lookup(lookup_from(&[])).unwrap();
        assert_eq!(settings, Settings::default());
        assert!(settings.require_database_url().is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let settings = Settings::from_lookup(lookup_from(&[
            ("DATABASE_URL", "postgres://localhost/practices"),
            ("PRACTICE_DEADLINE_HORIZON_DAYS", "10"),
            ("PRACTICE_ALERT_DEDUPE_HOURS", "0"),
            ("PRACTICE_NOTIFY_ON_DECLINE", "yes"),
        ]))
        .unwrap();
        assert_eq!(settings.require_database_url().unwrap(), "postgres://localhost/practices");
        assert_eq!(settings.deadline_horizon_days, 10);
        assert_eq!(settings.alert_dedupe_hours, 0);
        assert!(settings.notify_on_decline);
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert!(Settings::from_lookup(lookup_from(&[("PRACTICE_STALLED_EVAL_DAYS", "soon")])).is_err());
        assert!(Settings::from_lookup(lookup_from(&[("PRACTICE_NOTIFY_ON_DECLINE", "maybe")])).is_err());
        assert!(Settings::from_lookup(lookup_from(&[("PRACTICE_DB_MAX_CONNECTIONS", "0")])).is_err());
    }
}
