use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tracing::{info, warn};

use crate::browser::PageSource;
use crate::config::Settings;
use crate::error::{Error, Result};
use crate::job::{self, RunOptions};
use crate::notify::Notifier;

/// Parse a standard 5-field cron expression. The cron crate wants a seconds
/// field, so 5-field input gets "0 " prepended; 6/7-field input is used as is.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let fields = expr.split_whitespace().count();
    let full = match fields {
        5 => format!("0 {}", expr.trim()),
        6 | 7 => expr.trim().to_string(),
        _ => {
            return Err(Error::config(format!(
                "invalid cron expression '{}': expected 5 fields",
                expr
            )))
        }
    };

    Schedule::from_str(&full)
        .map_err(|e| Error::config(format!("invalid cron expression '{}': {}", expr, e)))
}

/// Next slot strictly after `after`, evaluated in the search's time zone.
pub fn next_fire(schedule: &Schedule, tz: Tz, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
}

/// Run the job at every slot of `expr` until Ctrl-C. Runs never overlap; a
/// slot that passes while a run is still going is skipped.
pub async fn watch(
    settings: &Settings,
    expr: &str,
    source: &dyn PageSource,
    notifier: &Notifier,
    opts: RunOptions,
) -> Result<()> {
    let schedule = parse_schedule(expr)?;
    let tz = settings.tz()?;

    info!(schedule = expr, timezone = %tz, channels = ?notifier.channel_labels(), "watch mode started");

    loop {
        let now = Utc::now();
        let Some(next) = next_fire(&schedule, tz, now) else {
            warn!(schedule = expr, "schedule has no upcoming slot, stopping");
            return Ok(());
        };

        info!(next = %next.with_timezone(&tz).to_rfc3339(), "waiting for next slot");
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping watch mode");
                return Ok(());
            }
        }

        let code = job::execute(settings, source, notifier, opts).await;
        if code == job::EXIT_OK {
            info!(exit_code = code, "scheduled run finished");
        } else {
            warn!(exit_code = code, "scheduled run finished with errors");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn five_field_expressions_are_accepted() {
        assert!(parse_schedule("0 */2 * * *").is_ok());
        assert!(parse_schedule("30 7 * * 1-5").is_ok());
    }

    #[test]
    fn six_field_expressions_pass_through() {
        assert!(parse_schedule("0 0 8 * * *").is_ok());
    }

    #[test]
    fn malformed_expressions_are_config_errors() {
        assert!(matches!(parse_schedule("every hour"), Err(Error::Config(_))));
        assert!(matches!(parse_schedule("99 * * * *"), Err(Error::Config(_))));
        assert!(matches!(parse_schedule(""), Err(Error::Config(_))));
    }

    #[test]
    fn next_fire_uses_local_time() {
        // 08:00 every day, Paris time. In March 2025 (before DST) Paris is UTC+1.
        let schedule = parse_schedule("0 8 * * *").unwrap();
        let after = Utc.with_ymd_and_hms(2025, 3, 10, 6, 30, 0).unwrap();

        let next = next_fire(&schedule, chrono_tz::Europe::Paris, after).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 10, 7, 0, 0).unwrap());
        assert_eq!(next.with_timezone(&chrono_tz::Europe::Paris).hour(), 8);
    }

    #[test]
    fn next_fire_is_strictly_after() {
        let schedule = parse_schedule("0 * * * *").unwrap();
        let at_slot = Utc.with_ymd_and_hms(2025, 3, 10, 9, 0, 0).unwrap();
        let next = next_fire(&schedule, chrono_tz::UTC, at_slot).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 3, 10, 10, 0, 0).unwrap());
    }
}
