use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use crate::browser::PageSource;
use crate::config::{NotifyMode, Settings};
use crate::dates::DateParser;
use crate::error::{Error, Result};
use crate::extract;
use crate::history::{self, RunRecord};
use crate::lock::RunLock;
use crate::message::{self, Heading, MessageKind};
use crate::notify::{Notification, Notifier, NotifyEvent};
use crate::scan::{self, Listing};
use crate::state::{self, StateDiff, StateItem};

// ======================================================
// EXIT CODES
// ======================================================

pub const EXIT_OK: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_DELIVERY_FAILED: i32 = 2;
pub const EXIT_LOCKED: i32 = 3;

pub fn exit_code_for(err: &Error) -> i32 {
    match err {
        Error::Lock(_) => EXIT_LOCKED,
        Error::Notify { .. } => EXIT_DELIVERY_FAILED,
        _ => EXIT_FATAL,
    }
}

// ======================================================
// TYPES
// ======================================================

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Print the message instead of delivering it. Never writes state.
    pub print_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Notified,
    PrintedOnly,
    Unchanged,
    DeliveryFailed,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Notified       => "notified",
            Outcome::PrintedOnly    => "printed",
            Outcome::Unchanged      => "unchanged",
            Outcome::DeliveryFailed => "delivery_failed",
        }
    }
}

#[derive(Debug)]
pub struct RunSummary {
    pub listings: Vec<Listing>,
    /// Only computed in change-only mode.
    pub diff: Option<StateDiff>,
    pub message: Option<String>,
    pub outcome: Outcome,
    pub state_saved: bool,
}

impl RunSummary {
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            Outcome::DeliveryFailed => EXIT_DELIVERY_FAILED,
            _ => EXIT_OK,
        }
    }
}

// ======================================================
// DECISION
// ======================================================

/// Which message, if any, a run sends.
pub fn decide(
    mode: NotifyMode,
    notify_when_empty: bool,
    old: &[StateItem],
    new: &[StateItem],
    diff: &StateDiff,
) -> Option<MessageKind> {
    match mode {
        NotifyMode::Always => Some(MessageKind::Current),
        NotifyMode::Changes => {
            if old.is_empty() && new.is_empty() {
                notify_when_empty.then_some(MessageKind::NothingDetected)
            } else if !diff.is_empty() {
                if new.is_empty() {
                    Some(MessageKind::NoLongerAvailable)
                } else {
                    Some(MessageKind::Current)
                }
            } else {
                None
            }
        }
    }
}

fn event_for(kind: MessageKind, found: usize) -> NotifyEvent {
    match kind {
        MessageKind::Current if found > 0 => NotifyEvent::Availabilities,
        MessageKind::NoLongerAvailable => NotifyEvent::NoLongerAvailable,
        _ => NotifyEvent::NothingDetected,
    }
}

// ======================================================
// RUN
// ======================================================

/// One complete job: lock, fetch, select, decide, deliver, persist state.
pub async fn run_once(
    settings: &Settings,
    source: &dyn PageSource,
    notifier: &Notifier,
    opts: RunOptions,
    now: DateTime<Utc>,
) -> Result<RunSummary> {
    let _lock = RunLock::acquire(&settings.lock_path()?)?;

    let tz = settings.tz()?;
    let url = settings.search_url()?;

    let html = source.fetch(&url).await?;
    let cards = extract::cards(&html, &url, &settings.link_fragment())?;

    let today = scan::local_today(tz, now);
    let listings = scan::select(&cards, &DateParser::new(), today, settings.window_days);

    info!(
        source = source.name(),
        cards = cards.len(),
        found = listings.len(),
        window_days = settings.window_days,
        %today,
        "scan complete"
    );

    for listing in &listings {
        println!("{}", listing.console_line());
    }

    // Change detection
    let state_path = settings.state_path()?;
    let new_items = state::canonicalize(&listings);
    let (kind, diff) = match settings.mode {
        NotifyMode::Always => (decide(settings.mode, false, &[], &new_items, &StateDiff::default()), None),
        NotifyMode::Changes => {
            let old = state::load(&state_path).items;
            let diff = state::diff(&old, &new_items);
            info!(added = diff.added.len(), removed = diff.removed.len(), "compared with saved state");
            (decide(settings.mode, settings.notify_when_empty, &old, &new_items, &diff), Some(diff))
        }
    };

    let Some(kind) = kind else {
        info!("no change since last notification, nothing to send");
        return Ok(RunSummary {
            listings,
            diff,
            message: None,
            outcome: Outcome::Unchanged,
            state_saved: false,
        });
    };

    let heading = Heading {
        specialty: settings.specialty(),
        city: settings.city(),
        window_days: settings.window_days,
    };
    let text = message::render(kind, &heading, &listings);

    if opts.print_only {
        println!("\n--- MESSAGE ---\n{}", text);
        return Ok(RunSummary {
            listings,
            diff,
            message: Some(text),
            outcome: Outcome::PrintedOnly,
            state_saved: false,
        });
    }

    let note = Notification {
        event: event_for(kind, listings.len()),
        message: text,
        found: listings.len(),
    };
    let report = notifier.deliver(&note).await;

    if report.console_only {
        debug!("no channel configured, message went to stdout");
    }

    if !report.ok() {
        let failed: Vec<&str> = report.failures().map(|d| d.channel).collect();
        warn!(channels = ?failed, "delivery failed, state left unchanged");
        // State stays as it was, so the next run retries the same change.
        return Ok(RunSummary {
            listings,
            diff,
            message: Some(note.message),
            outcome: Outcome::DeliveryFailed,
            state_saved: false,
        });
    }

    let changed = diff.as_ref().is_some_and(|d| !d.is_empty());
    if changed {
        state::save(&state_path, &new_items)?;
    }

    Ok(RunSummary {
        listings,
        diff,
        message: Some(note.message),
        outcome: Outcome::Notified,
        state_saved: changed,
    })
}

/// Run once, record the run in history, and return the process exit code.
pub async fn execute(
    settings: &Settings,
    source: &dyn PageSource,
    notifier: &Notifier,
    opts: RunOptions,
) -> i32 {
    let mut record = RunRecord::new(&settings.mode.to_string());

    let exit_code = match run_once(settings, source, notifier, opts, Utc::now()).await {
        Ok(summary) => {
            record.found = summary.listings.len();
            if let Some(diff) = &summary.diff {
                record.added = diff.added.len();
                record.removed = diff.removed.len();
            }
            record.notified = summary.outcome == Outcome::Notified;
            record.outcome = summary.outcome.label().to_string();

            info!(
                outcome = summary.outcome.label(),
                found = summary.listings.len(),
                state_saved = summary.state_saved,
                message_chars = summary.message.as_deref().map_or(0, |m| m.chars().count()),
                "run finished"
            );

            if summary.outcome == Outcome::DeliveryFailed {
                error!("at least one notification channel failed");
            }
            summary.exit_code()
        }
        Err(e) => {
            error!(error = %e, "run failed");
            record.outcome = match &e {
                Error::Lock(_) => "locked".to_string(),
                _ => "error".to_string(),
            };
            exit_code_for(&e)
        }
    };
    record.exit_code = exit_code;

    // A locked run must not touch the data directory of the run holding the lock.
    if exit_code != EXIT_LOCKED {
        record_run(settings, &record);
    }

    exit_code
}

/// Record a run that could not start (no browser, bad HTTP client) and
/// return its exit code.
pub fn record_startup_failure(settings: &Settings, err: &Error) -> i32 {
    error!(error = %err, "run could not start");

    let mut record = RunRecord::new(&settings.mode.to_string());
    record.outcome = "error".to_string();
    record.exit_code = exit_code_for(err);
    record_run(settings, &record);

    record.exit_code
}

fn record_run(settings: &Settings, record: &RunRecord) {
    match settings.history_dir() {
        Ok(dir) => {
            if let Err(e) = history::persist(&dir, record) {
                warn!(error = %e, "failed to record run history");
            }
        }
        Err(e) => warn!(error = %e, "no history directory"),
    }
}
