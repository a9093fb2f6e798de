mod browser;
mod config;
mod dates;
mod error;
mod extract;
mod history;
mod job;
mod lock;
mod logging;
mod message;
mod notify;
mod scan;
mod schedule;
mod state;

use std::path::PathBuf;
use std::process::exit;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};

use config::{FetcherKind, NotifyMode, Settings};
use dates::DateParser;
use job::RunOptions;
use logging::{init_logging, LoggingConfig};
use notify::{Notification, Notifier, NotifyEvent};

// ======================================================
// CLI
// ======================================================

#[derive(Parser)]
#[command(name = "doctobot")]
#[command(about = "Watch a Doctolib search for near-term appointments and send alerts")]
#[command(version)]
struct Cli {
    /// YAML configuration file (defaults to $DOCTOBOT_CONFIG when set)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level: trace | debug | info | warn | error
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Emit logs as JSON on stderr
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan once, notify, and exit (the default when no command is given)
    Run(RunArgs),
    /// Run on a cron schedule until interrupted
    Watch {
        /// 5-field cron expression, evaluated in the configured time zone
        #[arg(long)]
        schedule: String,

        #[command(flatten)]
        run: RunArgs,
    },
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },
    Notify {
        #[command(subcommand)]
        command: NotifyCommands,
    },
    /// Parse an availability phrase as a card would be parsed
    ParseDate {
        text: String,
    },
    /// Show the resolved configuration with secrets masked
    Config,
    Version,
}

#[derive(Args, Clone, Default)]
struct RunArgs {
    /// Days ahead to report, counted from today (inclusive)
    #[arg(long)]
    window: Option<u32>,

    /// Print the message instead of sending it; never writes state
    #[arg(long)]
    print_only: bool,

    /// Notify only when the result differs from the last delivered one
    #[arg(long)]
    only_changes: bool,

    /// In change-only mode, also notify when nothing is found
    #[arg(long)]
    notify_when_empty: bool,

    /// How to obtain the search page
    #[arg(long, value_enum)]
    fetcher: Option<FetcherKind>,

    /// Full search URL, overriding specialty and city
    #[arg(long)]
    url: Option<String>,
}

#[derive(Subcommand)]
enum StateCommands {
    /// Print the last delivered state
    Show,
    /// Delete the state file
    Reset,
}

#[derive(Subcommand)]
enum HistoryCommands {
    List {
        /// Number of most recent runs to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Recompute record hashes and report tampered files
    Verify,
}

#[derive(Subcommand)]
enum NotifyCommands {
    /// Send a test message through every configured channel
    Test,
}

// ======================================================
// SETUP
// ======================================================

fn apply_run_args(settings: &mut Settings, args: &RunArgs) -> error::Result<()> {
    if let Some(window) = args.window {
        settings.window_days = window;
    }
    if args.only_changes {
        settings.mode = NotifyMode::Changes;
    }
    if args.notify_when_empty {
        settings.notify_when_empty = true;
    }
    if let Some(kind) = args.fetcher {
        settings.fetcher.kind = kind;
    }
    if let Some(url) = &args.url {
        settings.search.url = Some(url.clone());
    }
    settings.validate()
}

fn load_settings(cli: &Cli, run: Option<&RunArgs>) -> error::Result<Settings> {
    let mut settings = Settings::load(cli.config.as_deref())?;

    if let Some(level) = &cli.log_level {
        settings.log.level = level.clone();
    }
    if cli.log_json {
        settings.log.json = true;
    }
    if let Some(args) = run {
        apply_run_args(&mut settings, args)?;
    }

    Ok(settings)
}

// ======================================================
// MAIN
// ======================================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let run_args = match &cli.command {
        None => Some(RunArgs::default()),
        Some(Commands::Run(args)) => Some(args.clone()),
        Some(Commands::Watch { run, .. }) => Some(run.clone()),
        _ => None,
    };

    let settings = match load_settings(&cli, run_args.as_ref()) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}", e);
            exit(job::EXIT_FATAL);
        }
    };

    init_logging(LoggingConfig::new(&settings.log.level, settings.log.json));

    let code = match cli.command {

        // ==================================================
        // RUN
        // ==================================================

        None | Some(Commands::Run(_)) => {
            let opts = RunOptions {
                print_only: run_args.map(|a| a.print_only).unwrap_or(false),
            };
            run_job(&settings, opts).await
        }

        // ==================================================
        // WATCH
        // ==================================================

        Some(Commands::Watch { schedule, run }) => {
            let opts = RunOptions { print_only: run.print_only };
            match watch(&settings, &schedule, opts).await {
                Ok(()) => job::EXIT_OK,
                Err(e) => {
                    eprintln!("Watch failed: {}", e);
                    job::exit_code_for(&e)
                }
            }
        }

        // ==================================================
        // ADMIN
        // ==================================================

        Some(Commands::State { command }) => report(state_command(&settings, command)),
        Some(Commands::History { command }) => report(history_command(&settings, command)),
        Some(Commands::Config) => report(show_config(&settings)),

        Some(Commands::Notify { command: NotifyCommands::Test }) => notify_test(&settings).await,

        Some(Commands::ParseDate { text }) => parse_date(&settings, &text),

        Some(Commands::Version) => {
            println!("doctobot {}", env!("CARGO_PKG_VERSION"));
            job::EXIT_OK
        }
    };

    exit(code);
}

fn report(result: Result<()>) -> i32 {
    match result {
        Ok(()) => job::EXIT_OK,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            job::EXIT_FATAL
        }
    }
}

// ======================================================
// JOB COMMANDS
// ======================================================

fn build_runtime(settings: &Settings) -> error::Result<(Box<dyn browser::PageSource>, Notifier)> {
    let source = browser::from_config(&settings.fetcher, &settings.timezone)?;
    let notifier = Notifier::from_settings(settings)?;
    Ok((source, notifier))
}

async fn run_job(settings: &Settings, opts: RunOptions) -> i32 {
    let (source, notifier) = match build_runtime(settings) {
        Ok(parts) => parts,
        Err(e) => {
            eprintln!("Startup failed: {}", e);
            return job::record_startup_failure(settings, &e);
        }
    };

    job::execute(settings, source.as_ref(), &notifier, opts).await
}

async fn watch(settings: &Settings, expr: &str, opts: RunOptions) -> error::Result<()> {
    // Reject a bad expression before looking for a browser.
    schedule::parse_schedule(expr)?;
    let (source, notifier) = build_runtime(settings)?;
    schedule::watch(settings, expr, source.as_ref(), &notifier, opts).await
}

async fn notify_test(settings: &Settings) -> i32 {
    let notifier = match Notifier::from_settings(settings) {
        Ok(n) => n,
        Err(e) => {
            eprintln!("Notifier setup failed: {}", e);
            return job::EXIT_FATAL;
        }
    };

    if notifier.channel_labels().is_empty() {
        println!("No notification channel configured; the message below would be printed by each run.");
    }

    let note = Notification {
        event: NotifyEvent::Test,
        message: "✅ doctobot : notification de test.".to_string(),
        found: 0,
    };

    let outcome = notifier.deliver(&note).await;
    for delivery in &outcome.deliveries {
        match &delivery.result {
            Ok(()) => println!("{:<10} ok", delivery.channel),
            Err(e) => println!("{:<10} FAILED: {}", delivery.channel, e),
        }
    }

    if outcome.ok() {
        job::EXIT_OK
    } else {
        job::EXIT_DELIVERY_FAILED
    }
}

fn parse_date(settings: &Settings, text: &str) -> i32 {
    let tz = match settings.tz() {
        Ok(tz) => tz,
        Err(e) => {
            eprintln!("{}", e);
            return job::EXIT_FATAL;
        }
    };

    let today = scan::local_today(tz, Utc::now());
    match DateParser::new().parse(text, today) {
        Some(found) => {
            println!("{}", found);
            job::EXIT_OK
        }
        None => {
            println!("No availability date recognized.");
            job::EXIT_FATAL
        }
    }
}

// ======================================================
// ADMIN COMMANDS
// ======================================================

fn state_command(settings: &Settings, command: StateCommands) -> Result<()> {
    let path = settings.state_path().context("resolving state path")?;

    match command {
        StateCommands::Show => {
            let current = state::load(&path);
            println!("State file: {}", path.display());
            if let Some(updated) = &current.updated_at {
                println!("Updated:    {}", updated);
            }
            if current.items.is_empty() {
                println!("No availabilities recorded.");
            } else {
                for item in &current.items {
                    println!("{}  {}  {}", item.day, item.name, item.url);
                }
            }
        }
        StateCommands::Reset => {
            let removed = state::reset(&path)
                .with_context(|| format!("removing {}", path.display()))?;
            if removed {
                println!("State reset: {}", path.display());
            } else {
                println!("No state file at {}", path.display());
            }
        }
    }

    Ok(())
}

fn history_command(settings: &Settings, command: HistoryCommands) -> Result<()> {
    let dir = settings.history_dir().context("resolving history directory")?;

    match command {
        HistoryCommands::List { limit } => {
            let records = history::load_all(&dir)
                .with_context(|| format!("reading {}", dir.display()))?;
            history::print_table(&records, limit);
        }
        HistoryCommands::Verify => {
            let bad = history::verify(&dir)
                .with_context(|| format!("verifying {}", dir.display()))?;
            if bad.is_empty() {
                println!("All history records verified.");
            } else {
                for path in &bad {
                    println!("TAMPERED  {}", path.display());
                }
                anyhow::bail!("{} history record(s) failed verification", bad.len());
            }
        }
    }

    Ok(())
}

fn show_config(settings: &Settings) -> Result<()> {
    let yaml = settings.masked().to_yaml().context("rendering configuration")?;
    print!("{}", yaml);
    Ok(())
}
