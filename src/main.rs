use std::path::PathBuf;

use anyhow::Context;
use chrono::{Local, NaiveDate};
use clap::{Parser, Subcommand};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing_subscriber::EnvFilter;

mod calendar;
mod config;
mod db;
mod forms;
mod hr_report;
mod models;
mod notify;
mod participants;
mod provision;
mod results;
mod rows;
mod scheduler;
mod settings;
mod store;
mod template;

use config::AppConfig;
use notify::OpsChannel;
use store::fs::FsWorkspace;

#[derive(Parser)]
#[command(name = "cohort-flow")]
#[command(about = "Scheduled email flow and survey results for coaching cohorts", long_about = None)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, global = true, default_value = config::CONFIG_FILE)]
    config: PathBuf,
    /// Workspace directory, overrides the environment and config file
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the notification schema
    InitDb,
    /// Send every email due in the cohort's flow
    SendEmails {
        /// Run as if today were this date (YYYY-MM-DD)
        #[arg(long)]
        today: Option<NaiveDate>,
    },
    /// Compile the newest response of a survey form into the results book
    FormSubmit {
        #[arg(long)]
        form: String,
    },
    /// Turn the flow's business-day offsets into dates
    Provision {
        /// Coaching call dates, one per session in order
        #[arg(long = "anchor", required = true, num_args = 1..)]
        anchors: Vec<NaiveDate>,
        /// First session date, the base for participant start emails
        #[arg(long)]
        session1: Option<NaiveDate>,
        /// Flow template sheet to read instead of the configured flow
        #[arg(long)]
        flow_sheet: Option<String>,
        /// Remove leftover rows below the flow instead of blanking them
        #[arg(long)]
        prune: bool,
    },
    /// Share the cohort folder, install triggers and open surveys
    StartCohort,
    /// Remove triggers, close surveys and mark the cohort completed
    EndCohort,
    /// Add business days to a date, skipping weekends and holidays
    BusinessDays {
        #[arg(long)]
        from: NaiveDate,
        #[arg(long, allow_negative_numbers = true)]
        days: i64,
    },
    /// List the most recent persisted notifications
    Notifications {
        #[arg(long)]
        cohort: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load(&cli.config)?;
    if let Some(workspace) = cli.workspace {
        config.workspace = workspace;
    }

    let ops = OpsChannel::new();
    let result = run(cli.command, &config, &ops).await;
    flush_notifications(&config, &ops).await;
    result
}

async fn run(command: Commands, config: &AppConfig, ops: &OpsChannel) -> anyhow::Result<()> {
    let layout = &config.layout;

    match command {
        Commands::InitDb => {
            let pool = connect(config).await?;
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::SendEmails { today } => {
            let now = match today {
                Some(date) => date.and_time(Local::now().time()),
                None => Local::now().naive_local(),
            };
            let mut workspace = open_workspace(config)?;
            let mut gw = workspace.gateways(ops);
            let summary = scheduler::send_emails(&mut gw, layout, now)?;

            println!(
                "{} due, {} marked sent: {} emails sent, {} failed, {} skipped, {} previews.",
                summary.due,
                summary.marked,
                summary.sent,
                summary.failed,
                summary.skipped,
                summary.previews
            );
            if summary.finished {
                println!("Every email in the flow has been sent.");
            }
        }
        Commands::FormSubmit { form } => {
            let mut workspace = open_workspace(config)?;
            let mut gw = workspace.gateways(ops);

            match results::form_submit(&mut gw, layout, &form)? {
                Some(outcome) => {
                    let book = outcome.results_book.as_deref().unwrap_or("-");
                    println!(
                        "Compiled {} responses for {} into {}{}.",
                        outcome.responses,
                        outcome.participant_id,
                        book,
                        if outcome.created_results { " (new)" } else { "" }
                    );
                    if outcome.goals_captured > 0 {
                        println!("Captured {} program goals.", outcome.goals_captured);
                    }
                }
                None => println!("Nothing to compile for form {form}."),
            }
        }
        Commands::Provision {
            anchors,
            session1,
            flow_sheet,
            prune,
        } => {
            let mut workspace = open_workspace(config)?;
            let mut gw = workspace.gateways(ops);
            let dated = provision::provision_flow(
                &mut gw,
                layout,
                flow_sheet.as_deref(),
                &anchors,
                session1,
                prune,
            )?;
            println!("Dated {dated} flow rows into {}.", layout.flow_sheet);
        }
        Commands::StartCohort => {
            let mut workspace = open_workspace(config)?;
            let mut gw = workspace.gateways(ops);
            provision::start_cohort(&mut gw, layout)?;
            println!("Cohort {} started.", layout.cohort_book);
        }
        Commands::EndCohort => {
            let mut workspace = open_workspace(config)?;
            let mut gw = workspace.gateways(ops);
            provision::end_cohort(&mut gw, layout, Local::now().date_naive())?;
            println!("Cohort {} completed.", layout.cohort_book);
        }
        Commands::BusinessDays { from, days } => {
            let date = calendar::add_business_days(from, days);
            println!("{}", date.format("%Y-%m-%d"));
            if let Some(name) = calendar::holiday(from) {
                println!("Note: {from} is {name}.");
            }
        }
        Commands::Notifications { cohort, limit } => {
            let pool = connect(config).await?;
            let stored = db::fetch_recent(&pool, cohort.as_deref(), limit).await?;

            if stored.is_empty() {
                println!("No notifications recorded.");
                return Ok(());
            }

            for entry in stored {
                let note = entry.notification;
                println!(
                    "{} [{}] {}: {}",
                    note.raised_at.format("%Y-%m-%d %H:%M"),
                    note.level,
                    entry.cohort,
                    note.message
                );
            }
        }
    }

    Ok(())
}

fn open_workspace(config: &AppConfig) -> anyhow::Result<FsWorkspace> {
    FsWorkspace::open(&config.workspace)
        .with_context(|| format!("failed to open workspace {}", config.workspace.display()))
}

async fn connect(config: &AppConfig) -> anyhow::Result<PgPool> {
    let database_url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

/// Persist buffered notifications. Failures are logged and never returned.
async fn flush_notifications(config: &AppConfig, ops: &OpsChannel) {
    let pending = ops.drain();
    if pending.is_empty() || config.database_url.is_none() {
        return;
    }

    let flushed = async {
        let pool = connect(config).await?;
        db::insert_notifications(&pool, &config.layout.cohort_book, &pending).await
    }
    .await;

    match flushed {
        Ok(count) => tracing::debug!(count, "flushed notifications"),
        Err(err) => tracing::error!(error = %format!("{err:#}"), "failed to persist notifications"),
    }
}
