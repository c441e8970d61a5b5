//! slot-queue - Manage the publish queue
//!
//! Unix-style tool for submitting threads, inspecting and retrying jobs
//! and managing the stored X credential.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use libslotline::logging::LoggingConfig;
use libslotline::platforms::x::XPlatform;
use libslotline::scheduling::parse_schedule;
use libslotline::submission::SubmissionKind;
use libslotline::types::PLATFORM_X;
use libslotline::{
    submit_thread, Account, Config, Database, JobStatus, Platform, PostStatus, PublishJob,
    Result, SlotlineError, Store, ThreadSubmission, TokenManager,
};
use serde::Deserialize;
use std::io::Read;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "slot-queue")]
#[command(version)]
#[command(about = "Submit threads and manage the publish queue")]
#[command(long_about = "\
slot-queue - Submit threads and manage the publish queue

DESCRIPTION:
    slot-queue is a Unix-style tool for the Slotline publish queue. Use it
    to submit threads, list publish jobs, retry failed jobs and manage the
    connected X account. slot-send does the actual publishing.

COMMANDS:
    submit      Submit a thread from a JSON file (or - for stdin)
    jobs        List publish jobs
    retry       Queue a failed job's thread again
    account     Show, import, check or disconnect the X account

USAGE EXAMPLES:
    # Publish a thread as soon as slot-send picks it up
    slot-queue submit thread.json

    # Schedule it for later
    slot-queue submit thread.json --at \"tomorrow 3pm\"
    slot-queue submit thread.json --at 2h

    # List failed jobs as JSON
    slot-queue jobs --status error --format json

    # Try a failed job again
    slot-queue retry <JOB_ID>

    # Store tokens obtained from the OAuth flow
    slot-queue account import tokens.json

CONFIGURATION:
    Configuration file: ~/.config/slotline/config.toml

    Override with environment variables:
        SLOTLINE_CONFIG    - Path to config file
        SLOTLINE_DB_PATH   - Path to database file

EXIT CODES:
    0 - Success
    1 - Operation failed
    2 - Credential error (no account connected, token rejected)
    3 - Invalid input (bad thread, time format, job id, etc.)
")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a thread
    Submit {
        /// Thread JSON file, or - to read stdin
        file: String,

        /// Schedule time (e.g. "tomorrow 3pm", "2h", RFC 3339)
        #[arg(long, value_name = "WHEN", conflicts_with = "draft")]
        at: Option<String>,

        /// Save as a draft without queueing a job
        #[arg(long)]
        draft: bool,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// List publish jobs, most recent first
    Jobs {
        /// Filter by status: pending, running, done or error
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of jobs shown
        #[arg(short, long, default_value_t = 50)]
        limit: usize,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Queue a failed job's thread again
    Retry {
        /// Job ID in error state
        job_id: String,

        /// Retry even if part of the thread is already live
        #[arg(long)]
        force: bool,
    },

    /// Manage the connected X account
    Account {
        #[command(subcommand)]
        action: AccountAction,
    },
}

#[derive(Subcommand, Debug)]
enum AccountAction {
    /// Show the connected account (tokens are never printed)
    Show {
        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Store tokens from a JSON file (or - for stdin)
    Import {
        /// Token JSON file, or - to read stdin
        file: String,
    },

    /// Verify the stored token against the X API, refreshing it if needed
    Check,

    /// Remove the stored account
    Disconnect,
}

/// Token payload accepted by `account import`, as returned by the OAuth
/// token endpoint plus the optional handle.
#[derive(Debug, Deserialize)]
struct TokenImport {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    expires_at: Option<i64>,
    scope: Option<String>,
    handle: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut logging = LoggingConfig::from_env(cli.verbose);
    if !cli.verbose && std::env::var("SLOTLINE_LOG_LEVEL").is_err() {
        logging.level = "error".to_string();
    }
    logging.init();

    // Run the main logic and handle errors
    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load()?;
    let db = Database::new(&config.database.path).await?;

    match cli.command {
        Commands::Submit {
            file,
            at,
            draft,
            format,
        } => {
            cmd_submit(&db, &file, at.as_deref(), draft, &format).await?;
        }
        Commands::Jobs {
            status,
            limit,
            format,
        } => {
            cmd_jobs(&db, status.as_deref(), limit, &format).await?;
        }
        Commands::Retry { job_id, force } => {
            cmd_retry(&db, &job_id, force).await?;
        }
        Commands::Account { action } => match action {
            AccountAction::Show { format } => cmd_account_show(&db, &format).await?,
            AccountAction::Import { file } => cmd_account_import(&db, &file).await?,
            AccountAction::Check => cmd_account_check(db, &config).await?,
            AccountAction::Disconnect => cmd_account_disconnect(&db).await?,
        },
    }

    Ok(())
}

fn validate_format(format: &str) -> Result<()> {
    if format != "text" && format != "json" {
        return Err(SlotlineError::InvalidInput(format!(
            "Invalid format '{}'. Must be 'text' or 'json'",
            format
        )));
    }
    Ok(())
}

/// Read a whole file, or stdin when `path` is `-`
fn read_input(path: &str) -> Result<String> {
    let result = if path == "-" {
        let mut content = String::new();
        std::io::stdin()
            .read_to_string(&mut content)
            .map(|_| content)
    } else {
        std::fs::read_to_string(path)
    };
    result.map_err(|e| SlotlineError::InvalidInput(format!("Cannot read {}: {}", path, e)))
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| SlotlineError::InvalidInput(format!("Cannot encode output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

/// Submit a thread
async fn cmd_submit(
    db: &Database,
    file: &str,
    at: Option<&str>,
    draft: bool,
    format: &str,
) -> Result<()> {
    validate_format(format)?;

    let content = read_input(file)?;
    let mut submission: ThreadSubmission = serde_json::from_str(&content)
        .map_err(|e| SlotlineError::InvalidInput(format!("Invalid thread JSON: {}", e)))?;

    let now = Utc::now();
    if let Some(when) = at {
        let ts = parse_schedule(when, now)?;
        submission.scheduled_at = DateTime::from_timestamp(ts, 0);
    }
    if draft {
        submission.kind = SubmissionKind::Draft;
    }

    let submitted = submit_thread(db, submission, now.timestamp()).await?;

    if format == "json" {
        print_json(&submitted)?;
    } else {
        match submitted.run_at {
            Some(run_at) => println!(
                "{} {} {}",
                submitted.post_id,
                submitted.status,
                format_timestamp(run_at)
            ),
            None => println!("{} {}", submitted.post_id, submitted.status),
        }
    }

    Ok(())
}

/// List publish jobs
async fn cmd_jobs(db: &Database, status: Option<&str>, limit: usize, format: &str) -> Result<()> {
    validate_format(format)?;

    let status = status.map(str::parse::<JobStatus>).transpose()?;
    let jobs = db.list_jobs(status, limit).await?;

    if format == "json" {
        print_json(&jobs)
    } else {
        output_jobs_text(&jobs);
        Ok(())
    }
}

fn output_jobs_text(jobs: &[PublishJob]) {
    for job in jobs {
        let error = job
            .last_error
            .as_deref()
            .map(|e| format!(" | {}", truncate_content(e, 80)))
            .unwrap_or_default();
        println!(
            "{} | {} | {} | {} | attempts={}{}",
            job.id,
            job.post_id,
            job.status,
            format_timestamp(job.run_at),
            job.attempts,
            error
        );
    }
}

/// Truncate content to `max_chars` characters with ellipsis
fn truncate_content(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        content.to_string()
    } else {
        let cut: String = content.chars().take(max_chars).collect();
        format!("{}...", cut)
    }
}

fn format_timestamp(ts: i64) -> String {
    DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.to_rfc3339())
        .unwrap_or_else(|| ts.to_string())
}

/// Queue a failed job's thread again as a fresh pending job
async fn cmd_retry(db: &Database, job_id: &str, force: bool) -> Result<()> {
    let job = db
        .get_job(job_id)
        .await?
        .ok_or_else(|| SlotlineError::InvalidInput(format!("Job not found: {}", job_id)))?;

    if job.status != JobStatus::Error {
        return Err(SlotlineError::InvalidInput(format!(
            "Job {} is {}, only failed jobs can be retried",
            job.id, job.status
        )));
    }

    let post = db
        .get_post(&job.post_id)
        .await?
        .ok_or_else(|| SlotlineError::InvalidInput(format!("Post not found: {}", job.post_id)))?;
    if post.status == PostStatus::Published {
        return Err(SlotlineError::InvalidInput(format!(
            "Post {} is already published",
            post.id
        )));
    }

    if let Some(open) = db
        .list_post_jobs(&post.id)
        .await?
        .into_iter()
        .find(|j| matches!(j.status, JobStatus::Pending | JobStatus::Running))
    {
        return Err(SlotlineError::InvalidInput(format!(
            "Post {} already has {} job {}",
            post.id, open.status, open.id
        )));
    }

    let live = db.list_post_records(&post.id).await?;
    if !live.is_empty() && !force {
        return Err(SlotlineError::InvalidInput(format!(
            "{} item(s) of post {} are already live; retrying would post them again (use --force)",
            live.len(),
            post.id
        )));
    }

    let retry = db.enqueue_job(&post.id, Utc::now().timestamp()).await?;
    tracing::info!(job_id = %retry.id, previous = %job.id, "retry queued");
    println!("{}", retry.id);

    Ok(())
}

async fn cmd_account_show(db: &Database, format: &str) -> Result<()> {
    validate_format(format)?;

    let account = db
        .get_account(PLATFORM_X)
        .await?
        .ok_or_else(not_connected)?;
    let summary = account.summary();

    if format == "json" {
        return print_json(&summary);
    }

    println!("platform:    {}", summary.platform);
    println!(
        "handle:      {}",
        summary.handle.as_deref().map(|h| format!("@{}", h)).unwrap_or_else(|| "-".to_string())
    );
    println!("scope:       {}", summary.scope.as_deref().unwrap_or("-"));
    println!(
        "expires:     {}",
        summary.expires_at.map(format_timestamp).unwrap_or_else(|| "never".to_string())
    );
    println!("refreshable: {}", if summary.can_refresh { "yes" } else { "no" });

    Ok(())
}

async fn cmd_account_import(db: &Database, file: &str) -> Result<()> {
    let content = read_input(file)?;
    let import: TokenImport = serde_json::from_str(&content)
        .map_err(|e| SlotlineError::InvalidInput(format!("Invalid token JSON: {}", e)))?;

    if import.access_token.trim().is_empty() {
        return Err(SlotlineError::InvalidInput(
            "access_token must not be empty".to_string(),
        ));
    }

    let now = Utc::now().timestamp();
    let account = Account {
        platform: PLATFORM_X.to_string(),
        handle: import.handle,
        access_token: import.access_token,
        refresh_token: import.refresh_token,
        expires_at: import
            .expires_at
            .or_else(|| import.expires_in.map(|secs| now + secs)),
        scope: import.scope,
        updated_at: now,
    };

    db.upsert_account(&account).await?;
    tracing::info!(account = ?account, "account imported");
    println!("Account imported");

    Ok(())
}

async fn cmd_account_check(db: Database, config: &Config) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(db);
    let platform = Arc::new(XPlatform::new(&config.x)?);
    let tokens = TokenManager::new(store, platform.clone(), config.tokens.refresh_skew_secs);

    let account = tokens.current(Utc::now().timestamp()).await?;
    let identity = platform.whoami(&account.access_token).await?;

    println!("@{} ({})", identity.username, identity.id);
    Ok(())
}

async fn cmd_account_disconnect(db: &Database) -> Result<()> {
    if !db.delete_account(PLATFORM_X).await? {
        return Err(not_connected());
    }
    println!("Account disconnected");
    Ok(())
}

fn not_connected() -> SlotlineError {
    libslotline::error::CredentialError::NotConnected(PLATFORM_X.to_string()).into()
}
