//! Tally CLI - offline-first record keeping for small businesses
//!
//! Every command works without connectivity; mutations queue in the
//! pending-change ledger and reach the remote store on the next `tally
//! sync` or background pass.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Datelike, Duration as ChronoDuration, Local, NaiveDate};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;

use tally_core::db::Database;
use tally_core::gateway::http::HttpGateway;
use tally_core::gateway::RemoteGateway;
use tally_core::ledger::PendingLedger;
use tally_core::models::{Expense, Project, StockItem, WorkEntry};
use tally_core::{
    Document, PassOutcome, PendingChange, RateSettings, RecordId, RecordKind, RecordPayload,
    SyncOrchestrator, SyncTunables,
};

#[derive(Parser)]
#[command(name = "tally")]
#[command(about = "Offline-first record keeping for small businesses")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Optional path to local database file
    #[arg(long, value_name = "PATH")]
    db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Record an expense
    AddExpense {
        /// Who incurred the expense
        owner: String,
        /// What it was for
        description: String,
        /// Amount, e.g. "12.50"
        amount: String,
        /// Date incurred (YYYY-MM-DD, default today)
        #[arg(long)]
        date: Option<NaiveDate>,
    },
    /// Create a project
    AddProject {
        name: String,
        client: String,
        /// Budget, e.g. "2500.00"
        #[arg(long, default_value = "0")]
        budget: String,
    },
    /// Add a stock item
    AddStock {
        name: String,
        quantity: i64,
        /// Unit price, e.g. "9.99"
        unit_price: String,
    },
    /// Log days worked in a week
    LogDays {
        employee: String,
        /// Days worked, fractions allowed, e.g. 4.5
        days: f64,
        /// Week start date (YYYY-MM-DD, default the current week's Monday)
        #[arg(long)]
        week: Option<NaiveDate>,
    },
    /// List records
    List {
        /// Category to list; all categories when omitted
        #[arg(value_enum)]
        kind: Option<ListKind>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a record by id
    Delete {
        /// Record category
        #[arg(value_enum)]
        kind: ListKind,
        /// Record id
        id: String,
    },
    /// Show or set the rate settings
    Rates {
        /// New bonus rate, e.g. 0.05
        #[arg(long)]
        bonus_rate: Option<f64>,
        /// New default day rate, e.g. 350.00
        #[arg(long)]
        default_day_rate: Option<f64>,
    },
    /// Run a sync pass against the remote store
    Sync,
    /// Show sync and storage status
    Status,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
enum ListKind {
    Expenses,
    Projects,
    Stock,
    WorkWeeks,
}

impl From<ListKind> for RecordKind {
    fn from(kind: ListKind) -> Self {
        match kind {
            ListKind::Expenses => Self::Expenses,
            ListKind::Projects => Self::Projects,
            ListKind::Stock => Self::Stock,
            ListKind::WorkWeeks => Self::WorkWeeks,
        }
    }
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Core(#[from] tally_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid amount {0:?}: expected a number like 12.50")]
    InvalidAmount(String),
    #[error("Invalid record id: {0}")]
    InvalidRecordId(String),
    #[error("Record not found: {0}")]
    RecordNotFound(String),
    #[error(
        "Sync is not configured. Set TALLY_SYNC_URL and TALLY_SYNC_TOKEN to enable `tally sync`."
    )]
    SyncNotConfigured,
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tally=info".parse().unwrap()),
        )
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);
    let engine = open_engine(&db_path)?;

    match cli.command {
        Commands::AddExpense {
            owner,
            description,
            amount,
            date,
        } => {
            let amount_cents = parse_money(&amount)?;
            let date = date.unwrap_or_else(|| Local::now().date_naive());
            let expense = Expense::new(&owner, &description, amount_cents, date, engine.device_id());
            let id = expense.id;
            apply(&engine, RecordPayload::Expense(expense)).await?;
            println!("{id}");
        }
        Commands::AddProject {
            name,
            client,
            budget,
        } => {
            let budget_cents = parse_money(&budget)?;
            let project = Project::new(&name, &client, budget_cents, engine.device_id());
            let id = project.id;
            apply(&engine, RecordPayload::Project(project)).await?;
            println!("{id}");
        }
        Commands::AddStock {
            name,
            quantity,
            unit_price,
        } => {
            let unit_price_cents = parse_money(&unit_price)?;
            let item = StockItem::new(&name, quantity, unit_price_cents, engine.device_id());
            let id = item.id;
            apply(&engine, RecordPayload::Stock(item)).await?;
            println!("{id}");
        }
        Commands::LogDays {
            employee,
            days,
            week,
        } => {
            let week_start = week.unwrap_or_else(|| current_week_start(Local::now().date_naive()));
            let entry = WorkEntry::new(&employee, week_start, days, engine.device_id());
            let id = entry.id;
            apply(&engine, RecordPayload::Work(entry)).await?;
            println!("{id}");
        }
        Commands::List { kind, json } => run_list(&engine, kind, json)?,
        Commands::Delete { kind, id } => run_delete(&engine, kind.into(), &id).await?,
        Commands::Rates {
            bonus_rate,
            default_day_rate,
        } => run_rates(&engine, bonus_rate, default_day_rate).await?,
        Commands::Sync => run_sync(&engine).await?,
        Commands::Status => run_status(&engine)?,
    }

    Ok(())
}

/// Record a mutation through the sync engine: ledger first, then the
/// optimistic local save
async fn apply(engine: &SyncOrchestrator, payload: RecordPayload) -> Result<Document, CliError> {
    let change = PendingChange::create(payload, engine.device_id());
    Ok(engine.apply_change(change).await?)
}

#[derive(Debug, Serialize)]
struct ListOutput {
    expenses: Vec<Expense>,
    projects: Vec<Project>,
    stock: Vec<StockItem>,
    work_weeks: Vec<WorkEntry>,
}

fn run_list(
    engine: &SyncOrchestrator,
    kind: Option<ListKind>,
    as_json: bool,
) -> Result<(), CliError> {
    let document = engine.document();
    let wanted = |k: ListKind| kind.is_none() || kind == Some(k);

    let output = ListOutput {
        expenses: wanted(ListKind::Expenses)
            .then(|| document.expenses.values().flatten().cloned().collect())
            .unwrap_or_default(),
        projects: wanted(ListKind::Projects)
            .then(|| document.projects.clone())
            .unwrap_or_default(),
        stock: wanted(ListKind::Stock)
            .then(|| document.stock.clone())
            .unwrap_or_default(),
        work_weeks: wanted(ListKind::WorkWeeks)
            .then(|| document.work_weeks.values().flatten().cloned().collect())
            .unwrap_or_default(),
    };

    if as_json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    for expense in &output.expenses {
        println!(
            "expense  {}  {}  {}  {}  {}",
            expense.id,
            expense.incurred_on,
            expense.owner,
            format_money(expense.amount_cents),
            expense.description
        );
    }
    for project in &output.projects {
        println!(
            "project  {}  {}  {}  budget {}",
            project.id,
            project.name,
            project.client,
            format_money(project.budget_cents)
        );
    }
    for item in &output.stock {
        println!(
            "stock    {}  {}  x{}  @ {}",
            item.id,
            item.name,
            item.quantity,
            format_money(item.unit_price_cents)
        );
    }
    for entry in &output.work_weeks {
        println!(
            "work     {}  week of {}  {}  {} days",
            entry.id, entry.week_start, entry.employee, entry.days_worked
        );
    }
    Ok(())
}

async fn run_delete(
    engine: &SyncOrchestrator,
    kind: RecordKind,
    raw_id: &str,
) -> Result<(), CliError> {
    let id: RecordId = raw_id
        .parse()
        .map_err(|_| CliError::InvalidRecordId(raw_id.to_string()))?;
    if !engine.document().contains(id) {
        return Err(CliError::RecordNotFound(raw_id.to_string()));
    }

    let change = PendingChange::delete(kind, id, engine.device_id());
    engine.apply_change(change).await?;
    println!("deleted {id}");
    Ok(())
}

async fn run_rates(
    engine: &SyncOrchestrator,
    bonus_rate: Option<f64>,
    default_day_rate: Option<f64>,
) -> Result<(), CliError> {
    let current = engine.document().settings;

    if bonus_rate.is_none() && default_day_rate.is_none() {
        println!("bonus rate:       {}", current.bonus_rate);
        println!("default day rate: {}", current.default_day_rate);
        return Ok(());
    }

    let updated = engine
        .update_settings(RateSettings {
            bonus_rate: bonus_rate.unwrap_or(current.bonus_rate),
            default_day_rate: default_day_rate.unwrap_or(current.default_day_rate),
        })
        .await?;
    println!("bonus rate:       {}", updated.settings.bonus_rate);
    println!("default day rate: {}", updated.settings.default_day_rate);
    Ok(())
}

async fn run_sync(engine: &SyncOrchestrator) -> Result<(), CliError> {
    if gateway_from_env().is_none() {
        return Err(CliError::SyncNotConfigured);
    }

    match engine.sync_now().await? {
        PassOutcome::Completed(summary) => {
            println!(
                "synced: {} pushed, {} rejected, {} records",
                summary.pushed,
                summary.rejected,
                summary.document.record_count()
            );
        }
        PassOutcome::Skipped => println!("sync skipped"),
    }
    Ok(())
}

fn run_status(engine: &SyncOrchestrator) -> Result<(), CliError> {
    let document = engine.document();
    println!("device:      {}", engine.device_id());
    println!("records:     {}", document.record_count());
    println!("pending:     {}", engine.pending_count()?);
    println!("last sync:   {}", format_timestamp(document.last_sync));
    println!(
        "storage:     {}",
        if engine.is_degraded() {
            "degraded (fallback file)"
        } else {
            "ok"
        }
    );
    println!(
        "remote:      {}",
        if gateway_from_env().is_some() {
            "configured"
        } else {
            "not configured"
        }
    );
    Ok(())
}

fn open_engine(db_path: &Path) -> Result<SyncOrchestrator, CliError> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let db = Database::open(db_path)?;
    let store = tally_core::DocumentStore::new(db.clone(), db_path.with_extension("json"));
    let ledger = PendingLedger::new(db);
    let gateway: Arc<dyn RemoteGateway> = match gateway_from_env() {
        Some(gateway) => Arc::new(gateway?),
        None => Arc::new(UnconfiguredGateway),
    };

    Ok(SyncOrchestrator::start(
        store,
        ledger,
        gateway,
        SyncTunables::from_env(),
    )?)
}

/// The HTTP gateway when both env variables are set; `None` otherwise
fn gateway_from_env() -> Option<Result<HttpGateway, tally_core::Error>> {
    let url = env::var("TALLY_SYNC_URL").ok()?;
    let token = env::var("TALLY_SYNC_TOKEN").ok()?;
    if url.is_empty() || token.is_empty() {
        return None;
    }
    Some(HttpGateway::new(url, token))
}

/// Stand-in gateway so local commands work with no remote configured
struct UnconfiguredGateway;

#[async_trait::async_trait]
impl RemoteGateway for UnconfiguredGateway {
    async fn pull(
        &self,
        _versions: &tally_core::models::SyncVersions,
    ) -> tally_core::Result<tally_core::gateway::RemotePull> {
        Err(tally_core::Error::Remote("sync is not configured".to_string()))
    }

    async fn push(
        &self,
        _document: &Document,
        _changes: &[PendingChange],
    ) -> tally_core::Result<tally_core::gateway::PushReport> {
        Err(tally_core::Error::Remote("sync is not configured".to_string()))
    }
}

fn resolve_db_path(cli_db_path: Option<PathBuf>) -> PathBuf {
    cli_db_path
        .or_else(|| env::var_os("TALLY_DB_PATH").map(PathBuf::from))
        .unwrap_or_else(default_db_path)
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tally")
        .join("tally.db")
}

/// Parse a decimal money string like "12.50" into cents
fn parse_money(raw: &str) -> Result<i64, CliError> {
    let trimmed = raw.trim();
    let invalid = || CliError::InvalidAmount(raw.to_string());

    let (negative, unsigned) = match trimmed.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, trimmed),
    };
    let (whole, frac) = match unsigned.split_once('.') {
        Some((whole, frac)) => (whole, frac),
        None => (unsigned, ""),
    };
    if whole.is_empty() && frac.is_empty() {
        return Err(invalid());
    }
    if frac.len() > 2 || !frac.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    let whole: i64 = if whole.is_empty() {
        0
    } else {
        whole.parse().map_err(|_| invalid())?
    };
    let mut frac_cents: i64 = if frac.is_empty() {
        0
    } else {
        frac.parse().map_err(|_| invalid())?
    };
    if frac.len() == 1 {
        frac_cents *= 10;
    }

    let cents = whole
        .checked_mul(100)
        .and_then(|c| c.checked_add(frac_cents))
        .ok_or_else(invalid)?;
    Ok(if negative { -cents } else { cents })
}

fn format_money(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.abs();
    format!("{sign}{}.{:02}", cents / 100, cents % 100)
}

fn format_timestamp(ms: i64) -> String {
    if ms == 0 {
        return "never".to_string();
    }
    chrono::DateTime::from_timestamp_millis(ms)
        .map_or_else(|| "invalid".to_string(), |dt| dt.to_rfc3339())
}

/// Monday of the week containing `date`
fn current_week_start(date: NaiveDate) -> NaiveDate {
    let days_from_monday = i64::from(date.weekday().num_days_from_monday());
    date - ChronoDuration::days(days_from_monday)
}
