use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use record_analytics_api::{AnalyzeRequest, RecordAnalyticsApi};
use record_analytics_core::{build_dashboard, RecordId, RecordInput};
use record_analytics_store_sqlite::SqliteStore;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ra")]
#[command(about = "Record Analytics CLI")]
struct Cli {
    #[arg(long, global = true, default_value = "./record_analytics.sqlite3")]
    db: PathBuf,

    /// Emit debug tracing on stderr.
    #[arg(long, global = true, default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Record {
        #[command(subcommand)]
        command: Box<RecordCommand>,
    },
    Dashboard,
    Analyze(AnalyzeArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Add(RecordAddArgs),
    Edit(RecordEditArgs),
    Delete(RecordIdArgs),
    Show(RecordIdArgs),
    List,
}

#[derive(Debug, Args)]
struct RecordAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long, allow_negative_numbers = true)]
    value: f64,
    #[arg(long)]
    category: String,
}

#[derive(Debug, Args)]
struct RecordEditArgs {
    #[arg(long)]
    id: RecordId,
    #[arg(long)]
    name: Option<String>,
    #[arg(long, allow_negative_numbers = true)]
    value: Option<f64>,
    #[arg(long)]
    category: Option<String>,
}

#[derive(Debug, Args)]
struct RecordIdArgs {
    #[arg(long)]
    id: RecordId,
}

#[derive(Debug, Args)]
struct AnalyzeArgs {
    /// raw_data, summary, groupby or filter; other selectors fall back to raw_data.
    #[arg(long)]
    operation: Option<String>,
    #[arg(long, value_enum, default_value_t = OutputFormat::Json)]
    format: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
    Html,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing(debug: bool) {
    if debug {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()),
            )
            .with_writer(std::io::stderr)
            .try_init();
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    match cli.command {
        Command::Db { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_db(*command, &mut store)
        }
        Command::Record { command } => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_record(*command, &mut store)
        }
        Command::Dashboard => {
            let mut store = SqliteStore::open(&cli.db)?;
            run_dashboard(&mut store)
        }
        Command::Analyze(args) => run_analyze(&args, &RecordAnalyticsApi::new(cli.db)),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_record(command: RecordCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        RecordCommand::Add(args) => {
            let input = RecordInput { name: args.name, value: args.value, category: args.category };
            let record = store.insert_record(&input)?;
            emit_json(serde_json::to_value(&record).context("failed to serialize record")?)
        }
        RecordCommand::Edit(args) => {
            let existing =
                store.get_record(args.id)?.ok_or_else(|| anyhow!("record {} not found", args.id))?;
            let input = RecordInput {
                name: args.name.unwrap_or(existing.name),
                value: args.value.unwrap_or(existing.value),
                category: args.category.unwrap_or(existing.category),
            };
            let record = store
                .update_record(args.id, &input)?
                .ok_or_else(|| anyhow!("record {} not found", args.id))?;
            emit_json(serde_json::to_value(&record).context("failed to serialize record")?)
        }
        RecordCommand::Delete(args) => {
            if !store.delete_record(args.id)? {
                return Err(anyhow!("record {} not found", args.id));
            }
            emit_json(serde_json::json!({ "id": args.id, "deleted": true }))
        }
        RecordCommand::Show(args) => {
            let record =
                store.get_record(args.id)?.ok_or_else(|| anyhow!("record {} not found", args.id))?;
            emit_json(serde_json::to_value(&record).context("failed to serialize record")?)
        }
        RecordCommand::List => {
            let records = store.list_records()?;
            emit_json(serde_json::json!({ "records": records }))
        }
    }
}

fn run_dashboard(store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let records = store.list_records()?;
    let dashboard = build_dashboard(&records);
    let chart_json = dashboard.chart.to_json()?;
    emit_json(serde_json::json!({
        "stats": dashboard.stats,
        "chart": dashboard.chart,
        "chart_json": chart_json
    }))
}

fn run_analyze(args: &AnalyzeArgs, api: &RecordAnalyticsApi) -> Result<()> {
    let request = AnalyzeRequest { operation: args.operation.clone() };
    let result = api.analyze(&request)?;
    match args.format {
        OutputFormat::Json => {
            emit_json(serde_json::to_value(&result).context("failed to serialize analysis")?)
        }
        OutputFormat::Text => {
            println!("{}", result.label);
            println!("{}", result.output.to_text());
            Ok(())
        }
        OutputFormat::Html => {
            println!("{}", result.html);
            Ok(())
        }
    }
}
