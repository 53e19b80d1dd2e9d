use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use electora_core::{
    CountingCircleId, DomainOfInfluenceId, ListUnionId, MasterDataEvent,
};
use electora_store_sqlite::SqliteStore;
use serde_json::Value;
use time::OffsetDateTime;
use ulid::Ulid;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "electora")]
#[command(about = "Election master data projection CLI")]
struct Cli {
    #[arg(long, default_value = "./electora.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
    Event {
        #[command(subcommand)]
        command: Box<EventCommand>,
    },
    Doi {
        #[command(subcommand)]
        command: Box<DoiCommand>,
    },
    Circle {
        #[command(subcommand)]
        command: Box<CircleCommand>,
    },
    List {
        #[command(subcommand)]
        command: Box<ListCommand>,
    },
    Union {
        #[command(subcommand)]
        command: Box<UnionCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Export(DbExportArgs),
    Import(DbImportArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
    #[arg(long, default_value_t = true)]
    skip_existing: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum EventCommand {
    Apply(EventApplyArgs),
}

#[derive(Debug, Args)]
struct EventApplyArgs {
    /// NDJSON file with one event per line, processed in order.
    #[arg(long)]
    file: Option<PathBuf>,
    /// A single event as inline JSON.
    #[arg(long)]
    json: Option<String>,
}

#[derive(Debug, Subcommand)]
enum DoiCommand {
    List,
    Hierarchy,
    Permissions,
    Assignments,
    Reassign(DoiReassignArgs),
}

#[derive(Debug, Args)]
struct DoiReassignArgs {
    #[arg(long)]
    id: String,
    #[arg(long = "circle")]
    circles: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum CircleCommand {
    List,
}

#[derive(Debug, Subcommand)]
enum ListCommand {
    List,
}

#[derive(Debug, Subcommand)]
enum UnionCommand {
    List,
    Members(UnionMembersArgs),
}

#[derive(Debug, Args)]
struct UnionMembersArgs {
    #[arg(long)]
    id: String,
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

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(*command, &mut store),
        Command::Event { command } => run_event(*command, &mut store),
        Command::Doi { command } => run_doi(*command, &mut store),
        Command::Circle { command } => run_circle(*command, &mut store),
        Command::List { command } => run_list(*command, &mut store),
        Command::Union { command } => run_union(*command, &mut store),
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Export(args) => run_db_export(&args, store),
        DbCommand::Import(args) => run_db_import(&args, store),
        DbCommand::Backup(args) => run_db_backup(&args, store),
        DbCommand::Restore(args) => run_db_restore(&args, store),
        DbCommand::IntegrityCheck => run_db_integrity_check(store),
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty()
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions
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

fn run_db_export(args: &DbExportArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    let manifest = store.export_snapshot(&args.out)?;
    emit_json(serde_json::json!({
        "out_dir": args.out,
        "manifest": manifest
    }))
}

fn run_db_import(args: &DbImportArgs, store: &mut SqliteStore) -> Result<()> {
    let summary = store.import_snapshot(&args.input, args.skip_existing)?;
    emit_json(serde_json::json!({
        "in_dir": args.input,
        "skip_existing": args.skip_existing,
        "summary": summary
    }))
}

fn run_db_backup(args: &DbBackupArgs, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    store.backup_database(&args.out)?;
    emit_json(serde_json::json!({
        "backup_path": args.out,
        "status": "ok"
    }))
}

fn run_db_restore(args: &DbRestoreArgs, store: &mut SqliteStore) -> Result<()> {
    store.restore_database(&args.input)?;
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "restored_from": args.input,
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions
    }))
}

fn run_db_integrity_check(store: &SqliteStore) -> Result<()> {
    let report = store.integrity_check()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
}

fn run_event(command: EventCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        EventCommand::Apply(args) => run_event_apply(&args, store),
    }
}

fn run_event_apply(args: &EventApplyArgs, store: &mut SqliteStore) -> Result<()> {
    let body = match (&args.file, &args.json) {
        (Some(_), Some(_)) => {
            return Err(anyhow!("--file and --json are mutually exclusive"));
        }
        (Some(path), None) => fs::read_to_string(path)
            .with_context(|| format!("failed to read event file {}", path.display()))?,
        (None, Some(inline)) => inline.clone(),
        (None, None) => {
            return Err(anyhow!("provide events via --file or --json"));
        }
    };

    let mut results = Vec::new();
    for (index, line) in body.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let event: MasterDataEvent = serde_json::from_str(trimmed)
            .with_context(|| format!("failed to parse event on line {}", index + 1))?;
        let outcome = store.apply_event(&event)?;
        results.push(serde_json::json!({
            "event_type": event.kind(),
            "result": outcome
        }));
    }

    emit_json(serde_json::json!({
        "processed": results.len(),
        "results": results
    }))
}

fn run_doi(command: DoiCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        DoiCommand::List => {
            let nodes = store.list_domain_of_influences()?;
            emit_json(serde_json::json!({ "domain_of_influences": nodes }))
        }
        DoiCommand::Hierarchy => {
            let entries = store.list_hierarchy_entries()?;
            emit_json(serde_json::json!({ "hierarchy_entries": entries }))
        }
        DoiCommand::Permissions => {
            let entries = store.list_permission_entries()?;
            emit_json(serde_json::json!({ "permission_entries": entries }))
        }
        DoiCommand::Assignments => {
            let rows = store.list_assignments()?;
            emit_json(serde_json::json!({ "assignments": rows }))
        }
        DoiCommand::Reassign(args) => {
            let id = DomainOfInfluenceId(parse_ulid(&args.id)?);
            let counting_circle_ids = args
                .circles
                .iter()
                .map(|raw| Ok(CountingCircleId(parse_ulid(raw)?)))
                .collect::<Result<Vec<_>>>()?;
            let event = MasterDataEvent::CountingCirclesReassigned {
                id,
                counting_circle_ids,
                event_at: OffsetDateTime::now_utc(),
            };
            let outcome = store.apply_event(&event)?;
            emit_json(serde_json::json!({
                "event_type": event.kind(),
                "result": outcome
            }))
        }
    }
}

fn run_circle(command: CircleCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        CircleCommand::List => {
            let circles = store.list_counting_circles()?;
            emit_json(serde_json::json!({ "counting_circles": circles }))
        }
    }
}

fn run_list(command: ListCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        ListCommand::List => {
            let lists = store.list_lists()?;
            emit_json(serde_json::json!({ "lists": lists }))
        }
    }
}

fn run_union(command: UnionCommand, store: &mut SqliteStore) -> Result<()> {
    store.migrate()?;
    match command {
        UnionCommand::List => {
            let unions = store.list_list_unions()?;
            emit_json(serde_json::json!({ "list_unions": unions }))
        }
        UnionCommand::Members(args) => {
            let union_id = ListUnionId(parse_ulid(&args.id)?);
            let members = store.list_union_member_ids(union_id)?;
            emit_json(serde_json::json!({
                "list_union_id": union_id.to_string(),
                "member_list_ids": members
            }))
        }
    }
}

fn parse_ulid(value: &str) -> Result<Ulid> {
    Ulid::from_string(value).with_context(|| format!("invalid ULID: {value}"))
}
