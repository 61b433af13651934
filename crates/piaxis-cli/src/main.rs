use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use piaxis_core::{require_search_text, SuggestionContext};
use piaxis_store_sqlite::{AccessFixPlan, SqliteStore, DEFAULT_INTERN_EMAIL};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "piaxis")]
#[command(about = "PiAxis detail catalog CLI")]
struct Cli {
    #[arg(long, env = "PIAXIS_DB", default_value = "./piaxis.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Users {
        #[command(subcommand)]
        command: UsersCommand,
    },
    Access {
        #[command(subcommand)]
        command: AccessCommand,
    },
    Details {
        #[command(subcommand)]
        command: DetailsCommand,
    },
    Secure {
        #[command(subcommand)]
        command: SecureCommand,
    },
    Suggest(SuggestArgs),
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    /// Load the demo accounts, details, and usage rules.
    Seed,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum UsersCommand {
    List,
}

#[derive(Debug, Subcommand)]
enum AccessCommand {
    /// Force row security, allow the intern role, and demote one user to intern.
    Fix(AccessFixArgs),
    Status,
}

#[derive(Debug, Args)]
struct AccessFixArgs {
    #[arg(long, env = "PIAXIS_INTERN_EMAIL", default_value = DEFAULT_INTERN_EMAIL)]
    intern_email: String,
}

#[derive(Debug, Subcommand)]
enum DetailsCommand {
    List,
    Search(SearchArgs),
}

#[derive(Debug, Args)]
struct SearchArgs {
    #[arg(long)]
    q: String,
}

#[derive(Debug, Subcommand)]
enum SecureCommand {
    /// Details visible to the given user.
    Details(SecureDetailsArgs),
}

#[derive(Debug, Args)]
struct SecureDetailsArgs {
    #[arg(long = "as")]
    email: String,
}

#[derive(Debug, Args)]
struct SuggestArgs {
    #[arg(long)]
    host_element: String,
    #[arg(long)]
    adjacent_element: String,
    #[arg(long)]
    exposure: String,
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

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(command, &mut store),
        Command::Users { command } => {
            store.migrate()?;
            run_users(&command, &store)
        }
        Command::Access { command } => {
            store.migrate()?;
            run_access(command, &mut store)
        }
        Command::Details { command } => {
            store.migrate()?;
            run_details(&command, &mut store)
        }
        Command::Secure { command } => {
            store.migrate()?;
            run_secure(&command, &mut store)
        }
        Command::Suggest(args) => {
            store.migrate()?;
            run_suggest(args, &mut store)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::Seed => {
            store.migrate()?;
            let summary = store.seed_demo()?;
            tracing::info!(
                users = summary.users_inserted,
                details = summary.details_inserted,
                rules = summary.rules_inserted,
                "seed complete"
            );
            emit_json(serde_json::to_value(summary)?)
        }
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

fn run_users(command: &UsersCommand, store: &SqliteStore) -> Result<()> {
    match command {
        UsersCommand::List => {
            let users = store.list_users()?;
            emit_json(serde_json::json!({ "users": users }))
        }
    }
}

fn run_access(command: AccessCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        AccessCommand::Fix(args) => {
            let report = store.apply_access_fix(&AccessFixPlan { intern_email: args.intern_email })?;
            if report.reassigned_users == 0 {
                tracing::warn!(email = %report.intern_email, "access fix matched no user");
            }
            emit_json(serde_json::to_value(report)?)
        }
        AccessCommand::Status => emit_json(serde_json::to_value(store.access_status()?)?),
    }
}

fn run_details(command: &DetailsCommand, store: &mut SqliteStore) -> Result<()> {
    let details = match command {
        DetailsCommand::List => store.list_details()?,
        DetailsCommand::Search(args) => {
            let text = require_search_text(Some(args.q.as_str()))?;
            store.search_details(text)?
        }
    };
    emit_json(serde_json::json!({ "details": details }))
}

fn run_secure(command: &SecureCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        SecureCommand::Details(args) => {
            let read = store.secure_read(Some(args.email.as_str()))?;
            emit_json(serde_json::json!({
                "as_user": read.user,
                "decision": read.decision,
                "rows": read.rows
            }))
        }
    }
}

fn run_suggest(args: SuggestArgs, store: &mut SqliteStore) -> Result<()> {
    let context = SuggestionContext::new(
        Some(args.host_element),
        Some(args.adjacent_element),
        Some(args.exposure),
    )?;
    emit_json(serde_json::to_value(store.suggest(&context)?)?)
}
