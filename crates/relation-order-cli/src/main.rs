use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use relation_order_api::{
    CollectionShape, ListRelationsRequest, NewRelation, OrderingApi, OrderingConfig,
    RemoveRelationRequest, ReorderRequest, SetIndexRequest, ShowCollectionRequest,
    ToggleColumnRequest, PROPERTIES_TYPE, SHOWN_COLUMNS_TYPE,
};
use relation_order_store_sqlite::SqliteStore;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "ro")]
#[command(about = "Relation ordering CLI")]
struct Cli {
    #[arg(long, default_value = "./relation_order.sqlite3")]
    db: PathBuf,

    /// YAML ordering config; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Relation {
        #[command(subcommand)]
        command: RelationCommand,
    },
    Index {
        #[command(subcommand)]
        command: IndexCommand,
    },
    Collection {
        #[command(subcommand)]
        command: CollectionCommand,
    },
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
enum RelationCommand {
    Add(RelationAddArgs),
    Remove(RelationRemoveArgs),
    List(RelationListArgs),
}

#[derive(Debug, Args)]
struct RelationAddArgs {
    #[arg(long)]
    space: String,
    #[arg(long = "type")]
    type_id: String,
    #[arg(long)]
    from: String,
    #[arg(long)]
    to: String,
    #[arg(long)]
    name: Option<String>,
    #[arg(long)]
    id: Option<String>,
}

#[derive(Debug, Args)]
struct RelationRemoveArgs {
    #[arg(long)]
    space: String,
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct RelationListArgs {
    #[arg(long)]
    space: String,
    #[arg(long)]
    from: String,
    /// Relation types to include; table column types when omitted.
    #[arg(long = "type")]
    type_ids: Vec<String>,
}

#[derive(Debug, Subcommand)]
enum IndexCommand {
    Set(IndexSetArgs),
}

#[derive(Debug, Args)]
struct IndexSetArgs {
    #[arg(long)]
    space: String,
    #[arg(long)]
    entity: String,
    #[arg(long)]
    value: String,
}

#[derive(Debug, Subcommand)]
enum CollectionCommand {
    Show(CollectionArgs),
    Reorder(CollectionReorderArgs),
    ToggleColumn(ToggleColumnArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ShapeArg {
    TableColumns,
    RelationChips,
    ShownProperties,
}

#[derive(Debug, Args)]
struct CollectionArgs {
    #[arg(long)]
    space: String,
    #[arg(long, value_enum)]
    kind: ShapeArg,
    /// Table block entity (table-columns).
    #[arg(long)]
    block: Option<String>,
    /// Source entity (relation-chips).
    #[arg(long)]
    entity: Option<String>,
    /// Relation type (relation-chips).
    #[arg(long)]
    attribute: Option<String>,
    /// Member relation ids (shown-properties).
    #[arg(long = "relation", value_delimiter = ',')]
    relations: Vec<String>,
}

#[derive(Debug, Args)]
struct CollectionReorderArgs {
    #[command(flatten)]
    collection: CollectionArgs,
    /// Relation ids in the requested order.
    #[arg(long, value_delimiter = ',', required = true)]
    order: Vec<String>,
}

#[derive(Debug, Args)]
struct ToggleColumnArgs {
    #[arg(long)]
    space: String,
    #[arg(long)]
    block: String,
    #[arg(long)]
    column: String,
    #[arg(long)]
    name: Option<String>,
}

impl CollectionArgs {
    fn shape(&self) -> Result<CollectionShape> {
        match self.kind {
            ShapeArg::TableColumns => Ok(CollectionShape::TableColumns {
                block_entity_id: required(self.block.as_ref(), "--block")?,
            }),
            ShapeArg::RelationChips => Ok(CollectionShape::RelationChips {
                entity_id: required(self.entity.as_ref(), "--entity")?,
                attribute_id: required(self.attribute.as_ref(), "--attribute")?,
            }),
            ShapeArg::ShownProperties => {
                Ok(CollectionShape::ShownProperties { relation_ids: self.relations.clone() })
            }
        }
    }
}

fn required(value: Option<&String>, flag: &str) -> Result<String> {
    value
        .filter(|value| !value.trim().is_empty())
        .cloned()
        .ok_or_else(|| anyhow!("{flag} is required for this collection kind"))
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
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = OrderingConfig::load_or_default(cli.config.as_deref())?;
    let api = OrderingApi::with_config(cli.db.clone(), config);

    match cli.command {
        Command::Db { command } => run_db(command, &cli.db, &api),
        Command::Relation { command } => run_relation(command, &api),
        Command::Index { command } => run_index(command, &api),
        Command::Collection { command } => run_collection(command, &api),
    }
}

fn run_db(command: DbCommand, db: &std::path::Path, api: &OrderingApi) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = api.schema_status()?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => {
            let result = api.migrate(args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::IntegrityCheck => {
            let store = SqliteStore::open(db)?;
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_relation(command: RelationCommand, api: &OrderingApi) -> Result<()> {
    match command {
        RelationCommand::Add(args) => {
            let record = api.add_relation(&NewRelation {
                relation_id: args.id,
                space_id: args.space,
                type_id: args.type_id,
                from_entity_id: args.from,
                to_entity_id: args.to,
                to_entity_name: args.name,
            })?;
            emit_json(serde_json::to_value(&record).context("failed to serialize relation")?)
        }
        RelationCommand::Remove(args) => {
            let result = api.remove_relation(RemoveRelationRequest {
                space_id: args.space,
                relation_id: args.id,
            })?;
            emit_json(serde_json::to_value(&result).context("failed to serialize remove result")?)
        }
        RelationCommand::List(args) => {
            let type_ids = if args.type_ids.is_empty() {
                vec![SHOWN_COLUMNS_TYPE.to_string(), PROPERTIES_TYPE.to_string()]
            } else {
                args.type_ids
            };
            let relations = api.list_relations(&ListRelationsRequest {
                space_id: args.space,
                from_entity_id: args.from,
                type_ids,
            })?;
            emit_json(serde_json::json!({ "relations": relations }))
        }
    }
}

fn run_index(command: IndexCommand, api: &OrderingApi) -> Result<()> {
    match command {
        IndexCommand::Set(args) => {
            let triple = api.set_index(&SetIndexRequest {
                space_id: args.space,
                entity_id: args.entity,
                value: args.value,
            })?;
            emit_json(serde_json::to_value(&triple).context("failed to serialize index fact")?)
        }
    }
}

fn run_collection(command: CollectionCommand, api: &OrderingApi) -> Result<()> {
    match command {
        CollectionCommand::Show(args) => {
            let view = api.load_collection(ShowCollectionRequest {
                collection: args.shape()?,
                space_id: args.space,
            })?;
            emit_json(serde_json::to_value(&view).context("failed to serialize collection")?)
        }
        CollectionCommand::Reorder(args) => {
            let result = api.reorder_collection(ReorderRequest {
                collection: args.collection.shape()?,
                space_id: args.collection.space,
                relation_ids: args.order,
            })?;
            emit_json(serde_json::to_value(&result).context("failed to serialize reorder result")?)
        }
        CollectionCommand::ToggleColumn(args) => {
            let result = api.toggle_column(ToggleColumnRequest {
                space_id: args.space,
                block_entity_id: args.block,
                column_entity_id: args.column,
                column_name: args.name,
            })?;
            emit_json(serde_json::to_value(&result).context("failed to serialize toggle result")?)
        }
    }
}
