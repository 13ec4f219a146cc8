//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, WrapErr, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use refkb_core::{BuildJobs, BuildProgress, JobStatus, KnowledgeBuilder};
use refkb_fetch::EnrichmentClient;
use refkb_gateway::KnowledgeBaseGateway;
use refkb_shared::{
    AppConfig, BuildConfig, BuildRequest, BuildResult, DateRange, PublishOutcome, QueryConditions,
    ReferenceRecord, TransportConfig, expand_home, init_config, load_config, validate_api_key,
};
use refkb_storage::{DocumentLedger, ReferenceStore};
use refkb_transport::Transport;
use serde_json::Value;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// refkb: publish report references into a remote knowledge base.
#[derive(Parser)]
#[command(
    name = "refkb",
    version,
    about = "Select report references, enrich them, and publish them to a knowledge-base service.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Build a knowledge base from selected references.
    Build(BuildArgs),

    /// Manage datasets on the knowledge-base service.
    Datasets {
        #[command(subcommand)]
        action: DatasetAction,
    },

    /// Manage documents inside a dataset.
    Documents {
        #[command(subcommand)]
        action: DocumentAction,
    },

    /// Show the indexing status of an upload batch or document.
    Status {
        /// Dataset id.
        #[arg(long)]
        dataset: String,

        /// Batch or document id returned by an upload.
        batch: String,
    },

    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Local reference database.
    Db {
        #[command(subcommand)]
        action: DbAction,
    },
}

/// Arguments for `refkb build`.
#[derive(clap::Args)]
pub(crate) struct BuildArgs {
    /// Name of the dataset to create.
    #[arg(short, long)]
    pub name: String,

    /// Dataset description.
    #[arg(short, long)]
    pub description: Option<String>,

    /// Publish a single reference by id.
    #[arg(long)]
    pub report_id: Option<String>,

    /// Keyword matched against title and content.
    #[arg(short, long)]
    pub keywords: Option<String>,

    /// Earliest creation date (YYYY-MM-DD, inclusive).
    #[arg(long)]
    pub since: Option<NaiveDate>,

    /// Latest creation date (YYYY-MM-DD, inclusive).
    #[arg(long)]
    pub until: Option<NaiveDate>,

    /// Equality condition `field=value` (repeatable).
    #[arg(long = "where", value_name = "FIELD=VALUE")]
    pub filters: Vec<String>,

    /// Skip attachment downloads and publish rendered documents only.
    #[arg(long)]
    pub no_attachments: bool,

    /// Documents per publish batch (defaults to the config value).
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Publish into an existing dataset, updating documents already uploaded.
    #[arg(long)]
    pub dataset_id: Option<String>,

    /// Print the result as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Dataset subcommands.
#[derive(Subcommand)]
pub(crate) enum DatasetAction {
    /// List datasets.
    List {
        #[arg(long, default_value = "1")]
        page: u32,
        #[arg(long, default_value = "20")]
        limit: u32,
    },
    /// Show one dataset.
    Show { id: String },
    /// Create an empty dataset.
    Create {
        name: String,
        #[arg(short, long)]
        description: Option<String>,
    },
    /// Delete a dataset.
    Delete { id: String },
}

/// Document subcommands.
#[derive(Subcommand)]
pub(crate) enum DocumentAction {
    /// List every document in a dataset.
    List {
        #[arg(long)]
        dataset: String,
    },
    /// Upload a local file as a new document.
    Upload {
        #[arg(long)]
        dataset: String,
        file: PathBuf,
    },
    /// Delete a document.
    Delete {
        #[arg(long)]
        dataset: String,
        id: String,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

/// Reference database subcommands.
#[derive(Subcommand)]
pub(crate) enum DbAction {
    /// Import references from a JSON array or JSON-lines file.
    Import { file: PathBuf },
    /// List the most recent references.
    List {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Count stored references.
    Count,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "refkb=info",
        1 => "refkb=debug",
        _ => "refkb=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Build(args) => cmd_build(args).await,
        Command::Datasets { action } => cmd_datasets(action).await,
        Command::Documents { action } => cmd_documents(action).await,
        Command::Status { dataset, batch } => cmd_status(&dataset, &batch).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
        Command::Db { action } => cmd_db(action).await,
    }
}

fn gateway_from(config: &AppConfig) -> Result<KnowledgeBaseGateway> {
    let api_key = validate_api_key(config)?;
    let transport = Transport::new(&TransportConfig::from(config), api_key)?;
    Ok(KnowledgeBaseGateway::new(transport))
}

fn db_path(config: &AppConfig) -> PathBuf {
    expand_home(&config.database.path)
}

// ---------------------------------------------------------------------------
// build
// ---------------------------------------------------------------------------

async fn cmd_build(args: BuildArgs) -> Result<()> {
    let config = load_config()?;
    let gateway = gateway_from(&config)?;
    let store = ReferenceStore::open_readonly(&db_path(&config)).await?;
    let enrichment =
        EnrichmentClient::new(Duration::from_secs(config.enrichment.timeout_secs))?;
    let ledger = DocumentLedger::open(expand_home(&config.build.ledger_path));

    let request = build_request(&args, &config)?;
    info!(name = %request.dataset_name, "starting build");

    let progress = Arc::new(CliProgress::new());
    let builder = Arc::new(
        KnowledgeBuilder::new(
            Arc::new(store),
            gateway,
            enrichment,
            Arc::new(ledger),
            BuildConfig::from(&config),
        )
        .with_progress(progress),
    );

    let jobs = BuildJobs::new();
    let job_id = jobs.submit(builder, request).await;

    let status = tokio::select! {
        status = jobs.wait(&job_id) => status,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupt received, cancelling build");
            jobs.cancel(&job_id).await;
            jobs.wait(&job_id).await
        }
    };

    match status {
        Some(JobStatus::Completed(result)) => {
            if args.json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
            if result.success {
                Ok(())
            } else {
                Err(eyre!("{}", result.message))
            }
        }
        Some(JobStatus::Failed(message)) => Err(eyre!("build task failed: {message}")),
        other => Err(eyre!("build ended in unexpected state: {other:?}")),
    }
}

fn build_request(args: &BuildArgs, config: &AppConfig) -> Result<BuildRequest> {
    let mut request = BuildRequest::new(args.name.clone());
    request.description = args.description.clone();
    request.report_id = args.report_id.clone();
    request.include_attachments = !args.no_attachments;
    request.batch_size = args.batch_size.unwrap_or(config.build.batch_size);
    request.existing_dataset_id = args.dataset_id.clone();

    let mut conditions = QueryConditions {
        keywords: args.keywords.clone(),
        ..Default::default()
    };
    if args.since.is_some() || args.until.is_some() {
        conditions.date_range = Some(DateRange {
            start: args.since,
            end: args.until,
        });
    }
    for filter in &args.filters {
        let (key, value) = filter
            .split_once('=')
            .ok_or_else(|| eyre!("invalid --where '{filter}': expected FIELD=VALUE"))?;
        conditions
            .equals
            .insert(key.trim().to_string(), filter_value(value));
    }
    if !conditions.is_empty() {
        request.query_conditions = Some(conditions);
    }
    Ok(request)
}

/// A `--where` value: a JSON scalar (`12`, `true`, `null`, `"12"`) when it
/// parses as one, otherwise the raw text.
fn filter_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw.trim()) {
        Ok(value) if !value.is_array() && !value.is_object() => value,
        _ => Value::String(raw.to_string()),
    }
}

fn print_result(result: &BuildResult) {
    println!();
    if result.success {
        println!("  Knowledge base built.");
    } else {
        println!("  Build did not succeed.");
    }
    println!("  Message:   {}", result.message);
    if let Some(id) = &result.dataset_id {
        println!("  Dataset:   {id}");
    }
    println!("  Total:     {}", result.total_items);
    println!("  Published: {}", result.processed_items);
    println!("  Failed:    {}", result.failed_items);
    for (record_id, outcome) in &result.outcomes {
        if let PublishOutcome::Failed { reason } = outcome {
            println!("    {record_id}: {reason}");
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(Duration::from_millis(80));
        Self { spinner }
    }
}

impl BuildProgress for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn record_enriched(&self, record_id: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Preparing [{current}/{total}] {record_id}"));
    }

    fn record_published(&self, record_id: &str, outcome: &PublishOutcome, current: usize, total: usize) {
        let mark = if outcome.is_published() { "ok" } else { "failed" };
        self.spinner
            .set_message(format!("Publishing [{current}/{total}] {record_id} ({mark})"));
    }

    fn done(&self, _result: &BuildResult) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// datasets / documents / status
// ---------------------------------------------------------------------------

async fn cmd_datasets(action: DatasetAction) -> Result<()> {
    let config = load_config()?;
    let gateway = gateway_from(&config)?;

    match action {
        DatasetAction::List { page, limit } => {
            let listing = gateway.list_datasets(page, limit).await?;
            for dataset in &listing.data {
                println!(
                    "{}  {:<32}  {} docs",
                    dataset.id, dataset.name, dataset.document_count
                );
            }
            if listing.has_more {
                println!("(more on page {})", page + 1);
            }
        }
        DatasetAction::Show { id } => {
            let dataset = gateway.get_dataset(&id).await?;
            println!("{}", serde_json::to_string_pretty(&dataset)?);
        }
        DatasetAction::Create { name, description } => {
            let id = gateway
                .create_dataset(
                    &name,
                    description.as_deref(),
                    &config.knowledge_base.permission,
                    &config.knowledge_base.indexing_technique,
                )
                .await?;
            println!("Dataset created: {id}");
        }
        DatasetAction::Delete { id } => {
            gateway.delete_dataset(&id).await?;
            println!("Dataset deleted: {id}");
        }
    }
    Ok(())
}

async fn cmd_documents(action: DocumentAction) -> Result<()> {
    let config = load_config()?;
    let gateway = gateway_from(&config)?;

    match action {
        DocumentAction::List { dataset } => {
            for document in gateway.list_documents(&dataset).await? {
                println!(
                    "{}  {:<40}  {}",
                    document.id,
                    document.name,
                    document.indexing_status.as_deref().unwrap_or("-")
                );
            }
        }
        DocumentAction::Upload { dataset, file } => {
            let build = BuildConfig::from(&config);
            let segmentation = refkb_gateway::Segmentation {
                separator: build.separator,
                max_tokens: build.max_tokens,
            };
            let id = gateway
                .create_document_by_file(
                    &dataset,
                    &file,
                    &build.indexing_technique,
                    &build.process_mode,
                    &segmentation,
                )
                .await?;
            println!("Document created: {id}");
        }
        DocumentAction::Delete { dataset, id } => {
            gateway.delete_document(&dataset, &id).await?;
            println!("Document deleted: {id}");
        }
    }
    Ok(())
}

async fn cmd_status(dataset: &str, batch: &str) -> Result<()> {
    let config = load_config()?;
    let gateway = gateway_from(&config)?;
    let status = gateway.get_indexing_status(dataset, batch).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// db
// ---------------------------------------------------------------------------

async fn cmd_db(action: DbAction) -> Result<()> {
    let config = load_config()?;
    let path = db_path(&config);

    match action {
        DbAction::Import { file } => {
            let records = read_records(&file)?;
            let store = ReferenceStore::open(&path).await?;
            for record in &records {
                store.insert_record(record).await?;
            }
            info!(count = records.len(), db = %path.display(), "references imported");
            println!("Imported {} references into {}", records.len(), path.display());
        }
        DbAction::List { limit } => {
            let store = ReferenceStore::open_readonly(&path).await?;
            for record in store.query_recent(limit).await? {
                println!(
                    "{}  {}  {:<10}  {}",
                    record.created_at.format("%Y-%m-%d"),
                    record.id,
                    record.source_type,
                    record.title
                );
            }
        }
        DbAction::Count => {
            let store = ReferenceStore::open_readonly(&path).await?;
            println!("{}", store.count().await?);
        }
    }
    Ok(())
}

/// Parse a JSON array of records, or one record per line.
fn read_records(file: &Path) -> Result<Vec<ReferenceRecord>> {
    let raw = std::fs::read_to_string(file)
        .wrap_err_with(|| format!("failed to read {}", file.display()))?;
    if raw.trim_start().starts_with('[') {
        return serde_json::from_str(&raw)
            .wrap_err_with(|| format!("invalid record array in {}", file.display()));
    }
    raw.lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(n, line)| {
            serde_json::from_str(line)
                .wrap_err_with(|| format!("{}:{}: invalid record", file.display(), n + 1))
        })
        .collect()
}
