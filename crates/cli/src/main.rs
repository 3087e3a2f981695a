use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use kb_core::ParserKind;
use kb_index::{FsBlobStore, MemoryIndex};
use kb_llm::LocalChat;
use kb_rag::{
    AccessGrantResolver, Catalog, HashEmbeddingModel, IngestionPipeline, KbConfig,
    NewKnowledgebase, Principal, ResourceClass, SystemClock, UploadFile, UploadOutcome,
    UploadService, UsageLedger, Visibility,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const DEFAULT_CONFIG: &str = "kb.toml";

#[derive(Parser, Debug)]
#[command(name = "kb", version = VERSION, about = "Knowledge-base ingestion and token quota operator CLI")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long = "data-dir", global = true, default_value = ".kb")]
    data_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    CreateKb {
        #[arg(long)]
        tenant: String,
        #[arg(long)]
        name: String,
        #[arg(long, default_value = "naive")]
        parser: String,
        #[arg(long = "embedding-model", default_value = "hash")]
        embedding_model: String,
    },
    ListKbs {
        #[arg(long)]
        tenant: String,
    },
    Upload {
        kb_id: String,
        inputs: Vec<PathBuf>,
        #[arg(long)]
        user: String,
        #[arg(long, action = ArgAction::SetTrue)]
        superuser: bool,
        #[arg(long, action = ArgAction::SetTrue)]
        public: bool,
    },
    Docs {
        kb_id: String,
    },
    Grant {
        doc_id: String,
        user: String,
    },
    Usage {
        user: String,
    },
    SetLimit {
        user: String,
        #[arg(long)]
        class: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        limit: u64,
    },
    ResetUsage {
        user: String,
        #[arg(long)]
        class: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    Deactivate {
        user: String,
        #[arg(long)]
        class: String,
        #[arg(long)]
        name: String,
    },
    Stats,
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG));
    let config = load_config(&config_path)?;
    fs::create_dir_all(&cli.data_dir)
        .with_context(|| format!("failed to create {}", cli.data_dir.display()))?;

    match cli.command {
        Commands::CreateKb {
            tenant,
            name,
            parser,
            embedding_model,
        } => {
            let parser = ParserKind::parse(&parser).ok_or_else(|| anyhow!("unknown parser {parser}"))?;
            let catalog = open_catalog(&cli.data_dir)?;
            let kb = catalog.create_knowledgebase(&NewKnowledgebase {
                tenant_id: tenant,
                name,
                embedding_model,
                parser,
            })?;
            println!("[kb] Knowledge base '{}' ready (id={})", kb.name, kb.id);
        }
        Commands::ListKbs { tenant } => {
            let catalog = open_catalog(&cli.data_dir)?;
            for kb in catalog.list_knowledgebases(&tenant)? {
                println!(
                    "{}  {:<24} docs={} chunks={} tokens={}",
                    kb.id,
                    kb.name,
                    kb.doc_num,
                    kb.chunk_num,
                    format_number(kb.token_num)
                );
            }
        }
        Commands::Upload {
            kb_id,
            inputs,
            user,
            superuser,
            public,
        } => {
            let files = gather_input_files(&inputs)?;
            if files.is_empty() {
                return Err(anyhow!("no files matched for upload"));
            }
            let principal = Principal {
                id: user,
                is_superuser: superuser,
            };
            let visibility = if public {
                Visibility::Public
            } else {
                Visibility::Private
            };
            let uploads = build_upload_service(&cli.data_dir, &config)?;
            let mut batch = Vec::with_capacity(files.len());
            for path in &files {
                let bytes =
                    fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| anyhow!("{} has no file name", path.display()))?;
                batch.push(UploadFile::new(name, bytes));
            }
            info!(kb_id = %kb_id, files = batch.len(), "uploading");
            let outcomes = uploads.upload(&principal, &kb_id, batch, visibility)?;
            let ingested = outcomes.iter().filter(|o| o.is_ingested()).count();
            for outcome in &outcomes {
                print_outcome(outcome);
            }
            println!("[kb] {ingested}/{} files ingested", outcomes.len());
        }
        Commands::Docs { kb_id } => {
            let catalog = open_catalog(&cli.data_dir)?;
            for doc in catalog.list_documents(&kb_id)? {
                println!("{}", serde_json::to_string(&doc)?);
            }
        }
        Commands::Grant { doc_id, user } => {
            let grants = AccessGrantResolver::new(open_catalog(&cli.data_dir)?);
            if !grants.grant(&doc_id, &user) {
                return Err(anyhow!("could not grant {user} access to {doc_id}"));
            }
            println!("[kb] {user} may now read {doc_id}");
        }
        Commands::Usage { user } => {
            let ledger = open_ledger(&cli.data_dir, &config)?;
            let records = ledger.usage_for(&user)?;
            if records.is_empty() {
                println!("[kb] no usage recorded for {user}");
            }
            for record in records {
                let limit = if record.unit_limit == 0 {
                    "unlimited".to_string()
                } else {
                    format_number(record.unit_limit)
                };
                println!(
                    "{:<12} {:<24} used={} limit={} resets={}{}",
                    record.resource_class,
                    record.resource_name,
                    format_number(record.consumed_units),
                    limit,
                    record.period_reset_at,
                    if record.active { "" } else { " (inactive)" }
                );
            }
        }
        Commands::SetLimit {
            user,
            class,
            name,
            limit,
        } => {
            let ledger = open_ledger(&cli.data_dir, &config)?;
            let record = ledger.set_limit(&Principal::user(user), parse_class(&class)?, &name, limit)?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::ResetUsage { user, class, name } => {
            let ledger = open_ledger(&cli.data_dir, &config)?;
            let class = class.as_deref().map(parse_class).transpose()?;
            let reset = ledger.reset(&user, class, name.as_deref())?;
            println!("[kb] reset {reset} usage records for {user}");
        }
        Commands::Deactivate { user, class, name } => {
            let ledger = open_ledger(&cli.data_dir, &config)?;
            if !ledger.deactivate(&user, parse_class(&class)?, &name)? {
                return Err(anyhow!("no usage record for {user} {class}/{name}"));
            }
            println!("[kb] limit for {user} {class}/{name} no longer enforced");
        }
        Commands::Stats => {
            let ledger = open_ledger(&cli.data_dir, &config)?;
            println!("{}", serde_json::to_string_pretty(&ledger.statistics()?)?);
        }
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn load_config(path: &Path) -> Result<KbConfig> {
    let config = if path.exists() {
        KbConfig::load(path).with_context(|| format!("invalid config {}", path.display()))?
    } else {
        KbConfig::default()
    };
    Ok(config.with_env()?)
}

fn open_catalog(data_dir: &Path) -> Result<Catalog> {
    Ok(Catalog::open(data_dir.join("catalog.sqlite"))?)
}

fn open_ledger(data_dir: &Path, config: &KbConfig) -> Result<UsageLedger> {
    Ok(UsageLedger::open(
        data_dir.join("usage.sqlite"),
        config.quota.clone(),
        Arc::new(SystemClock),
    )?)
}

/// The search index lives in-process; blobs and both databases persist
/// under the data directory.
fn build_upload_service(data_dir: &Path, config: &KbConfig) -> Result<UploadService> {
    let catalog = open_catalog(data_dir)?;
    let ledger = Arc::new(open_ledger(data_dir, config)?);
    let blobs = Arc::new(FsBlobStore::open(data_dir.join("blobs"))?);
    let mut pipeline = IngestionPipeline::new(
        config.ingest.clone(),
        catalog.clone(),
        blobs.clone(),
        Arc::new(MemoryIndex::new()),
        ledger,
        Arc::new(HashEmbeddingModel::from_env()),
    );
    if config.ingest.mind_map {
        pipeline = pipeline.with_chat(Arc::new(LocalChat::default()));
    }
    Ok(UploadService::new(catalog, blobs, Arc::new(pipeline)))
}

fn parse_class(value: &str) -> Result<ResourceClass> {
    ResourceClass::parse(value).ok_or_else(|| anyhow!("unknown resource class {value}"))
}

fn gather_input_files(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for input in inputs {
        let meta = fs::metadata(input)
            .with_context(|| format!("failed to inspect {}", input.display()))?;
        if meta.is_dir() {
            for entry in WalkDir::new(input)
                .sort_by_file_name()
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
            {
                files.push(entry.path().to_path_buf());
            }
        } else if meta.is_file() {
            files.push(input.clone());
        }
    }
    Ok(files)
}

fn print_outcome(outcome: &UploadOutcome) {
    match outcome {
        UploadOutcome::Ingested { name, report, .. } => println!(
            "[kb] {name}: {} chunks, {} tokens in {:.2}s{}",
            report.chunks,
            format_number(report.tokens),
            report.duration_secs,
            if report.mind_map { " (+mind map)" } else { "" }
        ),
        UploadOutcome::Failed { name, error, .. } => println!("[kb] {name}: failed: {error}"),
        UploadOutcome::Rejected { name, reason } => println!("[kb] {name}: rejected: {reason}"),
        UploadOutcome::Duplicate { name, message, .. }
        | UploadOutcome::AccessGranted { name, message, .. } => println!("[kb] {name}: {message}"),
    }
}

fn format_number(value: u64) -> String {
    let s = value.to_string();
    let mut out = String::new();
    for (idx, ch) in s.chars().rev().enumerate() {
        if idx > 0 && idx % 3 == 0 {
            out.push(' ');
        }
        out.push(ch);
    }
    out.chars().rev().collect()
}
