//! Portal CLI - agent conversations with compiled memory
//!
//! Usage:
//!   portal serve             - Run the HTTP API
//!   portal ingest <path>     - Extract memories from .md/.txt files
//!   portal seed              - Insert core memories and base models
//!   portal embed             - Embed memories that have no vector yet
//!   portal memory ...        - Inspect and edit the memory graph
//!   portal models ...        - Manage the base model catalog

mod ingest;
mod server;

use anyhow::Context;
use clap::{Parser, Subcommand};
use portal_core::{
    seed_core_memories, ChatRelay, DocumentOutcome, DocumentProcessor, DocumentRequest,
    EmbeddingService, FailedDocument, LlmClient, MemoryWeaver, ModelCatalog, OpenRouterClient,
    PortalConfig, SourceType, UserStore,
};
use portal_memory::{Database, LinkStore, MemoryRecord, MemoryStore, MemoryType};
use secrecy::ExposeSecret;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "portal")]
#[command(author = "HeyBattle1")]
#[command(version)]
#[command(about = "Agent conversations with compiled memory context", long_about = None)]
struct Cli {
    /// Debug logging (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (default ~/.portal/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, env = "PORTAL_DATABASE_URL")]
    database_url: Option<String>,

    /// LLM gateway credential
    #[arg(long, global = true, env = "OPENROUTER_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Shared key required by the HTTP API
    #[arg(long, global = true, env = "PORTAL_KEY", hide_env_values = true)]
    portal_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP API
    Serve {
        #[arg(long, env = "PORTAL_BIND")]
        bind: Option<String>,
    },

    /// Chunk files and extract memories from each chunk
    Ingest {
        /// A file or a directory (walked recursively)
        path: PathBuf,

        /// Document type passed to extraction
        #[arg(long = "type", default_value = "dialogue")]
        document_type: String,

        /// Only report how the files would be chunked
        #[arg(long)]
        dry_run: bool,

        /// Embed new memories afterwards
        #[arg(long)]
        embed: bool,
    },

    /// Process one document request (JSON) and print the result as JSON
    #[command(hide = true)]
    ProcessDocument {
        json: String,
    },

    /// Insert the core memories and default base models that are missing
    Seed,

    /// Embed every memory that has no vector yet
    Embed,

    /// Inspect and edit memories
    Memory {
        #[command(subcommand)]
        action: MemoryAction,
    },

    /// Manage the base model catalog
    Models {
        #[command(subcommand)]
        action: ModelsAction,
    },

    /// Grant or revoke admin access
    Admin {
        #[command(subcommand)]
        action: AdminAction,
    },

    /// Title every conversation still named "New Conversation"
    Titles {
        /// Model used for titles (default: the selected default model)
        #[arg(long)]
        model: Option<String>,
    },
}

#[derive(Subcommand)]
enum MemoryAction {
    /// List active memories of one type
    List {
        #[arg(long = "type")]
        memory_type: MemoryType,
    },

    /// Highest-resonance memories
    Top {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Term search over content and titles
    Search {
        query: String,
        #[arg(long = "type")]
        memory_type: Option<MemoryType>,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Search by embedding similarity
    Semantic {
        query: String,
        #[arg(long, default_value_t = portal_core::embeddings::DEFAULT_SEARCH_LIMIT)]
        limit: usize,
        #[arg(long, default_value_t = portal_core::embeddings::DEFAULT_MIN_SIMILARITY)]
        min_similarity: f64,
    },

    /// Print one memory
    Show { id: String },

    /// Links in and out of a memory
    Links { id: String },

    /// Memories reachable from one memory
    Connected {
        id: String,
        #[arg(long, default_value_t = 1)]
        depth: usize,
    },

    /// Soft-delete a memory
    Deactivate { id: String },

    /// Extract memories about a subject from a text file
    Weave {
        file: PathBuf,
        /// Whose facts these are
        #[arg(long)]
        subject: Option<String>,
        #[arg(long, default_value = "cli")]
        source_id: String,
    },
}

#[derive(Subcommand)]
enum ModelsAction {
    /// Active base models
    List,

    /// Show the default model
    Default,

    /// Make a base model the default
    Select { id: String },

    /// Enable or disable a base model
    Toggle { id: String },
}

#[derive(Subcommand)]
enum AdminAction {
    Grant { user_id: String },
    Revoke { user_id: String },
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // stdout belongs to command output; process-document prints JSON there
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> anyhow::Result<PortalConfig> {
    let config = match &cli.config {
        Some(path) => PortalConfig::load_from(path)?,
        None => PortalConfig::load()?,
    };
    let mut config = config
        .with_api_key(cli.api_key.clone())
        .with_portal_key(cli.portal_key.clone());
    if let Some(url) = &cli.database_url {
        config.database_url = url.clone();
    }
    Ok(config)
}

async fn open_database(config: &PortalConfig) -> anyhow::Result<Database> {
    std::fs::create_dir_all(portal_core::config::portal_dir())
        .context("Failed to create ~/.portal")?;
    let db = Database::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open {}", config.database_url))?;
    portal_core::schema::migrate(&db).await?;
    Ok(db)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    let db = open_database(&config).await?;
    let llm: Arc<dyn LlmClient> = Arc::new(OpenRouterClient::new(&config));

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.bind.clone());
            let state = Arc::new(server::AppState::new(&db, llm, &config));
            let app = server::router(state);

            let listener = tokio::net::TcpListener::bind(&bind)
                .await
                .with_context(|| format!("Failed to bind {bind}"))?;
            if config.portal_key.is_some() {
                tracing::info!("Portal key required on every request");
            }
            println!("Portal listening on http://{bind}");
            axum::serve(listener, app).await?;
        }

        Commands::Ingest {
            path,
            document_type,
            dry_run,
            embed,
        } => {
            let mut global_args = vec!["--database-url".to_string(), config.database_url.clone()];
            if let Some(path) = &cli.config {
                global_args.push("--config".to_string());
                global_args.push(path.display().to_string());
            }
            let mut processor = ingest::CommandProcessor::current_exe(global_args)?;
            if let Some(key) = &config.api_key {
                processor = processor.with_env("OPENROUTER_API_KEY", key.expose_secret().as_str());
            }

            let options = ingest::IngestOptions {
                document_type,
                dry_run,
                ..Default::default()
            };
            let summary = ingest::ingest(&path, &processor, &options).await?;
            ingest::print_summary(&summary);

            if embed && !dry_run && summary.memories > 0 {
                println!();
                println!("Embedding new memories...");
                let report = EmbeddingService::new(&db, llm).embed_all().await?;
                println!(
                    "Embedded {}/{} ({} failed, {} tokens)",
                    report.embedded, report.total_memories, report.failed, report.total_tokens
                );
            }
        }

        Commands::ProcessDocument { json } => {
            let request: DocumentRequest =
                serde_json::from_str(&json).context("Invalid document request JSON")?;
            let processor = DocumentProcessor::new(&db, llm, config.extraction_model.clone());
            let outcome = match processor.process_document(&request).await {
                Ok(outcome) => outcome,
                Err(e) => DocumentOutcome::Failed(FailedDocument {
                    success: false,
                    error: e.to_string(),
                    raw_output: String::new(),
                    tokens_used: 0,
                }),
            };
            println!("{}", serde_json::to_string(&outcome)?);
        }

        Commands::Seed => {
            let report = seed_core_memories(&db).await?;
            let models = ModelCatalog::new(&db).seed_defaults().await?;
            println!(
                "Seeded {} memories, {} links, {} base models",
                report.memories_seeded, report.links_seeded, models
            );
        }

        Commands::Embed => {
            let report = EmbeddingService::new(&db, llm).embed_all().await?;
            println!(
                "Embedded {}/{} memories ({} failed, {} tokens)",
                report.embedded, report.total_memories, report.failed, report.total_tokens
            );
        }

        Commands::Memory { action } => run_memory(action, &db, llm, &config).await?,

        Commands::Models { action } => {
            let catalog = ModelCatalog::new(&db);
            match action {
                ModelsAction::List => {
                    for model in catalog.list_active().await? {
                        println!(
                            "{}  {:<40} {} ({} tokens)",
                            model.id, model.model_id, model.name, model.context_length
                        );
                    }
                }
                ModelsAction::Default => match catalog.current_default().await? {
                    Some(model) => println!("{} ({})", model.name, model.model_id),
                    None => println!("No default model selected"),
                },
                ModelsAction::Select { id } => {
                    let model = catalog.select_default(&id).await?;
                    println!("Default model is now {}", model.model_id);
                }
                ModelsAction::Toggle { id } => {
                    let active = catalog.toggle_active(&id).await?;
                    println!("{id} is now {}", if active { "active" } else { "inactive" });
                }
            }
        }

        Commands::Admin { action } => {
            let users = UserStore::new(&db);
            let (user_id, is_admin) = match action {
                AdminAction::Grant { user_id } => (user_id, true),
                AdminAction::Revoke { user_id } => (user_id, false),
            };
            users.ensure(&user_id, None).await?;
            users.set_admin(&user_id, is_admin).await?;
            println!("{user_id}: admin = {is_admin}");
        }

        Commands::Titles { model } => {
            let model = match model {
                Some(model) => model,
                None => ModelCatalog::new(&db)
                    .current_default()
                    .await?
                    .map(|m| m.model_id)
                    .unwrap_or_else(|| config.extraction_model.clone()),
            };
            let relay = ChatRelay::new(&db, llm, config.history_limit);
            let renamed = relay.name_unnamed(&model).await?;
            println!("Renamed {renamed} conversation(s)");
        }
    }

    Ok(())
}

fn print_memory_line(memory: &MemoryRecord) {
    println!(
        "[{:.2}] {:<32} {} ({})",
        memory.resonance, memory.memory_id, memory.title, memory.memory_type
    );
}

async fn run_memory(
    action: MemoryAction,
    db: &Database,
    llm: Arc<dyn LlmClient>,
    config: &PortalConfig,
) -> anyhow::Result<()> {
    let store = MemoryStore::new(db);
    let links = LinkStore::new(db);

    match action {
        MemoryAction::List { memory_type } => {
            for memory in store.list_by_type(memory_type).await? {
                print_memory_line(&memory);
            }
        }
        MemoryAction::Top { limit } => {
            for memory in store.top_by_resonance(limit).await? {
                print_memory_line(&memory);
            }
        }
        MemoryAction::Search {
            query,
            memory_type,
            limit,
        } => {
            let hits = store.search(&query, memory_type, limit).await?;
            if hits.is_empty() {
                println!("No matches for \"{query}\"");
            }
            for memory in &hits {
                print_memory_line(memory);
            }
        }
        MemoryAction::Semantic {
            query,
            limit,
            min_similarity,
        } => {
            let hits = EmbeddingService::new(db, llm)
                .semantic_search(&query, limit, min_similarity)
                .await?;
            for hit in hits {
                println!("{:.3}  {:<32} {}", hit.similarity, hit.memory_id, hit.title);
            }
        }
        MemoryAction::Show { id } => {
            let memory = store
                .get(&id)
                .await?
                .with_context(|| format!("No active memory {id}"))?;
            println!("{}", serde_json::to_string_pretty(&memory)?);
        }
        MemoryAction::Links { id } => {
            let set = links.links_for(&id).await?;
            for link in &set.outgoing {
                println!("-> {} [{} {:.2}]", link.target_memory_id, link.link_type, link.weight);
            }
            for link in &set.incoming {
                println!("<- {} [{} {:.2}]", link.source_memory_id, link.link_type, link.weight);
            }
        }
        MemoryAction::Connected { id, depth } => {
            for connected in links.connected(&id, depth).await? {
                let path: Vec<&str> = connected.path.iter().map(|t| t.as_str()).collect();
                println!(
                    "{}{} ({})",
                    "  ".repeat(connected.depth),
                    connected.memory_id,
                    path.join(" > ")
                );
            }
        }
        MemoryAction::Deactivate { id } => {
            store.deactivate(&id).await?;
            println!("Deactivated {id}");
        }
        MemoryAction::Weave {
            file,
            subject,
            source_id,
        } => {
            let content = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let weaver = MemoryWeaver::new(db, llm, config.extraction_model.clone());
            let report = weaver
                .extract_memories(&content, SourceType::Conversation, &source_id, subject.as_deref())
                .await?;
            println!(
                "{} facts, {} insights, {} tokens",
                report.subject_facts_extracted, report.insights_extracted, report.tokens_used
            );
            for id in report.memories_created {
                println!("  + {id}");
            }
        }
    }

    Ok(())
}
