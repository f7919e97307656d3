//! # Concept Index CLI (`cidx`)
//!
//! The `cidx` binary is the primary interface for Concept Index. It provides
//! commands for database initialization, ontology management, dictionary
//! builds, pipeline runs and index lookups.
//!
//! ## Usage
//!
//! ```bash
//! cidx --config ./config/cidx.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `cidx init` | Create the SQLite database and run schema migrations |
//! | `cidx resources` | List configured resources and their fields |
//! | `cidx ontology load <dir>` | Load an ontology bundle |
//! | `cidx ontology remove <id>` | Retire an ontology version |
//! | `cidx ontology list` | List ontology versions |
//! | `cidx dictionary build` | Open a dictionary version and publish its file |
//! | `cidx run <resource\|all>` | Annotate, expand and index resources |
//! | `cidx sort <resource>` | Re-rank a resource's index entries |
//! | `cidx stats` | Annotation and index counts |
//! | `cidx search <concept>` | Items indexed with a concept |

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use concept_index::progress::ProgressMode;
use concept_index::sqlite_store::SqliteStore;
use concept_index::{config, db, dictionary, ingest, loader, migrate, resources, search, stats};

/// Concept Index CLI: ontology-driven annotation and ranked indexing.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "cidx",
    about = "Concept Index: ontology-driven annotation and ranked indexing of text resources",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/cidx.toml")]
    config: PathBuf,

    /// Emit logs and progress as JSON lines on stderr.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// List configured resources and their status.
    Resources,

    /// Manage ontology versions.
    Ontology {
        #[command(subcommand)]
        action: OntologyAction,
    },

    /// Manage dictionary versions.
    Dictionary {
        #[command(subcommand)]
        action: DictionaryAction,
    },

    /// Annotate and index a resource, or `all` of them in id order.
    Run {
        /// Resource id or `all`.
        resource: String,

        /// Drop the resource's index entries and rebuild them.
        #[arg(long)]
        reinit: bool,
    },

    /// Re-rank the index entries of a resource.
    Sort {
        resource: String,
    },

    /// Show annotation and index statistics.
    Stats,

    /// List the items indexed with a concept, best first.
    Search {
        /// Numeric concept id.
        concept: i64,

        /// Only entries of this resource.
        #[arg(long)]
        resource: Option<String>,

        /// Maximum number of entries.
        #[arg(long, default_value_t = search::DEFAULT_LIMIT)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum OntologyAction {
    /// Load a directory of ontology TSV files.
    Load { dir: PathBuf },
    /// Retire an ontology version and everything derived from it.
    Remove { id: i64 },
    /// List loaded ontology versions.
    List,
}

#[derive(Subcommand)]
enum DictionaryAction {
    /// Open a dictionary version when ontologies are pending and publish
    /// its file.
    Build {
        /// Publish the full dictionary instead of the delta.
        #[arg(long)]
        full: bool,

        /// Always open a new version with this name.
        #[arg(long)]
        name: Option<String>,
    },
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = fmt().with_env_filter(filter).with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Resources => {
            resources::list_resources(&cfg)?;
        }
        Commands::Run { resource, reinit } => {
            let progress = ProgressMode::detect(cli.json_logs).reporter();
            ingest::run_command(&cfg, &resource, reinit, progress.as_ref()).await?;
        }
        Commands::Sort { resource } => {
            ingest::sort_command(&cfg, &resource).await?;
        }
        Commands::Ontology { action } => {
            let store = SqliteStore::new(db::connect(&cfg).await?);
            match action {
                OntologyAction::Load { dir } => loader::run_load(&store, &dir).await?,
                OntologyAction::Remove { id } => loader::run_remove(&cfg, &store, id).await?,
                OntologyAction::List => loader::run_list(&store).await?,
            }
            store.pool().close().await;
        }
        Commands::Dictionary {
            action: DictionaryAction::Build { full, name },
        } => {
            let store = SqliteStore::new(db::connect(&cfg).await?);
            dictionary::build_dictionary(&cfg, &store, full, name.as_deref()).await?;
            store.pool().close().await;
        }
        Commands::Stats => {
            let store = SqliteStore::new(db::connect(&cfg).await?);
            stats::run_stats(&store, &cfg.db.path).await?;
            store.pool().close().await;
        }
        Commands::Search {
            concept,
            resource,
            limit,
        } => {
            let store = SqliteStore::new(db::connect(&cfg).await?);
            search::run_search(&store, concept, resource.as_deref(), limit).await?;
            store.pool().close().await;
        }
    }

    Ok(())
}
