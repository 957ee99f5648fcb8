//! Dualstore Administration CLI

mod verify;

use anyhow::{Context, Result, anyhow, bail};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use dualstore_core::{
    Backends, HookEventSink, ItemStatus, MemoryLockStore, Property, PublishBatch, Publisher,
    RelationKind, RepositoryConfig, ResourceStore, SqliteBackend, SubtreeFilter, TracingReport,
    TreeKind,
};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "dualstore-admin")]
#[command(author = "Dualstore Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Dualstore repository administration and publishing tool")]
struct Cli {
    /// Repository directory
    #[arg(short, long, global = true, default_value = ".")]
    repo: PathBuf,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Initialize a new repository
    Init,

    /// Create a draft folder
    Mkdir { path: String },

    /// Create or overwrite a draft file from a local file ("-" reads stdin)
    Put {
        path: String,
        file: String,
        #[arg(short, long, default_value_t = 0)]
        type_id: u32,
    },

    /// Add a path sharing the content of an existing file
    Sibling { source: String, destination: String },

    /// Move or rename a draft resource
    Mv { source: String, destination: String },

    /// Delete a draft resource and everything below it
    Rm { path: String },

    /// Record a relation between two draft resources
    Link {
        source: String,
        target: String,
        #[arg(short, long, default_value = "link")]
        kind: String,
    },

    /// Set or remove a property of a draft resource
    Propset {
        path: String,
        name: String,
        value: Option<String>,
        /// Store the value on the content, visible to every sibling
        #[arg(long)]
        shared: bool,
        /// Remove the property instead of setting it
        #[arg(long, conflicts_with = "value")]
        delete: bool,
    },

    /// List pending draft changes
    Status {
        #[arg(default_value = "/")]
        path: String,
    },

    /// Publish pending changes to the live tree
    Publish {
        #[arg(default_value = "/")]
        root: String,
        /// Publish a batch saved earlier instead of collecting one
        #[arg(long)]
        batch: Option<PathBuf>,
        /// Write the batch to a file before publishing
        #[arg(long)]
        save_batch: Option<PathBuf>,
        /// Only collect (and save) the batch
        #[arg(long)]
        dry_run: bool,
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Print the bytes of a file
    Cat {
        path: String,
        /// Read from the live tree instead of the draft tree
        #[arg(long)]
        live: bool,
    },

    /// Show the publish history of a resource
    History {
        path: String,
        #[arg(long)]
        json: bool,
    },

    /// Verify repository integrity
    Verify {
        #[arg(short, long)]
        quiet: bool,
    },
}

fn init_tracing(debug: bool) {
    let env_filter = if debug {
        tracing_subscriber::EnvFilter::new("debug")
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into())
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(env_filter)
        .init();
}

/// Open the SQLite repository at `repo_path`
pub(crate) async fn open_repository(repo_path: &Path) -> Result<Arc<ResourceStore>> {
    let config = RepositoryConfig::load(repo_path)
        .with_context(|| format!("Failed to load configuration from {}", repo_path.display()))?;
    let backend = SqliteBackend::open(repo_path)
        .with_context(|| format!("Failed to open repository at {}", repo_path.display()))?;
    let store = ResourceStore::new(
        Backends::from_backend(Arc::new(backend)),
        Arc::new(HookEventSink::new(repo_path)),
        config,
    );
    store.initialize().await?;
    Ok(Arc::new(store))
}

fn read_input(file: &str) -> Result<Bytes> {
    let data = if file == "-" {
        let mut buf = Vec::new();
        std::io::Read::read_to_end(&mut std::io::stdin(), &mut buf)?;
        buf
    } else {
        fs::read(file).with_context(|| format!("Failed to read {}", file))?
    };
    Ok(Bytes::from(data))
}

fn default_user() -> String {
    std::env::var("USER").unwrap_or_else(|_| "admin".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);
    let repo = cli.repo.as_path();

    match cli.command {
        Commands::Init => {
            println!("Initializing repository at {}", repo.display());
            fs::create_dir_all(repo)?;
            if !repo.join(dualstore_core::config::CONFIG_FILE).exists() {
                RepositoryConfig::default().save(repo)?;
            }
            HookEventSink::new(repo).ensure_hooks_dir()?;
            open_repository(repo).await?;
            println!("Repository initialized successfully");
        }

        Commands::Mkdir { path } => {
            let store = open_repository(repo).await?;
            let folder = store.create_folder(&path).await?;
            println!("Created folder {} ({})", folder.path(), folder.structure_id());
        }

        Commands::Put { path, file, type_id } => {
            let store = open_repository(repo).await?;
            let data = read_input(&file)?;
            let size = data.len();
            let resource = if store.exists(TreeKind::Draft, &path).await? {
                store.write_file(&path, data).await?
            } else {
                store.create_file(&path, type_id, data).await?
            };
            println!("Stored {} bytes at {} ({})", size, resource.path(), resource.state());
        }

        Commands::Sibling { source, destination } => {
            let store = open_repository(repo).await?;
            let sibling = store.create_sibling(&source, &destination).await?;
            println!(
                "Created sibling {} of {} ({} siblings)",
                sibling.path(),
                source,
                sibling.sibling_count()
            );
        }

        Commands::Mv { source, destination } => {
            let store = open_repository(repo).await?;
            let moved = store.move_resource(&source, &destination).await?;
            println!("Moved {} to {}", source, moved.path());
        }

        Commands::Rm { path } => {
            let store = open_repository(repo).await?;
            store.delete_resource(&path).await?;
            println!("Deleted {}", path);
        }

        Commands::Link { source, target, kind } => {
            let store = open_repository(repo).await?;
            let edge = store
                .add_relation(&source, &target, RelationKind::parse(&kind))
                .await?;
            if edge.is_broken() {
                println!("Linked {} to {} (target does not exist yet)", source, target);
            } else {
                println!("Linked {} to {}", source, target);
            }
        }

        Commands::Propset {
            path,
            name,
            value,
            shared,
            delete,
        } => {
            let store = open_repository(repo).await?;
            let property = match (delete, value) {
                (true, _) => Property::removal(&name),
                (false, Some(value)) if shared => Property::shared(&name, value),
                (false, Some(value)) => Property::individual(&name, value),
                (false, None) => bail!("A value is required unless --delete is given"),
            };
            store.write_properties(&path, &[property]).await?;
            println!("Property '{}' updated on {}", name, path);
        }

        Commands::Status { path } => {
            let store = open_repository(repo).await?;
            let pending = store
                .read_subtree(TreeKind::Draft, &path, &SubtreeFilter::pending())
                .await?;
            if pending.is_empty() {
                println!("Nothing to publish");
            }
            for resource in pending {
                println!("{:<18} {}", resource.state().to_string(), resource.path());
            }
        }

        Commands::Publish {
            root,
            batch,
            save_batch,
            dry_run,
            user,
        } => {
            let store = open_repository(repo).await?;
            let user = user.unwrap_or_else(default_user);
            let batch = match batch {
                Some(file) => {
                    let text = fs::read_to_string(&file)
                        .with_context(|| format!("Failed to read batch {}", file.display()))?;
                    PublishBatch::from_json(&text)?
                }
                None => PublishBatch::collect(&store, &root, &user).await?,
            };
            if let Some(file) = save_batch {
                fs::write(&file, batch.to_json()?)
                    .with_context(|| format!("Failed to write batch {}", file.display()))?;
                println!("Saved batch of {} item(s) to {}", batch.len(), file.display());
            }
            if dry_run {
                return Ok(());
            }
            if batch.is_empty() {
                println!("Nothing to publish");
                return Ok(());
            }

            let publisher = Publisher::new(
                store,
                Arc::new(MemoryLockStore::new()),
                Arc::new(TracingReport::new()),
            );
            let cancel = publisher.cancel_handle();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Cancelling publish after the current item");
                    cancel.store(true, Ordering::SeqCst);
                }
            });

            let summary = publisher.publish(&batch).await?;
            for outcome in &summary.outcomes {
                let shown = outcome
                    .path
                    .clone()
                    .unwrap_or_else(|| outcome.structure_id.to_string());
                match &outcome.status {
                    ItemStatus::Published(action) => println!("  {:<20} {}", action.to_string(), shown),
                    ItemStatus::Failed(message) => println!("  {:<20} {}: {}", "failed", shown, message),
                }
            }
            println!(
                "Publish tag {}: {} published, {} failed{}",
                summary.publish_tag,
                summary.published(),
                summary.failed(),
                if summary.cancelled { " (cancelled)" } else { "" }
            );
            if summary.failed() > 0 {
                return Err(anyhow!("{} item(s) failed to publish", summary.failed()));
            }
        }

        Commands::Cat { path, live } => {
            let store = open_repository(repo).await?;
            let tree = if live { TreeKind::Live } else { TreeKind::Draft };
            let data = store.read_file(tree, &path).await?;
            std::io::Write::write_all(&mut std::io::stdout(), &data)?;
        }

        Commands::History { path, json } => {
            let store = open_repository(repo).await?;
            let history = store.read_history(&path).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&history)?);
            } else {
                for snapshot in history {
                    println!(
                        "v{:<4} tag {:<5} {:<18} {}  content v{}  {}",
                        snapshot.version,
                        snapshot.publish_tag,
                        snapshot.state.to_string(),
                        snapshot.path,
                        snapshot.content_version,
                        snapshot.date_content.format("%Y-%m-%d %H:%M:%S"),
                    );
                }
            }
        }

        Commands::Verify { quiet } => {
            verify::verify_repository(repo, quiet).await?;
        }
    }

    Ok(())
}
