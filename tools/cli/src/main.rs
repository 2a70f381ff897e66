//! chasm CLI - Command line interface for share stores.
//!
//! Sets up remote stores and uploads, deletes, lists, cleans and restores
//! the shares kept in them.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use chasm_common::{AccountId, Share, ShareId};
use chasm_storage::{
    create_default_registry, ConnectorRegistry, Preferences, RemoteStore, Store,
    StoreConfig, StoreRegistry, TerminalPrompt,
};

#[derive(Parser)]
#[command(name = "chasm")]
#[command(about = "chasm - Share storage across remote accounts")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Preferences file (default: platform config dir).
    #[arg(long)]
    preferences: Option<PathBuf>,

    /// Only operate on stores of this backend.
    #[arg(short, long)]
    backend: Option<String>,

    /// Deadline for a single remote call, in seconds.
    #[arg(long, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize a new account and add it as a store.
    Setup {
        /// Backend name: "dropbox" or "local".
        backend: String,

        /// Root directory for the local backend.
        #[arg(long)]
        root: Option<PathBuf>,

        /// Application key; saved for later runs.
        #[arg(long)]
        app_key: Option<String>,

        /// Application secret; saved for later runs.
        #[arg(long)]
        app_secret: Option<String>,
    },

    /// Upload a file as a share to every store.
    Upload {
        /// File holding the share payload.
        file: PathBuf,

        /// Share id (default: the file name).
        #[arg(long)]
        sid: Option<String>,
    },

    /// Delete a share from every store.
    Delete {
        /// Share id.
        sid: String,
    },

    /// Describe every store and its contents.
    List,

    /// Delete everything in every store.
    Clean {
        /// Confirm the irreversible delete.
        #[arg(long)]
        yes: bool,
    },

    /// Download every store's contents.
    Restore {
        /// Move restored files here instead of leaving them staged.
        #[arg(long)]
        dest: Option<PathBuf>,
    },

    /// Forget a configured store.
    Remove {
        /// Backend name.
        backend: String,

        /// Account id as shown by `list`.
        account: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let prefs_path = match cli.preferences {
        Some(path) => path,
        None => Preferences::default_path()?,
    };
    let mut prefs = Preferences::load(&prefs_path)
        .await
        .with_context(|| format!("Failed to load preferences from {}", prefs_path.display()))?;

    let config = StoreConfig::default().with_call_timeout(Duration::from_secs(cli.timeout));
    let registry = create_default_registry();
    let session = Session {
        registry,
        config,
        backend: cli.backend,
    };

    let ctx = &session;
    match cli.command {
        Commands::Setup {
            backend,
            root,
            app_key,
            app_secret,
        } => cmd_setup(ctx, &mut prefs, &backend, root, app_key, app_secret).await,

        Commands::Upload { file, sid } => cmd_upload(ctx, &prefs, &file, sid).await,

        Commands::Delete { sid } => cmd_delete(ctx, &prefs, &sid).await,

        Commands::List => cmd_list(ctx, &prefs).await,

        Commands::Clean { yes } => cmd_clean(ctx, &prefs, yes).await,

        Commands::Restore { dest } => cmd_restore(ctx, &prefs, dest.as_deref()).await,

        Commands::Remove { backend, account } => cmd_remove(&mut prefs, &backend, &account).await,
    }
}

/// What every command needs besides the preferences.
struct Session {
    registry: ConnectorRegistry,
    config: StoreConfig,
    backend: Option<String>,
}

/// Rebuild the configured stores, honouring `--backend`.
fn open_stores(ctx: &Session, prefs: &Preferences) -> Result<Vec<RemoteStore>> {
    let mut stores = Vec::new();
    for record in prefs.records() {
        if ctx.backend.as_deref().is_some_and(|b| b != record.backend) {
            continue;
        }
        let connector = ctx
            .registry
            .resolve(&record.backend, record.provider_config.clone())
            .with_context(|| format!("Failed to open {} store", record.backend))?;
        let store = RemoteStore::from_record(
            connector,
            prefs.app_credentials(&record.backend),
            ctx.config.clone(),
            record,
        )?;
        stores.push(store);
    }

    if stores.is_empty() {
        bail!("No stores configured. Run `chasm setup <backend>` first.");
    }
    Ok(stores)
}

async fn cmd_setup(
    ctx: &Session,
    prefs: &mut Preferences,
    backend: &str,
    root: Option<PathBuf>,
    app_key: Option<String>,
    app_secret: Option<String>,
) -> Result<()> {
    if !ctx.registry.has_backend(backend) {
        bail!(
            "Unknown backend '{}'. Available: {}",
            backend,
            ctx.registry.backends().join(", ")
        );
    }

    let provider_config: Value = match (backend, root) {
        ("local", Some(root)) => json!({ "root": root }),
        ("local", None) => bail!("The local backend needs --root"),
        (_, Some(_)) => bail!("--root only applies to the local backend"),
        _ => Value::Null,
    };

    let mut app = prefs.app_credentials(backend);
    if let Some(key) = app_key {
        app.key = key;
    }
    if let Some(secret) = app_secret {
        app.secret = secret;
    }

    info!("Setting up {} store", backend);
    let connector = ctx.registry.resolve(backend, provider_config.clone())?;
    let mut store = RemoteStore::new(connector, app.clone(), ctx.config.clone())
        .with_provider_config(provider_config);
    store
        .setup(&*prefs, &TerminalPrompt)
        .await
        .context("Setup failed")?;

    prefs.app_credentials.insert(backend.to_string(), app);
    prefs.add_store(store.record()?)?;
    prefs.save().await.context("Failed to save preferences")?;

    println!("Store added: {}", store.label());
    Ok(())
}

async fn cmd_upload(
    ctx: &Session,
    prefs: &Preferences,
    file: &Path,
    sid: Option<String>,
) -> Result<()> {
    let sid = match sid {
        Some(sid) => sid,
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("Cannot derive a share id from the file name")?,
    };
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let share = Share::new(ShareId::new(sid)?, data);

    let stores = open_stores(ctx, prefs)?;
    let mut failed = 0;
    for store in &stores {
        if store.upload(&share).await.is_err() {
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("Upload failed for {} of {} stores", failed, stores.len());
    }
    println!("Share {} uploaded ({} bytes)", share.sid, share.size());
    Ok(())
}

async fn cmd_delete(ctx: &Session, prefs: &Preferences, sid: &str) -> Result<()> {
    let sid = ShareId::new(sid)?;

    let stores = open_stores(ctx, prefs)?;
    let mut failed = 0;
    for store in &stores {
        if store.delete(&sid).await.is_err() {
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("Delete failed for {} of {} stores", failed, stores.len());
    }
    println!("Share {} deleted", sid);
    Ok(())
}

async fn cmd_list(ctx: &Session, prefs: &Preferences) -> Result<()> {
    for store in open_stores(ctx, prefs)? {
        let record = store.record()?;
        println!("{}", store.description().await);
        println!("  Account: {}", record.account_id);
        println!("  Added: {}", record.added_at);
    }
    Ok(())
}

async fn cmd_clean(ctx: &Session, prefs: &Preferences, yes: bool) -> Result<()> {
    if !yes {
        bail!("Clean deletes everything in every store; pass --yes to confirm");
    }

    let mut incomplete = 0;
    for store in open_stores(ctx, prefs)? {
        match store.clean().await {
            Ok(report) if report.is_complete() => {
                println!("{}: {} removed", store.label(), report.removed.len());
            }
            Ok(report) => {
                incomplete += 1;
                for (name, err) in &report.failed {
                    println!("{}: {} not removed: {}", store.label(), name, err);
                }
            }
            Err(_) => incomplete += 1,
        }
    }

    if incomplete > 0 {
        bail!("{} stores were not fully cleaned", incomplete);
    }
    Ok(())
}

async fn cmd_restore(ctx: &Session, prefs: &Preferences, dest: Option<&Path>) -> Result<()> {
    let mut failed = 0;
    for store in open_stores(ctx, prefs)? {
        let restored = match store.restore().await {
            Ok(restored) => restored,
            Err(_) => {
                failed += 1;
                continue;
            }
        };

        let Some(dest) = dest else {
            println!("{}: {} files in {}", store.label(), restored.files.len(), restored.dir.display());
            continue;
        };

        for file in &restored.files {
            let relative = file.strip_prefix(&restored.dir)?;
            let target = dest.join(relative);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(file, &target)
                .await
                .with_context(|| format!("Failed to copy {} to {}", file.display(), target.display()))?;
        }
        if let Err(e) = tokio::fs::remove_dir_all(&restored.dir).await {
            warn!("Failed to remove {}: {}", restored.dir.display(), e);
        }
        println!("{}: {} files restored to {}", store.label(), restored.files.len(), dest.display());
    }

    if failed > 0 {
        bail!("Restore failed for {} stores", failed);
    }
    Ok(())
}

async fn cmd_remove(prefs: &mut Preferences, backend: &str, account: &str) -> Result<()> {
    let removed = prefs
        .remove_store(backend, &AccountId::new(account))
        .with_context(|| format!("No {} store for account {}", backend, account))?;
    prefs.save().await.context("Failed to save preferences")?;

    println!("Store removed: {} ({})", removed.display_name, removed.backend);
    Ok(())
}
