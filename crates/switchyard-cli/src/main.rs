use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use switchyard_config::{
    ConfigWatcher, FileConfigWatcher, ProviderType, default_config, load_config_file,
    write_config_file,
};
use switchyard_core::secrets::{EnvSecretStore, FileSecretStore, SecretsResolver};
use switchyard_core::{AdapterDeps, BatchingSink, CallContext, ProviderRegistry, RegistryEvent};
use switchyard_telemetry::{MetricsStore, SqliteMetricsStore};
use tokio::signal;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;

use config::SwitchyardConfig;

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(version)]
#[command(about = "Switchyard: runtime provider selection, secrets and call telemetry")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config directory, app config and provider document
    Init,

    /// Validate a provider document
    Validate {
        /// Document to check (defaults to the configured providers file)
        file: Option<PathBuf>,
    },

    /// Show which provider serves a context
    Resolve {
        /// Adapter type (llm, stt, tts, image, embeddings); all types when omitted
        #[arg(short = 't', long = "type")]
        provider_type: Option<String>,

        #[arg(long)]
        session: Option<String>,

        #[arg(long)]
        campaign: Option<String>,
    },

    /// Follow the provider document and print registry events until Ctrl-C
    Watch,

    /// Summarize recorded provider calls
    Usage {
        /// Restrict token and latency totals to one provider
        #[arg(short, long)]
        provider: Option<String>,
    },

    /// Delete call records older than the given age
    Prune {
        #[arg(long, default_value_t = 30)]
        days: i64,
    },

    /// Manage stored secrets
    Secret {
        #[command(subcommand)]
        action: SecretAction,
    },
}

#[derive(Subcommand)]
enum SecretAction {
    /// Look up a secret through every configured store
    Get {
        name: String,
        /// Print the value instead of a masked form
        #[arg(long)]
        reveal: bool,
    },
    /// Store a secret in the secrets file
    Set { name: String, value: String },
    /// Remove a secret from the secrets file
    Delete { name: String },
    /// List known secret names
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging
    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Validate { file } => cmd_validate(&cli.config, file).await,
        Commands::Resolve {
            provider_type,
            session,
            campaign,
        } => cmd_resolve(&cli.config, provider_type, session, campaign).await,
        Commands::Watch => cmd_watch(&cli.config).await,
        Commands::Usage { provider } => cmd_usage(&cli.config, provider).await,
        Commands::Prune { days } => cmd_prune(&cli.config, days).await,
        Commands::Secret { action } => cmd_secret(&cli.config, action).await,
    }
}

async fn cmd_init() -> Result<()> {
    let config_dir = config::config_dir();
    tokio::fs::create_dir_all(&config_dir)
        .await
        .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

    let config_path = config_dir.join("config.toml");
    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        let default_config = include_str!("../../../config/default.toml");
        tokio::fs::write(&config_path, default_config).await?;
        info!("Created default config at {}", config_path.display());
    }

    let cfg = SwitchyardConfig::load_from(&config_path)?;
    let providers_path = cfg.providers_path();
    if providers_path.exists() {
        warn!("Provider document already exists at {}", providers_path.display());
    } else {
        write_config_file(&providers_path, &default_config()).await?;
        info!("Created provider document at {}", providers_path.display());
    }

    println!("Switchyard initialized at {}", config_dir.display());
    println!("Edit {} to choose providers.", providers_path.display());
    Ok(())
}

async fn cmd_validate(config_path: &Option<PathBuf>, file: Option<PathBuf>) -> Result<()> {
    let path = match file {
        Some(path) => path,
        None => SwitchyardConfig::load(config_path)?.providers_path(),
    };
    let document = load_config_file(&path)
        .await
        .with_context(|| format!("Invalid provider document {}", path.display()))?;

    for (provider_type, provider_id) in document.dangling_references() {
        warn!(
            "{} mapping references '{}', which has no connection settings",
            provider_type, provider_id
        );
    }
    println!(
        "{} is valid ({} adapter types, {} providers)",
        path.display(),
        document.providers.len(),
        document.provider_configs.len()
    );
    Ok(())
}

async fn cmd_resolve(
    config_path: &Option<PathBuf>,
    provider_type: Option<String>,
    session: Option<String>,
    campaign: Option<String>,
) -> Result<()> {
    let cfg = SwitchyardConfig::load(config_path)?;
    let path = cfg.providers_path();
    let document = load_config_file(&path)
        .await
        .with_context(|| format!("Failed to load provider document {}", path.display()))?;
    let registry = ProviderRegistry::new(document);

    let mut context = CallContext::new();
    if let Some(session) = session {
        context = context.with_session(session);
    }
    if let Some(campaign) = campaign {
        context = context.with_campaign(campaign);
    }

    let types = match provider_type {
        Some(name) => vec![name.parse::<ProviderType>()?],
        None => ProviderType::ALL.to_vec(),
    };
    for provider_type in types {
        match registry.resolve(provider_type, &context) {
            Ok(id) => println!("{:<12} {}", provider_type, id),
            Err(e) => println!("{:<12} - ({})", provider_type, e),
        }
    }
    Ok(())
}

async fn cmd_watch(config_path: &Option<PathBuf>) -> Result<()> {
    let cfg = SwitchyardConfig::load(config_path)?;
    let watcher = Arc::new(FileConfigWatcher::with_options(
        cfg.providers_path(),
        cfg.watcher.options(),
    ));
    watcher.start().await?;

    let sink = open_metrics_sink(&cfg).await?;
    let registry = ProviderRegistry::builder()
        .secrets(build_resolver(&cfg))
        .deps(AdapterDeps::default().with_metrics(sink.clone()))
        .build();
    let mut events = registry.subscribe();

    let cancel = CancellationToken::new();
    let follower = registry.follow(watcher.clone(), cancel.clone());
    info!("Following {} (Ctrl-C to stop)", cfg.providers_path().display());

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Dropped {} registry events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }

    cancel.cancel();
    if let Err(e) = follower.await {
        warn!("Config follower ended abnormally: {}", e);
    }
    watcher.stop().await;
    sink.shutdown().await;
    Ok(())
}

fn print_event(event: &RegistryEvent) {
    match serde_json::to_string(event) {
        Ok(line) => println!("{}", line),
        Err(e) => warn!("Failed to render {} event: {}", event.name(), e),
    }
}

async fn open_store(cfg: &SwitchyardConfig) -> Result<SqliteMetricsStore> {
    let db_path = cfg.metrics_db_path();
    if let Some(parent) = db_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    SqliteMetricsStore::new(&db_path)
        .with_context(|| format!("Failed to open metrics database {}", db_path.display()))
}

/// Batching sink over the metrics database, tuned by `[metrics]`
async fn open_metrics_sink(cfg: &SwitchyardConfig) -> Result<Arc<BatchingSink>> {
    let store = open_store(cfg).await?;
    Ok(Arc::new(BatchingSink::new(
        Arc::new(store),
        cfg.metrics.batch_options(),
    )))
}

async fn cmd_usage(config_path: &Option<PathBuf>, provider: Option<String>) -> Result<()> {
    let cfg = SwitchyardConfig::load(config_path)?;
    let store = open_store(&cfg).await?;

    let usage = store.usage_by_provider().await?;
    if usage.is_empty() {
        println!("No provider calls recorded.");
        return Ok(());
    }

    println!(
        "{:<20} {:>8} {:>8} {:>12} {:>12} {:>12}",
        "PROVIDER", "CALLS", "ERRORS", "AVG MS", "IN TOKENS", "OUT TOKENS"
    );
    for row in &usage {
        println!(
            "{:<20} {:>8} {:>8} {:>12.1} {:>12} {:>12}",
            row.provider_id,
            row.calls,
            row.errors,
            row.avg_latency_ms,
            row.input_tokens,
            row.output_tokens
        );
    }

    let totals = store.total_tokens(provider.as_deref()).await?;
    let latency = store.average_latency(provider.as_deref()).await?;
    let scope = provider.as_deref().unwrap_or("all providers");
    println!();
    println!(
        "{}: {} input / {} output tokens, {:.1} ms average latency",
        scope, totals.input, totals.output, latency
    );
    Ok(())
}

fn prune_age(days: i64) -> Result<chrono::Duration> {
    if days < 0 {
        bail!("--days must not be negative");
    }
    match chrono::Duration::try_days(days) {
        Some(age) => Ok(age),
        None => bail!("--days {} is out of range", days),
    }
}

async fn cmd_prune(config_path: &Option<PathBuf>, days: i64) -> Result<()> {
    let age = prune_age(days)?;
    let cfg = SwitchyardConfig::load(config_path)?;
    let store = open_store(&cfg).await?;
    let removed = store.delete_older_than(age).await?;
    println!("Removed {} call records older than {} days", removed, days);
    Ok(())
}

/// Env store first, then the secrets file
fn build_resolver(cfg: &SwitchyardConfig) -> SecretsResolver {
    let mut env = EnvSecretStore::with_prefix(cfg.secrets.env_prefix.clone());
    if let Some(fallback) = cfg.fallback_secrets_path() {
        env = env.with_fallback_file(fallback);
    }
    SecretsResolver::new()
        .with_store(Arc::new(env))
        .with_store(Arc::new(FileSecretStore::new(cfg.secrets_path())))
}

fn mask(value: &str) -> String {
    let visible: String = value.chars().take(4).collect();
    if value.chars().count() <= 8 {
        "********".to_string()
    } else {
        format!("{}********", visible)
    }
}

async fn cmd_secret(config_path: &Option<PathBuf>, action: SecretAction) -> Result<()> {
    let cfg = SwitchyardConfig::load(config_path)?;
    // Writes only ever go to the secrets file
    let file_only = SecretsResolver::new().with_store(Arc::new(FileSecretStore::new(cfg.secrets_path())));

    match action {
        SecretAction::Get { name, reveal } => {
            let value = build_resolver(&cfg).get_secret(&name).await?;
            if reveal {
                println!("{}", value);
            } else {
                println!("{} = {}", name, mask(&value));
            }
        }
        SecretAction::Set { name, value } => {
            file_only.set_secret(&name, &value).await?;
            println!("Stored secret '{}' in {}", name, cfg.secrets_path().display());
        }
        SecretAction::Delete { name } => {
            if file_only.delete_secret(&name).await? {
                println!("Deleted secret '{}'", name);
            } else {
                println!("No secret named '{}' in {}", name, cfg.secrets_path().display());
            }
        }
        SecretAction::List => {
            for name in build_resolver(&cfg).list_secrets().await? {
                println!("{}", name);
            }
        }
    }
    Ok(())
}
