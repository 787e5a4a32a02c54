use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{Level as TraceLevel, info, warn};
use tracing_subscriber::FmtSubscriber;

use settings_vault::codec;
use settings_vault::constants;
use settings_vault::{HydrationState, SettingsStore, StoreConfig};

#[derive(Parser)]
#[command(name = "settings-vault", about = "Inspect and edit persisted settings profiles", version)]
struct Cli {
    /// Directory holding the profile files
    #[arg(long)]
    data_dir: Option<String>,
    /// Hydration timeout in milliseconds (decimal or 0x hex)
    #[arg(long)]
    timeout_ms: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the active profile's settings, or one key path
    Show { key: Option<String> },
    /// Merge a JSON value at a key path, e.g. `set embeddedLLM.port 11435`
    Set { key: String, value: String },
    /// Reset one key path, or everything, to defaults
    Reset { key: Option<String> },
    /// Clean up files left behind by an interrupted write
    Recover,
    /// Manage profiles
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    List,
    Create { name: String },
    Delete { name: String },
    Switch { name: String },
    Shortcut { name: String, keys: String },
}

fn init_logging() -> Result<()> {
    let log_level = match std::env::var(constants::env::LOG_LEVEL)
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => TraceLevel::TRACE,
        "debug" => TraceLevel::DEBUG,
        "warn" => TraceLevel::WARN,
        "error" => TraceLevel::ERROR,
        _ => TraceLevel::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

/// Nest `value` under a dotted key path
fn patch_for(key: &str, value: Value) -> Value {
    let mut patch = serde_json::Map::new();
    codec::replace_at(&mut patch, key, value);
    Value::Object(patch)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(store: Arc<SettingsStore>, command: Commands) -> Result<()> {
    match command {
        Commands::Show { key } => {
            let settings = Value::Object(store.get().to_object()?);
            match key {
                Some(key) => match codec::value_at(&settings, &key) {
                    Some(value) => print_json(value)?,
                    None => bail!("no setting at {key:?}"),
                },
                None => print_json(&settings)?,
            }
        }
        Commands::Set { key, value } => {
            let value: Value = serde_json::from_str(&value)
                .or_else(|_| serde_json::to_value(&value))
                .context("failed to read value")?;
            store
                .update(patch_for(&key, value))
                .await
                .with_context(|| format!("failed to set {key}"))?;
            info!(key = %key, "Setting saved");
        }
        Commands::Reset { key: Some(key) } => {
            store
                .reset_field(key.as_str())
                .await
                .with_context(|| format!("failed to reset {key}"))?;
        }
        Commands::Reset { key: None } => {
            store.reset_all().await.context("failed to reset settings")?;
        }
        Commands::Recover => {
            let report = store.recover().await.context("recovery failed")?;
            if report.is_clean() {
                println!("nothing to recover");
            } else {
                println!("{report:?}");
            }
        }
        Commands::Profile { action } => match action {
            ProfileAction::List => {
                let registry = store.registry().await;
                for name in &registry.profiles {
                    let marker = if *name == registry.active_profile { "*" } else { " " };
                    match registry.shortcuts.get(name) {
                        Some(shortcut) => println!("{marker} {name} ({shortcut})"),
                        None => println!("{marker} {name}"),
                    }
                }
            }
            ProfileAction::Create { name } => store
                .create_profile(name.as_str())
                .await
                .with_context(|| format!("failed to create profile {name}"))?,
            ProfileAction::Delete { name } => store
                .delete_profile(name.as_str())
                .await
                .with_context(|| format!("failed to delete profile {name}"))?,
            ProfileAction::Switch { name } => store
                .switch_profile(name.as_str())
                .await
                .with_context(|| format!("failed to switch to profile {name}"))?,
            ProfileAction::Shortcut { name, keys } => store
                .update_shortcut(name.as_str(), keys.as_str())
                .await
                .with_context(|| format!("failed to set shortcut for {name}"))?,
        },
    }
    Ok(())
}

fn main() -> Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    let mut config = StoreConfig::from_env();
    config.apply_overrides(cli.data_dir.as_deref(), cli.timeout_ms.as_deref());
    info!(data_dir = %config.data_dir.display(), timeout_ms = config.hydration_timeout.as_millis() as u64, "Opening settings store");

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    runtime.block_on(async move {
        let store = SettingsStore::open(config).context("failed to open settings store")?;
        let hydration = store.spawn_hydration();
        if store.await_hydration().await == HydrationState::TimedOut {
            warn!("Settings did not load in time, showing defaults");
        }
        run(store, cli.command).await?;
        if !hydration.is_finished() {
            hydration.abort();
        }
        Ok::<(), anyhow::Error>(())
    })
}
