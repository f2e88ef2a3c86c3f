use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use fleetdeck_api::{
    CredentialStore, EnvCredentialStore, HttpTransport, RunnerTransport, Session, SessionConfig,
    DEFAULT_BASE_URL, DEFAULT_REQUEST_TIMEOUT,
};
use fleetdeck_core::log_wire::LogEvent;
use fleetdeck_core::{parse_credential, parse_labels, FleetSnapshot, RunnerSpec, WriteCredential};
use fleetdeck_sync::dispatch::CommandDispatcher;
use fleetdeck_sync::log_reader::LogStreamReader;
use fleetdeck_sync::scheduler::{ActivityPulse, Scheduler, SchedulerConfig};
use fleetdeck_sync::{FleetEvent, FleetStore, SharedFleetStore};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const API_URL_ENV: &str = "FLEETDECK_API_URL";
const API_TOKEN_ENV: &str = "FLEETDECK_API_TOKEN";
const HTTP_TIMEOUT_ENV: &str = "FLEETDECK_HTTP_TIMEOUT_SECS";
const RUNNER_TOKEN_ENV: &str = "FLEETDECK_RUNNER_TOKEN";

#[derive(Parser)]
#[command(name = "fleetdeck")]
#[command(about = "Fleet control for remote runner agents", long_about = None)]
struct Cli {
    /// Backend base URL; overrides FLEETDECK_API_URL
    #[arg(long, default_value = "")]
    api_url: String,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the fleet
    List,
    /// Register a new runner
    Create {
        /// Source repository URL the runner attaches to
        #[arg(long)]
        repo: String,
        /// Runner name; the backend generates one when omitted
        #[arg(long)]
        name: Option<String>,
        /// Comma-separated labels
        #[arg(long)]
        labels: Option<String>,
        /// Environment variable holding the registration credential
        #[arg(long, default_value = RUNNER_TOKEN_ENV)]
        token_env: String,
    },
    /// Start a runner
    Start { id: u64 },
    /// Stop a runner
    Stop { id: u64 },
    /// Restart a runner
    Restart { id: u64 },
    /// Remove a runner from the fleet
    Delete { id: u64 },
    /// Rotate a runner's registration credential
    UpdateToken {
        id: u64,
        /// Environment variable holding the new credential
        #[arg(long, default_value = RUNNER_TOKEN_ENV)]
        token_env: String,
    },
    /// Clone a runner into additional instances
    Clone {
        id: u64,
        /// How many copies to create
        #[arg(long, default_value_t = 1)]
        count: u32,
        /// Environment variable holding an optional replacement credential
        #[arg(long, default_value = RUNNER_TOKEN_ENV)]
        token_env: String,
    },
    /// Follow a runner's log stream until it ends
    Logs { id: u64 },
    /// Delete a runner's stored logs
    ClearLogs { id: u64 },
    /// Mirror the fleet until interrupted
    Watch,
}

#[derive(Clone, Debug)]
struct Config {
    base_url: String,
    request_timeout: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = load_config(&cli.api_url);
    let transport = build_transport(&config)?;
    let store = FleetStore::shared();
    let pulse = ActivityPulse::new();
    let dispatcher = CommandDispatcher::new(transport.clone(), Arc::clone(&store), pulse.clone());

    match cli.command {
        Commands::List => {
            sync_fleet(&transport, &store).await?;
            print_fleet(&store.lock().await.snapshot());
        }
        Commands::Create {
            repo,
            name,
            labels,
            token_env,
        } => {
            let credential = credential_from_env(&token_env)?;
            let mut spec = RunnerSpec::new(repo);
            spec.name = name;
            spec.labels = labels.as_deref().and_then(parse_labels);
            let created = dispatcher.create(&spec, &credential).await?;
            println!("created runner {} ({})", created.id, created.name);
        }
        Commands::Start { id } => {
            sync_fleet(&transport, &store).await?;
            let updated = dispatcher.start(id).await?;
            println!("runner {} -> {}", updated.id, updated.status);
        }
        Commands::Stop { id } => {
            sync_fleet(&transport, &store).await?;
            let updated = dispatcher.stop(id).await?;
            println!("runner {} -> {}", updated.id, updated.status);
        }
        Commands::Restart { id } => {
            sync_fleet(&transport, &store).await?;
            let updated = dispatcher.restart(id).await?;
            println!("runner {} -> {}", updated.id, updated.status);
        }
        Commands::Delete { id } => {
            sync_fleet(&transport, &store).await?;
            dispatcher.delete(id).await?;
            println!("runner {id} deleted");
        }
        Commands::UpdateToken { id, token_env } => {
            let credential = credential_from_env(&token_env)?;
            sync_fleet(&transport, &store).await?;
            let updated = dispatcher.update_credential(id, &credential).await?;
            println!(
                "runner {} credential rotated ({})",
                updated.id,
                updated.credential_masked.as_deref().unwrap_or("****")
            );
        }
        Commands::Clone {
            id,
            count,
            token_env,
        } => {
            let credential = optional_credential_from_env(&token_env)?;
            sync_fleet(&transport, &store).await?;
            let created = dispatcher.clone_runners(id, count, credential.as_ref()).await?;
            println!("created {} runner(s):", created.len());
            for instance in &created {
                println!("  {} ({})", instance.id, instance.name);
            }
        }
        Commands::Logs { id } => {
            stream_logs(&transport, id).await?;
        }
        Commands::ClearLogs { id } => {
            transport
                .clear_logs(id)
                .await
                .context("failed to clear logs")?;
            println!("cleared logs for runner {id}");
        }
        Commands::Watch => {
            watch_fleet(transport, store, pulse).await?;
        }
    }
    Ok(())
}

async fn sync_fleet(transport: &HttpTransport, store: &SharedFleetStore) -> Result<()> {
    let instances = transport.list().await.context("failed to fetch the fleet")?;
    store.lock().await.replace(instances);
    Ok(())
}

async fn stream_logs(transport: &HttpTransport, id: u64) -> Result<()> {
    let mut reader = LogStreamReader::new();
    reader.open(transport, id).await;

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            event = reader.next_event() => match event {
                Some(LogEvent::Line(line)) => println!("{line}"),
                Some(LogEvent::Error { message }) => bail!("log stream error: {message}"),
                Some(LogEvent::End) | None => break,
            },
            _ = &mut interrupt => {
                reader.close();
                break;
            }
        }
    }
    Ok(())
}

async fn watch_fleet(
    transport: HttpTransport,
    store: SharedFleetStore,
    pulse: ActivityPulse,
) -> Result<()> {
    sync_fleet(&transport, &store).await?;
    {
        let mut store = store.lock().await;
        println!("watching {} runner(s); Ctrl-C to stop", store.len());
        store.subscribe(|event| match event {
            FleetEvent::Replaced => println!("fleet synchronized"),
            FleetEvent::Upserted { id } => println!("runner {id} updated"),
            FleetEvent::Removed { id } => println!("runner {id} removed"),
        });
    }

    let (scheduler, handle) = Scheduler::new(
        transport,
        Arc::clone(&store),
        pulse,
        SchedulerConfig::default(),
    );
    let task = scheduler.spawn();
    let _ = tokio::signal::ctrl_c().await;
    handle.shutdown();
    let _ = task.await;
    println!("stopped");
    Ok(())
}

fn print_fleet(snapshot: &FleetSnapshot) {
    if snapshot.instances.is_empty() {
        println!("no runners registered");
        return;
    }
    println!(
        "{:<8} {:<24} {:<10} {:<24} {}",
        "ID", "NAME", "STATUS", "LABELS", "HOST"
    );
    for instance in &snapshot.instances {
        println!(
            "{:<8} {:<24} {:<10} {:<24} {}",
            instance.id,
            instance.name,
            instance.status,
            instance.labels.as_deref().unwrap_or("-"),
            instance.hostname.as_deref().unwrap_or("-"),
        );
    }
    if let Some(synced) = snapshot.last_synced {
        println!("\nlast synchronized {}", synced.format("%Y-%m-%d %H:%M:%S UTC"));
    }
}

fn build_transport(config: &Config) -> Result<HttpTransport> {
    let session_config = SessionConfig {
        base_url: config.base_url.clone(),
        request_timeout: config.request_timeout,
    };
    let store = EnvCredentialStore::new(API_TOKEN_ENV);
    let session = Session::from_store(session_config, &store)
        .with_context(|| format!("no API credential; set {API_TOKEN_ENV}"))?;
    Ok(HttpTransport::new(session)?)
}

fn credential_from_env(var: &str) -> Result<WriteCredential> {
    let store = EnvCredentialStore::new(var);
    let Some(raw) = store.load() else {
        bail!("no runner credential; set {var}");
    };
    match parse_credential(&raw) {
        Ok(credential) => Ok(credential),
        Err(err) => bail!("{var}: {err}"),
    }
}

fn optional_credential_from_env(var: &str) -> Result<Option<WriteCredential>> {
    let store = EnvCredentialStore::new(var);
    match store.load() {
        Some(raw) => match parse_credential(&raw) {
            Ok(credential) => Ok(Some(credential)),
            Err(err) => bail!("{var}: {err}"),
        },
        None => Ok(None),
    }
}

fn load_config(api_url_flag: &str) -> Config {
    let config = Config {
        base_url: resolve_base_url(api_url_flag),
        request_timeout: resolve_request_timeout(),
    };
    debug!(
        event = "config_resolved",
        base_url = %config.base_url,
        timeout_secs = config.request_timeout.as_secs()
    );
    config
}

fn resolve_base_url(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.to_string();
    }
    if let Ok(value) = std::env::var(API_URL_ENV) {
        if !value.trim().is_empty() {
            return value;
        }
    }
    DEFAULT_BASE_URL.to_string()
}

fn resolve_request_timeout() -> Duration {
    if let Ok(value) = std::env::var(HTTP_TIMEOUT_ENV) {
        if let Ok(secs) = value.trim().parse::<u64>() {
            if secs > 0 {
                return Duration::from_secs(secs);
            }
        }
    }
    DEFAULT_REQUEST_TIMEOUT
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
