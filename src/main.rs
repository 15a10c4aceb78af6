use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use repo_updater::backend::CommandBackend;
use repo_updater::config::Config;
use repo_updater::domain::{PriorityClass, RepoId};
use repo_updater::ipc::{IpcClient, IpcClientConfig, IpcServer, IpcServerConfig, ServiceRouter};
use repo_updater::scheduler::{LogSyncTracker, Scheduler};
use repo_updater::service::{RepoUpdaterService, SchedulerInfoResponse};
use repo_updater::store::{MemoryRepoStore, RepoStore, SqliteRepoStore};

mod cli;

use cli::Cli;
use cli::commands::{Commands, changeset_ids, parse_repo_ref};

fn setup_logging(level: &str) -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("repo-updater")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("repo-updater.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

async fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    match &cli.command {
        None | Some(Commands::Serve) => serve(cli, config).await,
        Some(Commands::Info { repo_id }) => handle_info_command(*repo_id, cli, config).await,
        Some(Commands::Enqueue { repo, priority }) => {
            handle_enqueue_command(repo, (*priority).into(), cli, config).await
        }
        Some(Commands::Reclone { repo_id, reason }) => {
            handle_reclone_command(*repo_id, reason.clone(), cli, config).await
        }
        Some(Commands::Sync { ids }) => handle_sync_command(ids, cli, config).await,
        Some(Commands::Ping) => handle_ping_command(cli, config).await,
        Some(Commands::Stats) => handle_stats_command(cli, config).await,
    }
}

fn socket_path(cli: &Cli, config: &Config) -> PathBuf {
    cli.socket.clone().unwrap_or_else(|| config.ipc.socket_path.clone())
}

fn open_store(config: &Config) -> Result<Arc<dyn RepoStore>> {
    match &config.store.path {
        Some(path) => {
            let store = SqliteRepoStore::open(path)
                .context(format!("Failed to open repo store at {}", path.display()))?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryRepoStore::new())),
    }
}

async fn serve(cli: &Cli, config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let scheduler = Scheduler::with_system_clock(config.scheduler_config()).context("Failed to build scheduler")?;
    let service = Arc::new(RepoUpdaterService::new(scheduler.clone(), Arc::clone(&store)));

    for record in &config.repos {
        service
            .track(record.clone())
            .context(format!("Failed to register {}", record.name))?;
    }
    let scheduled = service.schedule_known().context("Failed to schedule known repositories")?;
    info!("Scheduled {} repositories", scheduled);

    let backend = Arc::new(CommandBackend::new(config.backend_config(), store));
    let dispatcher = scheduler.start(backend, Arc::new(LogSyncTracker));

    let server = IpcServer::with_config(IpcServerConfig {
        socket_path: socket_path(cli, config),
        max_clients: config.ipc.max_clients,
    });
    println!(
        "{} {} repositories, {} workers, socket {}",
        "Serving:".green(),
        scheduled,
        dispatcher.worker_count(),
        server.socket_path().display()
    );

    let router = Arc::new(ServiceRouter::new(service));
    let result = server
        .run(router, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for ctrl-c: {}", e);
            }
        })
        .await;

    println!("{}", "Shutting down...".cyan());
    dispatcher.shutdown().await;
    result.context("IPC server failed")?;
    Ok(())
}

async fn connect(cli: &Cli, config: &Config) -> Result<IpcClient> {
    let client = IpcClient::new(IpcClientConfig {
        socket_path: socket_path(cli, config),
        ..IpcClientConfig::default()
    });
    client
        .connect()
        .await
        .context(format!("Failed to connect to daemon at {}", client.socket_path().display()))?;
    Ok(client)
}

fn print_info(info: &SchedulerInfoResponse) {
    println!("{} {}", "Repository:".green(), info.repo_id);
    if !info.in_schedule {
        println!("  {}", "not scheduled".yellow());
        return;
    }
    if let Some(priority) = info.priority_class {
        println!("  priority:     {}", priority);
    }
    if let Some(state) = info.state {
        println!("  state:        {:?}", state);
    }
    match info.seconds_until_due {
        Some(0) => println!("  due:          now"),
        Some(secs) => println!("  due:          in {}s", secs),
        None => {}
    }
    if let Some(position) = info.position {
        println!("  position:     {} of {}", position, info.total);
    }
    if info.consecutive_failures > 0 {
        println!("  failures:     {}", info.consecutive_failures.to_string().red());
    }
    if info.reclone_pending {
        println!("  {}", "reclone pending".yellow());
    }
    if let Some(secs) = info.seconds_since_last_attempt {
        println!("  last attempt: {}s ago", secs);
    }
    if let Some(err) = &info.last_error {
        println!("  last error:   {}", err.red());
    }
}

async fn handle_info_command(repo_id: u32, cli: &Cli, config: &Config) -> Result<()> {
    info!("Getting scheduler info for repo {}", repo_id);
    let client = connect(cli, config).await?;
    let info = client.scheduler_info(RepoId(repo_id)).await.context("Info request failed")?;
    print_info(&info);
    Ok(())
}

async fn handle_enqueue_command(repo: &str, priority: PriorityClass, cli: &Cli, config: &Config) -> Result<()> {
    info!("Enqueueing update for {} at {}", repo, priority);
    let client = connect(cli, config).await?;
    let response = client
        .enqueue_update(parse_repo_ref(repo), priority)
        .await
        .context("Enqueue request failed")?;
    println!("{} {} ({})", "Enqueued:".green(), response.name, response.id);
    Ok(())
}

async fn handle_reclone_command(repo_id: u32, reason: Option<String>, cli: &Cli, config: &Config) -> Result<()> {
    info!("Requesting reclone of repo {} (reason: {:?})", repo_id, reason);
    let client = connect(cli, config).await?;
    let response = client
        .reclone(RepoId(repo_id), reason)
        .await
        .context("Reclone request failed")?;
    println!(
        "{} repo {} at {}",
        "Reclone requested:".green(),
        response.repo_id,
        response.requested_at.to_rfc3339()
    );
    Ok(())
}

async fn handle_sync_command(ids: &[i64], cli: &Cli, config: &Config) -> Result<()> {
    info!("Enqueueing changeset sync for {:?}", ids);
    let client = connect(cli, config).await?;
    let response = client
        .enqueue_changeset_sync(changeset_ids(ids))
        .await
        .context("Changeset sync request failed")?;
    println!("{} {}", "Queued:".green(), response.batch_id);
    for merged in &response.merged {
        println!("  merged {}", merged);
    }
    Ok(())
}

async fn handle_ping_command(cli: &Cli, config: &Config) -> Result<()> {
    let client = connect(cli, config).await?;
    if client.ping().await.context("Ping failed")? {
        println!("{}", "pong".green());
    } else {
        println!("{}", "unexpected reply".red());
    }
    Ok(())
}

async fn handle_stats_command(cli: &Cli, config: &Config) -> Result<()> {
    let client = connect(cli, config).await?;
    let stats = client.stats().await.context("Stats request failed")?;
    println!("{}", "Scheduler:".green());
    println!("  tracked:    {}", stats.tracked);
    println!("  queued:     {}", stats.queued);
    println!("  in flight:  {}", stats.in_flight);
    println!("  dispatched: {}", stats.dispatched);
    println!("  succeeded:  {}", stats.succeeded);
    println!("  failed:     {}", stats.failed);
    println!("  reclones:   {}", stats.reclones);
    println!("  evicted:    {}", stats.evicted);
    println!("{}", "Changeset syncs:".green());
    println!("  queued:     {}", stats.syncs_queued);
    println!("  in flight:  {}", stats.syncs_in_flight);
    println!("  succeeded:  {}", stats.syncs_succeeded);
    println!("  failed:     {}", stats.syncs_failed);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    let level = if cli.is_verbose() {
        "debug".to_string()
    } else {
        config.log_level.clone().unwrap_or_else(|| "info".to_string())
    };
    setup_logging(&level).context("Failed to setup logging")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).await.context("Application failed")?;

    Ok(())
}
