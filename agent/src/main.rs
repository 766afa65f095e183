use agent::collectors::{self, Collector};
use agent::config;
use agent::daemon;
use agent::logging::init_tracing;
use agent::protocol::Session;
use agent::service;
use agent::supervisor::{Schedule, Supervisor};
use agent::transport::WsClient;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "agent", version, about = "Host telemetry agent")]
struct Cli {
    /// Config file path (defaults to agent.lock.json beside the executable)
    #[arg(short, long, env = "AGENT_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent in the foreground (what the service unit invokes)
    Run,
    /// Restart the managed service
    Restart,
    /// Service management
    Service {
        #[command(subcommand)]
        cmd: ServiceCmd,
    },
    /// Read or change configuration values
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
    /// Validate the config file and probe outbound connectivity
    Check,
}

#[derive(Subcommand, Debug)]
enum ServiceCmd {
    /// Install the systemd unit and enable it
    Install,
    /// Stop, disable, and remove the systemd unit
    Uninstall,
    /// Print the service state
    Status,
}

#[derive(Subcommand, Debug)]
enum ConfigCmd {
    Get { key: String },
    Set { key: String, value: String },
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(config::config_path);

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_agent(config_path).await,
        Commands::Restart => {
            service::restart()?;
            println!("service restart requested");
            Ok(())
        }
        Commands::Service { cmd } => match cmd {
            ServiceCmd::Install => {
                service::install::install_service()?;
                println!("service installed and enabled");
                Ok(())
            }
            ServiceCmd::Uninstall => {
                service::uninstall::uninstall_service()?;
                println!("service uninstalled");
                Ok(())
            }
            ServiceCmd::Status => {
                println!("{}", service::status());
                Ok(())
            }
        },
        Commands::Config { cmd } => {
            let mut cfg = config::load_config(&config_path)?;
            match cmd {
                ConfigCmd::Get { key } => {
                    println!("{}", cfg.get_value(&key)?);
                }
                ConfigCmd::Set { key, value } => {
                    cfg.set_value(&key, &value)?;
                    config::save_config(&cfg, &config_path)?;
                    println!("{key} updated");
                }
            }
            Ok(())
        }
        Commands::Check => {
            println!("checking config file: {}", config_path.display());
            let cfg = config::load_config(&config_path)?;
            cfg.validate()?;
            println!("config ok");
            println!("  server:   {}", cfg.server);
            println!("  log_path: {}", cfg.log_path);
            let ip = agent::collectors::probe::public_ipv4().await;
            if ip.is_empty() {
                println!("  public ipv4: unavailable");
            } else {
                println!("  public ipv4: {ip}");
            }
            Ok(())
        }
    }
}

async fn run_agent(config_path: PathBuf) -> Result<()> {
    let cfg = config::load_config(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    cfg.validate()?;

    // The configured zone governs all local timestamps, like the panel
    // expects.
    #[cfg(unix)]
    std::env::set_var("TZ", &cfg.timezone);

    init_tracing(&cfg)?;
    info!(
        version = collectors::AGENT_VERSION,
        server = %cfg.server,
        "agent starting"
    );
    if let Err(e) = daemon::write_pid() {
        warn!(error = ?e, "writing pid file failed");
    }

    let schedule = Schedule::from_config(&cfg);
    let (log_shipper, log_rx) = collectors::log_channel(&cfg.timezone);
    let cfg = Arc::new(RwLock::new(cfg));
    let server_url = { cfg.read().await.server.clone() };
    let client = Arc::new(WsClient::new(server_url));
    let collector = Arc::new(Collector::new(cfg.clone(), client.clone()));
    let (events_tx, events_rx) = mpsc::channel(16);
    let session = Session::new(
        client.clone(),
        cfg.clone(),
        config_path.clone(),
        events_tx,
        log_shipper,
    );
    let supervisor = Supervisor::new(cfg.clone(), client, collector, schedule);

    let mut run = tokio::spawn(supervisor.clone().run(session, events_rx, log_rx));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("installing SIGTERM handler")?;
    #[cfg(unix)]
    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        .context("installing SIGHUP handler")?;

    loop {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("SIGTERM received");
                    break;
                }
                _ = sighup.recv() => {
                    reload_config(&config_path, &cfg, &supervisor).await;
                }
                result = &mut run => {
                    daemon::remove_pid();
                    return result.context("supervisor task panicked")?;
                }
            }
        }
        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                    break;
                }
                result = &mut run => {
                    daemon::remove_pid();
                    return result.context("supervisor task panicked")?;
                }
            }
        }
    }

    supervisor.shutdown().await;
    daemon::remove_pid();
    info!("agent exited");
    Ok(())
}

/// SIGHUP re-reads the lock file and re-seeds worker cadences in place.
async fn reload_config(
    config_path: &PathBuf,
    cfg: &Arc<RwLock<config::Config>>,
    supervisor: &Arc<Supervisor>,
) {
    match config::load_config(config_path) {
        Ok(fresh) => {
            *cfg.write().await = fresh;
            supervisor.reload_schedule().await;
            info!("config reloaded");
        }
        Err(e) => warn!(error = ?e, "config reload failed"),
    }
}
