use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use anchorage::agent::{AgentClient, AgentUrl, LoggingRunner};
use anchorage::api::RegisterAgentRequest;
use anchorage::backend::{Backend, Db};
use anchorage::config::{Config, InstallMode};
use anchorage::election::InstallGroups;
use anchorage::fsm::FsmResult;
use anchorage::hub::updates::{LoggingSync, NoRemote};
use anchorage::hub::{HubClient, LoggingTunnel, PortalHandshake, TrustManager, UpdateLoop};
use anchorage::install::join::{
    register_once, supervise_registration, JoinOutcome, REGISTRATION_INTERVAL,
};
use anchorage::install::Installer;
use anchorage::model::{Server, ServerRole};
use anchorage::ops::{LocalOperator, Operator};
use anchorage::pack::{Locator, PackageService};
use anchorage::server::{portal_router, PortalState};
use anchorage::ui;

/// Exit code a joining agent returns when the installer it joined exits.
const EXIT_INSTALLER_GONE: u8 = 255;

#[derive(Parser)]
#[command(name = "anchorage")]
#[command(version, about = "Deterministic Kubernetes cluster-image installer")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory for the installer database and logs.
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an install operation on this cluster
    Install {
        #[arg(long)]
        cluster_name: String,
        /// Application package, repository/name:version
        #[arg(long)]
        app: String,
        #[arg(long, default_value = "127.0.0.1")]
        advertise_addr: String,
        #[arg(long, default_value = "master")]
        role: ServerRoleArg,
        #[arg(long)]
        hostname: Option<String>,
        #[arg(long)]
        license_file: Option<PathBuf>,
        /// Hub address for a federated install
        #[arg(long)]
        remote_ops_url: Option<String>,
        #[arg(long)]
        ops_tunnel_token: Option<String>,
        /// Replicate cluster state from the Hub instead of creating it
        #[arg(long)]
        ops_center_install: bool,
        #[arg(long)]
        no_checks: bool,
        #[arg(long, default_value = "61009")]
        agent_port: u16,
    },
    /// Join a Hub-initiated operation as an agent
    Join {
        #[arg(long)]
        ops_url: String,
        #[arg(long)]
        ops_token: String,
        #[arg(long)]
        cluster_name: String,
        #[arg(long)]
        operation_id: String,
        #[arg(long, default_value = "system")]
        account_id: String,
        #[arg(long)]
        advertise_ip: String,
        #[arg(long)]
        agent_id: Option<String>,
    },
    /// Run an agent against a running installer
    Agent {
        /// agent://host:port/role?access_token=...
        url: String,
        #[arg(long)]
        advertise_ip: String,
        #[arg(long)]
        agent_id: Option<String>,
    },
    /// Show the current operation plan
    Plan {
        #[arg(long)]
        cluster_name: String,
    },
    /// Resume an interrupted operation
    Resume {
        #[arg(long)]
        cluster_name: String,
        #[arg(long)]
        app: String,
    },
    /// Roll back a completed phase
    Rollback {
        #[arg(long)]
        cluster_name: String,
        #[arg(long)]
        app: String,
        #[arg(long)]
        phase: String,
    },
    /// Show the state of the latest operation
    Status {
        #[arg(long)]
        cluster_name: String,
        /// Keep polling until the operation finishes
        #[arg(long)]
        follow: bool,
    },
    /// Serve the portal API (Hub or cluster service)
    Serve {
        #[arg(long, default_value = "3009")]
        port: u16,
        #[arg(long)]
        cluster_name: String,
        /// Static bearer token required on every request
        #[arg(long)]
        auth_token: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum ServerRoleArg {
    Master,
    Node,
    Knode,
}

impl From<ServerRoleArg> for ServerRole {
    fn from(role: ServerRoleArg) -> Self {
        match role {
            ServerRoleArg::Master => ServerRole::Master,
            ServerRoleArg::Node => ServerRole::Node,
            ServerRoleArg::Knode => ServerRole::Knode,
        }
    }
}

fn init_tracing(verbose: bool, state_dir: Option<&std::path::Path>) {
    let default = if verbose { "anchorage=debug,info" } else { "anchorage=info,warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));

    // tee the operation log into the state directory when it is writable
    let log_dir = state_dir
        .map(|dir| dir.join("logs"))
        .or_else(|| dirs::home_dir().map(|home| home.join(".anchorage/logs")));
    match log_dir.filter(|dir| std::fs::create_dir_all(dir).is_ok()) {
        Some(dir) => {
            let file = tracing_appender::rolling::daily(dir, "anchorage.log");
            registry
                .with(tracing_subscriber::fmt::layer().with_ansi(false).with_writer(file))
                .init();
        }
        None => registry.init(),
    }
}

fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = tx.send(true);
        }
    });
    rx
}

fn base_config(cli_state_dir: Option<PathBuf>, verbose: bool, cluster_name: &str) -> Config {
    Config {
        state_dir: cli_state_dir.unwrap_or_default(),
        cluster_name: cluster_name.to_string(),
        verbose,
        ..Default::default()
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.state_dir.as_deref());
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", console::style("error:").red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match cli.command {
        Commands::Install {
            cluster_name,
            app,
            advertise_addr,
            role,
            hostname,
            license_file,
            remote_ops_url,
            ops_tunnel_token,
            ops_center_install,
            no_checks,
            agent_port,
        } => {
            let mut config = base_config(cli.state_dir, cli.verbose, &cluster_name);
            config.app_package = Some(Locator::parse(&app)?);
            config.advertise_addr = advertise_addr.clone();
            config.agent_port = agent_port;
            config.preflight_checks = !no_checks;
            config.remote_ops_url = remote_ops_url;
            config.ops_tunnel_token = ops_tunnel_token;
            config.mode = if ops_center_install {
                InstallMode::OpsCenter
            } else {
                InstallMode::Local
            };
            if let Some(path) = license_file {
                config.license =
                    Some(std::fs::read_to_string(&path).context("reading license file")?);
            }

            let hostname = hostname.unwrap_or_else(|| advertise_addr.clone());
            let servers = vec![Server::new(&hostname, &advertise_addr, role.into())];
            let installer = Installer::new(config)?;
            match installer.install(servers, shutdown_signal()).await? {
                FsmResult::Completed => {
                    println!("Operation has completed");
                    Ok(ExitCode::SUCCESS)
                }
                FsmResult::Failed { phase, error } => {
                    eprintln!("Operation failed at phase {phase}: {error}");
                    Ok(ExitCode::FAILURE)
                }
                FsmResult::Cancelled => {
                    println!("Operation cancelled; run `anchorage resume` to continue");
                    Ok(ExitCode::SUCCESS)
                }
            }
        }

        Commands::Join {
            ops_url,
            ops_token,
            cluster_name,
            operation_id,
            account_id,
            advertise_ip,
            agent_id,
        } => {
            let hub = HubClient::new(&ops_url, &ops_token)?;
            let request = RegisterAgentRequest {
                account_id,
                cluster_name,
                operation_id,
                agent_id: agent_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                advertise_ip: advertise_ip.clone(),
            };

            let elected = register_once(&hub, &request).await?;
            if elected.installer_id == request.agent_id {
                // this agent won the election and must run the installer;
                // the Hub drives it through the portal API from here
                println!("Elected installer for operation {}", request.operation_id);
                return Ok(ExitCode::SUCCESS);
            }

            // joiner: serve phases for the installer while watching the
            // registration for installer changes
            let agent_url = AgentUrl::new(&elected.installer_ip, 61009, "node", &ops_token);
            let client = AgentClient::new(
                agent_url,
                &request.agent_id,
                &advertise_ip,
                Arc::new(LoggingRunner),
            )?;
            let (agent_shutdown_tx, agent_shutdown_rx) = watch::channel(false);
            let agent_task = tokio::spawn(async move { client.run(agent_shutdown_rx).await });

            let outcome = supervise_registration(
                &hub,
                &request,
                elected,
                REGISTRATION_INTERVAL,
                shutdown_signal(),
            )
            .await?;
            let _ = agent_shutdown_tx.send(true);
            agent_task.await.context("agent loop panicked")??;

            match outcome {
                JoinOutcome::InstallerChanged { installer_ip } => {
                    ui::print_installer_exited(&installer_ip);
                    Ok(ExitCode::from(EXIT_INSTALLER_GONE))
                }
                _ => Ok(ExitCode::SUCCESS),
            }
        }

        Commands::Agent {
            url,
            advertise_ip,
            agent_id,
        } => {
            let url = AgentUrl::parse(&url)?;
            let client = AgentClient::new(
                url,
                &agent_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                &advertise_ip,
                Arc::new(LoggingRunner),
            )?;
            client.run(shutdown_signal()).await?;
            Ok(ExitCode::SUCCESS)
        }

        Commands::Plan { cluster_name } => {
            let mut config = base_config(cli.state_dir, cli.verbose, &cluster_name);
            config.check_and_set_defaults()?;
            let backend = Backend::new(Db::open(&config.db_path())?);
            let operations = backend.list_operations(&cluster_name)?;
            let operation = operations
                .last()
                .context("no operations found; run `anchorage install` first")?;
            let mut plan = backend.get_plan(&operation.key())?;
            for record in backend.list_phase_states(&operation.key())? {
                plan.set_phase_state(&record.phase_id, record.state, record.error.clone())
                    .ok();
            }
            ui::print_plan(&plan);
            Ok(ExitCode::SUCCESS)
        }

        Commands::Resume { cluster_name, app } => {
            let mut config = base_config(cli.state_dir, cli.verbose, &cluster_name);
            config.app_package = Some(Locator::parse(&app)?);
            config.agent_port = 0;
            let installer = Installer::new(config)?;
            match installer.resume(shutdown_signal()).await? {
                FsmResult::Completed => {
                    println!("Operation has completed");
                    Ok(ExitCode::SUCCESS)
                }
                FsmResult::Failed { phase, error } => {
                    eprintln!("Operation failed at phase {phase}: {error}");
                    Ok(ExitCode::FAILURE)
                }
                FsmResult::Cancelled => Ok(ExitCode::SUCCESS),
            }
        }

        Commands::Rollback {
            cluster_name,
            app,
            phase,
        } => {
            let mut config = base_config(cli.state_dir, cli.verbose, &cluster_name);
            config.app_package = Some(Locator::parse(&app)?);
            config.agent_port = 0;
            let installer = Installer::new(config)?;
            installer.rollback_phase(&phase).await?;
            println!("Phase {phase} rolled back");
            Ok(ExitCode::SUCCESS)
        }

        Commands::Status {
            cluster_name,
            follow,
        } => {
            let mut config = base_config(cli.state_dir, cli.verbose, &cluster_name);
            config.check_and_set_defaults()?;
            if !config.db_path().exists() {
                println!("Not initialized: no state at {}", config.state_dir.display());
                return Ok(ExitCode::SUCCESS);
            }
            let db = Db::open(&config.db_path())?;
            let backend = Backend::new(db.clone());
            let operations = backend.list_operations(&cluster_name)?;
            let Some(operation) = operations.last() else {
                println!("No operations on {cluster_name}");
                return Ok(ExitCode::SUCCESS);
            };
            println!("Operation {} ({}): {}", operation.id, operation.op_type, operation.state);
            if follow {
                let operator = Operator::Local(LocalOperator::new(
                    backend.clone(),
                    PackageService::new(db),
                    Arc::new(InstallGroups::new(config.install_group_ttl)),
                ));
                ui::poll_progress(&operator, &operation.key(), shutdown_signal()).await?;
            } else if let Some(entry) = backend.last_progress_entry(&operation.key())? {
                println!("  {}% {}", entry.completion, entry.message);
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Serve {
            port,
            cluster_name,
            auth_token,
        } => {
            let mut config = base_config(cli.state_dir, cli.verbose, &cluster_name);
            config.check_and_set_defaults()?;
            let db = Db::open(&config.db_path())?;
            let backend = Backend::new(db.clone());
            let packages = PackageService::new(db);
            let local = LocalOperator::new(
                backend.clone(),
                packages.clone(),
                Arc::new(InstallGroups::new(config.install_group_ttl)),
            );
            let updates = UpdateLoop::with_tick_interval(
                backend.clone(),
                packages.clone(),
                Arc::new(NoRemote),
                Arc::new(LoggingSync),
                config.updates_tick,
            );
            let handshake = Arc::new(PortalHandshake::new(
                backend.clone(),
                packages.clone(),
                &config.account_id,
                &cluster_name,
            ));
            let trust = Arc::new(TrustManager::new(
                backend.clone(),
                Arc::new(LoggingTunnel),
                updates.clone(),
                handshake,
                &cluster_name,
            ));
            let state = Arc::new(PortalState {
                backend,
                packages,
                operator: Arc::new(Operator::Local(local)),
                trust,
                updates,
                ca_secret: uuid::Uuid::new_v4().as_bytes().to_vec(),
                auth_token,
            });

            let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
                .await
                .context("binding portal listener")?;
            println!("Portal API listening on 0.0.0.0:{port}");
            axum::serve(listener, portal_router(state))
                .await
                .context("portal server failed")?;
            Ok(ExitCode::SUCCESS)
        }
    }
}
