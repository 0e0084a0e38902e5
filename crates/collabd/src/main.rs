//! collabd CLI entry point.
//!
//! Runs the collaboration daemon as a standalone process, or acts as a
//! small client against a running one.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use collabd::client::CollabClient;
use collabd::config::CollabConfig;
use collabd::jupyter::JupyterLauncher;
use collabd::kernel::KernelLauncher;
use collabd::server::{Collaborators, Server};
use collabd::ResourceKind;
use log::info;

#[derive(Parser, Debug)]
#[command(name = "collabd")]
#[command(about = "Real-time collaboration daemon for workspaces and notebooks")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// JSON config file (default: ~/.cache/collabd/config.json if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the daemon (default if no command specified)
    Run {
        /// Address to listen on
        #[arg(long)]
        listen: Option<String>,

        /// Instance id used on the pub/sub bus
        #[arg(long)]
        instance_id: Option<String>,

        /// Messages kept per resource for late joiners
        #[arg(long)]
        history_limit: Option<usize>,

        /// Execution timeout in seconds
        #[arg(long)]
        execution_timeout: Option<u64>,
    },

    /// Print the effective configuration
    Config,

    /// List installed Jupyter kernels
    Kernels,

    /// Join a workspace and send one chat message
    Chat {
        /// Workspace id
        workspace: String,

        /// Message text
        message: String,

        /// Bearer token
        #[arg(long, env = "COLLABD_TOKEN")]
        token: String,

        /// Daemon address (default: the configured listen address)
        #[arg(long)]
        addr: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let config = load_config(cli.config)?;

    match cli.command {
        None => run_daemon(config).await,
        Some(Commands::Run {
            listen,
            instance_id,
            history_limit,
            execution_timeout,
        }) => {
            let mut config = config;
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            if let Some(instance_id) = instance_id {
                config.instance_id = instance_id;
            }
            if let Some(limit) = history_limit {
                config.history_limit = limit;
            }
            if let Some(secs) = execution_timeout {
                config.execution_timeout_secs = secs;
            }
            run_daemon(config).await
        }
        Some(Commands::Config) => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Some(Commands::Kernels) => {
            let launcher = JupyterLauncher::new(&config.kernel_name, std::env::temp_dir());
            let kernels = launcher.available_kernels().await;
            println!("{}", serde_json::to_string_pretty(&kernels)?);
            Ok(())
        }
        Some(Commands::Chat {
            workspace,
            message,
            token,
            addr,
        }) => chat(addr.unwrap_or(config.listen_addr), &workspace, &token, &message).await,
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<CollabConfig> {
    match path {
        Some(path) => CollabConfig::load(&path),
        None => {
            let default_path = collabd::daemon_base_dir().join("config.json");
            if default_path.exists() {
                CollabConfig::load(&default_path)
            } else {
                Ok(CollabConfig::default())
            }
        }
    }
}

async fn run_daemon(config: CollabConfig) -> anyhow::Result<()> {
    info!("collabd starting...");
    info!("Configuration:");
    info!("  Listen: {}", config.listen_addr);
    info!("  Instance: {}", config.instance_id);
    info!("  History limit: {}", config.history_limit);
    info!("  Execution timeout: {}s", config.execution_timeout_secs);
    info!("  Kernel idle timeout: {}s", config.kernel_idle_timeout_secs);
    info!("  Notebook docs: {:?}", config.docs_dir);
    info!("  Files: {:?}", config.files_dir);

    let collaborators = Collaborators::from_config(&config);
    let server = Server::new(config, collaborators);

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl-C");
            signal_server.shutdown();
        }
    });

    server.run().await
}

async fn chat(addr: String, workspace: &str, token: &str, message: &str) -> anyhow::Result<()> {
    let mut client = CollabClient::connect(addr.as_str(), ResourceKind::Workspace, workspace, token).await?;
    client.chat(message).await?;
    let reply = client
        .recv_action("chat_message", Duration::from_secs(5))
        .await?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    client.close().await?;
    Ok(())
}
