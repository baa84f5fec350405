use blender_connection::BlenderConnection;
use blender_server::BlenderServer;
use clap::{Args as ClapArgs, Parser, Subcommand};
use color_eyre::eyre::{eyre, Result, WrapErr};
use dispatch::{Dispatcher, Transport};
use executor::{BindOutcome, CommandQueue};
use rmcp::ServiceExt;
use scene::InMemoryScene;
use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing_subscriber::{self, EnvFilter};

mod blender_connection;
mod blender_server;
mod catalog;
mod dispatch;
mod error;
mod executor;
mod host;
mod install;
mod prompts;
mod protocol;
mod scene;

/// MCP bridge between an LLM agent and a running Blender session
/// Run without arguments to register the server with your MCP clients
#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Run the MCP server using stdio transport (legacy flag maintained for backwards compatibility)
    #[arg(long = "stdio")]
    legacy_stdio: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Run the MCP server using stdio transport
    #[command(alias = "stdio")]
    Server(ServerArgs),
    /// Run a standalone command executor backed by an in-memory scene
    Executor(ExecutorArgs),
    /// Launch the interactive MCP client installer
    Setup(InstallArgs),
    /// Register the server with every supported MCP client
    Install(InstallArgs),
}

#[derive(ClapArgs, Debug, Clone)]
struct ServerArgs {
    /// Host the Blender add-on listens on
    #[arg(long, env = "BLENDER_HOST", default_value = "localhost")]
    host: String,

    /// Port the Blender add-on listens on
    #[arg(long, env = "BLENDER_PORT", default_value_t = protocol::DEFAULT_EXECUTOR_PORT)]
    port: u16,

    /// Seconds to wait for Blender to answer a command
    #[arg(long, env = "BLENDER_MCP_TIMEOUT_SECS", default_value_t = blender_connection::DEFAULT_RESPONSE_TIMEOUT.as_secs())]
    timeout_secs: u64,

    /// Expose execute_blender_code, which runs arbitrary Python inside Blender
    #[arg(long, env = "BLENDER_MCP_ALLOW_CODE")]
    allow_code_execution: bool,

    /// Node group to look for once the server is up; pass an empty string to skip
    #[arg(long, default_value = blender_server::NODE_CITY_GROUP)]
    startup_node_group: String,
}

impl Default for ServerArgs {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: protocol::DEFAULT_EXECUTOR_PORT,
            timeout_secs: blender_connection::DEFAULT_RESPONSE_TIMEOUT.as_secs(),
            allow_code_execution: false,
            startup_node_group: blender_server::NODE_CITY_GROUP.to_string(),
        }
    }
}

#[derive(ClapArgs, Debug, Clone)]
struct ExecutorArgs {
    /// Address to accept connections on
    #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    bind: IpAddr,

    /// Port to accept connections on
    #[arg(long, env = "BLENDER_PORT", default_value_t = protocol::DEFAULT_EXECUTOR_PORT)]
    port: u16,

    /// JSON scene to load instead of the built-in default scene
    #[arg(long)]
    scene: Option<PathBuf>,

    /// Milliseconds between executor ticks
    #[arg(long, default_value_t = executor::DEFAULT_TICK_INTERVAL.as_millis() as u64)]
    tick_ms: u64,
}

#[derive(ClapArgs, Debug, Clone)]
struct InstallArgs {
    /// Register the server with execute_blender_code enabled
    #[arg(long)]
    allow_code_execution: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .with_target(false)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    let command = if args.legacy_stdio {
        Some(Command::Server(ServerArgs::default()))
    } else {
        args.command
    };

    match command {
        Some(Command::Server(args)) => run_server(args).await,
        Some(Command::Executor(args)) => run_executor(args).await,
        Some(Command::Setup(args)) => install::setup(args.allow_code_execution).await,
        Some(Command::Install(args)) => install::install(args.allow_code_execution).await,
        None => install::install(false).await,
    }
}

async fn run_server(args: ServerArgs) -> Result<()> {
    tracing::debug!("Debug MCP tracing enabled");
    if args.allow_code_execution {
        tracing::warn!("execute_blender_code is enabled; agents can run arbitrary Python in Blender");
    }

    let connection = BlenderConnection::new(
        args.host.clone(),
        args.port,
        Duration::from_secs(args.timeout_secs),
    );
    let transport: Box<dyn Transport> = Box::new(connection);
    let dispatcher = Arc::new(Dispatcher::new(transport, args.allow_code_execution));
    let server = BlenderServer::new(Arc::clone(&dispatcher));

    let startup_check = (!args.startup_node_group.is_empty()).then(|| {
        let server = server.clone();
        let group = args.startup_node_group.clone();
        tokio::spawn(async move {
            // Blender may not be up yet; the result is only logged.
            let _ = server.check_startup_node_group(&group).await;
        })
    });

    for tool in catalog::TOOLS {
        tracing::debug!("Exposing {}: {}", tool.name, tool.description);
    }
    tracing::info!("Forwarding tool calls to Blender at {}:{}", args.host, args.port);
    let service = server
        .serve(rmcp::transport::stdio())
        .await
        .inspect_err(|e| {
            tracing::error!("serving error: {:?}", e);
        })?;
    service.waiting().await?;

    if let Some(check) = startup_check {
        check.abort();
    }
    dispatcher.close().await;
    tracing::info!("Bye!");
    Ok(())
}

async fn run_executor(args: ExecutorArgs) -> Result<()> {
    let mut scene = match &args.scene {
        Some(path) => InMemoryScene::load(path)?,
        None => InMemoryScene::default(),
    };

    let listener = match executor::bind_executor_listener((args.bind, args.port))
        .await
        .wrap_err_with(|| format!("Failed to bind executor to {}:{}", args.bind, args.port))?
    {
        BindOutcome::Listener(listener) => listener,
        BindOutcome::AddrInUse => {
            return Err(eyre!(
                "Port {} is already in use; is the Blender add-on server already running?",
                args.port
            ))
        }
    };
    tracing::info!("Executor listening on {}:{}", args.bind, args.port);

    let queue = CommandQueue::default();
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let accept = tokio::spawn(executor::serve(
        listener,
        queue.clone(),
        shutdown_rx.clone(),
    ));
    let period = Duration::from_millis(args.tick_ms.max(1));
    let ticks = tokio::spawn(async move {
        executor::run_tick_loop(queue, &mut scene, period, shutdown_rx).await;
    });

    tokio::signal::ctrl_c()
        .await
        .wrap_err("Failed to listen for ctrl-c")?;
    tracing::info!("Shutting down executor");
    shutdown_tx.send(()).ok();
    accept.await.ok();
    ticks.await.ok();
    tracing::info!("Bye!");
    Ok(())
}
