//! boxhost: engine-host daemon and front-end CLI.
//!
//! `boxhost run` hosts the supervised engine: it owns the lifecycle
//! controller, the cross-process bridge endpoint and the degraded-mode
//! control shim, and wires OS signals into lifecycle signals (SIGTERM/ctrl-c
//! → stop, SIGHUP → reload). The other subcommands act as a front-end
//! process driving a running host over the bridge.

mod tracing_init;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use bh_core::bridge::{BridgeClient, BridgeServer, ServiceCallback};
use bh_core::lifecycle::{LifecycleController, Supervisor};
use bh_core::settings::{ServiceSettings, SharedSettings};
use bh_core::shim::ControlShim;
use bh_engine::loopback::LoopbackEngine;
use bh_engine::Engine;
use bh_types::ServiceStatus;

#[derive(Parser)]
#[command(
    name = "boxhost",
    version,
    about = "Supervisor for an embedded packet-routing engine"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Host the engine service: bridge endpoint plus control shim.
    Run(RunArgs),
    /// Query the service status of a running host.
    Status(BridgeArgs),
    /// Print the recent service log lines of a running host.
    Logs(BridgeArgs),
    /// Ask a running host to stop the engine.
    Stop(BridgeArgs),
    /// Ask a running host to reload the engine configuration.
    Reload(BridgeArgs),
    /// Validate a configuration profile with the engine parser.
    Check(CheckArgs),
    /// Build the final engine config from a profile and the options blob.
    Generate(GenerateArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Active configuration profile.
    #[arg(short, long)]
    config: PathBuf,

    /// Engine options blob (inline JSON).
    #[arg(short, long, default_value = "{}")]
    options: String,

    /// Display name of the active profile.
    #[arg(long, default_value = "default")]
    profile_name: String,

    /// Base data directory for the engine working/cache layout.
    #[arg(long, default_value = ".boxhost")]
    data_dir: PathBuf,

    /// Bridge endpoint address (loopback only).
    #[arg(long, default_value = "127.0.0.1:19089")]
    listen: SocketAddr,

    /// Control shim address.
    #[arg(long, default_value = "127.0.0.1:19080")]
    shim_listen: SocketAddr,

    /// Write the fully built config into the working directory.
    #[arg(long, default_value_t = false)]
    debug: bool,

    /// Disable the engine-side memory limit.
    #[arg(long, default_value_t = false)]
    disable_memory_limit: bool,
}

#[derive(Args)]
struct BridgeArgs {
    /// Bridge endpoint of the running host.
    #[arg(long, default_value = "127.0.0.1:19089")]
    addr: SocketAddr,
}

#[derive(Args)]
struct CheckArgs {
    /// Configuration profile to validate.
    config: PathBuf,

    /// Scratch directory for the parser.
    #[arg(long)]
    temp_dir: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    debug: bool,
}

#[derive(Args)]
struct GenerateArgs {
    /// Configuration profile to build from.
    config: PathBuf,

    /// Engine options blob (inline JSON).
    #[arg(short, long, default_value = "{}")]
    options: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_init::init_tracing_once();
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Status(args) => status(args).await,
        Command::Logs(args) => logs(args).await,
        Command::Stop(args) => stop(args).await,
        Command::Reload(args) => reload(args).await,
        Command::Check(args) => check(&args),
        Command::Generate(args) => generate(&args),
    }
}

#[cfg(unix)]
async fn term_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(unix)]
async fn hup_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::hangup()) {
        Ok(mut sig) => {
            sig.recv().await;
        }
        Err(e) => {
            warn!(error = %e, "SIGHUP handler unavailable");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn term_signal() {
    std::future::pending::<()>().await;
}

#[cfg(not(unix))]
async fn hup_signal() {
    std::future::pending::<()>().await;
}

async fn run(args: RunArgs) -> Result<()> {
    let settings = SharedSettings::new(ServiceSettings {
        active_config_path: args.config.display().to_string(),
        config_options: args.options.clone(),
        active_profile_name: args.profile_name.clone(),
        debug_mode: args.debug,
        disable_memory_limit: args.disable_memory_limit,
    });

    // The offline loopback engine stands in for the native core in this
    // build; production targets link the real bindings behind the same
    // traits.
    let engine = Arc::new(LoopbackEngine::new());
    let controller = LifecycleController::new(engine, settings, args.data_dir.clone());
    let supervisor = Supervisor::start(controller);
    let handle = supervisor.handle();

    let server = BridgeServer::new(handle.clone());
    let bridge_addr = server
        .bind(args.listen)
        .await
        .with_context(|| format!("bind bridge endpoint {}", args.listen))?;

    let shim = ControlShim::new();
    match shim.start(args.shim_listen).await {
        Ok(addr) => info!(listen = %addr, "control shim listening"),
        Err(e) => warn!(error = %e, "control shim unavailable"),
    }

    info!(bridge = %bridge_addr, profile = %args.profile_name, "engine host ready");
    handle.start().await;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, stopping service");
                handle.stop().await;
            }
            () = term_signal() => {
                info!("termination signal received, stopping service");
                handle.stop().await;
            }
            () = hup_signal() => {
                info!("hangup received, reloading service");
                handle.reload().await;
            }
            () = handle.terminated() => break,
        }
    }

    server.close();
    shim.close();
    supervisor.abort();
    info!("engine host exited");
    Ok(())
}

/// Front-end query commands never register for pushes; they bind, ask,
/// print and unbind.
struct NullCallback;

impl ServiceCallback for NullCallback {
    fn on_status_changed(&self, _status: ServiceStatus) {}
}

async fn query_client(addr: SocketAddr) -> Result<BridgeClient> {
    let client = BridgeClient::with_options(
        addr,
        Arc::new(NullCallback),
        false,
        bh_types::RetrySchedule::default(),
    );
    client.connect().await.with_context(|| {
        format!("cannot reach the engine host at {addr} — is `boxhost run` active?")
    })?;
    Ok(client)
}

async fn status(args: BridgeArgs) -> Result<()> {
    let client = query_client(args.addr).await?;
    println!("{}", client.status().await);
    client.disconnect();
    Ok(())
}

async fn logs(args: BridgeArgs) -> Result<()> {
    let client = query_client(args.addr).await?;
    for line in client.recent_logs().await? {
        println!("{line}");
    }
    client.disconnect();
    Ok(())
}

async fn stop(args: BridgeArgs) -> Result<()> {
    let client = query_client(args.addr).await?;
    client.stop().await?;
    println!("stop requested");
    client.disconnect();
    Ok(())
}

async fn reload(args: BridgeArgs) -> Result<()> {
    let client = query_client(args.addr).await?;
    client.reload().await?;
    println!("reload requested");
    client.disconnect();
    Ok(())
}

fn check(args: &CheckArgs) -> Result<()> {
    let engine = LoopbackEngine::new();
    let temp = args.temp_dir.clone().unwrap_or_else(std::env::temp_dir);
    let message = engine.parse_config(&args.config, &temp, args.debug);
    if message.is_empty() {
        println!("configuration ok");
        Ok(())
    } else {
        bail!("{message}");
    }
}

fn generate(args: &GenerateArgs) -> Result<()> {
    if args.options.trim().is_empty() || args.config.as_os_str().is_empty() {
        bail!("blank properties");
    }
    let engine = LoopbackEngine::new();
    let config = engine
        .build_config(&args.config, &args.options)
        .context("build config")?;
    println!("{config}");
    Ok(())
}
