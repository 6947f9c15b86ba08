use std::future::Future;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::Arc;

use anyhow::{ensure, Context};
use clap::Parser;
use tracing::{error, info, warn};

use tunsnare::capture::CaptureMode;
use tunsnare::cli::{Cli, ConfigCommand, RunArgs, TopCommand};
use tunsnare::config::{self, AppConfig};
use tunsnare::discovery::{self, ValidatedProxy};
use tunsnare::engine::{ChannelObserver, Engine, EngineConfig, StatusEvent};
use tunsnare::error::AppError;
use tunsnare::logging;
use tunsnare::mux::{NoopProtector, SocketProtector};

fn main() {
    let cli = Cli::parse();

    match cli.command {
        TopCommand::Version => {
            println!("tunsnare {}", env!("CARGO_PKG_VERSION"));
        }

        // Config edits are quick sync commands, no tokio needed.
        TopCommand::Config { command } => {
            logging::init_terminal(cli.verbose);
            exit_on_error("config", cmd_config(command));
        }

        TopCommand::Discover { uri } => {
            logging::init_terminal(cli.verbose);
            exit_on_error("discover", block_on(cmd_discover(uri)));
        }

        TopCommand::Run(args) => {
            if let Some(path) = &args.log_file {
                if let Err(e) = logging::init_file(path, cli.verbose) {
                    eprintln!("failed to open log file: {e}");
                    std::process::exit(1);
                }
            } else {
                logging::init_terminal(cli.verbose);
            }
            exit_on_error("run", block_on(cmd_run(args)));
        }
    }
}

fn exit_on_error(command: &str, result: anyhow::Result<()>) {
    if let Err(e) = result {
        error!(command = ?command, error = ?e.to_string(), "command_failed");
        std::process::exit(1);
    }
}

fn block_on(task: impl Future<Output = anyhow::Result<()>>) -> anyhow::Result<()> {
    let rt = tokio::runtime::Runtime::new().context("failed to start tokio runtime")?;
    rt.block_on(task)
}

async fn cmd_discover(uri: String) -> anyhow::Result<()> {
    let mut config = config::load_config();
    let info = discovery::parse_setup_uri(&uri)?;
    let proxy = discovery::discover(&info).await?;
    remember_proxy(&mut config, &proxy);
    println!("proxy:       {}", proxy.addr());
    println!("subject:     {}", proxy.certificate().subject());
    println!("fingerprint: {}", proxy.certificate().fingerprint());
    Ok(())
}

async fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    ensure!(args.tun_fd >= 0, "invalid TUN descriptor {}", args.tun_fd);
    let mut config = config::load_config();
    let proxy = resolve_proxy(args.uri.as_deref(), &mut config).await?;

    let mut engine_config = EngineConfig::new(proxy);
    engine_config.redirect_ports = if args.ports.is_empty() {
        config.redirect_ports.iter().copied().collect()
    } else {
        args.ports
    };
    engine_config.capture_mode = if args.socks {
        CaptureMode::Socks5
    } else {
        config.capture_mode
    };
    engine_config.mtu = config.mtu;
    engine_config.timeouts = config.idle_timeouts();
    engine_config.protector = protector(args.fwmark.or(config.fwmark));

    // SAFETY: the descriptor is inherited from the parent process and
    // nothing else in this process owns it.
    let tunnel = unsafe { OwnedFd::from_raw_fd(args.tun_fd) };
    run_engine(engine_config, tunnel).await
}

async fn run_engine(engine_config: EngineConfig, tunnel: OwnedFd) -> anyhow::Result<()> {
    let (observer, mut events) = ChannelObserver::new();
    let engine = Engine::new(engine_config, Arc::new(observer));
    engine.start(tunnel).context("failed to start engine")?;

    let outcome = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt_received");
                break Ok(());
            }
            event = events.recv() => match event {
                Some(StatusEvent::Started { proxy, trust }) => {
                    info!(proxy = %proxy.ip, port = proxy.port, trust = ?trust, "interception_active");
                }
                Some(StatusEvent::Failed { reason }) => {
                    break Err(anyhow::anyhow!("engine failed: {reason}"));
                }
                Some(StatusEvent::Stopped) | None => break Ok(()),
            },
        }
    };

    // Joins the engine threads; keep them off the async workers.
    tokio::task::block_in_place(|| engine.stop());
    outcome
}

async fn resolve_proxy(uri: Option<&str>, config: &mut AppConfig) -> anyhow::Result<ValidatedProxy> {
    let info = match uri {
        Some(uri) => discovery::parse_setup_uri(uri)?,
        None => {
            let stored = config.last_proxy.as_ref().ok_or(AppError::NoProxy)?;
            info!(proxy = %stored.ip, port = stored.port, "reusing_last_proxy");
            stored.to_proxy_info()?
        }
    };
    let proxy = discovery::discover(&info).await?;
    remember_proxy(config, &proxy);
    Ok(proxy)
}

fn remember_proxy(config: &mut AppConfig, proxy: &ValidatedProxy) {
    config.last_proxy = Some(proxy.to_stored());
    if let Err(e) = config::save_config(config) {
        warn!(error = ?e.to_string(), "last_proxy_not_saved");
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn protector(fwmark: Option<u32>) -> Arc<dyn SocketProtector> {
    match fwmark {
        Some(mark) => Arc::new(tunsnare::mux::FwmarkProtector::new(mark)),
        None => Arc::new(NoopProtector),
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn protector(fwmark: Option<u32>) -> Arc<dyn SocketProtector> {
    if fwmark.is_some() {
        warn!("fwmark_unsupported_on_platform");
    }
    Arc::new(NoopProtector)
}

fn cmd_config(command: ConfigCommand) -> anyhow::Result<()> {
    let mut config = config::load_config();
    match command {
        ConfigCommand::Show => {}
        ConfigCommand::SetPorts { ports } => {
            config.set_redirect_ports(&ports)?;
            config::save_config(&config)?;
        }
        ConfigCommand::ResetPorts => {
            config.reset_redirect_ports();
            config::save_config(&config)?;
        }
    }
    print_config(&config, &config::config_path())
}

fn print_config(config: &AppConfig, path: &Path) -> anyhow::Result<()> {
    println!("# {}", path.display());
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
