use crate::cli::{Commands, RunArgs};
use crate::config::{Config, NetworkConfig};
use crate::process::TargetSelector;
use crate::{Result, TracerError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => handle_run(args).await,
        Commands::Check => handle_check(),
    }
}

/// Load the config file (if any) and apply the command line on top.
pub fn build_config(args: &RunArgs) -> Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    apply_overrides(&mut config, args)?;
    config.validate()?;
    Ok(config)
}

fn apply_overrides(config: &mut Config, args: &RunArgs) -> Result<()> {
    if let Some(pid) = args.pid {
        config.target = Some(TargetSelector::Pid(pid));
    }
    if let Some(name) = &args.name {
        config.target = Some(TargetSelector::Name(name.clone()));
    }
    if let Some(dir) = &args.output_dir {
        config.output_dir = dir.clone();
    }
    if let Some(interval_ms) = args.interval_ms {
        config.sample_interval_ms = interval_ms;
    }
    if !args.metrics.is_empty() {
        config.metrics = args.metrics.clone();
    }

    if let Some(interface) = &args.interface {
        config
            .network
            .get_or_insert_with(NetworkConfig::default)
            .interface = interface.clone();
    }

    let wants_network = args.src_port.is_some()
        || args.dst_port.is_some()
        || args.probe_object.is_some()
        || args.attach.is_some();
    if wants_network {
        let network = config.network.as_mut().ok_or_else(|| {
            TracerError::ConfigError(
                "--attach, --src-port, --dst-port and --probe-object require --interface".into(),
            )
        })?;
        if let Some(mode) = args.attach {
            network.attach = mode;
        }
        if args.src_port.is_some() {
            network.src_port = args.src_port;
        }
        if args.dst_port.is_some() {
            network.dst_port = args.dst_port;
        }
        if let Some(path) = &args.probe_object {
            network.probe_object = path.clone();
        }
    }

    Ok(())
}

#[cfg(target_os = "linux")]
async fn handle_run(args: RunArgs) -> anyhow::Result<()> {
    use crate::process::procfs_resolver::ProcfsResolver;
    use crate::process::Supervisor;
    use crate::session::{KernelCollectors, Orchestrator};
    use anyhow::Context;
    use std::sync::Arc;

    let config = build_config(&args)?;
    let selector = config
        .target
        .clone()
        .context("no target given, pass --pid or --name")?;

    info!(
        target = %selector,
        output_dir = %config.output_dir.display(),
        interval_ms = config.sample_interval_ms,
        metrics = config.metrics.len(),
        network = config.network.is_some(),
        helpers = config.helpers.len(),
        "starting tracer"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let orchestrator = Orchestrator::new(Arc::new(config), Arc::new(KernelCollectors::new()));
    let supervisor = Supervisor::new(selector, Arc::new(ProcfsResolver::new()), orchestrator);

    let report = supervisor.run(shutdown).await?;
    info!(sessions = report.sessions, "tracer stopped");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn handle_run(args: RunArgs) -> anyhow::Result<()> {
    build_config(&args)?;
    Err(TracerError::UnsupportedFeature("tracing requires Linux".into()).into())
}

#[cfg(target_os = "linux")]
fn handle_check() -> anyhow::Result<()> {
    crate::ebpf::preflight::run_preflight_checks()?;
    println!("System is ready to load the packet probe");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn handle_check() -> anyhow::Result<()> {
    Err(TracerError::UnsupportedFeature("the packet probe requires Linux".into()).into())
}

/// Cancel `shutdown` on SIGINT, SIGTERM or SIGQUIT.
#[cfg(unix)]
async fn cancel_on_signal(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let signals = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    );
    let received = match signals {
        (Ok(mut int), Ok(mut term), Ok(mut quit)) => tokio::select! {
            _ = int.recv() => "SIGINT",
            _ = term.recv() => "SIGTERM",
            _ = quit.recv() => "SIGQUIT",
        },
        _ => {
            warn!("failed to install signal handlers, falling back to Ctrl+C only");
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            "SIGINT"
        }
    };

    info!(signal = received, "shutting down, flushing sinks");
    shutdown.cancel();
}
