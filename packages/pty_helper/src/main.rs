use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use tokio::io::AsyncWriteExt;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::prelude::*;

use pty_bridge::{Channel, Channels, FdStream, FinalStatus, Supervisor};
use pty_helper::exit::{self, CONFIG_ERROR_CODE};
use pty_helper::{CliOverrides, HelperConfig};

const STATUS_PREFIX: &str = "pty-helper";

#[derive(Parser)]
#[command(name = "pty-helper")]
#[command(about = "Run a shell behind a pseudo-terminal, relayed over fds 0-3")]
#[command(
    long_about = "Run a shell behind a pseudo-terminal.\n\n\
    fd 0 is shell input, fd 1 shell output, fd 2 diagnostics and fd 3 (optional) \
    takes resize directives of the form <rows>x<cols>, one per line."
)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Shell to run (default: $SHELL, then /bin/sh)
    #[arg(short, long)]
    shell: Option<String>,

    /// Working directory for the shell
    #[arg(short = 'C', long)]
    working_dir: Option<PathBuf>,

    /// Initial terminal rows
    #[arg(long)]
    rows: Option<u32>,

    /// Initial terminal columns
    #[arg(long)]
    cols: Option<u32>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            shell: self.shell.clone(),
            working_dir: self.working_dir.clone(),
            rows: self.rows,
            cols: self.cols,
        }
    }
}

fn main() {
    let args = Args::parse();

    // stderr is the diagnostics channel; keep it plain text.
    let default_directive = if args.debug {
        "pty_helper=debug,pty_bridge=debug"
    } else {
        "pty_helper=warn,pty_bridge=warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(false),
        )
        .with(env_filter)
        .init();

    let config = match HelperConfig::load(args.config.as_deref(), &args.overrides()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[{STATUS_PREFIX}] invalid configuration: {e:#}");
            std::process::exit(CONFIG_ERROR_CODE);
        }
    };

    let status = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => {
            let status = runtime.block_on(serve(config));
            // Drops the signal handlers before the status is mirrored.
            drop(runtime);
            status
        }
        Err(e) => {
            let status = FinalStatus::Failed(format!("failed to start runtime: {e}"));
            eprintln!("[{STATUS_PREFIX}] {status}");
            status
        }
    };

    exit::mirror(&status)
}

async fn serve(config: HelperConfig) -> FinalStatus {
    let mut diagnostics = tokio::io::stderr();
    match run_session(config, &mut diagnostics).await {
        Ok(status) => status,
        Err(e) => {
            let status = FinalStatus::Failed(format!("{e:#}"));
            let line = format!("[{STATUS_PREFIX}] {status}\n");
            let _ = diagnostics.write_all(line.as_bytes()).await;
            let _ = diagnostics.flush().await;
            status
        }
    }
}

async fn run_session(
    config: HelperConfig,
    diagnostics: &mut tokio::io::Stderr,
) -> Result<FinalStatus> {
    let mut sup_config = config.to_supervisor_config()?;
    sup_config.status_prefix = STATUS_PREFIX.to_string();
    info!(
        "Starting {} at {}",
        sup_config.session.shell_path(),
        sup_config.session.size
    );

    let channels = Channels {
        input: open_channel(Channel::Input)?,
        output: open_channel(Channel::Output)?,
        control: open_control()?,
    };

    let supervisor = Supervisor::new(sup_config);
    forward_stop_signals(supervisor.stop_token())?;
    Ok(supervisor.run(channels, diagnostics).await)
}

/// Take ownership of one of the inherited descriptors.
fn inherited(fd: RawFd) -> Option<OwnedFd> {
    fcntl(fd, FcntlArg::F_GETFD).ok()?;
    // SAFETY: the descriptor is open and nothing else in this process owns it.
    Some(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn open_channel(channel: Channel) -> Result<FdStream> {
    let fd = inherited(channel.fd())
        .with_context(|| format!("{channel} channel (fd {}) is not open", channel.fd()))?;
    FdStream::new(fd).with_context(|| format!("cannot poll {channel} channel"))
}

/// The control channel is optional; without it the size stays at its initial value.
fn open_control() -> Result<Option<FdStream>> {
    let Some(fd) = inherited(Channel::Control.fd()) else {
        debug!("No control channel");
        return Ok(None);
    };
    fcntl(Channel::Control.fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .context("cannot mark control channel close-on-exec")?;
    let stream = FdStream::new(fd).context("cannot poll control channel")?;
    Ok(Some(stream))
}

/// SIGTERM, SIGHUP and SIGINT all ask for the same teardown as closing Input.
fn forward_stop_signals(stop: CancellationToken) -> Result<()> {
    let mut term = signal(SignalKind::terminate()).context("cannot watch SIGTERM")?;
    let mut hangup = signal(SignalKind::hangup()).context("cannot watch SIGHUP")?;
    let mut interrupt = signal(SignalKind::interrupt()).context("cannot watch SIGINT")?;
    tokio::spawn(async move {
        let name = tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = hangup.recv() => "SIGHUP",
            _ = interrupt.recv() => "SIGINT",
        };
        info!("Received {}, stopping session", name);
        stop.cancel();
    });
    Ok(())
}
