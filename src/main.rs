//! botkernel - module communication kernel for a pluggable bot runtime.
//!
//! Runs the kernel against a profile directory until it is stopped by a
//! module (`shutdown_core`) or by a termination signal.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use botkernel_config::{default_profile_dir, ConfigLoader};
use botkernel_core::{EchoWorker, Kernel, KernelSignal, PromptKind, PromptRequest};

/// botkernel CLI.
#[derive(Debug, Parser)]
#[command(name = "botkernel")]
#[command(about = "Module communication kernel for a pluggable bot runtime")]
#[command(version)]
struct Cli {
    /// Profile directory holding config.toml, modules/, plugins/ and data/
    #[arg(short, long, env = "BOTKERNEL_PROFILE")]
    profile: Option<String>,

    /// Write JSON lines to the log file instead of plain text
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn profile_dir(&self) -> PathBuf {
        self.profile
            .as_deref()
            .map(ConfigLoader::expand_path)
            .unwrap_or_else(default_profile_dir)
    }
}

fn init_tracing(profile: &Path, json_logs: bool) -> anyhow::Result<()> {
    let log_dir = profile.join("logs");
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("creating {}", log_dir.display()))?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("botkernel")
        .filename_suffix("log")
        .max_log_files(30)
        .build(&log_dir)?;
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    // The guard flushes the file writer on drop.
    static GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
        std::sync::OnceLock::new();
    let _ = GUARD.set(guard);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let file_layer = if json_logs {
        fmt::layer()
            .json()
            .with_writer(non_blocking)
            .boxed()
    } else {
        fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true).with_ansi(true))
        .with(file_layer)
        .init();

    Ok(())
}

/// Answer module prompts from the terminal, one line per prompt.
async fn answer_prompts(kernel: Kernel, mut requests: broadcast::Receiver<PromptRequest>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let request = match requests.recv().await {
            Ok(request) => request,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Missed {} prompt(s)", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let hint = match (&request.kind, &request.default) {
            (PromptKind::YesNo, Some(default)) => format!(" [y/n, default {}]", default),
            (PromptKind::YesNo, None) => " [y/n]".to_string(),
            (PromptKind::String, Some(default)) => format!(" [default {}]", default),
            (PromptKind::String, None) => String::new(),
        };
        let question = format!("[module {}] {}{} ", request.module_id, request.info, hint);
        if stdout.write_all(question.as_bytes()).await.is_err() || stdout.flush().await.is_err() {
            break;
        }

        match lines.next_line().await {
            Ok(Some(line)) => {
                kernel
                    .prompts()
                    .answer(&request.nonce, request.parse_answer(&line));
            }
            Ok(None) => {
                warn!("Terminal closed, prompts will no longer be answered");
                break;
            }
            Err(e) => {
                error!("Failed to read prompt answer: {}", e);
                break;
            }
        }
    }
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {}", e);
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await;
}

/// Resolve once the kernel reports that it stopped.
async fn kernel_stopped(mut signals: broadcast::Receiver<KernelSignal>) {
    loop {
        match signals.recv().await {
            Ok(KernelSignal::Stopped) | Err(broadcast::error::RecvError::Closed) => return,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let profile = cli.profile_dir();
    init_tracing(&profile, cli.json_logs)?;

    info!(profile = %profile.display(), "botkernel {}", env!("CARGO_PKG_VERSION"));

    let kernel = Kernel::builder(&profile)
        .worker("echo", || Box::new(EchoWorker::new("echo")))
        .build();

    let requests = kernel.prompts().subscribe();
    tokio::spawn(answer_prompts(kernel.clone(), requests));

    let stopped = kernel_stopped(kernel.subscribe());
    kernel.start().await.context("kernel failed to start")?;

    tokio::select! {
        _ = stopped => {
            info!("Kernel stopped by a module");
            return Ok(());
        }
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Interrupted, shutting down");
        }
        _ = terminate_signal() => {
            info!("Terminated, shutting down");
        }
    }

    kernel.stop().await;
    Ok(())
}
