#![forbid(unsafe_code)]

//! `slackclaw` — single-tenant local agent that turns Slack command
//! messages into durable, optionally approval-gated subprocess tasks.
//!
//! Bootstraps configuration, opens the state store, runs the startup
//! crash-recovery sweep, wires the configured listener (poll or Socket
//! Mode), and drives the orchestrator's cycle loop until a shutdown signal
//! arrives or `--once` completes a single cycle.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use slackclaw::approval::ApprovalManager;
use slackclaw::attachments::HttpFileDownloader;
use slackclaw::config::{Config, ListenerMode};
use slackclaw::executor::Executor;
use slackclaw::listener::{Listener, PollListener, SocketListener};
use slackclaw::orchestrator::Orchestrator;
use slackclaw::persistence::approval_repo::ApprovalRepo;
use slackclaw::persistence::checkpoint_repo::CheckpointRepo;
use slackclaw::persistence::processed_repo::ProcessedRepo;
use slackclaw::persistence::session_repo::SessionRepo;
use slackclaw::persistence::task_repo::TaskRepo;
use slackclaw::persistence::db;
use slackclaw::reporter::Reporter;
use slackclaw::slack::SlackService;
use slackclaw::{AppError, Result};

/// Process exit codes, per `spec.md` §6.
mod exit_code {
    pub const CONFIG_ERROR: i32 = 2;
    pub const SLACK_AUTH_FAILURE: i32 = 3;
    pub const LISTENER_INIT_FAILURE: i32 = 4;
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "slackclaw", about = "Slack-driven local task runner", version, long_about = None)]
struct Cli {
    /// Path to an optional TOML configuration file, layered underneath the
    /// process environment (environment always wins).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Run exactly one listen/decide/drain cycle, then exit.
    #[arg(long)]
    once: bool,
}

fn main() {
    let args = Cli::parse();
    if let Err(err) = init_tracing(args.log_format) {
        eprintln!("failed to initialize logging: {err}");
        std::process::exit(exit_code::CONFIG_ERROR);
    }

    let once = args.once;
    let config_path = args.config.clone();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            error!(%err, "failed to build tokio runtime");
            std::process::exit(exit_code::CONFIG_ERROR);
        }
    };

    let code = runtime.block_on(run(config_path, once));
    std::process::exit(code);
}

async fn run(config_path: Option<PathBuf>, once: bool) -> i32 {
    let config = match Config::load(config_path.as_deref()) {
        Ok(config) => Arc::new(config),
        Err(err) => {
            error!(%err, "configuration error");
            return exit_code::CONFIG_ERROR;
        }
    };
    info!(listener_mode = ?config.listener_mode, "startup");

    let db = match db::connect(&config.state_db_path).await {
        Ok(db) => Arc::new(db),
        Err(err) => {
            error!(%err, "failed to open state store");
            return exit_code::CONFIG_ERROR;
        }
    };

    let task_repo = Arc::new(TaskRepo::new(Arc::clone(&db)));
    let processed = Arc::new(ProcessedRepo::new(Arc::clone(&db)));
    let approval_repo = Arc::new(ApprovalRepo::new(Arc::clone(&db)));
    let session_repo = Arc::new(SessionRepo::new(Arc::clone(&db)));
    let checkpoints = Arc::new(CheckpointRepo::new(Arc::clone(&db)));

    let aborted = match task_repo.mark_running_tasks_aborted().await {
        Ok(count) => count,
        Err(err) => {
            error!(%err, "crash-recovery sweep failed");
            return exit_code::CONFIG_ERROR;
        }
    };
    if aborted > 0 {
        info!(count = aborted, "aborted_on_restart sweep completed");
    }

    let slack = match SlackService::new(&config.slack_bot_token) {
        Ok(slack) => Arc::new(slack),
        Err(err) => {
            error!(%err, "failed to build slack client");
            return exit_code::SLACK_AUTH_FAILURE;
        }
    };
    match slack.auth_test().await {
        Ok(bot_user_id) => info!(bot_user_id, "slack auth.test succeeded"),
        Err(err) => {
            error!(%err, "slack auth.test failed");
            return exit_code::SLACK_AUTH_FAILURE;
        }
    }

    let listener: Box<dyn Listener> = match config.listener_mode {
        ListenerMode::Poll => Box::new(PollListener::new(
            Arc::clone(&slack) as Arc<dyn slackclaw::slack::SlackPoster>,
            Arc::clone(&checkpoints),
            config.command_channel_id.clone(),
            config.poll_batch_size,
        )),
        ListenerMode::Socket => {
            let Some(app_token) = config.slack_app_token.as_deref() else {
                error!("socket listener mode requires SLACK_APP_TOKEN");
                return exit_code::LISTENER_INIT_FAILURE;
            };
            match SocketListener::start(
                &config.slack_bot_token,
                app_token,
                config.command_channel_id.clone(),
            ) {
                Ok(listener) => Box::new(listener),
                Err(err) => {
                    error!(%err, "failed to start socket mode listener");
                    return exit_code::LISTENER_INIT_FAILURE;
                }
            }
        }
    };

    let downloader = Arc::new(HttpFileDownloader::new(config.slack_bot_token.clone()));
    let executor = Arc::new(Executor::new(Arc::clone(&config), Arc::clone(&session_repo)));
    let reporter = Arc::new(Reporter::new(
        Arc::clone(&slack) as Arc<dyn slackclaw::slack::SlackPoster>,
        &config,
    ));
    let approvals = Arc::new(ApprovalManager::new(
        approval_repo,
        Arc::clone(&slack) as Arc<dyn slackclaw::slack::SlackPoster>,
        &config,
    ));

    let mut orchestrator = match Orchestrator::new(
        listener,
        Arc::clone(&config),
        processed,
        task_repo,
        approvals,
        downloader,
        executor,
        reporter,
    )
    .await
    {
        Ok(orchestrator) => orchestrator,
        Err(err) => {
            error!(%err, "failed to build orchestrator");
            return exit_code::CONFIG_ERROR;
        }
    };

    if once {
        if let Err(err) = orchestrator.run_cycle().await {
            error!(%err, "cycle failed");
            return exit_code::CONFIG_ERROR;
        }
        return 0;
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    let signal_shutdown = Arc::clone(&shutdown);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        info!("signal");
        signal_shutdown.store(true, Ordering::Relaxed);
    });

    orchestrator.run_forever(&shutdown).await;
    info!("orchestrator stopped; state store closed");

    0
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt().with_env_filter(env_filter);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
