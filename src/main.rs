use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use gpu_idle_warden::{
    arg_parser::ArgsOptions,
    collaborators::{NvidiaSmi, ProcTools},
    config::WardenConfig,
    credentials::{self, CommandTokenProvider, CredentialStore, TokenProvider},
    dispatcher::Dispatcher,
    idle_tracker::IdleTracker,
    logger,
    senders::{
        WarningSender, chat::ChatSender, file::FileSender,
        terminal::TerminalSender,
    },
    watcher::Watcher,
};
use tokio::{
    select,
    signal::{
        ctrl_c,
        unix::{SignalKind, signal},
    },
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    logger::init_logging();

    // Parse the command line arguments
    let args_options = ArgsOptions::parse();

    // Invalid configuration is the only fatal error
    let config = WardenConfig::load(&args_options)
        .with_context(|| "Failed to load the configuration")?;

    info!(
        "Watching \"{}\": check every {}s, warn after {}s, at most every {}s",
        config.machine_name,
        config.check_period_seconds,
        config.warn_after_seconds,
        config.warning_interval_seconds
    );

    // This token and tracker will be used to handle graceful shutdown
    let tracker = TaskTracker::new();
    let token = CancellationToken::new();

    let mut senders: Vec<Box<dyn WarningSender>> = Vec::new();

    if config.terminal {
        senders.push(Box::new(TerminalSender::new(&config.machine_name)));
    }

    if let Some(path) = &config.log_file {
        senders.push(Box::new(FileSender::new(&config.machine_name, path)));
    }

    // The chat sender needs a credential kept fresh by its own task
    if let Some(chat) = &config.chat {
        let credential = CredentialStore::new();
        let provider: Arc<dyn TokenProvider> = Arc::new(
            CommandTokenProvider::new(
                chat.token_command.clone(),
                config.command_timeout,
            ),
        );

        match ChatSender::start(
            &config.machine_name,
            chat,
            credential.clone(),
            provider.as_ref(),
        )
        .await
        {
            Ok(sender) => {
                senders.push(Box::new(sender));

                let token = token.clone();
                let period = chat.token_refresh;

                tracker.spawn(async move {
                    credentials::run_refresh(token, credential, provider, period)
                        .await;
                });
            }
            Err(err) => {
                error!("Chat sender disabled: {}", err);
            }
        }
    }

    if senders.is_empty() {
        warn!("No sender enabled, warnings will only be logged");
    }

    // Start the poll loop
    {
        let token = token.clone();
        let timeout = config.command_timeout;

        let dispatcher = Dispatcher::new(
            Arc::new(ProcTools::new(timeout)),
            config.people.clone(),
            senders,
        );

        let mut watcher = Watcher::new(
            Arc::new(NvidiaSmi::new(timeout)),
            IdleTracker::new(
                config.check_period_seconds,
                config.warn_after_seconds,
                config.warning_interval_seconds,
            ),
            dispatcher,
            config.excluded_processes.clone(),
            Duration::from_secs(config.check_period_seconds),
        );

        tracker.spawn(async move {
            watcher.run(token).await;
        });
    }

    shutdown_signal().await?;
    info!("Shutting down");

    // Cancel the token to communicate the program
    // termination to the running tasks
    token.cancel();

    // Wait for the tasks to finish
    tracker.close();
    tracker.wait().await;

    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut terminate = signal(SignalKind::terminate())
        .with_context(|| "Failed to install the SIGTERM handler")?;

    select! {
        result = ctrl_c() => result.with_context(|| "Failed to wait for Ctrl-C")?,
        _ = terminate.recv() => {}
    }

    Ok(())
}
