use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{select, sync::RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collaborators::{CollaboratorError, run_command};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Token command failed")]
    Command(#[from] CollaboratorError),
    #[error("Token command printed an empty token")]
    Empty,
    #[error("No token configured")]
    NoCommand,
}

// Supplier of bearer tokens for remote senders. How the token is
// obtained is up to the implementation.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self) -> Result<String, CredentialError>;
}

// Shared bearer token. Readers get a copy of the value current at call
// time, a concurrent refresh never invalidates a request in flight.
#[derive(Debug, Clone, Default)]
pub struct CredentialStore {
    token: Arc<RwLock<Option<String>>>,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current(&self) -> Option<String> {
        self.token.read().await.clone()
    }

    pub async fn replace(&self, token: String) {
        *self.token.write().await = Some(token);
    }
}

// Run an operator supplied command and use its trimmed stdout as token
pub struct CommandTokenProvider {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandTokenProvider {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

#[async_trait]
impl TokenProvider for CommandTokenProvider {
    async fn fetch_token(&self) -> Result<String, CredentialError> {
        let (program, args) =
            self.command.split_first().ok_or(CredentialError::NoCommand)?;
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        let output = run_command(program, &args, self.timeout).await?;

        let token = output.trim();
        if token.is_empty() {
            return Err(CredentialError::Empty);
        }

        Ok(token.to_string())
    }
}

// Fetch a token and store it, logging but keeping the previous
// value on failure. Returns whether the store was updated.
pub async fn refresh_once(
    store: &CredentialStore,
    provider: &dyn TokenProvider,
) -> bool {
    match provider.fetch_token().await {
        Ok(token) => {
            store.replace(token).await;
            debug!("Chat credential refreshed");
            true
        }
        Err(err) => {
            let err = anyhow::Error::from(err);
            warn!("Failed to refresh chat credential: {}", err);

            err.chain().skip(1).for_each(|e| {
                debug!("Error chain: {}", e);
            });

            false
        }
    }
}

// Periodically refresh the credential until the token is cancelled.
// Runs independently from the poll loop.
pub async fn run_refresh(
    run_token: CancellationToken,
    store: CredentialStore,
    provider: Arc<dyn TokenProvider>,
    period: Duration,
) {
    info!("Credential refresher: Running every {:?}", period);

    loop {
        select! {
            _ = run_token.cancelled() => {
                info!("Credential refresher: Quiting");

                break;
            },
            _ = tokio::time::sleep(period) => {
                refresh_once(&store, provider.as_ref()).await;
            }
        }
    }
}
