//! Out-of-band reload commands
//!
//! Producers (the admin API, or any other transport) push
//! [`ReloadCommand`]s into a channel; [`run_reload_consumer`] restarts the
//! named backend if a supervisor exists for it. Reloads never create
//! supervisors.

use crate::registry::ServiceRegistry;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Restart one domain's backend without a mapping change
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadCommand {
    pub domain: String,
}

impl ReloadCommand {
    pub fn new(domain: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
        }
    }
}

/// What a reload command did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The supervisor was told to restart
    Restarted,
    /// The supervisor exists but could not restart its backend
    Failed,
    /// No supervisor exists for the domain
    UnknownDomain,
}

pub type ReloadSender = mpsc::Sender<ReloadCommand>;

pub fn channel(capacity: usize) -> (ReloadSender, mpsc::Receiver<ReloadCommand>) {
    mpsc::channel(capacity)
}

/// Apply a single reload command
pub fn apply_reload(registry: &ServiceRegistry, command: &ReloadCommand) -> ReloadOutcome {
    let Some(supervisor) = registry.get(&command.domain) else {
        debug!(domain = %command.domain, "Reload for unknown domain ignored");
        return ReloadOutcome::UnknownDomain;
    };

    info!(domain = %command.domain, "Reloading backend");
    match supervisor.restart() {
        Ok(()) => ReloadOutcome::Restarted,
        Err(e) => {
            warn!(domain = %command.domain, error = %e, "Reload failed");
            ReloadOutcome::Failed
        }
    }
}

/// Drain reload commands until shutdown or until every producer is gone
pub async fn run_reload_consumer(
    registry: Arc<ServiceRegistry>,
    mut commands: mpsc::Receiver<ReloadCommand>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(command) => {
                        apply_reload(&registry, &command);
                    }
                    None => {
                        debug!("Reload channel closed");
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}
