//! Applies the `domain,scriptPath` mapping file to the service registry
//!
//! A pass walks the mapping in file order. Each entry gets a freshly
//! allocated port and is pushed into its supervisor before the next entry
//! starts, so no two domains of one pass share a port. Whole passes are
//! serialized as well.

use crate::config::{LauncherConfig, MappingConfig};
use crate::error::ReconcileError;
use crate::port;
use crate::registry::{normalize_domain, ServiceRegistry};
use notify::{Event, RecursiveMode, Watcher};
use std::collections::HashSet;
use std::ffi::OsString;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, error, info, warn};

/// Attempts at finding a port not already handed out in the current pass
const MAX_ALLOCATION_ATTEMPTS: usize = 8;

/// One usable line of the mapping file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingEntry {
    pub domain: String,
    pub script: PathBuf,
}

/// Result of parsing a mapping file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedMapping {
    pub entries: Vec<MappingEntry>,
    /// Non-blank lines that did not yield a domain and a script path
    pub skipped: usize,
}

/// Parse mapping file contents.
///
/// Lines are trimmed and blank ones ignored. The first comma separates the
/// domain from the script path; anything after a second comma is dropped.
/// Domains go through [`normalize_domain`], the same function the router
/// applies to Host headers; lines whose domain it rejects are skipped.
pub fn parse_mapping(contents: &str) -> ParsedMapping {
    let mut parsed = ParsedMapping::default();

    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.splitn(3, ',');
        let domain = parts.next().unwrap_or("").trim();
        let script = parts.next().unwrap_or("").trim();

        if domain.is_empty() || script.is_empty() {
            warn!(line = index + 1, content = line, "Skipping malformed mapping line");
            parsed.skipped += 1;
            continue;
        }

        let Some(domain) = normalize_domain(domain) else {
            warn!(line = index + 1, domain, "Skipping mapping line with unroutable domain");
            parsed.skipped += 1;
            continue;
        };

        parsed.entries.push(MappingEntry {
            domain,
            script: PathBuf::from(script),
        });
    }

    parsed
}

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default)]
pub struct ReconcileReport {
    /// Domains and the ports assigned to them, in file order
    pub applied: Vec<(String, u16)>,
    /// Domains whose backend was restarted by this pass
    pub restarted: Vec<String>,
    /// Malformed lines ignored
    pub skipped: usize,
    /// Domains that could not be applied
    pub failed: Vec<String>,
}

/// Drives the registry towards the contents of the mapping file
pub struct ConfigReconciler {
    registry: Arc<ServiceRegistry>,
    mapping_path: PathBuf,
    allocate_bind: IpAddr,
    launcher: LauncherConfig,
    pass_lock: Mutex<()>,
}

impl ConfigReconciler {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        mapping: &MappingConfig,
        launcher: LauncherConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            mapping_path: mapping.path.clone(),
            allocate_bind: mapping.allocate_bind,
            launcher,
            pass_lock: Mutex::new(()),
        })
    }

    pub fn mapping_path(&self) -> &Path {
        &self.mapping_path
    }

    /// Derive (command, args, working directory) for a script path
    pub fn launch_for(&self, script: &Path) -> Option<(String, Vec<String>, PathBuf)> {
        let file_name = script.file_name()?;

        let working_dir = match script.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let mut args = self.launcher.args.clone();
        args.push(file_name.to_string_lossy().into_owned());

        Some((self.launcher.command.clone(), args, working_dir))
    }

    /// Read the mapping file and apply it
    pub async fn reconcile(&self) -> Result<ReconcileReport, ReconcileError> {
        info!(path = %self.mapping_path.display(), "Loading mapping file");

        let contents = tokio::fs::read_to_string(&self.mapping_path)
            .await
            .map_err(|e| ReconcileError::Read {
                path: self.mapping_path.display().to_string(),
                source: e,
            })?;

        Ok(self.apply(&contents).await)
    }

    /// Apply mapping contents, one entry at a time
    pub async fn apply(&self, contents: &str) -> ReconcileReport {
        let _pass = self.pass_lock.lock().await;

        let parsed = parse_mapping(contents);
        let mut report = ReconcileReport {
            skipped: parsed.skipped,
            ..ReconcileReport::default()
        };
        let mut claimed = HashSet::new();

        for entry in parsed.entries {
            let Some((command, args, working_dir)) = self.launch_for(&entry.script) else {
                warn!(
                    domain = %entry.domain,
                    script = %entry.script.display(),
                    "Script path has no file name, skipping"
                );
                report.skipped += 1;
                continue;
            };

            let port = match self.allocate_distinct(&entry.domain, &claimed).await {
                Ok(port) => port,
                Err(e) => {
                    error!(domain = %entry.domain, error = %e, "Skipping domain");
                    report.failed.push(entry.domain);
                    continue;
                }
            };
            claimed.insert(port);

            info!(
                domain = %entry.domain,
                port,
                script = %entry.script.display(),
                "Applying mapping entry"
            );

            let supervisor = self.registry.get_or_create(&entry.domain);
            if supervisor.set_parameters(&command, &args, &working_dir, port) {
                report.restarted.push(entry.domain.clone());
            }
            report.applied.push((entry.domain, port));
        }

        report
    }

    async fn allocate_distinct(
        &self,
        domain: &str,
        claimed: &HashSet<u16>,
    ) -> Result<u16, ReconcileError> {
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let port = port::allocate(self.allocate_bind)
                .await
                .map_err(|e| ReconcileError::PortAllocation {
                    domain: domain.to_string(),
                    source: e,
                })?;
            if !claimed.contains(&port) {
                return Ok(port);
            }
            debug!(domain, port, "Port already assigned in this pass, allocating again");
        }

        Err(ReconcileError::PortAllocation {
            domain: domain.to_string(),
            source: std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "allocator kept returning ports already assigned in this pass",
            ),
        })
    }

    /// Run one pass and log its outcome
    pub async fn run_pass(&self) {
        match self.reconcile().await {
            Ok(report) => {
                info!(
                    applied = report.applied.len(),
                    restarted = report.restarted.len(),
                    skipped = report.skipped,
                    failed = report.failed.len(),
                    "Mapping reconciled"
                );
            }
            Err(e) => {
                error!(error = %e, "Failed to reconcile mapping");
            }
        }
    }

    /// Reconcile now and again after every change to the mapping file,
    /// until shutdown.
    ///
    /// The parent directory is watched rather than the file itself so that
    /// editors replacing the file by rename are noticed. Events arriving
    /// within `debounce` of each other produce a single pass.
    pub async fn watch(
        self: Arc<Self>,
        debounce: Duration,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let file_name = self
            .mapping_path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| {
                anyhow::anyhow!("Mapping path has no file name: {}", self.mapping_path.display())
            })?;
        let watch_dir = match self.mapping_path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let (change_tx, mut change_rx) = mpsc::channel::<()>(16);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if is_mapping_change(&event, &file_name) {
                    debug!(kind = ?event.kind, "Mapping file change detected");
                    let _ = change_tx.try_send(());
                }
            }
            Err(e) => {
                warn!(error = %e, "Mapping file watch error");
            }
        })?;
        watcher.watch(&watch_dir, RecursiveMode::NonRecursive)?;

        info!(path = %self.mapping_path.display(), "Watching mapping file");
        self.run_pass().await;

        loop {
            tokio::select! {
                Some(()) = change_rx.recv() => {
                    tokio::select! {
                        _ = tokio::time::sleep(debounce) => {}
                        result = shutdown_rx.changed() => {
                            if result.is_err() || *shutdown_rx.borrow() {
                                debug!("Mapping watcher shutting down during debounce");
                                break;
                            }
                        }
                    }
                    while change_rx.try_recv().is_ok() {}
                    self.run_pass().await;
                }
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        debug!("Mapping watcher shutting down");
                        break;
                    }
                }
            }
        }

        drop(watcher);
        Ok(())
    }
}

fn is_mapping_change(event: &Event, file_name: &OsString) -> bool {
    let relevant_kind =
        event.kind.is_modify() || event.kind.is_create() || event.kind.is_remove();
    relevant_kind
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
}
