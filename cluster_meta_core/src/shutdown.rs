//! Graceful shutdown coordination
//!
//! One [`CancellationToken`] is shared by every long-running part of the
//! server. SIGINT, SIGTERM or a manual trigger cancels it; the teardown that
//! follows is bounded by the configured shutdown timeout. The optional pid
//! file lives exactly as long as its [`PidFile`] guard.

use std::fs::{self, OpenOptions};
use std::future::Future;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::config::{PidConfig, ServerConfig};
use crate::error::{MetaError, Result};
use crate::log::log_shutdown;

/// Shutdown signal types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGTERM
    Terminate,
    /// Manual shutdown request
    Manual,
}

impl ShutdownSignal {
    pub fn reason(self) -> &'static str {
        match self {
            ShutdownSignal::Interrupt => "SIGINT received",
            ShutdownSignal::Terminate => "SIGTERM received",
            ShutdownSignal::Manual => "manual shutdown",
        }
    }
}

/// Shutdown coordinator shared by the binary and its tasks
#[derive(Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    signal: Arc<Mutex<Option<ShutdownSignal>>>,
    timeout: Duration,
    handle_signals: bool,
}

impl ShutdownCoordinator {
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            token: CancellationToken::new(),
            signal: Arc::new(Mutex::new(None)),
            timeout: Duration::from_secs(config.shutdown_timeout),
            handle_signals: config.graceful_shutdown,
        }
    }

    /// Token cancelled once shutdown starts.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn the signal listener. Does nothing when graceful shutdown is
    /// disabled, leaving the default signal behaviour in place.
    pub fn listen_for_signals(&self) {
        if !self.handle_signals {
            return;
        }
        let coordinator = self.clone();
        tokio::spawn(async move {
            let signal = wait_for_signal().await;
            coordinator.trigger(signal);
        });
    }

    /// Start shutdown. Only the first trigger is recorded; returns whether
    /// this call was it.
    pub fn trigger(&self, signal: ShutdownSignal) -> bool {
        let first = match self.signal.lock() {
            Ok(mut slot) if slot.is_none() => {
                *slot = Some(signal);
                true
            }
            _ => false,
        };
        if first {
            tracing::info!("Initiating graceful shutdown: {}", signal.reason());
            log_shutdown(signal.reason());
            self.token.cancel();
        }
        first
    }

    /// Wait until shutdown starts and report what started it.
    pub async fn wait(&self) -> ShutdownSignal {
        self.token.cancelled().await;
        self.signal
            .lock()
            .ok()
            .and_then(|slot| *slot)
            .unwrap_or(ShutdownSignal::Manual)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run `teardown` within the shutdown timeout. Returns false if it had
    /// to be abandoned.
    pub async fn run_bounded<F: Future<Output = ()>>(&self, teardown: F) -> bool {
        match timeout(self.timeout, teardown).await {
            Ok(()) => {
                tracing::info!("Graceful shutdown completed successfully");
                true
            }
            Err(_) => {
                tracing::warn!("Shutdown timeout of {:?} reached, forcing shutdown", self.timeout);
                false
            }
        }
    }
}

/// Pid file owned by this process, removed when dropped.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write the current process id when enabled. An existing file is only
    /// replaced with `override` set.
    pub fn create(config: &PidConfig) -> Result<Option<PidFile>> {
        if !config.enabled {
            return Ok(None);
        }
        let mut options = OpenOptions::new();
        options.write(true);
        if config.override_existing {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }

        let mut file = options.open(&config.path).map_err(|e| match e.kind() {
            io::ErrorKind::AlreadyExists => MetaError::Config(format!(
                "pid file {} already exists; remove it or enable override",
                config.path.display()
            )),
            _ => MetaError::Io(e),
        })?;
        writeln!(file, "{}", std::process::id())?;
        tracing::info!("Wrote pid {} to {}", std::process::id(), config.path.display());

        Ok(Some(PidFile {
            path: config.path.clone(),
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("Failed to remove pid file {}: {}", self.path.display(), e);
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> ShutdownSignal {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut interrupt, mut terminate) = match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
        (Ok(interrupt), Ok(terminate)) => (interrupt, terminate),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!("Failed to install signal handlers, falling back to ctrl-c: {}", e);
            return ctrl_c().await;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => {
            tracing::info!("Received SIGINT");
            ShutdownSignal::Interrupt
        }
        _ = terminate.recv() => {
            tracing::info!("Received SIGTERM");
            ShutdownSignal::Terminate
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> ShutdownSignal {
    ctrl_c().await
}

async fn ctrl_c() -> ShutdownSignal {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    ShutdownSignal::Interrupt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(shutdown_timeout: u64) -> ServerConfig {
        ServerConfig {
            shutdown_timeout,
            ..ServerConfig::default()
        }
    }

    #[tokio::test]
    async fn test_first_trigger_wins() {
        let coordinator = ShutdownCoordinator::new(&config(1));
        assert!(!coordinator.is_shutting_down());

        assert!(coordinator.trigger(ShutdownSignal::Terminate));
        assert!(!coordinator.trigger(ShutdownSignal::Manual));
        assert!(coordinator.is_shutting_down());
        assert_eq!(coordinator.wait().await, ShutdownSignal::Terminate);
    }

    #[tokio::test]
    async fn test_token_observed_by_clones() {
        let coordinator = ShutdownCoordinator::new(&config(1));
        let token = coordinator.token();
        let waiter = tokio::spawn(async move { token.cancelled().await });
        coordinator.clone().trigger(ShutdownSignal::Manual);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_teardown_is_bounded() {
        let coordinator = ShutdownCoordinator::new(&config(0));
        assert!(coordinator.run_bounded(async {}).await);
        assert!(!coordinator.run_bounded(std::future::pending::<()>()).await);
    }

    fn pid_config(path: PathBuf, override_existing: bool) -> PidConfig {
        PidConfig {
            enabled: true,
            path,
            override_existing,
        }
    }

    #[test]
    fn test_pid_file_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");

        let pid_file = PidFile::create(&pid_config(path.clone(), false)).unwrap().unwrap();
        assert_eq!(pid_file.path(), path.as_path());
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        drop(pid_file);
        assert!(!path.exists());
    }

    #[test]
    fn test_existing_pid_file_needs_override() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");
        fs::write(&path, "12345\n").unwrap();

        let err = PidFile::create(&pid_config(path.clone(), false)).unwrap_err();
        assert!(matches!(err, MetaError::Config(_)));
        assert_eq!(fs::read_to_string(&path).unwrap(), "12345\n");

        let pid_file = PidFile::create(&pid_config(path.clone(), true)).unwrap().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), std::process::id().to_string());
        drop(pid_file);
        assert!(!path.exists());
    }

    #[test]
    fn test_disabled_pid_file_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pid");
        let config = PidConfig {
            enabled: false,
            ..pid_config(path.clone(), false)
        };
        assert!(PidFile::create(&config).unwrap().is_none());
        assert!(!path.exists());
    }
}
