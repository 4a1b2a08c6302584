//! Shutdown Handling
//!
//! Coordinates server shutdown: every registered connection is closed, the
//! listening socket is released, the worker pool stops taking work and the
//! exit flag is raised. Only the first request does anything.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::connection::ConnectionRegistry;
use crate::pool::WorkerPool;
use crate::Result;

/// State of the accept loop as seen by the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    NotStarted,
    Running,
    Stopped,
}

/// Shutdown coordinator shared by the server handle and its accept loop
#[derive(Debug)]
pub struct ShutdownCoordinator {
    /// Set once the first shutdown request starts
    initiated: AtomicBool,
    /// Exit flag polled by the accept loop
    exit: AtomicBool,
    /// Tells a running accept loop to drop the listening socket
    close_tx: watch::Sender<bool>,
    /// Accept loop lifecycle, for waiters
    loop_state: watch::Sender<LoopState>,
    /// How long to wait for workers during shutdown
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        let (close_tx, _) = watch::channel(false);
        let (loop_state, _) = watch::channel(LoopState::NotStarted);

        Self {
            initiated: AtomicBool::new(false),
            exit: AtomicBool::new(false),
            close_tx,
            loop_state,
            timeout,
        }
    }

    /// Receiver that flips to `true` when the listener must be closed
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_shutting_down(&self) -> bool {
        self.initiated.load(Ordering::SeqCst)
    }

    /// Exit flag checked by the accept loop between iterations
    pub fn should_exit(&self) -> bool {
        self.exit.load(Ordering::SeqCst)
    }

    pub fn loop_state(&self) -> LoopState {
        *self.loop_state.borrow()
    }

    pub(crate) fn set_loop_state(&self, state: LoopState) {
        self.loop_state.send_replace(state);
    }

    /// Run the shutdown sequence. Returns false if it already ran.
    pub fn shutdown(
        &self,
        registry: &ConnectionRegistry,
        pool: &WorkerPool,
        listener: &Mutex<Option<TcpListener>>,
    ) -> bool {
        if self.initiated.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already initiated, ignoring request");
            return false;
        }

        info!("Initiating shutdown");

        let records = registry.drain();
        if !records.is_empty() {
            info!("Disconnecting {} active connections", records.len());
        }
        for record in &records {
            record.connection.disconnect();
        }

        // A listener that was never handed to the accept loop is dropped
        // here; a running loop owns its listener and drops it on signal.
        let idle_listener = listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if idle_listener.is_some() {
            drop(idle_listener);
            info!("Listening socket closed");
        }
        self.close_tx.send_replace(true);

        pool.shutdown();
        self.exit.store(true, Ordering::SeqCst);
        true
    }

    /// Wait until the accept loop is no longer running, up to the shutdown timeout
    pub async fn wait_for_loop_exit(&self) -> bool {
        let mut state = self.loop_state.subscribe();
        let stopped = tokio::time::timeout(
            self.timeout,
            state.wait_for(|state| *state != LoopState::Running),
        )
        .await;

        match stopped {
            Ok(Ok(_)) => true,
            Ok(Err(_)) => true,
            Err(_) => {
                warn!("Accept loop still running after {:?}", self.timeout);
                false
            }
        }
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::test_support::loopback_pair;
    use crate::connection::{Connection, ConnectionId, ConnectionRecord};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_shutdown_runs_once() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let registry = ConnectionRegistry::new();
        let pool = WorkerPool::new(0);
        let listener = Mutex::new(Some(TcpListener::bind("127.0.0.1:0").await.unwrap()));
        let mut close_rx = coordinator.subscribe();

        assert!(coordinator.shutdown(&registry, &pool, &listener));
        assert!(coordinator.is_shutting_down());
        assert!(coordinator.should_exit());
        assert!(listener.lock().unwrap().is_none());
        assert!(!pool.is_accepting());
        assert!(*close_rx.borrow_and_update());

        assert!(!coordinator.shutdown(&registry, &pool, &listener));
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_every_connection() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let registry = ConnectionRegistry::new();
        let pool = WorkerPool::new(0);
        let listener = Mutex::new(None);

        let mut connections = Vec::new();
        let mut clients = Vec::new();
        for _ in 0..3 {
            let (server, client) = loopback_pair().await;
            let connection = Arc::new(Connection::new(ConnectionId::new(), server, 1024));
            registry.insert(ConnectionRecord::new(Arc::clone(&connection)));
            connections.push(connection);
            clients.push(client);
        }

        coordinator.shutdown(&registry, &pool, &listener);

        assert!(registry.is_empty());
        assert!(connections.iter().all(|c| c.is_closed()));
    }

    #[tokio::test]
    async fn test_wait_for_loop_exit() {
        let coordinator = Arc::new(ShutdownCoordinator::new(Duration::from_millis(50)));
        assert!(coordinator.wait_for_loop_exit().await);

        coordinator.set_loop_state(LoopState::Running);
        assert!(!coordinator.wait_for_loop_exit().await);

        let stopper = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                coordinator.set_loop_state(LoopState::Stopped);
            })
        };
        assert!(coordinator.wait_for_loop_exit().await);
        stopper.await.unwrap();
        assert_eq!(coordinator.loop_state(), LoopState::Stopped);
    }
}
