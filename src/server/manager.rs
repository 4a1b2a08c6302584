//! Server Implementation

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::config::{DispatchMode, ServerBuilder, ServerConfiguration};
use crate::connection::{
    Connection, ConnectionId, ConnectionRecord, ConnectionRegistry, ConnectionSummary, EventSink,
};
use crate::dispatch::{DispatchRouter, Dispatcher, IncomingPacketQueue};
use crate::error::ServerError;
use crate::pool::WorkerPool;
use crate::protocol::{HANDSHAKE_ACCEPT, HANDSHAKE_REJECT};
use crate::shutdown::{LoopState, ShutdownCoordinator};
use crate::Result;

/// Handle to a bound TCP server. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct TcpServer {
    shared: Arc<Shared>,
}

struct Shared {
    config: Arc<ServerConfiguration>,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    registry: Arc<ConnectionRegistry>,
    router: Arc<DispatchRouter>,
    pool: WorkerPool,
    queue: Option<Arc<IncomingPacketQueue>>,
    coordinator: ShutdownCoordinator,
    counters: AcceptCounters,
}

#[derive(Default)]
struct AcceptCounters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    unhealthy: AtomicU64,
}

/// Server statistics snapshot
#[derive(Debug, Clone)]
pub struct ServerStats {
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub connections_unhealthy: u64,
    pub active_connections: usize,
    pub active_workers: usize,
    pub peak_workers: usize,
    pub worker_bound: usize,
    pub queued_packets: Option<usize>,
}

impl TcpServer {
    /// Start configuring a new server
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Bind the listening socket for a validated configuration
    pub async fn bind(config: ServerConfiguration) -> Result<Self> {
        let addr = config.bind_addr();

        info!("Binding TCP listener to {}", addr);
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        Self::from_listener(config, listener)
    }

    /// Build a server around an already bound listener
    pub fn from_listener(config: ServerConfiguration, listener: TcpListener) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        info!("Successfully bound to {}", local_addr);

        let registry = Arc::new(ConnectionRegistry::new());
        let (dispatcher, queue) = match config.dispatch_mode() {
            DispatchMode::Handler => {
                let handler = config.handler().cloned().ok_or_else(|| {
                    ServerError::configuration(
                        "dispatch mode is set to handler but no packet handler was specified",
                    )
                })?;
                (Dispatcher::Handler(handler), None)
            }
            DispatchMode::Queue => {
                let queue = Arc::new(IncomingPacketQueue::new());
                (Dispatcher::Queue(Arc::clone(&queue)), Some(queue))
            }
        };
        let router = Arc::new(DispatchRouter::new(Arc::clone(&registry), dispatcher));

        let shared = Shared {
            pool: WorkerPool::new(config.worker_bound()),
            coordinator: ShutdownCoordinator::new(config.shutdown_timeout()),
            config: Arc::new(config),
            local_addr,
            listener: Mutex::new(Some(listener)),
            registry,
            router,
            queue,
            counters: AcceptCounters::default(),
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// Spawn the accept loop on its own task
    pub fn start(&self) -> JoinHandle<Result<()>> {
        let server = self.clone();
        tokio::spawn(async move { server.run().await })
    }

    /// Run the accept loop on the current task until shutdown or a fatal
    /// listener error.
    pub async fn run(&self) -> Result<()> {
        let shared = &self.shared;

        let listener = shared
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(listener) = listener else {
            if shared.coordinator.is_shutting_down() {
                info!("Server was shut down before the accept loop started");
                return Ok(());
            }
            return Err(ServerError::AlreadyRunning);
        };

        shared.coordinator.set_loop_state(LoopState::Running);

        if let Some(callbacks) = shared.config.callbacks() {
            let callbacks = Arc::clone(callbacks);
            self.notify("on_started", move || callbacks.on_started()).await;
        }

        let result = self.accept_connections(listener).await;
        shared.coordinator.set_loop_state(LoopState::Stopped);
        result
    }

    /// Main connection acceptance loop. Owns the listener and drops it on
    /// every exit path.
    async fn accept_connections(&self, listener: TcpListener) -> Result<()> {
        let shared = &self.shared;
        let accept_timeout = shared.config.accept_timeout();
        let mut close_rx = shared.coordinator.subscribe();

        info!(
            "Starting connection acceptance loop on {} (worker bound: {}, dispatch mode: {})",
            shared.local_addr,
            shared.config.worker_bound(),
            shared.config.dispatch_mode()
        );

        let result = loop {
            if shared.coordinator.should_exit() {
                info!("Exit flag set, stopping connection acceptance");
                break Ok(());
            }

            tokio::select! {
                biased;

                _ = wait_for_close(&mut close_rx) => {
                    info!("Received shutdown signal, stopping connection acceptance");
                    break Ok(());
                }
                accepted = accept_next(&listener, accept_timeout) => match accepted {
                    Ok((stream, addr)) => {
                        // A slow callback must not keep the listener open past shutdown.
                        tokio::select! {
                            biased;

                            _ = wait_for_close(&mut close_rx) => {
                                info!("Received shutdown signal during admission, stopping");
                                break Ok(());
                            }
                            _ = self.admit(stream, addr) => {}
                        }
                    }
                    Err(ServerError::AcceptTimeout) => {
                        trace!("Accept timed out, checking exit flag");
                    }
                    Err(ServerError::Accept(e)) if shared.coordinator.should_exit() => {
                        debug!("Accept failed during shutdown: {}", e);
                        break Ok(());
                    }
                    Err(ServerError::Accept(e)) if is_peer_error(&e) => {
                        debug!("Pending connection failed before accept completed: {}", e);
                    }
                    Err(e) => {
                        error!("Error accepting connection: {}", e);
                        break Err(e);
                    }
                }
            }
        };

        drop(listener);
        info!("Listening socket closed, connection acceptance loop stopped");
        result
    }

    /// Admission check, registration, worker submission and handshake
    /// for one accepted socket
    async fn admit(&self, mut stream: TcpStream, addr: SocketAddr) {
        let shared = &self.shared;
        debug!("Accepted connection from {}", addr);

        if shared.pool.is_saturated() {
            shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
            if let Err(e) = stream.write_all(&[HANDSHAKE_REJECT]).await {
                debug!("Failed to send reject byte to {}: {}", addr, e);
            }
            info!(
                "Connection from IP {} was declined due to not enough workers to handle it ({} active, bound {})",
                addr.ip(),
                shared.pool.active_count(),
                shared.pool.bound()
            );
            return;
        }

        let id = ConnectionId::new();
        let connection = Connection::new(id, stream, shared.config.max_frame_size());
        if !connection.is_healthy() {
            shared.counters.unhealthy.fetch_add(1, Ordering::Relaxed);
            debug!("Discarding unhealthy connection from {}", addr);
            return;
        }

        let connection = Arc::new(connection);
        let sink: Arc<dyn EventSink> = Arc::clone(&shared.router) as Arc<dyn EventSink>;
        connection.attach(sink);
        shared
            .registry
            .insert(ConnectionRecord::new(Arc::clone(&connection)));

        // Shutdown may have drained the registry just before the insert.
        if shared.coordinator.is_shutting_down() {
            debug!("Shutdown in progress, dropping connection from {}", addr);
            shared.router.handle_disconnected(id);
            return;
        }

        info!("Accepted a new connection [{}] from IP: {}", id, connection.host());

        if let Err(e) = shared.pool.submit(Arc::clone(&connection).run()) {
            warn!("Could not start worker for connection {}: {}", id, e);
            shared.router.handle_disconnected(id);
            return;
        }

        if let Err(e) = connection.acknowledge(HANDSHAKE_ACCEPT).await {
            warn!("Failed to acknowledge connection {}: {}", id, e);
            shared.router.handle_disconnected(id);
            return;
        }
        shared.counters.accepted.fetch_add(1, Ordering::Relaxed);

        if let Some(callbacks) = shared.config.callbacks() {
            let callbacks = Arc::clone(callbacks);
            self.notify("on_new_connection", move || callbacks.on_new_connection(&connection))
                .await;
        }
    }

    /// Run a user callback on the blocking pool, giving up after the
    /// configured callback timeout
    async fn notify<F>(&self, name: &'static str, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let limit = self.shared.config.callback_timeout();
        match tokio::time::timeout(limit, tokio::task::spawn_blocking(callback)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Callback {} failed: {}", name, e),
            Err(_) => warn!("Callback {} did not return within {:?}, continuing", name, limit),
        }
    }

    /// Disconnect everyone, close the listener and stop the pool.
    /// Returns false if shutdown had already been requested.
    ///
    /// A running accept loop drops its listener as soon as it observes the
    /// signal, abandoning any admission or callback still in progress.
    pub fn shutdown(&self) -> bool {
        let shared = &self.shared;
        shared
            .coordinator
            .shutdown(&shared.registry, &shared.pool, &shared.listener)
    }

    /// Wait for the accept loop to stop and workers to drain, aborting
    /// workers still running after the shutdown timeout. Returns how many
    /// workers were aborted.
    pub async fn wait_for_termination(&self) -> usize {
        let shared = &self.shared;
        shared.coordinator.wait_for_loop_exit().await;

        let aborted = shared.pool.join(shared.coordinator.timeout()).await;
        if aborted == 0 {
            info!("All connections closed gracefully");
        } else {
            warn!("{} connection workers were aborted", aborted);
        }
        aborted
    }

    /// `shutdown` followed by `wait_for_termination`
    pub async fn shutdown_and_wait(&self) -> usize {
        self.shutdown();
        self.wait_for_termination().await
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.coordinator.is_shutting_down()
    }

    /// Block until the process receives a termination signal
    pub async fn listen_for_signals(&self) -> Result<()> {
        self.shared.coordinator.listen_for_signals().await
    }

    /// Send a payload to a registered connection
    pub async fn send(&self, id: ConnectionId, payload: &[u8]) -> Result<()> {
        let connection = self
            .shared
            .registry
            .get(&id)
            .ok_or(ServerError::ConnectionClosed(id))?;
        connection.send(payload).await
    }

    /// Send a payload to every registered connection. Failures are
    /// collected per connection and do not stop the others.
    pub async fn broadcast(&self, payload: &[u8]) -> Vec<(ConnectionId, ServerError)> {
        let mut failures = Vec::new();
        for connection in self.shared.registry.connections() {
            if let Err(e) = connection.send(payload).await {
                debug!("Broadcast to {} failed: {}", connection.id(), e);
                failures.push((connection.id(), e));
            }
        }
        failures
    }

    pub fn config(&self) -> &ServerConfiguration {
        &self.shared.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn port(&self) -> u16 {
        self.shared.local_addr.port()
    }

    pub fn worker_bound(&self) -> usize {
        self.shared.config.worker_bound()
    }

    pub fn dispatch_mode(&self) -> DispatchMode {
        self.shared.config.dispatch_mode()
    }

    /// The incoming packet queue; `None` in handler mode
    pub fn incoming_queue(&self) -> Option<&Arc<IncomingPacketQueue>> {
        self.shared.queue.as_ref()
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn connection(&self, id: &ConnectionId) -> Option<Arc<Connection>> {
        self.shared.registry.get(id)
    }

    pub fn connections(&self) -> Vec<ConnectionSummary> {
        self.shared.registry.snapshot()
    }

    pub fn stats(&self) -> ServerStats {
        let shared = &self.shared;
        let pool = shared.pool.stats();
        ServerStats {
            connections_accepted: shared.counters.accepted.load(Ordering::Relaxed),
            connections_rejected: shared.counters.rejected.load(Ordering::Relaxed),
            connections_unhealthy: shared.counters.unhealthy.load(Ordering::Relaxed),
            active_connections: shared.registry.len(),
            active_workers: pool.active_workers,
            peak_workers: pool.peak_workers,
            worker_bound: pool.worker_bound,
            queued_packets: shared.queue.as_ref().map(|queue| queue.len()),
        }
    }
}

impl std::fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpServer")
            .field("local_addr", &self.shared.local_addr)
            .field("config", &self.shared.config)
            .field("connections", &self.shared.registry.len())
            .finish()
    }
}

/// Accept one socket, bounded by the optional accept timeout
async fn accept_next(
    listener: &TcpListener,
    accept_timeout: Option<Duration>,
) -> Result<(TcpStream, SocketAddr)> {
    match accept_timeout {
        Some(limit) => match tokio::time::timeout(limit, listener.accept()).await {
            Ok(result) => result.map_err(ServerError::Accept),
            Err(_) => Err(ServerError::AcceptTimeout),
        },
        None => listener.accept().await.map_err(ServerError::Accept),
    }
}

/// Resolves once shutdown asks the loop to close its listener
async fn wait_for_close(close_rx: &mut watch::Receiver<bool>) {
    let _ = close_rx.wait_for(|closed| *closed).await;
}

/// Accept errors that concern only the pending peer, not the listener
fn is_peer_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset | io::ErrorKind::Interrupted
    )
}
