//! Server Builder
//!
//! Each setting resolves as: explicit builder value, else the external
//! configuration source, else the built-in default. Validation runs after
//! resolution and stops at the first violated constraint.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::defaults;
use super::manager::ConfigManager;
use super::types::{DispatchMode, ServerConfiguration, SourceConfig};
use crate::dispatch::{PacketHandler, ServerCallbackHandler};
use crate::error::ServerError;
use crate::server::TcpServer;

/// Where external configuration values come from
#[derive(Debug, Clone)]
enum ExternalSource {
    /// TOML file (if present) layered over environment variables
    Load {
        path: Option<PathBuf>,
        use_environment: bool,
    },
    /// Values supplied directly
    Fixed(SourceConfig),
}

/// Assembles a [`ServerConfiguration`] and binds a [`TcpServer`]
pub struct ServerBuilder {
    port: Option<u16>,
    worker_bound: Option<usize>,
    dispatch_mode: Option<DispatchMode>,
    handler: Option<Arc<dyn PacketHandler>>,
    callbacks: Option<Arc<dyn ServerCallbackHandler>>,
    bind_host: Option<IpAddr>,
    accept_timeout: Option<Duration>,
    callback_timeout: Option<Duration>,
    shutdown_timeout: Option<Duration>,
    max_frame_size: Option<usize>,
    source: ExternalSource,
}

/// Resolved values before validation
#[derive(Default)]
struct Resolved {
    port: Option<u16>,
    worker_bound: Option<usize>,
    dispatch_mode: Option<DispatchMode>,
    bind_host: Option<IpAddr>,
    accept_timeout: Option<Duration>,
    callback_timeout: Option<Duration>,
    shutdown_timeout: Option<Duration>,
    max_frame_size: Option<usize>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            port: None,
            worker_bound: None,
            dispatch_mode: None,
            handler: None,
            callbacks: None,
            bind_host: None,
            accept_timeout: None,
            callback_timeout: None,
            shutdown_timeout: None,
            max_frame_size: None,
            source: ExternalSource::Load {
                path: Some(PathBuf::from(defaults::CONFIG_FILENAME)),
                use_environment: true,
            },
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Maximum concurrently running connection workers; 0 disables admission control
    pub fn with_worker_bound(mut self, worker_bound: usize) -> Self {
        self.worker_bound = Some(worker_bound);
        self
    }

    pub fn with_dispatch_mode(mut self, dispatch_mode: DispatchMode) -> Self {
        self.dispatch_mode = Some(dispatch_mode);
        self
    }

    pub fn with_packet_handler<H>(mut self, handler: H) -> Self
    where
        H: PacketHandler + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn with_shared_packet_handler(mut self, handler: Arc<dyn PacketHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_callback_handler<C>(mut self, callbacks: C) -> Self
    where
        C: ServerCallbackHandler + 'static,
    {
        self.callbacks = Some(Arc::new(callbacks));
        self
    }

    pub fn with_shared_callback_handler(mut self, callbacks: Arc<dyn ServerCallbackHandler>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    pub fn with_bind_host(mut self, host: IpAddr) -> Self {
        self.bind_host = Some(host);
        self
    }

    /// Wake the accept loop periodically so it can observe the exit flag
    pub fn with_accept_timeout(mut self, timeout: Duration) -> Self {
        self.accept_timeout = Some(timeout);
        self
    }

    pub fn with_callback_timeout(mut self, timeout: Duration) -> Self {
        self.callback_timeout = Some(timeout);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = Some(timeout);
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = Some(max_frame_size);
        self
    }

    /// Read external values from this TOML file instead of the default one
    pub fn with_config_file(mut self, path: impl Into<PathBuf>) -> Self {
        let use_environment = match &self.source {
            ExternalSource::Load { use_environment, .. } => *use_environment,
            ExternalSource::Fixed(_) => true,
        };
        self.source = ExternalSource::Load {
            path: Some(path.into()),
            use_environment,
        };
        self
    }

    /// Do not read any configuration file
    pub fn without_config_file(mut self) -> Self {
        if let ExternalSource::Load { path, .. } = &mut self.source {
            *path = None;
        }
        self
    }

    /// Do not read environment variables
    pub fn without_environment(mut self) -> Self {
        if let ExternalSource::Load { use_environment, .. } = &mut self.source {
            *use_environment = false;
        }
        self
    }

    /// Use these values as the external source, skipping file and environment
    pub fn with_config_source(mut self, source: SourceConfig) -> Self {
        self.source = ExternalSource::Fixed(source);
        self
    }

    /// Resolve and validate the configuration without binding
    pub fn build_configuration(self) -> Result<ServerConfiguration, ServerError> {
        let external = self.load_external()?;
        let resolved = self.resolve(external);
        self.validate(resolved)
    }

    /// Resolve, validate and bind the listening socket
    pub async fn build(self) -> Result<TcpServer, ServerError> {
        let config = self.build_configuration()?;
        TcpServer::bind(config).await
    }

    fn load_external(&self) -> Result<SourceConfig, ServerError> {
        match &self.source {
            ExternalSource::Fixed(source) => Ok(source.clone()),
            ExternalSource::Load {
                path,
                use_environment,
            } => ConfigManager::load_external(path.as_deref(), *use_environment)
                .map_err(|e| ServerError::configuration(format!("{:#}", e))),
        }
    }

    fn resolve(&self, external: SourceConfig) -> Resolved {
        let resolved = Resolved {
            port: self.port.or(external.port).or(Some(defaults::PORT)),
            worker_bound: self
                .worker_bound
                .or(external.worker_bound)
                .or(Some(defaults::WORKER_BOUND)),
            dispatch_mode: self
                .dispatch_mode
                .or(external.dispatch_mode)
                .or(Some(defaults::DISPATCH_MODE)),
            bind_host: self.bind_host.or(external.bind_host).or(Some(defaults::BIND_HOST)),
            accept_timeout: self.accept_timeout.or(external.accept_timeout),
            callback_timeout: self
                .callback_timeout
                .or(external.callback_timeout)
                .or(Some(defaults::CALLBACK_TIMEOUT)),
            shutdown_timeout: self
                .shutdown_timeout
                .or(external.shutdown_timeout)
                .or(Some(defaults::SHUTDOWN_TIMEOUT)),
            max_frame_size: self
                .max_frame_size
                .or(external.max_frame_size)
                .or(Some(defaults::MAX_FRAME_SIZE)),
        };

        debug!(
            "Resolved configuration: port={:?} worker_bound={:?} dispatch_mode={:?}",
            resolved.port, resolved.worker_bound, resolved.dispatch_mode
        );
        resolved
    }

    fn validate(self, resolved: Resolved) -> Result<ServerConfiguration, ServerError> {
        let port = resolved
            .port
            .ok_or_else(|| ServerError::configuration("port must be set"))?;

        let worker_bound = resolved
            .worker_bound
            .ok_or_else(|| ServerError::configuration("worker bound must be set"))?;

        let dispatch_mode = resolved
            .dispatch_mode
            .ok_or_else(|| ServerError::configuration("dispatch mode must be set"))?;

        if dispatch_mode == DispatchMode::Handler && self.handler.is_none() {
            return Err(ServerError::configuration(
                "dispatch mode is set to handler but no packet handler was specified",
            ));
        }

        let max_frame_size = resolved.max_frame_size.unwrap_or(defaults::MAX_FRAME_SIZE);
        if max_frame_size == 0 || max_frame_size > u32::MAX as usize {
            return Err(ServerError::configuration(format!(
                "max frame size must be between 1 and {} bytes",
                u32::MAX
            )));
        }

        // A handler is only meaningful in handler mode.
        let handler = match dispatch_mode {
            DispatchMode::Handler => self.handler,
            DispatchMode::Queue => None,
        };

        Ok(ServerConfiguration {
            port,
            worker_bound,
            dispatch_mode,
            handler,
            callbacks: self.callbacks,
            bind_host: resolved.bind_host.unwrap_or(defaults::BIND_HOST),
            accept_timeout: resolved.accept_timeout,
            callback_timeout: resolved.callback_timeout.unwrap_or(defaults::CALLBACK_TIMEOUT),
            shutdown_timeout: resolved.shutdown_timeout.unwrap_or(defaults::SHUTDOWN_TIMEOUT),
            max_frame_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::PacketEnvelope;
    use std::io::Write;

    fn noop_handler(_envelope: PacketEnvelope) {}

    fn isolated() -> ServerBuilder {
        ServerBuilder::new().with_config_source(SourceConfig::default())
    }

    #[test]
    fn test_defaults() {
        let config = isolated()
            .with_packet_handler(noop_handler)
            .build_configuration()
            .unwrap();

        assert_eq!(config.port(), defaults::PORT);
        assert_eq!(config.port(), 9191);
        assert_eq!(config.worker_bound(), 0);
        assert!(!config.is_bounded());
        assert_eq!(config.dispatch_mode(), DispatchMode::Handler);
        assert!(config.handler().is_some());
        assert!(config.accept_timeout().is_none());
        assert_eq!(config.max_frame_size(), defaults::MAX_FRAME_SIZE);
    }

    #[test]
    fn test_handler_mode_requires_handler() {
        let err = isolated().build_configuration().unwrap_err();
        assert!(matches!(err, ServerError::Configuration(_)));
        assert!(err.to_string().contains("no packet handler"));
    }

    #[test]
    fn test_queue_mode_needs_no_handler() {
        let config = isolated()
            .with_dispatch_mode(DispatchMode::Queue)
            .with_packet_handler(noop_handler)
            .build_configuration()
            .unwrap();

        assert_eq!(config.dispatch_mode(), DispatchMode::Queue);
        assert!(config.handler().is_none());
    }

    #[test]
    fn test_explicit_values_beat_external_source() {
        let source = SourceConfig {
            port: Some(9193),
            worker_bound: Some(2),
            dispatch_mode: Some(DispatchMode::Queue),
            ..SourceConfig::default()
        };

        let config = ServerBuilder::new()
            .with_config_source(source)
            .with_port(9194)
            .with_worker_bound(3)
            .build_configuration()
            .unwrap();

        assert_eq!(config.port(), 9194);
        assert_eq!(config.worker_bound(), 3);
        assert_eq!(config.dispatch_mode(), DispatchMode::Queue);
    }

    #[test]
    fn test_config_file_values_used() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "port = 9193\nworker_bound = 2\ndispatch_mode = \"queue\"\naccept_timeout = \"100ms\""
        )
        .unwrap();

        let config = ServerBuilder::new()
            .with_config_file(file.path())
            .without_environment()
            .build_configuration()
            .unwrap();

        assert_eq!(config.port(), 9193);
        assert_eq!(config.worker_bound(), 2);
        assert_eq!(config.dispatch_mode(), DispatchMode::Queue);
        assert_eq!(config.accept_timeout(), Some(Duration::from_millis(100)));
    }

    #[test]
    fn test_missing_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerBuilder::new()
            .with_config_file(dir.path().join("nonexistent.toml"))
            .without_environment()
            .with_packet_handler(noop_handler)
            .build_configuration()
            .unwrap();

        assert_eq!(config.port(), 9191);
        assert_eq!(config.worker_bound(), 0);
    }

    #[test]
    fn test_malformed_config_file_is_configuration_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "dispatch_mode = \"threads\"").unwrap();

        let err = ServerBuilder::new()
            .with_config_file(file.path())
            .without_environment()
            .build_configuration()
            .unwrap_err();
        assert!(matches!(err, ServerError::Configuration(_)));
    }

    #[test]
    fn test_zero_frame_size_rejected() {
        let err = isolated()
            .with_dispatch_mode(DispatchMode::Queue)
            .with_max_frame_size(0)
            .build_configuration()
            .unwrap_err();
        assert!(err.to_string().contains("max frame size"));
    }
}
