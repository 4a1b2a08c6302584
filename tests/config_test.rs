//! Integration tests for configuration resolution

use std::io::Write;
use std::time::Duration;

use tcpgate::config::ConfigManager;
use tcpgate::{DispatchMode, PacketEnvelope, ServerBuilder, ServerError, SourceConfig};

fn noop_handler(_envelope: PacketEnvelope) {}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", contents).unwrap();
    file
}

#[test]
fn test_file_overrides_environment() {
    let file = config_file("port = 9300\n");
    let env = ConfigManager::load_from_vars(|key| match key {
        "TCPGATE_PORT" => Some("9400".to_string()),
        "TCPGATE_WORKER_BOUND" => Some("6".to_string()),
        _ => None,
    })
    .unwrap();

    let from_file = ConfigManager::load_from_file(file.path()).unwrap().unwrap();
    let merged = from_file.layered_over(env);

    let config = ServerBuilder::new()
        .with_config_source(merged)
        .with_packet_handler(noop_handler)
        .build_configuration()
        .unwrap();

    assert_eq!(config.port(), 9300);
    assert_eq!(config.worker_bound(), 6);
    assert_eq!(config.dispatch_mode(), DispatchMode::Handler);
}

#[test]
fn test_explicit_values_override_file() {
    let file = config_file("port = 9300\nworker_bound = 4\ndispatch_mode = \"queue\"\n");

    let config = ServerBuilder::new()
        .with_config_file(file.path())
        .without_environment()
        .with_port(9301)
        .with_dispatch_mode(DispatchMode::Handler)
        .with_packet_handler(noop_handler)
        .build_configuration()
        .unwrap();

    assert_eq!(config.port(), 9301);
    assert_eq!(config.worker_bound(), 4);
    assert_eq!(config.dispatch_mode(), DispatchMode::Handler);
}

#[test]
fn test_defaults_without_any_source() {
    let config = ServerBuilder::new()
        .without_config_file()
        .without_environment()
        .with_dispatch_mode(DispatchMode::Queue)
        .build_configuration()
        .unwrap();

    assert_eq!(config.port(), 9191);
    assert_eq!(config.worker_bound(), 0);
    assert_eq!(config.callback_timeout(), Duration::from_secs(5));
    assert_eq!(config.shutdown_timeout(), Duration::from_secs(30));
}

#[test]
fn test_handler_from_file_mode_still_required() {
    let file = config_file("dispatch_mode = \"handler\"\n");

    let err = ServerBuilder::new()
        .with_config_file(file.path())
        .without_environment()
        .build_configuration()
        .unwrap_err();

    assert!(matches!(err, ServerError::Configuration(_)));
}

#[test]
fn test_unknown_key_is_configuration_error() {
    let file = config_file("receiver_threads_number = 4\n");

    let err = ServerBuilder::new()
        .with_config_file(file.path())
        .without_environment()
        .with_dispatch_mode(DispatchMode::Queue)
        .build_configuration()
        .unwrap_err();

    assert!(matches!(err, ServerError::Configuration(_)));
    assert!(err.to_string().contains("Failed to parse config file"));
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = taken.local_addr().unwrap().port();

    let err = ServerBuilder::new()
        .with_config_source(SourceConfig::default())
        .with_bind_host("127.0.0.1".parse().unwrap())
        .with_port(port)
        .with_dispatch_mode(DispatchMode::Queue)
        .build()
        .await
        .unwrap_err();

    match err {
        ServerError::Bind { addr, .. } => assert_eq!(addr.port(), port),
        other => panic!("expected bind error, got {:?}", other),
    }
}
