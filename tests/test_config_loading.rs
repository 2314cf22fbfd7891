//! Configuration loading from disk

use hostlink::config::{AgentConfig, ConfigError, Environment};
use std::io::Write;
use std::path::PathBuf;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "{content}").unwrap();
    file
}

#[test]
fn test_config_loads_from_file_with_overrides() {
    let file = write_config(
        r#"
[agent]
id = "web-01.eu"
environment = "staging"

[control_plane]
url = "https://control.example.com"
auth_path = "/v2/auth"
timeout_secs = 3

[queue]
prefetch = 2
max_redeliveries = 5
results_queue = "custom.results"

[duplex]
url = "wss://control.example.com/ws"
max_concurrent_jobs = 1

[reconnect]
max_attempts = 0

[credentials]
path = "/tmp/hostlink/credential.bin"

[health]
enabled = false
port = 9090
"#,
    );

    let config = AgentConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.agent.id, "web-01.eu");
    assert_eq!(config.agent.environment, Environment::Staging);
    assert_eq!(config.control_plane.auth_path, "/v2/auth");
    assert_eq!(config.auth_timeout().as_secs(), 3);
    assert_eq!(config.queue.prefetch, 2);
    assert_eq!(config.queue.max_redeliveries, 5);
    assert_eq!(config.queue.results_queue, "custom.results");
    assert_eq!(config.queue.commands_exchange, "hostlink.commands");
    assert_eq!(
        config.duplex.url.as_deref(),
        Some("wss://control.example.com/ws")
    );
    assert_eq!(config.reconnect.max_attempts, 0);
    assert_eq!(
        config.credentials.path,
        PathBuf::from("/tmp/hostlink/credential.bin")
    );
    assert!(!config.health.enabled);
    assert_eq!(config.health.port, 9090);
}

#[test]
fn test_missing_file_is_io_error() {
    let err = AgentConfig::load_from_file(std::path::Path::new("/nonexistent/hostlink.toml"))
        .unwrap_err();
    assert!(matches!(err, ConfigError::FileRead(_)));
}

#[test]
fn test_missing_required_section_is_parse_error() {
    let file = write_config(
        r#"
[agent]
id = "web-01"
"#,
    );
    let err = AgentConfig::load_from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::TomlParse(_)));
}

#[test]
fn test_invalid_control_plane_url_rejected() {
    let file = write_config(
        r#"
[agent]
id = "web-01"

[control_plane]
url = "not a url"
"#,
    );
    let err = AgentConfig::load_from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidConfig(_)));
}
