use std::io::Write;

use framewire::{AppError, FramewireConfig};
use tempfile::Builder;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new()
        .prefix("framewire")
        .suffix(".toml")
        .tempfile()
        .expect("failed to create temp config");
    file.write_all(contents.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn loads_sections_and_keeps_defaults() {
    let file = write_config(
        r#"
[network]
ip = "0.0.0.0"
port = 7000

[session]
keepalive_interval_ms = 0
abort_on_close = true
max_packet_size = 1024
"#,
    );

    let config = FramewireConfig::set_up_config(file.path()).unwrap();

    assert_eq!(config.network.ip, "0.0.0.0");
    assert_eq!(config.network.port, 7000);
    assert_eq!(config.network.backlog, 1024);
    assert!(config.session.keepalive_interval().is_none());
    assert!(config.session.abort_on_close);
    assert!(config.session.no_delay);
    assert_eq!(config.session.max_packet_size, 1024);
    assert_eq!(config.session.read_buffer_size, None);
}

#[test]
fn rejects_invalid_packet_limit() {
    let file = write_config(
        r#"
[session]
max_packet_size = 0
"#,
    );

    assert!(matches!(
        FramewireConfig::set_up_config(file.path()),
        Err(AppError::InvalidValue(_))
    ));
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.toml");

    assert!(matches!(
        FramewireConfig::set_up_config(path),
        Err(AppError::ConfigFileError(_))
    ));
}
