use std::path::PathBuf;
use std::process::{Command, Output};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "tunmux-cli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn run_with_config(tag: &str, mode: &str, yaml: &str) -> Output {
    let dir = unique_temp_dir(tag);
    let path = dir.join("config.yaml");
    std::fs::write(&path, yaml).expect("config should be writable");

    let output = Command::new(env!("CARGO_BIN_EXE_tunmux"))
        .arg("--config")
        .arg(&path)
        .arg(mode)
        .env_remove("TUNMUX_CONFIG")
        .output()
        .expect("tunmux should run");

    let _ = std::fs::remove_dir_all(&dir);
    output
}

#[test]
fn version_reports_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_tunmux"))
        .arg("version")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.trim(), format!("tunmux {}", env!("CARGO_PKG_VERSION")));
}

#[test]
fn version_extended_reports_protocol() {
    let output = Command::new(env!("CARGO_BIN_EXE_tunmux"))
        .args(["version", "--extended"])
        .output()
        .expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("protocol: 1"));
}

#[test]
fn missing_config_returns_60() {
    let output = Command::new(env!("CARGO_BIN_EXE_tunmux"))
        .args(["--config", "/nonexistent/tunmux/config.yaml", "server"])
        .env_remove("TUNMUX_CONFIG")
        .output()
        .expect("server should run");

    assert_eq!(output.status.code(), Some(60));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid configuration"));
}

#[test]
fn malformed_yaml_returns_60() {
    let output = run_with_config("malformed", "server", "server: [unclosed");
    assert_eq!(output.status.code(), Some(60));
}

#[test]
fn client_without_channels_returns_60() {
    let output = run_with_config(
        "no-channels",
        "client",
        "client: { address: \"127.0.0.1:9443\" }\n",
    );
    assert_eq!(output.status.code(), Some(60));
}

#[test]
fn unreadable_tls_material_returns_60() {
    let output = run_with_config(
        "tls-missing",
        "server",
        "server: { address: \"127.0.0.1:0\", tls: relay }\n\
         tls:\n  - { name: relay, cert: missing.pem, key: missing.key, ca: missing-ca.pem }\n",
    );
    assert_eq!(output.status.code(), Some(60));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("relay"));
}

#[test]
fn server_bind_conflict_returns_failure() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = taken.local_addr().expect("addr");

    let output = run_with_config(
        "bind-conflict",
        "server",
        &format!("server: {{ address: \"{addr}\" }}\n"),
    );
    assert_eq!(output.status.code(), Some(1));
    drop(taken);
}

#[test]
fn unknown_subcommand_returns_64() {
    let output = Command::new(env!("CARGO_BIN_EXE_tunmux"))
        .arg("relay")
        .output()
        .expect("tunmux should run");

    assert_eq!(output.status.code(), Some(64));
}
