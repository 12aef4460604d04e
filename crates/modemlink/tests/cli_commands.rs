#![cfg(feature = "cli")]

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};

fn modemlink(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_modemlink"))
        .args(["--log-level", "error"])
        .args(args)
        .output()
        .expect("modemlink should run")
}

fn unique_temp_file(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!(
        "modemlink-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ))
}

#[test]
fn encode_prints_frame_hex() {
    let output = modemlink(&["--format", "json", "encode", "--channel", "10", "--data", "ping"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    let value: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(value["channel"], 10);
    assert_eq!(value["frames"], 1);
    assert_eq!(value["wire_size"], 8);
    // config START|PADDING, channel 10, length 8, "ping"
    assert_eq!(value["hex"], "900a080070696e67");
}

#[test]
fn decode_reads_encoded_output() {
    let encoded = modemlink(&["--format", "raw", "encode", "--channel", "fmt", "--data", "AT"]);
    assert!(encoded.status.success());

    let mut child = Command::new(env!("CARGO_BIN_EXE_modemlink"))
        .args(["--log-level", "error", "--format", "json", "decode"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("decode should start");
    child
        .stdin
        .take()
        .expect("stdin piped")
        .write_all(&encoded.stdout)
        .unwrap();
    let output = child.wait_with_output().unwrap();

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"channel\":235"));
    assert!(stdout.contains("\"payload\":\"AT\""));
}

#[test]
fn decode_garbage_returns_60() {
    let output = modemlink(&["decode", "0102030405"]);
    assert_eq!(output.status.code(), Some(60));
}

#[test]
fn bad_hex_is_usage_error() {
    let output = modemlink(&["encode", "--hex", "xyz"]);
    assert_eq!(output.status.code(), Some(64));
}

#[test]
fn loopback_reports_round_trips() {
    let output = modemlink(&[
        "--format", "json", "loopback", "--count", "5", "--size", "100",
    ]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    let value: serde_json::Value = serde_json::from_str(stdout.trim()).unwrap();
    assert_eq!(value["count"], 5);
    assert_eq!(value["peer_echoed"], 5);
    assert_eq!(value["device"]["state"], "online");
    assert_eq!(value["transport"], "shmem");
}

#[test]
fn loopback_honors_config_file() {
    let path = unique_temp_file("config.json");
    std::fs::write(
        &path,
        r#"{"transport":"dpram","shmem":{"fmt":{"tx":2044,"rx":2044},"raw":{"tx":6120,"rx":6120}}}"#,
    )
    .unwrap();

    let output = modemlink(&[
        "--format",
        "json",
        "--config",
        path.to_str().unwrap(),
        "loopback",
        "--count",
        "2",
        "--channel",
        "fmt",
    ]);
    let _ = std::fs::remove_file(&path);

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("\"transport\":\"dpram\""));
    assert!(stdout.contains("\"channel_name\":\"FMT\""));
}

#[test]
fn missing_config_file_fails() {
    let output = modemlink(&["--config", "/nonexistent/modemlink.json", "version"]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn version_prints_package_version() {
    let output = modemlink(&["version"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.starts_with(&format!("modemlink {}", env!("CARGO_PKG_VERSION"))));
}
