use std::process::Command;

fn threadline(config_dir: &std::path::Path, args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_threadline"))
        .arg("--config-dir")
        .arg(config_dir)
        .args(args)
        .env_remove("TELEGRAM_BOT_TOKEN")
        .env_remove("OPENAI_API_KEY")
        .env_remove("STATEFUL_BACKEND_API_KEY")
        .output()
        .expect("failed to run threadline")
}

#[test]
fn test_onboard_defaults_then_status() {
    let dir = tempfile::tempdir().unwrap();

    let output = threadline(dir.path(), &["onboard", "--defaults"]);
    assert!(output.status.success(), "{:?}", output);
    assert!(dir.path().join("config.json").exists());

    let output = threadline(dir.path(), &["status"]);
    assert!(output.status.success(), "{:?}", output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Timeout: 600 ticks"), "{}", stdout);
    assert!(stdout.contains("stateless"));
}

#[test]
fn test_status_json_reflects_timeout_override() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.json"),
        r#"{"threads": {"session_timeout_ticks": 5, "tick_interval_ms": 250}}"#,
    )
    .unwrap();

    let output = threadline(dir.path(), &["status", "--json"]);
    assert!(output.status.success(), "{:?}", output);
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value["timeout_ticks"], 5);
    assert_eq!(value["tick_interval"], 250);
}

#[test]
fn test_invalid_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.json"),
        r#"{"telegram": {"enabled": true, "token": ""}}"#,
    )
    .unwrap();

    let output = threadline(dir.path(), &["status"]);
    assert!(!output.status.success());
}
