use std::process::Command;

fn mdsync(home: &std::path::Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_mdsync"));
    cmd.env("HOME", home).env_remove("RUST_LOG");
    cmd
}

#[test]
fn rollback_clears_a_stale_lock() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("store");
    std::fs::create_dir_all(store.join("_lock")).unwrap();

    let output = mdsync(dir.path()).arg("rollback").arg(&store).output().unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    assert!(!store.join("_lock").exists());
}

#[test]
fn rollback_reports_json() {
    let dir = tempfile::tempdir().unwrap();
    let store = dir.path().join("store");
    std::fs::create_dir_all(&store).unwrap();

    let output = mdsync(dir.path())
        .args(["--format", "json", "rollback"])
        .arg(&store)
        .output()
        .unwrap();
    assert!(output.status.success());
    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(json["command"], "rollback");
}

#[test]
fn missing_database_is_a_plain_failure() {
    let dir = tempfile::tempdir().unwrap();
    let output = mdsync(dir.path()).arg("push").arg(dir.path()).output().unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no database given"));
}

#[test]
fn config_file_supplies_the_database() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("mdsync.toml");
    std::fs::write(
        &config,
        format!(
            "database = \"{}\"\nexecutable = \"{}\"\n",
            dir.path().join("db.mtn").display(),
            dir.path().join("no-such-engine").display()
        ),
    )
    .unwrap();
    let output = mdsync(dir.path())
        .arg("--config")
        .arg(&config)
        .arg("push")
        .arg(dir.path().join("store"))
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!stderr.contains("no database given"));
    assert!(stderr.contains("no-such-engine"));
}
