//! CLI surface smoke tests against the real binary. The training run
//! exercises the process-isolated worker path end to end: the parent
//! re-invokes this same binary with `--worker`.

use std::process::Command;

const BIN: &str = env!("CARGO_BIN_EXE_chess_dqn");

#[test]
fn unknown_profile_exits_with_config_code() {
    let dir = tempfile::tempdir().unwrap();
    let status = Command::new(BIN)
        .current_dir(dir.path())
        .args(["--train", "--profile", "no-such-profile"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(2));
}

#[test]
fn missing_mode_exits_with_config_code() {
    let dir = tempfile::tempdir().unwrap();
    let status = Command::new(BIN)
        .current_dir(dir.path())
        .arg("--seed")
        .arg("1")
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(2));
}

#[test]
fn evaluate_without_submode_exits_with_config_code() {
    let dir = tempfile::tempdir().unwrap();
    let status = Command::new(BIN)
        .current_dir(dir.path())
        .args(["--evaluate"])
        .status()
        .unwrap();
    assert_eq!(status.code(), Some(2));
}

#[test]
fn train_smoke_with_process_workers() {
    let dir = tempfile::tempdir().unwrap();
    let status = Command::new(BIN)
        .current_dir(dir.path())
        .args([
            "--train",
            "--profile",
            "fast-debug",
            "--seed",
            "7",
            "--games-per-cycle",
            "2",
            "--max-cycles",
            "1",
            "--max-concurrent-games",
            "2",
            "--max-steps-per-game",
            "10",
            "--checkpoint-dir",
            "ckpt",
        ])
        .status()
        .unwrap();
    assert!(status.success(), "training run failed: {status}");

    let ckpt = dir.path().join("ckpt");
    let metrics = std::fs::read_to_string(ckpt.join("metrics.ndjson")).unwrap();
    assert_eq!(metrics.lines().count(), 1);
    let line: serde_json::Value = serde_json::from_str(metrics.lines().next().unwrap()).unwrap();
    assert_eq!(line["games"], 2);
    assert_eq!(line["promoted"], true);
    assert!(ckpt.join("best").join("params.bin").exists());
    assert!(ckpt.join("cycle-1").join("meta.json").exists());
}
