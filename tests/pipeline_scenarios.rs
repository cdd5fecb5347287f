//! Scaled-down end-to-end training scenarios.
//!
//! These run the whole pipeline with tiny networks and a handful of short
//! games, in sequential worker mode so the test process never re-executes
//! itself. A shared lock serializes them: parameter initialization goes
//! through the global torch RNG.

use std::sync::{Mutex, MutexGuard, OnceLock};

use chess_dqn::config::TrainingConfig;
use chess_dqn::training::{CycleMetrics, StopReason, TrainingPipeline};

fn lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    std::env::set_var("CHESS_DQN_SEQUENTIAL", "1");
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn tiny_cfg(dir: &std::path::Path, seed: u64, max_cycles: usize) -> TrainingConfig {
    let mut cfg = TrainingConfig::fast_debug();
    cfg.hidden_layers = vec![8];
    cfg.games_per_cycle = 4;
    cfg.max_concurrent_games = 2;
    cfg.max_steps_per_game = 10;
    cfg.batch_size = 4;
    cfg.max_batches_per_cycle = 10;
    cfg.target_update_frequency = 4;
    cfg.evaluation_games = 2;
    cfg.checkpoint_interval = 1;
    cfg.max_cycles = max_cycles;
    cfg.seed = Some(seed);
    cfg.checkpoint_directory = dir.join("ckpt").to_string_lossy().into_owned();
    cfg.log_directory = dir.join("logs").to_string_lossy().into_owned();
    cfg
}

fn read_metrics(dir: &std::path::Path) -> Vec<CycleMetrics> {
    let path = dir.join("ckpt").join("metrics.ndjson");
    std::fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[test]
fn fast_debug_sanity() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = TrainingPipeline::new(tiny_cfg(dir.path(), 12345, 3)).unwrap();
    let reason = pipeline.run().unwrap();
    assert_eq!(reason, StopReason::MaxCycles);

    let metrics = read_metrics(dir.path());
    assert_eq!(metrics.len(), 3, "one metrics line per cycle");
    for line in &metrics {
        assert!(line.aborted.is_none(), "no cycle aborted: {line:?}");
        assert_eq!(line.games, 4);
        assert!(line.loss_mean.is_finite());
    }
    // First cycle promotes vacuously.
    assert!(metrics[0].promoted);

    let ckpt = dir.path().join("ckpt");
    assert!(ckpt.join("best").join("params.bin").exists());
    assert!(ckpt.join("pointer.json").exists());
    let pointer: serde_json::Value =
        serde_json::from_slice(&std::fs::read(ckpt.join("pointer.json")).unwrap()).unwrap();
    assert!(pointer["bestCycle"].as_u64().is_some());
    assert_eq!(pointer["lastCycle"], 3);
}

#[test]
fn identical_seeds_give_identical_first_cycles() {
    let _guard = lock();
    let run = |dir: &std::path::Path| {
        let mut pipeline = TrainingPipeline::new(tiny_cfg(dir, 777, 1)).unwrap();
        pipeline.run().unwrap();
        let params = std::fs::read(dir.join("ckpt").join("cycle-1").join("params.bin")).unwrap();
        (params, read_metrics(dir))
    };
    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let (params_a, metrics_a) = run(dir_a.path());
    let (params_b, metrics_b) = run(dir_b.path());

    assert_eq!(params_a, params_b, "cycle-1 parameters are bit-identical");
    assert_eq!(metrics_a[0].games, metrics_b[0].games);
    assert_eq!(metrics_a[0].wins, metrics_b[0].wins);
    assert_eq!(metrics_a[0].draws, metrics_b[0].draws);
    assert_eq!(metrics_a[0].losses, metrics_b[0].losses);
}

#[test]
fn resume_replays_the_same_self_play() {
    let _guard = lock();
    // Reference run: two cycles straight through.
    let dir_a = tempfile::tempdir().unwrap();
    TrainingPipeline::new(tiny_cfg(dir_a.path(), 424242, 2))
        .unwrap()
        .run()
        .unwrap();
    let metrics_a = read_metrics(dir_a.path());

    // Split run: one cycle, stop, resume from `last`, one more cycle.
    let dir_b = tempfile::tempdir().unwrap();
    TrainingPipeline::new(tiny_cfg(dir_b.path(), 424242, 1))
        .unwrap()
        .run()
        .unwrap();
    let mut resumed =
        TrainingPipeline::resume(tiny_cfg(dir_b.path(), 424242, 2), "last").unwrap();
    assert_eq!(resumed.current_cycle(), 2);
    resumed.run().unwrap();
    let metrics_b = read_metrics(dir_b.path());

    assert_eq!(metrics_a.len(), 2);
    assert_eq!(metrics_b.len(), 2);
    // Cycle 2 self-play depends only on the cycle-1 snapshot and derived
    // seeds, so its game tallies match across the split.
    assert_eq!(metrics_a[1].games, metrics_b[1].games);
    assert_eq!(metrics_a[1].wins, metrics_b[1].wins);
    assert_eq!(metrics_a[1].draws, metrics_b[1].draws);
    assert_eq!(metrics_a[1].losses, metrics_b[1].losses);
}

#[test]
fn stop_file_halts_before_the_first_cycle() {
    let _guard = lock();
    let dir = tempfile::tempdir().unwrap();
    let cfg = tiny_cfg(dir.path(), 5, 10);
    let ckpt = std::path::PathBuf::from(&cfg.checkpoint_directory);
    std::fs::create_dir_all(&ckpt).unwrap();
    std::fs::write(ckpt.join("STOP"), b"").unwrap();

    let mut pipeline = TrainingPipeline::new(cfg).unwrap();
    let reason = pipeline.run().unwrap();
    assert_eq!(reason, StopReason::UserRequested);
    // A final checkpoint is still written on the way out.
    assert!(ckpt.join("cycle-1").join("params.bin").exists());
    // The stop file is consumed, so the next run starts normally.
    assert!(!ckpt.join("STOP").exists());
}
