//! Durable checkpoints with an atomic best-model protocol.
//!
//! Layout under the checkpoint root:
//!
//! ```text
//! cycle-<k>/{params.bin, opt.bin, meta.json}
//! best/{params.bin, opt.bin, meta.json}
//! pointer.json
//! ```
//!
//! Everything lands via temp-name + fsync + rename, and `pointer.json`
//! is updated last, so a crash at any point leaves the previous valid
//! state recoverable. Promotion runs before retention cleanup so the new
//! best can never be reaped between rename and pointer update.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::config::TrainingConfig;
use crate::error::{Result, TrainingError};
use crate::neural::DqnLearner;

pub const PARAMS_FILE: &str = "params.bin";
pub const OPT_FILE: &str = "opt.bin";
pub const META_FILE: &str = "meta.json";
pub const POINTER_FILE: &str = "pointer.json";

const CHECKPOINT_VERSION: u32 = 1;

/// Sidecar metadata stored with every checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMeta {
    pub version: u32,
    pub config_fingerprint: u64,
    pub run_seed: u64,
    pub cycle: usize,
    pub outcome_score: f64,
    pub created_at: String,
    /// Recorded architecture, for friendlier mismatch messages; the hard
    /// check is tensor shapes on load.
    pub hidden_layers: Vec<i64>,
}

impl CheckpointMeta {
    pub fn new(cfg: &TrainingConfig, run_seed: u64, cycle: usize, outcome_score: f64) -> Self {
        CheckpointMeta {
            version: CHECKPOINT_VERSION,
            config_fingerprint: cfg.fingerprint(),
            run_seed,
            cycle,
            outcome_score,
            created_at: chrono::Utc::now().to_rfc3339(),
            hidden_layers: cfg.hidden_layers.clone(),
        }
    }
}

/// `pointer.json`: the symbolic names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PointerFile {
    pub best_cycle: Option<usize>,
    pub best_outcome_score: f64,
    pub last_cycle: usize,
}

pub struct CheckpointManager {
    root: PathBuf,
    keep_last: usize,
    keep_every_nth: usize,
}

impl CheckpointManager {
    pub fn new(root: impl Into<PathBuf>, cfg: &TrainingConfig) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(CheckpointManager {
            root,
            keep_last: cfg.keep_last_checkpoints,
            keep_every_nth: cfg.keep_every_nth_checkpoint,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cycle_dir(&self, cycle: usize) -> PathBuf {
        self.root.join(format!("cycle-{cycle}"))
    }

    pub fn best_dir(&self) -> PathBuf {
        self.root.join("best")
    }

    pub fn has_best(&self) -> bool {
        self.best_dir().join(PARAMS_FILE).exists()
    }

    pub fn best_params_path(&self) -> PathBuf {
        self.best_dir().join(PARAMS_FILE)
    }

    /// Write `cycle-<k>` atomically and advance `last_cycle`. Transient
    /// I/O failures are retried once; the second failure propagates and
    /// the cycle aborts with in-memory state intact.
    pub fn save_cycle(
        &self,
        learner: &DqnLearner,
        meta: &CheckpointMeta,
    ) -> Result<PathBuf> {
        let attempt = || self.write_cycle_once(learner, meta);
        let dir = match attempt() {
            Ok(dir) => dir,
            Err(TrainingError::Io(first)) => {
                log::warn!("checkpoint write failed ({first}); retrying once");
                attempt()?
            }
            Err(other) => return Err(other),
        };

        let mut pointer = self.read_pointer()?.unwrap_or_default();
        pointer.last_cycle = pointer.last_cycle.max(meta.cycle);
        self.write_pointer(&pointer)?;
        Ok(dir)
    }

    fn write_cycle_once(&self, learner: &DqnLearner, meta: &CheckpointMeta) -> Result<PathBuf> {
        let final_dir = self.cycle_dir(meta.cycle);
        let tmp_dir = self.root.join(format!(".tmp-cycle-{}", meta.cycle));
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        learner.save_params(tmp_dir.join(PARAMS_FILE))?;
        learner.save_optimizer(tmp_dir.join(OPT_FILE))?;
        fs::write(tmp_dir.join(META_FILE), serde_json::to_vec_pretty(meta)?)?;
        for file in [PARAMS_FILE, OPT_FILE, META_FILE] {
            fsync_file(&tmp_dir.join(file))?;
        }

        if final_dir.exists() {
            fs::remove_dir_all(&final_dir)?;
        }
        fs::rename(&tmp_dir, &final_dir)?;
        fsync_dir(&self.root)?;
        Ok(final_dir)
    }

    /// Promote `cycle-<k>` to `best` (canonical copy), then point at it.
    /// An interrupted promotion leaves either the old best or the new one
    /// in place, never a torn directory.
    pub fn promote(&self, cycle: usize, outcome_score: f64) -> Result<()> {
        let src = self.cycle_dir(cycle);
        if !src.join(PARAMS_FILE).exists() {
            return Err(TrainingError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("cannot promote missing checkpoint {}", src.display()),
            )));
        }

        let tmp = self.root.join(".tmp-best");
        if tmp.exists() {
            fs::remove_dir_all(&tmp)?;
        }
        copy_dir(&src, &tmp)?;

        let best = self.best_dir();
        let retired = self.root.join(".best-retired");
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }
        if best.exists() {
            fs::rename(&best, &retired)?;
        }
        fs::rename(&tmp, &best)?;
        fsync_dir(&self.root)?;
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }

        let mut pointer = self.read_pointer()?.unwrap_or_default();
        pointer.best_cycle = Some(cycle);
        pointer.best_outcome_score = outcome_score;
        pointer.last_cycle = pointer.last_cycle.max(cycle);
        self.write_pointer(&pointer)?;
        log::info!("promoted cycle {cycle} to best (outcome score {outcome_score:.3})");
        Ok(())
    }

    /// Retention pass: keep `best`, the `keep_last` most recent cycles,
    /// and every `keep_every_nth` cycle. Runs after promotion.
    pub fn cleanup(&self) -> Result<usize> {
        let pointer = self.read_pointer()?.unwrap_or_default();
        let mut cycles = self.existing_cycles()?;
        cycles.sort_unstable();

        let recent: Vec<usize> = cycles
            .iter()
            .rev()
            .take(self.keep_last)
            .copied()
            .collect();

        let mut removed = 0usize;
        for &cycle in &cycles {
            let keep = recent.contains(&cycle)
                || cycle % self.keep_every_nth == 0
                || pointer.best_cycle == Some(cycle);
            if !keep {
                fs::remove_dir_all(self.cycle_dir(cycle))?;
                removed += 1;
            }
        }
        if removed > 0 {
            log::debug!("retention removed {removed} cycle checkpoints");
        }
        Ok(removed)
    }

    /// Cycle indices with a checkpoint on disk.
    pub fn existing_cycles(&self) -> Result<Vec<usize>> {
        let pattern = self.root.join("cycle-*").to_string_lossy().into_owned();
        let mut cycles = Vec::new();
        for path in glob::glob(&pattern)
            .map_err(|e| TrainingError::Config(format!("bad checkpoint glob: {e}")))?
            .flatten()
        {
            if let Some(rest) = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("cycle-"))
            {
                if let Ok(cycle) = rest.parse::<usize>() {
                    cycles.push(cycle);
                }
            }
        }
        Ok(cycles)
    }

    /// Restore a checkpoint by symbolic name (`best`, `last`,
    /// `cycle-<k>`) into the learner: θ, θ̂ ← θ, optimizer state. Returns
    /// the stored metadata (cycle counter included).
    pub fn load_into(&self, name: &str, learner: &mut DqnLearner) -> Result<CheckpointMeta> {
        let dir = self.resolve(name)?;
        let meta: CheckpointMeta = serde_json::from_slice(&fs::read(dir.join(META_FILE))?)?;
        learner.load_params(dir.join(PARAMS_FILE))?;
        learner.load_optimizer(dir.join(OPT_FILE))?;
        Ok(meta)
    }

    fn resolve(&self, name: &str) -> Result<PathBuf> {
        let dir = match name {
            "best" => self.best_dir(),
            "last" => {
                let pointer = self.read_pointer()?.ok_or_else(|| {
                    TrainingError::Config("no pointer.json; nothing to resume".into())
                })?;
                self.cycle_dir(pointer.last_cycle)
            }
            other => self.root.join(other),
        };
        if !dir.join(PARAMS_FILE).exists() {
            return Err(TrainingError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("checkpoint '{name}' not found under {}", self.root.display()),
            )));
        }
        Ok(dir)
    }

    pub fn read_pointer(&self) -> Result<Option<PointerFile>> {
        let path = self.root.join(POINTER_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&fs::read(path)?)?))
    }

    fn write_pointer(&self, pointer: &PointerFile) -> Result<()> {
        let path = self.root.join(POINTER_FILE);
        let tmp = self.root.join(".pointer.json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(pointer)?)?;
        fsync_file(&tmp)?;
        fs::rename(&tmp, &path)?;
        fsync_dir(&self.root)?;
        Ok(())
    }
}

fn fsync_file(path: &Path) -> Result<()> {
    fs::File::open(path)?.sync_all()?;
    Ok(())
}

fn fsync_dir(path: &Path) -> Result<()> {
    // Directory fsync is best-effort on platforms that refuse it.
    if let Ok(dir) = fs::File::open(path) {
        let _ = dir.sync_all();
    }
    Ok(())
}

fn copy_dir(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let to = dst.join(entry.file_name());
        fs::copy(entry.path(), &to)?;
        fsync_file(&to)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn tiny_cfg() -> TrainingConfig {
        let mut cfg = TrainingConfig::fast_debug();
        cfg.hidden_layers = vec![8];
        cfg.keep_last_checkpoints = 2;
        cfg.keep_every_nth_checkpoint = 5;
        cfg
    }

    fn learner(cfg: &TrainingConfig, seed: u64) -> DqnLearner {
        DqnLearner::new(cfg, seed).unwrap()
    }

    fn save(mgr: &CheckpointManager, cfg: &TrainingConfig, l: &DqnLearner, cycle: usize) {
        let meta = CheckpointMeta::new(cfg, 1, cycle, 0.5);
        mgr.save_cycle(l, &meta).unwrap();
    }

    #[test]
    fn save_then_load_round_trips_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_cfg();
        let mgr = CheckpointManager::new(dir.path(), &cfg).unwrap();
        let mut l = learner(&cfg, 1);
        save(&mgr, &cfg, &l, 3);

        let meta = mgr.load_into("cycle-3", &mut l).unwrap();
        assert_eq!(meta.cycle, 3);
        assert_eq!(meta.hidden_layers, vec![8]);
        let pointer = mgr.read_pointer().unwrap().unwrap();
        assert_eq!(pointer.last_cycle, 3);
    }

    #[test]
    fn params_survive_save_load_save_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_cfg();
        let mgr = CheckpointManager::new(dir.path(), &cfg).unwrap();
        let mut l = learner(&cfg, 1);
        save(&mgr, &cfg, &l, 1);
        let first = fs::read(mgr.cycle_dir(1).join(PARAMS_FILE)).unwrap();

        mgr.load_into("cycle-1", &mut l).unwrap();
        save(&mgr, &cfg, &l, 2);
        let second = fs::read(mgr.cycle_dir(2).join(PARAMS_FILE)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn promotion_creates_best_and_updates_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_cfg();
        let mgr = CheckpointManager::new(dir.path(), &cfg).unwrap();
        let l = learner(&cfg, 1);
        save(&mgr, &cfg, &l, 1);
        assert!(!mgr.has_best());

        mgr.promote(1, 0.6).unwrap();
        assert!(mgr.has_best());
        let pointer = mgr.read_pointer().unwrap().unwrap();
        assert_eq!(pointer.best_cycle, Some(1));
        assert_eq!(pointer.best_outcome_score, 0.6);
        // The canonical copy matches the cycle checkpoint.
        let best = fs::read(mgr.best_dir().join(PARAMS_FILE)).unwrap();
        let cycle = fs::read(mgr.cycle_dir(1).join(PARAMS_FILE)).unwrap();
        assert_eq!(best, cycle);
    }

    #[test]
    fn retention_keeps_best_recent_and_every_nth() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_cfg(); // keep_last=2, every 5th
        let mgr = CheckpointManager::new(dir.path(), &cfg).unwrap();
        let l = learner(&cfg, 1);
        for cycle in 1..=7 {
            save(&mgr, &cfg, &l, cycle);
        }
        mgr.promote(3, 0.7).unwrap();
        mgr.cleanup().unwrap();

        let mut kept = mgr.existing_cycles().unwrap();
        kept.sort_unstable();
        // best=3, recent={6,7}, every 5th={5}.
        assert_eq!(kept, vec![3, 5, 6, 7]);
        assert!(mgr.has_best());
    }

    #[test]
    fn load_missing_checkpoint_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_cfg();
        let mgr = CheckpointManager::new(dir.path(), &cfg).unwrap();
        let mut l = learner(&cfg, 1);
        assert_matches!(
            mgr.load_into("best", &mut l).unwrap_err(),
            TrainingError::Io(_)
        );
    }

    #[test]
    fn architecture_mismatch_does_not_clobber_state() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_cfg();
        let mgr = CheckpointManager::new(dir.path(), &cfg).unwrap();
        let l = learner(&cfg, 1);
        save(&mgr, &cfg, &l, 1);

        let mut wide_cfg = cfg.clone();
        wide_cfg.hidden_layers = vec![16];
        let mut wide = learner(&wide_cfg, 2);
        assert_matches!(
            mgr.load_into("cycle-1", &mut wide).unwrap_err(),
            TrainingError::ArchitectureMismatch { .. }
        );
    }

    #[test]
    fn no_temp_dirs_survive_a_successful_save() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = tiny_cfg();
        let mgr = CheckpointManager::new(dir.path(), &cfg).unwrap();
        let l = learner(&cfg, 1);
        save(&mgr, &cfg, &l, 1);
        mgr.promote(1, 0.5).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
    }
}
