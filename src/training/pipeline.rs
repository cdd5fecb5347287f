//! The training pipeline: snapshot → self-play → ingest → train →
//! evaluate → checkpoint, cycle after cycle.
//!
//! The control plane is single-threaded; everything mutable lives here.
//! One `run_seed` derives every RNG stream in the system, so a run is
//! reproducible from its config line. Cycle-level failures (worker
//! shortfall, numerical trouble, checkpoint I/O) abort the cycle and the
//! run continues; encoding violations abort the run.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use rand::Rng;

use super::evaluator::{self, EvaluationOutcome};
use super::metrics::{self, CycleMetrics, GameStats};
use crate::checkpoint::{CheckpointManager, CheckpointMeta};
use crate::config::TrainingConfig;
use crate::error::{Result, TrainingError};
use crate::neural::DqnLearner;
use crate::replay::experience::ExperienceManager;
use crate::selfplay::SelfPlayOrchestrator;

/// Control files honored at cycle boundaries.
const PAUSE_FILE: &str = "PAUSE";
const STOP_FILE: &str = "STOP";

const PAUSE_POLL: Duration = Duration::from_millis(500);

/// Convergence needs the rolling outcome score stable within this band.
const STALL_BAND: f64 = 0.02;

/// Top-level run state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Init,
    Running,
    Paused,
    Stopped,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    MaxCycles,
    Converged,
    UserRequested,
}

/// Immutable per-run context threaded through the pipeline.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub cfg: TrainingConfig,
    pub run_seed: u64,
    pub checkpoint_root: PathBuf,
}

impl RunContext {
    fn selfplay_dir(&self, cycle: usize) -> PathBuf {
        self.checkpoint_root.join("selfplay").join(format!("cycle-{cycle}"))
    }

    fn metrics_path(&self) -> PathBuf {
        self.checkpoint_root.join("metrics.ndjson")
    }
}

/// What one cycle did, for logs and tests.
#[derive(Debug, Clone)]
pub struct CycleReport {
    pub cycle: usize,
    pub stats: GameStats,
    pub ingested: usize,
    pub batches_applied: usize,
    pub outcome_score: f64,
    pub promoted: bool,
    pub aborted: Option<String>,
}

pub struct TrainingPipeline {
    ctx: RunContext,
    learner: DqnLearner,
    orchestrator: SelfPlayOrchestrator,
    experience: ExperienceManager,
    checkpoints: CheckpointManager,
    state: RunState,
    cycle: usize,
    last_saved_cycle: Option<usize>,
    score_window: VecDeque<f64>,
    entropy_window: VecDeque<f64>,
}

impl TrainingPipeline {
    /// Validate config, derive the run seed, allocate networks and
    /// buffers. Nothing is allocated if validation fails.
    pub fn new(cfg: TrainingConfig) -> Result<Self> {
        cfg.validate()?;
        let run_seed = cfg.seed.unwrap_or_else(|| rand::rng().random::<u64>());
        log::info!(
            "run seed {run_seed} (configured: {}), config fingerprint {:016x}",
            cfg.seed.map_or("random".to_string(), |s| s.to_string()),
            cfg.fingerprint()
        );

        let checkpoint_root = PathBuf::from(&cfg.checkpoint_directory);
        let ctx = RunContext {
            cfg: cfg.clone(),
            run_seed,
            checkpoint_root: checkpoint_root.clone(),
        };

        Ok(TrainingPipeline {
            learner: DqnLearner::new(&cfg, run_seed)?,
            orchestrator: SelfPlayOrchestrator::new(&cfg, run_seed),
            experience: ExperienceManager::new(&cfg, run_seed),
            checkpoints: CheckpointManager::new(checkpoint_root, &cfg)?,
            ctx,
            state: RunState::Init,
            cycle: 1,
            last_saved_cycle: None,
            score_window: VecDeque::new(),
            entropy_window: VecDeque::new(),
        })
    }

    /// Build a pipeline and restore a named checkpoint (`last`, `best`,
    /// `cycle-<k>`). The cycle counter continues from the stored one.
    pub fn resume(cfg: TrainingConfig, name: &str) -> Result<Self> {
        let mut pipeline = Self::new(cfg)?;
        let meta = pipeline.checkpoints.load_into(name, &mut pipeline.learner)?;
        if meta.config_fingerprint != pipeline.ctx.cfg.fingerprint() {
            log::warn!(
                "config fingerprint changed since checkpoint {} ({:016x} -> {:016x})",
                meta.cycle,
                meta.config_fingerprint,
                pipeline.ctx.cfg.fingerprint()
            );
        }
        pipeline.cycle = meta.cycle + 1;
        pipeline.last_saved_cycle = Some(meta.cycle);
        log::info!("resumed from '{name}' at cycle {}; continuing with cycle {}", meta.cycle, pipeline.cycle);
        Ok(pipeline)
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn current_cycle(&self) -> usize {
        self.cycle
    }

    /// Drive cycles until max-cycles, convergence, or a user stop. Always
    /// leaves a final checkpoint behind, even on a forced abort.
    pub fn run(&mut self) -> Result<StopReason> {
        self.state = RunState::Running;
        log::info!("state INIT -> RUNNING");

        let reason = loop {
            if self.cycle > self.ctx.cfg.max_cycles {
                break StopReason::MaxCycles;
            }
            if self.consume_stop_request() {
                break StopReason::UserRequested;
            }
            self.wait_while_paused();
            if self.consume_stop_request() {
                break StopReason::UserRequested;
            }

            let result = self.run_cycle();
            match result {
                Ok(report) => {
                    if report.aborted.is_none() {
                        self.push_convergence_sample(report.outcome_score);
                        if self.converged() {
                            break StopReason::Converged;
                        }
                    }
                }
                Err(err) => {
                    // Fatal: still write the final checkpoint before
                    // surfacing the error.
                    log::error!("fatal error in cycle {}: {err}", self.cycle);
                    self.write_final_checkpoint();
                    self.state = RunState::Stopped;
                    return Err(err);
                }
            }
            self.cycle += 1;
        };

        self.write_final_checkpoint();
        self.state = RunState::Stopped;
        log::info!("state RUNNING -> STOPPED ({reason:?})");
        Ok(reason)
    }

    /// One full cycle. `Ok` with `aborted: Some(..)` is a cycle-level
    /// failure: nothing was checkpointed, the run continues.
    pub fn run_cycle(&mut self) -> Result<CycleReport> {
        let started = Instant::now();
        let cycle = self.cycle;
        let cfg = self.ctx.cfg.clone();
        log::info!("cycle {cycle} starting");

        let work_dir = self.ctx.selfplay_dir(cycle);
        std::fs::create_dir_all(&work_dir)?;
        let snapshot = work_dir.join("snapshot.safetensors");
        self.learner.save_params(&snapshot)?;

        // Self-play against the frozen snapshot.
        let games = match self.orchestrator.run_cycle(&snapshot, &work_dir, cycle) {
            Ok(games) => games,
            Err(TrainingError::Worker { reason, .. }) => {
                return self.abort_cycle(cycle, started, GameStats::default(), 0, reason);
            }
            Err(other) => return Err(other),
        };
        let stats = metrics::summarize_games(&games.results);
        let failed_workers = games.failed_workers;
        let ingest_fingerprint = format!("{:016x}", games.ingest_fingerprint);

        // Ingest. Encoding violations here are programming bugs and fatal.
        let mut ingested = 0usize;
        for game in &games.results {
            ingested += self.experience.ingest(game)?;
        }
        log::debug!(
            "cycle {cycle}: {} games, {ingested} transitions ingested (order {ingest_fingerprint})",
            stats.games
        );

        // Train.
        let planned = ((ingested as f64 / cfg.train_ratio).ceil() as usize)
            .min(cfg.max_batches_per_cycle);
        let mut batches_applied = 0usize;
        let mut loss_sum = 0.0;
        let mut td_sum = 0.0;
        let mut grad_sum = 0.0;
        let mut entropy_sum = 0.0;
        for _ in 0..planned {
            let batch = self.experience.sample(cfg.batch_size);
            if batch.is_empty() {
                break;
            }
            let indices = batch.indices.clone();
            match self.learner.train_batch(batch) {
                Ok(update) if update.applied => {
                    loss_sum += update.loss;
                    td_sum += update.td_abs_mean;
                    grad_sum += update.grad_norm;
                    entropy_sum += update.mean_entropy;
                    batches_applied += 1;
                    if let Some(priorities) = &update.updated_priorities {
                        self.experience.update_priorities(&indices, priorities);
                    }
                }
                Ok(_) => {} // numerically skipped update
                Err(TrainingError::Numerical(msg)) => {
                    log::error!("cycle {cycle} aborted by numerical failures: {msg}");
                    self.restore_last_checkpoint();
                    return self.abort_cycle(cycle, started, stats, failed_workers, msg);
                }
                Err(other) => return Err(other),
            }
        }

        // Head-to-head against the current best; the first cycle promotes
        // vacuously.
        let candidate = work_dir.join("candidate.safetensors");
        self.learner.save_params(&candidate)?;
        let (evaluation, promoted) = if self.checkpoints.has_best() {
            let outcome = evaluator::head_to_head(
                &candidate,
                &self.checkpoints.best_params_path(),
                &cfg,
                self.ctx.run_seed ^ cycle as u64,
                cfg.evaluation_games,
            )?;
            let promote = evaluator::should_promote(outcome.outcome_score());
            log::info!(
                "cycle {cycle} evaluation: {}W/{}D/{}L score {:.3} -> {}",
                outcome.wins,
                outcome.draws,
                outcome.losses,
                outcome.outcome_score(),
                if promote { "promote" } else { "keep best" }
            );
            (outcome, promote)
        } else {
            log::info!("cycle {cycle}: no best yet; promoting vacuously");
            (EvaluationOutcome::default(), true)
        };
        let outcome_score = evaluation.outcome_score();

        // Persist: cycle checkpoint, promotion first, retention after.
        let save_due =
            promoted || cycle % cfg.checkpoint_interval == 0 || cycle == cfg.max_cycles;
        if save_due {
            let meta = CheckpointMeta::new(&cfg, self.ctx.run_seed, cycle, outcome_score);
            match self.checkpoints.save_cycle(&self.learner, &meta) {
                Ok(_) => {
                    self.last_saved_cycle = Some(cycle);
                    if promoted {
                        self.checkpoints.promote(cycle, outcome_score)?;
                    }
                    self.checkpoints.cleanup()?;
                }
                Err(TrainingError::Io(err)) => {
                    // Second failure after the internal retry: abort the
                    // cycle, keep in-memory state for the operator.
                    let reason = format!("checkpoint write failed twice: {err}");
                    log::error!("cycle {cycle}: {reason}");
                    return self.abort_cycle(cycle, started, stats, failed_workers, reason);
                }
                Err(other) => return Err(other),
            }
        }

        let report = CycleReport {
            cycle,
            stats,
            ingested,
            batches_applied,
            outcome_score,
            promoted,
            aborted: None,
        };
        let denom = batches_applied.max(1) as f64;
        self.entropy_window_push(entropy_sum / denom);
        metrics::append_metrics(
            &self.ctx.metrics_path(),
            &CycleMetrics {
                cycle,
                loss_mean: loss_sum / denom,
                td_mean: td_sum / denom,
                grad_norm_mean: grad_sum / denom,
                entropy_mean: entropy_sum / denom,
                games: stats.games,
                wins: stats.wins,
                draws: stats.draws,
                losses: stats.losses,
                step_limit: stats.step_limit,
                avg_length: stats.avg_length,
                outcome_score,
                promoted,
                wall_seconds: started.elapsed().as_secs_f64(),
                failed_workers,
                ingest_fingerprint,
                aborted: None,
            },
        )?;

        // Transient worker output is no longer needed.
        let _ = std::fs::remove_dir_all(&work_dir);

        log::info!(
            "cycle {cycle} done: {} games, {batches_applied} updates, score {outcome_score:.3}{}",
            stats.games,
            if promoted { ", promoted" } else { "" }
        );
        Ok(report)
    }

    /// Cycle-level abort: metrics line with the reason, no checkpoint, no
    /// buffer side effects beyond what already happened.
    fn abort_cycle(
        &mut self,
        cycle: usize,
        started: Instant,
        stats: GameStats,
        failed_workers: usize,
        reason: String,
    ) -> Result<CycleReport> {
        metrics::append_metrics(
            &self.ctx.metrics_path(),
            &CycleMetrics {
                cycle,
                games: stats.games,
                wins: stats.wins,
                draws: stats.draws,
                losses: stats.losses,
                step_limit: stats.step_limit,
                avg_length: stats.avg_length,
                outcome_score: 0.0,
                wall_seconds: started.elapsed().as_secs_f64(),
                failed_workers,
                ingest_fingerprint: String::new(),
                aborted: Some(reason.clone()),
                ..Default::default()
            },
        )?;
        let _ = std::fs::remove_dir_all(self.ctx.selfplay_dir(cycle));
        log::warn!("cycle {cycle} aborted: {reason}");
        Ok(CycleReport {
            cycle,
            stats,
            ingested: 0,
            batches_applied: 0,
            outcome_score: 0.0,
            promoted: false,
            aborted: Some(reason),
        })
    }

    fn restore_last_checkpoint(&mut self) {
        if self.last_saved_cycle.is_some() {
            match self.checkpoints.load_into("last", &mut self.learner) {
                Ok(meta) => log::info!("restored checkpoint from cycle {}", meta.cycle),
                Err(err) => log::error!("failed to restore last checkpoint: {err}"),
            }
        }
    }

    /// A final `last` checkpoint on the way out, unless the current
    /// parameters are already on disk.
    fn write_final_checkpoint(&mut self) {
        let cycle = self.cycle.saturating_sub(1).max(1);
        if self.last_saved_cycle == Some(cycle) {
            return;
        }
        let meta = CheckpointMeta::new(&self.ctx.cfg, self.ctx.run_seed, cycle, 0.0);
        match self.checkpoints.save_cycle(&self.learner, &meta) {
            Ok(_) => {
                self.last_saved_cycle = Some(cycle);
                log::info!("final checkpoint written for cycle {cycle}");
            }
            Err(err) => log::error!("failed to write final checkpoint: {err}"),
        }
    }

    fn consume_stop_request(&self) -> bool {
        let stop = self.ctx.checkpoint_root.join(STOP_FILE);
        if stop.exists() {
            let _ = std::fs::remove_file(&stop);
            log::info!("stop requested; honoring at cycle boundary");
            return true;
        }
        false
    }

    fn wait_while_paused(&mut self) {
        let pause = self.ctx.checkpoint_root.join(PAUSE_FILE);
        if !pause.exists() {
            return;
        }
        self.state = RunState::Paused;
        log::info!("state RUNNING -> PAUSED");
        while pause.exists() && !self.ctx.checkpoint_root.join(STOP_FILE).exists() {
            std::thread::sleep(PAUSE_POLL);
        }
        self.state = RunState::Running;
        log::info!("state PAUSED -> RUNNING");
    }

    fn push_convergence_sample(&mut self, outcome_score: f64) {
        if self.score_window.len() == self.ctx.cfg.stall_window {
            self.score_window.pop_front();
        }
        self.score_window.push_back(outcome_score);
    }

    fn entropy_window_push(&mut self, entropy: f64) {
        if self.entropy_window.len() == self.ctx.cfg.stall_window {
            self.entropy_window.pop_front();
        }
        self.entropy_window.push_back(entropy);
    }

    /// Stable rolling outcome score AND healthy entropy.
    fn converged(&self) -> bool {
        if self.score_window.len() < self.ctx.cfg.stall_window {
            return false;
        }
        let max = self.score_window.iter().cloned().fold(f64::MIN, f64::max);
        let min = self.score_window.iter().cloned().fold(f64::MAX, f64::min);
        if max - min > STALL_BAND {
            return false;
        }
        let entropy_mean =
            self.entropy_window.iter().sum::<f64>() / self.entropy_window.len().max(1) as f64;
        entropy_mean > self.ctx.cfg.entropy_floor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tiny_cfg(dir: &std::path::Path) -> TrainingConfig {
        let mut cfg = TrainingConfig::fast_debug();
        cfg.hidden_layers = vec![8];
        cfg.games_per_cycle = 2;
        cfg.max_concurrent_games = 1;
        cfg.max_steps_per_game = 10;
        cfg.batch_size = 4;
        cfg.evaluation_games = 2;
        cfg.max_cycles = 1;
        cfg.seed = Some(1234);
        cfg.checkpoint_directory = dir.join("ckpt").to_string_lossy().into_owned();
        cfg
    }

    #[test]
    fn invalid_config_allocates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = tiny_cfg(dir.path());
        cfg.learning_rate = -1.0;
        assert!(TrainingPipeline::new(cfg).is_err());
        assert!(!dir.path().join("ckpt").exists());
    }

    #[test]
    fn pipeline_starts_in_init() {
        let dir = tempfile::tempdir().unwrap();
        let pipeline = TrainingPipeline::new(tiny_cfg(dir.path())).unwrap();
        assert_eq!(pipeline.state(), RunState::Init);
        assert_eq!(pipeline.current_cycle(), 1);
    }

    #[test]
    fn convergence_needs_full_window_and_entropy() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = tiny_cfg(dir.path());
        cfg.stall_window = 3;
        cfg.entropy_floor = 0.1;
        let mut pipeline = TrainingPipeline::new(cfg).unwrap();

        pipeline.push_convergence_sample(0.5);
        pipeline.entropy_window_push(1.0);
        assert!(!pipeline.converged());

        for _ in 0..3 {
            pipeline.push_convergence_sample(0.5);
            pipeline.entropy_window_push(1.0);
        }
        assert!(pipeline.converged());

        // A swing outside the band resets the verdict.
        pipeline.push_convergence_sample(0.9);
        assert!(!pipeline.converged());
    }

    #[test]
    fn convergence_blocked_by_collapsed_entropy() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = tiny_cfg(dir.path());
        cfg.stall_window = 2;
        let mut pipeline = TrainingPipeline::new(cfg).unwrap();
        for _ in 0..2 {
            pipeline.push_convergence_sample(0.5);
            pipeline.entropy_window_push(0.0);
        }
        assert!(!pipeline.converged());
    }
}
