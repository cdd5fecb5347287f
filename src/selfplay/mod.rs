//! Self-play orchestration.
//!
//! Workers run as independent OS processes over a frozen snapshot file;
//! the parent shares nothing with them but the filesystem. If spawning is
//! impossible the orchestrator falls back to sequential in-process
//! execution of the same worker loop. Multi-threaded shared-agent
//! execution is deliberately not an option.

pub mod codec;
pub mod game;
pub mod worker;

pub use game::{GameOutcome, GameResult, TerminationReason};

use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::config::TrainingConfig;
use crate::error::{Result, TrainingError};
use worker::{WorkerArgs, WorkerSpec, CANCEL_SENTINEL};

/// Salt folded into the run seed for the pairing RNG stream.
pub const PAIRING_SALT: u64 = 0x9a1b_37f2_44c8_06e5;

/// How long workers get to wind down after a cancel sentinel appears.
const CANCEL_GRACE: Duration = Duration::from_secs(2);

const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One worker's slice of a cycle.
#[derive(Debug, Clone)]
pub struct WorkerAssignment {
    pub worker_id: usize,
    pub games: usize,
    pub first_color_white: bool,
    pub episode_base: u64,
    pub seed: u64,
}

/// How a worker ended, in completion order.
#[derive(Debug, Clone)]
pub enum WorkerStatus {
    Completed,
    Failed(String),
}

/// Everything one self-play cycle produced.
#[derive(Debug)]
pub struct CycleGames {
    /// Game results in ingestion order (worker completion order, game
    /// order within a worker).
    pub results: Vec<GameResult>,
    pub requested: usize,
    pub failed_workers: usize,
    /// Stable hash over the ingestion order, for cross-run audits.
    pub ingest_fingerprint: u64,
}

pub struct SelfPlayOrchestrator {
    cfg: TrainingConfig,
    run_seed: u64,
}

impl SelfPlayOrchestrator {
    pub fn new(cfg: &TrainingConfig, run_seed: u64) -> Self {
        if let Ok(cores) = std::thread::available_parallelism() {
            if cfg.max_concurrent_games > cores.get() {
                log::warn!(
                    "maxConcurrentGames ({}) exceeds physical cores ({}); workers will contend",
                    cfg.max_concurrent_games,
                    cores.get()
                );
            }
        }
        SelfPlayOrchestrator {
            cfg: cfg.clone(),
            run_seed,
        }
    }

    /// Generate this cycle's games. Fails only when fewer than half the
    /// requested games complete; individual worker failures just shrink
    /// the result set.
    pub fn run_cycle(
        &mut self,
        snapshot: &Path,
        work_dir: &Path,
        cycle: usize,
    ) -> Result<CycleGames> {
        let requested = self.cfg.games_per_cycle;
        if requested == 0 {
            return Ok(CycleGames {
                results: Vec::new(),
                requested,
                failed_workers: 0,
                ingest_fingerprint: 0,
            });
        }

        let assignments = self.plan_assignments(cycle);
        std::fs::create_dir_all(work_dir)?;

        // Operational escape hatch (and the path harness tests exercise):
        // skip process spawning entirely.
        let force_sequential = std::env::var_os("CHESS_DQN_SEQUENTIAL").is_some();
        let statuses = if force_sequential {
            self.run_sequential(&assignments, snapshot, work_dir)
        } else {
            match self.spawn_workers(&assignments, snapshot, work_dir) {
                Ok(statuses) => statuses,
                Err(err) => {
                    log::warn!("process workers unavailable ({err}); falling back to sequential");
                    self.run_sequential(&assignments, snapshot, work_dir)
                }
            }
        };

        collect_cycle(&assignments, &statuses, work_dir, requested)
    }

    /// Split the cycle's games into per-worker chunks. Colors alternate
    /// over the global game index; the pairing RNG shuffles which worker
    /// plays which chunk. The RNG is re-derived per cycle so a resumed
    /// run plans cycle k exactly like the original run did.
    fn plan_assignments(&mut self, cycle: usize) -> Vec<WorkerAssignment> {
        let games = self.cfg.games_per_cycle;
        let workers = self.cfg.max_concurrent_games.min(games).max(1);
        let mut pairing_rng = StdRng::seed_from_u64(
            self.run_seed ^ PAIRING_SALT ^ (cycle as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15),
        );

        let mut chunks = Vec::with_capacity(workers);
        let mut start = 0usize;
        for i in 0..workers {
            let count = games / workers + usize::from(i < games % workers);
            chunks.push((start, count));
            start += count;
        }
        chunks.shuffle(&mut pairing_rng);

        chunks
            .into_iter()
            .enumerate()
            .map(|(worker_id, (start, count))| WorkerAssignment {
                worker_id,
                games: count,
                first_color_white: start % 2 == 0,
                episode_base: cycle as u64 * 1_000_000 + start as u64,
                seed: self.run_seed ^ worker_id as u64,
            })
            .collect()
    }

    fn spawn_workers(
        &self,
        assignments: &[WorkerAssignment],
        snapshot: &Path,
        work_dir: &Path,
    ) -> std::io::Result<Vec<(usize, WorkerStatus)>> {
        let exe = std::env::current_exe()?;
        let mut children: Vec<Option<(usize, Child)>> = Vec::with_capacity(assignments.len());

        for assignment in assignments {
            let out_dir = worker_dir(work_dir, assignment.worker_id);
            std::fs::create_dir_all(&out_dir)?;
            let spec = WorkerSpec {
                training: self.cfg.clone(),
                first_color_white: assignment.first_color_white,
                episode_base: assignment.episode_base,
            };
            let spec_json = serde_json::to_string(&spec)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

            let spawned = Command::new(&exe)
                .arg("--worker")
                .arg("--snapshot")
                .arg(snapshot)
                .arg("--seed")
                .arg(assignment.seed.to_string())
                .arg("--out")
                .arg(&out_dir)
                .arg("--games")
                .arg(assignment.games.to_string())
                .arg("--config")
                .arg(&spec_json)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .spawn();

            match spawned {
                Ok(child) => children.push(Some((assignment.worker_id, child))),
                Err(err) => {
                    // Abort process mode entirely; the caller falls back.
                    for slot in children.iter_mut().flatten() {
                        let _ = slot.1.kill();
                        let _ = slot.1.wait();
                    }
                    return Err(err);
                }
            }
        }

        Ok(self.wait_for_workers(children, work_dir))
    }

    /// Reap children in completion order under the cycle budget. Budget
    /// expiry drops a cancel sentinel, waits out a grace period, then
    /// kills stragglers.
    fn wait_for_workers(
        &self,
        mut children: Vec<Option<(usize, Child)>>,
        work_dir: &Path,
    ) -> Vec<(usize, WorkerStatus)> {
        let deadline = Instant::now() + Duration::from_secs(self.cfg.cycle_timeout_secs);
        let mut finished = Vec::new();
        let mut cancel_sent = false;
        let mut kill_at: Option<Instant> = None;

        while children.iter().any(Option::is_some) {
            for slot in children.iter_mut() {
                let Some((worker_id, child)) = slot.as_mut() else {
                    continue;
                };
                match child.try_wait() {
                    Ok(Some(status)) => {
                        let outcome = if status.success() {
                            WorkerStatus::Completed
                        } else {
                            WorkerStatus::Failed(format!("exit status {status}"))
                        };
                        finished.push((*worker_id, outcome));
                        *slot = None;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        finished.push((*worker_id, WorkerStatus::Failed(err.to_string())));
                        *slot = None;
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline && !cancel_sent {
                log::warn!("cycle budget exhausted; cancelling remaining workers");
                for slot in children.iter().flatten() {
                    let sentinel = worker_dir(work_dir, slot.0).join(CANCEL_SENTINEL);
                    let _ = std::fs::write(sentinel, b"cycle budget exhausted");
                }
                cancel_sent = true;
                kill_at = Some(now + CANCEL_GRACE);
            }
            if let Some(kill_deadline) = kill_at {
                if now >= kill_deadline {
                    for slot in children.iter_mut() {
                        if let Some((worker_id, child)) = slot {
                            let _ = child.kill();
                            let _ = child.wait();
                            finished
                                .push((*worker_id, WorkerStatus::Failed("cycle timeout".into())));
                            *slot = None;
                        }
                    }
                    break;
                }
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        finished
    }

    /// In-process fallback: the same worker loop, one assignment at a
    /// time. No shared mutable agents exist even here because each call
    /// loads its own frozen snapshot.
    fn run_sequential(
        &self,
        assignments: &[WorkerAssignment],
        snapshot: &Path,
        work_dir: &Path,
    ) -> Vec<(usize, WorkerStatus)> {
        let mut statuses = Vec::with_capacity(assignments.len());
        for assignment in assignments {
            let args = WorkerArgs {
                snapshot: snapshot.to_path_buf(),
                seed: assignment.seed,
                out_dir: worker_dir(work_dir, assignment.worker_id),
                games: assignment.games,
                spec: WorkerSpec {
                    training: self.cfg.clone(),
                    first_color_white: assignment.first_color_white,
                    episode_base: assignment.episode_base,
                },
            };
            let status = match worker::run_worker(&args) {
                Ok(_) => WorkerStatus::Completed,
                Err(err) => WorkerStatus::Failed(err.to_string()),
            };
            statuses.push((assignment.worker_id, status));
        }
        statuses
    }
}

pub(crate) fn worker_dir(work_dir: &Path, worker_id: usize) -> PathBuf {
    work_dir.join(format!("worker-{worker_id}"))
}

/// Gather every surviving game in completion order and enforce the
/// half-completion threshold. Nothing is ingested anywhere yet, so an
/// abort here leaves the replay buffer untouched.
pub fn collect_cycle(
    assignments: &[WorkerAssignment],
    statuses: &[(usize, WorkerStatus)],
    work_dir: &Path,
    requested: usize,
) -> Result<CycleGames> {
    let mut results = Vec::new();
    let mut failed_workers = 0usize;
    let mut order = Vec::new();

    for (worker_id, status) in statuses {
        let assignment = assignments
            .iter()
            .find(|a| a.worker_id == *worker_id)
            .expect("status refers to a planned worker");
        match status {
            WorkerStatus::Completed => {
                let games =
                    worker::read_worker_output(&worker_dir(work_dir, *worker_id), assignment.games);
                for game in games {
                    order.push((*worker_id, game.episode_id));
                    results.push(game);
                }
            }
            WorkerStatus::Failed(reason) => {
                log::warn!("worker {worker_id} failed: {reason}; dropping its games");
                failed_workers += 1;
            }
        }
    }

    let ingest_fingerprint = fingerprint(&order);
    log::info!(
        "collected {}/{} games from {} workers (failed: {}), ingest order fingerprint {:016x}",
        results.len(),
        requested,
        statuses.len(),
        failed_workers,
        ingest_fingerprint
    );

    if results.len() * 2 < requested {
        return Err(TrainingError::Worker {
            worker_id: usize::MAX,
            reason: format!(
                "only {}/{} games completed (threshold 50%)",
                results.len(),
                requested
            ),
        });
    }

    Ok(CycleGames {
        results,
        requested,
        failed_workers,
        ingest_fingerprint,
    })
}

fn fingerprint(order: &[(usize, u64)]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for (worker_id, episode_id) in order {
        for byte in (*worker_id as u64)
            .to_le_bytes()
            .into_iter()
            .chain(episode_id.to_le_bytes())
        {
            hash ^= byte as u64;
            hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Agent;
    use assert_matches::assert_matches;

    fn small_cfg() -> TrainingConfig {
        let mut cfg = TrainingConfig::fast_debug();
        cfg.hidden_layers = vec![8];
        cfg.max_steps_per_game = 10;
        cfg.games_per_cycle = 4;
        cfg.max_concurrent_games = 2;
        cfg
    }

    fn write_worker_games(
        cfg: &TrainingConfig,
        snapshot: &Path,
        work_dir: &Path,
        assignment: &WorkerAssignment,
    ) {
        let args = WorkerArgs {
            snapshot: snapshot.to_path_buf(),
            seed: assignment.seed,
            out_dir: worker_dir(work_dir, assignment.worker_id),
            games: assignment.games,
            spec: WorkerSpec {
                training: cfg.clone(),
                first_color_white: assignment.first_color_white,
                episode_base: assignment.episode_base,
            },
        };
        worker::run_worker(&args).unwrap();
    }

    fn snapshot_file(dir: &Path, cfg: &TrainingConfig) -> PathBuf {
        tch::manual_seed(44);
        let agent = Agent::new(&cfg.hidden_layers, 0.0, 1);
        let path = dir.join("snapshot.safetensors");
        agent.save(&path).unwrap();
        path
    }

    #[test]
    fn assignments_cover_all_games_with_alternating_colors() {
        let cfg = small_cfg();
        let mut orch = SelfPlayOrchestrator::new(&cfg, 7);
        let assignments = orch.plan_assignments(1);
        assert_eq!(assignments.iter().map(|a| a.games).sum::<usize>(), 4);
        // Worker seeds follow worker ids regardless of chunk shuffling.
        for a in &assignments {
            assert_eq!(a.seed, 7 ^ a.worker_id as u64);
        }
    }

    #[test]
    fn pairing_shuffle_is_deterministic_per_seed() {
        let cfg = small_cfg();
        let plan = |seed: u64| {
            let mut orch = SelfPlayOrchestrator::new(&cfg, seed);
            let a = orch.plan_assignments(1);
            a.into_iter()
                .map(|x| (x.worker_id, x.episode_base))
                .collect::<Vec<_>>()
        };
        assert_eq!(plan(3), plan(3));
    }

    #[test]
    fn crash_of_one_worker_drops_only_its_games() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = small_cfg();
        let snapshot = snapshot_file(dir.path(), &cfg);
        let mut orch = SelfPlayOrchestrator::new(&cfg, 7);
        let assignments = orch.plan_assignments(1);

        write_worker_games(&cfg, &snapshot, dir.path(), &assignments[0]);
        // Worker 1 "crashed": no output, nonzero exit.
        let statuses = vec![
            (assignments[0].worker_id, WorkerStatus::Completed),
            (assignments[1].worker_id, WorkerStatus::Failed("exit status 1".into())),
        ];
        let cycle = collect_cycle(&assignments, &statuses, dir.path(), 4).unwrap();
        assert_eq!(cycle.failed_workers, 1);
        assert_eq!(cycle.results.len(), assignments[0].games);
    }

    #[test]
    fn below_half_completion_aborts_the_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = small_cfg();
        let mut orch = SelfPlayOrchestrator::new(&cfg, 7);
        let assignments = orch.plan_assignments(1);
        let statuses: Vec<_> = assignments
            .iter()
            .map(|a| (a.worker_id, WorkerStatus::Failed("boom".into())))
            .collect();
        let err = collect_cycle(&assignments, &statuses, dir.path(), 4).unwrap_err();
        assert_matches!(err, TrainingError::Worker { .. });
    }

    #[test]
    fn sequential_fallback_produces_a_full_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = small_cfg();
        let snapshot = snapshot_file(dir.path(), &cfg);
        let mut orch = SelfPlayOrchestrator::new(&cfg, 7);
        let assignments = orch.plan_assignments(1);
        let statuses = orch.run_sequential(&assignments, &snapshot, dir.path());
        let cycle = collect_cycle(&assignments, &statuses, dir.path(), 4).unwrap();
        assert_eq!(cycle.results.len(), 4);
        assert_eq!(cycle.failed_workers, 0);
        // Color fairness: two games as White, two as Black.
        let whites = cycle
            .results
            .iter()
            .filter(|g| g.learner_color == crate::chess::Color::White)
            .count();
        assert_eq!(whites, 2);
    }

    #[test]
    fn fingerprint_tracks_ingestion_order() {
        assert_ne!(
            fingerprint(&[(0, 1), (1, 2)]),
            fingerprint(&[(1, 2), (0, 1)])
        );
        assert_eq!(fingerprint(&[]), fingerprint(&[]));
    }
}
