use std::io::Write;
use std::path::PathBuf;

use clap::Parser;

use chess_dqn::agent::FrozenAgent;
use chess_dqn::chess::{Color, GameTermination, Move, PieceKind};
use chess_dqn::config::TrainingConfig;
use chess_dqn::env::{ChessEnvironment, RewardTable, StepInfo};
use chess_dqn::error::{Result, TrainingError};
use chess_dqn::logging::{setup_logging, setup_worker_logging};
use chess_dqn::selfplay::worker::{run_worker, WorkerArgs, WorkerSpec};
use chess_dqn::training::{against_baseline, head_to_head, BaselineOpponent, TrainingPipeline};

#[derive(Parser, Debug)]
#[command(name = "chess_dqn", about = "Self-play DQN training core for chess")]
struct Cli {
    /// Run the training pipeline
    #[arg(long)]
    train: bool,

    /// Evaluate a model (combine with --baseline or --compare)
    #[arg(long)]
    evaluate: bool,

    /// Play against a model in the terminal
    #[arg(long)]
    play: bool,

    /// Internal: run as a self-play worker subprocess
    #[arg(long, hide = true)]
    worker: bool,

    /// Named profile: fast-debug, long-train, eval-only
    #[arg(long)]
    profile: Option<String>,

    /// Run seed; random (and logged) when omitted
    #[arg(long)]
    seed: Option<u64>,

    /// Resume training from a checkpoint name (last, best, cycle-<k>)
    #[arg(long, num_args = 0..=1, default_missing_value = "last")]
    resume: Option<String>,

    // ---- config overrides (profile first, then these) ----
    #[arg(long)]
    games_per_cycle: Option<usize>,
    #[arg(long)]
    max_cycles: Option<usize>,
    #[arg(long)]
    max_concurrent_games: Option<usize>,
    #[arg(long)]
    max_steps_per_game: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f64>,
    #[arg(long)]
    checkpoint_dir: Option<String>,

    // ---- evaluation ----
    /// Evaluate against a scripted baseline opponent
    #[arg(long)]
    baseline: bool,

    /// Compare two models head to head
    #[arg(long)]
    compare: bool,

    /// Model parameters for --evaluate --baseline and --play
    #[arg(long)]
    model: Option<PathBuf>,

    #[arg(long)]
    model_a: Option<PathBuf>,
    #[arg(long)]
    model_b: Option<PathBuf>,

    /// Game count for evaluation modes
    #[arg(long)]
    games: Option<usize>,

    /// Baseline opponent kind
    #[arg(long, value_enum)]
    opponent: Option<OpponentArg>,

    /// Search depth for the minimax baseline
    #[arg(long)]
    depth: Option<u32>,

    // ---- play ----
    /// Side the human plays
    #[arg(long = "as", value_enum)]
    play_as: Option<ColorArg>,

    // ---- worker protocol ----
    #[arg(long, hide = true)]
    snapshot: Option<PathBuf>,
    #[arg(long, hide = true)]
    out: Option<PathBuf>,
    #[arg(long, hide = true)]
    config: Option<String>,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum OpponentArg {
    Heuristic,
    Minimax,
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ColorArg {
    White,
    Black,
}

fn main() {
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(()) => {}
        Err(err) => {
            eprintln!("error: {err} (see the run log for details)");
            std::process::exit(err.exit_code());
        }
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    if cli.worker {
        let _logger = setup_worker_logging();
        return worker_mode(&cli);
    }

    let cfg = build_config(&cli)?;
    let _logger = setup_logging(&cfg.log_directory);

    if cli.train {
        train_mode(&cli, cfg)
    } else if cli.evaluate {
        evaluate_mode(&cli, cfg)
    } else if cli.play {
        play_mode(&cli, cfg)
    } else {
        Err(TrainingError::Config(
            "no mode selected; use --train, --evaluate, or --play".into(),
        ))
    }
}

fn build_config(cli: &Cli) -> Result<TrainingConfig> {
    let mut cfg = match &cli.profile {
        Some(name) => TrainingConfig::profile(name)?,
        None => TrainingConfig::default(),
    };
    if cli.seed.is_some() {
        cfg.seed = cli.seed;
    }
    if let Some(v) = cli.games_per_cycle {
        cfg.games_per_cycle = v;
    }
    if let Some(v) = cli.max_cycles {
        cfg.max_cycles = v;
    }
    if let Some(v) = cli.max_concurrent_games {
        cfg.max_concurrent_games = v;
    }
    if let Some(v) = cli.max_steps_per_game {
        cfg.max_steps_per_game = v;
    }
    if let Some(v) = cli.batch_size {
        cfg.batch_size = v;
    }
    if let Some(v) = cli.learning_rate {
        cfg.learning_rate = v;
    }
    if let Some(v) = &cli.checkpoint_dir {
        cfg.checkpoint_directory = v.clone();
    }
    cfg.validate()?;
    Ok(cfg)
}

fn train_mode(cli: &Cli, cfg: TrainingConfig) -> Result<()> {
    let mut pipeline = match &cli.resume {
        Some(name) => TrainingPipeline::resume(cfg, name)?,
        None => TrainingPipeline::new(cfg)?,
    };
    let reason = pipeline.run()?;
    println!("training stopped: {reason:?}");
    Ok(())
}

fn evaluate_mode(cli: &Cli, cfg: TrainingConfig) -> Result<()> {
    let games = cli.games.unwrap_or(cfg.evaluation_games);
    let seed = cfg.seed.unwrap_or(0);

    if cli.compare {
        let (model_a, model_b) = match (&cli.model_a, &cli.model_b) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(TrainingError::Config(
                    "--compare needs --model-a and --model-b".into(),
                ))
            }
        };
        let outcome = head_to_head(model_a, model_b, &cfg, seed, games)?;
        println!(
            "{} vs {}: {}W/{}D/{}L over {} games, outcome score {:.3}",
            model_a.display(),
            model_b.display(),
            outcome.wins,
            outcome.draws,
            outcome.losses,
            outcome.games,
            outcome.outcome_score()
        );
        return Ok(());
    }

    if cli.baseline {
        let model = cli.model.as_ref().ok_or_else(|| {
            TrainingError::Config("--evaluate --baseline needs --model".into())
        })?;
        let opponent = match cli.opponent.unwrap_or(OpponentArg::Heuristic) {
            OpponentArg::Heuristic => BaselineOpponent::Heuristic,
            OpponentArg::Minimax => BaselineOpponent::Minimax {
                depth: cli.depth.unwrap_or(2),
            },
        };
        let outcome = against_baseline(model, opponent, &cfg, seed, games)?;
        println!(
            "{} vs {opponent:?}: {}W/{}D/{}L over {} games, outcome score {:.3}",
            model.display(),
            outcome.wins,
            outcome.draws,
            outcome.losses,
            outcome.games,
            outcome.outcome_score()
        );
        return Ok(());
    }

    Err(TrainingError::Config(
        "--evaluate needs --baseline or --compare".into(),
    ))
}

fn worker_mode(cli: &Cli) -> Result<()> {
    let (snapshot, out, config, games) =
        match (&cli.snapshot, &cli.out, &cli.config, cli.games) {
            (Some(s), Some(o), Some(c), Some(g)) => (s, o, c, g),
            _ => {
                return Err(TrainingError::Config(
                    "--worker needs --snapshot, --out, --config, and --games".into(),
                ))
            }
        };
    let spec: WorkerSpec = serde_json::from_str(config)?;
    let args = WorkerArgs {
        snapshot: snapshot.clone(),
        seed: cli.seed.unwrap_or(0),
        out_dir: out.clone(),
        games,
        spec,
    };
    run_worker(&args)?;
    Ok(())
}

// ============================================================================
// TERMINAL PLAY
// ============================================================================

fn play_mode(cli: &Cli, cfg: TrainingConfig) -> Result<()> {
    let model = cli
        .model
        .as_ref()
        .ok_or_else(|| TrainingError::Config("--play needs --model".into()))?;
    let human_color = match cli.play_as.unwrap_or(ColorArg::White) {
        ColorArg::White => Color::White,
        ColorArg::Black => Color::Black,
    };
    let agent = FrozenAgent::from_file(model, &cfg.hidden_layers, 0.0)?;
    let mut rng: rand::rngs::StdRng = rand::SeedableRng::seed_from_u64(cfg.seed.unwrap_or(0));
    let mut env = ChessEnvironment::new(RewardTable::from_config(&cfg), usize::MAX);
    env.reset();

    println!("You play {human_color:?}. Enter moves as from-to squares, e.g. e2e4.");
    loop {
        print_board(&env);
        let mover = env.side_to_move();
        let mask = env.legal_mask();
        let action = if mover == human_color {
            read_human_action(&env)?
        } else {
            let chosen = agent.select_action(&env.encode(), &mask, &mut rng)?;
            let mv = Move::from_action(chosen);
            println!("engine plays {}", format_move(mv));
            chosen
        };
        let step = env.step(action)?;
        match step.info {
            StepInfo::Terminal(kind) => {
                print_board(&env);
                match kind {
                    GameTermination::Checkmate { winner } => {
                        println!("checkmate — {winner:?} wins");
                    }
                    other => println!("draw: {other:?}"),
                }
                return Ok(());
            }
            StepInfo::StepLimitReached | StepInfo::Ongoing => {}
        }
    }
}

fn read_human_action(env: &ChessEnvironment) -> Result<u16> {
    let mask = env.legal_mask();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line)? == 0 {
            return Err(TrainingError::Config("input closed".into()));
        }
        match parse_move(line.trim()) {
            Some(mv) if mask.contains(mv.action()) => return Ok(mv.action()),
            Some(mv) => println!("{} is not legal here", format_move(mv)),
            None => println!("could not parse that; use e.g. e2e4"),
        }
    }
}

fn parse_move(text: &str) -> Option<Move> {
    let bytes = text.as_bytes();
    if bytes.len() != 4 {
        return None;
    }
    let square = |file: u8, rank: u8| -> Option<u8> {
        if (b'a'..=b'h').contains(&file) && (b'1'..=b'8').contains(&rank) {
            Some((rank - b'1') * 8 + (file - b'a'))
        } else {
            None
        }
    };
    Some(Move::new(
        square(bytes[0], bytes[1])?,
        square(bytes[2], bytes[3])?,
    ))
}

fn format_move(mv: Move) -> String {
    let name = |sq: u8| {
        format!(
            "{}{}",
            (b'a' + chess_dqn::chess::file_of(sq)) as char,
            (b'1' + chess_dqn::chess::rank_of(sq)) as char
        )
    };
    format!("{}{}", name(mv.from), name(mv.to))
}

fn print_board(env: &ChessEnvironment) {
    let board = env.board();
    for rank in (0..8u8).rev() {
        print!("{} ", rank + 1);
        for file in 0..8u8 {
            let sq = rank * 8 + file;
            let c = match board.piece_at(sq) {
                None => '.',
                Some(piece) => {
                    let c = match piece.kind {
                        PieceKind::Pawn => 'p',
                        PieceKind::Knight => 'n',
                        PieceKind::Bishop => 'b',
                        PieceKind::Rook => 'r',
                        PieceKind::Queen => 'q',
                        PieceKind::King => 'k',
                    };
                    if piece.color == Color::White {
                        c.to_ascii_uppercase()
                    } else {
                        c
                    }
                }
            };
            print!("{c} ");
        }
        println!();
    }
    println!("  a b c d e f g h");
}
