//! Command-line interface for the seal model checker.

use clap::{Parser, Subcommand, ValueEnum};
use miette::Diagnostic;
use seal_mc::models::{Counters, LinkedList, Ring};
use seal_mc::{
    Configuration, FrontierKind, Interpreter, ProgressCounters, Search, SearchConfig,
    SearchError, SearchOutcome, Verdict,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CLI error for pretty printing.
#[derive(Debug, Error, Diagnostic)]
pub enum CliError {
    #[error("search failed: {0}")]
    #[diagnostic(code(seal::search_error))]
    Search(#[from] SearchError),

    #[error("search ran out of resources: {0}")]
    #[diagnostic(
        code(seal::exhausted),
        help("raise --arena-limit, or lower --max-states")
    )]
    Exhausted(SearchError),

    #[error("invalid model size {size} for {model}")]
    #[diagnostic(code(seal::bad_size))]
    BadSize { model: &'static str, size: u32 },

    #[error("model setup failed: {message}")]
    Model { message: String },
}

impl CliError {
    fn from_search(e: SearchError) -> Self {
        if e.is_exhaustion() {
            CliError::Exhausted(e)
        } else {
            CliError::Search(e)
        }
    }
}

type CliResult<T> = Result<T, CliError>;

#[derive(Parser)]
#[command(name = "seal", version)]
#[command(about = "Explicit-state model checker", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Search the state space of a built-in model
    Check {
        /// Model to check
        #[arg(value_enum, value_name = "MODEL")]
        model: Model,

        /// Model size: ring length, counter bound, or pushes per thread
        #[arg(long, default_value = "4")]
        size: u32,

        /// Threads of the counters and linked-list models
        #[arg(long, default_value = "2")]
        threads: u32,

        /// Number of search workers (0 = use all available)
        #[arg(short, long, default_value = "0")]
        workers: usize,

        /// Frontier policy
        #[arg(long, value_enum, default_value = "bfs")]
        frontier: FrontierArg,

        /// Enable partial order reduction
        #[arg(long)]
        por: bool,

        /// Look for accepting cycles (ring: the state at --accept-at is accepting)
        #[arg(long)]
        accepting: bool,

        /// Accepting ring position
        #[arg(long, default_value = "0")]
        accept_at: u32,

        /// Report states without successors
        #[arg(long)]
        deadlock: bool,

        /// Maximum number of states to explore (0 = unlimited)
        #[arg(long, default_value = "0")]
        max_states: usize,

        /// Maximum memory usage in MB (0 = unlimited)
        #[arg(long, default_value = "0")]
        memory_limit: usize,

        /// Maximum time in seconds (0 = unlimited)
        #[arg(long, default_value = "0")]
        max_time: u64,

        /// Per-worker arena ceiling in MB (0 = unlimited)
        #[arg(long, default_value = "0")]
        arena_limit: usize,

        /// Show verbose output
        #[arg(short, long)]
        verbose: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Model {
    Ring,
    Counters,
    WrappingCounters,
    LinkedList,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum FrontierArg {
    Dfs,
    Bfs,
    Shared,
}

impl From<FrontierArg> for FrontierKind {
    fn from(arg: FrontierArg) -> Self {
        match arg {
            FrontierArg::Dfs => FrontierKind::Stack,
            FrontierArg::Bfs => FrontierKind::Queue,
            FrontierArg::Shared => FrontierKind::Shared,
        }
    }
}

struct CheckArgs {
    model: Model,
    size: u32,
    threads: u32,
    accept_at: u32,
    config: SearchConfig,
}

fn main() {
    // Install miette's fancy error handler
    miette::set_hook(Box::new(|_| {
        Box::new(
            miette::MietteHandlerOpts::new()
                .terminal_links(true)
                .unicode(true)
                .context_lines(2)
                .build(),
        )
    }))
    .ok();

    let cli = Cli::parse();

    let filter = if matches!(&cli.command, Commands::Check { verbose: true, .. }) {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let result = match cli.command {
        Commands::Check {
            model,
            size,
            threads,
            workers,
            frontier,
            por,
            accepting,
            accept_at,
            deadlock,
            max_states,
            memory_limit,
            max_time,
            arena_limit,
            verbose: _,
        } => cmd_check(CheckArgs {
            model,
            size,
            threads,
            accept_at,
            config: SearchConfig {
                workers,
                frontier: frontier.into(),
                use_por: por,
                check_accepting_cycles: accepting,
                check_deadlock: deadlock,
                max_states,
                memory_limit_mb: memory_limit,
                max_time_secs: max_time,
                arena_limit_bytes: arena_limit * 1024 * 1024,
                ..Default::default()
            },
        }),
    };

    match result {
        Ok(verdict) if verdict.is_violation() => std::process::exit(1),
        Ok(verdict) if verdict.is_incomplete() => std::process::exit(2),
        Ok(_) => {}
        Err(e) => {
            eprintln!("{:?}", miette::Report::new(e));
            std::process::exit(1);
        }
    }
}

fn cmd_check(args: CheckArgs) -> CliResult<Verdict> {
    let CheckArgs {
        model,
        size,
        threads,
        accept_at,
        config,
    } = args;
    match model {
        Model::Ring => {
            if size == 0 {
                return Err(CliError::BadSize { model: "ring", size });
            }
            let ring = Ring::new(size).accepting(accept_at);
            run(&ring, &ring.initial(), config)
        }
        Model::Counters => {
            let counters = Counters::new(threads, size);
            run(&counters, &counters.initial(), config)
        }
        Model::WrappingCounters => {
            let counters = Counters::new(threads, size).wrapping();
            run(&counters, &counters.initial(), config)
        }
        Model::LinkedList => {
            let list = LinkedList::new(threads, size);
            let initial = list.initial().map_err(|e| CliError::Model {
                message: e.to_string(),
            })?;
            run(&list, &initial, config)
        }
    }
}

fn run<I: Interpreter>(
    interp: &I,
    initial: &Configuration,
    mut config: SearchConfig,
) -> CliResult<Verdict> {
    let progress = Arc::new(ProgressCounters::new());
    config.progress = Some(Arc::clone(&progress));
    let done = AtomicBool::new(false);

    info!("model checking...");
    let outcome = std::thread::scope(|s| {
        s.spawn(|| report_progress(&progress, &done));
        let outcome = Search::new(interp, config).run(initial);
        done.store(true, Ordering::Relaxed);
        outcome
    })
    .map_err(CliError::from_search)?;

    print_outcome(&outcome);
    Ok(outcome.verdict)
}

fn report_progress(progress: &ProgressCounters, done: &AtomicBool) {
    let mut ticks = 0u32;
    while !done.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
        ticks += 1;
        if ticks % 10 == 0 && !done.load(Ordering::Relaxed) {
            info!(
                states = progress.states.load(Ordering::Relaxed),
                transitions = progress.transitions.load(Ordering::Relaxed),
                expanded = progress.checked.load(Ordering::Relaxed),
                "progress"
            );
        }
    }
}

fn print_outcome(outcome: &SearchOutcome) {
    let stats = &outcome.stats;
    println!();
    match &outcome.verdict {
        Verdict::Exhausted => println!("Result: OK"),
        Verdict::GoalReached { state } => {
            println!("Result: GOAL REACHED");
            println!("  State: {:?}", state);
        }
        Verdict::AcceptingCycle { state } => {
            println!("Result: ACCEPTING CYCLE");
            println!("  Accepting state: {:?}", state);
        }
        Verdict::Deadlock { state } => {
            println!("Result: DEADLOCK");
            println!("  State: {:?}", state);
        }
        Verdict::StateLimitReached => println!("Result: STATE LIMIT REACHED"),
        Verdict::MemoryLimitReached { memory_mb } => {
            println!("Result: MEMORY LIMIT REACHED ({} MB)", memory_mb)
        }
        Verdict::TimeLimitReached => println!("Result: TIME LIMIT REACHED"),
        Verdict::Stopped => println!("Result: STOPPED"),
    }
    let secs = stats.elapsed.as_secs_f64();
    println!("  States explored: {}", stats.states);
    println!("  Transitions: {}", stats.transitions);
    println!("  Deadlocks: {}", stats.deadlocks);
    if stats.por_rounds > 0 {
        println!(
            "  POR rounds: {} ({} states forced to full expansion)",
            stats.por_rounds, stats.por_forced
        );
    }
    println!("  States per worker: {:?}", stats.per_worker);
    println!("  Time: {:.2}s", secs);
    println!("  States/sec: {:.0}", stats.states as f64 / secs.max(1e-9));
}
