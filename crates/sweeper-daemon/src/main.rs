//! Sweeper daemon - main entry point

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use sweeper_daemon::cli::{CleanArgs, SweepArgs, WatchArgs};
use sweeper_daemon::{report, Cli, Command, SimWorld, TickLoop};
use sweeper_domain::TaskPriority;
use sweeper_engine::{CleaningRequest, EngineConfig, EngineContext, TaskOrchestrator};
use tracing_subscriber::EnvFilter;

/// Ticks between fresh items dropped while watching
const LITTER_EVERY_TICKS: u64 = 20;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Log to stderr; RUST_LOG wins over --log-level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let mut config = cli.load_config()?;
    let command = cli
        .command
        .unwrap_or_else(|| Command::Sweep(SweepArgs::default()));

    let (clean, litter_every) = match &command {
        Command::Config => {
            print!("{}", config.to_toml()?);
            return Ok(());
        }
        Command::Sweep(args) => (&args.clean, 0),
        Command::Watch(args) => (&args.clean, LITTER_EVERY_TICKS),
    };
    if clean.actors {
        config.cleaning.actors.enabled = true;
    }

    let world = Arc::new(SimWorld::generate(
        cli.world_extent,
        config.batch.partition_size,
        config.cleaning.domain_key.clone(),
    ));
    let context = EngineContext::new(config).context("invalid engine configuration")?;
    let (engine, mailbox) = TaskOrchestrator::new(context, Arc::clone(&world));
    let mut ticks = TickLoop::spawn(
        Arc::clone(&world),
        mailbox,
        Duration::from_millis(cli.tick_ms.max(1)),
        litter_every,
    )
    .context("failed to start the world tick thread")?;
    engine.start()?;

    let (items, actors) = world.population();
    tracing::info!("World ready: {} items, {} actors", items, actors);

    let outcome = match command {
        Command::Sweep(args) => sweep(&engine, &world, args).await,
        Command::Watch(args) => watch(&engine, &world, args).await,
        Command::Config => Ok(()),
    };

    print!("{}", report::engine_report(&engine));

    // stop() blocks on pool shutdown
    let stopping = engine.clone();
    tokio::task::spawn_blocking(move || stopping.stop())
        .await
        .context("engine shutdown panicked")?;
    ticks.stop();
    outcome
}

fn cleaning_request(args: &CleanArgs, config: &EngineConfig) -> CleaningRequest {
    let radius = args.radius.unwrap_or(config.cleaning.default_radius);
    let mut request = CleaningRequest::around(args.center, radius).with_actors(args.actors);
    if let Some(strategy) = args.strategy {
        request = request.with_strategy(strategy.to_strategy(args.center, radius, config));
    }
    request
}

async fn sweep(
    engine: &TaskOrchestrator<SimWorld>,
    world: &SimWorld,
    args: SweepArgs,
) -> anyhow::Result<()> {
    let request = cleaning_request(&args.clean, &engine.context().config);
    let result = engine
        .submit_cleaning_task("MANUAL_CLEAN", TaskPriority::High, request)
        .await;
    print!("{}", report::task_report(&result));
    if !result.success {
        anyhow::bail!("cleanup failed: {}", result.error.unwrap_or(result.message));
    }

    let (items, actors) = world.population();
    println!("World now holds {} items, {} actors", items, actors);

    if args.undo {
        if engine.undo_last_operation().await {
            let (items, actors) = world.population();
            println!("Undo complete: world back to {} items, {} actors", items, actors);
        } else {
            println!("Nothing could be undone");
        }
    }
    Ok(())
}

async fn watch(
    engine: &TaskOrchestrator<SimWorld>,
    world: &SimWorld,
    args: WatchArgs,
) -> anyhow::Result<()> {
    let request = cleaning_request(&args.clean, &engine.context().config);
    let mut interval = tokio::time::interval(Duration::from_secs(args.interval.max(1)));
    let mut round = 0u32;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted after {} rounds", round);
                break;
            }
        }

        round += 1;
        let ticket =
            engine.submit_cleaning_task("SCHEDULED_CLEAN", TaskPriority::Normal, request.clone());
        let task_id = ticket.task_id();
        let result = tokio::select! {
            result = ticket => result,
            _ = tokio::signal::ctrl_c() => {
                engine.cancel_task(task_id);
                tracing::info!("Interrupted during round {}", round);
                break;
            }
        };

        let (items, actors) = world.population();
        println!("Round {} at tick {}", round, world.current_tick());
        print!("{}", report::task_report(&result));
        println!("  world: {} items, {} actors", items, actors);

        if args.rounds.is_some_and(|limit| round >= limit) {
            break;
        }
    }
    Ok(())
}
