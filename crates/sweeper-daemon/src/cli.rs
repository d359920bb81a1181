//! Command-line definitions and argument parsing.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use sweeper_domain::{CleaningStrategy, Position};
use sweeper_engine::EngineConfig;

/// Sweeper daemon - run the cleanup engine against a simulated world.
#[derive(Debug, Parser)]
#[command(name = "sweeperd")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Built-in configuration preset, used when no file is given
    #[arg(short, long, value_enum, global = true, default_value = "default")]
    pub preset: Preset,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    /// Report what would be removed without removing anything
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Half-width of the simulated world, in partitions
    #[arg(long, global = true, default_value_t = 6)]
    pub world_extent: i32,

    /// Simulated tick length in milliseconds
    #[arg(long, global = true, default_value_t = 50)]
    pub tick_ms: u64,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    /// Effective engine configuration: the file when given, else the preset
    pub fn load_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => self.preset.config(),
        };
        if self.dry_run {
            config.cleaning.dry_run = true;
        }
        Ok(config)
    }
}

/// Configuration presets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Preset {
    /// Balanced defaults
    Default,
    /// Short ages and tight density limits
    Aggressive,
    /// Long ages and generous density limits
    Lenient,
}

impl Preset {
    /// Engine configuration for this preset
    pub fn config(self) -> EngineConfig {
        match self {
            Preset::Default => EngineConfig::default(),
            Preset::Aggressive => EngineConfig::aggressive(),
            Preset::Lenient => EngineConfig::lenient(),
        }
    }
}

/// Daemon commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a single cleanup and print its report
    Sweep(SweepArgs),

    /// Submit a cleanup every interval until the round limit or Ctrl-C
    Watch(WatchArgs),

    /// Print the effective configuration as TOML
    Config,
}

/// Arguments shared by every cleanup submission.
#[derive(Debug, Clone, clap::Args)]
pub struct CleanArgs {
    /// Center of the cleanup as x,z
    #[arg(long, value_parser = parse_center, default_value = "0,0")]
    pub center: Position,

    /// Cleanup radius; the configured default when omitted
    #[arg(short, long)]
    pub radius: Option<f64>,

    /// Also thin out dense actor clusters
    #[arg(long)]
    pub actors: bool,

    /// Override the configured selection strategy
    #[arg(long, value_enum)]
    pub strategy: Option<StrategyArg>,
}

/// Arguments for the sweep command.
#[derive(Debug, Clone, clap::Args)]
pub struct SweepArgs {
    #[command(flatten)]
    pub clean: CleanArgs,

    /// Restore everything the sweep removed before exiting
    #[arg(long)]
    pub undo: bool,
}

/// Arguments for the watch command.
#[derive(Debug, Clone, clap::Args)]
pub struct WatchArgs {
    #[command(flatten)]
    pub clean: CleanArgs,

    /// Seconds between cleanups
    #[arg(short, long, default_value_t = 10)]
    pub interval: u64,

    /// Stop after this many cleanups
    #[arg(long)]
    pub rounds: Option<u32>,
}

impl Default for CleanArgs {
    fn default() -> Self {
        Self {
            center: Position::new(0.0, 64.0, 0.0),
            radius: None,
            actors: false,
            strategy: None,
        }
    }
}

impl Default for SweepArgs {
    fn default() -> Self {
        Self {
            clean: CleanArgs::default(),
            undo: false,
        }
    }
}

/// Strategy choices exposed on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum StrategyArg {
    /// Only objects older than the configured item age
    Time,
    /// Only objects far from the cleanup center
    Distance,
    /// Only the oldest excess of crowded cells
    Density,
}

impl StrategyArg {
    /// Concrete strategy for a cleanup around `center` with `radius`
    pub fn to_strategy(self, center: Position, radius: f64, config: &EngineConfig) -> CleaningStrategy {
        match self {
            StrategyArg::Time => CleaningStrategy::TimeBased {
                min_age_ticks: config.cleaning.items.min_age_ticks,
            },
            StrategyArg::Distance => CleaningStrategy::DistanceBased {
                origin: center,
                max_distance: radius / 2.0,
            },
            StrategyArg::Density => CleaningStrategy::DensityBased {
                cell_size: 4.0,
                threshold: config.cleaning.actors.density_threshold,
            },
        }
    }
}

fn parse_center(raw: &str) -> Result<Position, String> {
    let (x, z) = raw
        .split_once(',')
        .ok_or_else(|| format!("expected x,z but got '{}'", raw))?;
    let x: f64 = x.trim().parse().map_err(|e| format!("invalid x: {}", e))?;
    let z: f64 = z.trim().parse().map_err(|e| format!("invalid z: {}", e))?;
    Ok(Position::new(x, 64.0, z))
}
