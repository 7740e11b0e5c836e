#[cfg(feature = "accelerate")]
extern crate accelerate_src;

use std::path::PathBuf;

use anyhow::Result;
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use tracing::info;

use mario_rl::{
    EnvController, EnvProvider, Environment, ExperimentConfig, NesProvider,
    PolicyGradientProvider, RenderMode, play_random, run_experiment,
};

// =============================================================================
// CLI
// =============================================================================

#[derive(Parser)]
#[command(name = "mario-rl", about = "Super Mario Bros. NES policy-gradient experiment runner")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Without a subcommand the train/evaluate experiment runs.
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Press random buttons in a visible window
    Random(RandomArgs),
}

#[derive(Args)]
struct CommonArgs {
    /// JSON file overriding the built-in experiment settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    rom: Option<PathBuf>,
    #[arg(long, global = true)]
    scenario: Option<PathBuf>,
    /// Save-state every episode starts from
    #[arg(long, global = true)]
    state: Option<PathBuf>,
    #[arg(long, global = true, default_value_t = false)]
    cpu: bool,
}

#[derive(Args)]
struct RandomArgs {
    /// Stop after this many frames; runs until the window closes otherwise
    #[arg(long)]
    max_steps: Option<u64>,
    #[arg(long, default_value_t = false)]
    record: bool,
}

impl CommonArgs {
    fn experiment_config(&self) -> Result<ExperimentConfig> {
        let mut config = match &self.config {
            Some(path) => ExperimentConfig::load(path)?,
            None => ExperimentConfig::default(),
        };
        if let Some(rom) = &self.rom {
            config.game = rom.clone();
        }
        if let Some(scenario) = &self.scenario {
            config.scenario = scenario.clone();
        }
        if let Some(state) = &self.state {
            config.state = Some(state.clone());
        }
        config.validate()?;
        Ok(config)
    }

    fn device(&self) -> Device {
        // Metal on Apple Silicon, else CPU
        if self.cpu {
            Device::Cpu
        } else {
            Device::new_metal(0).unwrap_or(Device::Cpu)
        }
    }
}

// =============================================================================
// Commands
// =============================================================================

fn experiment(args: &CommonArgs) -> Result<()> {
    let config = args.experiment_config()?;
    let device = args.device();
    info!(device = ?device, game = %config.game.display(), "starting experiment");

    let rounds = config.check_count;
    let algorithms = PolicyGradientProvider::new(config.policy.clone(), device);
    let mut controller = EnvController::new(config, NesProvider, algorithms)?;
    run_experiment(&mut controller, rounds)?;
    Ok(())
}

fn random(common: &CommonArgs, args: &RandomArgs) -> Result<()> {
    let config = common.experiment_config()?;
    let spec = config.env_spec(RenderMode::Human, args.record);
    let mut env = NesProvider.make(&spec)?;
    let mut rng = SmallRng::from_os_rng();
    let stats = play_random(&mut *env, args.max_steps, &mut rng)?;
    info!(steps = stats.steps, episodes = stats.episodes, "random play finished");
    env.close()?;
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let cli = Cli::parse();

    match &cli.command {
        None => experiment(&cli.common),
        Some(Commands::Random(args)) => random(&cli.common, args),
    }
}
