use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use syncbox_engine::{EngineConfig, RingSizing};
use tracing_subscriber::EnvFilter;

mod pattern;

use pattern::{simulate, Dispatched, Pattern};

#[derive(Parser)]
#[command(author, version, about = "Offline tools for the syncbox scheduling engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a JSON pattern through simulated audio callbacks and print what is dispatched.
    Simulate(SimulateArgs),
    /// Print the ring and pool sizes derived from a configuration.
    Sizing(ConfigArgs),
}

#[derive(Args)]
struct ConfigArgs {
    /// Engine configuration (JSON). Defaults apply to anything left out.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    sample_rate: Option<u32>,
    #[arg(long)]
    buffer_size: Option<u32>,
    /// Farthest anything may be scheduled ahead, in bars.
    #[arg(long)]
    lookahead_bars: Option<u32>,
}

#[derive(Args)]
struct SimulateArgs {
    /// Pattern description (JSON).
    #[arg(long)]
    pattern: PathBuf,
    #[command(flatten)]
    engine: ConfigArgs,
    /// Print one JSON object per line instead of a table.
    #[arg(long)]
    json: bool,
}

impl ConfigArgs {
    fn load(&self) -> Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::load(path)?,
            None => EngineConfig::default(),
        };
        if let Some(sample_rate) = self.sample_rate {
            config.sample_rate = sample_rate;
        }
        if let Some(buffer_size) = self.buffer_size {
            config.buffer_size = buffer_size;
        }
        if let Some(bars) = self.lookahead_bars {
            config.max_lookahead_bars = bars;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    match cli.command {
        Commands::Simulate(args) => execute_simulate(args),
        Commands::Sizing(args) => execute_sizing(args),
    }
}

fn execute_simulate(args: SimulateArgs) -> Result<()> {
    let config = args.engine.load()?;
    let text = fs::read_to_string(&args.pattern)
        .with_context(|| format!("failed to read pattern {}", args.pattern.display()))?;
    let pattern = Pattern::from_json(&text)
        .with_context(|| format!("{} is not a valid pattern", args.pattern.display()))?;
    let simulation = simulate(config, &pattern)?;

    if args.json {
        for line in simulation.dispatched.iter() {
            println!("{}", serde_json::to_string(line)?);
        }
        println!("{}", serde_json::to_string(&simulation.summary)?);
        return Ok(());
    }

    for line in simulation.dispatched.iter() {
        match line {
            Dispatched::Midi {
                frame,
                seconds,
                track,
                bytes,
            } => {
                let hex: Vec<_> = bytes.iter().map(|byte| format!("{byte:02X}")).collect();
                println!("{frame:>10} {seconds:>9.4}s  midi    track {track:<3} {}", hex.join(" "));
            }
            Dispatched::Timer {
                frame,
                operation,
                parameters,
                text,
            } => println!("{frame:>10}             timer   {operation:?} {parameters:?} {text}"),
            Dispatched::ClipCommand {
                frame,
                clip,
                start,
                stop,
            } => println!("{frame:>10}             clip    {clip:?} start={start} stop={stop}"),
            Dispatched::ClipReleased { clip } => println!("{:>10}             release clip {clip}", "-"),
        }
    }
    let summary = &simulation.summary;
    println!(
        "{} callbacks, {} frames, peak {:.3}, bar {} beat {} tick {}",
        summary.callbacks,
        summary.frames,
        summary.peak,
        summary.timecode.bar,
        summary.timecode.beat,
        summary.timecode.tick
    );
    println!(
        "clip commands live {} / {}, timer commands live {} / {}, dropped events {}",
        summary.pools.clip_commands.live,
        summary.pools.clip_commands.capacity,
        summary.pools.timer_commands.live,
        summary.pools.timer_commands.capacity,
        summary.dropped_events
    );
    Ok(())
}

fn execute_sizing(args: ConfigArgs) -> Result<()> {
    let config = args.load()?;
    let sizing = RingSizing::derive(&config);
    println!("{}", serde_json::to_string_pretty(&sizing)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn overrides_apply_on_top_of_the_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(file, r#"{{"buffer_size":512,"track_count":4}}"#).expect("write");
        let args = ConfigArgs {
            config: Some(file.path().to_path_buf()),
            sample_rate: Some(44_100),
            buffer_size: None,
            lookahead_bars: Some(8),
        };
        let config = args.load().expect("config");
        assert_eq!(config.buffer_size, 512);
        assert_eq!(config.sample_rate, 44_100);
        assert_eq!(config.track_count, 4);
        assert_eq!(config.max_lookahead_bars, 8);
    }

    #[test]
    fn invalid_override_is_rejected() {
        let args = ConfigArgs {
            config: None,
            sample_rate: Some(0),
            buffer_size: None,
            lookahead_bars: None,
        };
        assert!(args.load().is_err());
    }
}
