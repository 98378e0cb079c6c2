use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use modplayer::config::{Config, PlayMode};

/// Plays or renders ProTracker-family MOD files.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The module file to load.
    path: PathBuf,

    /// PCM output sample rate, in Hz.
    #[arg(long, default_value_t = 44_100)]
    sample_rate: u32,

    /// Mixing and post-DSP mode.
    #[arg(long, value_enum, default_value = "stereo-hard")]
    play_mode: PlayMode,

    /// Maximum loop iterations before stopping.
    #[arg(long, default_value_t = 1)]
    loops: u32,

    /// Realtime sink buffer length, in frames.
    #[arg(long, default_value_t = 1024)]
    buffer_size: u16,

    /// Restrict effects and period range to ProTracker 2.3 quirks.
    #[arg(long)]
    legacy: bool,

    /// Global gain multiplier.
    #[arg(long, default_value_t = 1.0)]
    amplify: f32,

    /// Enable linear sample interpolation.
    #[arg(long)]
    interpolate: bool,

    /// Initial order index.
    #[arg(long, default_value_t = 0)]
    start_pos: u8,

    /// Limit of orders to play, starting from `--start-pos`.
    #[arg(long)]
    patterns_count: Option<u16>,

    /// Render to a WAV file instead of playing it.
    #[arg(long)]
    render: Option<PathBuf>,

    /// Render one file per channel; requires `--render <name>_1.wav`.
    #[arg(long)]
    channels: bool,

    /// Print the decoded row as it plays.
    #[arg(long)]
    verbose: bool,

    /// Suppress progress output.
    #[arg(long)]
    quiet: bool,
}

impl From<Args> for Config {
    fn from(args: Args) -> Config {
        Config {
            path: args.path,
            sample_rate: args.sample_rate,
            play_mode: args.play_mode,
            loops: args.loops,
            buffer_size: args.buffer_size,
            legacy: args.legacy,
            amplify: args.amplify,
            interpolate: args.interpolate,
            start_pos: args.start_pos,
            patterns_count: args.patterns_count,
            render: args.render,
            channels: args.channels,
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    let config: Config = args.into();

    if !config.quiet && config.play_mode.is_audio() {
        println!("modplayer v{}", env!("CARGO_PKG_VERSION"));
    }

    match modplayer::run(config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
