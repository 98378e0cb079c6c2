//! Render/playback orchestration (spec §2's engine lifecycle, §4.7's output
//! sinks): turns a loaded [`Module`] plus [`Config`] into the right sink(s)
//! and drives a [`ModEngine`] run, including per-channel render and the
//! length-estimation pre-pass (spec §5, §9).

use std::path::{Path, PathBuf};

use crate::config::{Config, PlayMode};
use crate::engine::ModEngine;
use crate::error::{cleanup_render_target, ModError};
use crate::sink::{FrameCounterSink, RealtimeSink, WavSink};
use crate::song::Module;

/// Sample rate floor for the length-estimation pre-pass (spec §5).
const ESTIMATE_SAMPLE_RATE: u32 = 1_000;

/// Dispatches to realtime playback, a single WAV render, or per-channel
/// render, per `config.render`/`config.channels` (spec §4.7).
pub fn run(module: Module, config: &Config) -> Result<(), ModError> {
    if config.verbose {
        let frames = estimate_frames(&module, config);
        let seconds = frames as f64 / config.sample_rate.max(1) as f64;
        println!("Estimated length: {:.1}s", seconds);
    }

    match (&config.render, config.channels) {
        (Some(path), true) => render_per_channel(module, config, path),
        (Some(path), false) => render_single(module, config, path),
        (None, _) => play_realtime(module, config),
    }
}

/// Runs the engine at [`ESTIMATE_SAMPLE_RATE`] against a frame-counting
/// sink instead of a duplicate state machine (spec §9's design note), then
/// scales the result to `config.sample_rate`.
pub fn estimate_frames(module: &Module, config: &Config) -> u64 {
    let mut estimate_config = config.clone();
    estimate_config.sample_rate = ESTIMATE_SAMPLE_RATE;
    estimate_config.play_mode = PlayMode::Mono;
    estimate_config.interpolate = false;
    estimate_config.render = None;

    let mut engine = ModEngine::new(module.clone(), &estimate_config);
    let mut counter = FrameCounterSink::default();
    // A malformed row/effect can only clamp or get ignored (spec §7); the
    // pre-pass never fails for a module that already loaded successfully.
    let _ = engine.run(&mut counter);

    let ratio = config.sample_rate as f64 / ESTIMATE_SAMPLE_RATE as f64;
    (counter.frame_count as f64 * ratio).round() as u64
}

fn render_single(module: Module, config: &Config, path: &Path) -> Result<(), ModError> {
    let mut sink = WavSink::new(path.to_path_buf());
    let mut engine = ModEngine::new(module, config);
    let result = engine.run(&mut sink);
    if result.is_err() {
        cleanup_render_target(&path.to_path_buf());
    }
    result
}

/// Runs the full song once per channel, each engine instance restricted to
/// that channel's contribution (spec §4.7). Every run starts from a fresh
/// clone of the loaded module and the same fixed random seed, so invert-loop
/// mutations or RNG draws from one channel's render never leak into the
/// next (spec §9, Open Question (b): per-channel renders must start from
/// identical initial state to sum back to the combined render bit-for-bit).
fn render_per_channel(module: Module, config: &Config, path: &Path) -> Result<(), ModError> {
    let channel_count = module.channel_count as usize;
    let mut written = Vec::with_capacity(channel_count);

    for channel in 0..channel_count {
        let target = channel_target_path(path, channel + 1);
        let mut sink = WavSink::new(target.clone());
        let mut engine = ModEngine::new(module.clone(), config);
        engine.render_channel_only(channel);

        if let Err(e) = engine.run(&mut sink) {
            for p in written.iter().chain(std::iter::once(&target)) {
                cleanup_render_target(p);
            }
            return Err(e);
        }
        written.push(target);
    }
    Ok(())
}

fn play_realtime(module: Module, config: &Config) -> Result<(), ModError> {
    let mut sink = RealtimeSink::new(config.buffer_size);
    let mut engine = ModEngine::new(module, config);
    engine.run(&mut sink)
}

/// `<base>_1.wav` -> `<base>_<n>.wav` (spec §4.7/§6). `config.validate`
/// already rejected any `--render` target that doesn't end in `_1.wav` when
/// `--channels` is set, so `strip_suffix` always matches here.
fn channel_target_path(path: &Path, channel_number: usize) -> PathBuf {
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("out");
    let base = stem.strip_suffix("_1").unwrap_or(stem);
    path.with_file_name(format!("{base}_{channel_number}.wav"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_target_path_replaces_trailing_index() {
        let path = PathBuf::from("/tmp/song_1.wav");
        assert_eq!(
            channel_target_path(&path, 3),
            PathBuf::from("/tmp/song_3.wav")
        );
    }
}
