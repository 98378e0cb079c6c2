//! `modplayer`: a player and WAV renderer for ProTracker-family MOD files.
//!
//! [`run`] is the crate's single public entry point: load a module, validate
//! the configuration against it, then either print an info/text report or
//! drive the playback engine to a real-time sink or a WAV file (spec §2).

pub mod bytereader;
pub mod config;
pub mod engine;
pub mod error;
pub mod formats;
pub mod mixer;
pub mod render;
pub mod report;
pub mod sink;
pub mod song;
pub mod tracker;

pub use config::Config;
pub use error::ModError;
pub use song::Module;

/// Loads `config.path`, validates `config` against the loaded module, then
/// either prints a report (`--play-mode info`/`text`) or renders/plays it.
pub fn run(config: Config) -> Result<(), ModError> {
    let bytes = std::fs::read(&config.path)?;
    let module = formats::modfile::load(bytes).map_err(|e| {
        if let Some(target) = &config.render {
            error::cleanup_render_target(target);
        }
        e
    })?;

    if let Err(e) = config.validate(module.channel_count) {
        if let Some(target) = &config.render {
            error::cleanup_render_target(target);
        }
        return Err(e);
    }

    if !config.play_mode.is_audio() {
        report::print(&module, config.play_mode);
        return Ok(());
    }

    render::run(module, &config)
}
