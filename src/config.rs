//! Engine configuration (spec §6): a plain struct built by `main` from CLI
//! arguments and validated once, before the engine runs.

use std::path::{Path, PathBuf};

use clap::ValueEnum;

use crate::error::ModError;

/// Mixing and post-DSP mode. `Info`/`Text` never touch an audio device or
/// sink — they print a module report instead (spec §5, `report.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "kebab-case")]
pub enum PlayMode {
    Mono,
    StereoSoft,
    StereoHard,
    MonoFilter,
    StereoSoftFilter,
    StereoHardFilter,
    Info,
    Text,
}

impl PlayMode {
    /// Whether the output has two channels.
    pub fn is_stereo(&self) -> bool {
        matches!(
            self,
            PlayMode::StereoSoft
                | PlayMode::StereoHard
                | PlayMode::StereoSoftFilter
                | PlayMode::StereoHardFilter
        )
    }

    /// Whether the one-pole Amiga low-pass filter is applied.
    pub fn is_filtered(&self) -> bool {
        matches!(
            self,
            PlayMode::MonoFilter | PlayMode::StereoSoftFilter | PlayMode::StereoHardFilter
        )
    }

    /// Whether this mode produces audio at all (false for `Info`/`Text`).
    pub fn is_audio(&self) -> bool {
        !matches!(self, PlayMode::Info | PlayMode::Text)
    }

    /// Whether panning uses the hard Amiga L-R-R-L convention rather than a
    /// softened split.
    pub fn is_hard_pan(&self) -> bool {
        matches!(self, PlayMode::StereoHard | PlayMode::StereoHardFilter)
    }
}

pub const MIN_SAMPLE_RATE: u32 = 1_000;
pub const MAX_SAMPLE_RATE: u32 = 380_000;
pub const MAX_BUFFER_SIZE: u16 = 8_192;

/// Resolved engine configuration, mirroring spec §6's configuration table.
#[derive(Debug, Clone)]
pub struct Config {
    pub path: PathBuf,
    pub sample_rate: u32,
    pub play_mode: PlayMode,
    pub loops: u32,
    pub buffer_size: u16,
    pub legacy: bool,
    pub amplify: f32,
    pub interpolate: bool,
    pub start_pos: u8,
    pub patterns_count: Option<u16>,
    pub render: Option<PathBuf>,
    pub channels: bool,
    pub verbose: bool,
    pub quiet: bool,
}

impl Config {
    /// Checks every `InvalidConfig` case in spec §6/§7. `channel_count` is
    /// the loaded module's channel count, needed to validate `legacy`.
    pub fn validate(&self, channel_count: u8) -> Result<(), ModError> {
        if !(MIN_SAMPLE_RATE..MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            return Err(ModError::invalid_config(format!(
                "sample rate {} out of range {}..{}",
                self.sample_rate, MIN_SAMPLE_RATE, MAX_SAMPLE_RATE
            )));
        }

        if self.buffer_size > MAX_BUFFER_SIZE {
            return Err(ModError::invalid_config(format!(
                "buffer size {} out of range 0..={}",
                self.buffer_size, MAX_BUFFER_SIZE
            )));
        }

        if self.legacy && channel_count != 4 {
            return Err(ModError::invalid_config(format!(
                "legacy mode requires a 4-channel module, this module has {}",
                channel_count
            )));
        }

        if self.channels {
            let Some(render) = &self.render else {
                return Err(ModError::invalid_config(
                    "per-channel render mode requires --render",
                ));
            };
            if !ends_in_channel_one_suffix(render) {
                return Err(ModError::invalid_config(
                    "per-channel render target must end in \"_1.wav\"",
                ));
            }
        } else if let Some(render) = &self.render {
            if render.extension().and_then(|e| e.to_str()) != Some("wav") {
                return Err(ModError::invalid_config(
                    "render target must have a .wav extension",
                ));
            }
        }

        Ok(())
    }
}

fn ends_in_channel_one_suffix(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.ends_with("_1.wav"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            path: PathBuf::from("song.mod"),
            sample_rate: 44_100,
            play_mode: PlayMode::StereoHard,
            loops: 1,
            buffer_size: 1024,
            legacy: false,
            amplify: 1.0,
            interpolate: false,
            start_pos: 0,
            patterns_count: None,
            render: None,
            channels: false,
            verbose: false,
            quiet: false,
        }
    }

    #[test]
    fn rejects_out_of_range_sample_rate() {
        let mut cfg = base_config();
        cfg.sample_rate = 500;
        assert!(cfg.validate(4).is_err());
    }

    #[test]
    fn rejects_oversized_buffer() {
        let mut cfg = base_config();
        cfg.buffer_size = 9000;
        assert!(cfg.validate(4).is_err());
    }

    #[test]
    fn rejects_legacy_on_non_four_channel_module() {
        let cfg = Config {
            legacy: true,
            ..base_config()
        };
        assert!(cfg.validate(8).is_err());
    }

    #[test]
    fn rejects_channel_render_without_target() {
        let cfg = Config {
            channels: true,
            ..base_config()
        };
        assert!(cfg.validate(4).is_err());
    }

    #[test]
    fn rejects_channel_render_with_wrong_suffix() {
        let cfg = Config {
            channels: true,
            render: Some(PathBuf::from("out.wav")),
            ..base_config()
        };
        assert!(cfg.validate(4).is_err());
    }

    #[test]
    fn accepts_well_formed_channel_render_target() {
        let cfg = Config {
            channels: true,
            render: Some(PathBuf::from("out_1.wav")),
            ..base_config()
        };
        assert!(cfg.validate(4).is_ok());
    }

    #[test]
    fn rejects_non_wav_render_target() {
        let cfg = Config {
            render: Some(PathBuf::from("out.raw")),
            ..base_config()
        };
        assert!(cfg.validate(4).is_err());
    }

    #[test]
    fn play_mode_helpers_classify_variants() {
        assert!(PlayMode::StereoHardFilter.is_stereo());
        assert!(PlayMode::StereoHardFilter.is_filtered());
        assert!(!PlayMode::Info.is_audio());
        assert!(PlayMode::StereoHard.is_hard_pan());
        assert!(!PlayMode::StereoSoft.is_hard_pan());
    }
}
