//! Mixer & post-DSP (spec §4.6): panning, the global one-pole "Amiga"
//! filter, the per-channel bass filter and delay line, and final 16-bit
//! clamping. `mixer.rs` is new relative to the teacher — its
//! `get_audio_buffer` only ever summed two hard-panned channels with no
//! filtering — generalized here to N channels and the full post-DSP chain.

use crate::config::PlayMode;
use crate::engine::channel::{ChannelState, DelaySpeed};

/// The default pan a channel gets when no `8xy`/`E8y` effect has overridden
/// it: the Amiga's hardwired ODD/EVEN routing, repeating every 4 channels
/// as L-R-R-L.
pub fn default_pan(channel_index: usize, hard: bool) -> f32 {
    let magnitude = if hard { 1.0 } else { 0.5 };
    match channel_index % 4 {
        0 | 3 => -magnitude,
        _ => magnitude,
    }
}

/// Equal-amplitude pan law: `pan == -1` is hard left, `+1` hard right.
fn pan_gains(pan: f32) -> (f32, f32) {
    let pan = pan.clamp(-1.0, 1.0);
    ((1.0 - pan) * 0.5, (1.0 + pan) * 0.5)
}

/// Reads the channel's current sample byte as a signal in `[-1, 1]`,
/// optionally blending with the next byte by the fractional part of
/// `sample_position` (spec §4.6 linear interpolation).
pub fn read_sample(bytes: &[u8], position: f64, length: usize, interpolate: bool) -> f32 {
    if length == 0 {
        return 0.0;
    }
    let pos = position as usize;
    if pos >= length {
        return 0.0;
    }
    let current = bytes[pos] as i8 as f32;
    if !interpolate || pos + 1 >= length {
        return current / 128.0;
    }
    let next = bytes[pos + 1] as i8 as f32;
    let frac = (position - pos as f64) as f32;
    (current + (next - current) * frac) / 128.0
}

/// Rolling-mean low-pass over the channel's bass-history ring buffer
/// (spec §4.6: `N = round(64 * sample_rate / 44100)` samples).
pub fn apply_bass_filter(channel: &mut ChannelState, value: f32) -> f32 {
    if channel.bass_history.is_empty() {
        return value;
    }
    let scaled = (value * 32_768.0) as i32;
    channel.bass_history[channel.bass_history_pos] = scaled;
    channel.bass_history_pos = (channel.bass_history_pos + 1) % channel.bass_history.len();
    let sum: i64 = channel.bass_history.iter().map(|&v| v as i64).sum();
    (sum as f32 / channel.bass_history.len() as f32) / 32_768.0
}

/// A circular feedback delay line, 2-tap read for declick, fed back at 0.5
/// (fast) or 0.8 (slow). Returns the wet signal; the caller mixes it
/// predominantly into the right channel per spec §4.6.
pub fn apply_channel_delay(channel: &mut ChannelState, dry: f32) -> f32 {
    let Some(speed) = channel.channel_delay else {
        return 0.0;
    };
    if channel.delay_line.is_empty() {
        return 0.0;
    }
    let len = channel.delay_line.len();
    let tap_a = channel.delay_line[channel.delay_pos];
    let tap_b = channel.delay_line[(channel.delay_pos + 1) % len];
    let wet = (tap_a as f32 + tap_b as f32) / 2.0 / 32_768.0;
    let feedback = match speed {
        DelaySpeed::Fast => 0.5,
        DelaySpeed::Slow => 0.8,
    };
    let write = ((dry * 32_768.0) + wet * 32_768.0 * feedback) as i32;
    channel.delay_line[channel.delay_pos] = write.clamp(i16::MIN as i32, i16::MAX as i32);
    channel.delay_pos = (channel.delay_pos + 1) % len;
    wet
}

/// Averages the current mixed frame with the previous one, per channel
/// (spec §4.6's "global Amiga filter").
#[derive(Debug, Default)]
pub struct GlobalFilter {
    prev_left: f32,
    prev_right: f32,
}

impl GlobalFilter {
    pub fn apply(&mut self, left: f32, right: f32) -> (f32, f32) {
        let out = ((left + self.prev_left) / 2.0, (right + self.prev_right) / 2.0);
        self.prev_left = left;
        self.prev_right = right;
        out
    }
}

pub fn clamp_i16(value: f32) -> i16 {
    value.clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Per-channel contribution already converted to `[-1, 1]` and panned
/// (bass filter/delay applied), ready for the final sum.
pub struct ChannelFrame {
    pub left: f32,
    pub right: f32,
}

/// Renders one channel's contribution to a stereo frame for this tick: DSP
/// chain (bass filter, delay) then pan gains. Mono play modes collapse the
/// result to a single value by the caller averaging left/right.
pub fn render_channel_frame(
    channel: &mut ChannelState,
    dry: f32,
    play_mode: PlayMode,
    channel_index: usize,
) -> ChannelFrame {
    let mut value = dry;
    if channel.bass_filter {
        value = apply_bass_filter(channel, value);
    }
    let delay_extra = apply_channel_delay(channel, value);

    let pan = if channel.pan != 0.0 || !play_mode.is_stereo() {
        channel.pan
    } else {
        default_pan(channel_index, play_mode.is_hard_pan())
    };
    let (left_gain, right_gain) = pan_gains(pan);

    ChannelFrame {
        left: value * left_gain,
        right: value * right_gain + delay_extra,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pan_follows_amiga_l_r_r_l() {
        assert_eq!(default_pan(0, true), -1.0);
        assert_eq!(default_pan(1, true), 1.0);
        assert_eq!(default_pan(2, true), 1.0);
        assert_eq!(default_pan(3, true), -1.0);
    }

    #[test]
    fn read_sample_out_of_range_is_silent() {
        let bytes = [10u8, 20, 30];
        assert_eq!(read_sample(&bytes, 5.0, 3, false), 0.0);
    }

    #[test]
    fn read_sample_interpolates_between_bytes() {
        let bytes = [0u8, 64]; // i8 values 0 and 64
        let v = read_sample(&bytes, 0.5, 2, true);
        assert!((v - (32.0 / 128.0)).abs() < 1e-6);
    }

    #[test]
    fn bass_filter_is_a_rolling_mean() {
        let mut channel = ChannelState::new();
        channel.configure_dsp_buffers(44_100);
        channel.bass_filter = true;
        let mut last = 0.0;
        for _ in 0..channel.bass_history.len() {
            last = apply_bass_filter(&mut channel, 1.0);
        }
        assert!((last - 1.0).abs() < 1e-3);
    }

    #[test]
    fn clamp_i16_saturates() {
        assert_eq!(clamp_i16(1_000_000.0), i16::MAX);
        assert_eq!(clamp_i16(-1_000_000.0), i16::MIN);
    }

    #[test]
    fn global_filter_averages_consecutive_frames() {
        let mut filter = GlobalFilter::default();
        let (l, _) = filter.apply(1.0, 0.0);
        assert_eq!(l, 0.5);
        let (l2, _) = filter.apply(1.0, 0.0);
        assert_eq!(l2, 1.0);
    }
}
