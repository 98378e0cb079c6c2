//! Output sinks (spec §4.7): a realtime cpal device and a WAV file writer
//! share one small trait, "polymorphism over sinks" per spec §9 — a tagged
//! capability set, not an inheritance hierarchy.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc::{self, SyncSender};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::error::ModError;

/// `{begin, write_frame, end}`, as spec §9 calls out explicitly.
pub trait Sink {
    fn begin(&mut self, sample_rate: u32, channels: u16) -> Result<(), ModError>;
    fn write_frame(&mut self, frame: &[i16]) -> Result<(), ModError>;
    fn end(&mut self) -> Result<(), ModError>;
}

/// Writes interleaved frames to the default output device through a bounded
/// channel; the device's callback drains it, so a full channel naturally
/// applies backpressure to the engine (spec §5's suspension point).
pub struct RealtimeSink {
    buffer_frames: u16,
    stream: Option<cpal::Stream>,
    sender: Option<SyncSender<i16>>,
}

impl RealtimeSink {
    pub fn new(buffer_frames: u16) -> Self {
        RealtimeSink {
            buffer_frames: buffer_frames.max(1),
            stream: None,
            sender: None,
        }
    }
}

impl Sink for RealtimeSink {
    fn begin(&mut self, sample_rate: u32, channels: u16) -> Result<(), ModError> {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| ModError::Audio("no default output device available".into()))?;
        log::debug!(
            "opening audio device {:?} at {} Hz, {} channel(s)",
            device.name().ok(),
            sample_rate,
            channels
        );

        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let capacity = self.buffer_frames as usize * channels as usize;
        let (tx, rx) = mpsc::sync_channel::<i16>(capacity.max(channels as usize));

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [i16], _| {
                    for sample in data.iter_mut() {
                        *sample = rx.try_recv().unwrap_or(0);
                    }
                },
                |err| log::warn!("audio stream error: {err}"),
                None,
            )
            .map_err(|e| ModError::Audio(e.to_string()))?;

        stream
            .play()
            .map_err(|e| ModError::Audio(e.to_string()))?;

        self.stream = Some(stream);
        self.sender = Some(tx);
        Ok(())
    }

    fn write_frame(&mut self, frame: &[i16]) -> Result<(), ModError> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| ModError::Audio("sink not started".into()))?;
        for &sample in frame {
            sender
                .send(sample)
                .map_err(|_| ModError::Audio("output stream closed unexpectedly".into()))?;
        }
        Ok(())
    }

    fn end(&mut self) -> Result<(), ModError> {
        self.sender = None;
        self.stream = None;
        Ok(())
    }
}

/// Accumulates PCM bytes in memory and writes a standard RIFF/WAVE header
/// on `end`. No streaming write: the header needs the final byte count.
pub struct WavSink {
    path: PathBuf,
    sample_rate: u32,
    channels: u16,
    data: Vec<u8>,
}

impl WavSink {
    pub fn new(path: PathBuf) -> Self {
        WavSink {
            path,
            sample_rate: 0,
            channels: 0,
            data: Vec::new(),
        }
    }

    /// Discards buffered audio without writing, for cooperative cancellation
    /// (spec §7: "partial WAV is discarded").
    pub fn discard(self) {
        log::debug!("discarding {} buffered bytes for {:?}", self.data.len(), self.path);
    }
}

impl Sink for WavSink {
    fn begin(&mut self, sample_rate: u32, channels: u16) -> Result<(), ModError> {
        self.sample_rate = sample_rate;
        self.channels = channels;
        self.data.clear();
        Ok(())
    }

    fn write_frame(&mut self, frame: &[i16]) -> Result<(), ModError> {
        // Spec §4.6/§6: the WAV target gets unsigned-16 words biased by
        // 32768, distinct from the signed frames handed to the realtime
        // sink (`pymod.py` writes this same biased encoding to its wave
        // file via `wave.setsampwidth(2)` + raw unsigned bytes).
        for &sample in frame {
            let biased = (sample as i32 + 32768) as u16;
            self.data.extend_from_slice(&biased.to_le_bytes());
        }
        Ok(())
    }

    fn end(&mut self) -> Result<(), ModError> {
        let mut file = File::create(&self.path)?;
        write_wav_header(&mut file, self.sample_rate, self.channels, self.data.len())?;
        file.write_all(&self.data)?;
        Ok(())
    }
}

fn write_wav_header(
    out: &mut impl Write,
    sample_rate: u32,
    channels: u16,
    data_len: usize,
) -> Result<(), ModError> {
    const BITS_PER_SAMPLE: u16 = 16;
    let block_align = channels * (BITS_PER_SAMPLE / 8);
    let byte_rate = sample_rate * block_align as u32;
    let data_len = data_len as u32;

    out.write_all(b"RIFF")?;
    out.write_all(&(36 + data_len).to_le_bytes())?;
    out.write_all(b"WAVE")?;

    out.write_all(b"fmt ")?;
    out.write_all(&16u32.to_le_bytes())?; // PCM fmt chunk size
    out.write_all(&1u16.to_le_bytes())?; // PCM format tag
    out.write_all(&channels.to_le_bytes())?;
    out.write_all(&sample_rate.to_le_bytes())?;
    out.write_all(&byte_rate.to_le_bytes())?;
    out.write_all(&block_align.to_le_bytes())?;
    out.write_all(&BITS_PER_SAMPLE.to_le_bytes())?;

    out.write_all(b"data")?;
    out.write_all(&data_len.to_le_bytes())?;
    Ok(())
}

/// A sink that only counts frames, for the length-estimation pre-pass
/// (spec §9: "no duplicate state machine").
#[derive(Debug, Default)]
pub struct FrameCounterSink {
    pub frame_count: u64,
}

impl Sink for FrameCounterSink {
    fn begin(&mut self, _sample_rate: u32, _channels: u16) -> Result<(), ModError> {
        self.frame_count = 0;
        Ok(())
    }

    fn write_frame(&mut self, _frame: &[i16]) -> Result<(), ModError> {
        self.frame_count += 1;
        Ok(())
    }

    fn end(&mut self) -> Result<(), ModError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wav_header_reports_riff_sizes() {
        let mut buf = Vec::new();
        write_wav_header(&mut buf, 44_100, 2, 8).unwrap();
        assert_eq!(&buf[0..4], b"RIFF");
        assert_eq!(&buf[8..12], b"WAVE");
        assert_eq!(u32::from_le_bytes(buf[4..8].try_into().unwrap()), 36 + 8);
        assert_eq!(u16::from_le_bytes(buf[22..24].try_into().unwrap()), 2);
        assert_eq!(buf.len(), 44);
    }

    #[test]
    fn frame_counter_counts_writes() {
        let mut sink = FrameCounterSink::default();
        sink.begin(1000, 2).unwrap();
        sink.write_frame(&[0, 0]).unwrap();
        sink.write_frame(&[0, 0]).unwrap();
        assert_eq!(sink.frame_count, 2);
    }
}
