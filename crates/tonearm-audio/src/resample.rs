//! Sample-rate and channel conversion from a track's layout to the device's.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use rubato::{FftFixedIn, Resampler as RubatoResampler};
use tonearm_core::{Error, Result};
use tracing::debug;

use crate::decode::DecodedChunk;
use crate::output::OutputSpec;

/// Frames per resampler input chunk.
const CHUNK_FRAMES: usize = 1024;

/// FFT resampler over interleaved input.
pub struct Resampler {
    #[allow(clippy::struct_field_names)]
    resampler: FftFixedIn<f32>,
    input_rate: u32,
    output_rate: u32,
    channels: usize,
    /// Deinterleaved input waiting for a full chunk.
    pending: Vec<Vec<f32>>,
}

impl Resampler {
    pub fn new(input_rate: u32, output_rate: u32, channels: usize) -> Result<Self> {
        let resampler = FftFixedIn::new(
            input_rate as usize,
            output_rate as usize,
            CHUNK_FRAMES,
            2,
            channels,
        )
        .map_err(|e| Error::AudioOutput(format!("Failed to create resampler: {e}")))?;

        debug!(
            "Resampler created: {}Hz -> {}Hz, {} channels",
            input_rate, output_rate, channels
        );

        Ok(Self {
            resampler,
            input_rate,
            output_rate,
            channels,
            pending: vec![Vec::new(); channels],
        })
    }

    pub const fn input_rate(&self) -> u32 {
        self.input_rate
    }

    pub const fn output_rate(&self) -> u32 {
        self.output_rate
    }

    /// Push interleaved samples; returns whatever full chunks produced.
    pub fn process(&mut self, input: &[f32]) -> Result<Vec<f32>> {
        for frame in input.chunks_exact(self.channels) {
            for (ch, sample) in frame.iter().enumerate() {
                self.pending[ch].push(*sample);
            }
        }

        let mut output = Vec::new();
        while self.pending[0].len() >= CHUNK_FRAMES {
            let chunk: Vec<Vec<f32>> = self
                .pending
                .iter_mut()
                .map(|ch| ch.drain(..CHUNK_FRAMES).collect())
                .collect();
            let resampled = self
                .resampler
                .process(&chunk, None)
                .map_err(|e| Error::AudioOutput(format!("Resample failed: {e}")))?;
            interleave_into(&resampled, usize::MAX, &mut output);
        }

        Ok(output)
    }

    /// Pad and resample whatever is still buffered (end of stream).
    pub fn flush(&mut self) -> Result<Vec<f32>> {
        let remaining = self.pending[0].len();
        if remaining == 0 {
            return Ok(Vec::new());
        }

        let chunk: Vec<Vec<f32>> = self
            .pending
            .iter_mut()
            .map(|ch| {
                let mut data = std::mem::take(ch);
                data.resize(CHUNK_FRAMES, 0.0);
                data
            })
            .collect();

        let resampled = self
            .resampler
            .process(&chunk, None)
            .map_err(|e| Error::AudioOutput(format!("Resample failed: {e}")))?;

        // Only keep the part that corresponds to real input
        let frames = (remaining as f64 * f64::from(self.output_rate) / f64::from(self.input_rate))
            .round() as usize;
        let mut output = Vec::new();
        interleave_into(&resampled, frames, &mut output);
        Ok(output)
    }

    pub fn reset(&mut self) {
        self.resampler.reset();
        self.pending.iter_mut().for_each(Vec::clear);
    }
}

fn interleave_into(channels: &[Vec<f32>], max_frames: usize, output: &mut Vec<f32>) {
    let Some(first) = channels.first() else {
        return;
    };
    let frames = first.len().min(max_frames);
    output.reserve(frames * channels.len());
    for frame in 0..frames {
        for ch in channels {
            output.push(ch[frame]);
        }
    }
}

/// Map interleaved samples from `from` channels to `to` channels.
///
/// Down to mono averages; up from mono duplicates; otherwise channels are
/// truncated or repeated cyclically.
pub fn remix(samples: &[f32], from: usize, to: usize) -> Vec<f32> {
    if from == to || from == 0 || to == 0 {
        return samples.to_vec();
    }

    let frames = samples.len() / from;
    let mut output = Vec::with_capacity(frames * to);
    for frame in samples.chunks_exact(from) {
        if to == 1 {
            output.push(frame.iter().sum::<f32>() / from as f32);
        } else {
            for ch in 0..to {
                output.push(frame[ch % from]);
            }
        }
    }
    output
}

/// Converts decoded chunks to the device's rate and channel count.
pub struct StreamConverter {
    target: OutputSpec,
    resampler: Option<Resampler>,
}

impl StreamConverter {
    pub const fn new(target: OutputSpec) -> Self {
        Self {
            target,
            resampler: None,
        }
    }

    /// Convert one decoded chunk into device-layout interleaved samples.
    pub fn convert(&mut self, chunk: &DecodedChunk) -> Result<Vec<f32>> {
        let target_channels = usize::from(self.target.channels);
        let remixed = remix(&chunk.samples, chunk.channels, target_channels);

        if chunk.sample_rate == self.target.sample_rate {
            self.resampler = None;
            return Ok(remixed);
        }

        let rebuild = self
            .resampler
            .as_ref()
            .map_or(true, |r| r.input_rate() != chunk.sample_rate);
        if rebuild {
            self.resampler = Some(Resampler::new(
                chunk.sample_rate,
                self.target.sample_rate,
                target_channels,
            )?);
        }

        match self.resampler.as_mut() {
            Some(resampler) => resampler.process(&remixed),
            None => Ok(remixed),
        }
    }

    /// Drain the resampler tail at end of stream.
    pub fn finish(&mut self) -> Result<Vec<f32>> {
        match self.resampler.as_mut() {
            Some(resampler) => resampler.flush(),
            None => Ok(Vec::new()),
        }
    }

    /// Forget buffered input, e.g. after a seek.
    pub fn reset(&mut self) {
        if let Some(resampler) = self.resampler.as_mut() {
            resampler.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_remix_mono_to_stereo_duplicates() {
        assert_eq!(remix(&[0.1, 0.2], 1, 2), vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    #[allow(clippy::float_cmp)]
    fn test_remix_stereo_to_mono_averages() {
        assert_eq!(remix(&[0.25, 0.75, -1.0, 1.0], 2, 1), vec![0.5f32, 0.0]);
    }

    #[test]
    fn test_remix_surround_to_stereo_truncates() {
        let frame = [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0];
        assert_eq!(remix(&frame, 6, 2), vec![1.0, 2.0]);
    }

    #[test]
    fn test_same_rate_passes_through() {
        let mut converter = StreamConverter::new(OutputSpec::new(48000, 2));
        let chunk = DecodedChunk {
            samples: vec![0.5; 2048],
            channels: 2,
            sample_rate: 48000,
        };
        assert_eq!(converter.convert(&chunk).unwrap(), chunk.samples);
        assert!(converter.finish().unwrap().is_empty());
    }

    #[test]
    fn test_resampled_length_tracks_rate_ratio() {
        let mut converter = StreamConverter::new(OutputSpec::new(48000, 1));
        let chunk = DecodedChunk {
            samples: vec![0.25; 24000],
            channels: 1,
            sample_rate: 24000,
        };
        let mut out = converter.convert(&chunk).unwrap();
        out.extend(converter.finish().unwrap());
        // One second of input is one second of output, give or take the
        // resampler's internal delay.
        assert!(out.len() > 44000 && out.len() <= 48000, "got {}", out.len());
    }
}
