//! Audio decoding using symphonia.

use std::fs::File;
use std::path::Path;

use bytes::Bytes;
use symphonia::core::{
    audio::{SampleBuffer, SignalSpec},
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSourceStream, MediaSourceStreamOptions},
    meta::{MetadataOptions, MetadataRevision, StandardTagKey, StandardVisualKey},
    probe::{Hint, ProbeResult},
    units::{Time, TimeBase},
};
use tonearm_core::{Artwork, Error, LoadError, Result, SampleFormat, TrackMetadata};
use tracing::{debug, trace, warn};

/// A block of decoded, interleaved samples.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChunk {
    pub samples: Vec<f32>,
    pub channels: usize,
    pub sample_rate: u32,
}

/// Decoder for a single file, positioned by a decode cursor.
pub struct TrackDecoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    time_base: Option<TimeBase>,
    metadata: TrackMetadata,
    /// Reused conversion buffer with the spec and frame capacity it was built for.
    sample_buf: Option<(SampleBuffer<f32>, SignalSpec, usize)>,
    /// Frames to drop after an accurate seek landed before the target.
    skip_frames: u64,
    exhausted: bool,
}

impl TrackDecoder {
    /// Open and probe a file. Reads headers and tags but no audio.
    pub fn open(path: &Path) -> std::result::Result<Self, LoadError> {
        Self::open_with(path, None)
    }

    /// Reopen a track that was loaded before, reusing its metadata instead
    /// of reading tags and scanning for the duration again.
    pub fn reopen(track: &TrackMetadata) -> std::result::Result<Self, LoadError> {
        Self::open_with(&track.path, Some(track))
    }

    fn open_with(
        path: &Path,
        known: Option<&TrackMetadata>,
    ) -> std::result::Result<Self, LoadError> {
        let mut probed = probe(path)?;

        let track = probed
            .format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| LoadError::UnsupportedFormat("no audio tracks found".to_string()))?;

        let track_id = track.id;
        let params = track.codec_params.clone();

        let sample_rate = params
            .sample_rate
            .ok_or_else(|| LoadError::UnsupportedFormat("unknown sample rate".to_string()))?;
        let channels = params.channels.map_or(2, |c| c.count() as u16);
        let format = SampleFormat {
            channels,
            sample_rate,
            bits_per_sample: params.bits_per_sample,
        };

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| LoadError::UnsupportedFormat(format!("no decoder for codec: {e}")))?;

        let metadata = match known {
            Some(track) => track.clone(),
            None => {
                let duration =
                    match stream_duration(params.n_frames, params.time_base, sample_rate) {
                        Some(d) => d,
                        None => scan_duration(path, params.time_base, sample_rate)?,
                    };
                let mut metadata = TrackMetadata::new(path, duration, format);
                let tags = read_tags(&mut probed);
                if let Some(title) = tags.title {
                    metadata.title = title;
                }
                metadata.artist = tags.artist;
                metadata.artwork = tags.artwork;
                metadata
            }
        };

        debug!(
            "Opened {}: id={}, {} Hz, {} channels, {:.2}s",
            path.display(),
            track_id,
            sample_rate,
            channels,
            metadata.duration
        );

        Ok(Self {
            format: probed.format,
            decoder,
            track_id,
            time_base: params.time_base,
            metadata,
            sample_buf: None,
            skip_frames: 0,
            exhausted: false,
        })
    }

    pub const fn metadata(&self) -> &TrackMetadata {
        &self.metadata
    }

    /// Decode the next packet. `Ok(None)` means end of stream.
    pub fn next_chunk(&mut self) -> Result<Option<DecodedChunk>> {
        if self.exhausted {
            return Ok(None);
        }

        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.exhausted = true;
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => {
                    debug!("Stream requires decoder reset; treating as end of track");
                    self.exhausted = true;
                    return Ok(None);
                }
                Err(e) => {
                    return Err(Error::AudioDecode(format!("Failed to read packet: {e}")));
                }
            };

            // Skip packets for other tracks
            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    // Corrupt frames are dropped, playback goes on
                    warn!("Decode error (skipping): {e}");
                    continue;
                }
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.exhausted = true;
                    return Ok(None);
                }
                Err(e) => {
                    return Err(Error::AudioDecode(format!("Decode failed: {e}")));
                }
            };

            let spec = *decoded.spec();
            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }

            let reuse = matches!(
                &self.sample_buf,
                Some((_, buf_spec, cap)) if *buf_spec == spec && *cap >= decoded.capacity()
            );
            if !reuse {
                self.sample_buf = Some((
                    SampleBuffer::new(decoded.capacity() as u64, spec),
                    spec,
                    decoded.capacity(),
                ));
            }
            let Some((buf, _, _)) = self.sample_buf.as_mut() else {
                continue;
            };
            buf.copy_interleaved_ref(decoded);

            let channels = spec.channels.count();
            let skip = self.skip_frames.min(frames as u64) as usize;
            self.skip_frames -= skip as u64;
            if skip == frames {
                trace!("Dropped {skip} frames before seek target");
                continue;
            }

            let samples = buf.samples()[skip * channels..frames * channels].to_vec();
            return Ok(Some(DecodedChunk {
                samples,
                channels,
                sample_rate: spec.rate,
            }));
        }
    }

    /// Move the decode cursor to `seconds`, clamped to the track.
    pub fn seek(&mut self, seconds: f64) -> Result<()> {
        let target = self.metadata.clamp_position(seconds);

        match self.format.seek(
            SeekMode::Accurate,
            SeekTo::Time {
                time: Time::from(target),
                track_id: Some(self.track_id),
            },
        ) {
            Ok(seeked) => {
                self.decoder.reset();
                self.exhausted = false;
                self.skip_frames =
                    self.ts_to_frames(seeked.required_ts.saturating_sub(seeked.actual_ts));
                debug!(
                    "Seeked to {:.3}s (skipping {} frames)",
                    target, self.skip_frames
                );
                Ok(())
            }
            // Seeking onto the very end is how a slider drag to 100% looks
            Err(_) if target >= self.metadata.duration - 1e-3 => {
                self.exhausted = true;
                Ok(())
            }
            Err(e) => Err(Error::AudioDecode(format!("Seek failed: {e}"))),
        }
    }

    fn ts_to_frames(&self, ts: u64) -> u64 {
        match self.time_base {
            Some(tb) => {
                let time = tb.calc_time(ts);
                let seconds = time.seconds as f64 + time.frac;
                (seconds * f64::from(self.metadata.format.sample_rate)).round() as u64
            }
            None => ts,
        }
    }
}

/// Probe a file with an extension hint.
fn probe(path: &Path) -> std::result::Result<ProbeResult, LoadError> {
    let file = File::open(path).map_err(|e| LoadError::io(path, e))?;
    let mss = MediaSourceStream::new(Box::new(file), MediaSourceStreamOptions::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let format_opts = FormatOptions {
        enable_gapless: true,
        ..Default::default()
    };

    symphonia::default::get_probe()
        .format(&hint, mss, &format_opts, &MetadataOptions::default())
        .map_err(|e| match e {
            SymphoniaError::IoError(io) if io.kind() != std::io::ErrorKind::UnexpectedEof => {
                LoadError::io(path, io)
            }
            other => LoadError::UnsupportedFormat(other.to_string()),
        })
}

/// Duration from the stream header, if the container reports a frame count.
fn stream_duration(n_frames: Option<u64>, time_base: Option<TimeBase>, sample_rate: u32) -> Option<f64> {
    let n_frames = n_frames?;
    match time_base {
        Some(tb) => {
            let time = tb.calc_time(n_frames);
            Some(time.seconds as f64 + time.frac)
        }
        None if sample_rate > 0 => Some(n_frames as f64 / f64::from(sample_rate)),
        None => None,
    }
}

/// Duration by walking every packet, for streams without a frame count.
fn scan_duration(
    path: &Path,
    time_base: Option<TimeBase>,
    sample_rate: u32,
) -> std::result::Result<f64, LoadError> {
    let mut probed = probe(path)?;
    let track_id = probed
        .format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .map(|t| t.id)
        .ok_or_else(|| LoadError::UnsupportedFormat("no audio tracks found".to_string()))?;

    let mut total_ts = 0u64;
    loop {
        match probed.format.next_packet() {
            Ok(packet) if packet.track_id() == track_id => total_ts += packet.dur(),
            Ok(_) => {}
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => {
                return Err(LoadError::UnsupportedFormat(format!(
                    "cannot determine duration: {e}"
                )));
            }
        }
    }

    debug!("Scanned duration of {}: {} ts", path.display(), total_ts);
    stream_duration(Some(total_ts), time_base, sample_rate)
        .ok_or_else(|| LoadError::UnsupportedFormat("cannot determine duration".to_string()))
}

#[derive(Default)]
struct Tags {
    title: Option<String>,
    artist: Option<String>,
    artwork: Option<Artwork>,
}

impl Tags {
    /// Take values from a revision without overwriting earlier ones.
    fn absorb(&mut self, revision: &MetadataRevision) {
        for tag in revision.tags() {
            match tag.std_key {
                Some(StandardTagKey::TrackTitle) if self.title.is_none() => {
                    self.title = non_empty(tag.value.to_string());
                }
                Some(StandardTagKey::Artist) if self.artist.is_none() => {
                    self.artist = non_empty(tag.value.to_string());
                }
                _ => {}
            }
        }

        if self.artwork.is_none() {
            let visuals = revision.visuals();
            let cover = visuals
                .iter()
                .find(|v| v.usage == Some(StandardVisualKey::FrontCover))
                .or_else(|| visuals.first());
            self.artwork = cover.map(|v| Artwork {
                media_type: v.media_type.clone(),
                data: Bytes::copy_from_slice(&v.data),
            });
        }
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn read_tags(probed: &mut ProbeResult) -> Tags {
    let mut tags = Tags::default();

    if let Some(meta) = probed.metadata.get() {
        if let Some(revision) = meta.current() {
            tags.absorb(revision);
        }
    }

    let meta = probed.format.metadata();
    if let Some(revision) = meta.current() {
        tags.absorb(revision);
    }

    tags
}
