//! Transport fields shared between the engine, the pipeline worker, and the
//! output callback.
//!
//! Everything sits behind one short-held lock so the callback always sees a
//! consistent state, position, and pending seek.
//!
//! Each pipeline is bound to the generation that was current when it
//! started. Retiring bumps the generation, after which that pipeline's
//! callback and worker can no longer change anything here.

use parking_lot::Mutex;
use tonearm_core::TransportState;

use crate::buffer::RingBuffer;

/// A seek the output callback has not applied yet.
#[derive(Debug, Clone, Copy, PartialEq)]
struct PendingSeek {
    seq: u64,
    position: f64,
    /// Ring write counter once the worker has repositioned the decoder.
    /// Until then the callback renders silence.
    mark: Option<usize>,
}

#[derive(Debug, Default)]
struct Inner {
    state: TransportState,
    position: f64,
    duration: f64,
    /// Device frames per second; zero while no device is open.
    sample_rate: u32,
    gain: f32,
    pending_seek: Option<PendingSeek>,
    seek_seq: u64,
    ended: bool,
    generation: u64,
}

pub(crate) struct Transport {
    inner: Mutex<Inner>,
}

impl Transport {
    pub(crate) fn new(gain: f32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                gain,
                ..Inner::default()
            }),
        }
    }

    pub(crate) fn state(&self) -> TransportState {
        self.inner.lock().state
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    /// Detach every running pipeline from this transport.
    pub(crate) fn retire(&self) {
        let mut inner = self.inner.lock();
        inner.generation += 1;
        inner.sample_rate = 0;
    }

    /// Set the state and return the previous one.
    pub(crate) fn set_state(&self, state: TransportState) -> TransportState {
        std::mem::replace(&mut self.inner.lock().state, state)
    }

    /// Current position, reflecting a seek that is still in flight.
    pub(crate) fn position(&self) -> f64 {
        let inner = self.inner.lock();
        let position = inner.pending_seek.map_or(inner.position, |p| p.position);
        position.clamp(0.0, inner.duration.max(0.0))
    }

    pub(crate) fn ended(&self) -> bool {
        self.inner.lock().ended
    }

    pub(crate) fn set_gain(&self, gain: f32) {
        self.inner.lock().gain = gain;
    }

    /// Fresh track: Paused at 0.
    pub(crate) fn reset(&self, duration: f64) {
        let mut inner = self.inner.lock();
        inner.state = TransportState::Paused;
        inner.position = 0.0;
        inner.duration = duration;
        inner.pending_seek = None;
        inner.ended = false;
    }

    /// Track unloaded.
    pub(crate) fn clear(&self) {
        self.reset(0.0);
        self.inner.lock().state = TransportState::Stopped;
    }

    /// User stop: Stopped at 0, any in-flight seek dropped.
    pub(crate) fn stop(&self) -> TransportState {
        let mut inner = self.inner.lock();
        inner.position = 0.0;
        inner.pending_seek = None;
        inner.ended = false;
        std::mem::replace(&mut inner.state, TransportState::Stopped)
    }

    /// Set the position directly. Only valid while no output callback runs.
    pub(crate) fn set_position(&self, position: f64) {
        let mut inner = self.inner.lock();
        inner.position = position;
        inner.pending_seek = None;
        inner.ended = false;
    }

    /// Device opened for pipeline `generation`.
    pub(crate) fn set_sample_rate(&self, generation: u64, sample_rate: u32) {
        let mut inner = self.inner.lock();
        if inner.generation == generation {
            inner.sample_rate = sample_rate;
        }
    }

    /// Device loss: Playing becomes Paused. Returns true if it was playing.
    pub(crate) fn pause_if_playing(&self, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation || inner.state != TransportState::Playing {
            return false;
        }
        inner.state = TransportState::Paused;
        true
    }

    /// Register a seek; the callback goes silent until the worker publishes it.
    pub(crate) fn begin_seek(&self, position: f64) -> u64 {
        let mut inner = self.inner.lock();
        inner.seek_seq += 1;
        inner.ended = false;
        inner.pending_seek = Some(PendingSeek {
            seq: inner.seek_seq,
            position,
            mark: None,
        });
        inner.seek_seq
    }

    /// The worker repositioned the decoder for seek `seq`; samples before
    /// `mark` are stale. Ignored if a newer seek superseded it.
    pub(crate) fn publish_seek(&self, seq: u64, mark: usize) -> bool {
        let mut inner = self.inner.lock();
        match inner.pending_seek.as_mut() {
            Some(pending) if pending.seq == seq => {
                pending.mark = Some(mark);
                true
            }
            _ => false,
        }
    }

    /// Apply an in-flight seek without a worker, e.g. after the pipeline died.
    pub(crate) fn settle_seek(&self) {
        let mut inner = self.inner.lock();
        if let Some(pending) = inner.pending_seek.take() {
            inner.position = pending.position;
        }
    }

    /// End-of-track check. Transitions to (Stopped, ended) at the duration
    /// when playing, no seek is pending, and `drained` holds.
    pub(crate) fn finish_if(&self, generation: u64, drained: impl FnOnce() -> bool) -> bool {
        let mut inner = self.inner.lock();
        if inner.generation != generation
            || inner.state != TransportState::Playing
            || inner.pending_seek.is_some()
            || !drained()
        {
            return false;
        }
        inner.state = TransportState::Stopped;
        inner.position = inner.duration;
        inner.ended = true;
        true
    }

    /// Output callback body: fill `out` from the ring at the current gain.
    ///
    /// Returns the number of frames that advanced the position.
    pub(crate) fn render(
        &self,
        generation: u64,
        ring: &RingBuffer,
        out: &mut [f32],
        channels: usize,
    ) -> usize {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            out.fill(0.0);
            return 0;
        }

        if let Some(pending) = inner.pending_seek {
            let Some(mark) = pending.mark else {
                out.fill(0.0);
                return 0;
            };
            ring.discard_until(mark);
            inner.position = pending.position;
            inner.pending_seek = None;
        }

        if inner.state != TransportState::Playing || inner.sample_rate == 0 {
            out.fill(0.0);
            return 0;
        }

        let channels = channels.max(1);
        let whole = out.len() - out.len() % channels;
        let read = ring.read(&mut out[..whole]);

        let gain = inner.gain;
        for sample in &mut out[..read] {
            *sample *= gain;
        }
        out[read..].fill(0.0);

        let frames = read / channels;
        inner.position =
            (inner.position + frames as f64 / f64::from(inner.sample_rate)).min(inner.duration);
        frames
    }
}
