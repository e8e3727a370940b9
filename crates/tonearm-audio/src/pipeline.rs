//! Per-session decode/output worker.
//!
//! One pipeline owns one device acquisition. Its thread opens the device,
//! decodes ahead into the ring, applies seeks, and watches for end of track
//! and device loss. The device is dropped before teardown is signalled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tonearm_core::{Error, Result, TransportState};
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{shared_ring_buffer, SharedRingBuffer};
use crate::config::EngineConfig;
use crate::decode::TrackDecoder;
use crate::engine::EngineEvent;
use crate::output::{DeviceId, OutputBackend, Renderer};
use crate::resample::StreamConverter;
use crate::transport::Transport;

/// Minimum free room (in frames) before the worker decodes more.
const MIN_FILL_FRAMES: usize = 256;

/// Packets decoded per loop turn before commands are checked again.
const PACKETS_PER_TURN: usize = 8;

#[derive(Debug)]
enum WorkerCommand {
    Seek { seq: u64, position: f64 },
    Shutdown,
}

/// Everything a pipeline borrows from its engine.
#[derive(Clone)]
pub(crate) struct PipelineContext {
    pub(crate) backend: Arc<dyn OutputBackend>,
    pub(crate) transport: Arc<Transport>,
    pub(crate) events: Sender<EngineEvent>,
    pub(crate) config: EngineConfig,
}

/// Handle to a running pipeline thread.
pub(crate) struct Pipeline {
    commands: Sender<WorkerCommand>,
    done: Receiver<DeviceId>,
    alive: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    device_id: DeviceId,
}

impl Pipeline {
    /// Start a pipeline playing `decoder` from wherever it is positioned.
    ///
    /// Waits (up to the teardown timeout) for the device to open, so a
    /// failure leaves nothing behind.
    pub(crate) fn spawn(decoder: TrackDecoder, ctx: &PipelineContext) -> Result<Self> {
        let (command_tx, command_rx) = unbounded();
        let (ready_tx, ready_rx) = bounded(1);
        let (done_tx, done_rx) = bounded(1);
        let alive = Arc::new(AtomicBool::new(true));
        let generation = ctx.transport.generation();

        let worker_ctx = ctx.clone();
        let worker_alive = alive.clone();
        let thread = std::thread::Builder::new()
            .name("audio-pipeline".to_string())
            .spawn(move || {
                run(
                    decoder,
                    generation,
                    &worker_ctx,
                    &command_rx,
                    &ready_tx,
                    &done_tx,
                    &worker_alive,
                );
            })
            .map_err(|e| Error::Internal(format!("Failed to spawn pipeline thread: {e}")))?;

        match ready_rx.recv_timeout(ctx.config.teardown_timeout()) {
            Ok(Ok(device_id)) => Ok(Self {
                commands: command_tx,
                done: done_rx,
                alive,
                thread: Some(thread),
                device_id,
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(RecvTimeoutError::Timeout) => {
                // Dropping the command sender makes the worker exit once the
                // open returns; its output is already cut off
                ctx.transport.retire();
                warn!("Output device did not open in time");
                Err(Error::DeviceUnavailable(
                    "timed out opening the output device".to_string(),
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = thread.join();
                Err(Error::Internal(
                    "pipeline thread exited before opening the device".to_string(),
                ))
            }
        }
    }

    pub(crate) const fn device_id(&self) -> DeviceId {
        self.device_id
    }

    /// False once the worker has left its loop (end of track, device loss,
    /// shutdown).
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Queue a seek. Returns false if the worker is gone.
    pub(crate) fn seek(&self, seq: u64, position: f64) -> bool {
        self.is_alive()
            && self
                .commands
                .send(WorkerCommand::Seek { seq, position })
                .is_ok()
    }

    /// Ask the worker to release the device. Does not wait.
    pub(crate) fn shutdown(&self) {
        let _ = self.commands.send(WorkerCommand::Shutdown);
    }

    /// Wait until the device is released and the thread has exited.
    ///
    /// Returns false if the worker did not confirm within `timeout`; the
    /// thread is then left detached.
    pub(crate) fn wait(mut self, timeout: Duration) -> bool {
        self.shutdown();
        let confirmed = match self.done.recv_timeout(timeout) {
            Ok(id) => {
                trace!("Teardown of {id} confirmed");
                true
            }
            // Worker dropped the sender without confirming, so it has exited
            Err(RecvTimeoutError::Disconnected) => true,
            Err(RecvTimeoutError::Timeout) => false,
        };

        if let Some(thread) = self.thread.take() {
            if confirmed {
                if thread.join().is_err() {
                    error!("Pipeline thread for {} panicked", self.device_id);
                }
            } else {
                error!(
                    "Pipeline for {} did not release its device within {:?}",
                    self.device_id, timeout
                );
            }
        }
        confirmed
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.thread.is_some() {
            // Never block in drop; the worker exits on its own
            self.shutdown();
        }
    }
}

/// Why the worker loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Shutdown,
    EndOfTrack,
    DeviceLost,
    Disconnected,
}

fn run(
    decoder: TrackDecoder,
    generation: u64,
    ctx: &PipelineContext,
    commands: &Receiver<WorkerCommand>,
    ready: &Sender<Result<DeviceId>>,
    done: &Sender<DeviceId>,
    alive: &AtomicBool,
) {
    let ring = shared_ring_buffer(ctx.config.buffer_samples);
    let renderer = Arc::new(Renderer::new(
        ring.clone(),
        ctx.transport.clone(),
        generation,
    ));

    let stream = match ctx.backend.open(renderer.clone()) {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Failed to open output device: {e}");
            alive.store(false, Ordering::Release);
            let _ = ready.send(Err(e));
            return;
        }
    };

    let spec = stream.spec();
    let device_id = stream.id();
    debug!(
        "Pipeline for {} on {} ({device_id}): {} Hz, {} channels",
        decoder.metadata().title,
        stream.name(),
        spec.sample_rate,
        spec.channels
    );

    ctx.transport.set_sample_rate(generation, spec.sample_rate);

    let mut worker = Worker {
        decoder,
        converter: StreamConverter::new(spec),
        ring,
        renderer,
        transport: ctx.transport.clone(),
        generation,
        events: ctx.events.clone(),
        channels: usize::from(spec.channels).max(1),
        poll_interval: ctx.config.poll_interval(),
        pending: Vec::new(),
        offset: 0,
        drained: false,
    };

    let _ = ready.send(Ok(device_id));
    let exit = worker.run(commands);
    alive.store(false, Ordering::Release);

    match exit {
        Exit::EndOfTrack => {
            info!("Playback finished");
            worker.emit(EngineEvent::StateChanged(TransportState::Stopped));
            worker.emit(EngineEvent::EndOfTrack);
        }
        Exit::DeviceLost => {
            if worker.transport.pause_if_playing(generation) {
                worker.emit(EngineEvent::StateChanged(TransportState::Paused));
            }
            if worker.transport.generation() == generation {
                worker.emit(EngineEvent::DeviceLost);
            }
        }
        Exit::Shutdown | Exit::Disconnected => {
            debug!("Pipeline on {device_id} shutting down ({exit:?})");
        }
    }

    drop(worker);
    drop(stream);
    debug!("Output device {device_id} released");
    let _ = done.send(device_id);
}

struct Worker {
    decoder: TrackDecoder,
    converter: StreamConverter,
    ring: SharedRingBuffer,
    renderer: Arc<Renderer>,
    transport: Arc<Transport>,
    generation: u64,
    events: Sender<EngineEvent>,
    channels: usize,
    poll_interval: Duration,
    /// Converted samples not yet in the ring, and how far into them we are.
    pending: Vec<f32>,
    offset: usize,
    /// Decoder has no more packets (until the next seek).
    drained: bool,
}

impl Worker {
    fn run(&mut self, commands: &Receiver<WorkerCommand>) -> Exit {
        loop {
            let wait = if self.wants_data() {
                Duration::ZERO
            } else {
                self.poll_interval
            };

            // Drain every queued command; only the newest seek matters
            let mut latest_seek = None;
            let first = match commands.recv_timeout(wait) {
                Ok(cmd) => Some(cmd),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => return Exit::Disconnected,
            };
            for cmd in first.into_iter().chain(commands.try_iter()) {
                match cmd {
                    WorkerCommand::Shutdown => return Exit::Shutdown,
                    WorkerCommand::Seek { seq, position } => latest_seek = Some((seq, position)),
                }
            }

            if let Some((seq, position)) = latest_seek {
                self.seek(seq, position);
            }

            if self.renderer.device_lost() {
                error!("Output device lost");
                return Exit::DeviceLost;
            }

            self.fill();

            if self.drained && !self.has_pending() {
                let ring = &self.ring;
                if self.transport.finish_if(self.generation, || ring.is_empty()) {
                    return Exit::EndOfTrack;
                }
            }
        }
    }

    fn has_pending(&self) -> bool {
        self.offset < self.pending.len()
    }

    fn wants_data(&self) -> bool {
        (!self.drained || self.has_pending()) && self.ring.free() >= MIN_FILL_FRAMES * self.channels
    }

    /// Decode ahead until the ring is full, the track is drained, or this
    /// turn's packet budget is spent.
    fn fill(&mut self) {
        for _ in 0..PACKETS_PER_TURN {
            if !self.flush_pending() || self.drained {
                return;
            }

            match self.decoder.next_chunk() {
                Ok(Some(chunk)) => match self.converter.convert(&chunk) {
                    Ok(samples) => self.set_pending(samples),
                    Err(e) => {
                        error!("Conversion failed: {e}");
                        self.emit(EngineEvent::Error(e.to_string()));
                        self.drained = true;
                    }
                },
                Ok(None) => {
                    debug!("Decoder drained");
                    self.drained = true;
                    match self.converter.finish() {
                        Ok(tail) => self.set_pending(tail),
                        Err(e) => warn!("Dropping resampler tail: {e}"),
                    }
                }
                Err(e) => {
                    error!("Decode error: {e}");
                    self.emit(EngineEvent::Error(e.to_string()));
                    self.drained = true;
                }
            }
        }
        self.flush_pending();
    }

    fn set_pending(&mut self, samples: Vec<f32>) {
        self.pending = samples;
        self.offset = 0;
    }

    /// Move pending samples into the ring in whole frames. Returns true when
    /// nothing is left pending.
    fn flush_pending(&mut self) -> bool {
        if self.has_pending() {
            let room = self.ring.free() / self.channels * self.channels;
            let count = (self.pending.len() - self.offset).min(room);
            let written = self
                .ring
                .write(&self.pending[self.offset..self.offset + count]);
            self.offset += written;
        }
        !self.has_pending()
    }

    fn seek(&mut self, seq: u64, position: f64) {
        self.pending.clear();
        self.offset = 0;
        self.converter.reset();

        match self.decoder.seek(position) {
            Ok(()) => self.drained = false,
            Err(e) => {
                warn!("{e}");
                self.emit(EngineEvent::Error(e.to_string()));
                self.drained = true;
            }
        }

        // Everything written so far belongs to the old position
        let mark = self.ring.write_position();
        if self.transport.publish_seek(seq, mark) {
            self.emit(EngineEvent::Seeked(position));
        } else {
            trace!("Seek {seq} superseded");
        }
    }

    fn emit(&self, event: EngineEvent) {
        if self.events.try_send(event).is_err() {
            trace!("Event queue full, dropping event");
        }
    }
}
