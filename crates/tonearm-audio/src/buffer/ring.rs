//! Lock-free ring buffer for audio streaming.
//!
//! Single producer (the pipeline worker) and single consumer (the output
//! callback). Samples are stored as `f32` bit patterns in atomic slots so
//! the buffer needs no `unsafe`.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Lock-free single-producer, single-consumer ring buffer.
///
/// Positions are free-running counters; the slot index is `pos & mask`.
pub struct RingBuffer {
    slots: Box<[AtomicU32]>,
    read_pos: AtomicUsize,
    write_pos: AtomicUsize,
    /// Buffer capacity (power of 2 for efficient modulo).
    capacity: usize,
    /// Mask for efficient modulo (capacity - 1).
    mask: usize,
}

impl RingBuffer {
    /// Create a new ring buffer with the specified capacity.
    ///
    /// The capacity will be rounded up to the next power of 2.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity).map(|_| AtomicU32::new(0)).collect();

        Self {
            slots,
            read_pos: AtomicUsize::new(0),
            write_pos: AtomicUsize::new(0),
            capacity,
            mask: capacity - 1,
        }
    }

    /// Get the buffer capacity.
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get the number of samples available for reading.
    pub fn available(&self) -> usize {
        let write = self.write_pos.load(Ordering::Acquire);
        let read = self.read_pos.load(Ordering::Acquire);
        write.wrapping_sub(read)
    }

    /// Get the number of free slots for writing.
    pub fn free(&self) -> usize {
        self.capacity - self.available()
    }

    pub fn is_empty(&self) -> bool {
        self.available() == 0
    }

    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    /// Current write counter. Used as a flush mark: everything written before
    /// it belongs to the old position.
    pub fn write_position(&self) -> usize {
        self.write_pos.load(Ordering::Acquire)
    }

    /// Write samples to the buffer. Producer side.
    ///
    /// Returns the number of samples actually written.
    pub fn write(&self, samples: &[f32]) -> usize {
        let write_pos = self.write_pos.load(Ordering::Relaxed);
        let read_pos = self.read_pos.load(Ordering::Acquire);

        let space = self.capacity - write_pos.wrapping_sub(read_pos);
        let to_write = samples.len().min(space);

        for (offset, sample) in samples[..to_write].iter().enumerate() {
            let idx = write_pos.wrapping_add(offset) & self.mask;
            self.slots[idx].store(sample.to_bits(), Ordering::Relaxed);
        }

        if to_write > 0 {
            self.write_pos
                .store(write_pos.wrapping_add(to_write), Ordering::Release);
        }

        to_write
    }

    /// Read samples from the buffer. Consumer side.
    ///
    /// Returns the number of samples actually read.
    pub fn read(&self, output: &mut [f32]) -> usize {
        let read_pos = self.read_pos.load(Ordering::Relaxed);
        let write_pos = self.write_pos.load(Ordering::Acquire);

        let available = write_pos.wrapping_sub(read_pos);
        let to_read = output.len().min(available);

        for (offset, sample) in output[..to_read].iter_mut().enumerate() {
            let idx = read_pos.wrapping_add(offset) & self.mask;
            *sample = f32::from_bits(self.slots[idx].load(Ordering::Relaxed));
        }

        if to_read > 0 {
            self.read_pos
                .store(read_pos.wrapping_add(to_read), Ordering::Release);
        }

        to_read
    }

    /// Drop every sample written before `mark`. Consumer side.
    ///
    /// A mark the reader has already passed is ignored. Returns the number of
    /// samples discarded.
    pub fn discard_until(&self, mark: usize) -> usize {
        let read_pos = self.read_pos.load(Ordering::Relaxed);
        let write_pos = self.write_pos.load(Ordering::Acquire);

        let distance = mark.wrapping_sub(read_pos);
        if distance == 0 || distance > write_pos.wrapping_sub(read_pos) {
            return 0;
        }

        self.read_pos.store(mark, Ordering::Release);
        distance
    }
}

/// Thread-safe reference to a ring buffer.
pub type SharedRingBuffer = Arc<RingBuffer>;

/// Create a new shared ring buffer.
pub fn shared_ring_buffer(capacity: usize) -> SharedRingBuffer {
    Arc::new(RingBuffer::new(capacity))
}
