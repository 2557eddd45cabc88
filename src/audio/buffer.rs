//! Lock-free single-producer / single-consumer ring buffer for `i16` samples.
//!
//! One half lives on an audio-device callback thread, the other on the
//! control loop.  Cursors are monotonic `AtomicUsize` values; the slot index
//! is `cursor & (capacity - 1)` (capacity is rounded up to a power of two so
//! wraparound needs no modulo).  The producer publishes data with a `Release`
//! store of the write cursor and the consumer observes it with an `Acquire`
//! load, so no locks are needed on the hot path.
//!
//! Two overflow policies exist, fixed per buffer instance:
//!
//! * [`OverflowPolicy::OverwriteOldest`] — producer priority; the consumer is
//!   lapped and fast-forwards to the oldest surviving sample.  Used for the
//!   capture and playback rings, where fresh audio always beats stale audio.
//! * [`OverflowPolicy::Reject`] — `write` stores what fits and reports the
//!   count; nothing already queued is ever dropped.
//!
//! # Example
//!
//! ```rust
//! use voice_client::audio::buffer::{channel, OverflowPolicy};
//!
//! let (mut tx, mut rx) = channel(8, OverflowPolicy::Reject);
//! tx.write(&[1, 2, 3]);
//!
//! let mut out = [0i16; 3];
//! assert_eq!(rx.pop(&mut out), 3);
//! assert_eq!(out, [1, 2, 3]);
//! ```

use std::sync::atomic::{AtomicI16, AtomicUsize, Ordering};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// OverflowPolicy
// ---------------------------------------------------------------------------

/// What happens when a write would exceed the buffer capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Overwrite the oldest unread samples (producer priority).
    OverwriteOldest,
    /// Store only what fits; `write` returns the count actually stored.
    Reject,
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

struct Shared {
    slots: Box<[AtomicI16]>,
    mask: usize,
    /// Monotonic write cursor (never wraps to zero; the slot index does).
    write: AtomicUsize,
    /// Monotonic read cursor, advanced only by the consumer.
    read: AtomicUsize,
    policy: OverflowPolicy,
}

impl Shared {
    fn capacity(&self) -> usize {
        self.mask + 1
    }
}

/// Create a ring buffer of at least `capacity` samples (rounded up to the
/// next power of two) and return its two endpoints.
///
/// # Panics
///
/// Panics if `capacity == 0`.
pub fn channel(capacity: usize, policy: OverflowPolicy) -> (Producer, Consumer) {
    assert!(capacity > 0, "ring buffer capacity must be > 0");
    let capacity = capacity.next_power_of_two();

    let slots: Box<[AtomicI16]> = (0..capacity).map(|_| AtomicI16::new(0)).collect();
    let shared = Arc::new(Shared {
        slots,
        mask: capacity - 1,
        write: AtomicUsize::new(0),
        read: AtomicUsize::new(0),
        policy,
    });

    (
        Producer {
            shared: Arc::clone(&shared),
        },
        Consumer { shared },
    )
}

// ---------------------------------------------------------------------------
// Producer
// ---------------------------------------------------------------------------

/// Writing endpoint.  Exactly one thread may own this.
pub struct Producer {
    shared: Arc<Shared>,
}

impl Producer {
    /// Append `data` and return the number of samples actually stored.
    ///
    /// Under [`OverflowPolicy::OverwriteOldest`] this is always `data.len()`;
    /// under [`OverflowPolicy::Reject`] it may be less.
    pub fn write(&mut self, data: &[i16]) -> usize {
        let s = &*self.shared;
        let w = s.write.load(Ordering::Relaxed);

        let n = match s.policy {
            OverflowPolicy::OverwriteOldest => data.len(),
            OverflowPolicy::Reject => {
                let r = s.read.load(Ordering::Acquire);
                let free = s.capacity() - (w - r);
                data.len().min(free)
            }
        };

        for (i, &sample) in data[..n].iter().enumerate() {
            s.slots[(w + i) & s.mask].store(sample, Ordering::Relaxed);
        }
        s.write.store(w + n, Ordering::Release);
        n
    }

    /// Raw monotonic write cursor, in samples since creation.
    ///
    /// The echo-cancellation synchronizer samples this each tick to measure
    /// how much new far-end audio was queued.
    pub fn write_cursor(&self) -> usize {
        self.shared.write.load(Ordering::Relaxed)
    }

    /// Maximum number of samples the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }
}

// ---------------------------------------------------------------------------
// Consumer
// ---------------------------------------------------------------------------

/// Reading endpoint.  Exactly one thread may own this.
pub struct Consumer {
    shared: Arc<Shared>,
}

impl Consumer {
    /// Load both cursors and, when the producer has lapped us
    /// (`OverwriteOldest` only), fast-forward the read cursor to the oldest
    /// surviving sample.  Returns `(read, write)`.
    fn sync_cursors(&mut self) -> (usize, usize) {
        let s = &*self.shared;
        let w = s.write.load(Ordering::Acquire);
        let mut r = s.read.load(Ordering::Relaxed);
        if w - r > s.capacity() {
            r = w - s.capacity();
            s.read.store(r, Ordering::Release);
        }
        (r, w)
    }

    /// Number of unread samples (at most `capacity`).
    pub fn len(&mut self) -> usize {
        let (r, w) = self.sync_cursors();
        w - r
    }

    /// Returns `true` when no unread samples are available.
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// Read up to `out.len()` samples in FIFO order; returns the count read.
    pub fn pop(&mut self, out: &mut [i16]) -> usize {
        let (r, w) = self.sync_cursors();
        let n = out.len().min(w - r);
        self.take(r, &mut out[..n]);
        n
    }

    /// Read exactly `out.len()` samples, or consume nothing.
    ///
    /// Returns `false` without touching the read cursor when fewer samples
    /// are queued — the caller treats that as backpressure, not an error.
    pub fn read_exact(&mut self, out: &mut [i16]) -> bool {
        let (r, w) = self.sync_cursors();
        if w - r < out.len() {
            return false;
        }
        self.take(r, out);
        true
    }

    /// Discard everything currently queued.
    pub fn clear(&mut self) {
        let s = &*self.shared;
        let w = s.write.load(Ordering::Acquire);
        s.read.store(w, Ordering::Release);
    }

    /// Raw monotonic read cursor, in samples since creation.
    pub fn read_cursor(&self) -> usize {
        self.shared.read.load(Ordering::Relaxed)
    }

    /// Maximum number of samples the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.shared.capacity()
    }

    fn take(&mut self, r: usize, out: &mut [i16]) {
        let s = &*self.shared;
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = s.slots[(r + i) & s.mask].load(Ordering::Relaxed);
        }
        s.read.store(r + out.len(), Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
