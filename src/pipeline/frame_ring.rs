//! Single-producer single-consumer ring of fixed-size audio frames.
//!
//! Each ring is a pair of `ringbuf` queues: one holding raw samples, one
//! holding a [`FrameHeader`] per frame. The writer pushes samples before the
//! header and the reader pops the header before the samples, so a reader that
//! sees a header always sees the complete frame behind it.
//!
//! The consuming ends live behind a mutex shared by both halves. Only a
//! [`OverflowPolicy::DropOldest`] writer that finds the ring physically full
//! takes it, to evict stale frames itself; the reader only ever `try_lock`s
//! it, so [`FrameReader::try_read_into`] and [`FrameWriter::try_write`] on a
//! `DropNewest` ring never block or allocate and can run on a real-time
//! thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};

use crate::format::PipelineFormat;
use crate::AudioFrame;

/// What happens when a frame is written to a full ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Reject the incoming frame and count it as dropped.
    ///
    /// Used on the capture path, where the real-time writer cannot wait.
    DropNewest,
    /// Keep the incoming frame and discard the oldest ones beyond capacity.
    ///
    /// The reader trims on every read; a writer that finds the ring
    /// physically full evicts on its own, so a stalled reader never costs
    /// fresh frames.
    ///
    /// Used for inbound participant audio, where stale audio is worse than
    /// lost audio.
    DropOldest,
}

/// Metadata stored alongside each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameHeader {
    /// Sequence number of the frame.
    pub sequence: u64,
    /// Timestamp of the frame.
    pub timestamp: Duration,
}

impl FrameHeader {
    /// Creates a header.
    pub const fn new(sequence: u64, timestamp: Duration) -> Self {
        Self {
            sequence,
            timestamp,
        }
    }
}

#[derive(Debug)]
struct RingShared {
    pipeline: PipelineFormat,
    frame_len: usize,
    /// Logical capacity in frames.
    slots: usize,
    policy: OverflowPolicy,
    overflows: AtomicU64,
}

/// Consuming ends of both queues, always popped together.
struct ReadHalf {
    samples: HeapCons<i16>,
    headers: HeapCons<FrameHeader>,
}

impl ReadHalf {
    fn skip(&mut self, frames: usize, frame_len: usize) -> usize {
        let skipped = self.headers.skip(frames);
        self.samples.skip(skipped * frame_len);
        skipped
    }

    /// Drops the oldest frames until at most `keep` remain.
    fn trim_to(&mut self, keep: usize, frame_len: usize) -> usize {
        let excess = self.headers.occupied_len().saturating_sub(keep);
        if excess > 0 {
            self.skip(excess, frame_len)
        } else {
            0
        }
    }
}

/// Write half of a frame ring.
pub struct FrameWriter {
    samples: HeapProd<i16>,
    headers: HeapProd<FrameHeader>,
    read: Arc<Mutex<ReadHalf>>,
    shared: Arc<RingShared>,
}

/// Read half of a frame ring.
pub struct FrameReader {
    read: Arc<Mutex<ReadHalf>>,
    shared: Arc<RingShared>,
}

/// Creates a ring holding `slots` frames of `pipeline.frame_len()` samples.
///
/// `slots` is rounded up to a power of two (minimum 1). With
/// [`OverflowPolicy::DropOldest`] the ring reserves the same amount again as
/// headroom, so the writer can keep writing while the reader trims.
pub fn frame_ring(
    slots: usize,
    pipeline: PipelineFormat,
    policy: OverflowPolicy,
) -> (FrameWriter, FrameReader) {
    let slots = slots.max(1).next_power_of_two();
    let frame_len = pipeline.frame_len().max(1);
    let physical = match policy {
        OverflowPolicy::DropNewest => slots,
        OverflowPolicy::DropOldest => slots * 2,
    };

    let (sample_prod, sample_cons) = HeapRb::<i16>::new(physical * frame_len).split();
    let (header_prod, header_cons) = HeapRb::<FrameHeader>::new(physical).split();

    let read = Arc::new(Mutex::new(ReadHalf {
        samples: sample_cons,
        headers: header_cons,
    }));
    let shared = Arc::new(RingShared {
        pipeline,
        frame_len,
        slots,
        policy,
        overflows: AtomicU64::new(0),
    });

    (
        FrameWriter {
            samples: sample_prod,
            headers: header_prod,
            read: Arc::clone(&read),
            shared: Arc::clone(&shared),
        },
        FrameReader { read, shared },
    )
}

impl FrameWriter {
    /// Writes one frame.
    ///
    /// Returns `false` if the frame was not stored: the ring is full under
    /// [`OverflowPolicy::DropNewest`] (counted in
    /// [`overflows`](Self::overflows)), or `samples` is not exactly one frame
    /// long. Under [`OverflowPolicy::DropOldest`] every well-formed frame is
    /// stored, displacing the oldest once the ring holds `capacity()` frames.
    pub fn try_write(&mut self, header: FrameHeader, samples: &[i16]) -> bool {
        let frame_len = self.shared.frame_len;
        if samples.len() != frame_len {
            return false;
        }

        let full = self.headers.vacant_len() == 0 || self.samples.vacant_len() < frame_len;
        match self.shared.policy {
            OverflowPolicy::DropNewest => {
                if full {
                    self.shared.overflows.fetch_add(1, Ordering::Relaxed);
                    return false;
                }
            }
            OverflowPolicy::DropOldest => {
                if self.headers.occupied_len() >= self.shared.slots {
                    // One stale frame makes way for this one
                    self.shared.overflows.fetch_add(1, Ordering::Relaxed);
                }
                if full {
                    self.read.lock().trim_to(self.shared.slots, frame_len);
                }
            }
        }

        // Samples first: the header publishes the frame
        let pushed = self.samples.push_slice(samples);
        debug_assert_eq!(pushed, frame_len);
        self.headers.try_push(header).is_ok()
    }

    /// Writes an [`AudioFrame`], which must be one pipeline frame long.
    pub fn try_write_frame(&mut self, frame: &AudioFrame) -> bool {
        self.try_write(
            FrameHeader::new(frame.sequence, frame.timestamp),
            &frame.samples,
        )
    }

    /// Frames currently queued (including any awaiting a trim).
    pub fn len(&self) -> usize {
        self.headers.occupied_len()
    }

    /// Returns `true` if no frames are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logical capacity in frames.
    pub fn capacity(&self) -> usize {
        self.shared.slots
    }

    /// Frames dropped (`DropNewest`) or displaced (`DropOldest`) so far.
    pub fn overflows(&self) -> u64 {
        self.shared.overflows.load(Ordering::Relaxed)
    }
}

impl FrameReader {
    /// Reads the oldest frame into `out` without allocating.
    ///
    /// `out` must hold at least one frame; only the first `frame_len()`
    /// samples are written. Returns `None` if the ring is empty or the writer
    /// is evicting stale frames at this moment.
    pub fn try_read_into(&mut self, out: &mut [i16]) -> Option<FrameHeader> {
        let frame_len = self.shared.frame_len;
        if out.len() < frame_len {
            return None;
        }

        let mut read = self.read.try_lock()?;
        if self.shared.policy == OverflowPolicy::DropOldest {
            read.trim_to(self.shared.slots, frame_len);
        }
        let header = read.headers.try_pop()?;
        let popped = read.samples.pop_slice(&mut out[..frame_len]);
        debug_assert_eq!(popped, frame_len);
        Some(header)
    }

    /// Reads the oldest frame into a newly allocated [`AudioFrame`].
    pub fn try_read(&mut self) -> Option<AudioFrame> {
        let mut samples = vec![0i16; self.shared.frame_len];
        let header = self.try_read_into(&mut samples)?;
        Some(AudioFrame::new(
            samples,
            header.sequence,
            header.timestamp,
            self.shared.pipeline.format,
        ))
    }

    /// Discards up to `frames` of the oldest frames; returns how many went.
    pub fn skip(&mut self, frames: usize) -> usize {
        self.read.lock().skip(frames, self.shared.frame_len)
    }

    /// Discards everything queued.
    pub fn clear(&mut self) -> usize {
        self.read.lock().trim_to(0, self.shared.frame_len)
    }

    /// Frames ready to read.
    pub fn len(&self) -> usize {
        let queued = self.read.lock().headers.occupied_len();
        match self.shared.policy {
            OverflowPolicy::DropNewest => queued,
            OverflowPolicy::DropOldest => queued.min(self.shared.slots),
        }
    }

    /// Returns `true` if no frames are ready.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logical capacity in frames.
    pub fn capacity(&self) -> usize {
        self.shared.slots
    }

    /// Samples per frame.
    pub fn frame_len(&self) -> usize {
        self.shared.frame_len
    }

    /// Frames dropped (`DropNewest`) or displaced (`DropOldest`) so far.
    pub fn overflows(&self) -> u64 {
        self.shared.overflows.load(Ordering::Relaxed)
    }
}
