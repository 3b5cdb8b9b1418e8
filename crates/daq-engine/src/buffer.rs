//! Circular frame buffer geometry and index bookkeeping.
//!
//! A buffer is a ring of `frame_count` frames, each `scans_per_frame` scans of
//! `scan_size` samples. Offsets handed across the device contract are scan
//! offsets; every offset this module produces is reduced modulo the ring's
//! scan capacity, so no arithmetic here can step outside the buffer.
//!
//! The sample memory itself belongs to the device collaborator. Both sides
//! keep a [`FrameBuffer`] for index state only: the device advances the
//! producer count as hardware fills (or drains) frames, the session advances
//! the consumer count as it handles them.
//!
//! ```text
//!  frame:     0         1         2         3
//!          ┌─────────┬─────────┬─────────┬─────────┐
//!          │ consumed│ pending │ pending │  free   │
//!          └─────────┴─────────┴─────────┴─────────┘
//!                     ▲ read cursor       ▲ write cursor
//! ```

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

bitflags! {
    /// Buffer operating policy, selected when the buffer is bound.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferPolicy: u32 {
        /// Writer restarts at frame 0 after the last frame (endless stream).
        /// Without it the writer stops at capacity until the buffer is reset.
        const WRAPPED = 1 << 0;
        /// A frame may only be rewritten after the consumer released it.
        /// Without it a wrapped writer overwrites unreleased frames.
        const RECYCLED = 1 << 1;
    }
}

/// Fixed shape of a buffer: frames × scans × samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferGeometry {
    /// Number of frames in the ring
    pub frame_count: usize,
    /// Scans per frame
    pub scans_per_frame: usize,
    /// Samples (or packed words) per scan
    pub scan_size: usize,
}

impl BufferGeometry {
    /// Create a validated geometry. Every dimension must be non-zero and the
    /// total capacity must fit in `usize`.
    pub fn new(frame_count: usize, scans_per_frame: usize, scan_size: usize) -> Result<Self> {
        if frame_count == 0 || scans_per_frame == 0 || scan_size == 0 {
            return Err(EngineError::config(format!(
                "buffer dimensions must be positive: {} frames × {} scans × {} samples",
                frame_count, scans_per_frame, scan_size
            )));
        }
        frame_count
            .checked_mul(scans_per_frame)
            .and_then(|scans| scans.checked_mul(scan_size))
            .ok_or_else(|| {
                EngineError::config(format!(
                    "buffer of {} frames × {} scans × {} samples overflows",
                    frame_count, scans_per_frame, scan_size
                ))
            })?;

        Ok(Self {
            frame_count,
            scans_per_frame,
            scan_size,
        })
    }

    /// Samples in one frame.
    pub fn frame_size(&self) -> usize {
        self.scans_per_frame * self.scan_size
    }

    /// Scans in the whole ring.
    pub fn capacity_scans(&self) -> usize {
        self.frame_count * self.scans_per_frame
    }

    /// Samples in the whole ring. Constant for the buffer's lifetime.
    pub fn capacity(&self) -> usize {
        self.capacity_scans() * self.scan_size
    }

    /// Scan offset of the start of frame `frame_index` (any index, reduced
    /// modulo the frame count).
    pub fn frame_offset(&self, frame_index: u64) -> usize {
        // frame_count fits in u64 on every supported target
        let frame = (frame_index % self.frame_count as u64) as usize;
        frame * self.scans_per_frame
    }

    /// Advance a scan offset by `scans_consumed`, wrapping at the ring's scan
    /// capacity.
    pub fn advance(&self, current_scan_offset: usize, scans_consumed: usize) -> usize {
        let capacity = self.capacity_scans();
        (current_scan_offset % capacity + scans_consumed % capacity) % capacity
    }

    /// Sample index of a scan offset.
    pub fn sample_offset(&self, scan_offset: usize) -> usize {
        (scan_offset % self.capacity_scans()) * self.scan_size
    }

    /// Frame index holding a scan offset.
    pub fn frame_of(&self, scan_offset: usize) -> usize {
        (scan_offset % self.capacity_scans()) / self.scans_per_frame
    }

    /// Check that an offset reported by the device starts a frame inside the ring.
    pub fn is_frame_aligned(&self, scan_offset: usize) -> bool {
        scan_offset < self.capacity_scans() && scan_offset % self.scans_per_frame == 0
    }
}

/// Why the writer may not fill the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteBlocked {
    /// Non-wrapped buffer reached capacity; it must be reset first
    Exhausted,
    /// Recycled buffer: the next frame has not been released by the consumer
    Unreleased,
}

/// Outcome of filling one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameWrite {
    /// Scan offset of the frame that was filled
    pub scan_offset: usize,
    /// Frame sequence number since the last reset
    pub sequence: u64,
    /// This frame was the last one in the ring (a whole-buffer pass completed)
    pub buffer_complete: bool,
    /// An unreleased frame was overwritten to make room (wrapped, not recycled)
    pub overwrote: bool,
}

/// Ring index state for one buffer.
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    geometry: BufferGeometry,
    policy: BufferPolicy,
    written: u64,
    released: u64,
}

impl FrameBuffer {
    /// Allocate index state for a ring of `frame_count` frames.
    pub fn allocate(
        frame_count: usize,
        scans_per_frame: usize,
        scan_size: usize,
        policy: BufferPolicy,
    ) -> Result<Self> {
        Ok(Self::with_geometry(
            BufferGeometry::new(frame_count, scans_per_frame, scan_size)?,
            policy,
        ))
    }

    /// Index state for an already validated geometry.
    pub fn with_geometry(geometry: BufferGeometry, policy: BufferPolicy) -> Self {
        Self {
            geometry,
            policy,
            written: 0,
            released: 0,
        }
    }

    /// Buffer geometry.
    pub fn geometry(&self) -> &BufferGeometry {
        &self.geometry
    }

    /// Operating policy.
    pub fn policy(&self) -> BufferPolicy {
        self.policy
    }

    /// See [`BufferGeometry::frame_offset`].
    pub fn frame_offset(&self, frame_index: u64) -> usize {
        self.geometry.frame_offset(frame_index)
    }

    /// See [`BufferGeometry::advance`].
    pub fn advance(&self, current_scan_offset: usize, scans_consumed: usize) -> usize {
        self.geometry.advance(current_scan_offset, scans_consumed)
    }

    /// Frames filled since the last reset.
    pub fn frames_written(&self) -> u64 {
        self.written
    }

    /// Frames released since the last reset.
    pub fn frames_released(&self) -> u64 {
        self.released
    }

    /// Filled frames the consumer has not released yet.
    pub fn pending_frames(&self) -> u64 {
        self.written - self.released
    }

    /// Scan offset of the next frame the writer will fill.
    pub fn write_offset(&self) -> usize {
        self.geometry.frame_offset(self.written)
    }

    /// Scan offset of the oldest unreleased frame (the read cursor).
    pub fn read_offset(&self) -> usize {
        self.geometry.frame_offset(self.released)
    }

    /// Check whether the writer may fill the next frame.
    pub fn can_write(&self) -> std::result::Result<(), WriteBlocked> {
        let frame_count = self.geometry.frame_count as u64;
        if !self.policy.contains(BufferPolicy::WRAPPED) && self.written >= frame_count {
            return Err(WriteBlocked::Exhausted);
        }
        if self.policy.contains(BufferPolicy::RECYCLED) && self.pending_frames() >= frame_count {
            return Err(WriteBlocked::Unreleased);
        }
        Ok(())
    }

    /// Record that the writer filled the next frame.
    pub fn write_frame(&mut self) -> std::result::Result<FrameWrite, WriteBlocked> {
        self.can_write()?;

        let frame_count = self.geometry.frame_count as u64;
        let overwrote = self.pending_frames() >= frame_count;
        if overwrote {
            // Only reachable when wrapped and not recycled: the oldest frame is lost
            self.released += 1;
        }

        let write = FrameWrite {
            scan_offset: self.write_offset(),
            sequence: self.written,
            buffer_complete: (self.written + 1) % frame_count == 0,
            overwrote,
        };
        self.written += 1;
        Ok(write)
    }

    /// Release the oldest pending frame. Returns its scan offset, or `None` if
    /// nothing is pending.
    pub fn release_frame(&mut self) -> Option<usize> {
        if self.pending_frames() == 0 {
            return None;
        }
        let offset = self.read_offset();
        self.released += 1;
        Some(offset)
    }

    /// Advance the read cursor past one frame without consulting the writer
    /// count. Used by a consumer that mirrors a ring it does not fill.
    /// Returns the offset of the frame consumed.
    pub fn consume_frame(&mut self) -> usize {
        let offset = self.read_offset();
        self.released += 1;
        self.written = self.written.max(self.released);
        offset
    }

    /// Move the read cursor forward to `scan_offset`, which must be frame
    /// aligned. Returns the number of frames skipped.
    pub fn skip_to(&mut self, scan_offset: usize) -> Result<usize> {
        if !self.geometry.is_frame_aligned(scan_offset) {
            return Err(EngineError::config(format!(
                "scan offset {} is not a frame boundary of a {}-scan ring",
                scan_offset,
                self.geometry.capacity_scans()
            )));
        }
        let capacity = self.geometry.capacity_scans();
        let distance = (scan_offset + capacity - self.read_offset()) % capacity;
        let skipped = distance / self.geometry.scans_per_frame;
        self.released += skipped as u64;
        self.written = self.written.max(self.released);
        Ok(skipped)
    }

    /// Forget all progress; the next write lands in frame 0.
    pub fn reset(&mut self) {
        self.written = 0;
        self.released = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rejects_zero_dimensions() {
        let policy = BufferPolicy::WRAPPED;
        assert!(FrameBuffer::allocate(0, 4, 2, policy).is_err());
        assert!(FrameBuffer::allocate(4, 0, 2, policy).is_err());
        assert!(FrameBuffer::allocate(4, 4, 0, policy).is_err());
        assert!(FrameBuffer::allocate(usize::MAX, 2, 2, policy).is_err());
        let buffer = FrameBuffer::allocate(4, 8, 2, policy).unwrap();
        assert_eq!(buffer.geometry().capacity(), 64);
        assert_eq!(buffer.geometry().frame_size(), 16);
    }

    #[test]
    fn test_frame_offset_wraps() {
        let geometry = BufferGeometry::new(4, 8, 2).unwrap();
        assert_eq!(geometry.frame_offset(0), 0);
        assert_eq!(geometry.frame_offset(3), 24);
        assert_eq!(geometry.frame_offset(4), 0);
        assert_eq!(geometry.frame_offset(u64::MAX), 24);
    }

    #[test]
    fn test_advance_wraps() {
        let geometry = BufferGeometry::new(4, 8, 2).unwrap();
        assert_eq!(geometry.advance(0, 8), 8);
        assert_eq!(geometry.advance(24, 8), 0);
        assert_eq!(geometry.advance(30, 5), 3);
        assert_eq!(geometry.advance(31, usize::MAX), (31 + usize::MAX % 32) % 32);
    }

    #[test]
    fn test_non_wrapped_stops_at_capacity() {
        let mut buffer = FrameBuffer::allocate(2, 4, 1, BufferPolicy::empty()).unwrap();
        let first = buffer.write_frame().unwrap();
        assert_eq!(first.scan_offset, 0);
        assert!(!first.buffer_complete);
        let second = buffer.write_frame().unwrap();
        assert_eq!(second.scan_offset, 4);
        assert!(second.buffer_complete);

        // Releasing does not free space in a non-wrapped buffer
        buffer.release_frame();
        assert_eq!(buffer.write_frame(), Err(WriteBlocked::Exhausted));

        buffer.reset();
        assert_eq!(buffer.write_frame().unwrap().scan_offset, 0);
    }

    #[test]
    fn test_recycled_blocks_on_unreleased_frame() {
        let policy = BufferPolicy::WRAPPED | BufferPolicy::RECYCLED;
        let mut buffer = FrameBuffer::allocate(2, 4, 1, policy).unwrap();
        buffer.write_frame().unwrap();
        buffer.write_frame().unwrap();
        assert_eq!(buffer.can_write(), Err(WriteBlocked::Unreleased));

        assert_eq!(buffer.release_frame(), Some(0));
        let third = buffer.write_frame().unwrap();
        assert_eq!(third.scan_offset, 0);
        assert_eq!(third.sequence, 2);
        assert!(!third.overwrote);
    }

    #[test]
    fn test_wrapped_overwrites_oldest() {
        let mut buffer = FrameBuffer::allocate(2, 4, 1, BufferPolicy::WRAPPED).unwrap();
        buffer.write_frame().unwrap();
        buffer.write_frame().unwrap();
        let third = buffer.write_frame().unwrap();
        assert!(third.overwrote);
        assert_eq!(buffer.pending_frames(), 2);
        // Oldest surviving frame is frame 1
        assert_eq!(buffer.read_offset(), 4);
    }

    #[test]
    fn test_skip_to() {
        let mut buffer = FrameBuffer::allocate(4, 4, 1, BufferPolicy::WRAPPED).unwrap();
        assert_eq!(buffer.skip_to(8).unwrap(), 2);
        assert_eq!(buffer.read_offset(), 8);
        assert_eq!(buffer.skip_to(0).unwrap(), 2);
        assert_eq!(buffer.read_offset(), 0);
        assert!(buffer.skip_to(3).is_err());
        assert!(buffer.skip_to(16).is_err());
    }

    #[test]
    fn test_consume_frame_mirror() {
        let mut mirror = FrameBuffer::allocate(1, 4, 2, BufferPolicy::WRAPPED).unwrap();
        assert_eq!(mirror.consume_frame(), 0);
        assert_eq!(mirror.consume_frame(), 0);
        assert_eq!(mirror.frames_released(), 2);

        let mut mirror = FrameBuffer::allocate(3, 4, 2, BufferPolicy::WRAPPED).unwrap();
        let offsets: Vec<usize> = (0..4).map(|_| mirror.consume_frame()).collect();
        assert_eq!(offsets, vec![0, 4, 8, 0]);
    }

    #[test]
    fn test_release_empty() {
        let mut buffer = FrameBuffer::allocate(2, 4, 1, BufferPolicy::WRAPPED).unwrap();
        assert_eq!(buffer.release_frame(), None);
        assert_eq!(buffer.pending_frames(), 0);
    }
}
