//! Device collaborator contract.
//!
//! The engine never programs registers or installs interrupt handlers itself.
//! Everything hardware-facing goes through [`DeviceCollaborator`]: claiming a
//! subsystem, binding the driver-owned sample memory, programming clock and
//! channel list, arming events and reporting buffer progress. The real
//! transport (kernel driver, firmware protocol) implements this trait; the
//! [`sim`](crate::sim) module provides a software implementation.
//!
//! Event delivery is push-based: the collaborator receives the session's
//! [`EventChannel`] at claim time and latches hardware conditions into it from
//! whatever context its transport uses (interrupt thread, async callback).
//! [`DeviceCollaborator::pending_events`] is the pull-based fallback used by
//! the polling wait strategy.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::buffer::{BufferGeometry, BufferPolicy};
use crate::error::Result;
use crate::events::{EventChannel, EventMask};

/// Which conversion pipeline a session drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubsystemKind {
    /// Acquisition: hardware fills frames, the session drains them
    AnalogInput,
    /// Generation: the session fills frames, hardware drains them
    AnalogOutput,
}

impl SubsystemKind {
    /// Check if this subsystem produces data for the session.
    pub fn is_acquisition(self) -> bool {
        matches!(self, Self::AnalogInput)
    }
}

impl fmt::Display for SubsystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AnalogInput => write!(f, "Analog Input"),
            Self::AnalogOutput => write!(f, "Analog Output"),
        }
    }
}

/// Exclusive claim on one subsystem instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    /// Subsystem this handle owns
    pub kind: SubsystemKind,
    /// Collaborator-assigned identifier
    pub id: u32,
}

/// Driver-owned sample memory bound to a claimed subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub u32);

/// Progress report for the oldest frame the session has not handled yet.
///
/// For acquisition this is the oldest filled frame; for generation it is the
/// next frame the session should fill. `valid_scans` is zero when nothing is
/// ready and never exceeds one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferProgress {
    /// Scan offset of the frame
    pub scan_offset: usize,
    /// Scans ready to read (acquisition) or free to write (generation)
    pub valid_scans: usize,
    /// A non-wrapped buffer has been fully handled and hardware has halted;
    /// no further frames will be reported
    pub complete: bool,
}

/// Contract the engine needs from the hardware/driver transport.
///
/// All methods take `&self`; implementations synchronize internally, as the
/// acquisition and generation sessions call in from separate threads.
pub trait DeviceCollaborator: Send + Sync {
    /// Number of channels the subsystem can sample in one scan.
    fn channel_capacity(&self, kind: SubsystemKind) -> usize;

    /// Frequency of the conversion clock that rate divisors divide.
    fn base_clock_hz(&self) -> f64;

    /// Claim exclusive ownership of a subsystem.
    ///
    /// Fails with `DeviceBusy` if the subsystem is already claimed. `events`
    /// receives every hardware condition raised for this claim.
    fn claim_subsystem(&self, kind: SubsystemKind, events: Arc<EventChannel>)
        -> Result<DeviceHandle>;

    /// Give up a claim.
    fn release_subsystem(&self, handle: DeviceHandle) -> Result<()>;

    /// Bind sample memory of the given shape.
    fn bind_buffer(
        &self,
        handle: DeviceHandle,
        geometry: BufferGeometry,
        policy: BufferPolicy,
    ) -> Result<BufferHandle>;

    /// Release sample memory.
    fn unbind_buffer(&self, handle: DeviceHandle, buffer: BufferHandle) -> Result<()>;

    /// Program the channel list and the conversion clock divisor.
    fn configure_clock_and_channels(
        &self,
        handle: DeviceHandle,
        channels: &[u32],
        rate_divisor: u32,
    ) -> Result<()>;

    /// Enable hardware raising of `mask`.
    fn arm_events(&self, handle: DeviceHandle, mask: EventMask) -> Result<()>;

    /// Disable hardware raising of `mask`.
    fn disarm_events(&self, handle: DeviceHandle, mask: EventMask) -> Result<()>;

    /// Read and clear the hardware's pending event register.
    fn pending_events(&self, handle: DeviceHandle) -> Result<EventMask>;

    /// Begin producing or consuming scans.
    fn start(&self, handle: DeviceHandle) -> Result<()>;

    /// Halt the conversion clock. Idempotent.
    fn stop(&self, handle: DeviceHandle) -> Result<()>;

    /// Report the oldest frame the session has not handled.
    fn query_buffer_progress(&self, handle: DeviceHandle) -> Result<BufferProgress>;

    /// Copy `out.len()` samples starting at `scan_offset` out of the buffer.
    fn read_scans(
        &self,
        handle: DeviceHandle,
        buffer: BufferHandle,
        scan_offset: usize,
        out: &mut [u32],
    ) -> Result<()>;

    /// Copy `words` into the buffer starting at `scan_offset`.
    fn write_scans(
        &self,
        handle: DeviceHandle,
        buffer: BufferHandle,
        scan_offset: usize,
        words: &[u32],
    ) -> Result<()>;

    /// Acknowledge the frame last reported by
    /// [`query_buffer_progress`](Self::query_buffer_progress): read
    /// (acquisition) or filled (generation).
    fn release_scans(&self, handle: DeviceHandle, scans: usize) -> Result<()>;
}
