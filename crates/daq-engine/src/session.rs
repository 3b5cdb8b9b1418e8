//! Session lifecycle for one claimed subsystem.
//!
//! A [`Session`] owns the claim on one acquisition or generation subsystem and
//! walks it through a fixed set of states:
//!
//! ```text
//!            acquire          configure          start
//!  Closed ───────────► Unconfigured ───────► Configured ───────► Running
//!         ◄───────────              ◄───────             ◄───────
//!            release          unconfigure          halt
//! ```
//!
//! Every transition outside these edges fails with
//! [`EngineError::InvalidTransition`] and leaves the state unchanged.
//! [`Session::stop`] is the exception: it tears down from any state back to
//! `Closed`, continues past individual failures and is safe to repeat.
//!
//! While running, [`Session::wait_frame`] delivers frame progress. Fault
//! events (overrun, underrun, unexpected halt) latch into the session and
//! make every later wait fail until the session is stopped.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace, warn};

use crate::buffer::{BufferGeometry, BufferPolicy, FrameBuffer};
use crate::codec::{ChannelEncoding, ChannelPacker, PackingPolicy};
use crate::device::{BufferHandle, BufferProgress, DeviceCollaborator, DeviceHandle, SubsystemKind};
use crate::error::{EngineError, Result};
use crate::events::{EventChannel, EventMask, WakePolicy, MAX_WAIT};

/// Multiple of the frame period used as the derived wait timeout.
pub const DEFAULT_TIMEOUT_FACTOR: f64 = 4.0;

/// Lower bound on the derived wait timeout.
pub const DEFAULT_MIN_TIMEOUT: Duration = Duration::from_millis(50);

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No subsystem claimed
    Closed,
    /// Subsystem claimed, nothing bound
    Unconfigured,
    /// Buffer bound, clock and channels programmed, hardware idle
    Configured,
    /// Hardware converting
    Running,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Unconfigured => "unconfigured",
            Self::Configured => "configured",
            Self::Running => "running",
        };
        f.write_str(name)
    }
}

/// How a running session learns about hardware events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitStrategy {
    /// Block on the event channel the device latches into
    #[default]
    Events,
    /// Read the device's pending register every `interval`
    Polling {
        /// Delay between register reads
        interval: Duration,
    },
}

/// One entry of a session's channel list.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelConfig {
    /// Hardware channel number
    pub id: u32,
    /// Sample coding and physical range
    pub encoding: ChannelEncoding,
}

impl ChannelConfig {
    /// Create a channel entry.
    pub fn new(id: u32, encoding: ChannelEncoding) -> Self {
        Self { id, encoding }
    }
}

/// Everything `configure` needs to bind and program a subsystem.
///
/// Use [`SessionConfig::builder`] to construct.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// Channel list in scan order
    pub channels: Vec<ChannelConfig>,
    /// Requested scan rate in Hz
    pub sample_rate: f64,
    /// Frames in the ring
    pub frame_count: usize,
    /// Scans per frame
    pub scans_per_frame: usize,
    /// Wrap and recycle behaviour of the buffer
    pub policy: BufferPolicy,
    /// Completion events to arm; faults are always armed
    pub events: EventMask,
    /// Word layout of generation buffers
    pub packing: PackingPolicy,
    /// How waits observe events
    pub wait: WaitStrategy,
    /// Explicit wait timeout; derived from the frame period when unset
    pub timeout: Option<Duration>,
    /// Multiple of the frame period used for the derived timeout
    pub timeout_factor: f64,
    /// Floor of the derived timeout
    pub min_timeout: Duration,
    /// Report `BUFFER_DONE` without `FRAME_DONE` when both fire together
    pub exclusive_completion: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            channels: vec![ChannelConfig::new(0, ChannelEncoding::default())],
            sample_rate: 1000.0,
            frame_count: 4,
            scans_per_frame: 256,
            policy: BufferPolicy::WRAPPED,
            events: EventMask::COMPLETION,
            packing: PackingPolicy::Plain,
            wait: WaitStrategy::Events,
            timeout: None,
            timeout_factor: DEFAULT_TIMEOUT_FACTOR,
            min_timeout: DEFAULT_MIN_TIMEOUT,
            exclusive_completion: false,
        }
    }
}

impl SessionConfig {
    /// Create a builder starting from the defaults.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::default()
    }

    /// Hardware channel numbers in scan order.
    pub fn channel_ids(&self) -> Vec<u32> {
        self.channels.iter().map(|channel| channel.id).collect()
    }

    /// Channel encodings in scan order.
    pub fn encodings(&self) -> Vec<ChannelEncoding> {
        self.channels.iter().map(|channel| channel.encoding).collect()
    }

    /// Time to fill one frame at the requested rate.
    pub fn frame_period(&self) -> Duration {
        let seconds = self.scans_per_frame as f64 / self.sample_rate;
        Duration::from_secs_f64(seconds.min(MAX_WAIT.as_secs_f64()))
    }

    /// Timeout applied to each wait.
    pub fn wait_timeout(&self) -> Duration {
        if let Some(timeout) = self.timeout {
            return timeout.min(MAX_WAIT);
        }
        let derived = self.frame_period().as_secs_f64() * self.timeout_factor;
        Duration::from_secs_f64(derived.min(MAX_WAIT.as_secs_f64())).max(self.min_timeout)
    }

    /// Check everything that does not depend on the device.
    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(EngineError::config("channel list is empty"));
        }
        for (index, channel) in self.channels.iter().enumerate() {
            if self.channels[..index].iter().any(|other| other.id == channel.id) {
                return Err(EngineError::config(format!(
                    "channel {} appears more than once",
                    channel.id
                )));
            }
            channel.encoding.coding.validate()?;
            channel.encoding.range.validate()?;
        }
        if !self.sample_rate.is_finite() || self.sample_rate <= 0.0 {
            return Err(EngineError::config(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        BufferGeometry::new(self.frame_count, self.scans_per_frame, 1)?;
        if !self.timeout_factor.is_finite() || self.timeout_factor <= 0.0 {
            return Err(EngineError::config(format!(
                "timeout factor must be positive, got {}",
                self.timeout_factor
            )));
        }
        if let WaitStrategy::Polling { interval } = self.wait {
            if interval.is_zero() {
                return Err(EngineError::config("polling interval must be non-zero"));
            }
        }
        if !EventMask::HARDWARE.contains(self.events) {
            return Err(EngineError::config(format!(
                "events {:?} cannot be armed",
                self.events
            )));
        }
        Ok(())
    }
}

/// Builder for [`SessionConfig`].
#[derive(Debug, Default)]
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Replace the channel list; every channel gets the default encoding.
    pub fn channels(mut self, ids: &[u32]) -> Self {
        self.config.channels = ids
            .iter()
            .map(|&id| ChannelConfig::new(id, ChannelEncoding::default()))
            .collect();
        self
    }

    /// Replace the channel list with fully specified entries.
    pub fn channel_configs(mut self, channels: Vec<ChannelConfig>) -> Self {
        self.config.channels = channels;
        self
    }

    /// Apply one encoding to every channel currently listed.
    pub fn encoding(mut self, encoding: ChannelEncoding) -> Self {
        for channel in &mut self.config.channels {
            channel.encoding = encoding;
        }
        self
    }

    /// Set the scan rate in Hz.
    pub fn sample_rate(mut self, rate: f64) -> Self {
        self.config.sample_rate = rate;
        self
    }

    /// Set the number of frames in the ring.
    pub fn frame_count(mut self, frames: usize) -> Self {
        self.config.frame_count = frames;
        self
    }

    /// Set the scans per frame.
    pub fn scans_per_frame(mut self, scans: usize) -> Self {
        self.config.scans_per_frame = scans;
        self
    }

    /// Set the wrap and recycle policy.
    pub fn policy(mut self, policy: BufferPolicy) -> Self {
        self.config.policy = policy;
        self
    }

    /// Set the completion events to arm.
    pub fn events(mut self, events: EventMask) -> Self {
        self.config.events = events;
        self
    }

    /// Set the generation word layout.
    pub fn packing(mut self, packing: PackingPolicy) -> Self {
        self.config.packing = packing;
        self
    }

    /// Set how waits observe events.
    pub fn wait_strategy(mut self, wait: WaitStrategy) -> Self {
        self.config.wait = wait;
        self
    }

    /// Override the derived wait timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Set the frame-period multiple for the derived timeout.
    pub fn timeout_factor(mut self, factor: f64) -> Self {
        self.config.timeout_factor = factor;
        self
    }

    /// Set the floor of the derived timeout.
    pub fn min_timeout(mut self, timeout: Duration) -> Self {
        self.config.min_timeout = timeout;
        self
    }

    /// Report `BUFFER_DONE` alone when both completions fire together.
    pub fn exclusive_completion(mut self, exclusive: bool) -> Self {
        self.config.exclusive_completion = exclusive;
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<SessionConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Divisor of the base clock closest to `rate`.
pub fn rate_divisor(base_clock_hz: f64, rate: f64) -> Result<u32> {
    if !base_clock_hz.is_finite() || base_clock_hz <= 0.0 {
        return Err(EngineError::config(format!(
            "base clock must be positive, got {} Hz",
            base_clock_hz
        )));
    }
    if !rate.is_finite() || rate <= 0.0 {
        return Err(EngineError::config(format!(
            "sample rate must be positive, got {} Hz",
            rate
        )));
    }
    let divisor = (base_clock_hz / rate).round();
    if divisor < 1.0 {
        return Err(EngineError::config(format!(
            "sample rate {} Hz exceeds base clock {} Hz",
            rate, base_clock_hz
        )));
    }
    if divisor > f64::from(u32::MAX) {
        return Err(EngineError::config(format!(
            "sample rate {} Hz is below the slowest divisor of a {} Hz clock",
            rate, base_clock_hz
        )));
    }
    Ok(divisor as u32)
}

/// Frame handed to the caller by [`Session::wait_frame`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameProgress {
    /// Scan offset of the frame in the ring
    pub scan_offset: usize,
    /// Scans ready (acquisition) or free (generation)
    pub valid_scans: usize,
    /// Frames handled before this one since start
    pub sequence: u64,
    /// Completion and data-error events observed since the previous frame
    pub events: EventMask,
}

/// Counters for one session. Reset by `start`.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SessionStats {
    /// Frames released
    pub frames: u64,
    /// Scans released
    pub scans: u64,
    /// Waits that expired
    pub timeouts: u64,
    /// Overrun or underrun faults
    pub buffer_errors: u64,
    /// Non-fatal data error events
    pub data_errors: u64,
    /// Generation cursor jumps after the device skipped frames
    pub resyncs: u64,
    /// Scan rate the programmed divisor yields
    pub achieved_rate: f64,
}

/// Cross-thread handle that wakes a blocked [`Session::wait_frame`].
#[derive(Debug, Clone)]
pub struct SessionWaker {
    kind: SubsystemKind,
    events: Arc<EventChannel>,
}

impl SessionWaker {
    /// Force a `STOPPED` event; a blocked wait returns
    /// [`EngineError::Stopped`].
    pub fn wake(&self) {
        debug!(kind = %self.kind, "Forcing stop event");
        self.events.force_events(EventMask::STOPPED);
    }
}

struct ActiveConfig {
    config: SessionConfig,
    buffer: BufferHandle,
    ring: FrameBuffer,
    packer: ChannelPacker,
    interest: EventMask,
    timeout: Duration,
    observed: EventMask,
}

/// State machine around one claimed subsystem.
pub struct Session {
    device: Arc<dyn DeviceCollaborator>,
    kind: SubsystemKind,
    state: SessionState,
    events: Arc<EventChannel>,
    handle: Option<DeviceHandle>,
    active: Option<ActiveConfig>,
    fault: Option<EngineError>,
    stats: SessionStats,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("handle", &self.handle)
            .field("fault", &self.fault)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a closed session for `kind`.
    pub fn new(device: Arc<dyn DeviceCollaborator>, kind: SubsystemKind) -> Self {
        Self::with_wake_policy(device, kind, WakePolicy::All)
    }

    /// Create a closed session whose event channel uses `wake`.
    pub fn with_wake_policy(
        device: Arc<dyn DeviceCollaborator>,
        kind: SubsystemKind,
        wake: WakePolicy,
    ) -> Self {
        Self {
            device,
            kind,
            state: SessionState::Closed,
            events: Arc::new(EventChannel::new(wake)),
            handle: None,
            active: None,
            fault: None,
            stats: SessionStats::default(),
        }
    }

    /// Create a session and claim its subsystem.
    pub fn open(device: Arc<dyn DeviceCollaborator>, kind: SubsystemKind) -> Result<Self> {
        let mut session = Self::new(device, kind);
        session.acquire()?;
        Ok(session)
    }

    /// Subsystem this session drives.
    pub fn kind(&self) -> SubsystemKind {
        self.kind
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Counters since the last start.
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Latched fatal error, if any.
    pub fn fault(&self) -> Option<&EngineError> {
        self.fault.as_ref()
    }

    /// Active configuration, once configured.
    pub fn config(&self) -> Option<&SessionConfig> {
        self.active.as_ref().map(|active| &active.config)
    }

    /// Bound buffer shape, once configured.
    pub fn geometry(&self) -> Option<BufferGeometry> {
        self.active.as_ref().map(|active| *active.ring.geometry())
    }

    /// Word layout of the bound buffer, once configured.
    pub fn packer(&self) -> Option<&ChannelPacker> {
        self.active.as_ref().map(|active| &active.packer)
    }

    /// Timeout each wait uses, once configured.
    pub fn wait_timeout(&self) -> Option<Duration> {
        self.active.as_ref().map(|active| active.timeout)
    }

    /// Event channel shared with the device.
    pub fn events(&self) -> &Arc<EventChannel> {
        &self.events
    }

    /// Handle that can interrupt a wait from another thread.
    pub fn waker(&self) -> SessionWaker {
        SessionWaker {
            kind: self.kind,
            events: Arc::clone(&self.events),
        }
    }

    fn require(&self, operation: &'static str, expected: SessionState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(EngineError::InvalidTransition {
                operation,
                state: self.state,
            })
        }
    }

    fn claimed(&self, operation: &'static str) -> Result<DeviceHandle> {
        self.handle.ok_or(EngineError::InvalidTransition {
            operation,
            state: self.state,
        })
    }

    fn bound(&self, operation: &'static str) -> Result<(DeviceHandle, &ActiveConfig)> {
        match (self.handle, self.active.as_ref()) {
            (Some(handle), Some(active)) => Ok((handle, active)),
            _ => Err(EngineError::InvalidTransition {
                operation,
                state: self.state,
            }),
        }
    }

    /// Claim the subsystem. `Closed → Unconfigured`.
    pub fn acquire(&mut self) -> Result<()> {
        self.require("acquire", SessionState::Closed)?;
        let handle = self
            .device
            .claim_subsystem(self.kind, Arc::clone(&self.events))?;
        self.events.disarm(EventMask::all());
        self.handle = Some(handle);
        self.state = SessionState::Unconfigured;
        info!(kind = %self.kind, id = handle.id, "Claimed subsystem");
        Ok(())
    }

    /// Validate `config`, bind a buffer, program clock and channels and arm
    /// events. `Unconfigured → Configured`.
    ///
    /// On failure nothing stays bound and the session remains unconfigured.
    pub fn configure(&mut self, config: SessionConfig) -> Result<()> {
        self.require("configure", SessionState::Unconfigured)?;
        let handle = self.claimed("configure")?;
        config.validate()?;

        let capacity = self.device.channel_capacity(self.kind);
        if config.channels.len() > capacity {
            return Err(EngineError::config(format!(
                "{} channels requested but {} supports {}",
                config.channels.len(),
                self.kind,
                capacity
            )));
        }

        let packing = if self.kind.is_acquisition() {
            if config.packing != PackingPolicy::Plain {
                return Err(EngineError::config(format!(
                    "{} buffers hold one sample per word; {:?} packing is for generation",
                    self.kind, config.packing
                )));
            }
            PackingPolicy::Plain
        } else {
            config.packing
        };
        let ids = config.channel_ids();
        let raw_bits = config
            .channels
            .iter()
            .map(|channel| channel.encoding.coding.raw_bits())
            .fold(1, u32::max);
        let packer = ChannelPacker::new(packing, &ids, raw_bits)?;
        let geometry = BufferGeometry::new(
            config.frame_count,
            config.scans_per_frame,
            packer.words_per_scan(),
        )?;

        let base_clock = self.device.base_clock_hz();
        let divisor = rate_divisor(base_clock, config.sample_rate)?;
        let achieved_rate = base_clock / f64::from(divisor);

        let buffer = self.device.bind_buffer(handle, geometry, config.policy)?;
        if let Err(err) = self.device.configure_clock_and_channels(handle, &ids, divisor) {
            self.discard_buffer(handle, buffer);
            return Err(err);
        }
        let interest = config.events | EventMask::FAULTS;
        if let Err(err) = self.device.arm_events(handle, interest) {
            self.discard_buffer(handle, buffer);
            return Err(err);
        }
        self.events.arm(interest);

        if (achieved_rate - config.sample_rate).abs() > config.sample_rate * 1e-3 {
            debug!(
                kind = %self.kind,
                requested = config.sample_rate,
                achieved = achieved_rate,
                "Sample rate quantized by clock divisor"
            );
        }
        let timeout = config.wait_timeout();
        info!(
            kind = %self.kind,
            channels = ids.len(),
            rate = achieved_rate,
            divisor,
            frames = geometry.frame_count,
            scans_per_frame = geometry.scans_per_frame,
            ?timeout,
            "Configured session"
        );

        self.stats.achieved_rate = achieved_rate;
        self.active = Some(ActiveConfig {
            ring: FrameBuffer::with_geometry(geometry, config.policy),
            config,
            buffer,
            packer,
            interest,
            timeout,
            observed: EventMask::empty(),
        });
        self.state = SessionState::Configured;
        Ok(())
    }

    fn discard_buffer(&self, handle: DeviceHandle, buffer: BufferHandle) {
        if let Err(err) = self.device.unbind_buffer(handle, buffer) {
            warn!(kind = %self.kind, error = %err, "Failed to unbind buffer during rollback");
        }
    }

    /// Start conversions. `Configured → Running`.
    ///
    /// Refused while a fault from an earlier run is latched.
    pub fn start(&mut self) -> Result<()> {
        self.require("start", SessionState::Configured)?;
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        let handle = self.claimed("start")?;
        let interest = match self.active.as_mut() {
            Some(active) => {
                active.ring.reset();
                active.observed = EventMask::empty();
                active.interest
            }
            None => {
                return Err(EngineError::InvalidTransition {
                    operation: "start",
                    state: self.state,
                })
            }
        };

        self.events.clear_events(EventMask::all());
        self.events.arm(interest);
        self.device.arm_events(handle, interest)?;
        self.device.start(handle)?;

        let achieved_rate = self.stats.achieved_rate;
        self.stats = SessionStats {
            achieved_rate,
            ..SessionStats::default()
        };
        self.state = SessionState::Running;
        info!(kind = %self.kind, "Session started");
        Ok(())
    }

    /// Halt conversions. `Running → Configured`.
    pub fn halt(&mut self) -> Result<()> {
        self.require("halt", SessionState::Running)?;
        let handle = self.claimed("halt")?;
        self.device.stop(handle)?;
        self.events.clear_events(EventMask::all());
        self.state = SessionState::Configured;
        info!(kind = %self.kind, frames = self.stats.frames, "Session halted");
        Ok(())
    }

    /// Disarm events and release the buffer. `Configured → Unconfigured`.
    pub fn unconfigure(&mut self) -> Result<()> {
        self.require("unconfigure", SessionState::Configured)?;
        let (handle, active) = self.bound("unconfigure")?;
        let (buffer, interest) = (active.buffer, active.interest);
        self.device.disarm_events(handle, interest)?;
        self.device.unbind_buffer(handle, buffer)?;
        self.events.disarm(EventMask::all());
        self.active = None;
        self.state = SessionState::Unconfigured;
        debug!(kind = %self.kind, "Session unconfigured");
        Ok(())
    }

    /// Give up the claim. `Unconfigured → Closed`.
    pub fn release(&mut self) -> Result<()> {
        self.require("release", SessionState::Unconfigured)?;
        let handle = self.claimed("release")?;
        self.device.release_subsystem(handle)?;
        self.handle = None;
        self.fault = None;
        self.state = SessionState::Closed;
        info!(kind = %self.kind, "Released subsystem");
        Ok(())
    }

    /// Tear down from any state to `Closed`.
    ///
    /// Every step is attempted even if an earlier one fails; the first failure
    /// is returned. Calling `stop` on a closed session does nothing.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == SessionState::Closed {
            return Ok(());
        }
        let mut first_error = None;

        if let Some(handle) = self.handle {
            if self.state == SessionState::Running {
                keep_first(&mut first_error, self.kind, "halt", self.device.stop(handle));
                self.state = SessionState::Configured;
            }
            self.events.clear_events(EventMask::all());
            if let Some(active) = self.active.take() {
                keep_first(
                    &mut first_error,
                    self.kind,
                    "disarm events",
                    self.device.disarm_events(handle, active.interest),
                );
                keep_first(
                    &mut first_error,
                    self.kind,
                    "unbind buffer",
                    self.device.unbind_buffer(handle, active.buffer),
                );
            }
            self.events.disarm(EventMask::all());
            keep_first(
                &mut first_error,
                self.kind,
                "release",
                self.device.release_subsystem(handle),
            );
        }

        self.handle = None;
        self.active = None;
        self.fault = None;
        self.state = SessionState::Closed;
        info!(kind = %self.kind, frames = self.stats.frames, "Session closed");

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Block until a frame is ready to handle.
    ///
    /// Returns `Ok(None)` once a non-wrapped buffer has been fully handled
    /// and hardware has halted. Timeouts are retryable; buffer faults and
    /// unexpected halts are fatal and latched.
    pub fn wait_frame(&mut self) -> Result<Option<FrameProgress>> {
        self.require("wait on", SessionState::Running)?;
        if let Some(fault) = &self.fault {
            return Err(fault.clone());
        }
        let (handle, active) = self.bound("wait on")?;
        let (interest, timeout, wait) = (active.interest, active.timeout, active.config.wait);

        loop {
            let progress = self.device.query_buffer_progress(handle)?;
            if progress.valid_scans > 0 {
                return self.accept(progress).map(Some);
            }
            if progress.complete {
                debug!(kind = %self.kind, frames = self.stats.frames, "Buffer fully handled");
                return Ok(None);
            }

            let fired = self.wait_events(handle, wait, interest, timeout)?;
            if fired.is_timeout() {
                self.stats.timeouts += 1;
                warn!(kind = %self.kind, ?timeout, "Timed out waiting for frame");
                return Err(EngineError::Timeout {
                    waiting_for: "frame completion",
                    timeout,
                });
            }
            trace!(kind = %self.kind, events = ?fired, "Events received");

            if fired.contains(EventMask::BUFFER_ERROR) {
                let err = if self.kind.is_acquisition() {
                    EngineError::BufferOverrun {
                        kind: self.kind,
                        message: "hardware overwrote frames before they were read".to_string(),
                    }
                } else {
                    EngineError::BufferError {
                        kind: self.kind,
                        message: "hardware ran out of filled frames".to_string(),
                    }
                };
                return Err(self.latch_fault(err));
            }
            if fired.contains(EventMask::STOPPED) {
                return Err(self.latch_fault(EngineError::Stopped { kind: self.kind }));
            }

            // Consumed bits stay disarmed until re-armed here
            let rearm = fired & interest;
            self.events.arm(rearm);
            self.device.arm_events(handle, rearm)?;

            if fired.contains(EventMask::DATA_ERROR) {
                self.stats.data_errors += 1;
                warn!(kind = %self.kind, "Data error reported by device");
            }
            if let Some(active) = self.active.as_mut() {
                active.observed |= fired & (EventMask::COMPLETION | EventMask::DATA_ERROR);
            }
        }
    }

    fn wait_events(
        &self,
        handle: DeviceHandle,
        wait: WaitStrategy,
        interest: EventMask,
        timeout: Duration,
    ) -> Result<EventMask> {
        match wait {
            WaitStrategy::Events => Ok(self.events.wait_events(interest, timeout)),
            WaitStrategy::Polling { interval } => {
                let deadline = Instant::now() + timeout.min(MAX_WAIT);
                loop {
                    let raised = self.device.pending_events(handle)?;
                    self.events.set_events(raised);
                    let fired = self.events.take_events(interest);
                    if !fired.is_empty() {
                        return Ok(fired);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(EventMask::TIMEOUT);
                    }
                    thread::sleep(interval.min(deadline - now));
                }
            }
        }
    }

    fn accept(&mut self, progress: BufferProgress) -> Result<FrameProgress> {
        let kind = self.kind;
        let Some(active) = self.active.as_mut() else {
            return Err(EngineError::InvalidTransition {
                operation: "wait on",
                state: self.state,
            });
        };
        let geometry = *active.ring.geometry();

        let malformed = progress.valid_scans > geometry.scans_per_frame
            || !geometry.is_frame_aligned(progress.scan_offset);
        if malformed {
            let err = EngineError::BufferError {
                kind,
                message: format!(
                    "device reported {} scans at offset {} in a ring of {}-scan frames",
                    progress.valid_scans, progress.scan_offset, geometry.scans_per_frame
                ),
            };
            return Err(self.latch_fault(err));
        }

        let expected = active.ring.read_offset();
        if progress.scan_offset != expected {
            if kind.is_acquisition() {
                let err = EngineError::BufferOverrun {
                    kind,
                    message: format!(
                        "expected frame at scan {} but device reported scan {}",
                        expected, progress.scan_offset
                    ),
                };
                return Err(self.latch_fault(err));
            }
            let skipped = active.ring.skip_to(progress.scan_offset)?;
            self.stats.resyncs += 1;
            debug!(
                kind = %kind,
                skipped,
                scan_offset = progress.scan_offset,
                "Resynchronized with device write position"
            );
        }

        let mut events = std::mem::take(&mut active.observed);
        if active.config.exclusive_completion && events.contains(EventMask::BUFFER_DONE) {
            events.remove(EventMask::FRAME_DONE);
        }
        let frame = FrameProgress {
            scan_offset: progress.scan_offset,
            valid_scans: progress.valid_scans,
            sequence: active.ring.frames_released(),
            events,
        };
        trace!(
            kind = %kind,
            sequence = frame.sequence,
            scan_offset = frame.scan_offset,
            valid = frame.valid_scans,
            "Frame ready"
        );
        Ok(frame)
    }

    fn latch_fault(&mut self, err: EngineError) -> EngineError {
        if matches!(
            err,
            EngineError::BufferOverrun { .. } | EngineError::BufferError { .. }
        ) {
            self.stats.buffer_errors += 1;
        }
        error!(kind = %self.kind, error = %err, "Session faulted");
        self.fault = Some(err.clone());
        err
    }

    /// Copy the samples of an acquisition frame into `out`.
    ///
    /// `out` is resized to `valid_scans × scan_size` words.
    pub fn read_frame(&mut self, frame: &FrameProgress, out: &mut Vec<u32>) -> Result<()> {
        self.require("read from", SessionState::Running)?;
        if !self.kind.is_acquisition() {
            return Err(EngineError::config(format!(
                "cannot read frames from {}",
                self.kind
            )));
        }
        let (handle, active) = self.bound("read from")?;
        out.clear();
        out.resize(frame.valid_scans * active.ring.geometry().scan_size, 0);
        self.device
            .read_scans(handle, active.buffer, frame.scan_offset, out)
    }

    /// Copy packed words into a generation frame.
    pub fn write_frame(&mut self, frame: &FrameProgress, words: &[u32]) -> Result<()> {
        self.require("write to", SessionState::Running)?;
        if self.kind.is_acquisition() {
            return Err(EngineError::config(format!(
                "cannot write frames to {}",
                self.kind
            )));
        }
        let (handle, active) = self.bound("write to")?;
        let room = frame.valid_scans * active.ring.geometry().scan_size;
        if words.len() > room {
            return Err(EngineError::config(format!(
                "{} words do not fit a frame of {} words",
                words.len(),
                room
            )));
        }
        self.device
            .write_scans(handle, active.buffer, frame.scan_offset, words)
    }

    /// Hand a frame back to the device: read (acquisition) or filled
    /// (generation).
    pub fn release_frame(&mut self, frame: &FrameProgress) -> Result<()> {
        self.require("release a frame of", SessionState::Running)?;
        let handle = self.claimed("release a frame of")?;
        self.device.release_scans(handle, frame.valid_scans)?;
        if let Some(active) = self.active.as_mut() {
            active.ring.consume_frame();
        }
        self.stats.frames += 1;
        self.stats.scans += frame.valid_scans as u64;
        Ok(())
    }
}

fn keep_first(
    first: &mut Option<EngineError>,
    kind: SubsystemKind,
    step: &str,
    result: Result<()>,
) {
    if let Err(err) = result {
        warn!(kind = %kind, step, error = %err, "Teardown step failed");
        if first.is_none() {
            *first = Some(err);
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.state != SessionState::Closed {
            if let Err(err) = self.stop() {
                error!(kind = %self.kind, error = %err, "Failed to close session on drop");
            }
        }
    }
}
