//! Simulated device collaborator.
//!
//! [`SimDevice`] implements [`DeviceCollaborator`] entirely in software. Each
//! started subsystem gets a clock thread that advances one frame per frame
//! period (`divisor × scans_per_frame / base_clock`):
//!
//! - Acquisition fills the next frame with a deterministic pattern and raises
//!   `FRAME_DONE` (plus `BUFFER_DONE` on the last frame of the ring).
//! - Generation drains the oldest filled frame into an emitted-frame log and
//!   raises `FRAME_DONE`. With no filled frame it either repeats the current
//!   frame (wrapped, not recycled) or reports an underrun.
//!
//! Faults can be injected per subsystem with [`SimDevice::inject_fault`] to
//! exercise overrun, stall, data-error and teardown failure paths.
//!
//! # Locking
//!
//! The simulator lock is taken before any event channel lock, never the
//! reverse, and is never held while joining a clock thread.

use std::collections::VecDeque;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::buffer::{BufferGeometry, BufferPolicy, FrameBuffer, WriteBlocked};
use crate::device::{BufferHandle, BufferProgress, DeviceCollaborator, DeviceHandle, SubsystemKind};
use crate::error::{EngineError, Result};
use crate::events::{EventChannel, EventMask};

/// Shortest clock tick the simulator honours.
const MIN_TICK: Duration = Duration::from_micros(100);

/// Simulator parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Conversion clock rate divisors divide
    pub base_clock_hz: f64,
    /// Acquisition channel count
    pub ai_channels: usize,
    /// Generation channel count
    pub ao_channels: usize,
    /// Width of generated acquisition samples
    pub sample_bits: u32,
    /// Acquisition sample pattern
    pub pattern: SimPattern,
    /// Emitted generation frames kept for inspection
    pub output_log_limit: usize,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            base_clock_hz: 1_000_000.0,
            ai_channels: 16,
            ao_channels: 4,
            sample_bits: 16,
            pattern: SimPattern::Ramp,
            output_log_limit: 4096,
        }
    }
}

/// Acquisition sample pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimPattern {
    /// Sample `n` of the stream (counting across channels) has code `n`,
    /// wrapped to the sample width
    #[default]
    Ramp,
    /// Every sample has the same code, unmasked; codes wider than
    /// `sample_bits` raise a data error
    Constant(u32),
}

impl SimPattern {
    fn sample(self, index: u64, mask: u32) -> u32 {
        match self {
            Self::Ramp => (index & u64::from(mask)) as u32,
            Self::Constant(code) => code,
        }
    }
}

/// Operations that can be made to fail once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimOperation {
    /// `configure_clock_and_channels`
    Configure,
    /// `start`
    Start,
    /// `stop`
    Stop,
    /// `unbind_buffer`
    Unbind,
    /// `release_subsystem`
    Release,
}

/// Injected fault for one subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    /// Report a buffer error and halt once `frames` frames were produced
    OverrunAfter { frames: u64 },
    /// Stop producing frames after `frames`, leaving the clock running
    StallAfter { frames: u64 },
    /// Raise a data error with the given acquisition frame
    DataErrorAt { frame: u64 },
    /// Fail the next call of an operation
    Fail(SimOperation),
}

/// One frame drained by a simulated generation subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmittedFrame {
    /// Emission order since start, stale repeats included
    pub sequence: u64,
    /// Buffer words as output
    pub words: Vec<u32>,
    /// Repeated because no filled frame was available
    pub stale: bool,
}

struct ClockThread {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

impl ClockThread {
    fn shutdown(self) {
        // The thread may already have exited on its own
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            warn!("Simulator clock thread panicked");
        }
    }
}

struct SimBuffer {
    handle: BufferHandle,
    ring: FrameBuffer,
    memory: Vec<u32>,
}

struct Slot {
    id: u32,
    events: Arc<EventChannel>,
    armed: EventMask,
    raised: EventMask,
    buffer: Option<SimBuffer>,
    channels: Vec<u32>,
    divisor: u32,
    running: bool,
    halted: bool,
    faults: Vec<SimFault>,
    clock: Option<ClockThread>,
    emitted_total: u64,
}

impl Slot {
    fn raise(&mut self, mask: EventMask) {
        let mask = mask & self.armed;
        if mask.is_empty() {
            return;
        }
        self.raised |= mask;
        self.events.set_events(mask);
    }

    fn halt(&mut self) {
        self.running = false;
        self.halted = true;
    }

    fn take_failure(&mut self, operation: SimOperation) -> Result<()> {
        let position = self
            .faults
            .iter()
            .position(|fault| *fault == SimFault::Fail(operation));
        match position {
            Some(index) => {
                self.faults.remove(index);
                Err(EngineError::Device {
                    message: format!("injected {:?} failure", operation),
                })
            }
            None => Ok(()),
        }
    }

    fn overrun_limit(&self) -> Option<u64> {
        self.faults.iter().find_map(|fault| match fault {
            SimFault::OverrunAfter { frames } => Some(*frames),
            _ => None,
        })
    }

    fn stall_limit(&self) -> Option<u64> {
        self.faults.iter().find_map(|fault| match fault {
            SimFault::StallAfter { frames } => Some(*frames),
            _ => None,
        })
    }

    fn data_error_at(&self, frame: u64) -> bool {
        self.faults
            .iter()
            .any(|fault| *fault == SimFault::DataErrorAt { frame })
    }

    fn bound(&mut self, buffer: BufferHandle) -> Result<&mut SimBuffer> {
        match self.buffer.as_mut() {
            Some(bound) if bound.handle == buffer => Ok(bound),
            _ => Err(EngineError::Device {
                message: format!("buffer {:?} is not bound", buffer),
            }),
        }
    }
}

struct SimState {
    config: SimConfig,
    next_id: u32,
    ai: Option<Slot>,
    ao: Option<Slot>,
    queued_faults: [Vec<SimFault>; 2],
    emitted: VecDeque<EmittedFrame>,
}

impl SimState {
    fn slot_mut(&mut self, kind: SubsystemKind) -> Option<&mut Slot> {
        match kind {
            SubsystemKind::AnalogInput => self.ai.as_mut(),
            SubsystemKind::AnalogOutput => self.ao.as_mut(),
        }
    }

    fn slot_ref(&self, kind: SubsystemKind) -> Option<&Slot> {
        match kind {
            SubsystemKind::AnalogInput => self.ai.as_ref(),
            SubsystemKind::AnalogOutput => self.ao.as_ref(),
        }
    }

    fn claimed(&mut self, handle: DeviceHandle) -> Result<&mut Slot> {
        match self.slot_mut(handle.kind) {
            Some(slot) if slot.id == handle.id => Ok(slot),
            _ => Err(EngineError::Device {
                message: format!("{} handle {} is not claimed", handle.kind, handle.id),
            }),
        }
    }
}

fn fault_index(kind: SubsystemKind) -> usize {
    match kind {
        SubsystemKind::AnalogInput => 0,
        SubsystemKind::AnalogOutput => 1,
    }
}

/// Software device with one acquisition and one generation subsystem.
///
/// Clones share the same simulated hardware.
#[derive(Clone)]
pub struct SimDevice {
    state: Arc<Mutex<SimState>>,
}

impl std::fmt::Debug for SimDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SimDevice")
            .field("config", &state.config)
            .field("ai_claimed", &state.ai.is_some())
            .field("ao_claimed", &state.ao.is_some())
            .finish()
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimDevice {
    /// Create a device with nothing claimed.
    pub fn new(config: SimConfig) -> Self {
        info!(
            base_clock_hz = config.base_clock_hz,
            ai_channels = config.ai_channels,
            ao_channels = config.ao_channels,
            "Created simulated device"
        );
        Self {
            state: Arc::new(Mutex::new(SimState {
                config,
                next_id: 1,
                ai: None,
                ao: None,
                queued_faults: [Vec::new(), Vec::new()],
                emitted: VecDeque::new(),
            })),
        }
    }

    /// Inject a fault into `kind`. Faults injected before the subsystem is
    /// claimed apply to the next claim.
    pub fn inject_fault(&self, kind: SubsystemKind, fault: SimFault) {
        debug!(kind = %kind, ?fault, "Injecting simulator fault");
        let mut state = self.state.lock();
        match state.slot_mut(kind) {
            Some(slot) => slot.faults.push(fault),
            None => state.queued_faults[fault_index(kind)].push(fault),
        }
    }

    /// Remove every injected fault.
    pub fn clear_faults(&self) {
        let mut state = self.state.lock();
        state.queued_faults = [Vec::new(), Vec::new()];
        for kind in [SubsystemKind::AnalogInput, SubsystemKind::AnalogOutput] {
            if let Some(slot) = state.slot_mut(kind) {
                slot.faults.clear();
            }
        }
    }

    /// Check if `kind` is claimed.
    pub fn is_claimed(&self, kind: SubsystemKind) -> bool {
        self.state.lock().slot_ref(kind).is_some()
    }

    /// Check if `kind` has a buffer bound.
    pub fn is_bound(&self, kind: SubsystemKind) -> bool {
        self.state
            .lock()
            .slot_ref(kind)
            .map_or(false, |slot| slot.buffer.is_some())
    }

    /// Check if the clock of `kind` is running.
    pub fn is_running(&self, kind: SubsystemKind) -> bool {
        self.state
            .lock()
            .slot_ref(kind)
            .map_or(false, |slot| slot.running)
    }

    /// Frames the hardware side has filled (acquisition) or that the session
    /// has filled (generation).
    pub fn frames_written(&self, kind: SubsystemKind) -> u64 {
        self.state
            .lock()
            .slot_ref(kind)
            .and_then(|slot| slot.buffer.as_ref())
            .map_or(0, |buffer| buffer.ring.frames_written())
    }

    /// Generation frames emitted since the last generation start, oldest
    /// first. Kept after the subsystem is released.
    pub fn emitted_frames(&self) -> Vec<EmittedFrame> {
        self.state.lock().emitted.iter().cloned().collect()
    }

    fn spawn_clock(&self, kind: SubsystemKind, period: Duration) -> Result<ClockThread> {
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let state = Arc::clone(&self.state);
        let name = match kind {
            SubsystemKind::AnalogInput => "sim-ai-clock",
            SubsystemKind::AnalogOutput => "sim-ao-clock",
        };
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        if !tick(&state, kind) {
                            trace!(kind = %kind, "Clock thread exiting");
                            break;
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| EngineError::Device {
                message: format!("failed to spawn clock thread: {}", e),
            })?;
        Ok(ClockThread { stop_tx, handle })
    }

    fn take_clock(&self, handle: DeviceHandle) -> Result<Option<ClockThread>> {
        let mut state = self.state.lock();
        let slot = state.claimed(handle)?;
        slot.running = false;
        Ok(slot.clock.take())
    }
}

/// Advance one frame. Returns `false` when the clock should exit.
fn tick(state: &Mutex<SimState>, kind: SubsystemKind) -> bool {
    let mut guard = state.lock();
    let state = &mut *guard;
    let pattern = state.config.pattern;
    let mask = sample_mask(state.config.sample_bits);
    let log_limit = state.config.output_log_limit;
    match kind {
        SubsystemKind::AnalogInput => match state.ai.as_mut() {
            Some(slot) if slot.running => tick_acquisition(slot, pattern, mask),
            _ => false,
        },
        SubsystemKind::AnalogOutput => match state.ao.as_mut() {
            Some(slot) if slot.running => tick_generation(slot, &mut state.emitted, log_limit),
            _ => false,
        },
    }
}

fn sample_mask(bits: u32) -> u32 {
    match bits {
        0 => 0,
        32.. => u32::MAX,
        _ => (1u32 << bits) - 1,
    }
}

fn tick_acquisition(slot: &mut Slot, pattern: SimPattern, mask: u32) -> bool {
    let produced = slot.buffer.as_ref().map_or(0, |b| b.ring.frames_written());
    if let Some(limit) = slot.overrun_limit() {
        if produced >= limit {
            warn!(frames = produced, "Simulated acquisition overrun");
            slot.raise(EventMask::BUFFER_ERROR);
            slot.halt();
            return false;
        }
    }
    if slot.stall_limit().map_or(false, |limit| produced >= limit) {
        return true;
    }
    let mut data_error = slot.data_error_at(produced);
    let n_channels = slot.channels.len() as u64;
    let Some(buffer) = slot.buffer.as_mut() else {
        return false;
    };

    let write = match buffer.ring.write_frame() {
        Ok(write) => write,
        Err(WriteBlocked::Exhausted) => {
            slot.halt();
            return false;
        }
        Err(WriteBlocked::Unreleased) => {
            warn!(frames = produced, "Simulated acquisition overrun: no released frame");
            slot.raise(EventMask::BUFFER_ERROR);
            slot.halt();
            return false;
        }
    };

    let geometry = *buffer.ring.geometry();
    let start = geometry.sample_offset(write.scan_offset);
    let first_sample = write.sequence * geometry.frame_size() as u64;
    for (index, word) in buffer.memory[start..start + geometry.frame_size()]
        .iter_mut()
        .enumerate()
    {
        *word = pattern.sample(first_sample + index as u64, mask);
        data_error |= *word > mask;
    }
    let policy = buffer.ring.policy();
    trace!(
        sequence = write.sequence,
        scan_offset = write.scan_offset,
        channels = n_channels,
        "Simulated acquisition frame"
    );

    let mut events = EventMask::FRAME_DONE;
    if write.buffer_complete {
        events |= EventMask::BUFFER_DONE;
    }
    if data_error {
        events |= EventMask::DATA_ERROR;
    }
    if write.overwrote {
        warn!(sequence = write.sequence, "Simulated acquisition overwrote an unread frame");
        events |= EventMask::BUFFER_ERROR;
    }
    slot.raise(events);

    if !policy.contains(BufferPolicy::WRAPPED) && write.buffer_complete {
        debug!(frames = write.sequence + 1, "Simulated acquisition buffer full");
        slot.halt();
        return false;
    }
    true
}

fn tick_generation(slot: &mut Slot, log: &mut VecDeque<EmittedFrame>, log_limit: usize) -> bool {
    let Some(buffer) = slot.buffer.as_mut() else {
        return false;
    };
    let geometry = *buffer.ring.geometry();
    let policy = buffer.ring.policy();
    let offset = buffer.ring.read_offset();
    let start = geometry.sample_offset(offset);
    let words = buffer.memory[start..start + geometry.frame_size()].to_vec();

    let stale = match buffer.ring.release_frame() {
        Some(_) => false,
        None if policy.contains(BufferPolicy::WRAPPED) && !policy.contains(BufferPolicy::RECYCLED) => {
            true
        }
        None => {
            warn!(
                frames = buffer.ring.frames_released(),
                "Simulated generation underrun"
            );
            slot.raise(EventMask::BUFFER_ERROR);
            slot.halt();
            return false;
        }
    };
    let released = buffer.ring.frames_released();
    let frame_count = geometry.frame_count as u64;

    let frame = EmittedFrame {
        sequence: slot.emitted_total,
        words,
        stale,
    };
    slot.emitted_total += 1;
    if log_limit > 0 {
        if log.len() >= log_limit {
            log.pop_front();
        }
        log.push_back(frame);
    }
    if stale {
        trace!(scan_offset = offset, "Simulated generation repeated a frame");
        return true;
    }

    let mut events = EventMask::FRAME_DONE;
    if released % frame_count == 0 {
        events |= EventMask::BUFFER_DONE;
    }
    slot.raise(events);

    if !policy.contains(BufferPolicy::WRAPPED) && released >= frame_count {
        debug!(frames = released, "Simulated generation buffer drained");
        slot.halt();
        return false;
    }
    true
}

impl DeviceCollaborator for SimDevice {
    fn channel_capacity(&self, kind: SubsystemKind) -> usize {
        let state = self.state.lock();
        match kind {
            SubsystemKind::AnalogInput => state.config.ai_channels,
            SubsystemKind::AnalogOutput => state.config.ao_channels,
        }
    }

    fn base_clock_hz(&self) -> f64 {
        self.state.lock().config.base_clock_hz
    }

    fn claim_subsystem(
        &self,
        kind: SubsystemKind,
        events: Arc<EventChannel>,
    ) -> Result<DeviceHandle> {
        let mut state = self.state.lock();
        if state.slot_ref(kind).is_some() {
            return Err(EngineError::DeviceBusy { kind });
        }
        let id = state.next_id;
        state.next_id += 1;
        let faults = std::mem::take(&mut state.queued_faults[fault_index(kind)]);
        let slot = Slot {
            id,
            events,
            armed: EventMask::empty(),
            raised: EventMask::empty(),
            buffer: None,
            channels: Vec::new(),
            divisor: 0,
            running: false,
            halted: false,
            faults,
            clock: None,
            emitted_total: 0,
        };
        match kind {
            SubsystemKind::AnalogInput => state.ai = Some(slot),
            SubsystemKind::AnalogOutput => state.ao = Some(slot),
        }
        Ok(DeviceHandle { kind, id })
    }

    fn release_subsystem(&self, handle: DeviceHandle) -> Result<()> {
        let removed = {
            let mut state = self.state.lock();
            let slot = state.claimed(handle)?;
            slot.take_failure(SimOperation::Release)?;
            match handle.kind {
                SubsystemKind::AnalogInput => state.ai.take(),
                SubsystemKind::AnalogOutput => state.ao.take(),
            }
        };
        if let Some(clock) = removed.and_then(|mut slot| slot.clock.take()) {
            clock.shutdown();
        }
        Ok(())
    }

    fn bind_buffer(
        &self,
        handle: DeviceHandle,
        geometry: BufferGeometry,
        policy: BufferPolicy,
    ) -> Result<BufferHandle> {
        let mut state = self.state.lock();
        let slot = state.claimed(handle)?;
        if slot.buffer.is_some() {
            return Err(EngineError::Device {
                message: format!("{} already has a buffer bound", handle.kind),
            });
        }
        let buffer = BufferHandle(handle.id);
        slot.buffer = Some(SimBuffer {
            handle: buffer,
            ring: FrameBuffer::with_geometry(geometry, policy),
            memory: vec![0; geometry.capacity()],
        });
        Ok(buffer)
    }

    fn unbind_buffer(&self, handle: DeviceHandle, buffer: BufferHandle) -> Result<()> {
        let clock = {
            let mut state = self.state.lock();
            let slot = state.claimed(handle)?;
            slot.take_failure(SimOperation::Unbind)?;
            slot.bound(buffer)?;
            slot.buffer = None;
            slot.running = false;
            slot.clock.take()
        };
        if let Some(clock) = clock {
            clock.shutdown();
        }
        Ok(())
    }

    fn configure_clock_and_channels(
        &self,
        handle: DeviceHandle,
        channels: &[u32],
        rate_divisor: u32,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let capacity = match handle.kind {
            SubsystemKind::AnalogInput => state.config.ai_channels,
            SubsystemKind::AnalogOutput => state.config.ao_channels,
        };
        let slot = state.claimed(handle)?;
        slot.take_failure(SimOperation::Configure)?;
        if let Some(&channel) = channels.iter().find(|&&c| c as usize >= capacity) {
            return Err(EngineError::config(format!(
                "channel {} does not exist on {} ({} channels)",
                channel, handle.kind, capacity
            )));
        }
        if rate_divisor == 0 {
            return Err(EngineError::config("rate divisor must be non-zero"));
        }
        slot.channels = channels.to_vec();
        slot.divisor = rate_divisor;
        Ok(())
    }

    fn arm_events(&self, handle: DeviceHandle, mask: EventMask) -> Result<()> {
        self.state.lock().claimed(handle)?.armed |= mask & EventMask::HARDWARE;
        Ok(())
    }

    fn disarm_events(&self, handle: DeviceHandle, mask: EventMask) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.claimed(handle)?;
        slot.armed.remove(mask);
        slot.raised.remove(mask);
        Ok(())
    }

    fn pending_events(&self, handle: DeviceHandle) -> Result<EventMask> {
        let mut state = self.state.lock();
        let slot = state.claimed(handle)?;
        Ok(std::mem::take(&mut slot.raised))
    }

    fn start(&self, handle: DeviceHandle) -> Result<()> {
        // A clock left over from a self-halted run has already exited
        if let Some(previous) = self.take_clock(handle)? {
            previous.shutdown();
        }

        let base_clock = self.base_clock_hz();
        let mut state = self.state.lock();
        let slot = state.claimed(handle)?;
        slot.take_failure(SimOperation::Start)?;
        let Some(buffer) = slot.buffer.as_mut() else {
            return Err(EngineError::Device {
                message: format!("{} has no buffer bound", handle.kind),
            });
        };
        if slot.divisor == 0 || slot.channels.is_empty() {
            return Err(EngineError::Device {
                message: format!("{} clock and channels are not programmed", handle.kind),
            });
        }
        buffer.ring.reset();
        buffer.memory.fill(0);
        let scans_per_frame = buffer.ring.geometry().scans_per_frame;
        let period = Duration::from_secs_f64(
            f64::from(slot.divisor) * scans_per_frame as f64 / base_clock,
        )
        .max(MIN_TICK);

        slot.raised = EventMask::empty();
        slot.emitted_total = 0;
        slot.halted = false;
        slot.running = true;
        if !handle.kind.is_acquisition() {
            state.emitted.clear();
        }
        drop(state);

        let clock = match self.spawn_clock(handle.kind, period) {
            Ok(clock) => clock,
            Err(err) => {
                if let Some(slot) = self.state.lock().slot_mut(handle.kind) {
                    slot.running = false;
                }
                return Err(err);
            }
        };
        let mut state = self.state.lock();
        match state.claimed(handle) {
            Ok(slot) => slot.clock = Some(clock),
            Err(err) => {
                drop(state);
                clock.shutdown();
                return Err(err);
            }
        }
        debug!(kind = %handle.kind, ?period, "Simulated clock started");
        Ok(())
    }

    fn stop(&self, handle: DeviceHandle) -> Result<()> {
        {
            let mut state = self.state.lock();
            state.claimed(handle)?.take_failure(SimOperation::Stop)?;
        }
        if let Some(clock) = self.take_clock(handle)? {
            clock.shutdown();
        }
        Ok(())
    }

    fn query_buffer_progress(&self, handle: DeviceHandle) -> Result<BufferProgress> {
        let mut state = self.state.lock();
        let slot = state.claimed(handle)?;
        let halted = slot.halted;
        let Some(buffer) = slot.buffer.as_ref() else {
            return Err(EngineError::Device {
                message: format!("{} has no buffer bound", handle.kind),
            });
        };
        let ring = &buffer.ring;
        let geometry = ring.geometry();
        let wrapped = ring.policy().contains(BufferPolicy::WRAPPED);
        let frame_count = geometry.frame_count as u64;

        let progress = if handle.kind.is_acquisition() {
            if ring.pending_frames() > 0 {
                BufferProgress {
                    scan_offset: ring.read_offset(),
                    valid_scans: geometry.scans_per_frame,
                    complete: false,
                }
            } else {
                BufferProgress {
                    scan_offset: ring.read_offset(),
                    valid_scans: 0,
                    complete: halted && !wrapped && ring.frames_written() >= frame_count,
                }
            }
        } else {
            let free = ring.can_write().is_ok() && ring.pending_frames() < frame_count;
            BufferProgress {
                scan_offset: ring.write_offset(),
                valid_scans: if free { geometry.scans_per_frame } else { 0 },
                complete: halted && !wrapped && ring.frames_released() >= frame_count,
            }
        };
        Ok(progress)
    }

    fn read_scans(
        &self,
        handle: DeviceHandle,
        buffer: BufferHandle,
        scan_offset: usize,
        out: &mut [u32],
    ) -> Result<()> {
        let mut state = self.state.lock();
        let bound = state.claimed(handle)?.bound(buffer)?;
        let start = bound.ring.geometry().sample_offset(scan_offset);
        let Some(source) = bound.memory.get(start..start + out.len()) else {
            return Err(EngineError::Device {
                message: format!(
                    "read of {} samples at scan {} exceeds the buffer",
                    out.len(),
                    scan_offset
                ),
            });
        };
        out.copy_from_slice(source);
        Ok(())
    }

    fn write_scans(
        &self,
        handle: DeviceHandle,
        buffer: BufferHandle,
        scan_offset: usize,
        words: &[u32],
    ) -> Result<()> {
        let mut state = self.state.lock();
        let bound = state.claimed(handle)?.bound(buffer)?;
        let start = bound.ring.geometry().sample_offset(scan_offset);
        let Some(target) = bound.memory.get_mut(start..start + words.len()) else {
            return Err(EngineError::Device {
                message: format!(
                    "write of {} words at scan {} exceeds the buffer",
                    words.len(),
                    scan_offset
                ),
            });
        };
        target.copy_from_slice(words);
        Ok(())
    }

    fn release_scans(&self, handle: DeviceHandle, scans: usize) -> Result<()> {
        let mut state = self.state.lock();
        let slot = state.claimed(handle)?;
        let Some(buffer) = slot.buffer.as_mut() else {
            return Err(EngineError::Device {
                message: format!("{} has no buffer bound", handle.kind),
            });
        };
        if scans == 0 || scans > buffer.ring.geometry().scans_per_frame {
            return Err(EngineError::Device {
                message: format!("cannot release {} scans", scans),
            });
        }

        if handle.kind.is_acquisition() {
            if buffer.ring.release_frame().is_none() {
                return Err(EngineError::Device {
                    message: "no filled frame to release".to_string(),
                });
            }
        } else {
            let frame_count = buffer.ring.geometry().frame_count as u64;
            if buffer.ring.pending_frames() >= frame_count {
                return Err(EngineError::Device {
                    message: "no free frame to fill".to_string(),
                });
            }
            if let Err(blocked) = buffer.ring.write_frame() {
                return Err(EngineError::Device {
                    message: format!("generation buffer cannot accept a frame: {:?}", blocked),
                });
            }
        }
        Ok(())
    }
}
