//! Acquire-then-replay coordinator.
//!
//! Couples one acquisition [`Session`] to one generation [`Session`]. Each
//! acquisition frame is converted to the generation channel encodings and
//! re-emitted by the generation subsystem at its own pace.
//!
//! ```text
//!   acquisition thread                          generation thread
//!   ──────────────────                          ─────────────────
//!   wait_frame ─► read_frame ─► release          wait_frame (free frame)
//!        │                                            │
//!        ▼                                            ▼
//!   translate ─► HandOff::publish ═══ slot ═══► HandOff::take ─► write_frame
//!                  (blocks while full)             (blocks while empty)
//! ```
//!
//! The [`HandOff`] is a single slot behind one mutex and one condition
//! variable. The producer blocks while the slot is full instead of
//! overwriting it, so no frame is dropped or replayed twice; a bounded wait on
//! either side surfaces as a retryable timeout.
//!
//! Converted frames (engineering units) are also fanned out to named sinks
//! over bounded `tokio` channels. A full sink drops the frame and counts it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::codec::{ChannelEncoding, ChannelPacker};
use crate::error::{EngineError, Result};
use crate::events::{EventMask, MAX_WAIT};
use crate::session::{Session, SessionState, SessionStats, SessionWaker};

/// Default bound on one hand-off wait.
pub const DEFAULT_SLOT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default number of back-to-back timeouts tolerated before a loop gives up.
pub const DEFAULT_MAX_CONSECUTIVE_TIMEOUTS: u32 = 3;

/// Coordinator settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayConfig {
    /// Acquisition channel index feeding each generation channel.
    /// `None` routes generation channel `g` from `g mod acquisition channels`.
    pub route: Option<Vec<usize>>,
    /// Bound on each hand-off wait
    pub slot_timeout: Duration,
    /// Back-to-back timeouts tolerated on either side
    pub max_consecutive_timeouts: u32,
    /// Stop after this many frames
    pub frame_limit: Option<u64>,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            route: None,
            slot_timeout: DEFAULT_SLOT_TIMEOUT,
            max_consecutive_timeouts: DEFAULT_MAX_CONSECUTIVE_TIMEOUTS,
            frame_limit: None,
        }
    }
}

/// Contents of the hand-off slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HandOffSlot {
    /// Publish order, starting at 0
    pub sequence: u64,
    /// Scans in the frame
    pub scans: usize,
    /// Acquisition channels per scan in `units`
    pub n_channels: usize,
    /// Acquisition samples in engineering units, interleaved by scan
    pub units: Vec<f64>,
    /// Packed generation words for the frame
    pub words: Vec<u32>,
    /// Events reported with the acquisition frame
    pub events: EventMask,
}

#[derive(Debug, Default)]
struct HandOffState {
    slot: HandOffSlot,
    slot_ready: bool,
    aborted: bool,
    finished: bool,
    published: u64,
    consumed: u64,
}

/// Single-slot, blocking hand-off between a producer and a consumer thread.
#[derive(Debug, Default)]
pub struct HandOff {
    state: Mutex<HandOffState>,
    changed: Condvar,
}

impl HandOff {
    /// Create an empty hand-off.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fill the slot and mark it ready.
    ///
    /// Blocks while the previous frame has not been taken. Fails with
    /// [`EngineError::Timeout`] if it is still pending after `timeout`, or
    /// [`EngineError::Aborted`] once the hand-off is aborted or finished.
    /// Returns the sequence number assigned to the frame.
    pub fn publish<F>(&self, timeout: Duration, fill: F) -> Result<u64>
    where
        F: FnOnce(&mut HandOffSlot),
    {
        let deadline = Instant::now() + timeout.min(MAX_WAIT);
        let mut state = self.state.lock();
        while state.slot_ready && !state.aborted {
            if self.changed.wait_until(&mut state, deadline).timed_out()
                && state.slot_ready
                && !state.aborted
            {
                return Err(EngineError::Timeout {
                    waiting_for: "hand-off slot to drain",
                    timeout,
                });
            }
        }
        if state.aborted || state.finished {
            return Err(EngineError::Aborted);
        }

        fill(&mut state.slot);
        let sequence = state.published;
        state.slot.sequence = sequence;
        state.published += 1;
        state.slot_ready = true;
        self.changed.notify_all();
        Ok(sequence)
    }

    /// Block until a frame is ready without consuming it.
    ///
    /// Returns `false` if the producer finished with nothing left to take.
    pub fn wait_ready(&self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout.min(MAX_WAIT);
        let mut state = self.state.lock();
        loop {
            if state.aborted {
                return Err(EngineError::Aborted);
            }
            if state.slot_ready {
                return Ok(true);
            }
            if state.finished {
                return Ok(false);
            }
            if self.changed.wait_until(&mut state, deadline).timed_out()
                && !state.slot_ready
                && !state.finished
                && !state.aborted
            {
                return Err(EngineError::Timeout {
                    waiting_for: "hand-off slot to fill",
                    timeout,
                });
            }
        }
    }

    /// Consume the ready frame with `read`, under the lock.
    ///
    /// Blocks while the slot is empty. Returns `Ok(None)` once the producer
    /// finished and the last frame was taken.
    pub fn take<R, F>(&self, timeout: Duration, read: F) -> Result<Option<R>>
    where
        F: FnOnce(&HandOffSlot) -> R,
    {
        let deadline = Instant::now() + timeout.min(MAX_WAIT);
        let mut state = self.state.lock();
        while !state.slot_ready && !state.finished && !state.aborted {
            if self.changed.wait_until(&mut state, deadline).timed_out()
                && !state.slot_ready
                && !state.finished
                && !state.aborted
            {
                return Err(EngineError::Timeout {
                    waiting_for: "hand-off slot to fill",
                    timeout,
                });
            }
        }
        if state.aborted {
            return Err(EngineError::Aborted);
        }
        if !state.slot_ready {
            return Ok(None);
        }

        let value = read(&state.slot);
        state.slot_ready = false;
        state.consumed += 1;
        self.changed.notify_all();
        Ok(Some(value))
    }

    /// Mark the producer as done; the consumer drains the last frame and
    /// then sees `Ok(None)`.
    pub fn finish(&self) {
        self.state.lock().finished = true;
        self.changed.notify_all();
    }

    /// Wake every waiter with [`EngineError::Aborted`]. No frame is
    /// published or taken afterwards.
    pub fn abort(&self) {
        self.state.lock().aborted = true;
        self.changed.notify_all();
    }

    /// Block until the producer finished and every frame was taken, or the
    /// hand-off was aborted. Returns `false` on timeout.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout.min(MAX_WAIT);
        let mut state = self.state.lock();
        loop {
            if state.aborted || (state.finished && !state.slot_ready) {
                return true;
            }
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return state.aborted || (state.finished && !state.slot_ready);
            }
        }
    }

    /// Check if the hand-off was aborted.
    pub fn is_aborted(&self) -> bool {
        self.state.lock().aborted
    }

    /// Check if the producer has finished.
    pub fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    /// Frames published so far.
    pub fn published(&self) -> u64 {
        self.state.lock().published
    }

    /// Frames taken so far.
    pub fn consumed(&self) -> u64 {
        self.state.lock().consumed
    }
}

/// Converts acquisition frames into generation words.
#[derive(Debug, Clone)]
pub struct FrameTranslator {
    acquisition: Vec<ChannelEncoding>,
    generation: Vec<ChannelEncoding>,
    route: Vec<usize>,
    packer: ChannelPacker,
}

impl FrameTranslator {
    /// Validate `route` (or derive the default) against both channel lists.
    pub fn new(
        acquisition: Vec<ChannelEncoding>,
        generation: Vec<ChannelEncoding>,
        route: Option<Vec<usize>>,
        packer: ChannelPacker,
    ) -> Result<Self> {
        if acquisition.is_empty() || generation.is_empty() {
            return Err(EngineError::config(
                "replay needs at least one acquisition and one generation channel",
            ));
        }
        let route = match route {
            Some(route) => {
                if route.len() != generation.len() {
                    return Err(EngineError::config(format!(
                        "route has {} entries for {} generation channels",
                        route.len(),
                        generation.len()
                    )));
                }
                if let Some(&bad) = route.iter().find(|&&a| a >= acquisition.len()) {
                    return Err(EngineError::config(format!(
                        "route references acquisition channel {} of {}",
                        bad,
                        acquisition.len()
                    )));
                }
                route
            }
            None => (0..generation.len())
                .map(|g| g % acquisition.len())
                .collect(),
        };
        Ok(Self {
            acquisition,
            generation,
            route,
            packer,
        })
    }

    /// Acquisition channel feeding each generation channel.
    pub fn route(&self) -> &[usize] {
        &self.route
    }

    /// Channels per acquisition scan.
    pub fn acquisition_channels(&self) -> usize {
        self.acquisition.len()
    }

    /// Channels per generation scan.
    pub fn generation_channels(&self) -> usize {
        self.generation.len()
    }

    /// Scan-interleaved raw acquisition samples to engineering units.
    pub fn to_units(&self, samples: &[u32], units: &mut Vec<f64>) {
        units.clear();
        for scan in samples.chunks_exact(self.acquisition.len()) {
            units.extend(
                scan.iter()
                    .zip(&self.acquisition)
                    .map(|(&raw, encoding)| encoding.to_units(raw)),
            );
        }
    }

    /// Scan-interleaved acquisition units to packed generation words.
    pub fn to_generation(&self, units: &[f64], words: &mut Vec<u32>) {
        let mut codes = Vec::with_capacity(self.generation.len());
        words.clear();
        for scan in units.chunks_exact(self.acquisition.len()) {
            codes.clear();
            codes.extend(
                self.route
                    .iter()
                    .zip(&self.generation)
                    .map(|(&source, encoding)| encoding.to_raw_word(scan[source])),
            );
            self.packer.pack_scans(&codes, words);
        }
    }
}

/// One converted acquisition frame delivered to a sink.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedFrame {
    /// Engineering units, interleaved by scan
    /// [scan0_ch0, scan0_ch1, ..., scan1_ch0, ...]
    pub data: Vec<f64>,
    /// Channels per scan
    pub n_channels: usize,
    /// Publish order
    pub sequence: u64,
    /// Events reported with the frame
    pub events: EventMask,
}

impl ConvertedFrame {
    /// Scans in the frame.
    pub fn n_scans(&self) -> usize {
        if self.n_channels > 0 {
            self.data.len() / self.n_channels
        } else {
            0
        }
    }

    /// Samples of one channel.
    pub fn channel_data(&self, channel: usize) -> Vec<f64> {
        if channel >= self.n_channels {
            return Vec::new();
        }
        self.data
            .iter()
            .skip(channel)
            .step_by(self.n_channels)
            .copied()
            .collect()
    }
}

/// Receiver side of a converted-frame sink.
pub type FrameReceiver = mpsc::Receiver<ConvertedFrame>;

struct Sink {
    sender: mpsc::Sender<ConvertedFrame>,
    drops: AtomicU64,
}

/// Live coordinator counters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayStats {
    /// Frames written into the hand-off
    pub frames_published: u64,
    /// Frames written into the generation buffer
    pub frames_replayed: u64,
    /// Acquisition-side waits that expired
    pub producer_timeouts: u64,
    /// Generation-side waits that expired
    pub consumer_timeouts: u64,
    /// Replayed frames that carried a data error
    pub data_errors: u64,
    /// Frames dropped per sink
    pub sink_drops: HashMap<String, u64>,
}

/// Final accounting returned once the coordinator has stopped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplayReport {
    /// Coordinator counters at stop
    pub stats: ReplayStats,
    /// Acquisition session counters at stop
    pub acquisition: SessionStats,
    /// Generation session counters at stop
    pub generation: SessionStats,
    /// `"producer"` or `"consumer"` when a loop failed before the stop
    pub failed_loop: Option<&'static str>,
}

struct Shared {
    hand_off: HandOff,
    running: AtomicBool,
    sinks: RwLock<HashMap<String, Sink>>,
    frames_replayed: AtomicU64,
    producer_timeouts: AtomicU64,
    consumer_timeouts: AtomicU64,
    data_errors: AtomicU64,
    /// Loop that failed first, with its error
    failure: Mutex<Option<(&'static str, EngineError)>>,
}

impl Shared {
    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Record `err` unless another loop already failed. Returns whether this
    /// is the first failure.
    fn record_failure(&self, role: &'static str, err: &EngineError) -> bool {
        let mut failure = self.failure.lock();
        if failure.is_some() {
            return false;
        }
        *failure = Some((role, err.clone()));
        true
    }

    fn dispatch(&self, frame: ConvertedFrame) {
        let sinks = self.sinks.read();
        for (name, sink) in sinks.iter() {
            match sink.sender.try_send(frame.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    sink.drops.fetch_add(1, Ordering::SeqCst);
                    trace!(sink = name, sequence = frame.sequence, "Dropped frame (sink full)");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(sink = name, "Sink closed");
                }
            }
        }
    }
}

/// Handle that stops a running coordinator from any thread without joining.
#[derive(Clone)]
pub struct ReplayStopper {
    shared: Arc<Shared>,
    wakers: [SessionWaker; 2],
}

impl ReplayStopper {
    /// Set the abort flag and wake both loops.
    pub fn request_stop(&self) {
        if self.shared.running.swap(false, Ordering::SeqCst) {
            debug!("Replay stop requested");
        }
        self.shared.hand_off.abort();
        for waker in &self.wakers {
            waker.wake();
        }
    }
}

type LoopHandle = JoinHandle<(Session, Result<()>)>;

/// Runs the acquisition producer and generation consumer threads.
pub struct ReplayCoordinator {
    shared: Arc<Shared>,
    config: ReplayConfig,
    translator: Arc<FrameTranslator>,
    idle: Option<(Session, Session)>,
    producer: Option<LoopHandle>,
    consumer: Option<LoopHandle>,
    stopper: ReplayStopper,
    report: Option<ReplayReport>,
}

impl std::fmt::Debug for ReplayCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplayCoordinator")
            .field("config", &self.config)
            .field("translator", &self.translator)
            .field("idle", &self.idle)
            .field("report", &self.report)
            .finish_non_exhaustive()
    }
}

impl ReplayCoordinator {
    /// Pair two configured sessions.
    ///
    /// The acquisition session must be an acquisition subsystem, the
    /// generation session a generation subsystem, both configured with the
    /// same scans per frame.
    pub fn new(acquisition: Session, generation: Session, config: ReplayConfig) -> Result<Self> {
        if !acquisition.kind().is_acquisition() || generation.kind().is_acquisition() {
            return Err(EngineError::config(format!(
                "replay runs from an acquisition to a generation session, got {} to {}",
                acquisition.kind(),
                generation.kind()
            )));
        }
        for session in [&acquisition, &generation] {
            if session.state() != SessionState::Configured {
                return Err(EngineError::InvalidTransition {
                    operation: "replay",
                    state: session.state(),
                });
            }
        }
        let (Some(source), Some(target), Some(packer)) =
            (acquisition.config(), generation.config(), generation.packer())
        else {
            return Err(EngineError::config("replay sessions must be configured"));
        };
        if source.scans_per_frame != target.scans_per_frame {
            return Err(EngineError::config(format!(
                "acquisition frames hold {} scans but generation frames hold {}",
                source.scans_per_frame, target.scans_per_frame
            )));
        }
        if config.slot_timeout.is_zero() {
            return Err(EngineError::config("slot timeout must be non-zero"));
        }
        let translator = FrameTranslator::new(
            source.encodings(),
            target.encodings(),
            config.route.clone(),
            packer.clone(),
        )?;
        debug!(route = ?translator.route(), "Replay channel routing");

        let shared = Arc::new(Shared {
            hand_off: HandOff::new(),
            running: AtomicBool::new(false),
            sinks: RwLock::new(HashMap::new()),
            frames_replayed: AtomicU64::new(0),
            producer_timeouts: AtomicU64::new(0),
            consumer_timeouts: AtomicU64::new(0),
            data_errors: AtomicU64::new(0),
            failure: Mutex::new(None),
        });
        let stopper = ReplayStopper {
            shared: Arc::clone(&shared),
            wakers: [acquisition.waker(), generation.waker()],
        };

        Ok(Self {
            shared,
            config,
            translator: Arc::new(translator),
            idle: Some((acquisition, generation)),
            producer: None,
            consumer: None,
            stopper,
            report: None,
        })
    }

    /// Add a sink receiving every converted frame.
    ///
    /// `capacity` frames may queue before further frames are dropped for
    /// this sink.
    pub fn add_sink(&self, name: &str, capacity: usize) -> Result<FrameReceiver> {
        if capacity == 0 {
            return Err(EngineError::config("sink capacity must be non-zero"));
        }
        let mut sinks = self.shared.sinks.write();
        if sinks.contains_key(name) {
            return Err(EngineError::config(format!("sink '{}' already exists", name)));
        }
        let (sender, receiver) = mpsc::channel(capacity);
        sinks.insert(
            name.to_string(),
            Sink {
                sender,
                drops: AtomicU64::new(0),
            },
        );
        debug!(name, capacity, "Added sink");
        Ok(receiver)
    }

    /// Remove a sink by name.
    pub fn remove_sink(&self, name: &str) -> bool {
        self.shared.sinks.write().remove(name).is_some()
    }

    /// Names of the registered sinks.
    pub fn sink_names(&self) -> Vec<String> {
        self.shared.sinks.read().keys().cloned().collect()
    }

    /// Handle for stopping from another thread.
    pub fn stopper(&self) -> ReplayStopper {
        self.stopper.clone()
    }

    /// Start acquisition and both loops.
    ///
    /// The generation session starts once the first frame is ready.
    pub fn start(&mut self) -> Result<()> {
        let Some((mut acquisition, generation)) = self.idle.take() else {
            return Err(EngineError::config("replay coordinator already started"));
        };
        if let Err(err) = acquisition.start() {
            self.idle = Some((acquisition, generation));
            return Err(err);
        }
        self.shared.running.store(true, Ordering::SeqCst);

        let producer = {
            let shared = Arc::clone(&self.shared);
            let translator = Arc::clone(&self.translator);
            let config = self.config.clone();
            let wake_consumer = self.stopper.wakers[1].clone();
            thread::Builder::new()
                .name("replay-producer".to_string())
                .spawn(move || {
                    let mut session = acquisition;
                    let result = run_producer(&mut session, &shared, &translator, &config);
                    let result = settle(&shared, "producer", result);
                    if result.is_err() {
                        shared.hand_off.abort();
                        wake_consumer.wake();
                    }
                    (session, result)
                })
        };
        let producer = match producer {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(EngineError::Device {
                    message: format!("failed to spawn producer thread: {}", e),
                });
            }
        };
        self.producer = Some(producer);

        let consumer = {
            let shared = Arc::clone(&self.shared);
            let config = self.config.clone();
            let wake_producer = self.stopper.wakers[0].clone();
            thread::Builder::new()
                .name("replay-consumer".to_string())
                .spawn(move || {
                    let mut session = generation;
                    let result = run_consumer(&mut session, &shared, &config);
                    let result = settle(&shared, "consumer", result);
                    if result.is_err() {
                        shared.hand_off.abort();
                        wake_producer.wake();
                    }
                    (session, result)
                })
        };
        match consumer {
            Ok(handle) => self.consumer = Some(handle),
            Err(e) => {
                self.stopper.request_stop();
                return Err(EngineError::Device {
                    message: format!("failed to spawn consumer thread: {}", e),
                });
            }
        }

        info!(
            acquisition_channels = self.translator.acquisition_channels(),
            generation_channels = self.translator.generation_channels(),
            frame_limit = ?self.config.frame_limit,
            "Replay started"
        );
        Ok(())
    }

    /// Check if the loops are still moving frames.
    pub fn is_running(&self) -> bool {
        self.shared.running()
            && [&self.producer, &self.consumer]
                .iter()
                .any(|handle| handle.as_ref().map_or(false, |h| !h.is_finished()))
    }

    /// Block until every published frame has been taken by the consumer
    /// after the producer finished. Returns `false` on timeout.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        self.shared.hand_off.wait_drained(timeout)
    }

    /// Current counters.
    pub fn stats(&self) -> ReplayStats {
        let sink_drops = self
            .shared
            .sinks
            .read()
            .iter()
            .map(|(name, sink)| (name.clone(), sink.drops.load(Ordering::SeqCst)))
            .collect();
        ReplayStats {
            frames_published: self.shared.hand_off.published(),
            frames_replayed: self.shared.frames_replayed.load(Ordering::SeqCst),
            producer_timeouts: self.shared.producer_timeouts.load(Ordering::SeqCst),
            consumer_timeouts: self.shared.consumer_timeouts.load(Ordering::SeqCst),
            data_errors: self.shared.data_errors.load(Ordering::SeqCst),
            sink_drops,
        }
    }

    /// Report captured by [`stop`](Self::stop).
    pub fn report(&self) -> Option<&ReplayReport> {
        self.report.as_ref()
    }

    /// Abort the hand-off, wake and join both loops, then close both
    /// sessions. Safe to call more than once.
    ///
    /// Returns the first error a loop or teardown step reported.
    pub fn stop(&mut self) -> Result<()> {
        self.stopper.request_stop();
        let failure = self.shared.failure.lock().take();
        let failed_loop = failure.as_ref().map(|(role, _)| *role);
        let mut first_error = failure.map(|(_, err)| err);
        let mut sessions = Vec::with_capacity(2);

        for (role, handle) in [("producer", self.producer.take()), ("consumer", self.consumer.take())] {
            let Some(handle) = handle else {
                continue;
            };
            match handle.join() {
                Ok((session, result)) => {
                    if let Err(err) = result {
                        first_error.get_or_insert(err);
                    }
                    sessions.push(session);
                }
                Err(_) => {
                    error!(role, "Replay thread panicked");
                    first_error.get_or_insert(EngineError::Device {
                        message: format!("replay {} thread panicked", role),
                    });
                }
            }
        }
        if let Some((acquisition, generation)) = self.idle.take() {
            sessions.push(acquisition);
            sessions.push(generation);
        }
        if sessions.is_empty() {
            return match first_error {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }

        let mut report = self.report.take().unwrap_or_default();
        report.stats = self.stats();
        report.failed_loop = failed_loop;
        for mut session in sessions {
            if session.kind().is_acquisition() {
                report.acquisition = session.stats();
            } else {
                report.generation = session.stats();
            }
            if let Err(err) = session.stop() {
                first_error.get_or_insert(err);
            }
        }
        info!(
            published = report.stats.frames_published,
            replayed = report.stats.frames_replayed,
            producer_timeouts = report.stats.producer_timeouts,
            consumer_timeouts = report.stats.consumer_timeouts,
            "Replay stopped"
        );
        self.report = Some(report);

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Drop for ReplayCoordinator {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("Error stopping replay on drop: {}", e);
        }
    }
}

/// Errors caused by a stop request or by the other loop's failure are a
/// clean exit. Only the first real failure is returned.
fn settle(shared: &Shared, role: &'static str, result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => {
            debug!(role, "Replay loop finished");
            Ok(())
        }
        Err(err) if !shared.running() => {
            debug!(role, error = %err, "Replay loop cancelled");
            Ok(())
        }
        Err(err) => {
            if shared.record_failure(role, &err) {
                error!(role, error = %err, "Replay loop failed");
                Err(err)
            } else {
                debug!(role, error = %err, "Replay loop cancelled after the other loop failed");
                Ok(())
            }
        }
    }
}

fn run_producer(
    session: &mut Session,
    shared: &Shared,
    translator: &FrameTranslator,
    config: &ReplayConfig,
) -> Result<()> {
    let mut samples = Vec::new();
    let mut units = Vec::new();
    let mut consecutive_timeouts = 0;

    while shared.running() {
        if config
            .frame_limit
            .map_or(false, |limit| shared.hand_off.published() >= limit)
        {
            info!(frames = shared.hand_off.published(), "Replay frame limit reached");
            break;
        }

        let frame = match session.wait_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Acquisition buffer complete");
                break;
            }
            Err(err) if err.is_retryable() => {
                shared.producer_timeouts.fetch_add(1, Ordering::SeqCst);
                consecutive_timeouts += 1;
                if consecutive_timeouts >= config.max_consecutive_timeouts {
                    return Err(err);
                }
                continue;
            }
            Err(err) => return Err(err),
        };
        consecutive_timeouts = 0;

        session.read_frame(&frame, &mut samples)?;
        session.release_frame(&frame)?;
        if frame.events.contains(EventMask::DATA_ERROR) {
            shared.data_errors.fetch_add(1, Ordering::SeqCst);
            warn!(sequence = frame.sequence, "Replaying frame with out-of-range data");
        }
        translator.to_units(&samples, &mut units);

        let mut attempts = 0;
        let sequence = loop {
            let published = shared.hand_off.publish(config.slot_timeout, |slot| {
                slot.scans = frame.valid_scans;
                slot.n_channels = translator.acquisition_channels();
                slot.events = frame.events;
                slot.units.clone_from(&units);
                translator.to_generation(&units, &mut slot.words);
            });
            match published {
                Ok(sequence) => break sequence,
                Err(err) if err.is_retryable() => {
                    shared.producer_timeouts.fetch_add(1, Ordering::SeqCst);
                    attempts += 1;
                    warn!(attempts, "Generation side has not taken the previous frame");
                    if attempts >= config.max_consecutive_timeouts {
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        };
        trace!(sequence, scan_offset = frame.scan_offset, "Frame published");

        shared.dispatch(ConvertedFrame {
            data: units.clone(),
            n_channels: translator.acquisition_channels(),
            sequence,
            events: frame.events,
        });
    }

    shared.hand_off.finish();
    Ok(())
}

fn run_consumer(session: &mut Session, shared: &Shared, config: &ReplayConfig) -> Result<()> {
    let mut consecutive_timeouts = 0;

    // Generation starts with data in hand, so the first frame cannot underrun
    loop {
        if !shared.running() {
            return Ok(());
        }
        match shared.hand_off.wait_ready(config.slot_timeout) {
            Ok(true) => break,
            Ok(false) => {
                info!("Nothing to replay");
                return Ok(());
            }
            Err(err) if err.is_retryable() => {
                shared.consumer_timeouts.fetch_add(1, Ordering::SeqCst);
                consecutive_timeouts += 1;
                if consecutive_timeouts >= config.max_consecutive_timeouts {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
    session.start()?;
    consecutive_timeouts = 0;

    while shared.running() {
        let frame = match session.wait_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                info!("Generation buffer complete");
                return Ok(());
            }
            Err(err) if err.is_retryable() => {
                shared.consumer_timeouts.fetch_add(1, Ordering::SeqCst);
                consecutive_timeouts += 1;
                if consecutive_timeouts >= config.max_consecutive_timeouts {
                    return Err(err);
                }
                continue;
            }
            Err(err) => return Err(err),
        };

        let taken = shared
            .hand_off
            .take(config.slot_timeout, |slot| {
                session
                    .write_frame(&frame, &slot.words)
                    .map(|()| slot.sequence)
            });
        match taken {
            Ok(Some(written)) => {
                let sequence = written?;
                session.release_frame(&frame)?;
                shared.frames_replayed.fetch_add(1, Ordering::SeqCst);
                consecutive_timeouts = 0;
                trace!(sequence, scan_offset = frame.scan_offset, "Frame replayed");
            }
            Ok(None) => {
                info!(
                    frames = shared.frames_replayed.load(Ordering::SeqCst),
                    "Replay source drained"
                );
                return Ok(());
            }
            Err(err) if err.is_retryable() => {
                shared.consumer_timeouts.fetch_add(1, Ordering::SeqCst);
                consecutive_timeouts += 1;
                if consecutive_timeouts >= config.max_consecutive_timeouts {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}
