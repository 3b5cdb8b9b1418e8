//! Engine configuration using Figment.
//!
//! Configuration is loaded from:
//! 1. `config/daq-engine.toml` (or an explicit path)
//! 2. Environment variables prefixed with `DAQ_ENGINE_`, nested keys split on
//!    `__` (for example `DAQ_ENGINE_ACQUISITION__SAMPLE_RATE=8000`)
//!
//! Every field has a default, so an empty file yields a runnable loopback
//! setup: two 12-bit acquisition channels replayed on two 12-bit generation
//! channels.
//!
//! # Example
//! ```no_run
//! use daq_engine::config::EngineConfig;
//!
//! let config = EngineConfig::load()?;
//! let acquisition = config.acquisition.to_session_config()?;
//! # Ok::<(), daq_engine::EngineError>(())
//! ```

use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::buffer::BufferPolicy;
use crate::codec::{ChannelCoding, ChannelEncoding, PackingPolicy, Range};
use crate::error::{EngineError, Result};
use crate::events::{EventMask, WakePolicy};
use crate::replay::ReplayConfig;
use crate::session::{ChannelConfig, SessionConfig, WaitStrategy};
use crate::sim::SimConfig;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/daq-engine.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "DAQ_ENGINE_";

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Log level and output format
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Analog input session
    #[serde(default = "default_acquisition")]
    pub acquisition: SessionSection,
    /// Analog output session
    #[serde(default = "default_generation")]
    pub generation: SessionSection,
    /// Coordinator settings
    #[serde(default)]
    pub replay: ReplaySection,
    /// Simulated device parameters
    #[serde(default)]
    pub simulator: SimConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            acquisition: default_acquisition(),
            generation: default_generation(),
            replay: ReplaySection::default(),
            simulator: SimConfig::default(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Multi-line, human readable
    Pretty,
    /// Single-line, human readable
    #[default]
    Compact,
    /// One JSON object per line
    Json,
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level used when `RUST_LOG` is unset (trace, debug, info, warn, error)
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

/// One channel entry of a session section.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSection {
    /// Hardware channel number
    pub id: u32,
    /// Code width in bits
    pub resolution: u32,
    /// Defaults to the resolution's full mask
    #[serde(skip_serializing_if = "Option::is_none")]
    pub and_mask: Option<u32>,
    /// Bits flipped after masking
    pub xor_mask: u32,
    /// Low bits dropped after masking
    pub shift: u32,
    /// Engineering-unit range
    pub range: Range,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            id: 0,
            resolution: 12,
            and_mask: None,
            xor_mask: 0,
            shift: 0,
            range: Range::default(),
        }
    }
}

impl ChannelSection {
    fn channel(id: u32) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Validated channel encoding.
    pub fn to_encoding(&self) -> Result<ChannelEncoding> {
        let and_mask = match self.and_mask {
            Some(mask) => mask,
            None => ChannelCoding::straight_binary(self.resolution)?.max_code(),
        };
        ChannelEncoding::new(
            ChannelCoding::new(self.resolution, and_mask, self.xor_mask, self.shift)?,
            self.range,
        )
    }
}

/// How waits observe events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitKind {
    /// Block on the event channel
    #[default]
    Events,
    /// Read the pending register every `poll_interval_ms`
    Polling,
}

/// `[acquisition]` and `[generation]` sections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    /// Channel list in scan order
    pub channels: Vec<ChannelSection>,
    /// Scan rate in Hz
    pub sample_rate: f64,
    /// Frames in the ring
    pub frame_count: usize,
    /// Scans per frame
    pub scans_per_frame: usize,
    /// Keep overwriting from the start of the ring
    pub wrapped: bool,
    /// Reuse frames only once released
    pub recycled: bool,
    /// How waits observe events
    pub wait_strategy: WaitKind,
    /// Register read interval for the polling strategy
    pub poll_interval_ms: u64,
    /// Which waiters an event wakes
    pub wake_policy: WakePolicy,
    /// Word layout; generation only
    pub packing: PackingPolicy,
    /// Explicit wait timeout; derived from the frame period when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Multiple of the frame period used for the derived timeout
    pub timeout_factor: f64,
    /// Floor of the derived timeout
    pub min_timeout_ms: u64,
    /// Report `BUFFER_DONE` alone when both completions fire together
    pub exclusive_completion: bool,
    /// Arm data-range error events
    pub data_errors: bool,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            channels: vec![ChannelSection::channel(0), ChannelSection::channel(1)],
            sample_rate: 1000.0,
            frame_count: 8,
            scans_per_frame: 64,
            wrapped: true,
            recycled: false,
            wait_strategy: WaitKind::Events,
            poll_interval_ms: 1,
            wake_policy: WakePolicy::All,
            packing: PackingPolicy::Plain,
            timeout_ms: None,
            timeout_factor: crate::session::DEFAULT_TIMEOUT_FACTOR,
            min_timeout_ms: 50,
            exclusive_completion: false,
            data_errors: false,
        }
    }
}

fn default_acquisition() -> SessionSection {
    SessionSection {
        sample_rate: 4000.0,
        frame_count: 16,
        scans_per_frame: 4,
        wrapped: false,
        data_errors: true,
        ..SessionSection::default()
    }
}

fn default_generation() -> SessionSection {
    SessionSection {
        sample_rate: 2000.0,
        frame_count: 4,
        scans_per_frame: 4,
        wrapped: true,
        ..SessionSection::default()
    }
}

impl SessionSection {
    /// Buffer policy flags.
    pub fn policy(&self) -> BufferPolicy {
        let mut policy = BufferPolicy::empty();
        policy.set(BufferPolicy::WRAPPED, self.wrapped);
        policy.set(BufferPolicy::RECYCLED, self.recycled);
        policy
    }

    /// Typed runtime configuration.
    pub fn to_session_config(&self) -> Result<SessionConfig> {
        let channels = self
            .channels
            .iter()
            .map(|channel| Ok(ChannelConfig::new(channel.id, channel.to_encoding()?)))
            .collect::<Result<Vec<_>>>()?;
        let wait = match self.wait_strategy {
            WaitKind::Events => WaitStrategy::Events,
            WaitKind::Polling => WaitStrategy::Polling {
                interval: Duration::from_millis(self.poll_interval_ms),
            },
        };
        let mut events = EventMask::COMPLETION;
        if self.data_errors {
            events |= EventMask::DATA_ERROR;
        }

        let mut builder = SessionConfig::builder()
            .channel_configs(channels)
            .sample_rate(self.sample_rate)
            .frame_count(self.frame_count)
            .scans_per_frame(self.scans_per_frame)
            .policy(self.policy())
            .events(events)
            .packing(self.packing)
            .wait_strategy(wait)
            .timeout_factor(self.timeout_factor)
            .min_timeout(Duration::from_millis(self.min_timeout_ms))
            .exclusive_completion(self.exclusive_completion);
        if let Some(ms) = self.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        builder.build()
    }
}

/// `[replay]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySection {
    /// Acquisition channel index per generation channel
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route: Option<Vec<usize>>,
    /// Bound on each hand-off wait
    pub slot_timeout_ms: u64,
    /// Back-to-back timeouts tolerated on either side
    pub max_consecutive_timeouts: u32,
    /// Stop after this many frames
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_limit: Option<u64>,
    /// Queue depth of the monitoring sink
    pub sink_capacity: usize,
}

impl Default for ReplaySection {
    fn default() -> Self {
        Self {
            route: None,
            slot_timeout_ms: 1000,
            max_consecutive_timeouts: crate::replay::DEFAULT_MAX_CONSECUTIVE_TIMEOUTS,
            frame_limit: None,
            sink_capacity: 64,
        }
    }
}

impl ReplaySection {
    /// Typed coordinator configuration.
    pub fn to_replay_config(&self) -> ReplayConfig {
        ReplayConfig {
            route: self.route.clone(),
            slot_timeout: Duration::from_millis(self.slot_timeout_ms),
            max_consecutive_timeouts: self.max_consecutive_timeouts,
            frame_limit: self.frame_limit,
        }
    }
}

impl EngineConfig {
    /// Load and validate [`DEFAULT_CONFIG_PATH`] plus environment overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load and validate a specific file plus environment overrides.
    ///
    /// A missing file is not an error; defaults and environment apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = Self::figment(path).extract()?;
        config.validate()?;
        Ok(config)
    }

    /// The provider stack `load_from` extracts. Built-in defaults sit
    /// underneath, so a partial section keeps its own defaults.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Check every semantic constraint before anything touches a device.
    pub fn validate(&self) -> Result<()> {
        if !VALID_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(EngineError::config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                VALID_LEVELS.join(", ")
            )));
        }

        let acquisition = self.acquisition.to_session_config()?;
        let generation = self.generation.to_session_config()?;
        if self.acquisition.packing != PackingPolicy::Plain {
            return Err(EngineError::config(
                "acquisition packing must be plain; packing applies to generation",
            ));
        }
        if acquisition.scans_per_frame != generation.scans_per_frame {
            return Err(EngineError::config(format!(
                "acquisition and generation frames must hold the same scan count ({} vs {})",
                acquisition.scans_per_frame, generation.scans_per_frame
            )));
        }

        let sim = &self.simulator;
        if !sim.base_clock_hz.is_finite() || sim.base_clock_hz <= 0.0 {
            return Err(EngineError::config(format!(
                "simulator base clock must be positive, got {}",
                sim.base_clock_hz
            )));
        }
        for (name, section, capacity) in [
            ("acquisition", &self.acquisition, sim.ai_channels),
            ("generation", &self.generation, sim.ao_channels),
        ] {
            if section.channels.len() > capacity {
                return Err(EngineError::config(format!(
                    "{} lists {} channels but the simulator provides {}",
                    name,
                    section.channels.len(),
                    capacity
                )));
            }
        }

        if self.replay.slot_timeout_ms == 0 {
            return Err(EngineError::config("replay slot timeout must be non-zero"));
        }
        if self.replay.sink_capacity == 0 {
            return Err(EngineError::config("replay sink capacity must be non-zero"));
        }
        if let Some(route) = &self.replay.route {
            if route.len() != generation.channels.len() {
                return Err(EngineError::config(format!(
                    "replay route has {} entries for {} generation channels",
                    route.len(),
                    generation.channels.len()
                )));
            }
            if let Some(bad) = route.iter().find(|&&a| a >= acquisition.channels.len()) {
                return Err(EngineError::config(format!(
                    "replay route references acquisition channel {} of {}",
                    bad,
                    acquisition.channels.len()
                )));
            }
        }
        Ok(())
    }
}
