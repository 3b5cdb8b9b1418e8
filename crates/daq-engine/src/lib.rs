//! Buffered data-acquisition engine.
//!
//! Moves sampled signal data between a hardware conversion pipeline and
//! application memory at hardware-controlled rates:
//!
//! - [`codec`]: raw code ↔ engineering unit conversion and multi-channel
//!   word packing
//! - [`buffer`]: circular multi-frame buffer geometry and index bookkeeping
//! - [`events`]: bitmask event channel with consume-then-re-arm semantics
//! - [`session`]: per-subsystem lifecycle state machine
//! - [`replay`]: acquisition → generation coordinator with a blocking hand-off
//! - [`device`]: the contract a hardware transport implements
//! - [`sim`]: a software device for tests and demos
//! - [`config`]: figment-based configuration
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use daq_engine::sim::SimDevice;
//! use daq_engine::{BufferPolicy, DeviceCollaborator, Session, SessionConfig, SubsystemKind};
//!
//! # fn example() -> daq_engine::Result<()> {
//! let device: Arc<dyn DeviceCollaborator> = Arc::new(SimDevice::default());
//! let mut session = Session::open(device, SubsystemKind::AnalogInput)?;
//! session.configure(
//!     SessionConfig::builder()
//!         .channels(&[0, 1])
//!         .sample_rate(10_000.0)
//!         .scans_per_frame(100)
//!         .frame_count(10)
//!         .policy(BufferPolicy::empty())
//!         .build()?,
//! )?;
//! session.start()?;
//!
//! let mut samples = Vec::new();
//! while let Some(frame) = session.wait_frame()? {
//!     session.read_frame(&frame, &mut samples)?;
//!     session.release_frame(&frame)?;
//! }
//! session.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod codec;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod replay;
pub mod session;
pub mod sim;

pub use buffer::{BufferGeometry, BufferPolicy, FrameBuffer};
pub use codec::{ChannelCoding, ChannelEncoding, ChannelPacker, PackingPolicy, Range};
pub use device::{BufferHandle, BufferProgress, DeviceCollaborator, DeviceHandle, SubsystemKind};
pub use error::{EngineError, Result};
pub use events::{EventChannel, EventMask, WakePolicy};
pub use replay::{ConvertedFrame, HandOff, ReplayConfig, ReplayCoordinator, ReplayReport};
pub use session::{
    FrameProgress, Session, SessionConfig, SessionState, SessionStats, WaitStrategy,
};
