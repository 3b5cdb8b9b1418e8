//! Headless acquire-and-replay runner.
//!
//! Loads `config/daq-engine.toml` (plus `DAQ_ENGINE_` environment
//! overrides), claims both subsystems of the simulated device and replays
//! acquired frames on the generation subsystem until the acquisition buffer
//! is exhausted or the configured frame limit is reached.

mod logging;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use daq_engine::config::EngineConfig;
use daq_engine::session::SessionConfig;
use daq_engine::sim::SimDevice;
use daq_engine::{DeviceCollaborator, ReplayCoordinator, Session, SubsystemKind};
use tracing::{debug, info, warn};

fn main() -> Result<()> {
    let config = EngineConfig::load().context("Failed to load configuration")?;
    logging::init(&config.logging)?;

    info!(
        acquisition_rate = config.acquisition.sample_rate,
        generation_rate = config.generation.sample_rate,
        frame_limit = ?config.replay.frame_limit,
        "Starting replay"
    );
    if config.acquisition.wrapped && config.replay.frame_limit.is_none() {
        warn!("Wrapped acquisition without a frame limit runs until a fault stops it");
    }

    let device: Arc<dyn DeviceCollaborator> = Arc::new(SimDevice::new(config.simulator.clone()));

    let acquisition_config = config
        .acquisition
        .to_session_config()
        .context("Invalid acquisition section")?;
    let mut acquisition = Session::with_wake_policy(
        Arc::clone(&device),
        SubsystemKind::AnalogInput,
        config.acquisition.wake_policy,
    );
    acquisition.acquire()?;
    acquisition.configure(acquisition_config)?;

    let generation_config = config
        .generation
        .to_session_config()
        .context("Invalid generation section")?;
    let drain_time = drain_time(&generation_config);
    let mut generation = Session::with_wake_policy(
        Arc::clone(&device),
        SubsystemKind::AnalogOutput,
        config.generation.wake_policy,
    );
    generation.acquire()?;
    generation.configure(generation_config)?;

    let mut coordinator =
        ReplayCoordinator::new(acquisition, generation, config.replay.to_replay_config())?;
    let mut monitor_rx = coordinator.add_sink("monitor", config.replay.sink_capacity)?;
    let monitor = thread::Builder::new()
        .name("replay-monitor".to_string())
        .spawn(move || {
            let mut frames = 0u64;
            let mut peak = 0.0f64;
            while let Some(frame) = monitor_rx.blocking_recv() {
                frames += 1;
                peak = frame.data.iter().fold(peak, |acc, v| acc.max(v.abs()));
                debug!(sequence = frame.sequence, scans = frame.n_scans(), "Converted frame");
            }
            (frames, peak)
        })
        .context("Failed to spawn monitor thread")?;

    coordinator.start()?;
    let mut drained = false;
    while coordinator.is_running() {
        if coordinator.wait_drained(Duration::from_millis(250)) {
            drained = true;
            break;
        }
    }
    // Let the generation side emit what is still in its ring
    if drained {
        thread::sleep(drain_time);
    }

    let result = coordinator.stop();
    let report = coordinator.report().cloned().unwrap_or_default();
    drop(coordinator);

    let (monitored, peak) = monitor
        .join()
        .map_err(|_| anyhow::anyhow!("Monitor thread panicked"))?;
    info!(
        published = report.stats.frames_published,
        replayed = report.stats.frames_replayed,
        monitored,
        peak,
        acquisition_timeouts = report.acquisition.timeouts,
        generation_timeouts = report.generation.timeouts,
        data_errors = report.stats.data_errors,
        achieved_rate = report.acquisition.achieved_rate,
        "Replay finished"
    );

    result.context("Replay failed")?;
    Ok(())
}

/// Time for the generation side to emit a full ring, bounded by its wait
/// timeout.
fn drain_time(config: &SessionConfig) -> Duration {
    let ring = config.frame_period().as_secs_f64() * config.frame_count as f64;
    Duration::from_secs_f64(ring.min(config.wait_timeout().as_secs_f64()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generation_config(frame_count: usize) -> SessionConfig {
        SessionConfig::builder()
            .channels(&[0])
            .sample_rate(1000.0)
            .scans_per_frame(10)
            .frame_count(frame_count)
            .timeout(Duration::from_millis(500))
            .build()
            .unwrap()
    }

    #[test]
    fn test_drain_time_covers_the_ring() {
        assert_eq!(drain_time(&generation_config(4)), Duration::from_millis(40));
    }

    #[test]
    fn test_drain_time_is_bounded_by_wait_timeout() {
        // A ring this deep would otherwise take days to emit
        let mut config = generation_config(4);
        config.frame_count = 1 << 33;
        assert_eq!(drain_time(&config), config.wait_timeout());
        assert_eq!(drain_time(&config), Duration::from_millis(500));
    }
}
