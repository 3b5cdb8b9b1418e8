//! Acquire-then-replay tests against the simulated device.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use daq_engine::sim::{EmittedFrame, SimConfig, SimDevice, SimFault};
use daq_engine::{
    BufferPolicy, ChannelCoding, ChannelEncoding, DeviceCollaborator, EngineError, PackingPolicy,
    Range, ReplayConfig, ReplayCoordinator, Session, SessionConfig, SessionState, SubsystemKind,
};

const SPF: usize = 4;

fn twelve_bit() -> ChannelEncoding {
    ChannelEncoding::new(
        ChannelCoding::straight_binary(12).unwrap(),
        Range::new(-10.0, 10.0).unwrap(),
    )
    .unwrap()
}

fn sim_device() -> (SimDevice, Arc<dyn DeviceCollaborator>) {
    let sim = SimDevice::new(SimConfig {
        sample_bits: 12,
        ..SimConfig::default()
    });
    let device: Arc<dyn DeviceCollaborator> = Arc::new(sim.clone());
    (sim, device)
}

fn acquisition(
    device: &Arc<dyn DeviceCollaborator>,
    rate: f64,
    frames: usize,
    policy: BufferPolicy,
) -> Session {
    let mut session = Session::open(Arc::clone(device), SubsystemKind::AnalogInput).unwrap();
    session
        .configure(
            SessionConfig::builder()
                .channels(&[0, 1])
                .encoding(twelve_bit())
                .sample_rate(rate)
                .scans_per_frame(SPF)
                .frame_count(frames)
                .policy(policy)
                .build()
                .unwrap(),
        )
        .unwrap();
    session
}

fn generation(device: &Arc<dyn DeviceCollaborator>, rate: f64, packing: PackingPolicy) -> Session {
    generation_with_policy(device, rate, packing, BufferPolicy::WRAPPED)
}

fn generation_with_policy(
    device: &Arc<dyn DeviceCollaborator>,
    rate: f64,
    packing: PackingPolicy,
    policy: BufferPolicy,
) -> Session {
    let mut session = Session::open(Arc::clone(device), SubsystemKind::AnalogOutput).unwrap();
    session
        .configure(
            SessionConfig::builder()
                .channels(&[0, 1])
                .encoding(twelve_bit())
                .sample_rate(rate)
                .scans_per_frame(SPF)
                .frame_count(4)
                .policy(policy)
                .packing(packing)
                .build()
                .unwrap(),
        )
        .unwrap();
    session
}

fn wait_for_fresh_frames(sim: &SimDevice, count: usize) -> Vec<EmittedFrame> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let fresh: Vec<_> = sim
            .emitted_frames()
            .into_iter()
            .filter(|frame| !frame.stale)
            .collect();
        if fresh.len() >= count {
            return fresh;
        }
        assert!(
            Instant::now() < deadline,
            "only {} of {} frames were emitted",
            fresh.len(),
            count
        );
        thread::sleep(Duration::from_millis(2));
    }
}

/// Ramp codes of acquisition frame `index` (2 channels × `SPF` scans).
fn ramp_frame(index: u32) -> Vec<u32> {
    let frame_size = (2 * SPF) as u32;
    (index * frame_size..(index + 1) * frame_size).collect()
}

#[test]
fn test_replay_emits_every_frame_once_in_order() {
    let (sim, device) = sim_device();
    // Acquisition at twice the generation rate: the producer must block
    let acq = acquisition(&device, 4000.0, 16, BufferPolicy::empty());
    let gen_session = generation(&device, 2000.0, PackingPolicy::Plain);

    let mut coordinator = ReplayCoordinator::new(acq, gen_session, ReplayConfig::default()).unwrap();
    coordinator.start().unwrap();
    assert!(coordinator.wait_drained(Duration::from_secs(5)));

    let fresh = wait_for_fresh_frames(&sim, 16);
    coordinator.stop().unwrap();

    assert_eq!(fresh.len(), 16);
    for (index, frame) in fresh.iter().enumerate() {
        assert_eq!(frame.words, ramp_frame(index as u32), "frame {}", index);
    }

    let report = coordinator.report().unwrap();
    assert_eq!(report.stats.frames_published, 16);
    assert_eq!(report.stats.frames_replayed, 16);
    assert_eq!(report.acquisition.frames, 16);
    assert_eq!(report.generation.frames, 16);
    assert_eq!(report.acquisition.buffer_errors, 0);

    assert!(!sim.is_claimed(SubsystemKind::AnalogInput));
    assert!(!sim.is_claimed(SubsystemKind::AnalogOutput));
}

#[test]
fn test_replay_routes_and_packs_channels() {
    let (sim, device) = sim_device();
    let acq = acquisition(&device, 2000.0, 2, BufferPolicy::empty());
    let gen_session = generation(&device, 2000.0, PackingPolicy::CoPackedPair);

    let config = ReplayConfig {
        route: Some(vec![1, 0]),
        ..ReplayConfig::default()
    };
    let mut coordinator = ReplayCoordinator::new(acq, gen_session, config).unwrap();
    coordinator.start().unwrap();
    assert!(coordinator.wait_drained(Duration::from_secs(5)));
    let fresh = wait_for_fresh_frames(&sim, 2);
    coordinator.stop().unwrap();

    // One word per scan: generation channel 0 (acquisition 1) in the low bits
    for (index, frame) in fresh.iter().enumerate() {
        let codes = ramp_frame(index as u32);
        let expected: Vec<u32> = codes
            .chunks_exact(2)
            .map(|scan| scan[1] | (scan[0] << 12))
            .collect();
        assert_eq!(frame.words, expected);
    }
}

#[test]
fn test_frame_limit_stops_wrapped_acquisition() {
    let (_sim, device) = sim_device();
    let acq = acquisition(&device, 2000.0, 16, BufferPolicy::WRAPPED);
    let gen_session = generation(&device, 2000.0, PackingPolicy::Plain);

    let config = ReplayConfig {
        frame_limit: Some(5),
        ..ReplayConfig::default()
    };
    let mut coordinator = ReplayCoordinator::new(acq, gen_session, config).unwrap();
    coordinator.start().unwrap();
    assert!(coordinator.wait_drained(Duration::from_secs(5)));
    coordinator.stop().unwrap();

    let report = coordinator.report().unwrap();
    assert_eq!(report.stats.frames_published, 5);
    assert_eq!(report.stats.frames_replayed, 5);
}

#[test]
fn test_stop_interrupts_running_replay() {
    let (sim, device) = sim_device();
    let acq = acquisition(&device, 2000.0, 16, BufferPolicy::WRAPPED);
    let gen_session = generation(&device, 2000.0, PackingPolicy::Plain);

    let mut coordinator = ReplayCoordinator::new(acq, gen_session, ReplayConfig::default()).unwrap();
    coordinator.start().unwrap();
    thread::sleep(Duration::from_millis(30));
    assert!(coordinator.is_running());

    let stopper = coordinator.stopper();
    let remote = thread::spawn(move || stopper.request_stop());
    remote.join().unwrap();

    let started = Instant::now();
    coordinator.stop().unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!coordinator.is_running());
    assert!(coordinator.report().unwrap().stats.frames_published > 0);

    // Second stop is a no-op
    coordinator.stop().unwrap();
    assert!(!sim.is_claimed(SubsystemKind::AnalogInput));
    assert!(!sim.is_claimed(SubsystemKind::AnalogOutput));
}

#[test]
fn test_acquisition_fault_stops_both_loops() {
    let (sim, device) = sim_device();
    sim.inject_fault(SubsystemKind::AnalogInput, SimFault::OverrunAfter { frames: 3 });
    let acq = acquisition(&device, 2000.0, 16, BufferPolicy::empty());
    let gen_session = generation(&device, 2000.0, PackingPolicy::Plain);

    let mut coordinator = ReplayCoordinator::new(acq, gen_session, ReplayConfig::default()).unwrap();
    coordinator.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while coordinator.is_running() {
        assert!(Instant::now() < deadline, "replay loops did not exit");
        thread::sleep(Duration::from_millis(2));
    }

    let err = coordinator.stop().unwrap_err();
    assert!(
        matches!(
            err,
            EngineError::BufferOverrun {
                kind: SubsystemKind::AnalogInput,
                ..
            }
        ),
        "got {:?}",
        err
    );
    let report = coordinator.report().unwrap();
    assert_eq!(report.failed_loop, Some("producer"));
    assert_eq!(report.acquisition.buffer_errors, 1);
    assert!(report.stats.frames_published <= 3);
    assert!(!sim.is_claimed(SubsystemKind::AnalogInput));
}

#[test]
fn test_generation_underrun_is_reported_as_the_failure() {
    let (sim, device) = sim_device();
    // Generation drains a frame every 1 ms but a new one arrives every 8 ms
    let acq = acquisition(&device, 500.0, 16, BufferPolicy::WRAPPED);
    let gen_session = generation_with_policy(
        &device,
        4000.0,
        PackingPolicy::Plain,
        BufferPolicy::WRAPPED | BufferPolicy::RECYCLED,
    );

    let mut coordinator = ReplayCoordinator::new(acq, gen_session, ReplayConfig::default()).unwrap();
    coordinator.start().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while coordinator.is_running() {
        assert!(Instant::now() < deadline, "replay loops did not exit");
        thread::sleep(Duration::from_millis(2));
    }

    let err = coordinator.stop().unwrap_err();
    assert!(
        matches!(
            err,
            EngineError::BufferError {
                kind: SubsystemKind::AnalogOutput,
                ..
            }
        ),
        "got {:?}",
        err
    );
    let report = coordinator.report().unwrap();
    assert_eq!(report.failed_loop, Some("consumer"));
    assert_eq!(report.generation.buffer_errors, 1);
    assert_eq!(report.acquisition.buffer_errors, 0);

    // Already reported; a second stop is a no-op
    coordinator.stop().unwrap();
    assert!(!sim.is_claimed(SubsystemKind::AnalogInput));
    assert!(!sim.is_claimed(SubsystemKind::AnalogOutput));
}

#[test]
fn test_new_rejects_mismatched_sessions() {
    let (_sim, device) = sim_device();

    // Generation session in the acquisition role
    let acq = acquisition(&device, 2000.0, 4, BufferPolicy::empty());
    let gen_session = generation(&device, 2000.0, PackingPolicy::Plain);
    let err = ReplayCoordinator::new(gen_session, acq, ReplayConfig::default()).unwrap_err();
    assert!(err.is_configuration());

    // Unconfigured generation session
    let acq = acquisition(&device, 2000.0, 4, BufferPolicy::empty());
    let gen_session = Session::open(Arc::clone(&device), SubsystemKind::AnalogOutput).unwrap();
    let err = ReplayCoordinator::new(acq, gen_session, ReplayConfig::default()).unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            state: SessionState::Unconfigured,
            ..
        }
    ));

    // Route naming an acquisition channel that does not exist
    let acq = acquisition(&device, 2000.0, 4, BufferPolicy::empty());
    let gen_session = generation(&device, 2000.0, PackingPolicy::Plain);
    let config = ReplayConfig {
        route: Some(vec![0, 2]),
        ..ReplayConfig::default()
    };
    assert!(ReplayCoordinator::new(acq, gen_session, config).is_err());
}

#[tokio::test]
async fn test_sink_receives_converted_frames() {
    let (_sim, device) = sim_device();
    let acq = acquisition(&device, 4000.0, 8, BufferPolicy::empty());
    let gen_session = generation(&device, 4000.0, PackingPolicy::Plain);

    let mut coordinator = ReplayCoordinator::new(acq, gen_session, ReplayConfig::default()).unwrap();
    let mut scope = coordinator.add_sink("scope", 16).unwrap();
    assert!(coordinator.add_sink("scope", 16).is_err());
    assert!(coordinator.add_sink("zero", 0).is_err());
    assert_eq!(coordinator.sink_names(), vec!["scope".to_string()]);
    coordinator.start().unwrap();

    let encoding = twelve_bit();
    for index in 0..8u32 {
        let frame = tokio::time::timeout(Duration::from_secs(5), scope.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("sink closed early");
        assert_eq!(frame.sequence, u64::from(index));
        assert_eq!(frame.n_channels, 2);
        assert_eq!(frame.n_scans(), SPF);

        let codes = ramp_frame(index);
        let expected: Vec<f64> = codes.iter().step_by(2).map(|&c| encoding.to_units(c)).collect();
        assert_eq!(frame.channel_data(0), expected);
    }

    coordinator.stop().unwrap();
    assert_eq!(coordinator.report().unwrap().stats.sink_drops.get("scope"), Some(&0));
}
