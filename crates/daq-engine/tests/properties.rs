//! Property tests for ring arithmetic, codecs, the session state machine and
//! the hand-off.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use daq_engine::codec::{
    pack_channels, raw_to_units, unpack_channels, units_to_raw, MAX_RESOLUTION_BITS,
};
use daq_engine::sim::SimDevice;
use daq_engine::{
    BufferGeometry, BufferPolicy, ChannelCoding, DeviceCollaborator, FrameBuffer, HandOff,
    PackingPolicy, Range, Session, SessionConfig, SessionState, SubsystemKind,
};
use proptest::prelude::*;

#[derive(Debug, Clone, Copy)]
enum RingOp {
    Write,
    Release,
}

fn ring_op() -> impl Strategy<Value = RingOp> {
    prop_oneof![Just(RingOp::Write), Just(RingOp::Release)]
}

fn policy() -> impl Strategy<Value = BufferPolicy> {
    (any::<bool>(), any::<bool>()).prop_map(|(wrapped, recycled)| {
        let mut policy = BufferPolicy::empty();
        policy.set(BufferPolicy::WRAPPED, wrapped);
        policy.set(BufferPolicy::RECYCLED, recycled);
        policy
    })
}

proptest! {
    #[test]
    fn prop_frame_offsets_stay_in_ring(
        frame_count in 1usize..64,
        scans_per_frame in 1usize..256,
        scan_size in 1usize..16,
        index in any::<u64>(),
        consumed in 0usize..100_000,
    ) {
        let geometry = BufferGeometry::new(frame_count, scans_per_frame, scan_size).unwrap();
        let offset = geometry.frame_offset(index);
        prop_assert!(geometry.is_frame_aligned(offset));
        prop_assert_eq!(offset, (index % frame_count as u64) as usize * scans_per_frame);
        prop_assert_eq!(geometry.frame_of(offset), (index % frame_count as u64) as usize);

        let advanced = geometry.advance(offset, consumed);
        prop_assert!(advanced < geometry.capacity_scans());
        prop_assert_eq!(advanced, (offset + consumed) % geometry.capacity_scans());
        prop_assert!(geometry.sample_offset(advanced) + scan_size <= geometry.capacity());
    }

    #[test]
    fn prop_ring_bookkeeping_is_consistent(
        frame_count in 1usize..8,
        policy in policy(),
        ops in prop::collection::vec(ring_op(), 0..200),
    ) {
        let mut ring = FrameBuffer::allocate(frame_count, 4, 2, policy).unwrap();
        let fc = frame_count as u64;
        let mut writes = 0u64;

        for op in ops {
            match op {
                RingOp::Write => {
                    let before = ring.pending_frames();
                    match ring.write_frame() {
                        Ok(write) => {
                            prop_assert_eq!(write.sequence, writes);
                            prop_assert_eq!(write.scan_offset, (writes % fc) as usize * 4);
                            prop_assert_eq!(write.buffer_complete, (writes + 1) % fc == 0);
                            prop_assert_eq!(write.overwrote, before == fc);
                            writes += 1;
                        }
                        Err(_) => {
                            let exhausted = !policy.contains(BufferPolicy::WRAPPED) && writes >= fc;
                            let unreleased = policy.contains(BufferPolicy::RECYCLED) && before >= fc;
                            prop_assert!(exhausted || unreleased);
                        }
                    }
                }
                RingOp::Release => {
                    let before = ring.pending_frames();
                    let expected = ring.read_offset();
                    match ring.release_frame() {
                        Some(offset) => prop_assert_eq!(offset, expected),
                        None => prop_assert_eq!(before, 0),
                    }
                }
            }
            prop_assert!(ring.frames_released() <= ring.frames_written());
            prop_assert!(ring.pending_frames() <= fc);
            prop_assert_eq!(ring.frames_written(), writes);
            prop_assert_eq!(ring.read_offset(), (ring.frames_released() % fc) as usize * 4);
            prop_assert_eq!(ring.write_offset(), (ring.frames_written() % fc) as usize * 4);
        }
    }

    #[test]
    fn prop_codes_round_trip(
        bits in 1u32..=MAX_RESOLUTION_BITS,
        code in any::<u32>(),
        min in -100.0f64..100.0,
        span in 0.1f64..200.0,
    ) {
        let coding = ChannelCoding::straight_binary(bits).unwrap();
        let range = Range::new(min, min + span).unwrap();
        let code = code & coding.max_code();
        let units = raw_to_units(code, &coding, &range);
        prop_assert!(units >= range.min && units <= range.max);
        prop_assert_eq!(units_to_raw(units, &coding, &range), code);
    }

    #[test]
    fn prop_conversion_is_total_and_monotonic(
        bits in 1u32..=24,
        raw in any::<u32>(),
        a in any::<f64>(),
        b in any::<f64>(),
    ) {
        let coding = ChannelCoding::twos_complement(bits).unwrap();
        let range = Range::default();
        let units = raw_to_units(raw, &coding, &range);
        prop_assert!(units >= range.min && units <= range.max);

        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        if !lo.is_nan() && !hi.is_nan() {
            prop_assert!(units_to_raw(lo, &coding, &range) <= units_to_raw(hi, &coding, &range));
        }
        prop_assert!(units_to_raw(a, &coding, &range) <= coding.max_code());
    }

    #[test]
    fn prop_channel_tagged_packing_round_trips(
        samples in prop::collection::vec((0u32..=0xFFFF, 0u32..=0xFFFF), 1..64),
    ) {
        let (codes, ids): (Vec<u32>, Vec<u32>) = samples.into_iter().unzip();
        let words = pack_channels(&codes, &ids, PackingPolicy::ChannelTagged).unwrap();
        let unpacked = unpack_channels(&words, PackingPolicy::ChannelTagged);
        prop_assert_eq!(unpacked.codes, codes);
        prop_assert_eq!(unpacked.channel_ids, ids);
    }

    #[test]
    fn prop_co_packed_pairs_round_trip(
        pairs in prop::collection::vec((0u32..0x1000, 0u32..0x1000), 1..64),
    ) {
        let codes: Vec<u32> = pairs.iter().flat_map(|&(a, b)| [a, b]).collect();
        let ids: Vec<u32> = pairs.iter().flat_map(|_| [0, 1]).collect();
        let words = pack_channels(&codes, &ids, PackingPolicy::CoPackedPair).unwrap();
        prop_assert_eq!(words.len(), pairs.len());
        let unpacked = unpack_channels(&words, PackingPolicy::CoPackedPair);
        prop_assert_eq!(unpacked.codes, codes);
        prop_assert_eq!(unpacked.channel_ids, ids);
    }
}

#[derive(Debug, Clone, Copy)]
enum SessionOp {
    Acquire,
    Configure,
    Start,
    Halt,
    Unconfigure,
    Release,
    Stop,
}

fn session_op() -> impl Strategy<Value = SessionOp> {
    prop_oneof![
        Just(SessionOp::Acquire),
        Just(SessionOp::Configure),
        Just(SessionOp::Start),
        Just(SessionOp::Halt),
        Just(SessionOp::Unconfigure),
        Just(SessionOp::Release),
        Just(SessionOp::Stop),
    ]
}

/// Expected state after `op`, or `None` if `op` is illegal from `state`.
fn model(state: SessionState, op: SessionOp) -> Option<SessionState> {
    use SessionState::*;
    match (op, state) {
        (SessionOp::Acquire, Closed) => Some(Unconfigured),
        (SessionOp::Configure, Unconfigured) => Some(Configured),
        (SessionOp::Start, Configured) => Some(Running),
        (SessionOp::Halt, Running) => Some(Configured),
        (SessionOp::Unconfigure, Configured) => Some(Unconfigured),
        (SessionOp::Release, Unconfigured) => Some(Closed),
        (SessionOp::Stop, _) => Some(Closed),
        _ => None,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_session_follows_state_machine(ops in prop::collection::vec(session_op(), 1..24)) {
        let sim = SimDevice::default();
        let device: Arc<dyn DeviceCollaborator> = Arc::new(sim.clone());
        let mut session = Session::new(device, SubsystemKind::AnalogInput);

        for op in ops {
            let before = session.state();
            let result = match op {
                SessionOp::Acquire => session.acquire(),
                SessionOp::Configure => session.configure(
                    SessionConfig::builder()
                        .channels(&[0, 1])
                        .sample_rate(100.0)
                        .scans_per_frame(16)
                        .build()
                        .unwrap(),
                ),
                SessionOp::Start => session.start(),
                SessionOp::Halt => session.halt(),
                SessionOp::Unconfigure => session.unconfigure(),
                SessionOp::Release => session.release(),
                SessionOp::Stop => session.stop(),
            };
            match model(before, op) {
                Some(after) => {
                    prop_assert!(result.is_ok(), "{:?} from {:?} failed: {:?}", op, before, result);
                    prop_assert_eq!(session.state(), after);
                }
                None => {
                    prop_assert!(result.is_err(), "{:?} from {:?} succeeded", op, before);
                    prop_assert_eq!(session.state(), before);
                }
            }
            prop_assert_eq!(
                sim.is_claimed(SubsystemKind::AnalogInput),
                session.state() != SessionState::Closed
            );
            prop_assert_eq!(
                sim.is_running(SubsystemKind::AnalogInput),
                session.state() == SessionState::Running
            );
        }
        session.stop().unwrap();
        prop_assert!(!sim.is_claimed(SubsystemKind::AnalogInput));
    }

    #[test]
    fn prop_hand_off_delivers_each_frame_once_in_order(
        frames in 1u64..40,
        producer_pause in 0u64..3,
        consumer_pause in 0u64..3,
    ) {
        let hand_off = Arc::new(HandOff::new());
        let timeout = Duration::from_secs(5);

        let producer = {
            let hand_off = Arc::clone(&hand_off);
            thread::spawn(move || {
                for n in 0..frames {
                    hand_off
                        .publish(timeout, |slot| slot.words = vec![n as u32])
                        .unwrap();
                    thread::sleep(Duration::from_micros(producer_pause * 100));
                }
                hand_off.finish();
            })
        };

        let mut received = Vec::new();
        while let Some((sequence, words)) = hand_off
            .take(timeout, |slot| (slot.sequence, slot.words.clone()))
            .unwrap()
        {
            received.push((sequence, words));
            thread::sleep(Duration::from_micros(consumer_pause * 100));
        }
        producer.join().unwrap();

        let expected: Vec<(u64, Vec<u32>)> = (0..frames).map(|n| (n, vec![n as u32])).collect();
        prop_assert_eq!(received, expected);
        prop_assert_eq!(hand_off.published(), frames);
        prop_assert_eq!(hand_off.consumed(), frames);
        prop_assert!(hand_off.wait_drained(Duration::from_millis(1)));
    }
}
