//! Bitmask event channel between a device collaborator and a waiting session.
//!
//! The device side latches condition bits with [`EventChannel::set_events`];
//! the session blocks in [`EventChannel::wait_events`] with a finite timeout.
//!
//! # Consume, then re-arm
//!
//! Only armed bits latch. A successful wait consumes the bits it returns: they
//! are cleared from the pending register *and* disarmed. The waiter must
//! [`arm`](EventChannel::arm) them again before the next occurrence can be
//! observed. Skipping the re-arm silently loses every later occurrence of
//! that condition.
//!
//! ```text
//!  arm(FRAME_DONE) ─► set(FRAME_DONE) ─► wait → FRAME_DONE ─► (disarmed)
//!                                                         └─► arm(FRAME_DONE) ─► ...
//! ```
//!
//! [`EventChannel::force_events`] bypasses arming. It exists for synthetic
//! teardown wakeups (a forced `STOPPED`), so a stop request always reaches a
//! blocked waiter.

use std::time::{Duration, Instant};

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Longest single wait. Larger timeouts are clamped, so no wait is unbounded.
pub const MAX_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

bitflags! {
    /// Pending condition flags for one session.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventMask: u32 {
        /// A frame of scans completed
        const FRAME_DONE = 1 << 0;
        /// A whole pass over the buffer completed
        const BUFFER_DONE = 1 << 1;
        /// Overrun (acquisition) or underrun (generation)
        const BUFFER_ERROR = 1 << 2;
        /// Hardware halted
        const STOPPED = 1 << 3;
        /// Value outside the expected range
        const DATA_ERROR = 1 << 4;
        /// Synthetic: the wait expired. Never latched, only returned.
        const TIMEOUT = 1 << 31;
    }
}

impl EventMask {
    /// Frame or buffer completion.
    pub const COMPLETION: Self = Self::FRAME_DONE.union(Self::BUFFER_DONE);

    /// Conditions fatal to a session.
    pub const FAULTS: Self = Self::BUFFER_ERROR.union(Self::STOPPED);

    /// Every bit hardware may raise.
    pub const HARDWARE: Self = Self::COMPLETION
        .union(Self::FAULTS)
        .union(Self::DATA_ERROR);

    /// Check if this is the timeout indication.
    pub fn is_timeout(&self) -> bool {
        self.contains(Self::TIMEOUT)
    }
}

/// Which waiters a latched event wakes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WakePolicy {
    /// Wake a single blocked waiter
    One,
    /// Wake every blocked waiter
    #[default]
    All,
}

#[derive(Debug, Default)]
struct EventState {
    pending: EventMask,
    armed: EventMask,
}

/// Event register plus wait primitive for one session.
#[derive(Debug, Default)]
pub struct EventChannel {
    state: Mutex<EventState>,
    signal: Condvar,
    wake: WakePolicy,
}

impl EventChannel {
    /// Create a channel with nothing armed.
    pub fn new(wake: WakePolicy) -> Self {
        Self {
            state: Mutex::new(EventState::default()),
            signal: Condvar::new(),
            wake,
        }
    }

    /// Register interest in `mask`.
    pub fn arm(&self, mask: EventMask) {
        self.state.lock().armed |= mask & EventMask::HARDWARE;
    }

    /// Withdraw interest in `mask` and drop any of its pending bits.
    pub fn disarm(&self, mask: EventMask) {
        let mut state = self.state.lock();
        state.armed.remove(mask);
        state.pending.remove(mask);
    }

    /// Currently armed bits.
    pub fn armed(&self) -> EventMask {
        self.state.lock().armed
    }

    /// Currently pending bits.
    pub fn pending(&self) -> EventMask {
        self.state.lock().pending
    }

    /// Latch the armed subset of `mask` and wake waiters.
    ///
    /// Returns the bits that latched; unarmed bits are dropped.
    pub fn set_events(&self, mask: EventMask) -> EventMask {
        let mut state = self.state.lock();
        let latched = mask & state.armed;
        if latched.is_empty() {
            return latched;
        }
        state.pending |= latched;
        drop(state);
        trace!(events = ?latched, "Events latched");
        self.notify();
        latched
    }

    /// Latch `mask` regardless of arming and wake every waiter.
    pub fn force_events(&self, mask: EventMask) {
        self.state.lock().pending |= mask & EventMask::HARDWARE;
        self.signal.notify_all();
    }

    /// Unconditionally zero the given pending bits.
    pub fn clear_events(&self, mask: EventMask) {
        self.state.lock().pending.remove(mask);
    }

    /// Block until a bit of `interest` is pending or `timeout` elapses.
    ///
    /// On success returns the pending subset of `interest` and consumes it
    /// (cleared and disarmed). On expiry returns exactly
    /// [`EventMask::TIMEOUT`], never before `timeout` has passed.
    pub fn wait_events(&self, interest: EventMask, timeout: Duration) -> EventMask {
        let interest = interest & EventMask::HARDWARE;
        let deadline = Instant::now() + timeout.min(MAX_WAIT);
        let mut state = self.state.lock();

        loop {
            let fired = state.pending & interest;
            if !fired.is_empty() {
                state.pending.remove(fired);
                state.armed.remove(fired);
                return fired;
            }
            if self.signal.wait_until(&mut state, deadline).timed_out() {
                let fired = state.pending & interest;
                if fired.is_empty() {
                    return EventMask::TIMEOUT;
                }
                state.pending.remove(fired);
                state.armed.remove(fired);
                return fired;
            }
        }
    }

    /// Non-blocking variant of [`wait_events`](Self::wait_events): consumes and
    /// returns whatever of `interest` is pending (possibly nothing).
    pub fn take_events(&self, interest: EventMask) -> EventMask {
        let mut state = self.state.lock();
        let fired = state.pending & interest & EventMask::HARDWARE;
        state.pending.remove(fired);
        state.armed.remove(fired);
        fired
    }

    fn notify(&self) {
        match self.wake {
            WakePolicy::One => {
                self.signal.notify_one();
            }
            WakePolicy::All => {
                self.signal.notify_all();
            }
        }
    }
}
