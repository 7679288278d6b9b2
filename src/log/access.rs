//! Access handshake between the process thread and the reorganizer
//!
//! ```text
//!            request()              grant()
//!   Idle ─────────────► Requested ───────────► Granted
//!    ▲                                            │
//!    └──────────────────── release() ─────────────┘
//! ```
//! - the reorganizer requests access before it works on a log and waits
//!   for the grant
//! - the process thread grants between flush rounds, so a log is never
//!   cleaned while a round is distributing into it
//! - a caller blocked on an urgent reorganization grants proactively when
//!   its wait times out, so the reorganizer cannot starve behind a busy or
//!   blocked process thread
//!
//! State changes use AcqRel atomics; everything the granting thread wrote
//! before `grant()` is visible to the reorganizer after `wait_granted()`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

/// State of the handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessState {
    Idle = 0,
    Requested = 1,
    Granted = 2,
}

impl AccessState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => AccessState::Requested,
            2 => AccessState::Granted,
            _ => AccessState::Idle,
        }
    }
}

/// Three-state access flag with blocking wait for the grant
#[derive(Debug)]
pub struct AccessFlag {
    state: AtomicU8,
    lock: Mutex<()>,
    granted: Condvar,
}

impl AccessFlag {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(AccessState::Idle as u8),
            lock: Mutex::new(()),
            granted: Condvar::new(),
        }
    }

    pub fn state(&self) -> AccessState {
        AccessState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Reorganizer: ask for access (no-op unless idle)
    pub fn request(&self) {
        let _ = self.state.compare_exchange(
            AccessState::Idle as u8,
            AccessState::Requested as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Grant a pending request; returns whether one was pending
    pub fn grant(&self) -> bool {
        let granted = self
            .state
            .compare_exchange(
                AccessState::Requested as u8,
                AccessState::Granted as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if granted {
            let _guard = self.lock.lock();
            self.granted.notify_all();
        }
        granted
    }

    /// Reorganizer: wait up to `timeout` for the grant
    pub fn wait_granted(&self, timeout: Duration) -> bool {
        let mut guard = self.lock.lock();
        if self.state() == AccessState::Granted {
            return true;
        }
        self.granted.wait_for(&mut guard, timeout);
        self.state() == AccessState::Granted
    }

    /// Reorganizer: give access back
    pub fn release(&self) {
        self.state.store(AccessState::Idle as u8, Ordering::Release);
    }
}

impl Default for AccessFlag {
    fn default() -> Self {
        Self::new()
    }
}
