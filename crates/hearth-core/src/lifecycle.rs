// ── Lifecycle state ──
//
// `DisposeState` is the Active → Disposing → Disposed machine shared by
// peers, devices and families. `PhaseCell` carries the hub-wide phase that
// service messages consult before touching state.

use std::sync::atomic::{AtomicU8, Ordering};

use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum DisposePhase {
    Active,
    Disposing,
    Disposed,
}

/// Idempotent disposal state machine.
#[derive(Debug)]
pub struct DisposeState(AtomicU8);

const ACTIVE: u8 = 0;
const DISPOSING: u8 = 1;
const DISPOSED: u8 = 2;

impl DisposeState {
    pub const fn new() -> Self {
        Self(AtomicU8::new(ACTIVE))
    }

    /// Move from Active to Disposing. Only the first caller gets `true`.
    pub fn begin(&self) -> bool {
        self.0
            .compare_exchange(ACTIVE, DISPOSING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn finish(&self) {
        self.0.store(DISPOSED, Ordering::Release);
    }

    pub fn phase(&self) -> DisposePhase {
        match self.0.load(Ordering::Acquire) {
            ACTIVE => DisposePhase::Active,
            DISPOSING => DisposePhase::Disposing,
            _ => DisposePhase::Disposed,
        }
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire) == ACTIVE
    }
}

impl Default for DisposeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide hub phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum LifecyclePhase {
    Booting,
    Running,
    ShuttingDown,
}

#[derive(Debug)]
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub fn new(phase: LifecyclePhase) -> Self {
        Self(AtomicU8::new(phase as u8))
    }

    pub fn get(&self) -> LifecyclePhase {
        match self.0.load(Ordering::Acquire) {
            0 => LifecyclePhase::Booting,
            1 => LifecyclePhase::Running,
            _ => LifecyclePhase::ShuttingDown,
        }
    }

    pub fn set(&self, phase: LifecyclePhase) {
        self.0.store(phase as u8, Ordering::Release);
    }

    pub fn is_running(&self) -> bool {
        self.get() == LifecyclePhase::Running
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispose_begins_once() {
        let state = DisposeState::new();
        assert!(state.begin());
        assert!(!state.begin());
        assert_eq!(state.phase(), DisposePhase::Disposing);
        state.finish();
        assert!(!state.begin());
        assert_eq!(state.phase(), DisposePhase::Disposed);
    }

    #[test]
    fn phase_cell_round_trips() {
        let cell = PhaseCell::new(LifecyclePhase::Booting);
        assert!(!cell.is_running());
        cell.set(LifecyclePhase::Running);
        assert!(cell.is_running());
        cell.set(LifecyclePhase::ShuttingDown);
        assert_eq!(cell.get(), LifecyclePhase::ShuttingDown);
    }
}
