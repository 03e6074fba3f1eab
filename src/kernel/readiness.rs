//! Readiness flags.
//!
//! The runtime flag and each service's state are the only things that gate
//! dispatch and new work. Both are atomics; nothing else is consulted.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// Atomic on/off flag with gated execution.
#[derive(Debug)]
pub struct ReadyFlag(AtomicBool);

impl ReadyFlag {
    pub fn new(ready: bool) -> Self {
        Self(AtomicBool::new(ready))
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub fn set(&self, ready: bool) {
        self.0.store(ready, Ordering::Release);
    }

    /// Flip true → false. Only one caller ever sees `true`.
    pub fn take(&self) -> bool {
        self.0
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Run `f` only while the flag is set.
    pub fn run_while<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if self.is_ready() {
            Some(f())
        } else {
            None
        }
    }
}

/// Lifecycle state of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    NotStarted,
    Ready,
    Stopped,
}

impl ServiceState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ServiceState::NotStarted,
            1 => ServiceState::Ready,
            _ => ServiceState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ServiceState::NotStarted => 0,
            ServiceState::Ready => 1,
            ServiceState::Stopped => 2,
        }
    }
}

/// Atomic cell holding a [`ServiceState`].
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ServiceState) -> Self {
        Self(AtomicU8::new(state.as_u8()))
    }

    pub fn get(&self) -> ServiceState {
        ServiceState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn is_ready(&self) -> bool {
        self.get() == ServiceState::Ready
    }

    /// Compare-and-set; false if the current state was not `from`.
    pub fn transition(&self, from: ServiceState, to: ServiceState) -> bool {
        self.0
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Run `f` only while the state is `Ready`.
    pub fn run_if_ready<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        if self.is_ready() {
            Some(f())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_only_once() {
        let flag = ReadyFlag::new(true);
        assert!(flag.take());
        assert!(!flag.take());
        assert!(!flag.is_ready());
        assert_eq!(flag.run_while(|| 1), None);
        flag.set(true);
        assert_eq!(flag.run_while(|| 1), Some(1));
    }

    #[test]
    fn test_state_transitions() {
        let cell = StateCell::new(ServiceState::NotStarted);
        assert!(!cell.is_ready());
        assert!(!cell.transition(ServiceState::Ready, ServiceState::Stopped));
        assert!(cell.transition(ServiceState::NotStarted, ServiceState::Ready));
        assert_eq!(cell.run_if_ready(|| "ran"), Some("ran"));
        assert!(cell.transition(ServiceState::Ready, ServiceState::Stopped));
        assert_eq!(cell.get(), ServiceState::Stopped);
        assert_eq!(cell.run_if_ready(|| "ran"), None);
    }
}
