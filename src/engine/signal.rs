//! Control signals from the dashboard/CLI collaborators.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    None,
    Pause,
    Stop,
}

impl From<u8> for Signal {
    fn from(v: u8) -> Self {
        match v {
            1 => Self::Pause,
            2 => Self::Stop,
            _ => Self::None,
        }
    }
}

impl From<Signal> for u8 {
    fn from(s: Signal) -> Self {
        match s {
            Signal::None => 0,
            Signal::Pause => 1,
            Signal::Stop => 2,
        }
    }
}

/// Shared pause/stop flag checked at every tick boundary.
#[derive(Clone, Default)]
pub struct SignalHandler {
    signal: Arc<AtomicU8>,
}

impl SignalHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pause(&self) {
        self.signal.store(Signal::Pause.into(), Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.signal.store(Signal::None.into(), Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.signal.store(Signal::Stop.into(), Ordering::SeqCst);
    }

    pub fn check(&self) -> Signal {
        Signal::from(self.signal.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_round_trip() {
        let handler = SignalHandler::new();
        assert_eq!(handler.check(), Signal::None);

        handler.pause();
        assert_eq!(handler.check(), Signal::Pause);

        handler.resume();
        assert_eq!(handler.check(), Signal::None);

        handler.stop();
        assert_eq!(handler.check(), Signal::Stop);
    }
}
