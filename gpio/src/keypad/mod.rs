mod mux;

use std::fmt::Debug;
use std::time::Instant;
pub use mux::*;

/// A single press or release reported by a [KeyScanner].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct KeyEvent {
    channel: usize,
    pressed: bool,
    timestamp: Instant,
}

impl KeyEvent {
    /// Creates an event stamped with the current instant.
    pub fn new(channel: usize, pressed: bool) -> Self {
        KeyEvent {
            channel,
            pressed,
            timestamp: Instant::now(),
        }
    }

    /// The channel (key number) that changed.
    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn pressed(&self) -> bool {
        self.pressed
    }

    pub fn released(&self) -> bool {
        !self.pressed
    }

    /// When the change was captured.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }
}

/// The `KeyScanner` trait defines the interface a key event loop polls.
///
/// Keys are opaque numbers in `0..key_count()`; mapping them to actions is up to the caller.
pub trait KeyScanner: Debug {
    type Error;

    /// Polls the keys once and returns the first change found, if any.
    fn scan_for_changes(&mut self) -> Result<Option<KeyEvent>, Self::Error>;

    /// Gets the total number of keys.
    fn key_count(&self) -> usize;
}
