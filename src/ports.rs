//! IO Port Listeners
//!
//! A `Ports` block (see [`crate::memory::BlockType::Ports`]) routes each
//! absolute port number to a pair of registered listeners: an input function
//! for `IN` and an output function for `OUT`. Ports with no listener behave
//! exactly like unmapped memory — reads float high, writes vanish — so the
//! firmware can probe absent options without faulting.
//!
//! Listener registration is a construction-time activity. Registering a
//! second listener for the same direction on the same port is a machine
//! configuration error and is rejected, never silently replaced.

use std::collections::HashMap;
use std::fmt;

use tracing::debug;

use crate::memory::DATA_LIMIT;

/// Input listener: receives the absolute port number, returns the byte.
pub type InputFn = Box<dyn FnMut(u16) -> u8>;

/// Output listener: receives the absolute port number and the byte written.
pub type OutputFn = Box<dyn FnMut(u16, u8)>;

/// Listener registration failure.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PortError {
    /// An input listener already exists for this port.
    InputCollision(u16),
    /// An output listener already exists for this port.
    OutputCollision(u16),
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InputCollision(port) => {
                write!(f, "input listener collision on port {port:#04x}")
            }
            Self::OutputCollision(port) => {
                write!(f, "output listener collision on port {port:#04x}")
            }
        }
    }
}

impl std::error::Error for PortError {}

#[derive(Default)]
struct PortEntry {
    input: Option<InputFn>,
    output: Option<OutputFn>,
}

/// Per-block table of port listeners.
#[derive(Default)]
pub struct PortTable {
    entries: HashMap<u16, PortEntry>,
}

impl PortTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers listeners for `port`. Either side may be `None` for a
    /// direction the device does not implement.
    pub fn add_listener(
        &mut self,
        port: u16,
        input: Option<InputFn>,
        output: Option<OutputFn>,
    ) -> Result<(), PortError> {
        let entry = self.entries.entry(port).or_default();
        if input.is_some() && entry.input.is_some() {
            return Err(PortError::InputCollision(port));
        }
        if output.is_some() && entry.output.is_some() {
            return Err(PortError::OutputCollision(port));
        }
        if let Some(f) = input {
            entry.input = Some(f);
        }
        if let Some(f) = output {
            entry.output = Some(f);
        }
        Ok(())
    }

    /// Dispatches a port read. Unlistened ports read as open bus.
    pub fn input(&mut self, addr: u32) -> u8 {
        let port = (addr & 0xFFFF) as u16;
        match self.entries.get_mut(&port).and_then(|e| e.input.as_mut()) {
            Some(f) => f(port),
            None => {
                debug!("input from unlistened port {port:#04x}");
                DATA_LIMIT
            }
        }
    }

    /// Dispatches a port write. Unlistened ports swallow the byte.
    pub fn output(&mut self, addr: u32, value: u8) {
        let port = (addr & 0xFFFF) as u16;
        match self.entries.get_mut(&port).and_then(|e| e.output.as_mut()) {
            Some(f) => f(port, value),
            None => {
                debug!("output of {value:#04x} to unlistened port {port:#04x}");
            }
        }
    }
}
