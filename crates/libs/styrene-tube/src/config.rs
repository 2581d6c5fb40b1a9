use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Per-channel tuning, loadable from a flat TOML document.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TubeConfig {
    /// Capacity of the broadcast channel carrying [`crate::TubeEvent`]s.
    /// Slow subscribers that fall further behind observe a lag.
    pub event_capacity: usize,
    /// Offer TCP sockets with `Port` access control whenever the channel
    /// supports it, so connections can be mapped back to source addresses.
    pub prefer_port_access_control: bool,
}

impl Default for TubeConfig {
    fn default() -> Self {
        Self {
            event_capacity: 64,
            prefer_port_access_control: true,
        }
    }
}

impl TubeConfig {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, io::Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
    }

    /// Broadcast channels reject a zero capacity.
    pub(crate) fn effective_event_capacity(&self) -> usize {
        self.event_capacity.max(1)
    }
}
