//! Per-channel configuration.

use serde::{Deserialize, Serialize};

use crate::bus::SpiMode;

/// How many bytes of the receive buffer are appended to the incoming stream
/// after an exchange.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DrainMode {
    /// Only the bytes the driver reports as exchanged.
    #[default]
    ReportedLength,
    /// The whole buffer capacity, whatever the master actually clocked.
    ///
    /// Short exchanges then show up as trailing zero bytes. Only useful for
    /// peers that were written against that behavior.
    FullCapacity,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelSettings {
    pub mode: SpiMode,
    /// Hardware transaction queue depth requested at activation.
    pub queue_depth: usize,
    pub drain: DrainMode,
    /// Upper bound on bytes waiting to be sent. `None` is unbounded.
    pub max_outgoing: Option<usize>,
    /// Upper bound on received bytes not yet read. `None` is unbounded.
    pub max_incoming: Option<usize>,
}

impl ChannelSettings {
    pub const DEFAULT_QUEUE_DEPTH: usize = 1;

    #[must_use]
    pub const fn new() -> Self {
        Self {
            mode: SpiMode::Mode0,
            queue_depth: Self::DEFAULT_QUEUE_DEPTH,
            drain: DrainMode::ReportedLength,
            max_outgoing: None,
            max_incoming: None,
        }
    }

    #[must_use]
    pub fn with_mode(self, mode: SpiMode) -> Self {
        Self { mode, ..self }
    }

    /// A depth of zero is bumped to one: the channel always needs a slot for
    /// its own descriptor.
    #[must_use]
    pub fn with_queue_depth(self, queue_depth: usize) -> Self {
        Self {
            queue_depth: queue_depth.max(1),
            ..self
        }
    }

    #[must_use]
    pub fn with_drain(self, drain: DrainMode) -> Self {
        Self { drain, ..self }
    }

    #[must_use]
    pub fn with_max_outgoing(self, max_outgoing: usize) -> Self {
        Self {
            max_outgoing: Some(max_outgoing),
            ..self
        }
    }

    #[must_use]
    pub fn with_max_incoming(self, max_incoming: usize) -> Self {
        Self {
            max_incoming: Some(max_incoming),
            ..self
        }
    }
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self::new()
    }
}
