//! Connection state and the retry budget.

use std::fmt;

use serde::Serialize;

/// Where a bus or plugin client stands with respect to its peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    /// Idle. Emissions queue.
    #[default]
    Disconnected,
    /// An attempt is in flight. Further connect requests are no-ops.
    Connecting,
    /// Emissions go straight out.
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

/// Bounded connect attempt counter.
#[derive(Clone, Debug)]
pub struct RetryBudget {
    max: u32,
    used: u32,
}

impl RetryBudget {
    /// A full budget of `max` attempts.
    pub fn new(max: u32) -> Self {
        Self { max, used: 0 }
    }

    /// Take one attempt. Returns its 1-based number, or `None` when spent.
    pub fn try_take(&mut self) -> Option<u32> {
        if self.is_exhausted() {
            return None;
        }
        self.used += 1;
        Some(self.used)
    }

    /// Refill to `max`.
    pub fn reset(&mut self) {
        self.used = 0;
    }

    /// Allow exactly one more attempt after exhaustion.
    pub fn grant_one(&mut self) {
        if self.is_exhausted() {
            self.used = self.max.saturating_sub(1);
        }
    }

    /// Whether no attempts remain.
    pub fn is_exhausted(&self) -> bool {
        self.used >= self.max
    }

    /// Attempts taken since the last reset.
    pub fn used(&self) -> u32 {
        self.used
    }

    /// Attempts left.
    pub fn remaining(&self) -> u32 {
        self.max.saturating_sub(self.used)
    }

    /// Configured maximum.
    pub fn max(&self) -> u32 {
        self.max
    }
}
