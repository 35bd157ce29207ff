//! Relay tunables.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default upper bound on a single frame payload (16 MiB).
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Default deadline for one framed write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Default broadcast channel capacity for relay events.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Default event history retained for late subscribers (1 MiB).
pub const DEFAULT_HISTORY_BYTES: usize = 1024 * 1024;

/// Configuration shared by the listener, connections and event hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Largest payload accepted or sent in one frame.
    pub max_frame_len: usize,

    /// Deadline for writing one frame to an agent.
    pub write_timeout: Duration,

    /// Disconnect an agent that sends nothing for this long.
    /// `None` waits indefinitely.
    pub idle_timeout: Option<Duration>,

    /// Live event channel capacity. Slow subscribers lag past this.
    pub event_capacity: usize,

    /// Approximate bytes of event history replayed to new subscribers.
    pub history_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            idle_timeout: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            history_bytes: DEFAULT_HISTORY_BYTES,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: RelayConfig = serde_json::from_str(r#"{"max_frame_len": 1024}"#).unwrap();
        assert_eq!(config.max_frame_len, 1024);
        assert_eq!(config.write_timeout, DEFAULT_WRITE_TIMEOUT);
        assert_eq!(config.idle_timeout, None);
    }
}
