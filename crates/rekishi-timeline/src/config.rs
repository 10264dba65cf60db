//! Engine configuration, loaded from RON.
//!
//! ```ron
//! (
//!     event_signal_capacity: 16,
//!     relations_channel_capacity: 256,
//!     state_channel_capacity: 64,
//! )
//! ```
//!
//! Every field is optional; missing fields take the defaults above.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Channel sizing for the engine's notification fan-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Buffer of each event's signal channel (status, redaction, replaced).
    pub event_signal_capacity: usize,
    /// Buffer of each relation container's notification channel.
    pub relations_channel_capacity: usize,
    /// Buffer of each room-state snapshot's update channel.
    pub state_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_signal_capacity: 16,
            relations_channel_capacity: 256,
            state_channel_capacity: 64,
        }
    }
}

/// Error type for config loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("RON parse error: {0}")]
    Ron(#[from] ron::error::SpannedError),
}

impl EngineConfig {
    /// Parse a RON document.
    pub fn from_ron_str(text: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = ron::from_str(text)?;
        Ok(config.clamped())
    }

    /// Read and parse a RON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_ron_str(&text)
    }

    /// Broadcast channels reject a zero capacity; bump zeros to 1.
    fn clamped(mut self) -> Self {
        for (name, cap) in [
            ("event_signal_capacity", &mut self.event_signal_capacity),
            ("relations_channel_capacity", &mut self.relations_channel_capacity),
            ("state_channel_capacity", &mut self.state_channel_capacity),
        ] {
            if *cap == 0 {
                warn!("{name} = 0 is not a valid channel capacity, using 1");
                *cap = 1;
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_ron_uses_defaults() {
        let config = EngineConfig::from_ron_str("(relations_channel_capacity: 8)").unwrap();
        assert_eq!(config.relations_channel_capacity, 8);
        assert_eq!(config.event_signal_capacity, 16);
        assert_eq!(config.state_channel_capacity, 64);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let config = EngineConfig::from_ron_str("(event_signal_capacity: 0)").unwrap();
        assert_eq!(config.event_signal_capacity, 1);
    }

    #[test]
    fn test_bad_ron_is_error() {
        let err = EngineConfig::from_ron_str("(event_signal_capacity: \"many\")").unwrap_err();
        assert!(matches!(err, ConfigError::Ron(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "(state_channel_capacity: 4)").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.state_channel_capacity, 4);

        let missing = EngineConfig::load(file.path().with_extension("missing"));
        assert!(matches!(missing, Err(ConfigError::Io(_))));
    }
}
