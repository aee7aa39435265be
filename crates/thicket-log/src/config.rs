//! Log configuration.

use crate::error::{LogError, Result};

/// Configuration for a log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogConfig {
    /// Name shared by every replica of the log. `[A-Za-z0-9.-]+`.
    pub topic: String,
    /// Require a signature on every message.
    pub signatures: bool,
    /// Track parents and clocks. When off, every message has clock 0 and no parents.
    pub sequencing: bool,
}

impl LogConfig {
    pub fn new(topic: impl Into<String>) -> Self {
        LogConfig {
            topic: topic.into(),
            signatures: true,
            sequencing: true,
        }
    }

    pub fn builder(topic: impl Into<String>) -> LogConfigBuilder {
        LogConfigBuilder::new(topic)
    }

    pub fn validate(&self) -> Result<()> {
        if is_valid_topic(&self.topic) {
            Ok(())
        } else {
            Err(LogError::Validation(format!("invalid topic {:?}", self.topic)))
        }
    }
}

pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'-')
}

/// Builder for log configuration.
pub struct LogConfigBuilder {
    config: LogConfig,
}

impl LogConfigBuilder {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            config: LogConfig::new(topic),
        }
    }

    pub fn signatures(mut self, enabled: bool) -> Self {
        self.config.signatures = enabled;
        self
    }

    pub fn sequencing(mut self, enabled: bool) -> Self {
        self.config.sequencing = enabled;
        self
    }

    pub fn build(self) -> LogConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LogConfig::new("chat");
        assert!(config.signatures);
        assert!(config.sequencing);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = LogConfig::builder("app.v1-beta")
            .signatures(false)
            .sequencing(false)
            .build();
        assert!(!config.signatures);
        assert!(!config.sequencing);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_topic_charset() {
        for bad in ["", "with space", "slash/topic", "ünicode", "under_score"] {
            assert!(!is_valid_topic(bad), "{:?}", bad);
        }
        assert!(is_valid_topic("A-z.0"));
    }
}
