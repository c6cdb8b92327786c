//! Changelog configuration.

use std::time::Duration;

/// Configuration of a single segmented log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Size a segment may reach before appends go to a new one.
    pub max_segment_size: u64,

    /// Whether every append is synced to the medium before returning.
    pub sync_on_append: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            max_segment_size: 16 * 1024 * 1024, // 16 MB
            sync_on_append: false,
        }
    }
}

impl LogConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the segment rotation size.
    #[must_use]
    pub const fn max_segment_size(mut self, size: u64) -> Self {
        self.max_segment_size = size;
        self
    }

    /// Sets whether appends are synced.
    #[must_use]
    pub const fn sync_on_append(mut self, value: bool) -> Self {
        self.sync_on_append = value;
        self
    }
}

/// Configuration of the changelog database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangelogConfig {
    /// Settings applied to every replica log and the change number index.
    pub log: LogConfig,

    /// How long changes are retained before they may be purged.
    pub purge_delay: Duration,

    /// Number of state records after which a persisted state stream is
    /// rewritten as a single record.
    pub state_compaction_threshold: usize,
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            purge_delay: Duration::from_secs(3 * 24 * 60 * 60), // 3 days
            state_compaction_threshold: 1024,
        }
    }
}

impl ChangelogConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the per-log configuration.
    #[must_use]
    pub fn log(mut self, log: LogConfig) -> Self {
        self.log = log;
        self
    }

    /// Sets the retention delay.
    #[must_use]
    pub const fn purge_delay(mut self, delay: Duration) -> Self {
        self.purge_delay = delay;
        self
    }

    /// Sets the state compaction threshold.
    #[must_use]
    pub const fn state_compaction_threshold(mut self, records: usize) -> Self {
        self.state_compaction_threshold = records;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ChangelogConfig::default();
        assert!(!config.log.sync_on_append);
        assert_eq!(config.purge_delay, Duration::from_secs(259_200));
        assert!(config.state_compaction_threshold > 0);
    }

    #[test]
    fn builder_pattern() {
        let config = ChangelogConfig::new()
            .log(LogConfig::new().max_segment_size(4096).sync_on_append(true))
            .purge_delay(Duration::from_millis(10))
            .state_compaction_threshold(8);

        assert_eq!(config.log.max_segment_size, 4096);
        assert!(config.log.sync_on_append);
        assert_eq!(config.purge_delay, Duration::from_millis(10));
        assert_eq!(config.state_compaction_threshold, 8);
    }
}
