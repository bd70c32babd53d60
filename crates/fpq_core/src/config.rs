//! Queue configuration.

use crate::error::{QueueError, QueueResult};
use std::path::PathBuf;
use std::time::Duration;

/// Smallest accepted value for `max_number_of_segments`.
///
/// Eviction always spares the push target, and a reload may need to evict
/// another resident segment to make room.
pub const MIN_NUMBER_OF_SEGMENTS: u32 = 4;

/// Configuration for opening a queue.
///
/// The value is handed once to [`crate::PersistentQueue::open`] and copied
/// into every component; nothing reads configuration from shared state.
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory owning the journal files. Created if missing.
    pub journal_directory: PathBuf,

    /// Maximum number of entries kept RAM-resident before segments are
    /// offloaded to disk.
    pub memory_queue_max_size: u64,

    /// Maximum number of entries a single push or pop transaction may hold.
    pub max_transaction_size: u32,

    /// Number of background fsync workers.
    pub number_of_flush_workers: u32,

    /// Period between background fsync passes.
    pub flush_period_ms: u32,

    /// Journal file size that triggers a roll.
    pub max_journal_file_size_bytes: u64,

    /// Journal file age that triggers a roll.
    pub max_journal_duration_ms: u32,

    /// Byte budget of one in-memory segment.
    pub max_segment_size_bytes: u64,

    /// Maximum number of RAM-resident segments (at least 4).
    pub max_number_of_segments: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            journal_directory: PathBuf::from("fpq-journal"),
            memory_queue_max_size: 1_000_000,
            max_transaction_size: 100,
            number_of_flush_workers: 4,
            flush_period_ms: 10_000,
            max_journal_file_size_bytes: 100_000_000,
            max_journal_duration_ms: 5 * 60 * 1000,
            max_segment_size_bytes: 10 * 1024 * 1024, // 10 MiB
            max_number_of_segments: MIN_NUMBER_OF_SEGMENTS,
        }
    }
}

impl Config {
    /// Creates a configuration with default values for `journal_directory`.
    #[must_use]
    pub fn new(journal_directory: impl Into<PathBuf>) -> Self {
        Self {
            journal_directory: journal_directory.into(),
            ..Self::default()
        }
    }

    /// Sets the maximum number of RAM-resident entries.
    #[must_use]
    pub const fn memory_queue_max_size(mut self, value: u64) -> Self {
        self.memory_queue_max_size = value;
        self
    }

    /// Sets the maximum transaction size.
    #[must_use]
    pub const fn max_transaction_size(mut self, value: u32) -> Self {
        self.max_transaction_size = value;
        self
    }

    /// Sets the number of background fsync workers.
    #[must_use]
    pub const fn number_of_flush_workers(mut self, value: u32) -> Self {
        self.number_of_flush_workers = value;
        self
    }

    /// Sets the fsync period in milliseconds.
    #[must_use]
    pub const fn flush_period_ms(mut self, value: u32) -> Self {
        self.flush_period_ms = value;
        self
    }

    /// Sets the journal roll size.
    #[must_use]
    pub const fn max_journal_file_size_bytes(mut self, value: u64) -> Self {
        self.max_journal_file_size_bytes = value;
        self
    }

    /// Sets the journal roll age in milliseconds.
    #[must_use]
    pub const fn max_journal_duration_ms(mut self, value: u32) -> Self {
        self.max_journal_duration_ms = value;
        self
    }

    /// Sets the byte budget of one segment.
    #[must_use]
    pub const fn max_segment_size_bytes(mut self, value: u64) -> Self {
        self.max_segment_size_bytes = value;
        self
    }

    /// Sets the maximum number of RAM-resident segments.
    #[must_use]
    pub const fn max_number_of_segments(mut self, value: u32) -> Self {
        self.max_number_of_segments = value;
        self
    }

    /// Returns the fsync period.
    #[must_use]
    pub fn flush_period(&self) -> Duration {
        Duration::from_millis(u64::from(self.flush_period_ms))
    }

    /// Returns the journal roll age.
    #[must_use]
    pub fn max_journal_duration(&self) -> Duration {
        Duration::from_millis(u64::from(self.max_journal_duration_ms))
    }

    /// Checks every option.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Configuration`] naming the first invalid option.
    pub fn validate(&self) -> QueueResult<()> {
        if self.journal_directory.as_os_str().is_empty() {
            return Err(QueueError::configuration("journal_directory must not be empty"));
        }
        if self.journal_directory.exists() && !self.journal_directory.is_dir() {
            return Err(QueueError::configuration(format!(
                "journal_directory is not a directory: {}",
                self.journal_directory.display()
            )));
        }

        let positive = [
            ("memory_queue_max_size", self.memory_queue_max_size),
            ("max_transaction_size", u64::from(self.max_transaction_size)),
            ("number_of_flush_workers", u64::from(self.number_of_flush_workers)),
            ("flush_period_ms", u64::from(self.flush_period_ms)),
            ("max_journal_file_size_bytes", self.max_journal_file_size_bytes),
            ("max_journal_duration_ms", u64::from(self.max_journal_duration_ms)),
            ("max_segment_size_bytes", self.max_segment_size_bytes),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, value)| *value == 0) {
            return Err(QueueError::configuration(format!("{name} must be positive")));
        }

        if self.max_number_of_segments < MIN_NUMBER_OF_SEGMENTS {
            return Err(QueueError::configuration(format!(
                "max_number_of_segments must be at least {MIN_NUMBER_OF_SEGMENTS}, got {}",
                self.max_number_of_segments
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = Config::new("/tmp/fpq-config-test");
        assert!(config.validate().is_ok());
        assert_eq!(config.max_transaction_size, 100);
        assert_eq!(config.max_number_of_segments, 4);
        assert_eq!(config.flush_period(), Duration::from_secs(10));
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new("q")
            .max_transaction_size(10)
            .flush_period_ms(50)
            .max_segment_size_bytes(1024);

        assert_eq!(config.max_transaction_size, 10);
        assert_eq!(config.flush_period_ms, 50);
        assert_eq!(config.max_segment_size_bytes, 1024);
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let err = Config::new("q").max_segment_size_bytes(0).validate().unwrap_err();
        assert!(matches!(err, QueueError::Configuration { .. }));
        assert!(err.to_string().contains("max_segment_size_bytes"));

        assert!(Config::new("q").flush_period_ms(0).validate().is_err());
        assert!(Config::new("q").max_transaction_size(0).validate().is_err());
    }

    #[test]
    fn segment_floor_is_enforced() {
        assert!(Config::new("q").max_number_of_segments(3).validate().is_err());
        assert!(Config::new("q").max_number_of_segments(8).validate().is_ok());
    }

    #[test]
    fn file_as_directory_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain-file");
        std::fs::write(&file, b"x").unwrap();

        assert!(Config::new(&file).validate().is_err());
        assert!(Config::new("").validate().is_err());
    }
}
