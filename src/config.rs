//! Tunables for a trace session.

use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_BUFFER_CAPACITY: usize = 256 * 1024 * 1024;
const DEFAULT_TRACER_STACK_SIZE: usize = 256 * 1024;
const DEFAULT_PROGRESS_INTERVAL: u64 = 1_000_000;
const DEFAULT_MAX_INSTRUCTIONS: u64 = 200_000_000;
const DEFAULT_AUTO_SAVE_PATH: &str = "/tmp/trace";
const DEFAULT_POLL_DELAY: Duration = Duration::from_micros(1);
const DEFAULT_MAX_POLL_DELAY: Duration = Duration::from_millis(10);

/// Configuration applied by [`begin_trace()`](crate::begin_trace()).
///
/// The packet buffer cannot grow once tracing has started, so `buffer_capacity` should
/// be generous: running out of space aborts the process.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TraceConfig {
    /// Size in bytes of the packet arena.
    buffer_capacity: usize,

    /// Stack size of the tracer thread group.
    tracer_stack_size: usize,

    /// Number of traced instructions between published progress milestones.
    progress_interval: u64,

    /// Number of traced instructions after which the trace is flushed and stopped.
    max_instructions: u64,

    /// Where an automatically stopped trace is written.
    auto_save_path: PathBuf,

    /// Initial delay between polls of the tracer's wait loop.
    poll_delay: Duration,

    /// Upper bound on the wait loop's backoff, and so on cancellation latency.
    max_poll_delay: Duration,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            tracer_stack_size: DEFAULT_TRACER_STACK_SIZE,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            max_instructions: DEFAULT_MAX_INSTRUCTIONS,
            auto_save_path: PathBuf::from(DEFAULT_AUTO_SAVE_PATH),
            poll_delay: DEFAULT_POLL_DELAY,
            max_poll_delay: DEFAULT_MAX_POLL_DELAY,
        }
    }
}

impl TraceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn set_buffer_capacity(&mut self, capacity: usize) {
        self.buffer_capacity = capacity;
    }

    pub fn tracer_stack_size(&self) -> usize {
        self.tracer_stack_size
    }

    pub fn set_tracer_stack_size(&mut self, size: usize) {
        self.tracer_stack_size = size;
    }

    pub fn progress_interval(&self) -> u64 {
        self.progress_interval
    }

    /// Set the progress interval. Zero disables progress tracking.
    pub fn set_progress_interval(&mut self, interval: u64) {
        self.progress_interval = interval;
    }

    pub fn max_instructions(&self) -> u64 {
        self.max_instructions
    }

    /// Set the instruction budget. Zero disables the automatic stop.
    pub fn set_max_instructions(&mut self, max: u64) {
        self.max_instructions = max;
    }

    pub fn auto_save_path(&self) -> &Path {
        &self.auto_save_path
    }

    pub fn set_auto_save_path(&mut self, path: impl Into<PathBuf>) {
        self.auto_save_path = path.into();
    }

    pub fn poll_delay(&self) -> Duration {
        self.poll_delay
    }

    pub fn set_poll_delay(&mut self, poll_delay: Duration) {
        self.poll_delay = poll_delay;
    }

    pub fn max_poll_delay(&self) -> Duration {
        self.max_poll_delay
    }

    pub fn set_max_poll_delay(&mut self, max_poll_delay: Duration) {
        self.max_poll_delay = max_poll_delay;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_consistent() {
        let config = TraceConfig::default();

        assert_eq!(config.buffer_capacity(), 256 * 1024 * 1024);
        assert!(config.poll_delay() <= config.max_poll_delay());
        assert_eq!(config.auto_save_path(), Path::new("/tmp/trace"));
    }

    #[test]
    fn test_setters() {
        let mut config = TraceConfig::new();
        config.set_buffer_capacity(4096);
        config.set_max_instructions(0);
        config.set_auto_save_path("/tmp/other");

        assert_eq!(config.buffer_capacity(), 4096);
        assert_eq!(config.max_instructions(), 0);
        assert_eq!(config.auto_save_path(), Path::new("/tmp/other"));
    }
}
