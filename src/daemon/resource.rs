//! Resource limits and accounting for the daemon.
//!
//! - [`SessionLimiter`]: bounds concurrently admitted connections.
//! - [`ResourceMonitor`]: process memory for health and status responses.

use std::fs;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Admission control for sessions.
///
/// Each admitted connection holds a [`SessionPermit`]; dropping the permit
/// (on any exit path) frees the slot.
#[derive(Debug, Clone)]
pub struct SessionLimiter {
    permits: Arc<Semaphore>,
    max: usize,
    admitted: Arc<AtomicU64>,
}

/// Slot held by one admitted session.
#[derive(Debug)]
pub struct SessionPermit {
    _permit: OwnedSemaphorePermit,
}

impl SessionLimiter {
    pub fn new(max: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max)),
            max,
            admitted: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Take a slot without waiting; `None` when the daemon is full.
    pub fn try_admit(&self) -> Option<SessionPermit> {
        let permit = Arc::clone(&self.permits).try_acquire_owned().ok()?;
        self.admitted.fetch_add(1, Ordering::Relaxed);
        Some(SessionPermit { _permit: permit })
    }

    pub fn active(&self) -> usize {
        self.max - self.permits.available_permits()
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Sessions admitted since start.
    pub fn total_admitted(&self) -> u64 {
        self.admitted.load(Ordering::Relaxed)
    }
}

/// Resource monitor for tracking daemon resource usage.
#[derive(Debug, Default)]
pub struct ResourceMonitor;

impl ResourceMonitor {
    pub fn new() -> Self {
        Self
    }

    /// Get current process memory usage in bytes.
    ///
    /// Reads from /proc/self/statm on Linux. Returns 0 on error or non-Linux.
    pub fn memory_usage(&self) -> u64 {
        #[cfg(target_os = "linux")]
        {
            Self::linux_memory_usage()
        }
        #[cfg(not(target_os = "linux"))]
        {
            0
        }
    }

    #[cfg(target_os = "linux")]
    fn linux_memory_usage() -> u64 {
        // /proc/self/statm: size resident share text lib data dt (in pages)
        const PAGE_SIZE: u64 = 4096;

        match fs::read_to_string("/proc/self/statm") {
            Ok(content) => content
                .split_whitespace()
                .nth(1)
                .and_then(|rss| rss.parse::<u64>().ok())
                .map_or(0, |pages| pages * PAGE_SIZE),
            Err(e) => {
                debug!(error = %e, "Failed to read /proc/self/statm");
                0
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_admits_up_to_max() {
        let limiter = SessionLimiter::new(2);
        let a = limiter.try_admit().unwrap();
        let _b = limiter.try_admit().unwrap();
        assert!(limiter.try_admit().is_none());
        assert_eq!(limiter.active(), 2);

        drop(a);
        assert_eq!(limiter.active(), 1);
        assert!(limiter.try_admit().is_some());
        assert_eq!(limiter.total_admitted(), 3);
    }

    #[test]
    fn test_clones_share_slots() {
        let limiter = SessionLimiter::new(1);
        let other = limiter.clone();
        let _held = limiter.try_admit().unwrap();
        assert!(other.try_admit().is_none());
        assert_eq!(other.max(), 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_memory_usage_linux() {
        let monitor = ResourceMonitor::new();
        assert!(monitor.memory_usage() > 0);
    }
}
