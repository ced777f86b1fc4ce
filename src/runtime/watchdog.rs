//! Partition progress watchdog for detecting stalled graphs
//!
//! Low-overhead monitoring using atomic timestamps instead of locks. Each
//! partition thread stamps its last productive pass into an atomic
//! variable, and the watchdog periodically scans these timestamps to
//! detect partitions that have stopped making progress (e.g., blocked
//! forever on a slow or wedged upstream).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{info, warn};

/// Timestamp in milliseconds since UNIX_EPOCH
#[inline(always)]
fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Shared state for a single partition's progress tracking
struct PartitionState {
    /// Timestamp (ms since epoch) of the last productive pass
    last_progress: AtomicU64,
    /// Track if we've already warned about this partition stalling
    has_warned: AtomicBool,
    name: String,
}

/// Handle to a partition's watchdog state (held by the partition thread)
#[derive(Clone)]
pub struct WatchdogHandle {
    state: Arc<PartitionState>,
}

impl WatchdogHandle {
    /// Record that the partition just made progress
    #[inline(always)]
    pub fn mark_progress(&self) {
        if self.state.has_warned.swap(false, Ordering::Relaxed) {
            info!("[{}] partition recovered, making progress again", self.state.name);
        }
        self.state
            .last_progress
            .store(now_millis(), Ordering::Relaxed);
    }
}

/// Shared watchdog state
#[derive(Clone)]
pub struct Watchdog {
    partitions: Arc<Mutex<Vec<Weak<PartitionState>>>>,
    enabled: Arc<Mutex<bool>>,
}

impl Watchdog {
    pub fn new() -> Self {
        Self {
            partitions: Arc::new(Mutex::new(Vec::new())),
            enabled: Arc::new(Mutex::new(true)),
        }
    }

    /// Register a new partition for monitoring
    pub fn register_partition(&self, name: &str) -> WatchdogHandle {
        let state = Arc::new(PartitionState {
            last_progress: AtomicU64::new(now_millis()),
            has_warned: AtomicBool::new(false),
            name: name.to_string(),
        });
        self.partitions.lock().unwrap().push(Arc::downgrade(&state));
        WatchdogHandle { state }
    }

    /// Check for partitions with no progress for more than 5 seconds
    pub fn check_for_stalled(&self) {
        let now = now_millis();
        let threshold_ms = 5000;

        let mut partitions = self.partitions.lock().unwrap();

        // Remove dead weak references and check live ones
        partitions.retain(|weak| {
            if let Some(state) = weak.upgrade() {
                let last = state.last_progress.load(Ordering::Relaxed);
                let stalled_ms = now.saturating_sub(last);
                if stalled_ms > threshold_ms
                    && !state.has_warned.swap(true, Ordering::Relaxed)
                {
                    warn!(
                        "[{}] partition stalled: no progress for {:.1}s",
                        state.name,
                        stalled_ms as f64 / 1000.0
                    );
                }
                true
            } else {
                false
            }
        });
    }

    /// Start the watchdog monitoring thread
    pub fn start_monitoring_thread(&self) -> std::thread::JoinHandle<()> {
        let watchdog = self.clone();
        std::thread::spawn(move || {
            loop {
                std::thread::sleep(Duration::from_secs(1));

                if !*watchdog.enabled.lock().unwrap() {
                    break;
                }

                watchdog.check_for_stalled();
            }
        })
    }

    /// Stop the watchdog monitoring thread
    pub fn stop(&self) {
        *self.enabled.lock().unwrap() = false;
    }
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_partition_is_not_stalled() {
        let wd = Watchdog::new();
        let handle = wd.register_partition("p0");
        handle.mark_progress();
        // Must not panic or warn; the scan just observes the fresh stamp.
        wd.check_for_stalled();
    }

    #[test]
    fn test_dropped_handles_are_cleaned_up() {
        let wd = Watchdog::new();
        {
            let _handle = wd.register_partition("transient");
        }
        wd.check_for_stalled();
        assert!(wd.partitions.lock().unwrap().is_empty());
    }
}
