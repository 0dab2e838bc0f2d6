use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{info, warn};

use crate::storage::{Backend, Compact};
use crate::Ledger;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemProfile {
    pub logical_cores: usize,
    pub worker_threads: usize,
    pub strict_durability: bool, // true = fsync every frame, false = OS buffer (faster)
    pub compaction_interval: Duration,
}

impl SystemProfile {
    pub fn detect() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::for_cores(cores)
    }

    pub fn for_cores(cores: usize) -> Self {
        // Single core: keep one thread free for blocking I/O and skip fsync
        if cores <= 1 {
            warn!(cores, "constrained host, durability relaxed to OS buffering");
            Self {
                logical_cores: cores,
                worker_threads: 2,
                strict_durability: false,
                compaction_interval: Duration::from_secs(1800),
            }
        } else if cores < 6 {
            Self {
                logical_cores: cores,
                worker_threads: cores,
                strict_durability: true,
                compaction_interval: Duration::from_secs(600),
            }
        } else {
            Self {
                logical_cores: cores,
                worker_threads: cores,
                strict_durability: true,
                compaction_interval: Duration::from_secs(300),
            }
        }
    }
}

/// Compacts the ledger's backend every `interval` until the process exits.
pub fn start_compaction_thread<B>(ledger: Arc<Ledger<B>>, interval: Duration) -> thread::JoinHandle<()>
where
    B: Backend + Compact + Send + 'static,
{
    thread::spawn(move || {
        info!(interval_secs = interval.as_secs(), "background compaction started");
        loop {
            thread::sleep(interval);
            match ledger.compact() {
                Ok(stats) => info!(
                    live = stats.live_entries,
                    reclaimed = stats.bytes_before.saturating_sub(stats.bytes_after),
                    "background compaction finished"
                ),
                Err(e) => warn!(error = %e, "background compaction failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles_by_core_count() {
        let potato = SystemProfile::for_cores(1);
        assert_eq!(potato.worker_threads, 2);
        assert!(!potato.strict_durability);

        let laptop = SystemProfile::for_cores(4);
        assert_eq!(laptop.worker_threads, 4);
        assert!(laptop.strict_durability);

        let server = SystemProfile::for_cores(32);
        assert_eq!(server.worker_threads, 32);
        assert!(server.compaction_interval < laptop.compaction_interval);
    }

    #[test]
    fn test_detect_is_consistent() {
        let profile = SystemProfile::detect();
        assert!(profile.logical_cores >= 1);
        assert!(profile.worker_threads >= 1);
    }
}
