use std::sync::Weak;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::RecallDb;

/// Host sizing for the server's runtime. Durability is never derived from
/// it; relaxing fsync is an explicit operator choice.
#[derive(Debug, Clone)]
pub struct SystemProfile {
    pub logical_cores: usize,
    pub worker_threads: usize,
    /// Engine calls block on embedding and disk I/O.
    pub blocking_threads: usize,
}

impl SystemProfile {
    pub fn detect() -> Self {
        let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);

        if cores <= 1 {
            warn!(cores, "single-core host, keeping the worker pool small");
            return Self {
                logical_cores: cores,
                worker_threads: 2,
                blocking_threads: 8,
            };
        }

        Self {
            logical_cores: cores,
            worker_threads: cores,
            blocking_threads: (cores * 4).clamp(8, 512),
        }
    }
}

/// Starts the background compaction thread.
///
/// Every `every`, collections holding superseded frames are rewritten. The
/// thread holds only a weak handle and exits once the engine is dropped.
pub fn start_compaction_thread(db: Weak<RecallDb>, every: Duration) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        info!(interval_secs = every.as_secs(), "background compaction started");
        loop {
            thread::sleep(every);
            let Some(db) = db.upgrade() else {
                debug!("engine dropped, compaction thread exiting");
                return;
            };
            match db.compact_garbage(1) {
                Ok(reports) => {
                    for report in reports {
                        debug!(
                            collection = %report.collection,
                            reclaimed = report.bytes_before.saturating_sub(report.bytes_after),
                            "compacted"
                        );
                    }
                }
                Err(e) => warn!(error = %e, "compaction failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::EngineConfig;
    use crate::embedding::HashEmbedder;
    use tempfile::TempDir;

    #[test]
    fn profile_is_sane() {
        let profile = SystemProfile::detect();
        assert!(profile.logical_cores >= 1);
        assert!(profile.worker_threads >= 1);
        assert!(profile.blocking_threads >= profile.worker_threads);
    }

    #[test]
    fn compaction_thread_exits_with_the_engine() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(
            RecallDb::open(EngineConfig::new(dir.path()), Arc::new(HashEmbedder::new(16))).unwrap(),
        );
        let handle = start_compaction_thread(Arc::downgrade(&db), Duration::from_millis(10));
        drop(db);
        handle.join().unwrap();
    }
}
