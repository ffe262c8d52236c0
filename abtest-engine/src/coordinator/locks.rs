//! Per-experiment mutual exclusion.
//!
//! Every read-modify-write of an experiment aggregate runs under the lock
//! for its id, so a save never overwrites a concurrent one. Different
//! experiments lock independently.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::errors::{EngineError, EngineResult};

#[derive(Default)]
pub struct ExperimentLocks {
    table: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ExperimentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, experiment_id: &str) -> EngineResult<Arc<Mutex<()>>> {
        let mut table = self
            .table
            .lock()
            .map_err(|_| EngineError::internal_mutex_poisoned("experiment lock table"))?;
        Ok(Arc::clone(
            table
                .entry(experiment_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        ))
    }

    /// Run `f` while holding the lock for `experiment_id`.
    ///
    /// Not reentrant: `f` must not lock the same experiment again.
    pub fn with_lock<T>(
        &self,
        experiment_id: &str,
        f: impl FnOnce() -> EngineResult<T>,
    ) -> EngineResult<T> {
        let lock = self.entry(experiment_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| EngineError::internal_mutex_poisoned("experiment lock"))?;
        f()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn test_same_experiment_is_serialized() {
        let locks = Arc::new(ExperimentLocks::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let (locks, inside, max_seen) =
                    (Arc::clone(&locks), Arc::clone(&inside), Arc::clone(&max_seen));
                std::thread::spawn(move || {
                    locks
                        .with_lock("exp-1", || {
                            let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                            max_seen.fetch_max(now, Ordering::SeqCst);
                            std::thread::sleep(Duration::from_millis(10));
                            inside.fetch_sub(1, Ordering::SeqCst);
                            Ok(())
                        })
                        .unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_different_experiments_do_not_block() {
        let locks = ExperimentLocks::new();
        let nested = locks.with_lock("exp-1", || locks.with_lock("exp-2", || Ok(7)));
        assert_eq!(nested.unwrap(), 7);
    }
}
