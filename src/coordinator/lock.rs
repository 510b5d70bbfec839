use crate::error::BatchError;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::error;

/// Token a batch holds when its policies read table-wide aggregates. It
/// conflicts with every other token.
pub(crate) const GLOBAL_GROUP_TOKEN: &str = "__global__";

#[derive(Default)]
struct LockState {
    held: HashSet<String>,
}

impl LockState {
    fn blocked(&self, wanted: &[String]) -> bool {
        if self.held.contains(GLOBAL_GROUP_TOKEN) {
            return true;
        }
        if wanted.iter().any(|t| t == GLOBAL_GROUP_TOKEN) {
            return !self.held.is_empty();
        }
        wanted.iter().any(|t| self.held.contains(t))
    }
}

/// Serializes batches whose grouping keys overlap, so no writer changes a
/// group between aggregation and the end of the batch that read it.
pub(crate) struct GroupLockManager {
    state: Mutex<LockState>,
    cv: Condvar,
    /// Set when a thread panicked while holding the state lock. After that
    /// every acquisition is refused.
    poisoned: AtomicBool,
}

impl Default for GroupLockManager {
    fn default() -> Self {
        Self {
            state: Mutex::new(LockState::default()),
            cv: Condvar::default(),
            poisoned: AtomicBool::new(false),
        }
    }
}

impl GroupLockManager {
    /// Acquires every token or none, waiting up to `timeout`.
    pub(crate) fn acquire_all(
        &self,
        tokens: &[String],
        timeout: Duration,
    ) -> Result<GroupLockGuard<'_>, BatchError> {
        if self.poisoned.load(Ordering::Acquire) {
            return Err(BatchError::Unavailable {
                message: "group lock poisoned".into(),
            });
        }

        if tokens.is_empty() {
            return Ok(GroupLockGuard {
                manager: self,
                held: Vec::new(),
            });
        }

        let mut wanted = tokens.to_vec();
        wanted.sort();
        wanted.dedup();

        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().map_err(|_| self.poison("acquire"))?;
        loop {
            if !state.blocked(&wanted) {
                for t in &wanted {
                    state.held.insert(t.clone());
                }
                return Ok(GroupLockGuard {
                    manager: self,
                    held: wanted,
                });
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(BatchError::LockTimeout);
            }
            let remaining = deadline.saturating_duration_since(now);
            let (new_state, wait_result) = self
                .cv
                .wait_timeout(state, remaining)
                .map_err(|_| self.poison("wait"))?;
            state = new_state;
            if wait_result.timed_out() && state.blocked(&wanted) {
                return Err(BatchError::LockTimeout);
            }
        }
    }

    fn poison(&self, during: &str) -> BatchError {
        self.poisoned.store(true, Ordering::Release);
        error!(during, "group lock poisoned, refusing further batches");
        BatchError::Unavailable {
            message: "group lock poisoned".into(),
        }
    }

    #[cfg(test)]
    pub(crate) fn held_count(&self) -> usize {
        self.state.lock().map(|s| s.held.len()).unwrap_or(0)
    }
}

pub(crate) struct GroupLockGuard<'a> {
    manager: &'a GroupLockManager,
    held: Vec<String>,
}

impl Drop for GroupLockGuard<'_> {
    fn drop(&mut self) {
        if self.held.is_empty() {
            return;
        }
        match self.manager.state.lock() {
            Ok(mut state) => {
                for t in &self.held {
                    state.held.remove(t);
                }
                drop(state);
                self.manager.cv.notify_all();
            }
            Err(_) => {
                self.manager.poisoned.store(true, Ordering::Release);
                error!("group lock poisoned during release");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{GLOBAL_GROUP_TOKEN, GroupLockManager};
    use crate::error::BatchErrorCode;
    use std::sync::Arc;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn tokens(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| (*n).to_string()).collect()
    }

    #[test]
    fn disjoint_groups_do_not_block() {
        let locks = GroupLockManager::default();
        let _a = locks
            .acquire_all(&tokens(&["10"]), Duration::from_millis(10))
            .expect("a");
        let _b = locks
            .acquire_all(&tokens(&["20"]), Duration::from_millis(10))
            .expect("b");
        assert_eq!(locks.held_count(), 2);
    }

    #[test]
    fn overlapping_groups_time_out() {
        let locks = GroupLockManager::default();
        let _a = locks
            .acquire_all(&tokens(&["10", "20"]), Duration::from_millis(10))
            .expect("a");
        let err = locks
            .acquire_all(&tokens(&["20"]), Duration::from_millis(20))
            .err()
            .expect("overlap must wait");
        assert_eq!(err.code(), BatchErrorCode::LockTimeout);
    }

    #[test]
    fn global_token_conflicts_with_everything() {
        let locks = GroupLockManager::default();
        let guard = locks
            .acquire_all(&tokens(&["10"]), Duration::from_millis(10))
            .expect("group");
        assert!(
            locks
                .acquire_all(&tokens(&[GLOBAL_GROUP_TOKEN]), Duration::from_millis(10))
                .is_err()
        );
        drop(guard);
        let _global = locks
            .acquire_all(&tokens(&[GLOBAL_GROUP_TOKEN]), Duration::from_millis(10))
            .expect("global");
        assert!(
            locks
                .acquire_all(&tokens(&["30"]), Duration::from_millis(10))
                .is_err()
        );
    }

    #[test]
    fn release_wakes_waiter() {
        let locks = Arc::new(GroupLockManager::default());
        let guard = locks
            .acquire_all(&tokens(&["10"]), Duration::from_millis(10))
            .expect("first");
        let (tx, rx) = mpsc::channel();
        let waiter = {
            let locks = Arc::clone(&locks);
            thread::spawn(move || {
                let acquired = locks
                    .acquire_all(&tokens(&["10"]), Duration::from_secs(5))
                    .is_ok();
                tx.send(acquired).expect("send");
            })
        };
        thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(rx.recv_timeout(Duration::from_secs(5)).expect("recv"));
        waiter.join().expect("join");
        assert_eq!(locks.held_count(), 0);
    }
}
