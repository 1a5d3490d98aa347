use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::{Result, ResultsError};
use crate::scope::Scope;

/// In-process registry of scopes with an in-flight compute or publish.
#[derive(Debug, Clone, Default)]
pub struct ScopeLocks {
    held: Arc<Mutex<HashSet<String>>>,
}

impl ScopeLocks {
    pub fn acquire(&self, scope: &Scope) -> Result<ScopeGuard> {
        let key = scope.key();
        let mut held = self.held.lock().unwrap_or_else(|p| p.into_inner());
        if !held.insert(key.clone()) {
            return Err(ResultsError::Concurrency(scope.to_string()));
        }
        Ok(ScopeGuard {
            held: Arc::clone(&self.held),
            key,
        })
    }

    #[cfg(test)]
    pub fn is_locked(&self, scope: &Scope) -> bool {
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&scope.key())
    }
}

/// Releases the scope when dropped.
#[derive(Debug)]
pub struct ScopeGuard {
    held: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        self.held
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.key);
    }
}

/// Cooperative cancellation, checked between per-student iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(ResultsError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_on_same_scope_is_a_concurrency_error() {
        let locks = ScopeLocks::default();
        let scope = Scope::new("JSS1A", "First Term", "2024/2025");
        let guard = locks.acquire(&scope).expect("first acquire");
        assert!(matches!(
            locks.acquire(&scope),
            Err(ResultsError::Concurrency(_))
        ));

        // Other scopes are independent.
        let other = Scope::new("JSS1B", "First Term", "2024/2025");
        let _other_guard = locks.acquire(&other).expect("other scope");

        drop(guard);
        assert!(!locks.is_locked(&scope));
        locks.acquire(&scope).expect("re-acquire after release");
    }

    #[test]
    fn cancel_flag_is_shared_between_clones() {
        let flag = CancelFlag::default();
        let clone = flag.clone();
        assert!(flag.check().is_ok());
        clone.cancel();
        assert!(matches!(flag.check(), Err(ResultsError::Cancelled)));
    }
}
