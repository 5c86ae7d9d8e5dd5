//! In-process lock manager.
//!
//! Stands in for the engine's distributed lock manager when every
//! participant lives in one process: embedded deployments and the scenario
//! tests. Blocking notifications fire synchronously on the acquiring
//! thread, which matches the protocol's requirement that a handler only
//! release its own shared handle and never call back into the manager
//! beyond that.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use monsnap_error::{MonError, Result};
use monsnap_types::{AstCallback, LockHandle, LockManager, LockMode};
use parking_lot::Mutex;

struct Holder {
    handle: u64,
    mode: LockMode,
    ast: Option<AstCallback>,
}

/// Lock manager for a single-process deployment.
#[derive(Default)]
pub struct LocalLockManager {
    tables: Mutex<HashMap<String, Vec<Holder>>>,
    next_handle: AtomicU64,
}

impl LocalLockManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn new_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl LockManager for LocalLockManager {
    fn acquire(
        &self,
        name: &str,
        mode: LockMode,
        wait: bool,
        ast: Option<AstCallback>,
    ) -> Result<LockHandle> {
        match mode {
            LockMode::Shared => {
                let mut tables = self.tables.lock();
                let holders = tables.entry(name.to_owned()).or_default();
                if holders.iter().any(|h| h.mode == LockMode::Exclusive) {
                    // Exclusive grants are momentary in this protocol; a
                    // shared request should never meet one.
                    return Err(MonError::LockTimeout);
                }
                let handle = self.new_handle();
                holders.push(Holder { handle, mode, ast });
                Ok(LockHandle(handle))
            }
            LockMode::Exclusive => {
                // Collect the blocking notifications without holding the
                // table lock: handlers call back into release().
                let pending: Vec<AstCallback> = {
                    let mut tables = self.tables.lock();
                    let holders = tables.entry(name.to_owned()).or_default();
                    holders.iter().filter_map(|h| h.ast.clone()).collect()
                };
                for ast in pending {
                    ast();
                }

                let mut tables = self.tables.lock();
                let holders = tables.entry(name.to_owned()).or_default();
                if !holders.is_empty() {
                    // A holder ignored its notification; with wait semantics
                    // this surfaces as the engine's timeout error.
                    let _ = wait;
                    return Err(MonError::LockTimeout);
                }
                let handle = self.new_handle();
                holders.push(Holder { handle, mode, ast });
                Ok(LockHandle(handle))
            }
        }
    }

    fn release(&self, handle: LockHandle) {
        let mut tables = self.tables.lock();
        for holders in tables.values_mut() {
            holders.retain(|h| h.handle != handle.0);
        }
    }
}

impl std::fmt::Debug for LocalLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalLockManager").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn shared_then_exclusive_fires_notifications() {
        let manager = Arc::new(LocalLockManager::new());
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_cb = Arc::clone(&fired);
        let manager_cb = Arc::clone(&manager);
        let handle_cell = Arc::new(Mutex::new(None::<LockHandle>));
        let handle_for_cb = Arc::clone(&handle_cell);
        let ast: AstCallback = Arc::new(move || {
            fired_cb.fetch_add(1, Ordering::SeqCst);
            if let Some(handle) = handle_for_cb.lock().take() {
                manager_cb.release(handle);
            }
        });

        let shared = manager
            .acquire("mon", LockMode::Shared, true, Some(ast))
            .expect("shared grant");
        *handle_cell.lock() = Some(shared);

        let exclusive = manager
            .acquire("mon", LockMode::Exclusive, true, None)
            .expect("exclusive grant after notification");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        manager.release(exclusive);
    }

    #[test]
    fn exclusive_times_out_when_a_holder_stays() {
        let manager = LocalLockManager::new();
        let _stubborn = manager
            .acquire("mon", LockMode::Shared, true, None)
            .expect("shared grant");

        let err = manager
            .acquire("mon", LockMode::Exclusive, true, None)
            .expect_err("holder never releases");
        assert!(matches!(err, MonError::LockTimeout));
    }

    #[test]
    fn release_makes_room_for_exclusive() {
        let manager = LocalLockManager::new();
        let shared = manager
            .acquire("mon", LockMode::Shared, true, None)
            .expect("shared grant");
        manager.release(shared);

        let exclusive = manager
            .acquire("mon", LockMode::Exclusive, true, None)
            .expect("exclusive grant");
        manager.release(exclusive);
    }

    #[test]
    fn locks_are_per_name() {
        let manager = LocalLockManager::new();
        let _a = manager
            .acquire("mon_a", LockMode::Shared, true, None)
            .expect("grant a");
        let b = manager
            .acquire("mon_b", LockMode::Exclusive, true, None)
            .expect("independent name");
        manager.release(b);
    }
}
