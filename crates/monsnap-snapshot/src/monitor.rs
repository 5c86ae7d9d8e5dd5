//! Cross-process monitor-lock coordination.
//!
//! Every process attached to a database holds the per-database monitor lock
//! in shared mode with a blocking-notification callback registered. A
//! snapshot round acquires the same lock exclusively (and releases it right
//! away); the lock manager fires the callbacks on all shared holders, each
//! of which publishes a fresh contribution, releases its shared lock and
//! goes "off" until it next publishes.
//!
//! Per-holder state machine:
//!
//! ```text
//! Shared-held -(callback)-> Refreshing -(publish+release)-> Off
//!     ^                                                      |
//!     +---------------- next publish or check ---------------+
//! ```

use std::path::Path;
use std::sync::Arc;

use monsnap_error::Result;
use monsnap_shmem::MonitoringStore;
use monsnap_types::{AstCallback, LockHandle, LockManager, LockMode, ProcessOracle};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::collector::dump_data;
use crate::engine::EngineProcess;

/// Monitor-lock state of this process, protected by the per-database
/// monitor latch.
#[derive(Debug, Default)]
struct MonitorLockState {
    /// Handle of the shared monitor lock, when held.
    shared: Option<LockHandle>,
    /// Set after the shared lock has been released (by the callback or by a
    /// snapshot round); cleared when a fresh shared lock is acquired.
    monitor_off: bool,
}

/// Per-process, per-database monitoring coordinator.
///
/// Owns this process's store handle and its monitor-lock registration, and
/// runs both sides of the protocol: the blocking-notification publish path
/// and the exclusive snapshot round.
pub struct ProcessMonitor {
    process: Arc<EngineProcess>,
    store: Mutex<MonitoringStore>,
    lock_manager: Arc<dyn LockManager>,
    oracle: Arc<dyn ProcessOracle>,
    lock_name: String,
    /// The per-database monitor latch.
    state: Mutex<MonitorLockState>,
}

impl ProcessMonitor {
    /// Attach this process to the database's monitoring region and register
    /// for snapshot rounds.
    ///
    /// `db_file_id` is the database's stable unique file identifier; it
    /// derives both the region file name and the monitor lock name.
    pub fn start(
        process: Arc<EngineProcess>,
        region_dir: &Path,
        db_file_id: &str,
        lock_manager: Arc<dyn LockManager>,
        oracle: Arc<dyn ProcessOracle>,
    ) -> Result<Arc<Self>> {
        let region_path = region_dir.join(monsnap_shmem::monitor_file_name(db_file_id));
        let store = MonitoringStore::attach(&region_path, process.process_id, process.local_id)?;

        let monitor = Arc::new(Self {
            process,
            store: Mutex::new(store),
            lock_manager,
            oracle,
            lock_name: format!("monitor_{db_file_id}"),
            state: Mutex::new(MonitorLockState::default()),
        });
        monitor.ensure_shared_lock()?;
        Ok(monitor)
    }

    /// The engine view this monitor publishes.
    #[must_use]
    pub fn process(&self) -> &Arc<EngineProcess> {
        &self.process
    }

    /// Acquire a fresh shared monitor lock if none is held.
    ///
    /// Called at registration and again before every publish, which is how
    /// a holder leaves the "off" state.
    fn ensure_shared_lock(self: &Arc<Self>) -> Result<()> {
        let mut state = self.state.lock();
        if state.shared.is_some() {
            return Ok(());
        }

        let weak = Arc::downgrade(self);
        let ast: AstCallback = Arc::new(move || {
            if let Some(monitor) = weak.upgrade() {
                monitor.blocking_ast();
            }
        });
        let handle = self
            .lock_manager
            .acquire(&self.lock_name, LockMode::Shared, true, Some(ast))?;
        state.shared = Some(handle);
        state.monitor_off = false;
        Ok(())
    }

    /// Blocking-notification handler: publish fresh data, release the shared
    /// lock, go off.
    ///
    /// Runs on a lock-manager thread. Must stay short, be idempotent under
    /// the `monitor_off` flag, and absorb every error; one bad peer must not
    /// stall the exclusive waiter.
    fn blocking_ast(&self) {
        if self.state.lock().monitor_off {
            return;
        }

        let mut state = self.state.lock();
        // Double-checked under the latch: a concurrent round may already
        // have served this notification.
        if state.monitor_off {
            return;
        }

        debug!(lock = %self.lock_name, "monitor callback: publishing fresh data");
        let published = {
            let mut store = self.store.lock();
            dump_data(&self.process, &mut store)
        };
        if let Err(e) = published {
            error!("cannot dump the monitoring data: {e}");
        }

        if let Some(handle) = state.shared.take() {
            self.lock_manager.release(handle);
        }
        state.monitor_off = true;
    }

    /// Publish this process's contribution outside a snapshot round,
    /// re-acquiring the shared lock first when off.
    pub fn publish(self: &Arc<Self>) -> Result<()> {
        self.ensure_shared_lock()?;
        let _latch = self.state.lock();
        let mut store = self.store.lock();
        dump_data(&self.process, &mut store)
    }

    /// Run one snapshot round and return the raw assembled dump.
    ///
    /// In order: publish our own fresh contribution (releasing our shared
    /// lock first, so we will take the notification path in later rounds),
    /// force every peer to publish by cycling the lock exclusively, then
    /// read the compacted store.
    pub fn snapshot_round(self: &Arc<Self>) -> Result<Vec<u8>> {
        {
            let mut state = self.state.lock();
            if let Some(handle) = state.shared.take() {
                self.lock_manager.release(handle);
            }
            state.monitor_off = false;

            let mut store = self.store.lock();
            dump_data(&self.process, &mut store)?;
        }

        // Signal the peers and wait until each has had its publish window.
        let handle =
            self.lock_manager
                .acquire(&self.lock_name, LockMode::Exclusive, true, None)?;
        self.lock_manager.release(handle);

        // Off until the next publish re-registers us.
        self.state.lock().monitor_off = true;

        let mut store = self.store.lock();
        let mut guard = store.acquire()?;
        guard.read(self.oracle.as_ref())
    }
}

impl std::fmt::Debug for ProcessMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessMonitor")
            .field("lock_name", &self.lock_name)
            .field("process_id", &self.process.process_id)
            .finish()
    }
}
