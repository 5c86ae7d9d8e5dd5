//! Append-only, garbage-collected store of per-process monitoring
//! contributions.
//!
//! Layout after the region header:
//!
//! ```text
//! [ Element { process_id: u32, local_id: u32, length: u32 } | payload | pad ]*
//! ```
//!
//! `length` is the unaligned payload byte count; every element occupies
//! `align8(ELEMENT_SIZE + length)` bytes so that offsets stay naturally
//! aligned. The region mutex brackets every read and write; it is the sole
//! synchronization between peer processes.

use std::path::Path;

use monsnap_error::{MonError, Result};
use monsnap_types::ProcessOracle;
use tracing::{debug, warn};

use crate::region::{RegionGuard, SharedRegion, DEFAULT_SIZE, HEADER_SIZE};
use crate::align8;

/// Element header size in bytes: process_id(4) + local_id(4) + length(4).
pub const ELEMENT_SIZE: u32 = 12;

const ELEM_OFF_PROCESS_ID: u32 = 0;
const ELEM_OFF_LOCAL_ID: u32 = 4;
const ELEM_OFF_LENGTH: u32 = 8;

/// Per-process handle to the monitoring store of one database.
///
/// Keyed by `(process_id, local_id)`, where `local_id` disambiguates
/// multiple attachments of the same process to the same database file. The
/// owning process alone rewrites and removes its own contribution; any
/// process may reclaim contributions of dead peers during [`StoreGuard::read`].
pub struct MonitoringStore {
    region: SharedRegion,
    process_id: u32,
    local_id: u32,
}

impl std::fmt::Debug for MonitoringStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitoringStore")
            .field("region", &self.region)
            .field("process_id", &self.process_id)
            .field("local_id", &self.local_id)
            .finish()
    }
}

impl MonitoringStore {
    /// Attach to (or create) the store backing `path`.
    pub fn attach(path: &Path, process_id: u32, local_id: u32) -> Result<Self> {
        let region = SharedRegion::map(path, DEFAULT_SIZE)?;
        Ok(Self {
            region,
            process_id,
            local_id,
        })
    }

    /// The contributing process id this handle writes under.
    #[must_use]
    pub const fn process_id(&self) -> u32 {
        self.process_id
    }

    /// The process-local attachment discriminator.
    #[must_use]
    pub const fn local_id(&self) -> u32 {
        self.local_id
    }

    /// Lock the region mutex and return an operations guard.
    ///
    /// If a peer grew the region since this handle last looked, the header's
    /// `allocated` exceeds our mapping and we re-map before touching any
    /// element.
    pub fn acquire(&mut self) -> Result<StoreGuard<'_>> {
        let process_id = self.process_id;
        let local_id = self.local_id;
        let mut inner = self.region.lock();
        let allocated = inner.region().allocated();
        if allocated > inner.region().mapped_len() {
            inner
                .region()
                .remap(allocated, false)
                .map_err(|_| MonError::RegionExhausted)?;
        }
        Ok(StoreGuard {
            inner,
            process_id,
            local_id,
        })
    }
}

impl Drop for MonitoringStore {
    /// Teardown of the last contributing attachment of this process: drop
    /// our own contribution and unlink the region file once nothing but the
    /// header remains.
    fn drop(&mut self) {
        let header_only = align8(HEADER_SIZE);
        let remove = {
            let mut guard = self.region.lock();
            cleanup_elements(guard.region(), self.process_id, self.local_id);
            guard.region().used() == header_only
        };
        if remove {
            if let Err(e) = self.region.remove() {
                warn!("cannot remove the monitoring region file: {e}");
            }
        }
    }
}

/// Region-mutex-scoped operations over the store.
///
/// Every operation below runs with the cross-process mutex held; dropping
/// the guard releases it.
pub struct StoreGuard<'a> {
    inner: RegionGuard<'a>,
    process_id: u32,
    local_id: u32,
}

impl StoreGuard<'_> {
    /// Append an empty element tagged with this process's identity and
    /// return its offset.
    pub fn setup(&mut self) -> Result<u32> {
        self.ensure_space(ELEMENT_SIZE)?;

        let region = self.inner.region();
        let offset = region.used();
        write_elem_u32(region, offset, ELEM_OFF_PROCESS_ID, self.process_id);
        write_elem_u32(region, offset, ELEM_OFF_LOCAL_ID, self.local_id);
        write_elem_u32(region, offset, ELEM_OFF_LENGTH, 0);
        region.set_used(offset + align8(ELEMENT_SIZE));
        Ok(offset)
    }

    /// Append `bytes` to the payload of the element at `offset`.
    ///
    /// The element must be the tail element, which it is: the caller
    /// appended it with [`StoreGuard::setup`] under this same guard and
    /// nobody else can append while the mutex is held.
    pub fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<()> {
        let added = u32::try_from(bytes.len()).map_err(|_| MonError::RegionExhausted)?;
        self.ensure_space(added)?;

        let region = self.inner.region();
        let length = read_elem_u32(region, offset, ELEM_OFF_LENGTH);
        let data_at = (offset + ELEMENT_SIZE + length) as usize;
        region.bytes_mut()[data_at..data_at + bytes.len()].copy_from_slice(bytes);

        let previous = align8(ELEMENT_SIZE + length);
        let current = align8(ELEMENT_SIZE + length + added);
        write_elem_u32(region, offset, ELEM_OFF_LENGTH, length + added);
        let used = region.used();
        region.set_used(used + (current - previous));
        Ok(())
    }

    /// Remove every element tagged with this process's identity, closing
    /// the gaps.
    pub fn cleanup(&mut self) {
        cleanup_elements(self.inner.region(), self.process_id, self.local_id);
    }

    /// Two-pass compaction-with-liveness read.
    ///
    /// Pass 1 reclaims elements of dead processes in place and totals the
    /// surviving payload bytes, remembering where our own element sits.
    /// Pass 2 copies our own payload first, then every other survivor in
    /// store order.
    ///
    /// The own-element offset stays valid across pass 1 because dead
    /// elements removed before it shift it down before it is recorded, and
    /// removals after it leave it untouched.
    pub fn read(&mut self, oracle: &dyn ProcessOracle) -> Result<Vec<u8>> {
        let process_id = self.process_id;
        let local_id = self.local_id;
        let region = self.inner.region();

        // Pass 1: garbage collect and size the result.
        let mut self_offset: Option<u32> = None;
        let mut result_size = 0_usize;
        let mut offset = align8(HEADER_SIZE);
        while offset < region.used() {
            let pid = read_elem_u32(region, offset, ELEM_OFF_PROCESS_ID);
            let lid = read_elem_u32(region, offset, ELEM_OFF_LOCAL_ID);
            let length = read_elem_u32(region, offset, ELEM_OFF_LENGTH);
            let total = align8(ELEMENT_SIZE + length);

            if pid == process_id && lid == local_id {
                self_offset = Some(offset);
            }

            if oracle.is_process_alive(pid) {
                result_size += length as usize;
                offset += total;
            } else {
                debug!(pid, "reclaiming monitoring data of dead process");
                remove_element(region, offset, total);
            }
        }

        let self_offset = self_offset.ok_or(MonError::MissingSelf)?;

        // Pass 2: own payload first, then the peers in store order.
        let mut buffer = Vec::with_capacity(result_size);
        copy_payload(region, self_offset, &mut buffer);

        let mut offset = align8(HEADER_SIZE);
        while offset < region.used() {
            let length = read_elem_u32(region, offset, ELEM_OFF_LENGTH);
            if offset != self_offset {
                copy_payload(region, offset, &mut buffer);
            }
            offset += align8(ELEMENT_SIZE + length);
        }

        debug_assert_eq!(buffer.len(), result_size);
        Ok(buffer)
    }

    /// Grow the region so that `length` more bytes fit after `used`.
    ///
    /// The new size is rounded up to the growth quantum; failure to grow
    /// surfaces as "monitor table exhausted".
    pub fn ensure_space(&mut self, length: u32) -> Result<()> {
        let region = self.inner.region();
        let needed = region
            .used()
            .checked_add(length)
            .ok_or(MonError::RegionExhausted)?;
        if needed <= region.allocated() {
            return Ok(());
        }

        let new_size = needed
            .checked_next_multiple_of(DEFAULT_SIZE)
            .ok_or(MonError::RegionExhausted)?;
        region
            .remap(new_size, true)
            .map_err(|_| MonError::RegionExhausted)?;
        let mapped = region.mapped_len();
        region.set_allocated(mapped);
        Ok(())
    }

    /// Bytes occupied in the region, header included.
    #[must_use]
    pub fn used(&mut self) -> u32 {
        self.inner.region().used()
    }

    /// Current mapping size as recorded in the header.
    #[must_use]
    pub fn allocated(&mut self) -> u32 {
        self.inner.region().allocated()
    }
}

fn read_elem_u32(region: &SharedRegion, elem_offset: u32, field_offset: u32) -> u32 {
    region.read_u32((elem_offset + field_offset) as usize)
}

fn write_elem_u32(region: &mut SharedRegion, elem_offset: u32, field_offset: u32, value: u32) {
    region.write_u32((elem_offset + field_offset) as usize, value);
}

fn copy_payload(region: &SharedRegion, elem_offset: u32, out: &mut Vec<u8>) {
    let length = read_elem_u32(region, elem_offset, ELEM_OFF_LENGTH) as usize;
    let data_at = (elem_offset + ELEMENT_SIZE) as usize;
    out.extend_from_slice(&region.bytes()[data_at..data_at + length]);
}

/// Close the gap left by the element at `offset` (`total` aligned bytes) by
/// moving the tail left and shrinking `used`.
fn remove_element(region: &mut SharedRegion, offset: u32, total: u32) {
    let used = region.used();
    debug_assert!(used >= offset + total);
    region
        .bytes_mut()
        .copy_within(((offset + total) as usize)..(used as usize), offset as usize);
    region.set_used(used - total);
}

fn cleanup_elements(region: &mut SharedRegion, process_id: u32, local_id: u32) {
    let mut offset = align8(HEADER_SIZE);
    while offset < region.used() {
        let pid = read_elem_u32(region, offset, ELEM_OFF_PROCESS_ID);
        let lid = read_elem_u32(region, offset, ELEM_OFF_LOCAL_ID);
        let length = read_elem_u32(region, offset, ELEM_OFF_LENGTH);
        let total = align8(ELEMENT_SIZE + length);

        if pid == process_id && lid == local_id {
            remove_element(region, offset, total);
        } else {
            offset += total;
        }
    }
}

/// Liveness oracle backed by `kill(pid, 0)`.
///
/// `EPERM` still means the process exists; only `ESRCH` (or an out-of-range
/// pid) reports death.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostProcessOracle;

impl ProcessOracle for HostProcessOracle {
    fn is_process_alive(&self, pid: u32) -> bool {
        let Ok(pid) = i32::try_from(pid) else {
            return false;
        };
        match nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None) {
            Ok(()) => true,
            Err(nix::errno::Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}
