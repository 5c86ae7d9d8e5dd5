//! Memory-mapped shared region with a typed header and an embedded
//! cross-process mutex.
//!
//! Region layout (native byte order; all participants share an architecture):
//!
//! ```text
//! Offset  Size  Field
//!   0       4   region_type   (REGION_TYPE_TAG)
//!   4       4   layout_version (MONITOR_VERSION, strictly checked)
//!   8       4   used          (bytes occupied including header, aligned)
//!  12       4   allocated     (current mapping size)
//!  16       8   mutex         (reserved; locked via fcntl on this range)
//! ```
//!
//! The embedded mutex is a blocking POSIX `fcntl` write lock over the
//! header's mutex bytes. The kernel releases fcntl locks when their holder
//! dies, so a crashed process can never wedge its peers.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use monsnap_error::{MonError, Result};
use tracing::{debug, error};

/// Region-type tag stamped into the header ("MONS").
pub const REGION_TYPE_TAG: u32 = 0x4D4F_4E53;

/// Layout version of the shared region. A mismatch on attach is fatal for
/// the subsystem; no in-place migration is attempted.
pub const MONITOR_VERSION: u32 = 4;

/// Header size in bytes.
pub const HEADER_SIZE: u32 = 24;

/// Growth quantum: the mapping size is always a multiple of this.
pub const DEFAULT_SIZE: u32 = 8192;

/// Natural alignment of element offsets within the region.
pub const ALIGNMENT: u32 = 8;

const HDR_OFF_TYPE: usize = 0;
const HDR_OFF_VERSION: usize = 4;
const HDR_OFF_USED: usize = 8;
const HDR_OFF_ALLOCATED: usize = 12;
const MUTEX_OFFSET: u64 = 16;
const MUTEX_BYTES: u64 = 8;

/// Render the region file name for a database, from its stable unique file
/// identifier.
#[must_use]
pub fn monitor_file_name(db_file_id: &str) -> String {
    format!("monitor_{db_file_id}.mem")
}

/// Acquire or release the fcntl range lock backing the region mutex.
///
/// `F_SETLKW` blocks until granted; `EINTR` is retried. Any other failure is
/// unrecoverable for shared state: it is logged and the process terminates,
/// matching the subsystem's mutex-corruption policy.
fn region_mutex_op(file: &File, lock_type: i32, op: &'static str) {
    #[allow(clippy::cast_possible_wrap)]
    let flock = libc::flock {
        l_type: i16::try_from(lock_type).expect("fcntl lock type must fit in i16"),
        l_whence: i16::try_from(libc::SEEK_SET).expect("SEEK_SET must fit in i16"),
        l_start: MUTEX_OFFSET as libc::off_t,
        l_len: MUTEX_BYTES as libc::off_t,
        l_pid: 0,
    };

    loop {
        match nix::fcntl::fcntl(
            file.as_fd().as_raw_fd(),
            nix::fcntl::FcntlArg::F_SETLKW(&flock),
        ) {
            Ok(_) => return,
            Err(nix::errno::Errno::EINTR) => {}
            Err(e) => {
                let err = MonError::MutexCorruption { op, errno: e as i32 };
                error!("{err}");
                std::process::exit(3);
            }
        }
    }
}

/// A handle to the per-database shared memory region.
///
/// Each process maps the region file independently; the header's `allocated`
/// field is the authoritative mapping size, and a handle whose mapping is
/// shorter must [`SharedRegion::remap`] before touching element data.
pub struct SharedRegion {
    path: PathBuf,
    file: File,
    map: MmapMut,
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("path", &self.path)
            .field("mapped_len", &self.map.len())
            .finish()
    }
}

impl SharedRegion {
    /// Create or attach the region file at `path`.
    ///
    /// The first creator (observed as a zero-length file, decided under the
    /// region mutex) runs the initializer exactly once: it stamps the type
    /// tag and layout version and zeroes the usage accounting. Subsequent
    /// openers strictly validate both.
    pub fn map(path: &Path, initial_size: u32) -> Result<Self> {
        debug_assert!(initial_size >= HEADER_SIZE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| MonError::map_failure(path, e.to_string()))?;

        // Hold the mutex across the create-or-validate decision so only one
        // process ever observes the zero-length file.
        region_mutex_op(&file, libc::F_WRLCK, "init lock");
        let result = Self::map_locked(path, file, initial_size);
        if let Ok(region) = &result {
            region_mutex_op(&region.file, libc::F_UNLCK, "init unlock");
        }
        // On error the file handle is already closed, which releases the
        // fcntl lock with it.
        result
    }

    fn map_locked(path: &Path, file: File, initial_size: u32) -> Result<Self> {
        let file_len = file
            .metadata()
            .map_err(|e| MonError::map_failure(path, e.to_string()))?
            .len();

        let fresh = file_len == 0;
        let map_len = if fresh {
            file.set_len(u64::from(initial_size))
                .map_err(|e| MonError::map_failure(path, e.to_string()))?;
            initial_size
        } else {
            u32::try_from(file_len).map_err(|_| MonError::map_failure(path, "region too large"))?
        };

        let map = unsafe { MmapMut::map_mut(&file) }
            .map_err(|e| MonError::map_failure(path, e.to_string()))?;

        let mut region = Self {
            path: path.to_path_buf(),
            file,
            map,
        };

        if fresh {
            region.write_u32(HDR_OFF_TYPE, REGION_TYPE_TAG);
            region.write_u32(HDR_OFF_VERSION, MONITOR_VERSION);
            region.write_u32(HDR_OFF_USED, crate::align8(HEADER_SIZE));
            region.write_u32(HDR_OFF_ALLOCATED, map_len);
            debug!(path = %region.path.display(), size = map_len, "monitoring region created");
        } else {
            let tag = region.read_u32(HDR_OFF_TYPE);
            if tag != REGION_TYPE_TAG {
                return Err(MonError::BadRegionType { tag });
            }
            let version = region.read_u32(HDR_OFF_VERSION);
            if version != MONITOR_VERSION {
                return Err(MonError::VersionMismatch {
                    found: version,
                    expected: MONITOR_VERSION,
                });
            }
        }

        Ok(region)
    }

    /// Grow (or re-attach) the mapping to `new_size` bytes.
    ///
    /// With `preserve`, existing contents survive; the backing is a shared
    /// file, so this holds for both the growing process and followers that
    /// re-map after observing a larger `allocated` in the header.
    pub fn remap(&mut self, new_size: u32, preserve: bool) -> Result<()> {
        let _ = preserve; // file-backed mappings always preserve contents
        let file_len = self.file.metadata().map_err(MonError::Io)?.len();
        if file_len < u64::from(new_size) {
            self.file.set_len(u64::from(new_size)).map_err(MonError::Io)?;
        }
        let map = unsafe { MmapMut::map_mut(&self.file) }.map_err(MonError::Io)?;
        debug!(
            path = %self.path.display(),
            old = self.map.len(),
            new = map.len(),
            "monitoring region remapped"
        );
        self.map = map;
        Ok(())
    }

    /// Remove the backing file. The mapping itself stays valid until drop.
    pub fn remove(&self) -> Result<()> {
        std::fs::remove_file(&self.path).map_err(MonError::Io)
    }

    /// Acquire the embedded cross-process mutex.
    ///
    /// fcntl locks exclude processes, not threads; within a process the
    /// exclusive `&mut self` receiver is what serializes access to the
    /// mapping.
    #[must_use]
    pub fn lock(&mut self) -> RegionGuard<'_> {
        region_mutex_op(&self.file, libc::F_WRLCK, "lock");
        RegionGuard { region: self }
    }

    /// Current mapping length of this handle.
    #[must_use]
    pub fn mapped_len(&self) -> u32 {
        u32::try_from(self.map.len()).unwrap_or(u32::MAX)
    }

    /// Path of the backing region file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn read_u32(&self, offset: usize) -> u32 {
        let bytes: [u8; 4] = self.map[offset..offset + 4]
            .try_into()
            .expect("slice is exactly 4 bytes");
        u32::from_ne_bytes(bytes)
    }

    pub(crate) fn write_u32(&mut self, offset: usize, value: u32) {
        self.map[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    pub(crate) fn used(&self) -> u32 {
        self.read_u32(HDR_OFF_USED)
    }

    pub(crate) fn set_used(&mut self, value: u32) {
        self.write_u32(HDR_OFF_USED, value);
    }

    pub(crate) fn allocated(&self) -> u32 {
        self.read_u32(HDR_OFF_ALLOCATED)
    }

    pub(crate) fn set_allocated(&mut self, value: u32) {
        self.write_u32(HDR_OFF_ALLOCATED, value);
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }
}

/// RAII guard over the region's embedded cross-process mutex.
pub struct RegionGuard<'a> {
    region: &'a mut SharedRegion,
}

impl RegionGuard<'_> {
    pub(crate) fn region(&mut self) -> &mut SharedRegion {
        self.region
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        region_mutex_op(&self.region.file, libc::F_UNLCK, "unlock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join(monitor_file_name("test-db"))
    }

    #[test]
    fn file_name_template() {
        assert_eq!(monitor_file_name("fb12ab"), "monitor_fb12ab.mem");
    }

    #[test]
    fn create_stamps_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let region = SharedRegion::map(&region_path(&dir), DEFAULT_SIZE).expect("map");

        assert_eq!(region.read_u32(HDR_OFF_TYPE), REGION_TYPE_TAG);
        assert_eq!(region.read_u32(HDR_OFF_VERSION), MONITOR_VERSION);
        assert_eq!(region.used(), crate::align8(HEADER_SIZE));
        assert_eq!(region.allocated(), DEFAULT_SIZE);
        assert_eq!(region.mapped_len(), DEFAULT_SIZE);
    }

    #[test]
    fn second_opener_validates_instead_of_initializing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = region_path(&dir);
        let mut first = SharedRegion::map(&path, DEFAULT_SIZE).expect("map first");
        first.set_used(100);

        let second = SharedRegion::map(&path, DEFAULT_SIZE).expect("map second");
        // The initializer must not run again.
        assert_eq!(second.used(), 100);
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = region_path(&dir);
        {
            let mut region = SharedRegion::map(&path, DEFAULT_SIZE).expect("map");
            region.write_u32(HDR_OFF_VERSION, MONITOR_VERSION + 1);
        }

        let err = SharedRegion::map(&path, DEFAULT_SIZE).expect_err("must reject");
        assert!(matches!(
            err,
            MonError::VersionMismatch {
                found,
                expected: MONITOR_VERSION,
            } if found == MONITOR_VERSION + 1
        ));
    }

    #[test]
    fn bad_type_tag_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = region_path(&dir);
        {
            let mut region = SharedRegion::map(&path, DEFAULT_SIZE).expect("map");
            region.write_u32(HDR_OFF_TYPE, 0xDEAD_BEEF);
        }

        let err = SharedRegion::map(&path, DEFAULT_SIZE).expect_err("must reject");
        assert!(matches!(err, MonError::BadRegionType { tag: 0xDEAD_BEEF }));
    }

    #[test]
    fn remap_grows_and_preserves_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut region = SharedRegion::map(&region_path(&dir), DEFAULT_SIZE).expect("map");

        let marker = b"payload marker";
        let at = crate::align8(HEADER_SIZE) as usize;
        region.bytes_mut()[at..at + marker.len()].copy_from_slice(marker);

        region.remap(DEFAULT_SIZE * 2, true).expect("remap");
        assert_eq!(region.mapped_len(), DEFAULT_SIZE * 2);
        assert_eq!(&region.bytes()[at..at + marker.len()], marker);
    }

    #[test]
    fn follower_observes_growth_through_remap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = region_path(&dir);
        let mut grower = SharedRegion::map(&path, DEFAULT_SIZE).expect("map grower");
        let mut follower = SharedRegion::map(&path, DEFAULT_SIZE).expect("map follower");

        grower.remap(DEFAULT_SIZE * 3, true).expect("grow");
        grower.set_allocated(DEFAULT_SIZE * 3);

        assert_eq!(follower.mapped_len(), DEFAULT_SIZE);
        let target = follower.allocated();
        assert_eq!(target, DEFAULT_SIZE * 3);
        follower.remap(target, true).expect("follow");
        assert_eq!(follower.mapped_len(), DEFAULT_SIZE * 3);
    }

    #[test]
    fn lock_guard_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut region = SharedRegion::map(&region_path(&dir), DEFAULT_SIZE).expect("map");
        {
            let mut guard = region.lock();
            guard.region().set_used(4096);
        }
        assert_eq!(region.used(), 4096);
    }

    #[test]
    fn remove_unlinks_backing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = region_path(&dir);
        let region = SharedRegion::map(&path, DEFAULT_SIZE).expect("map");
        assert!(path.exists());
        region.remove().expect("remove");
        assert!(!path.exists());
    }
}
