use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for the monitoring-snapshot subsystem.
///
/// Structured variants for the failure modes the subsystem can hit, plus an
/// engine error-code mapping so callers can surface them through the outer
/// engine's status machinery.
#[derive(Error, Debug)]
pub enum MonError {
    // === Shared region ===
    /// The shared memory region could not be created or attached.
    #[error("cannot initialize the shared memory region: '{path}': {detail}")]
    MapFailure { path: PathBuf, detail: String },

    /// The region needs to grow but the platform cannot resize the mapping.
    #[error("monitor table exhausted")]
    RegionExhausted,

    /// The region carries a layout version this build does not understand.
    #[error("monitoring region version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    /// The region tag does not identify a monitoring region.
    #[error("not a monitoring region: bad type tag {tag:#010x}")]
    BadRegionType { tag: u32 },

    /// The embedded cross-process mutex returned an unrecoverable error.
    ///
    /// Callers log and terminate the process rather than continue over
    /// possibly corrupt shared state.
    #[error("monitor mutex {op} error, status = {errno}")]
    MutexCorruption { op: &'static str, errno: i32 },

    // === Store ===
    /// The caller's own contribution is absent from the store during read.
    #[error("own monitoring contribution missing from the shared region")]
    MissingSelf,

    // === Dump stream ===
    /// A record or field in the dump stream is truncated or malformed.
    #[error("malformed monitoring dump: {detail}")]
    DecodeFailure { detail: String },

    // === Coordination ===
    /// The monitor lock could not be obtained within the engine's wait limit.
    #[error("lock time-out on wait transaction")]
    LockTimeout,

    /// A peer's collector failed while publishing its contribution.
    ///
    /// Absorbed inside the AST path; only ever propagated on the caller's
    /// own publish.
    #[error("cannot dump the monitoring data: {detail}")]
    CollectorFailure { detail: String },

    // === I/O ===
    /// Underlying file I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine status codes the subsystem maps onto, mirroring the outer engine's
/// numeric error space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum EngineCode {
    /// Generic error.
    Error = 1,
    /// Operating-system level failure.
    SysRequest = 2,
    /// Monitor table space exhausted.
    MonTableExhausted = 3,
    /// Lock wait timed out.
    LockTimeout = 4,
    /// Incompatible on-disk/in-memory layout.
    WrongVersion = 5,
    /// Internal inconsistency.
    Internal = 6,
}

impl MonError {
    /// Map this error to the engine status code it surfaces as.
    pub const fn engine_code(&self) -> EngineCode {
        match self {
            Self::MapFailure { .. } | Self::Io(_) => EngineCode::SysRequest,
            Self::RegionExhausted => EngineCode::MonTableExhausted,
            Self::VersionMismatch { .. } | Self::BadRegionType { .. } => EngineCode::WrongVersion,
            Self::LockTimeout => EngineCode::LockTimeout,
            Self::MutexCorruption { .. } | Self::MissingSelf => EngineCode::Internal,
            Self::DecodeFailure { .. } | Self::CollectorFailure { .. } => EngineCode::Error,
        }
    }

    /// Whether retrying the snapshot round may succeed without intervention.
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::LockTimeout | Self::CollectorFailure { .. } | Self::DecodeFailure { .. }
        )
    }

    /// Whether this failure must terminate the process (shared state can no
    /// longer be trusted).
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::MutexCorruption { .. })
    }

    /// Create a decode failure.
    pub fn decode(detail: impl Into<String>) -> Self {
        Self::DecodeFailure {
            detail: detail.into(),
        }
    }

    /// Create a collector failure.
    pub fn collector(detail: impl Into<String>) -> Self {
        Self::CollectorFailure {
            detail: detail.into(),
        }
    }

    /// Create a map failure.
    pub fn map_failure(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::MapFailure {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

/// Result type alias using `MonError`.
pub type Result<T> = std::result::Result<T, MonError>;
