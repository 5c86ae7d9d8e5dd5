//! Shared identifiers, value types and engine-facing traits for the
//! monitoring-snapshot subsystem.
//!
//! The outer engine owns the metadata for the virtual monitoring relations;
//! this crate pins down the numeric identifiers and enumerated field values
//! that cross the shared-memory boundary, plus the narrow traits through
//! which the subsystem consumes engine services (lock manager, process
//! liveness, format registry).

pub mod format;
pub mod ids;
pub mod traits;

pub use format::{system_format, Charset, FieldSlot, Format, SlotKind};
pub use ids::{
    att_field, call_field, ctx_field, db_field, io_field, mem_field, rec_field, stmt_field,
    tra_field, RelationId,
};
pub use traits::{
    AstCallback, FormatRegistry, LockHandle, LockManager, LockMode, ProcessOracle,
    SystemFormatRegistry,
};

use serde::{Deserialize, Serialize};

/// Engine timestamp: microseconds since the Unix epoch, carried opaquely.
pub type EngineTimestamp = i64;

/// Compose a snapshot-wide unique identifier from a process id and a
/// process-local counter value.
#[must_use]
pub const fn global_id(process_id: u32, local_counter: u32) -> i64 {
    ((process_id as i64) << 32) | (local_counter as i64)
}

/// Self-describing type tag carried by every dump field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeTag {
    /// 8-byte signed integer.
    Integer,
    /// 8-byte engine timestamp.
    Timestamp,
    /// UTF-8 bytes, no terminator.
    String,
    /// 8-byte signed `(pid << 32) | counter` composite.
    GlobalId,
}

impl TypeTag {
    /// Wire discriminant value.
    #[must_use]
    pub const fn to_u8(self) -> u8 {
        match self {
            Self::Integer => 1,
            Self::Timestamp => 2,
            Self::String => 3,
            Self::GlobalId => 4,
        }
    }

    /// Parse wire discriminant; `None` for unknown tags.
    #[must_use]
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(Self::Integer),
            2 => Some(Self::Timestamp),
            3 => Some(Self::String),
            4 => Some(Self::GlobalId),
            _ => None,
        }
    }
}

/// Object activity state (`state` field of attachments, transactions and
/// statements).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i64)]
pub enum MonState {
    Idle = 0,
    Active = 1,
    Stalled = 2,
}

/// Database shutdown mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i64)]
pub enum ShutdownMode {
    Online = 0,
    Multi = 1,
    Single = 2,
    Full = 3,
}

/// Transaction isolation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i64)]
pub enum IsoMode {
    Consistency = 0,
    Concurrency = 1,
    ReadCommittedNoVersion = 2,
    ReadCommittedVersion = 3,
}

/// Physical backup state of the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i64)]
pub enum BackupState {
    Unknown = 0,
    Normal = 1,
    Stalled = 2,
    Merge = 3,
}

/// Which kind of object a statistics record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i64)]
pub enum StatGroup {
    Database = 0,
    Attachment = 1,
    Transaction = 2,
    Statement = 3,
    Call = 4,
}

/// Physical I/O counters attached to every monitored object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoStats {
    pub page_reads: i64,
    pub page_writes: i64,
    pub page_fetches: i64,
    pub page_marks: i64,
}

/// Record-level counters attached to every monitored object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecStats {
    pub seq_reads: i64,
    pub idx_reads: i64,
    pub inserts: i64,
    pub updates: i64,
    pub deletes: i64,
    pub backouts: i64,
    pub purges: i64,
    pub expunges: i64,
}

/// Memory usage counters attached to every monitored object.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub current_used: i64,
    pub current_allocated: i64,
    pub max_used: i64,
    pub max_allocated: i64,
}
