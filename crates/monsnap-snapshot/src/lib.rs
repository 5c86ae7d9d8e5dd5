//! Monitoring-snapshot assembly for a multi-process database engine.
//!
//! Every process attached to a database publishes its runtime telemetry
//! (attachments, transactions, statements, call stacks, statistics, memory
//! usage, context variables) into a per-database shared-memory store. When
//! an attachment queries a virtual monitoring relation, this crate runs one
//! snapshot round: it publishes the local contribution, forces every peer
//! to do the same through the monitor lock, reads the compacted store, and
//! materializes the rows the requester is allowed to see.
//!
//! Crate map:
//!
//! - [`engine`]: the sample model of engine objects the collector walks
//! - [`collector`]: traversal and dump emission
//! - [`monitor`]: shared/exclusive monitor-lock coordination
//! - [`local`]: in-process lock manager for single-process deployments
//! - [`buffer`]: materialized row buffers and the blob arena
//! - [`snapshot`]: the assembler that drives the round, filters and converts

pub mod buffer;
pub mod collector;
pub mod engine;
pub mod local;
pub mod monitor;
pub mod snapshot;

pub use buffer::{BlobOwner, BlobStore, RecordBuffer, RowData};
pub use collector::dump_data;
pub use engine::{
    database_sample, AttachmentBody, AttachmentSample, CallTarget, DatabaseSample, EngineProcess,
    RequestSample, TransactionSample,
};
pub use local::LocalLockManager;
pub use monitor::ProcessMonitor;
pub use snapshot::{RequesterIdentity, SnapshotAssembler};
