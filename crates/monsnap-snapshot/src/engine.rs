//! Sample model of the engine objects the collector traverses.
//!
//! The outer engine owns the live attachment/transaction/request structures;
//! what the collector needs from them is a consistent per-attachment view,
//! frozen under the attachment's latch for the duration of one traversal.
//! Caller relationships are carried as indices into the attachment's request
//! list, never as references, so no cycles can reach the dump stream.

use monsnap_error::{MonError, Result};
use monsnap_types::{
    BackupState, Charset, EngineTimestamp, IoStats, IsoMode, MemoryUsage, MonState, RecStats,
    ShutdownMode,
};
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Data-dictionary object type of a trigger, passed through as an integer.
pub const OBJECT_TYPE_TRIGGER: i64 = 2;

/// Snapshot of the database-wide header and counters.
#[derive(Debug, Clone)]
pub struct DatabaseSample {
    /// Database name or alias, in the engine system charset.
    pub name: String,
    pub page_size: i64,
    pub ods_major: i64,
    pub ods_minor: i64,
    pub oldest_transaction: i64,
    pub oldest_active: i64,
    pub oldest_snapshot: i64,
    pub next_transaction: i64,
    pub page_buffers: i64,
    pub dialect: i64,
    pub shutdown_mode: ShutdownMode,
    pub sweep_interval: i64,
    pub read_only: bool,
    pub forced_writes: bool,
    pub reserve_space: bool,
    pub created: EngineTimestamp,
    pub pages: i64,
    pub backup_state: BackupState,
    pub stats: IoStats,
    pub rec_stats: RecStats,
    pub memory: MemoryUsage,
}

/// One transaction of an attachment.
#[derive(Debug, Clone)]
pub struct TransactionSample {
    pub id: i64,
    pub timestamp: EngineTimestamp,
    pub top: i64,
    pub oldest: i64,
    pub oldest_active: i64,
    pub isolation: IsoMode,
    pub lock_timeout: i64,
    pub read_only: bool,
    pub auto_commit: bool,
    pub auto_undo: bool,
    pub context_vars: Vec<(String, String)>,
    pub stats: IoStats,
    pub rec_stats: RecStats,
    pub memory: MemoryUsage,
}

/// What a request executes: a stored routine or a trigger.
#[derive(Debug, Clone)]
pub enum CallTarget {
    Routine {
        name: String,
        package: String,
        /// Data-dictionary object type OID, passed through unchanged.
        object_type: i64,
    },
    Trigger {
        name: String,
    },
}

/// One request (statement execution or call-stack frame) of an attachment.
#[derive(Debug, Clone)]
pub struct RequestSample {
    pub id: i64,
    /// Index of the calling request in the attachment's request list.
    /// `None` marks a chain root.
    pub caller: Option<usize>,
    /// Member of the attachment's top-level request list.
    pub top_level: bool,
    /// Engine-internal request; never published.
    pub internal: bool,
    /// System trigger; never published.
    pub system_trigger: bool,
    pub state: MonState,
    pub transaction_id: Option<i64>,
    pub timestamp: EngineTimestamp,
    pub sql_text: Option<String>,
    pub target: Option<CallTarget>,
    pub src_line: i64,
    pub src_column: i64,
    pub stats: IoStats,
    pub rec_stats: RecStats,
    pub memory: MemoryUsage,
}

/// The latched part of an attachment: its transaction and request lists.
#[derive(Debug, Default)]
pub struct AttachmentBody {
    pub transactions: Vec<TransactionSample>,
    pub requests: Vec<RequestSample>,
    pub context_vars: Vec<(String, String)>,
}

/// One client session bound to the database within this process.
#[derive(Debug)]
pub struct AttachmentSample {
    pub id: i64,
    /// Authenticated user name; an attachment without one is never published.
    pub user: Option<String>,
    pub name: String,
    pub role: String,
    pub remote_protocol: String,
    pub remote_address: String,
    pub remote_pid: Option<i64>,
    pub remote_process: String,
    pub charset: Charset,
    pub charset_id: i64,
    pub timestamp: EngineTimestamp,
    pub gc_enabled: bool,
    pub stats: IoStats,
    pub rec_stats: RecStats,
    pub memory: MemoryUsage,
    body: Mutex<AttachmentBody>,
}

impl AttachmentSample {
    pub fn new(id: i64, user: Option<&str>, name: &str, body: AttachmentBody) -> Self {
        Self {
            id,
            user: user.map(str::to_owned),
            name: name.to_owned(),
            role: String::new(),
            remote_protocol: String::new(),
            remote_address: String::new(),
            remote_pid: None,
            remote_process: String::new(),
            charset: Charset::Utf8,
            charset_id: 4,
            timestamp: 0,
            gc_enabled: true,
            stats: IoStats::default(),
            rec_stats: RecStats::default(),
            memory: MemoryUsage::default(),
            body: Mutex::new(body),
        }
    }

    /// Freeze the attachment's transaction/request lists for traversal.
    pub fn latch(&self) -> MutexGuard<'_, AttachmentBody> {
        self.body.lock()
    }

    /// Activity state derived from the latched body: active as soon as any
    /// transaction carries a request.
    pub fn state(&self, body: &AttachmentBody) -> MonState {
        for transaction in &body.transactions {
            if body
                .requests
                .iter()
                .any(|r| r.transaction_id == Some(transaction.id))
            {
                return MonState::Active;
            }
        }
        MonState::Idle
    }
}

/// This process's view of one database: the header sample plus the user and
/// system attachment lists.
#[derive(Debug)]
pub struct EngineProcess {
    pub process_id: u32,
    /// Disambiguates several attachments of this process to one database file.
    pub local_id: u32,
    database: Mutex<DatabaseSample>,
    attachments: Mutex<Vec<Arc<AttachmentSample>>>,
    system_attachments: Mutex<Vec<Arc<AttachmentSample>>>,
}

impl EngineProcess {
    pub fn new(process_id: u32, local_id: u32, database: DatabaseSample) -> Self {
        Self {
            process_id,
            local_id,
            database: Mutex::new(database),
            attachments: Mutex::new(Vec::new()),
            system_attachments: Mutex::new(Vec::new()),
        }
    }

    /// Re-read and validate the database header sample.
    ///
    /// Snapshot construction calls this first; a header that fails
    /// validation aborts the snapshot before any cross-process traffic.
    pub fn refresh_header(&self) -> Result<DatabaseSample> {
        let database = self.database.lock().clone();
        if database.page_size <= 0 || (database.page_size & (database.page_size - 1)) != 0 {
            return Err(MonError::collector(format!(
                "invalid page size {} in database header",
                database.page_size
            )));
        }
        Ok(database)
    }

    /// Current database sample.
    pub fn database(&self) -> DatabaseSample {
        self.database.lock().clone()
    }

    pub fn set_database(&self, sample: DatabaseSample) {
        *self.database.lock() = sample;
    }

    pub fn add_attachment(&self, attachment: Arc<AttachmentSample>) {
        self.attachments.lock().push(attachment);
    }

    pub fn add_system_attachment(&self, attachment: Arc<AttachmentSample>) {
        self.system_attachments.lock().push(attachment);
    }

    /// User attachments, in attach order.
    pub fn attachments(&self) -> Vec<Arc<AttachmentSample>> {
        self.attachments.lock().clone()
    }

    /// System attachments (cache writer, garbage collector and friends).
    pub fn system_attachments(&self) -> Vec<Arc<AttachmentSample>> {
        self.system_attachments.lock().clone()
    }
}

/// A plausible default database sample for tests and embedded setups.
#[must_use]
pub fn database_sample(name: &str) -> DatabaseSample {
    DatabaseSample {
        name: name.to_owned(),
        page_size: 4096,
        ods_major: 11,
        ods_minor: 2,
        oldest_transaction: 1,
        oldest_active: 1,
        oldest_snapshot: 1,
        next_transaction: 2,
        page_buffers: 2048,
        dialect: 3,
        shutdown_mode: ShutdownMode::Online,
        sweep_interval: 20_000,
        read_only: false,
        forced_writes: true,
        reserve_space: true,
        created: 1_600_000_000_000_000,
        pages: 200,
        backup_state: BackupState::Normal,
        stats: IoStats::default(),
        rec_stats: RecStats::default(),
        memory: MemoryUsage::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refresh_header_validates_page_size() {
        let process = EngineProcess::new(100, 1, database_sample("db1"));
        assert!(process.refresh_header().is_ok());

        let mut bad = database_sample("db1");
        bad.page_size = 1000;
        process.set_database(bad);
        assert!(process.refresh_header().is_err());
    }

    #[test]
    fn attachment_state_follows_transaction_requests() {
        let body = AttachmentBody {
            transactions: vec![TransactionSample {
                id: 7,
                timestamp: 0,
                top: 7,
                oldest: 1,
                oldest_active: 1,
                isolation: IsoMode::Concurrency,
                lock_timeout: -1,
                read_only: false,
                auto_commit: false,
                auto_undo: true,
                context_vars: Vec::new(),
                stats: IoStats::default(),
                rec_stats: RecStats::default(),
                memory: MemoryUsage::default(),
            }],
            requests: Vec::new(),
            context_vars: Vec::new(),
        };
        let attachment = AttachmentSample::new(1, Some("alice"), "db1", body);
        {
            let body = attachment.latch();
            assert_eq!(attachment.state(&body), MonState::Idle);
        }

        attachment.latch().requests.push(RequestSample {
            id: 50,
            caller: None,
            top_level: true,
            internal: false,
            system_trigger: false,
            state: MonState::Active,
            transaction_id: Some(7),
            timestamp: 0,
            sql_text: Some("select 1".to_owned()),
            target: None,
            src_line: 0,
            src_column: 0,
            stats: IoStats::default(),
            rec_stats: RecStats::default(),
            memory: MemoryUsage::default(),
        });
        let body = attachment.latch();
        assert_eq!(attachment.state(&body), MonState::Active);
    }
}
