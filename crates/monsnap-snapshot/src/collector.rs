//! Walks this process's engine objects and publishes them into the shared
//! store as one dump.
//!
//! Traversal order is fixed: the database record, then every user
//! attachment, then every system attachment; per attachment its context
//! variables, its transactions (each with their context variables), the
//! call-stack frames reachable through caller chains, and finally the
//! top-level requests. Internal statements and system triggers never appear.
//!
//! Each object record is followed by its I/O-statistics, record-statistics
//! and memory-usage child records, all tied together by a freshly generated
//! `stat_id`.

use std::sync::atomic::{AtomicU32, Ordering};

use monsnap_codec::{DumpRecord, DumpSink, DumpWriter};
use monsnap_error::Result;
use monsnap_shmem::{MonitoringStore, StoreGuard};
use monsnap_types::{
    att_field, call_field, ctx_field, db_field, global_id, io_field, mem_field, rec_field,
    stmt_field, tra_field, IoStats, MemoryUsage, MonState, RecStats, RelationId, StatGroup,
};

use crate::engine::{
    AttachmentBody, AttachmentSample, CallTarget, DatabaseSample, EngineProcess, RequestSample,
    OBJECT_TYPE_TRIGGER,
};

/// Process-wide monotonic source of statistics identifiers.
static STAT_ID: AtomicU32 = AtomicU32::new(0);

fn next_stat_id() -> u32 {
    STAT_ID.fetch_add(1, Ordering::Relaxed) + 1
}

/// Transliterate a string from the engine system charset to UTF-8.
///
/// The sample model carries strings in UTF-8 already, so this is the
/// identity hook where a differently-configured engine would convert.
fn system_to_utf8(s: &str) -> &str {
    s
}

/// Adapter that appends encoded records to this process's store element.
struct StoreSink<'a, 'g> {
    guard: &'a mut StoreGuard<'g>,
    offset: u32,
}

impl DumpSink for StoreSink<'_, '_> {
    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.guard.write(self.offset, bytes)
    }
}

/// Publish a fresh contribution for `process` into `store`.
///
/// Runs entirely inside one region-mutex window: the stale element is
/// removed, a new one is appended unconditionally (so a subsequent read in
/// the same round always finds it), and the dump is streamed into it.
pub fn dump_data(process: &EngineProcess, store: &mut MonitoringStore) -> Result<()> {
    let mut guard = store.acquire()?;
    guard.cleanup();
    let offset = guard.setup()?;

    let mut sink = StoreSink {
        guard: &mut guard,
        offset,
    };
    let mut writer = DumpWriter::new(&mut sink);

    let database = process.database();
    put_database(&database, process.process_id, &mut writer)?;

    for attachment in process.attachments() {
        dump_attachment(&attachment, process.process_id, &mut writer)?;
    }
    for attachment in process.system_attachments() {
        dump_attachment(&attachment, process.process_id, &mut writer)?;
    }

    Ok(())
}

fn dump_attachment<S: DumpSink>(
    attachment: &AttachmentSample,
    process_id: u32,
    writer: &mut DumpWriter<'_, S>,
) -> Result<()> {
    let body = attachment.latch();

    if !put_attachment(attachment, &body, process_id, writer)? {
        return Ok(());
    }

    put_context_vars(&body.context_vars, attachment.id, true, writer)?;

    for transaction in &body.transactions {
        put_transaction(transaction, &body, attachment.id, process_id, writer)?;
        put_context_vars(&transaction.context_vars, transaction.id, false, writer)?;
    }

    // Call-stack frames: only requests with a caller, and never internal
    // statements or system triggers.
    for request in &body.requests {
        if request.caller.is_some() && !request.internal && !request.system_trigger {
            put_call(request, &body, process_id, writer)?;
        }
    }

    // Top-level requests, same statement filter, no caller requirement.
    for request in &body.requests {
        if request.top_level && !request.internal && !request.system_trigger {
            put_request(request, attachment.id, process_id, writer)?;
        }
    }

    Ok(())
}

fn put_database<S: DumpSink>(
    database: &DatabaseSample,
    process_id: u32,
    writer: &mut DumpWriter<'_, S>,
) -> Result<()> {
    let stat_id = next_stat_id();
    let mut record = DumpRecord::new(RelationId::Database.to_u16());

    // Database name: always the first field in this record.
    record.store_string(db_field::NAME, system_to_utf8(&database.name));
    record.store_integer(db_field::PAGE_SIZE, database.page_size);
    record.store_integer(db_field::ODS_MAJOR, database.ods_major);
    record.store_integer(db_field::ODS_MINOR, database.ods_minor);
    record.store_integer(db_field::OLDEST_TRANSACTION, database.oldest_transaction);
    record.store_integer(db_field::OLDEST_ACTIVE, database.oldest_active);
    record.store_integer(db_field::OLDEST_SNAPSHOT, database.oldest_snapshot);
    record.store_integer(db_field::NEXT_TRANSACTION, database.next_transaction);
    record.store_integer(db_field::PAGE_BUFFERS, database.page_buffers);
    record.store_integer(db_field::DIALECT, database.dialect);
    record.store_integer(db_field::SHUTDOWN_MODE, database.shutdown_mode as i64);
    record.store_integer(db_field::SWEEP_INTERVAL, database.sweep_interval);
    record.store_integer(db_field::READ_ONLY, i64::from(database.read_only));
    record.store_integer(db_field::FORCED_WRITES, i64::from(database.forced_writes));
    record.store_integer(db_field::RESERVE_SPACE, i64::from(database.reserve_space));
    record.store_timestamp(db_field::CREATED, database.created);
    record.store_integer(db_field::PAGES, database.pages);
    record.store_integer(db_field::BACKUP_STATE, database.backup_state as i64);
    record.store_global_id(db_field::STAT_ID, global_id(process_id, stat_id));
    writer.put_record(&record)?;

    put_statistics(
        &database.stats,
        &database.rec_stats,
        process_id,
        stat_id,
        StatGroup::Database,
        writer,
    )?;
    put_memory_usage(
        &database.memory,
        process_id,
        stat_id,
        StatGroup::Database,
        writer,
    )
}

/// Emit one attachment record. Attachments without an authenticated user
/// (still handshaking) are skipped along with all their children.
fn put_attachment<S: DumpSink>(
    attachment: &AttachmentSample,
    body: &AttachmentBody,
    process_id: u32,
    writer: &mut DumpWriter<'_, S>,
) -> Result<bool> {
    let Some(user) = attachment.user.as_deref() else {
        return Ok(false);
    };

    let stat_id = next_stat_id();
    let mut record = DumpRecord::new(RelationId::Attachments.to_u16());

    // User name: always the first field in this record.
    record.store_string(att_field::USER, system_to_utf8(user));
    record.store_integer(att_field::ID, attachment.id);
    record.store_integer(att_field::SERVER_PID, i64::from(process_id));
    record.store_integer(att_field::STATE, attachment.state(body) as i64);
    record.store_string(att_field::NAME, system_to_utf8(&attachment.name));
    record.store_string(att_field::ROLE, system_to_utf8(&attachment.role));
    record.store_string(att_field::REMOTE_PROTOCOL, &attachment.remote_protocol);
    record.store_string(att_field::REMOTE_ADDRESS, &attachment.remote_address);
    if let Some(remote_pid) = attachment.remote_pid {
        record.store_integer(att_field::REMOTE_PID, remote_pid);
    }
    record.store_string(att_field::REMOTE_PROCESS, &attachment.remote_process);
    record.store_integer(att_field::CHARSET_ID, attachment.charset_id);
    record.store_timestamp(att_field::TIMESTAMP, attachment.timestamp);
    record.store_integer(
        att_field::GARBAGE_COLLECTION,
        i64::from(attachment.gc_enabled),
    );
    record.store_global_id(att_field::STAT_ID, global_id(process_id, stat_id));
    writer.put_record(&record)?;

    put_statistics(
        &attachment.stats,
        &attachment.rec_stats,
        process_id,
        stat_id,
        StatGroup::Attachment,
        writer,
    )?;
    put_memory_usage(
        &attachment.memory,
        process_id,
        stat_id,
        StatGroup::Attachment,
        writer,
    )?;

    Ok(true)
}

fn put_transaction<S: DumpSink>(
    transaction: &crate::engine::TransactionSample,
    body: &AttachmentBody,
    attachment_id: i64,
    process_id: u32,
    writer: &mut DumpWriter<'_, S>,
) -> Result<()> {
    let stat_id = next_stat_id();
    let mut record = DumpRecord::new(RelationId::Transactions.to_u16());

    let state = if body
        .requests
        .iter()
        .any(|r| r.transaction_id == Some(transaction.id))
    {
        MonState::Active
    } else {
        MonState::Idle
    };

    record.store_integer(tra_field::ID, transaction.id);
    record.store_integer(tra_field::ATTACHMENT_ID, attachment_id);
    record.store_integer(tra_field::STATE, state as i64);
    record.store_timestamp(tra_field::TIMESTAMP, transaction.timestamp);
    record.store_integer(tra_field::TOP, transaction.top);
    record.store_integer(tra_field::OLDEST_TRANSACTION, transaction.oldest);
    record.store_integer(tra_field::OLDEST_ACTIVE, transaction.oldest_active);
    record.store_integer(tra_field::ISOLATION_MODE, transaction.isolation as i64);
    record.store_integer(tra_field::LOCK_TIMEOUT, transaction.lock_timeout);
    record.store_integer(tra_field::READ_ONLY, i64::from(transaction.read_only));
    record.store_integer(tra_field::AUTO_COMMIT, i64::from(transaction.auto_commit));
    record.store_integer(tra_field::AUTO_UNDO, i64::from(transaction.auto_undo));
    record.store_global_id(tra_field::STAT_ID, global_id(process_id, stat_id));
    writer.put_record(&record)?;

    put_statistics(
        &transaction.stats,
        &transaction.rec_stats,
        process_id,
        stat_id,
        StatGroup::Transaction,
        writer,
    )?;
    put_memory_usage(
        &transaction.memory,
        process_id,
        stat_id,
        StatGroup::Transaction,
        writer,
    )
}

fn put_request<S: DumpSink>(
    request: &RequestSample,
    attachment_id: i64,
    process_id: u32,
    writer: &mut DumpWriter<'_, S>,
) -> Result<()> {
    let stat_id = next_stat_id();
    let mut record = DumpRecord::new(RelationId::Statements.to_u16());

    record.store_integer(stmt_field::ID, request.id);
    record.store_integer(stmt_field::ATTACHMENT_ID, attachment_id);
    match request.state {
        MonState::Active | MonState::Stalled => {
            record.store_integer(stmt_field::STATE, request.state as i64);
            if let Some(transaction_id) = request.transaction_id {
                record.store_integer(stmt_field::TRANSACTION_ID, transaction_id);
            }
            record.store_timestamp(stmt_field::TIMESTAMP, request.timestamp);
        }
        MonState::Idle => {
            record.store_integer(stmt_field::STATE, MonState::Idle as i64);
        }
    }
    if let Some(sql_text) = request.sql_text.as_deref() {
        record.store_string(stmt_field::SQL_TEXT, sql_text);
    }
    record.store_global_id(stmt_field::STAT_ID, global_id(process_id, stat_id));
    writer.put_record(&record)?;

    put_statistics(
        &request.stats,
        &request.rec_stats,
        process_id,
        stat_id,
        StatGroup::Statement,
        writer,
    )?;
    put_memory_usage(
        &request.memory,
        process_id,
        stat_id,
        StatGroup::Statement,
        writer,
    )
}

fn put_call<S: DumpSink>(
    request: &RequestSample,
    body: &AttachmentBody,
    process_id: u32,
    writer: &mut DumpWriter<'_, S>,
) -> Result<()> {
    // Chase the caller chain up to the root statement.
    let direct_caller = request.caller.expect("call frames have a caller");
    let mut root = direct_caller;
    while let Some(up) = body.requests[root].caller {
        root = up;
    }

    let stat_id = next_stat_id();
    let mut record = DumpRecord::new(RelationId::Calls.to_u16());

    record.store_integer(call_field::ID, request.id);
    record.store_integer(call_field::STATEMENT_ID, body.requests[root].id);
    if direct_caller != root {
        record.store_integer(call_field::CALLER_ID, body.requests[direct_caller].id);
    }

    match &request.target {
        Some(CallTarget::Routine {
            name,
            package,
            object_type,
        }) => {
            if !package.is_empty() {
                record.store_string(call_field::PACKAGE_NAME, system_to_utf8(package));
            }
            record.store_string(call_field::NAME, system_to_utf8(name));
            record.store_integer(call_field::OBJECT_TYPE, *object_type);
        }
        Some(CallTarget::Trigger { name }) => {
            record.store_string(call_field::NAME, system_to_utf8(name));
            record.store_integer(call_field::OBJECT_TYPE, OBJECT_TYPE_TRIGGER);
        }
        None => {
            return Err(monsnap_error::MonError::collector(format!(
                "call frame {} has no routine or trigger target",
                request.id
            )));
        }
    }

    record.store_timestamp(call_field::TIMESTAMP, request.timestamp);
    if request.src_line != 0 {
        record.store_integer(call_field::SRC_LINE, request.src_line);
        record.store_integer(call_field::SRC_COLUMN, request.src_column);
    }
    record.store_global_id(call_field::STAT_ID, global_id(process_id, stat_id));
    writer.put_record(&record)?;

    put_statistics(
        &request.stats,
        &request.rec_stats,
        process_id,
        stat_id,
        StatGroup::Call,
        writer,
    )?;
    put_memory_usage(&request.memory, process_id, stat_id, StatGroup::Call, writer)
}

fn put_statistics<S: DumpSink>(
    io: &IoStats,
    rec: &RecStats,
    process_id: u32,
    stat_id: u32,
    group: StatGroup,
    writer: &mut DumpWriter<'_, S>,
) -> Result<()> {
    let id = global_id(process_id, stat_id);

    let mut record = DumpRecord::new(RelationId::IoStats.to_u16());
    record.store_global_id(io_field::STAT_ID, id);
    record.store_integer(io_field::STAT_GROUP, group as i64);
    record.store_integer(io_field::PAGE_READS, io.page_reads);
    record.store_integer(io_field::PAGE_WRITES, io.page_writes);
    record.store_integer(io_field::PAGE_FETCHES, io.page_fetches);
    record.store_integer(io_field::PAGE_MARKS, io.page_marks);
    writer.put_record(&record)?;

    record.reset(RelationId::RecStats.to_u16());
    record.store_global_id(rec_field::STAT_ID, id);
    record.store_integer(rec_field::STAT_GROUP, group as i64);
    record.store_integer(rec_field::SEQ_READS, rec.seq_reads);
    record.store_integer(rec_field::IDX_READS, rec.idx_reads);
    record.store_integer(rec_field::INSERTS, rec.inserts);
    record.store_integer(rec_field::UPDATES, rec.updates);
    record.store_integer(rec_field::DELETES, rec.deletes);
    record.store_integer(rec_field::BACKOUTS, rec.backouts);
    record.store_integer(rec_field::PURGES, rec.purges);
    record.store_integer(rec_field::EXPUNGES, rec.expunges);
    writer.put_record(&record)
}

fn put_context_vars<S: DumpSink>(
    variables: &[(String, String)],
    object_id: i64,
    is_attachment: bool,
    writer: &mut DumpWriter<'_, S>,
) -> Result<()> {
    for (name, value) in variables {
        let mut record = DumpRecord::new(RelationId::CtxVars.to_u16());
        if is_attachment {
            record.store_integer(ctx_field::ATTACHMENT_ID, object_id);
        } else {
            record.store_integer(ctx_field::TRANSACTION_ID, object_id);
        }
        record.store_string(ctx_field::NAME, name);
        record.store_string(ctx_field::VALUE, value);
        writer.put_record(&record)?;
    }
    Ok(())
}

fn put_memory_usage<S: DumpSink>(
    memory: &MemoryUsage,
    process_id: u32,
    stat_id: u32,
    group: StatGroup,
    writer: &mut DumpWriter<'_, S>,
) -> Result<()> {
    let mut record = DumpRecord::new(RelationId::MemUsage.to_u16());
    record.store_global_id(mem_field::STAT_ID, global_id(process_id, stat_id));
    record.store_integer(mem_field::STAT_GROUP, group as i64);
    record.store_integer(mem_field::USED, memory.current_used);
    record.store_integer(mem_field::ALLOCATED, memory.current_allocated);
    record.store_integer(mem_field::MAX_USED, memory.max_used);
    record.store_integer(mem_field::MAX_ALLOCATED, memory.max_allocated);
    writer.put_record(&record)
}
