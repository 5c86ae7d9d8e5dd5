//! End-to-end snapshot rounds across simulated peer processes.
//!
//! Two (or more) `ProcessMonitor`s share one region file and one in-process
//! lock manager, standing in for separate server processes attached to the
//! same database.

use std::collections::HashSet;
use std::sync::Arc;

use monsnap_snapshot::{
    database_sample, AttachmentBody, AttachmentSample, BlobOwner, CallTarget, EngineProcess,
    LocalLockManager, ProcessMonitor, RequestSample, RequesterIdentity, SnapshotAssembler,
    TransactionSample,
};
use monsnap_types::{
    att_field, ctx_field, db_field, io_field, stmt_field, Charset, IoStats, IsoMode, LockManager,
    MemoryUsage, MonState, ProcessOracle, RecStats, RelationId, SystemFormatRegistry,
};
use parking_lot::Mutex;

struct LiveSet(Mutex<HashSet<u32>>);

impl LiveSet {
    fn of(pids: &[u32]) -> Arc<Self> {
        Arc::new(Self(Mutex::new(pids.iter().copied().collect())))
    }
}

impl ProcessOracle for LiveSet {
    fn is_process_alive(&self, pid: u32) -> bool {
        self.0.lock().contains(&pid)
    }
}

fn transaction(id: i64) -> TransactionSample {
    TransactionSample {
        id,
        timestamp: 5_000,
        top: id,
        oldest: 1,
        oldest_active: 1,
        isolation: IsoMode::Concurrency,
        lock_timeout: -1,
        read_only: false,
        auto_commit: false,
        auto_undo: true,
        context_vars: vec![("SESSION_TAG".to_owned(), format!("tra-{id}"))],
        stats: IoStats::default(),
        rec_stats: RecStats::default(),
        memory: MemoryUsage::default(),
    }
}

fn statement(id: i64, transaction_id: i64, sql: &str) -> RequestSample {
    RequestSample {
        id,
        caller: None,
        top_level: true,
        internal: false,
        system_trigger: false,
        state: MonState::Active,
        transaction_id: Some(transaction_id),
        timestamp: 6_000,
        sql_text: Some(sql.to_owned()),
        target: None,
        src_line: 0,
        src_column: 0,
        stats: IoStats::default(),
        rec_stats: RecStats::default(),
        memory: MemoryUsage::default(),
    }
}

fn call_frame(id: i64, caller: usize, transaction_id: i64, routine: &str) -> RequestSample {
    RequestSample {
        id,
        caller: Some(caller),
        top_level: false,
        internal: false,
        system_trigger: false,
        state: MonState::Active,
        transaction_id: Some(transaction_id),
        timestamp: 6_500,
        sql_text: None,
        target: Some(CallTarget::Routine {
            name: routine.to_owned(),
            package: String::new(),
            object_type: 5,
        }),
        src_line: 12,
        src_column: 3,
        stats: IoStats::default(),
        rec_stats: RecStats::default(),
        memory: MemoryUsage::default(),
    }
}

/// A process with one attachment owning one transaction, one running
/// statement and one call frame under it.
fn engine_process(pid: u32, user: &str, attachment_name: &str) -> Arc<EngineProcess> {
    let process = EngineProcess::new(pid, 1, database_sample("db1"));
    let tra_id = i64::from(pid) + 100;
    let stmt_id = i64::from(pid) + 500;
    let body = AttachmentBody {
        transactions: vec![transaction(tra_id)],
        requests: vec![
            statement(stmt_id, tra_id, &format!("select * from t /* {user} */")),
            call_frame(stmt_id + 1, 0, tra_id, &format!("proc_{user}")),
        ],
        context_vars: vec![("CLIENT_APP".to_owned(), user.to_owned())],
    };
    process.add_attachment(Arc::new(AttachmentSample::new(
        i64::from(pid),
        Some(user),
        attachment_name,
        body,
    )));
    Arc::new(process)
}

struct Cluster {
    _dir: tempfile::TempDir,
    monitors: Vec<Arc<ProcessMonitor>>,
}

fn cluster(processes: Vec<Arc<EngineProcess>>, oracle: Arc<LiveSet>) -> Cluster {
    let dir = tempfile::tempdir().expect("tempdir");
    let lock_manager = Arc::new(LocalLockManager::new());
    let monitors = processes
        .into_iter()
        .map(|process| {
            ProcessMonitor::start(
                process,
                dir.path(),
                "db1-file-id",
                Arc::clone(&lock_manager) as Arc<dyn monsnap_types::LockManager>,
                Arc::clone(&oracle) as Arc<dyn ProcessOracle>,
            )
            .expect("monitor start")
        })
        .collect();
    Cluster {
        _dir: dir,
        monitors,
    }
}

fn requester(user: &str, locksmith: bool) -> RequesterIdentity {
    RequesterIdentity {
        database_name: "db1".to_owned(),
        user_name: user.to_owned(),
        locksmith,
        charset: Charset::Utf8,
    }
}

fn attachment_users(snapshot: &SnapshotAssembler) -> Vec<String> {
    let buffer = snapshot.data(RelationId::Attachments);
    let format = buffer.format();
    (0..buffer.len())
        .map(|i| {
            let row = buffer.fetch(i).expect("row");
            String::from_utf8(row.get_text(format, att_field::USER).expect("user").to_vec())
                .expect("utf8")
        })
        .collect()
}

#[test]
fn plain_user_sees_only_its_own_attachment() {
    let oracle = LiveSet::of(&[1000, 2000]);
    let cluster = cluster(
        vec![
            engine_process(1000, "alice", "db1"),
            engine_process(2000, "bob", "db1"),
        ],
        oracle,
    );

    let snapshot = SnapshotAssembler::create(
        &cluster.monitors[0],
        &requester("alice", false),
        &SystemFormatRegistry,
    )
    .expect("snapshot");

    assert_eq!(snapshot.data(RelationId::Database).len(), 1);
    assert_eq!(attachment_users(&snapshot), vec!["alice".to_owned()]);
    assert_eq!(snapshot.data(RelationId::Transactions).len(), 1);
    assert_eq!(snapshot.data(RelationId::Statements).len(), 1);
    assert_eq!(snapshot.data(RelationId::Calls).len(), 1);
    // Attachment-level and transaction-level context variables.
    assert_eq!(snapshot.data(RelationId::CtxVars).len(), 2);
    // Stats children: database + attachment + transaction + call + statement.
    assert_eq!(snapshot.data(RelationId::IoStats).len(), 5);
    assert_eq!(snapshot.data(RelationId::RecStats).len(), 5);
    assert_eq!(snapshot.data(RelationId::MemUsage).len(), 5);
}

#[test]
fn locksmith_sees_every_attachment_and_their_children() {
    let oracle = LiveSet::of(&[1000, 2000]);
    let cluster = cluster(
        vec![
            engine_process(1000, "alice", "db1"),
            engine_process(2000, "bob", "db1"),
        ],
        oracle,
    );

    let snapshot = SnapshotAssembler::create(
        &cluster.monitors[0],
        &requester("alice", true),
        &SystemFormatRegistry,
    )
    .expect("snapshot");

    assert_eq!(snapshot.data(RelationId::Database).len(), 1);
    // Own payload first, so alice's attachment precedes bob's. Bob's rows
    // exist only because the exclusive round forced his process to publish.
    assert_eq!(
        attachment_users(&snapshot),
        vec!["alice".to_owned(), "bob".to_owned()]
    );
    assert_eq!(snapshot.data(RelationId::Transactions).len(), 2);
    assert_eq!(snapshot.data(RelationId::Statements).len(), 2);
    assert_eq!(snapshot.data(RelationId::Calls).len(), 2);
    assert_eq!(snapshot.data(RelationId::CtxVars).len(), 4);
    // Per-database stats are accepted once; each attachment adds four
    // stat-carrying objects.
    assert_eq!(snapshot.data(RelationId::IoStats).len(), 9);
    assert_eq!(snapshot.data(RelationId::RecStats).len(), 9);
    assert_eq!(snapshot.data(RelationId::MemUsage).len(), 9);
}

#[test]
fn mismatched_database_name_filters_everything() {
    let oracle = LiveSet::of(&[1000]);
    let cluster = cluster(vec![engine_process(1000, "alice", "db1")], oracle);

    let mut identity = requester("alice", true);
    identity.database_name = "other-db".to_owned();
    let snapshot =
        SnapshotAssembler::create(&cluster.monitors[0], &identity, &SystemFormatRegistry)
            .expect("snapshot");

    for relation in RelationId::ALL {
        assert!(
            snapshot.data(relation).is_empty(),
            "{relation:?} must be empty for a foreign database"
        );
    }
}

#[test]
fn global_stat_ids_collapse_to_shared_local_ids() {
    let oracle = LiveSet::of(&[1000]);
    let cluster = cluster(vec![engine_process(1000, "alice", "db1")], oracle);

    let snapshot = SnapshotAssembler::create(
        &cluster.monitors[0],
        &requester("alice", false),
        &SystemFormatRegistry,
    )
    .expect("snapshot");

    let db_buffer = snapshot.data(RelationId::Database);
    let db_stat = db_buffer
        .fetch(0)
        .unwrap()
        .get_i64(db_buffer.format(), db_field::STAT_ID)
        .expect("db stat id");

    let io_buffer = snapshot.data(RelationId::IoStats);
    let io_stats: Vec<i64> = (0..io_buffer.len())
        .map(|i| {
            io_buffer
                .fetch(i)
                .unwrap()
                .get_i64(io_buffer.format(), io_field::STAT_ID)
                .expect("io stat id")
        })
        .collect();

    // The database row and its I/O-stats child carry the same 64-bit id in
    // the dump; after collapse they share the same dense local id.
    assert!(io_stats.contains(&db_stat));
    // Dense range 1..=k over five distinct stat-carrying objects.
    let mut sorted = io_stats.clone();
    sorted.sort_unstable();
    sorted.dedup();
    assert_eq!(sorted, vec![1, 2, 3, 4, 5]);
}

#[test]
fn none_charset_session_reads_question_marks_from_metadata_columns() {
    let oracle = LiveSet::of(&[1000]);
    let cluster = cluster(vec![engine_process(1000, "alice", "café")], oracle);

    let mut identity = requester("alice", false);
    identity.charset = Charset::None;
    let snapshot =
        SnapshotAssembler::create(&cluster.monitors[0], &identity, &SystemFormatRegistry)
            .expect("snapshot");

    let buffer = snapshot.data(RelationId::Attachments);
    let row = buffer.fetch(0).expect("attachment row");
    // "café" is 0x63 0x61 0x66 0xC3 0xA9; both UTF-8 bytes of the accent
    // are substituted.
    assert_eq!(
        row.get_text(buffer.format(), att_field::NAME),
        Some(&b"caf??"[..])
    );
    // A session with a proper charset reads the bytes unchanged.
    let snapshot = SnapshotAssembler::create(
        &cluster.monitors[0],
        &requester("alice", false),
        &SystemFormatRegistry,
    )
    .expect("snapshot");
    let buffer = snapshot.data(RelationId::Attachments);
    assert_eq!(
        buffer.fetch(0).unwrap().get_text(buffer.format(), att_field::NAME),
        Some("café".as_bytes())
    );
}

#[test]
fn sql_text_materializes_as_a_transaction_owned_blob() {
    let oracle = LiveSet::of(&[1000]);
    let cluster = cluster(vec![engine_process(1000, "alice", "db1")], oracle);

    let snapshot = SnapshotAssembler::create(
        &cluster.monitors[0],
        &requester("alice", false),
        &SystemFormatRegistry,
    )
    .expect("snapshot");

    let buffer = snapshot.data(RelationId::Statements);
    let row = buffer.fetch(0).expect("statement row");
    let blob_id = row
        .get_blob_id(buffer.format(), stmt_field::SQL_TEXT)
        .expect("sql text blob");

    assert_eq!(
        snapshot.blob(blob_id),
        Some("select * from t /* alice */".as_bytes())
    );
    assert_eq!(snapshot.blob_owner(blob_id), Some(BlobOwner::Transaction));
}

#[test]
fn context_variables_are_tagged_by_owner() {
    let oracle = LiveSet::of(&[1000]);
    let cluster = cluster(vec![engine_process(1000, "alice", "db1")], oracle);

    let snapshot = SnapshotAssembler::create(
        &cluster.monitors[0],
        &requester("alice", false),
        &SystemFormatRegistry,
    )
    .expect("snapshot");

    let buffer = snapshot.data(RelationId::CtxVars);
    let format = buffer.format();
    let attachment_row = buffer.fetch(0).expect("attachment variable");
    assert_eq!(
        attachment_row.get_i64(format, ctx_field::ATTACHMENT_ID),
        Some(1000)
    );
    assert!(attachment_row.get_i64(format, ctx_field::TRANSACTION_ID).is_none());
    assert_eq!(
        attachment_row.get_text(format, ctx_field::NAME),
        Some(&b"CLIENT_APP"[..])
    );

    let transaction_row = buffer.fetch(1).expect("transaction variable");
    assert_eq!(
        transaction_row.get_i64(format, ctx_field::TRANSACTION_ID),
        Some(1100)
    );
    assert!(transaction_row.get_i64(format, ctx_field::ATTACHMENT_ID).is_none());
}

#[test]
fn second_round_still_sees_unregistered_peers_last_contribution() {
    let oracle = LiveSet::of(&[1000, 2000]);
    let cluster = cluster(
        vec![
            engine_process(1000, "alice", "db1"),
            engine_process(2000, "bob", "db1"),
        ],
        oracle,
    );

    let first = SnapshotAssembler::create(
        &cluster.monitors[0],
        &requester("alice", true),
        &SystemFormatRegistry,
    )
    .expect("first snapshot");
    assert_eq!(attachment_users(&first).len(), 2);

    // Bob's process is now "off": it holds no shared lock and will not be
    // notified, but its published contribution is still in the store.
    let second = SnapshotAssembler::create(
        &cluster.monitors[0],
        &requester("alice", true),
        &SystemFormatRegistry,
    )
    .expect("second snapshot");
    assert_eq!(
        attachment_users(&second),
        vec!["alice".to_owned(), "bob".to_owned()]
    );

    // After bob publishes again he re-registers for future rounds.
    cluster.monitors[1].publish().expect("bob republish");
    let third = SnapshotAssembler::create(
        &cluster.monitors[0],
        &requester("alice", true),
        &SystemFormatRegistry,
    )
    .expect("third snapshot");
    assert_eq!(attachment_users(&third).len(), 2);
}

#[test]
fn unresponsive_peer_surfaces_as_a_lock_timeout() {
    let oracle = LiveSet::of(&[1000]);
    let dir = tempfile::tempdir().expect("tempdir");
    let lock_manager = Arc::new(LocalLockManager::new());

    let monitor = ProcessMonitor::start(
        engine_process(1000, "alice", "db1"),
        dir.path(),
        "db1-file-id",
        Arc::clone(&lock_manager) as Arc<dyn monsnap_types::LockManager>,
        oracle as Arc<dyn ProcessOracle>,
    )
    .expect("monitor start");

    // A shared holder that never answers its blocking notification.
    let _stubborn = lock_manager
        .acquire("monitor_db1-file-id", monsnap_types::LockMode::Shared, true, None)
        .expect("stubborn shared holder");

    let err = SnapshotAssembler::create(
        &monitor,
        &requester("alice", false),
        &SystemFormatRegistry,
    )
    .expect_err("exclusive wait must time out");
    assert!(matches!(err, monsnap_error::MonError::LockTimeout));
}

#[test]
fn dead_peer_contribution_disappears_from_the_next_round() {
    let oracle = LiveSet::of(&[1000, 1500, 2000]);
    let cluster = cluster(
        vec![
            engine_process(1000, "alice", "db1"),
            engine_process(1500, "carol", "db1"),
            engine_process(2000, "bob", "db1"),
        ],
        Arc::clone(&oracle),
    );

    let snapshot = SnapshotAssembler::create(
        &cluster.monitors[0],
        &requester("alice", true),
        &SystemFormatRegistry,
    )
    .expect("snapshot");
    assert_eq!(attachment_users(&snapshot).len(), 3);

    // Carol's process dies without cleaning up.
    oracle.0.lock().remove(&1500);

    let snapshot = SnapshotAssembler::create(
        &cluster.monitors[0],
        &requester("alice", true),
        &SystemFormatRegistry,
    )
    .expect("snapshot after death");
    assert_eq!(
        attachment_users(&snapshot),
        vec!["alice".to_owned(), "bob".to_owned()]
    );
}
