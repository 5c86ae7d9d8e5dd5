//! Numeric identifiers of the virtual monitoring relations and their fields.
//!
//! The engine's metadata system owns the row layouts; the identifiers here
//! are the stable wire values used inside the dump stream.

/// Identifier of a virtual monitoring relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RelationId {
    Database,
    Attachments,
    Transactions,
    Statements,
    Calls,
    IoStats,
    RecStats,
    CtxVars,
    MemUsage,
}

impl RelationId {
    /// All monitoring relations, in materialization order.
    pub const ALL: [Self; 9] = [
        Self::Database,
        Self::Attachments,
        Self::Transactions,
        Self::Statements,
        Self::Calls,
        Self::IoStats,
        Self::RecStats,
        Self::CtxVars,
        Self::MemUsage,
    ];

    /// Wire discriminant value.
    #[must_use]
    pub const fn to_u16(self) -> u16 {
        match self {
            Self::Database => 1,
            Self::Attachments => 2,
            Self::Transactions => 3,
            Self::Statements => 4,
            Self::Calls => 5,
            Self::IoStats => 6,
            Self::RecStats => 7,
            Self::CtxVars => 8,
            Self::MemUsage => 9,
        }
    }

    /// Parse wire discriminant; `None` for unknown relations.
    #[must_use]
    pub const fn from_u16(v: u16) -> Option<Self> {
        match v {
            1 => Some(Self::Database),
            2 => Some(Self::Attachments),
            3 => Some(Self::Transactions),
            4 => Some(Self::Statements),
            5 => Some(Self::Calls),
            6 => Some(Self::IoStats),
            7 => Some(Self::RecStats),
            8 => Some(Self::CtxVars),
            9 => Some(Self::MemUsage),
            _ => None,
        }
    }
}

/// Field identifiers of the database relation.
///
/// `NAME` must stay the first field emitted so the snapshot filter can decide
/// acceptance before materializing the rest of the record.
pub mod db_field {
    pub const NAME: u16 = 0;
    pub const PAGE_SIZE: u16 = 1;
    pub const ODS_MAJOR: u16 = 2;
    pub const ODS_MINOR: u16 = 3;
    pub const OLDEST_TRANSACTION: u16 = 4;
    pub const OLDEST_ACTIVE: u16 = 5;
    pub const OLDEST_SNAPSHOT: u16 = 6;
    pub const NEXT_TRANSACTION: u16 = 7;
    pub const PAGE_BUFFERS: u16 = 8;
    pub const DIALECT: u16 = 9;
    pub const SHUTDOWN_MODE: u16 = 10;
    pub const SWEEP_INTERVAL: u16 = 11;
    pub const READ_ONLY: u16 = 12;
    pub const FORCED_WRITES: u16 = 13;
    pub const RESERVE_SPACE: u16 = 14;
    pub const CREATED: u16 = 15;
    pub const PAGES: u16 = 16;
    pub const BACKUP_STATE: u16 = 17;
    pub const STAT_ID: u16 = 18;
}

/// Field identifiers of the attachments relation.
///
/// `USER` must stay the first field emitted (filter prerequisite).
pub mod att_field {
    pub const USER: u16 = 0;
    pub const ID: u16 = 1;
    pub const SERVER_PID: u16 = 2;
    pub const STATE: u16 = 3;
    pub const NAME: u16 = 4;
    pub const ROLE: u16 = 5;
    pub const REMOTE_PROTOCOL: u16 = 6;
    pub const REMOTE_ADDRESS: u16 = 7;
    pub const REMOTE_PID: u16 = 8;
    pub const REMOTE_PROCESS: u16 = 9;
    pub const CHARSET_ID: u16 = 10;
    pub const TIMESTAMP: u16 = 11;
    pub const GARBAGE_COLLECTION: u16 = 12;
    pub const STAT_ID: u16 = 13;
}

/// Field identifiers of the transactions relation.
pub mod tra_field {
    pub const ID: u16 = 0;
    pub const ATTACHMENT_ID: u16 = 1;
    pub const STATE: u16 = 2;
    pub const TIMESTAMP: u16 = 3;
    pub const TOP: u16 = 4;
    pub const OLDEST_TRANSACTION: u16 = 5;
    pub const OLDEST_ACTIVE: u16 = 6;
    pub const ISOLATION_MODE: u16 = 7;
    pub const LOCK_TIMEOUT: u16 = 8;
    pub const READ_ONLY: u16 = 9;
    pub const AUTO_COMMIT: u16 = 10;
    pub const AUTO_UNDO: u16 = 11;
    pub const STAT_ID: u16 = 12;
}

/// Field identifiers of the statements relation.
pub mod stmt_field {
    pub const ID: u16 = 0;
    pub const ATTACHMENT_ID: u16 = 1;
    pub const STATE: u16 = 2;
    pub const TRANSACTION_ID: u16 = 3;
    pub const TIMESTAMP: u16 = 4;
    pub const SQL_TEXT: u16 = 5;
    pub const STAT_ID: u16 = 6;
}

/// Field identifiers of the call-stack relation.
pub mod call_field {
    pub const ID: u16 = 0;
    pub const STATEMENT_ID: u16 = 1;
    pub const CALLER_ID: u16 = 2;
    pub const NAME: u16 = 3;
    pub const PACKAGE_NAME: u16 = 4;
    pub const OBJECT_TYPE: u16 = 5;
    pub const TIMESTAMP: u16 = 6;
    pub const SRC_LINE: u16 = 7;
    pub const SRC_COLUMN: u16 = 8;
    pub const STAT_ID: u16 = 9;
}

/// Field identifiers of the physical I/O statistics relation.
pub mod io_field {
    pub const STAT_ID: u16 = 0;
    pub const STAT_GROUP: u16 = 1;
    pub const PAGE_READS: u16 = 2;
    pub const PAGE_WRITES: u16 = 3;
    pub const PAGE_FETCHES: u16 = 4;
    pub const PAGE_MARKS: u16 = 5;
}

/// Field identifiers of the record-level statistics relation.
pub mod rec_field {
    pub const STAT_ID: u16 = 0;
    pub const STAT_GROUP: u16 = 1;
    pub const SEQ_READS: u16 = 2;
    pub const IDX_READS: u16 = 3;
    pub const INSERTS: u16 = 4;
    pub const UPDATES: u16 = 5;
    pub const DELETES: u16 = 6;
    pub const BACKOUTS: u16 = 7;
    pub const PURGES: u16 = 8;
    pub const EXPUNGES: u16 = 9;
}

/// Field identifiers of the context-variables relation.
pub mod ctx_field {
    pub const ATTACHMENT_ID: u16 = 0;
    pub const TRANSACTION_ID: u16 = 1;
    pub const NAME: u16 = 2;
    pub const VALUE: u16 = 3;
}

/// Field identifiers of the memory-usage relation.
pub mod mem_field {
    pub const STAT_ID: u16 = 0;
    pub const STAT_GROUP: u16 = 1;
    pub const USED: u16 = 2;
    pub const ALLOCATED: u16 = 3;
    pub const MAX_USED: u16 = 4;
    pub const MAX_ALLOCATED: u16 = 5;
}
