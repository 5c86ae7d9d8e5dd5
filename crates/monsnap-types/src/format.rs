//! Row format descriptors for the virtual monitoring relations.
//!
//! A `Format` pins down the native record layout the snapshot materializes
//! into: a null bitmap followed by fixed-width slots, one per field. Text
//! fields are stored inline up to a declared capacity; longer values spill
//! into blobs whose 8-byte identifiers live in the slot instead.

use crate::ids::{
    att_field, call_field, ctx_field, db_field, io_field, mem_field, rec_field, stmt_field,
    tra_field, RelationId,
};

/// Character set of a text slot or of an attachment session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Charset {
    /// No declared charset; bytes pass through uninterpreted.
    None,
    /// Seven-bit ASCII.
    Ascii,
    /// The engine's metadata charset (ASCII-compatible, system objects).
    Metadata,
    /// UTF-8.
    Utf8,
}

/// Kind and width of one record slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Native 64-bit signed integer, 8 bytes.
    Integer,
    /// Native engine timestamp, 8 bytes.
    Timestamp,
    /// Inline text: 2-byte length prefix plus `max_len` bytes of payload.
    Text { max_len: u16, charset: Charset },
    /// Blob reference: 8-byte blob identifier.
    Blob { charset: Charset },
}

impl SlotKind {
    /// Fixed byte width of this slot inside a record.
    #[must_use]
    pub const fn byte_len(self) -> u32 {
        match self {
            Self::Integer | Self::Timestamp => 8,
            Self::Text { max_len, .. } => 2 + max_len as u32,
            Self::Blob { .. } => 8,
        }
    }
}

/// One field of a relation format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSlot {
    pub id: u16,
    pub kind: SlotKind,
}

/// Record layout descriptor for one monitoring relation.
///
/// Slot offsets are computed once at construction:
///
/// ```text
/// [ null bitmap: (n+7)/8 bytes | slot 0 | slot 1 | ... | slot n-1 ]
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    relation: RelationId,
    slots: Vec<FieldSlot>,
    offsets: Vec<u32>,
    byte_len: u32,
}

impl Format {
    /// Build a format from an ordered slot list.
    ///
    /// Slot positions are indexed by field id: slot `i` must carry field id
    /// `i`, matching how the engine metadata numbers the relation's fields.
    #[must_use]
    pub fn new(relation: RelationId, slots: Vec<FieldSlot>) -> Self {
        debug_assert!(
            slots.iter().enumerate().all(|(i, s)| s.id as usize == i),
            "format slots must be dense and ordered by field id"
        );
        let null_bytes = (slots.len() as u32 + 7) / 8;
        let mut offsets = Vec::with_capacity(slots.len());
        let mut at = null_bytes;
        for slot in &slots {
            offsets.push(at);
            at += slot.kind.byte_len();
        }
        Self {
            relation,
            slots,
            offsets,
            byte_len: at,
        }
    }

    /// The relation this format describes.
    #[must_use]
    pub const fn relation(&self) -> RelationId {
        self.relation
    }

    /// Number of fields.
    #[must_use]
    pub fn field_count(&self) -> usize {
        self.slots.len()
    }

    /// Total record byte length (null bitmap included).
    #[must_use]
    pub const fn byte_len(&self) -> u32 {
        self.byte_len
    }

    /// Byte length of the leading null bitmap.
    #[must_use]
    pub fn null_bytes(&self) -> u32 {
        (self.slots.len() as u32 + 7) / 8
    }

    /// Look up a slot and its record offset by field id.
    ///
    /// Unknown field ids return `None`; the snapshot skips such fields, as
    /// the engine does for fields added by newer peers.
    #[must_use]
    pub fn slot(&self, field_id: u16) -> Option<(u32, FieldSlot)> {
        let idx = field_id as usize;
        let slot = self.slots.get(idx)?;
        Some((self.offsets[idx], *slot))
    }
}

const fn int(id: u16) -> FieldSlot {
    FieldSlot {
        id,
        kind: SlotKind::Integer,
    }
}

const fn ts(id: u16) -> FieldSlot {
    FieldSlot {
        id,
        kind: SlotKind::Timestamp,
    }
}

const fn text(id: u16, max_len: u16, charset: Charset) -> FieldSlot {
    FieldSlot {
        id,
        kind: SlotKind::Text { max_len, charset },
    }
}

const fn blob(id: u16, charset: Charset) -> FieldSlot {
    FieldSlot {
        id,
        kind: SlotKind::Blob { charset },
    }
}

/// The engine's current format for one monitoring relation.
///
/// The metadata system is authoritative for these layouts; this function is
/// the rendered form the snapshot consumes.
#[must_use]
pub fn system_format(relation: RelationId) -> Format {
    use Charset::{Metadata, Utf8};
    match relation {
        RelationId::Database => Format::new(
            relation,
            vec![
                text(db_field::NAME, 255, Metadata),
                int(db_field::PAGE_SIZE),
                int(db_field::ODS_MAJOR),
                int(db_field::ODS_MINOR),
                int(db_field::OLDEST_TRANSACTION),
                int(db_field::OLDEST_ACTIVE),
                int(db_field::OLDEST_SNAPSHOT),
                int(db_field::NEXT_TRANSACTION),
                int(db_field::PAGE_BUFFERS),
                int(db_field::DIALECT),
                int(db_field::SHUTDOWN_MODE),
                int(db_field::SWEEP_INTERVAL),
                int(db_field::READ_ONLY),
                int(db_field::FORCED_WRITES),
                int(db_field::RESERVE_SPACE),
                ts(db_field::CREATED),
                int(db_field::PAGES),
                int(db_field::BACKUP_STATE),
                int(db_field::STAT_ID),
            ],
        ),
        RelationId::Attachments => Format::new(
            relation,
            vec![
                text(att_field::USER, 63, Metadata),
                int(att_field::ID),
                int(att_field::SERVER_PID),
                int(att_field::STATE),
                text(att_field::NAME, 255, Metadata),
                text(att_field::ROLE, 63, Metadata),
                text(att_field::REMOTE_PROTOCOL, 15, Metadata),
                text(att_field::REMOTE_ADDRESS, 255, Metadata),
                int(att_field::REMOTE_PID),
                text(att_field::REMOTE_PROCESS, 255, Metadata),
                int(att_field::CHARSET_ID),
                ts(att_field::TIMESTAMP),
                int(att_field::GARBAGE_COLLECTION),
                int(att_field::STAT_ID),
            ],
        ),
        RelationId::Transactions => Format::new(
            relation,
            vec![
                int(tra_field::ID),
                int(tra_field::ATTACHMENT_ID),
                int(tra_field::STATE),
                ts(tra_field::TIMESTAMP),
                int(tra_field::TOP),
                int(tra_field::OLDEST_TRANSACTION),
                int(tra_field::OLDEST_ACTIVE),
                int(tra_field::ISOLATION_MODE),
                int(tra_field::LOCK_TIMEOUT),
                int(tra_field::READ_ONLY),
                int(tra_field::AUTO_COMMIT),
                int(tra_field::AUTO_UNDO),
                int(tra_field::STAT_ID),
            ],
        ),
        RelationId::Statements => Format::new(
            relation,
            vec![
                int(stmt_field::ID),
                int(stmt_field::ATTACHMENT_ID),
                int(stmt_field::STATE),
                int(stmt_field::TRANSACTION_ID),
                ts(stmt_field::TIMESTAMP),
                blob(stmt_field::SQL_TEXT, Utf8),
                int(stmt_field::STAT_ID),
            ],
        ),
        RelationId::Calls => Format::new(
            relation,
            vec![
                int(call_field::ID),
                int(call_field::STATEMENT_ID),
                int(call_field::CALLER_ID),
                text(call_field::NAME, 63, Metadata),
                text(call_field::PACKAGE_NAME, 63, Metadata),
                int(call_field::OBJECT_TYPE),
                ts(call_field::TIMESTAMP),
                int(call_field::SRC_LINE),
                int(call_field::SRC_COLUMN),
                int(call_field::STAT_ID),
            ],
        ),
        RelationId::IoStats => Format::new(
            relation,
            vec![
                int(io_field::STAT_ID),
                int(io_field::STAT_GROUP),
                int(io_field::PAGE_READS),
                int(io_field::PAGE_WRITES),
                int(io_field::PAGE_FETCHES),
                int(io_field::PAGE_MARKS),
            ],
        ),
        RelationId::RecStats => Format::new(
            relation,
            vec![
                int(rec_field::STAT_ID),
                int(rec_field::STAT_GROUP),
                int(rec_field::SEQ_READS),
                int(rec_field::IDX_READS),
                int(rec_field::INSERTS),
                int(rec_field::UPDATES),
                int(rec_field::DELETES),
                int(rec_field::BACKOUTS),
                int(rec_field::PURGES),
                int(rec_field::EXPUNGES),
            ],
        ),
        RelationId::CtxVars => Format::new(
            relation,
            vec![
                int(ctx_field::ATTACHMENT_ID),
                int(ctx_field::TRANSACTION_ID),
                text(ctx_field::NAME, 80, Utf8),
                text(ctx_field::VALUE, 255, Utf8),
            ],
        ),
        RelationId::MemUsage => Format::new(
            relation,
            vec![
                int(mem_field::STAT_ID),
                int(mem_field::STAT_GROUP),
                int(mem_field::USED),
                int(mem_field::ALLOCATED),
                int(mem_field::MAX_USED),
                int(mem_field::MAX_ALLOCATED),
            ],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::stmt_field;

    #[test]
    fn slot_widths() {
        assert_eq!(SlotKind::Integer.byte_len(), 8);
        assert_eq!(SlotKind::Timestamp.byte_len(), 8);
        assert_eq!(
            SlotKind::Text {
                max_len: 63,
                charset: Charset::Metadata
            }
            .byte_len(),
            65
        );
        assert_eq!(
            SlotKind::Blob {
                charset: Charset::Utf8
            }
            .byte_len(),
            8
        );
    }

    #[test]
    fn format_offsets_are_contiguous() {
        let fmt = system_format(RelationId::IoStats);
        assert_eq!(fmt.field_count(), 6);
        assert_eq!(fmt.null_bytes(), 1);
        // Six integer slots after a one-byte bitmap.
        for i in 0..6_u16 {
            let (offset, slot) = fmt.slot(i).expect("slot present");
            assert_eq!(offset, 1 + u32::from(i) * 8);
            assert_eq!(slot.kind, SlotKind::Integer);
        }
        assert_eq!(fmt.byte_len(), 1 + 6 * 8);
    }

    #[test]
    fn unknown_field_is_skipped() {
        let fmt = system_format(RelationId::MemUsage);
        assert!(fmt.slot(99).is_none());
    }

    #[test]
    fn statements_sql_text_is_a_blob() {
        let fmt = system_format(RelationId::Statements);
        let (_, slot) = fmt.slot(stmt_field::SQL_TEXT).expect("sql text slot");
        assert!(matches!(
            slot.kind,
            SlotKind::Blob {
                charset: Charset::Utf8
            }
        ));
    }

    #[test]
    fn every_relation_has_a_system_format() {
        for rel in RelationId::ALL {
            let fmt = system_format(rel);
            assert_eq!(fmt.relation(), rel);
            assert!(fmt.byte_len() > fmt.null_bytes());
        }
    }
}
