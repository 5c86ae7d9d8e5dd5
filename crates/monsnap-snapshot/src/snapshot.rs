//! Snapshot assembly: one round of publish-self, force-peers, read, filter
//! and materialize.
//!
//! The assembler is a single-use object owned by the requesting transaction.
//! Construction drives the whole round; afterwards the materialized row
//! buffers serve the engine's virtual-relation scans until the transaction
//! ends.

use std::collections::HashMap;
use std::sync::Arc;

use monsnap_codec::{DumpField, DumpReader};
use monsnap_error::{MonError, Result};
use monsnap_types::{Charset, FormatRegistry, RelationId, SlotKind, TypeTag};
use tracing::debug;

use crate::buffer::{BlobStore, RecordBuffer, RowData};
use crate::monitor::ProcessMonitor;

/// Identity and privilege of the attachment requesting the snapshot.
#[derive(Debug, Clone)]
pub struct RequesterIdentity {
    /// Resolved database name, UTF-8; compared byte-exact against the dump.
    pub database_name: String,
    /// Authenticated user name.
    pub user_name: String,
    /// A locksmith observes every attachment, not only its own.
    pub locksmith: bool,
    /// Session charset; drives the metadata-column coercion rule.
    pub charset: Charset,
}

/// Collapses snapshot-wide 64-bit identifiers into dense 32-bit local ones.
#[derive(Debug, Default)]
struct LocalIdMap {
    map: HashMap<i64, i32>,
    counter: i32,
}

impl LocalIdMap {
    fn resolve(&mut self, global: i64) -> i32 {
        *self.map.entry(global).or_insert_with(|| {
            self.counter += 1;
            self.counter
        })
    }
}

/// One assembled, filtered monitoring snapshot.
pub struct SnapshotAssembler {
    buffers: Vec<RecordBuffer>,
    blobs: BlobStore,
}

impl SnapshotAssembler {
    /// Drive one full snapshot round for `requester`.
    ///
    /// On any error the partially populated buffers are dropped with the
    /// assembler; the shared store is left as the round wrote it, so the
    /// next round can self-heal.
    pub fn create(
        monitor: &Arc<ProcessMonitor>,
        requester: &RequesterIdentity,
        registry: &dyn FormatRegistry,
    ) -> Result<Self> {
        monitor.process().refresh_header()?;

        let buffers: Vec<RecordBuffer> = RelationId::ALL
            .iter()
            .map(|&relation| RecordBuffer::new(registry.format_for(relation)))
            .collect();

        let dump = monitor.snapshot_round()?;

        let mut assembler = Self {
            buffers,
            blobs: BlobStore::default(),
        };
        assembler.materialize(&dump, requester)?;
        Ok(assembler)
    }

    /// The row buffer backing one monitoring relation's scan.
    #[must_use]
    pub fn data(&self, relation: RelationId) -> &RecordBuffer {
        &self.buffers[buffer_index(relation)]
    }

    /// Resolve a blob identifier stored in a row.
    #[must_use]
    pub fn blob(&self, id: u64) -> Option<&[u8]> {
        self.blobs.data(id)
    }

    /// Owner of a materialized blob (transaction-bound after assembly).
    #[must_use]
    pub fn blob_owner(&self, id: u64) -> Option<crate::buffer::BlobOwner> {
        self.blobs.owner(id)
    }

    /// Decode the dump and materialize the rows the requester may see.
    ///
    /// The filter runs as a small state machine across the record stream:
    /// a database record opens a window when its name matches; an
    /// attachment record within that window opens the child window when the
    /// requester is a locksmith or owns it; every other record type is
    /// accepted only inside both windows.
    fn materialize(&mut self, dump: &[u8], requester: &RequesterIdentity) -> Result<()> {
        let mut reader = DumpReader::new(dump);
        let mut id_map = LocalIdMap::default();

        let mut db_allowed = false;
        let mut att_allowed = false;
        let mut db_emitted = false;

        while let Some(relation_raw) = reader.next_record()? {
            let relation = RelationId::from_u16(relation_raw).ok_or_else(|| {
                MonError::decode(format!("unknown relation id {relation_raw} in dump"))
            })?;
            let index = buffer_index(relation);
            let format = self.buffers[index].format().clone();
            let mut row = RowData::new(&format);
            let mut fields_accepted = false;

            while let Some(field) = reader.next_field()? {
                match relation {
                    RelationId::Database => {
                        if field.field_id == monsnap_types::db_field::NAME {
                            db_allowed = field.data == requester.database_name.as_bytes();
                        }
                        if db_allowed && !db_emitted {
                            self.put_field(&format, &mut row, &field, requester, &mut id_map)?;
                            fields_accepted = true;
                        }
                        // Nothing between this record and its first
                        // attachment may slip through.
                        att_allowed = db_allowed && !db_emitted;
                    }
                    RelationId::Attachments => {
                        if field.field_id == monsnap_types::att_field::USER {
                            att_allowed = requester.locksmith
                                || field.data == requester.user_name.as_bytes();
                        }
                        if db_allowed && att_allowed {
                            self.put_field(&format, &mut row, &field, requester, &mut id_map)?;
                            fields_accepted = true;
                            db_emitted = true;
                        }
                    }
                    _ => {
                        if db_allowed && att_allowed {
                            self.put_field(&format, &mut row, &field, requester, &mut id_map)?;
                            fields_accepted = true;
                            db_emitted = true;
                        }
                    }
                }
            }

            if fields_accepted {
                self.buffers[index].append(row);
            }
        }

        Ok(())
    }

    /// Convert one dump field into its row slot.
    fn put_field(
        &mut self,
        format: &monsnap_types::Format,
        row: &mut RowData,
        field: &DumpField<'_>,
        requester: &RequesterIdentity,
        id_map: &mut LocalIdMap,
    ) -> Result<()> {
        let Some((_, slot)) = format.slot(field.field_id) else {
            // Unknown field id: a newer peer published more than this
            // build's format knows. Skip it.
            debug!(field = field.field_id, "skipping field unknown to the row format");
            return Ok(());
        };

        match field.tag {
            TypeTag::GlobalId => {
                let local = id_map.resolve(field.as_i64()?);
                row.set_integer(format, field.field_id, i64::from(local));
            }
            TypeTag::Integer => {
                row.set_integer(format, field.field_id, field.as_i64()?);
            }
            TypeTag::Timestamp => {
                row.set_timestamp(format, field.field_id, field.as_i64()?);
            }
            TypeTag::String => {
                let target_charset = match slot.kind {
                    SlotKind::Text { charset, .. } | SlotKind::Blob { charset } => charset,
                    _ => {
                        debug!(field = field.field_id, "string value for a non-text slot");
                        return Ok(());
                    }
                };

                // A session without a charset cannot read non-ASCII bytes
                // back out of a metadata column; substitute them up front.
                let coerced: Vec<u8>;
                let bytes: &[u8] = if requester.charset == Charset::None
                    && target_charset == Charset::Metadata
                {
                    coerced = field
                        .data
                        .iter()
                        .map(|&b| if b > 0x7F { b'?' } else { b })
                        .collect();
                    &coerced
                } else {
                    field.data
                };

                match slot.kind {
                    SlotKind::Text { .. } => {
                        row.set_text(format, field.field_id, bytes);
                    }
                    SlotKind::Blob { .. } => {
                        // Materialized under the current request, then bound
                        // to the snapshot-owning transaction so the row
                        // outlives the request.
                        let blob_id = self.blobs.create(bytes.to_vec());
                        self.blobs.reparent_to_transaction(blob_id);
                        row.set_blob_id(format, field.field_id, blob_id);
                    }
                    _ => unreachable!("target charset filtered non-text slots"),
                }
            }
        }

        Ok(())
    }
}

impl std::fmt::Debug for SnapshotAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotAssembler")
            .field(
                "rows",
                &self
                    .buffers
                    .iter()
                    .map(|b| (b.relation(), b.len()))
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

fn buffer_index(relation: RelationId) -> usize {
    RelationId::ALL
        .iter()
        .position(|&r| r == relation)
        .expect("every relation has a buffer")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_id_map_is_dense_and_stable() {
        let mut map = LocalIdMap::default();
        let a = 0x0000_0BB8_0000_0001_i64;
        let b = 0x0000_0FA0_0000_0001_i64;

        assert_eq!(map.resolve(a), 1);
        assert_eq!(map.resolve(a), 1);
        assert_eq!(map.resolve(b), 2);
        assert_eq!(map.resolve(a), 1);
        assert_eq!(map.resolve(b), 2);
    }

    #[test]
    fn buffer_index_covers_all_relations() {
        for (i, &relation) in RelationId::ALL.iter().enumerate() {
            assert_eq!(buffer_index(relation), i);
        }
    }
}
