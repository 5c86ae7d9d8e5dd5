//! Materialized row buffers for the virtual monitoring relations.
//!
//! Rows live in the engine's native record layout as described by the
//! relation's [`Format`]: a null bitmap followed by fixed-width slots. Text
//! values exceeding a slot's inline capacity spill into [`BlobStore`] blobs
//! whose identifiers occupy the slot instead; blob ownership is re-attached
//! from the materializing request to the snapshot-owning transaction so rows
//! stay readable for the transaction's lifetime.

use std::collections::HashMap;

use monsnap_types::{EngineTimestamp, Format, RelationId, SlotKind};

/// Who currently owns a blob's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobOwner {
    /// Temporary: dies with the materializing request.
    Request,
    /// Bound to the snapshot-owning transaction.
    Transaction,
}

/// Arena of blob values materialized during snapshot assembly.
#[derive(Debug, Default)]
pub struct BlobStore {
    blobs: HashMap<u64, (BlobOwner, Vec<u8>)>,
    next_id: u64,
}

impl BlobStore {
    /// Create a temporary blob owned by the current request.
    pub fn create(&mut self, data: Vec<u8>) -> u64 {
        self.next_id += 1;
        self.blobs.insert(self.next_id, (BlobOwner::Request, data));
        self.next_id
    }

    /// Detach a blob from its request and re-attach it to the transaction.
    pub fn reparent_to_transaction(&mut self, id: u64) {
        if let Some((owner, _)) = self.blobs.get_mut(&id) {
            *owner = BlobOwner::Transaction;
        }
    }

    /// Blob payload, if the id is known.
    #[must_use]
    pub fn data(&self, id: u64) -> Option<&[u8]> {
        self.blobs.get(&id).map(|(_, data)| data.as_slice())
    }

    /// Current owner of a blob.
    #[must_use]
    pub fn owner(&self, id: u64) -> Option<BlobOwner> {
        self.blobs.get(&id).map(|(owner, _)| *owner)
    }

    /// Drop every blob still owned by a request. Called when a request ends;
    /// transaction-owned blobs survive.
    pub fn release_request_blobs(&mut self) {
        self.blobs.retain(|_, (owner, _)| *owner == BlobOwner::Transaction);
    }
}

/// One record under construction, in the relation's native layout.
///
/// Freshly cleared records have every field null (all bitmap bits set) and
/// zeroed slot bytes.
#[derive(Debug, Clone)]
pub struct RowData {
    data: Vec<u8>,
}

impl RowData {
    #[must_use]
    pub fn new(format: &Format) -> Self {
        let mut row = Self {
            data: vec![0; format.byte_len() as usize],
        };
        row.clear(format);
        row
    }

    /// Reset to the all-null state.
    pub fn clear(&mut self, format: &Format) {
        self.data.fill(0);
        let null_bytes = format.null_bytes() as usize;
        self.data[..null_bytes].fill(0xFF);
    }

    fn clear_null(&mut self, field_id: u16) {
        let byte = usize::from(field_id) >> 3;
        let bit = field_id & 7;
        self.data[byte] &= !(1 << bit);
    }

    /// Whether the field is null.
    #[must_use]
    pub fn is_null(&self, field_id: u16) -> bool {
        let byte = usize::from(field_id) >> 3;
        let bit = field_id & 7;
        self.data[byte] & (1 << bit) != 0
    }

    /// Store into an integer slot.
    pub fn set_integer(&mut self, format: &Format, field_id: u16, value: i64) -> bool {
        let Some((offset, slot)) = format.slot(field_id) else {
            return false;
        };
        if !matches!(slot.kind, SlotKind::Integer) {
            return false;
        }
        let at = offset as usize;
        self.data[at..at + 8].copy_from_slice(&value.to_ne_bytes());
        self.clear_null(field_id);
        true
    }

    /// Store into a timestamp slot.
    pub fn set_timestamp(&mut self, format: &Format, field_id: u16, value: EngineTimestamp) -> bool {
        let Some((offset, slot)) = format.slot(field_id) else {
            return false;
        };
        if !matches!(slot.kind, SlotKind::Timestamp) {
            return false;
        }
        let at = offset as usize;
        self.data[at..at + 8].copy_from_slice(&value.to_ne_bytes());
        self.clear_null(field_id);
        true
    }

    /// Store into an inline text slot, truncating at the slot capacity.
    pub fn set_text(&mut self, format: &Format, field_id: u16, bytes: &[u8]) -> bool {
        let Some((offset, slot)) = format.slot(field_id) else {
            return false;
        };
        let SlotKind::Text { max_len, .. } = slot.kind else {
            return false;
        };
        let len = bytes.len().min(usize::from(max_len));
        let at = offset as usize;
        let stored = u16::try_from(len).expect("len bounded by max_len");
        self.data[at..at + 2].copy_from_slice(&stored.to_ne_bytes());
        self.data[at + 2..at + 2 + len].copy_from_slice(&bytes[..len]);
        self.clear_null(field_id);
        true
    }

    /// Store a blob identifier into a blob slot.
    pub fn set_blob_id(&mut self, format: &Format, field_id: u16, blob_id: u64) -> bool {
        let Some((offset, slot)) = format.slot(field_id) else {
            return false;
        };
        if !matches!(slot.kind, SlotKind::Blob { .. }) {
            return false;
        }
        let at = offset as usize;
        self.data[at..at + 8].copy_from_slice(&blob_id.to_ne_bytes());
        self.clear_null(field_id);
        true
    }

    /// Read back an integer or timestamp slot.
    #[must_use]
    pub fn get_i64(&self, format: &Format, field_id: u16) -> Option<i64> {
        if self.is_null(field_id) {
            return None;
        }
        let (offset, slot) = format.slot(field_id)?;
        match slot.kind {
            SlotKind::Integer | SlotKind::Timestamp => {
                let at = offset as usize;
                let bytes: [u8; 8] = self.data[at..at + 8].try_into().ok()?;
                Some(i64::from_ne_bytes(bytes))
            }
            _ => None,
        }
    }

    /// Read back an inline text slot.
    #[must_use]
    pub fn get_text(&self, format: &Format, field_id: u16) -> Option<&[u8]> {
        if self.is_null(field_id) {
            return None;
        }
        let (offset, slot) = format.slot(field_id)?;
        let SlotKind::Text { .. } = slot.kind else {
            return None;
        };
        let at = offset as usize;
        let len_bytes: [u8; 2] = self.data[at..at + 2].try_into().ok()?;
        let len = usize::from(u16::from_ne_bytes(len_bytes));
        Some(&self.data[at + 2..at + 2 + len])
    }

    /// Read back a blob slot's identifier.
    #[must_use]
    pub fn get_blob_id(&self, format: &Format, field_id: u16) -> Option<u64> {
        if self.is_null(field_id) {
            return None;
        }
        let (offset, slot) = format.slot(field_id)?;
        let SlotKind::Blob { .. } = slot.kind else {
            return None;
        };
        let at = offset as usize;
        let bytes: [u8; 8] = self.data[at..at + 8].try_into().ok()?;
        Some(u64::from_ne_bytes(bytes))
    }

    /// Whether any field is non-null.
    #[must_use]
    pub fn has_fields(&self, format: &Format) -> bool {
        (0..format.field_count() as u16).any(|fid| !self.is_null(fid))
    }
}

/// Append-only buffer of materialized rows for one relation.
///
/// Created empty at snapshot construction; rows accumulate during assembly
/// and are served to the engine's virtual-relation scan until the owning
/// transaction ends.
#[derive(Debug)]
pub struct RecordBuffer {
    format: Format,
    rows: Vec<RowData>,
}

impl RecordBuffer {
    #[must_use]
    pub fn new(format: Format) -> Self {
        Self {
            format,
            rows: Vec::new(),
        }
    }

    #[must_use]
    pub const fn format(&self) -> &Format {
        &self.format
    }

    #[must_use]
    pub fn relation(&self) -> RelationId {
        self.format.relation()
    }

    /// Append a materialized row.
    pub fn append(&mut self, row: RowData) {
        self.rows.push(row);
    }

    /// Number of materialized rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Fetch a row by scan position.
    #[must_use]
    pub fn fetch(&self, position: usize) -> Option<&RowData> {
        self.rows.get(position)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use monsnap_types::{att_field, stmt_field, system_format};

    #[test]
    fn fresh_row_is_all_null() {
        let format = system_format(RelationId::Attachments);
        let row = RowData::new(&format);
        for fid in 0..format.field_count() as u16 {
            assert!(row.is_null(fid));
        }
        assert!(!row.has_fields(&format));
    }

    #[test]
    fn integer_and_text_round_trip() {
        let format = system_format(RelationId::Attachments);
        let mut row = RowData::new(&format);

        assert!(row.set_integer(&format, att_field::ID, 42));
        assert!(row.set_text(&format, att_field::USER, b"alice"));

        assert_eq!(row.get_i64(&format, att_field::ID), Some(42));
        assert_eq!(row.get_text(&format, att_field::USER), Some(&b"alice"[..]));
        assert!(row.is_null(att_field::STATE));
    }

    #[test]
    fn kind_mismatch_is_rejected() {
        let format = system_format(RelationId::Attachments);
        let mut row = RowData::new(&format);

        assert!(!row.set_text(&format, att_field::ID, b"nope"));
        assert!(!row.set_integer(&format, att_field::USER, 1));
        assert!(!row.set_integer(&format, 999, 1));
        assert!(row.is_null(att_field::ID));
    }

    #[test]
    fn text_truncates_at_slot_capacity() {
        let format = system_format(RelationId::Attachments);
        let mut row = RowData::new(&format);
        let long = vec![b'x'; 500];
        assert!(row.set_text(&format, att_field::USER, &long));
        assert_eq!(row.get_text(&format, att_field::USER).unwrap().len(), 63);
    }

    #[test]
    fn blob_reparenting() {
        let mut blobs = BlobStore::default();
        let id = blobs.create(b"select * from t".to_vec());
        assert_eq!(blobs.owner(id), Some(BlobOwner::Request));

        blobs.reparent_to_transaction(id);
        assert_eq!(blobs.owner(id), Some(BlobOwner::Transaction));

        // End of the materializing request must not free it.
        blobs.release_request_blobs();
        assert_eq!(blobs.data(id), Some(&b"select * from t"[..]));
    }

    #[test]
    fn request_owned_blobs_die_with_the_request() {
        let mut blobs = BlobStore::default();
        let id = blobs.create(b"temp".to_vec());
        blobs.release_request_blobs();
        assert_eq!(blobs.data(id), None);
    }

    #[test]
    fn blob_slot_round_trip() {
        let format = system_format(RelationId::Statements);
        let mut row = RowData::new(&format);
        assert!(row.set_blob_id(&format, stmt_field::SQL_TEXT, 17));
        assert_eq!(row.get_blob_id(&format, stmt_field::SQL_TEXT), Some(17));
    }

    #[test]
    fn buffer_fetch_by_position() {
        let format = system_format(RelationId::IoStats);
        let mut buffer = RecordBuffer::new(format.clone());
        assert!(buffer.is_empty());

        let mut row = RowData::new(&format);
        row.set_integer(&format, 2, 5);
        buffer.append(row);

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.fetch(0).unwrap().get_i64(&format, 2), Some(5));
        assert!(buffer.fetch(1).is_none());
    }
}
