//! Self-describing record/field serialization for the monitoring dump.
//!
//! Every process publishes its telemetry as a flat byte stream of records
//! with no external schema. The on-wire layout (all integers little-endian):
//!
//! ```text
//! record   := [0xA5][relation_id: u16][field*][0x00]
//! field    := [type_tag: u8 (1..=4)][field_id: u16][length: u16][payload]
//! ```
//!
//! Records concatenate without separators. The store pads element payloads
//! with zero bytes up to its alignment quantum; the reader skips any run of
//! zero bytes between records. Truncated or malformed input fails loudly
//! with [`MonError::DecodeFailure`]: a bad dump aborts the snapshot rather
//! than yielding partial rows.

use monsnap_error::{MonError, Result};
use monsnap_types::{EngineTimestamp, TypeTag};

/// Start-of-record marker. Must be nonzero so it can never be mistaken for
/// inter-record padding.
pub const RECORD_MARKER: u8 = 0xA5;

/// End-of-record marker.
pub const END_MARKER: u8 = 0x00;

/// Byte length of an encoded field header: tag(1) + field_id(2) + length(2).
const FIELD_HEADER_BYTES: usize = 5;

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Builder for one dump record.
///
/// Fields are appended in emission order; the order is significant for the
/// snapshot filter (the database name and attachment user fields must come
/// first in their respective records).
#[derive(Debug, Clone)]
pub struct DumpRecord {
    relation_id: u16,
    body: Vec<u8>,
}

impl DumpRecord {
    /// Start a record for `relation_id`.
    #[must_use]
    pub fn new(relation_id: u16) -> Self {
        Self {
            relation_id,
            body: Vec::new(),
        }
    }

    /// Clear the record and retarget it at another relation.
    pub fn reset(&mut self, relation_id: u16) {
        self.relation_id = relation_id;
        self.body.clear();
    }

    /// The relation this record belongs to.
    #[must_use]
    pub const fn relation_id(&self) -> u16 {
        self.relation_id
    }

    /// Number of encoded body bytes so far.
    #[must_use]
    pub fn body_len(&self) -> usize {
        self.body.len()
    }

    /// Append an 8-byte signed integer field.
    pub fn store_integer(&mut self, field_id: u16, value: i64) {
        self.store_raw(field_id, TypeTag::Integer, &value.to_le_bytes());
    }

    /// Append an 8-byte engine timestamp field.
    pub fn store_timestamp(&mut self, field_id: u16, value: EngineTimestamp) {
        self.store_raw(field_id, TypeTag::Timestamp, &value.to_le_bytes());
    }

    /// Append a `(pid << 32) | counter` composite identifier field.
    pub fn store_global_id(&mut self, field_id: u16, value: i64) {
        self.store_raw(field_id, TypeTag::GlobalId, &value.to_le_bytes());
    }

    /// Append a UTF-8 string field (no terminator).
    ///
    /// Payload length is capped at `u16::MAX` bytes; longer values are cut at
    /// the last character boundary that fits.
    pub fn store_string(&mut self, field_id: u16, value: &str) {
        let mut bytes = value.as_bytes();
        if bytes.len() > usize::from(u16::MAX) {
            let mut cut = usize::from(u16::MAX);
            while cut > 0 && !value.is_char_boundary(cut) {
                cut -= 1;
            }
            bytes = &bytes[..cut];
        }
        self.store_raw(field_id, TypeTag::String, bytes);
    }

    fn store_raw(&mut self, field_id: u16, tag: TypeTag, payload: &[u8]) {
        debug_assert!(payload.len() <= usize::from(u16::MAX));
        self.body.push(tag.to_u8());
        self.body.extend_from_slice(&field_id.to_le_bytes());
        let len = payload.len() as u16;
        self.body.extend_from_slice(&len.to_le_bytes());
        self.body.extend_from_slice(payload);
    }

    /// Encode the framed record: marker, relation id, fields, end marker.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.body.len());
        out.push(RECORD_MARKER);
        out.extend_from_slice(&self.relation_id.to_le_bytes());
        out.extend_from_slice(&self.body);
        out.push(END_MARKER);
        out
    }
}

/// Destination for encoded records.
///
/// The shared-memory store implements this through its element-append
/// operation; tests use a plain byte vector.
pub trait DumpSink {
    /// Append raw encoded bytes to the dump.
    fn put(&mut self, bytes: &[u8]) -> Result<()>;
}

impl DumpSink for Vec<u8> {
    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Streams framed records into a [`DumpSink`].
#[derive(Debug)]
pub struct DumpWriter<'a, S: DumpSink> {
    sink: &'a mut S,
}

impl<'a, S: DumpSink> DumpWriter<'a, S> {
    pub fn new(sink: &'a mut S) -> Self {
        Self { sink }
    }

    /// Frame and append one record.
    pub fn put_record(&mut self, record: &DumpRecord) -> Result<()> {
        self.sink.put(&record.to_bytes())
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// One decoded field, borrowing its payload from the dump buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpField<'a> {
    pub field_id: u16,
    pub tag: TypeTag,
    pub data: &'a [u8],
}

impl<'a> DumpField<'a> {
    /// Decode an 8-byte integer/timestamp/global-id payload.
    pub fn as_i64(&self) -> Result<i64> {
        let bytes: [u8; 8] = self
            .data
            .try_into()
            .map_err(|_| MonError::decode(format!("field {} is not 8 bytes", self.field_id)))?;
        Ok(i64::from_le_bytes(bytes))
    }

    /// Borrow a string payload, validating UTF-8.
    pub fn as_str(&self) -> Result<&'a str> {
        std::str::from_utf8(self.data)
            .map_err(|_| MonError::decode(format!("field {} is not valid UTF-8", self.field_id)))
    }
}

/// Lazy cursor over a dump buffer.
///
/// Usage: `next_record` positions the cursor at a record and yields its
/// relation id; `next_field` then yields that record's fields until it
/// returns `None`. Calling `next_record` with fields still pending skips the
/// remainder of the current record.
#[derive(Debug)]
pub struct DumpReader<'a> {
    buf: &'a [u8],
    pos: usize,
    in_record: bool,
}

impl<'a> DumpReader<'a> {
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            in_record: false,
        }
    }

    /// Advance to the next record. Returns its relation id, or `None` once
    /// the buffer is exhausted.
    pub fn next_record(&mut self) -> Result<Option<u16>> {
        if self.in_record {
            while self.next_field()?.is_some() {}
        }

        // Alignment padding between elements is zero filled; skip it.
        while self.pos < self.buf.len() && self.buf[self.pos] == END_MARKER {
            self.pos += 1;
        }
        if self.pos == self.buf.len() {
            return Ok(None);
        }

        if self.buf[self.pos] != RECORD_MARKER {
            return Err(MonError::decode(format!(
                "expected record marker at offset {}, found {:#04x}",
                self.pos, self.buf[self.pos]
            )));
        }
        self.pos += 1;

        let relation_id = self
            .take(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]))
            .ok_or_else(|| MonError::decode("record header truncated"))?;
        self.in_record = true;
        Ok(Some(relation_id))
    }

    /// Yield the next field of the current record, or `None` at the record's
    /// end marker.
    pub fn next_field(&mut self) -> Result<Option<DumpField<'a>>> {
        if !self.in_record {
            return Ok(None);
        }

        let tag_byte = *self
            .buf
            .get(self.pos)
            .ok_or_else(|| MonError::decode("record not terminated"))?;
        if tag_byte == END_MARKER {
            self.pos += 1;
            self.in_record = false;
            return Ok(None);
        }

        let tag = TypeTag::from_u8(tag_byte).ok_or_else(|| {
            MonError::decode(format!(
                "unknown field type tag {tag_byte:#04x} at offset {}",
                self.pos
            ))
        })?;
        let header = self
            .peek(FIELD_HEADER_BYTES)
            .ok_or_else(|| MonError::decode("field header truncated"))?;
        let field_id = u16::from_le_bytes([header[1], header[2]]);
        let length = usize::from(u16::from_le_bytes([header[3], header[4]]));
        self.pos += FIELD_HEADER_BYTES;

        let data = self.take(length).ok_or_else(|| {
            MonError::decode(format!("field {field_id} payload truncated ({length} bytes)"))
        })?;

        Ok(Some(DumpField {
            field_id,
            tag,
            data,
        }))
    }

    fn peek(&self, n: usize) -> Option<&'a [u8]> {
        self.buf.get(self.pos..self.pos + n)
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        let out = self.buf.get(self.pos..self.pos + n)?;
        self.pos += n;
        Some(out)
    }
}
