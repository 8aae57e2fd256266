#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Shard wire format.
//!
//! A shard is a concatenation of frames, little-endian throughout:
//!
//! ```text
//! u32 payload_len | u32 crc32(payload_len bytes) | payload | u32 crc32(payload)
//! ```
//!
//! A payload is a sequence of named fields:
//!
//! ```text
//! u16 name_len | name (utf-8) | u32 value_count | value_count x f32
//! ```
//!
//! Framing damage (truncation, checksum mismatch, oversized length) makes the
//! rest of the shard unreadable; a well-framed payload whose fields do not
//! match the run schema is an error for that record only.

use std::collections::HashSet;
use std::io::Read;

use thiserror::Error;

use tp_core::mode::SchemaDescriptor;
use tp_core::record::RawRecord;

/// Upper bound on a single frame payload; anything larger is treated as a
/// corrupted length word. The largest real record (large mode) is under 6 MiB.
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    /// The shard byte stream is unreadable from this point on.
    #[error("shard corrupt: {reason}")]
    Corrupt { reason: String },
    /// One well-framed record does not match the run schema.
    #[error("bad record: {reason}")]
    BadRecord { reason: String },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// True when the error poisons the whole shard, not just one record.
    pub fn is_total_loss(&self) -> bool {
        matches!(self, WireError::Corrupt { .. } | WireError::Io(_))
    }

    fn corrupt(reason: impl Into<String>) -> Self {
        WireError::Corrupt {
            reason: reason.into(),
        }
    }

    fn bad_record(reason: impl Into<String>) -> Self {
        WireError::BadRecord {
            reason: reason.into(),
        }
    }
}

/// Pull-based streaming decoder. One record is fully materialized, yielded,
/// and dropped before the next frame is read.
pub struct RecordStream<R: Read> {
    reader: R,
    expected_fields: HashSet<String>,
    cells: usize,
    done: bool,
}

impl<R: Read> RecordStream<R> {
    pub fn new(reader: R, schema: &SchemaDescriptor) -> Self {
        Self {
            reader,
            expected_fields: schema.field_names().into_iter().collect(),
            cells: schema.cells(),
            done: false,
        }
    }

    /// Yields the next record, `Ok(None)` at a clean end of stream.
    ///
    /// A `BadRecord` error consumes only the offending frame; the stream can
    /// be pulled again. `Corrupt` and `Io` errors end the stream.
    pub fn next_record(&mut self) -> Result<Option<RawRecord>, WireError> {
        if self.done {
            return Ok(None);
        }

        let payload = match self.read_frame() {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                self.done = true;
                return Ok(None);
            }
            Err(err) => {
                self.done = true;
                return Err(err);
            }
        };

        match parse_payload(&payload, &self.expected_fields, self.cells) {
            Ok(record) => Ok(Some(record)),
            Err(err) => Err(err),
        }
    }

    fn read_frame(&mut self) -> Result<Option<Vec<u8>>, WireError> {
        let mut len_bytes = [0u8; 4];
        if !read_full_or_clean_eof(&mut self.reader, &mut len_bytes)? {
            return Ok(None);
        }

        let mut len_crc = [0u8; 4];
        self.reader
            .read_exact(&mut len_crc)
            .map_err(|_| WireError::corrupt("truncated frame (length checksum)"))?;
        if crc32fast::hash(&len_bytes) != u32::from_le_bytes(len_crc) {
            return Err(WireError::corrupt("length checksum mismatch"));
        }

        let len = u32::from_le_bytes(len_bytes);
        if len > MAX_PAYLOAD_LEN {
            return Err(WireError::corrupt(format!(
                "payload length {len} exceeds cap {MAX_PAYLOAD_LEN}"
            )));
        }

        let mut payload = vec![0u8; len as usize];
        self.reader
            .read_exact(&mut payload)
            .map_err(|_| WireError::corrupt("truncated frame (payload)"))?;

        let mut payload_crc = [0u8; 4];
        self.reader
            .read_exact(&mut payload_crc)
            .map_err(|_| WireError::corrupt("truncated frame (payload checksum)"))?;
        if crc32fast::hash(&payload) != u32::from_le_bytes(payload_crc) {
            return Err(WireError::corrupt("payload checksum mismatch"));
        }

        Ok(Some(payload))
    }
}

/// Reads the full buffer, distinguishing a clean end of stream (zero bytes
/// available, returns `false`) from a frame cut off mid-word.
fn read_full_or_clean_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, WireError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                if filled == 0 {
                    return Ok(false);
                }
                return Err(WireError::corrupt("truncated frame (length)"));
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(WireError::Io(err)),
        }
    }
    Ok(true)
}

fn parse_payload(
    payload: &[u8],
    expected_fields: &HashSet<String>,
    cells: usize,
) -> Result<RawRecord, WireError> {
    let mut record = RawRecord::default();
    let mut pos = 0usize;

    while pos < payload.len() {
        let name_len = read_u16(payload, &mut pos)
            .ok_or_else(|| WireError::bad_record("truncated field name length"))?
            as usize;
        let name_bytes = take(payload, &mut pos, name_len)
            .ok_or_else(|| WireError::bad_record("truncated field name"))?;
        let name = std::str::from_utf8(name_bytes)
            .map_err(|_| WireError::bad_record("field name is not utf-8"))?;

        if !expected_fields.contains(name) {
            return Err(WireError::bad_record(format!("unknown field {name:?}")));
        }
        if record.field(name).is_some() {
            return Err(WireError::bad_record(format!("duplicate field {name:?}")));
        }

        let count = read_u32(payload, &mut pos)
            .ok_or_else(|| WireError::bad_record("truncated field count"))?
            as usize;
        if count != cells {
            return Err(WireError::bad_record(format!(
                "field {name:?} has {count} elements, expected {cells}"
            )));
        }

        let value_bytes = take(payload, &mut pos, count * 4)
            .ok_or_else(|| WireError::bad_record(format!("truncated values for field {name:?}")))?;
        let mut values = Vec::with_capacity(count);
        for chunk in value_bytes.chunks_exact(4) {
            values.push(f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]));
        }
        record.insert(name.to_string(), values);
    }

    if record.len() != expected_fields.len() {
        return Err(WireError::bad_record(format!(
            "record has {} fields, expected {}",
            record.len(),
            expected_fields.len()
        )));
    }

    Ok(record)
}

fn read_u16(buf: &[u8], pos: &mut usize) -> Option<u16> {
    let bytes = take(buf, pos, 2)?;
    Some(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(buf: &[u8], pos: &mut usize) -> Option<u32> {
    let bytes = take(buf, pos, 4)?;
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

fn take<'a>(buf: &'a [u8], pos: &mut usize, len: usize) -> Option<&'a [u8]> {
    let end = pos.checked_add(len)?;
    if end > buf.len() {
        return None;
    }
    let out = &buf[*pos..end];
    *pos = end;
    Some(out)
}

/// Frame encoder, the write side of the format. Used by the export glue and
/// by tests that need shard fixtures.
pub struct ShardWriter<W: std::io::Write> {
    writer: W,
    cells: usize,
}

impl<W: std::io::Write> ShardWriter<W> {
    pub fn new(writer: W, schema: &SchemaDescriptor) -> Self {
        Self {
            writer,
            cells: schema.cells(),
        }
    }

    /// Encodes one record frame. Enforces the same per-field length contract
    /// the decoder checks.
    pub fn write_record(&mut self, fields: &[(&str, &[f32])]) -> Result<(), WireError> {
        let mut payload = Vec::new();
        for (name, values) in fields {
            if values.len() != self.cells {
                return Err(WireError::bad_record(format!(
                    "field {name:?} has {} elements, expected {}",
                    values.len(),
                    self.cells
                )));
            }
            let name_len = u16::try_from(name.len())
                .map_err(|_| WireError::bad_record(format!("field name too long: {name:?}")))?;
            payload.extend_from_slice(&name_len.to_le_bytes());
            payload.extend_from_slice(name.as_bytes());
            payload.extend_from_slice(&(values.len() as u32).to_le_bytes());
            for v in *values {
                payload.extend_from_slice(&v.to_le_bytes());
            }
        }

        let len = u32::try_from(payload.len())
            .map_err(|_| WireError::bad_record("record payload too large"))?;
        if len > MAX_PAYLOAD_LEN {
            return Err(WireError::bad_record("record payload exceeds frame cap"));
        }

        let len_bytes = len.to_le_bytes();
        self.writer.write_all(&len_bytes)?;
        self.writer
            .write_all(&crc32fast::hash(&len_bytes).to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer
            .write_all(&crc32fast::hash(&payload).to_le_bytes())?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<W, WireError> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}
