use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use tp_core::assemble::Observation;
use tp_core::mode::SchemaDescriptor;

use crate::{create_parent_dirs, StoreError};

pub const TABLE_MAGIC: &[u8; 8] = b"TPTABLE1";

const MAX_HEADER_LEN: u32 = 64 * 1024;

/// The single growable output table for one resolution mode.
///
/// File layout: 8-byte magic, u32 header length, text header describing the
/// schema, then fixed-width binary rows. A row is the year tensors in
/// year-label order (each rows x cols x channels f32 LE, channel-last), then
/// lat (f32), lng (f32), sequence_id (i64), urban_share (f32).
///
/// Rows are buffered in memory and made durable as one batch by `commit`, so
/// an aborted shard leaves no trace. Committed rows are never updated,
/// deleted, or truncated; reopening verifies the stored schema against the
/// run's and drops at most a torn partial row left by a crash mid-write.
#[derive(Debug)]
pub struct Table {
    path: PathBuf,
    file: File,
    schema: SchemaDescriptor,
    data_start: u64,
    rows: u64,
    pending: Vec<u8>,
    pending_rows: u64,
}

impl Table {
    /// Creates the file and schema header if absent, opens for append
    /// otherwise. Never truncates committed rows.
    pub fn open(path: impl Into<PathBuf>, schema: &SchemaDescriptor) -> Result<Self, StoreError> {
        let path = path.into();
        let exists = path.exists() && std::fs::metadata(&path)?.len() > 0;
        if exists {
            Self::open_existing(path, schema)
        } else {
            Self::create(path, schema)
        }
    }

    fn create(path: PathBuf, schema: &SchemaDescriptor) -> Result<Self, StoreError> {
        create_parent_dirs(&path)?;

        let header = encode_header(schema);
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)?;
        file.write_all(TABLE_MAGIC)?;
        file.write_all(&(header.len() as u32).to_le_bytes())?;
        file.write_all(header.as_bytes())?;
        file.flush()?;
        file.sync_all()?;

        let data_start = (TABLE_MAGIC.len() + 4 + header.len()) as u64;
        Ok(Self {
            path,
            file,
            schema: schema.clone(),
            data_start,
            rows: 0,
            pending: Vec::new(),
            pending_rows: 0,
        })
    }

    fn open_existing(path: PathBuf, schema: &SchemaDescriptor) -> Result<Self, StoreError> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut magic = [0u8; 8];
        file.read_exact(&mut magic)
            .map_err(|_| StoreError::BadHeader(format!("{}: file too short", path.display())))?;
        if &magic != TABLE_MAGIC {
            return Err(StoreError::BadHeader(format!(
                "{}: bad magic",
                path.display()
            )));
        }

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)
            .map_err(|_| StoreError::BadHeader(format!("{}: missing header", path.display())))?;
        let header_len = u32::from_le_bytes(len_bytes);
        if header_len == 0 || header_len > MAX_HEADER_LEN {
            return Err(StoreError::BadHeader(format!(
                "{}: implausible header length {header_len}",
                path.display()
            )));
        }

        let mut header = vec![0u8; header_len as usize];
        file.read_exact(&mut header)
            .map_err(|_| StoreError::BadHeader(format!("{}: truncated header", path.display())))?;
        let header = String::from_utf8(header)
            .map_err(|_| StoreError::BadHeader(format!("{}: header not utf-8", path.display())))?;
        check_header(&header, schema)?;

        let data_start = (TABLE_MAGIC.len() + 4 + header_len as usize) as u64;
        let row_width = schema.row_width() as u64;
        let file_len = file.metadata()?.len();
        let body = file_len.saturating_sub(data_start);
        let rows = body / row_width;
        let torn = body % row_width;
        if torn != 0 {
            // A crash mid-write left a partial row at the tail. Drop back to
            // the last whole-row boundary; committed rows are untouched.
            warn!(
                target: "tp_ingest",
                event = "table_torn_tail",
                table = %path.display(),
                torn_bytes = torn,
                rows,
                "dropping torn partial row at table tail"
            );
            file.set_len(data_start + rows * row_width)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(Self {
            path,
            file,
            schema: schema.clone(),
            data_start,
            rows,
            pending: Vec::new(),
            pending_rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Committed rows only; pending rows are not counted until `commit`.
    pub fn row_count(&self) -> u64 {
        self.rows
    }

    pub fn pending_rows(&self) -> u64 {
        self.pending_rows
    }

    /// Buffers one row. Becomes durable at the next `commit`.
    pub fn append_observation(
        &mut self,
        obs: &Observation,
        sequence_id: i64,
    ) -> Result<(), StoreError> {
        if obs.tensors.len() != self.schema.year_labels.len() {
            return Err(StoreError::RowShape(format!(
                "{} year tensors, expected {}",
                obs.tensors.len(),
                self.schema.year_labels.len()
            )));
        }
        let expected_dim = (self.schema.rows, self.schema.cols, self.schema.channels());
        for (year, tensor) in self.schema.year_labels.iter().zip(&obs.tensors) {
            if tensor.dim() != expected_dim {
                return Err(StoreError::RowShape(format!(
                    "year {year} tensor is {:?}, expected {expected_dim:?}",
                    tensor.dim()
                )));
            }
        }

        self.pending.reserve(self.schema.row_width());
        for tensor in &obs.tensors {
            for v in tensor.iter() {
                self.pending.extend_from_slice(&v.to_le_bytes());
            }
        }
        self.pending.extend_from_slice(&obs.lat.to_le_bytes());
        self.pending.extend_from_slice(&obs.lng.to_le_bytes());
        self.pending.extend_from_slice(&sequence_id.to_le_bytes());
        self.pending.extend_from_slice(&obs.urban_share.to_le_bytes());
        self.pending_rows += 1;
        Ok(())
    }

    /// Writes all pending rows, flushed and synced before return. Returns the
    /// committed row count.
    pub fn commit(&mut self) -> Result<u64, StoreError> {
        if self.pending.is_empty() {
            return Ok(self.rows);
        }
        self.file.write_all(&self.pending)?;
        self.file.flush()?;
        self.file.sync_all()?;
        self.rows += self.pending_rows;
        self.pending.clear();
        self.pending_rows = 0;
        Ok(self.rows)
    }

    /// Drops buffered rows without writing them (aborted shard).
    pub fn discard_pending(&mut self) {
        self.pending.clear();
        self.pending_rows = 0;
    }

    /// Commits outstanding rows and releases the handle.
    pub fn close(mut self) -> Result<(), StoreError> {
        self.commit()?;
        Ok(())
    }

    #[cfg(test)]
    fn data_start(&self) -> u64 {
        self.data_start
    }
}

fn encode_header(schema: &SchemaDescriptor) -> String {
    format!(
        "schema_version=1\nmode={}\nrows={}\ncols={}\nchannels={}\nyears={}\n",
        schema.mode,
        schema.rows,
        schema.cols,
        schema.channel_names.join(","),
        schema.year_labels.join(","),
    )
}

fn check_header(stored: &str, schema: &SchemaDescriptor) -> Result<(), StoreError> {
    let expected = encode_header(schema);
    if stored == expected {
        return Ok(());
    }

    // Report the first differing key for a usable error message.
    let stored_kv: Vec<(&str, &str)> = stored.lines().filter_map(|l| l.split_once('=')).collect();
    for line in expected.lines() {
        let Some((key, want)) = line.split_once('=') else {
            continue;
        };
        match stored_kv.iter().find(|(k, _)| *k == key) {
            Some((_, got)) if *got == want => {}
            Some((_, got)) => {
                return Err(StoreError::SchemaMismatch(format!(
                    "{key}: table has {got:?}, run expects {want:?}"
                )));
            }
            None => {
                return Err(StoreError::SchemaMismatch(format!(
                    "table header is missing {key:?}"
                )));
            }
        }
    }
    Err(StoreError::SchemaMismatch(
        "table header has unexpected extra keys".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;
    use tp_core::mode::Mode;

    fn temp_path(test_name: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        root.push(format!(
            "tp-table-{test_name}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos()
        ));
        root.join("data.tbl")
    }

    fn observation(schema: &SchemaDescriptor, fill: f32) -> Observation {
        let dim = (schema.rows, schema.cols, schema.channels());
        Observation {
            tensors: schema
                .year_labels
                .iter()
                .map(|_| Array3::from_elem(dim, fill))
                .collect(),
            lat: 40.0,
            lng: -100.0,
            urban_share: 0.4,
        }
    }

    #[test]
    fn create_commit_reopen_preserves_rows() {
        let schema = Mode::Mw.config();
        let path = temp_path("reopen");
        {
            let mut table = Table::open(&path, &schema).unwrap();
            assert_eq!(table.row_count(), 0);
            table.append_observation(&observation(&schema, 1.0), 1).unwrap();
            table.append_observation(&observation(&schema, 2.0), 2).unwrap();
            assert_eq!(table.pending_rows(), 2);
            assert_eq!(table.commit().unwrap(), 2);
        }

        let mut table = Table::open(&path, &schema).unwrap();
        assert_eq!(table.row_count(), 2);
        table.append_observation(&observation(&schema, 3.0), 3).unwrap();
        table.commit().unwrap();
        assert_eq!(table.row_count(), 3);

        let expected_len = table.data_start() + 3 * schema.row_width() as u64;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected_len);
    }

    #[test]
    fn discard_pending_leaves_no_trace() {
        let schema = Mode::Mw.config();
        let path = temp_path("discard");
        let mut table = Table::open(&path, &schema).unwrap();
        table.append_observation(&observation(&schema, 1.0), 1).unwrap();
        table.discard_pending();
        table.commit().unwrap();
        assert_eq!(table.row_count(), 0);
        assert_eq!(
            std::fs::metadata(&path).unwrap().len(),
            table.data_start()
        );
    }

    #[test]
    fn torn_tail_is_dropped_on_reopen() {
        let schema = Mode::Mw.config();
        let path = temp_path("torn");
        {
            let mut table = Table::open(&path, &schema).unwrap();
            table.append_observation(&observation(&schema, 1.0), 1).unwrap();
            table.commit().unwrap();
        }
        // Simulate a crash mid-row.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[0xAB; 100]).unwrap();
        }

        let table = Table::open(&path, &schema).unwrap();
        assert_eq!(table.row_count(), 1);
        let expected_len = table.data_start() + schema.row_width() as u64;
        assert_eq!(std::fs::metadata(&path).unwrap().len(), expected_len);
    }

    #[test]
    fn schema_mismatch_is_rejected() {
        let path = temp_path("mismatch");
        Table::open(&path, &Mode::Mw.config()).unwrap();
        let err = Table::open(&path, &Mode::Small.config()).unwrap_err();
        assert!(matches!(err, StoreError::SchemaMismatch(_)), "{err}");
    }

    #[test]
    fn garbage_file_is_rejected() {
        let path = temp_path("garbage");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"definitely not a table").unwrap();
        let err = Table::open(&path, &Mode::Mw.config()).unwrap_err();
        assert!(matches!(err, StoreError::BadHeader(_)), "{err}");
    }

    #[test]
    fn row_shape_is_validated() {
        let schema = Mode::Mw.config();
        let path = temp_path("shape");
        let mut table = Table::open(&path, &schema).unwrap();
        let mut obs = observation(&schema, 1.0);
        obs.tensors.pop();
        let err = table.append_observation(&obs, 1).unwrap_err();
        assert!(matches!(err, StoreError::RowShape(_)));
    }

    #[test]
    fn sequence_id_lands_in_the_row_tail() {
        let schema = Mode::Mw.config();
        let path = temp_path("seq");
        let mut table = Table::open(&path, &schema).unwrap();
        table.append_observation(&observation(&schema, 1.0), 42).unwrap();
        table.commit().unwrap();
        let data_start = table.data_start();
        drop(table);

        let bytes = std::fs::read(&path).unwrap();
        let row = &bytes[data_start as usize..];
        assert_eq!(row.len(), schema.row_width());
        // Row tail: lat (4) | lng (4) | sequence_id (8) | urban_share (4).
        let tail = &row[row.len() - 20..];
        let lat = f32::from_le_bytes(tail[0..4].try_into().unwrap());
        let lng = f32::from_le_bytes(tail[4..8].try_into().unwrap());
        let seq = i64::from_le_bytes(tail[8..16].try_into().unwrap());
        let urban = f32::from_le_bytes(tail[16..20].try_into().unwrap());
        assert_eq!(lat, 40.0);
        assert_eq!(lng, -100.0);
        assert_eq!(seq, 42);
        assert_eq!(urban, 0.4);
    }
}
