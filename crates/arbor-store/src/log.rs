//! File-backed [`KvBackend`]: one append-only log per table.
//!
//! Every batch is appended as a run of framed records; an in-memory index
//! maps each key to the position of its latest record. The index is rebuilt
//! by replaying the log when the backend is opened.
//!
//! On-disk record format:
//! ```text
//! [4 bytes: payload length (little-endian u32)]
//! [4 bytes: CRC32 of payload (little-endian u32)]
//! [N bytes: payload (bincode-serialized (key, value))]
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::kv::{KvBackend, WriteBatch};

/// Header size: 4 bytes length + 4 bytes CRC.
const HEADER_SIZE: u64 = 8;

const LOG_EXTENSION: &str = "log";

/// Flush/sync strategy for table logs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SyncMode {
    /// `fsync` after every batch.
    EveryWrite,
    /// Rely on OS page-cache buffering.
    #[default]
    OsDefault,
}

#[derive(Clone, Debug, Default)]
pub struct KvConfig {
    pub sync_mode: SyncMode,
}

/// Location of a record payload inside a table log.
#[derive(Clone, Copy, Debug)]
struct Slot {
    offset: u64,
    len: u32,
}

struct TableLog {
    writer: BufWriter<File>,
    reader: File,
    /// End of the last valid record.
    offset: u64,
    index: BTreeMap<Vec<u8>, Slot>,
}

impl TableLog {
    fn open(path: &Path) -> StoreResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)?;

        let (index, valid_len) = replay(path)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            warn!(
                path = %path.display(),
                valid_len,
                file_len,
                "discarding torn tail of table log"
            );
            file.set_len(valid_len)?;
        }

        Ok(Self {
            writer: BufWriter::new(file),
            reader: File::open(path)?,
            offset: valid_len,
            index,
        })
    }

    fn append(&mut self, batch: WriteBatch, sync: SyncMode) -> StoreResult<()> {
        let count = batch.len();
        let mut slots = Vec::with_capacity(count);
        for (key, value) in batch.into_puts() {
            let payload = bincode::serialize(&(&key, &value))
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let len = payload.len() as u32;
            let crc = crc32fast::hash(&payload);

            self.writer.write_all(&len.to_le_bytes())?;
            self.writer.write_all(&crc.to_le_bytes())?;
            self.writer.write_all(&payload)?;

            slots.push((
                key,
                Slot {
                    offset: self.offset + HEADER_SIZE,
                    len,
                },
            ));
            self.offset += HEADER_SIZE + len as u64;
        }

        self.writer.flush()?;
        if sync == SyncMode::EveryWrite {
            self.writer.get_ref().sync_data()?;
        }
        // Index only after the bytes are handed to the OS.
        self.index.extend(slots);
        debug!(records = count, offset = self.offset, "table log append");
        Ok(())
    }

    fn read(&mut self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let Some(slot) = self.index.get(key).copied() else {
            return Ok(None);
        };
        self.reader.seek(SeekFrom::Start(slot.offset))?;
        let mut payload = vec![0u8; slot.len as usize];
        self.reader.read_exact(&mut payload)?;
        let (_, value): (Vec<u8>, Vec<u8>) = bincode::deserialize(&payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(Some(value))
    }

    fn clear(&mut self) -> StoreResult<()> {
        self.writer.flush()?;
        self.writer.get_ref().set_len(0)?;
        self.offset = 0;
        self.index.clear();
        Ok(())
    }
}

/// Rebuild the key index of a table log.
///
/// Reads the file front to back. Records that fail the CRC check are
/// skipped; a record whose length runs past the end of the file ends the
/// replay. Returns the index and the length of the valid prefix.
fn replay(path: &Path) -> StoreResult<(BTreeMap<Vec<u8>, Slot>, u64)> {
    let mut data = Vec::new();
    File::open(path)?.read_to_end(&mut data)?;
    let file_len = data.len() as u64;

    let mut index = BTreeMap::new();
    let mut offset: u64 = 0;
    let mut records = 0usize;

    while offset + HEADER_SIZE <= file_len {
        let at = offset as usize;
        let len = u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]);
        let expected_crc =
            u32::from_le_bytes([data[at + 4], data[at + 5], data[at + 6], data[at + 7]]);

        let end = offset + HEADER_SIZE + len as u64;
        if len == 0 || end > file_len {
            warn!(offset, len, file_len, "invalid record length; stopping replay");
            break;
        }

        let payload = &data[(offset + HEADER_SIZE) as usize..end as usize];
        let actual_crc = crc32fast::hash(payload);
        if actual_crc != expected_crc {
            warn!(
                offset,
                expected = expected_crc,
                actual = actual_crc,
                "CRC mismatch; skipping record"
            );
            offset = end;
            continue;
        }

        match bincode::deserialize::<(Vec<u8>, Vec<u8>)>(payload) {
            Ok((key, _)) => {
                index.insert(
                    key,
                    Slot {
                        offset: offset + HEADER_SIZE,
                        len,
                    },
                );
                records += 1;
            }
            Err(e) => {
                warn!(offset, error = %e, "failed to decode record; skipping");
            }
        }
        offset = end;
    }

    debug!(path = %path.display(), records, keys = index.len(), "table log replayed");
    Ok((index, offset))
}

fn validate_table(table: &str) -> StoreResult<()> {
    let valid = !table.is_empty()
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidTable(table.to_string()))
    }
}

/// Directory of table logs, one `<table>.log` file per table.
pub struct LogKvBackend {
    dir: PathBuf,
    config: KvConfig,
    tables: Mutex<HashMap<String, TableLog>>,
}

impl LogKvBackend {
    /// Open (or create) a backend rooted at `dir`, replaying existing tables.
    pub fn open(dir: &Path, config: KvConfig) -> StoreResult<Self> {
        fs::create_dir_all(dir)?;
        let mut tables = HashMap::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(LOG_EXTENSION) {
                continue;
            }
            let Some(table) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if validate_table(table).is_err() {
                continue;
            }
            tables.insert(table.to_string(), TableLog::open(&path)?);
        }
        debug!(dir = %dir.display(), tables = tables.len(), "opened table logs");
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            tables: Mutex::new(tables),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn table_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.{LOG_EXTENSION}"))
    }
}

impl KvBackend for LogKvBackend {
    fn get(&self, table: &str, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        validate_table(table)?;
        let mut tables = self.tables.lock().expect("lock poisoned");
        match tables.get_mut(table) {
            Some(log) => log.read(key),
            None => Ok(None),
        }
    }

    fn write_batch(&self, table: &str, batch: WriteBatch) -> StoreResult<()> {
        validate_table(table)?;
        if batch.is_empty() {
            return Ok(());
        }
        let mut tables = self.tables.lock().expect("lock poisoned");
        if !tables.contains_key(table) {
            let log = TableLog::open(&self.table_path(table))?;
            tables.insert(table.to_string(), log);
        }
        match tables.get_mut(table) {
            Some(log) => log.append(batch, self.config.sync_mode),
            None => Err(StoreError::InvalidTable(table.to_string())),
        }
    }

    fn len(&self, table: &str) -> StoreResult<usize> {
        validate_table(table)?;
        let tables = self.tables.lock().expect("lock poisoned");
        Ok(tables.get(table).map_or(0, |log| log.index.len()))
    }

    fn clear(&self, table: &str) -> StoreResult<()> {
        validate_table(table)?;
        let mut tables = self.tables.lock().expect("lock poisoned");
        match tables.get_mut(table) {
            Some(log) => log.clear(),
            None => Ok(()),
        }
    }

    fn multi_get(&self, table: &str, keys: &[&[u8]]) -> StoreResult<Vec<Option<Vec<u8>>>> {
        validate_table(table)?;
        let mut tables = self.tables.lock().expect("lock poisoned");
        match tables.get_mut(table) {
            Some(log) => keys.iter().map(|k| log.read(k)).collect(),
            None => Ok(vec![None; keys.len()]),
        }
    }
}

impl std::fmt::Debug for LogKvBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogKvBackend")
            .field("dir", &self.dir)
            .field("sync_mode", &self.config.sync_mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn batch(pairs: &[(&str, &str)]) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for (k, v) in pairs {
            batch.put(k.as_bytes(), v.as_bytes());
        }
        batch
    }

    // ----------------------------------------------------------
    // Basic reads and writes
    // ----------------------------------------------------------

    #[test]
    fn put_and_get() {
        let dir = tempdir().unwrap();
        let kv = LogKvBackend::open(dir.path(), KvConfig::default()).unwrap();
        kv.write_batch("nodes", batch(&[("a", "1"), ("b", "2")])).unwrap();
        assert_eq!(kv.get("nodes", b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(kv.get("nodes", b"c").unwrap(), None);
        assert_eq!(kv.get("trees", b"a").unwrap(), None);
        assert_eq!(kv.len("nodes").unwrap(), 2);
        assert!(dir.path().join("nodes.log").exists());
    }

    #[test]
    fn overwrite_returns_latest() {
        let dir = tempdir().unwrap();
        let kv = LogKvBackend::open(dir.path(), KvConfig::default()).unwrap();
        kv.put("t", b"k", b"old").unwrap();
        kv.put("t", b"k", b"new").unwrap();
        assert_eq!(kv.get("t", b"k").unwrap(), Some(b"new".to_vec()));
        assert_eq!(kv.len("t").unwrap(), 1);
    }

    #[test]
    fn sync_every_write() {
        let dir = tempdir().unwrap();
        let config = KvConfig {
            sync_mode: SyncMode::EveryWrite,
        };
        let kv = LogKvBackend::open(dir.path(), config).unwrap();
        kv.put("t", b"k", b"v").unwrap();
        assert_eq!(kv.get("t", b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn invalid_table_names_are_rejected() {
        let dir = tempdir().unwrap();
        let kv = LogKvBackend::open(dir.path(), KvConfig::default()).unwrap();
        assert!(matches!(
            kv.put("../escape", b"k", b"v"),
            Err(StoreError::InvalidTable(_))
        ));
        assert!(matches!(kv.get("", b"k"), Err(StoreError::InvalidTable(_))));
    }

    // ----------------------------------------------------------
    // Replay
    // ----------------------------------------------------------

    #[test]
    fn reopen_replays_tables() {
        let dir = tempdir().unwrap();
        {
            let kv = LogKvBackend::open(dir.path(), KvConfig::default()).unwrap();
            kv.write_batch("trees", batch(&[("x", "1"), ("y", "2")])).unwrap();
            kv.put("trees", b"x", b"3").unwrap();
        }
        let kv = LogKvBackend::open(dir.path(), KvConfig::default()).unwrap();
        assert_eq!(kv.get("trees", b"x").unwrap(), Some(b"3".to_vec()));
        assert_eq!(kv.get("trees", b"y").unwrap(), Some(b"2".to_vec()));
        assert_eq!(kv.len("trees").unwrap(), 2);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempdir().unwrap();
        {
            let kv = LogKvBackend::open(dir.path(), KvConfig::default()).unwrap();
            kv.put("t", b"good", b"value").unwrap();
        }
        {
            let mut file = OpenOptions::new()
                .append(true)
                .open(dir.path().join("t.log"))
                .unwrap();
            // Header claiming 1000 bytes, followed by far fewer.
            file.write_all(&1000u32.to_le_bytes()).unwrap();
            file.write_all(&0u32.to_le_bytes()).unwrap();
            file.write_all(b"partial").unwrap();
        }
        {
            let kv = LogKvBackend::open(dir.path(), KvConfig::default()).unwrap();
            assert_eq!(kv.get("t", b"good").unwrap(), Some(b"value".to_vec()));
            kv.put("t", b"after", b"crash").unwrap();
        }
        let kv = LogKvBackend::open(dir.path(), KvConfig::default()).unwrap();
        assert_eq!(kv.get("t", b"after").unwrap(), Some(b"crash".to_vec()));
        assert_eq!(kv.len("t").unwrap(), 2);
    }

    #[test]
    fn corrupt_record_is_skipped() {
        let dir = tempdir().unwrap();
        {
            let kv = LogKvBackend::open(dir.path(), KvConfig::default()).unwrap();
            kv.put("t", b"a", b"1").unwrap();
            kv.put("t", b"b", b"2").unwrap();
        }
        let path = dir.path().join("t.log");
        let mut data = fs::read(&path).unwrap();
        // Flip a payload byte of the first record.
        data[HEADER_SIZE as usize + 1] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        let kv = LogKvBackend::open(dir.path(), KvConfig::default()).unwrap();
        assert_eq!(kv.get("t", b"a").unwrap(), None);
        assert_eq!(kv.get("t", b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn clear_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let kv = LogKvBackend::open(dir.path(), KvConfig::default()).unwrap();
            kv.put("t", b"a", b"1").unwrap();
            kv.clear("t").unwrap();
            assert_eq!(kv.len("t").unwrap(), 0);
            kv.put("t", b"b", b"2").unwrap();
        }
        let kv = LogKvBackend::open(dir.path(), KvConfig::default()).unwrap();
        assert_eq!(kv.get("t", b"a").unwrap(), None);
        assert_eq!(kv.get("t", b"b").unwrap(), Some(b"2".to_vec()));
    }
}
