//! Named sub-databases.
//!
//! Each logical database is backed by one `freezer_<id>` file: a fixed
//! header followed by length-prefixed put/del records. On open the records
//! are replayed into an in-memory index and the rolling checksum is checked
//! against the header. Commits append the new records, fsync, then rewrite
//! the header so a torn write is detectable on the next open.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};
use crate::hasher::Hasher;

const MAGIC: u32 = 0x46_5A_52; // ASCII "FZR"
const VERSION: u16 = 1;

// magic(4) + version(2) + record_count(8) + checksum(8)
pub const HEADER_SIZE: usize = 22;

const OP_PUT: u8 = 1;
const OP_DEL: u8 = 2;

/// One buffered transaction operation.
#[derive(Debug, Clone)]
pub enum Op {
    Put(Vec<u8>, Vec<u8>),
    Del(Vec<u8>),
}

pub struct SubDb {
    name: String,
    path: PathBuf,
    file: File,
    record_count: u64,
    hasher: Hasher,
    index: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl SubDb {
    /// Opens or creates the sub-database file and replays it into memory.
    pub fn open(dir: &Path, name: &str) -> Result<Self> {
        let path = dir.join(name);
        let file = File::options()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| Error::DbiOpen(format!("{name}: {e}")))?;

        let len = file
            .metadata()
            .map_err(|e| Error::DbiOpen(format!("{name}: {e}")))?
            .len();

        let mut subdb = Self {
            name: name.to_string(),
            path,
            file,
            record_count: 0,
            hasher: Hasher::new(),
            index: BTreeMap::new(),
        };

        if len == 0 {
            subdb.write_header(0, 0)?;
            subdb.file.sync_all()?;
        } else {
            subdb.replay()?;
        }

        Ok(subdb)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, key: &[u8]) -> Option<&Vec<u8>> {
        self.index.get(key)
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.index.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Snapshot of every key, in order. Cursor walks iterate this so the
    /// caller's visit callback never holds the store borrowed.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.index.keys().cloned().collect()
    }

    /// Applies a batch of operations: appends the records, fsyncs, updates
    /// the index, and rewrites the header. A batch is the commit unit.
    pub fn apply(&mut self, ops: &[Op]) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }

        self.file.seek(SeekFrom::End(0))?;
        let mut writer = BufWriter::new(&mut self.file);
        for op in ops {
            match op {
                Op::Put(key, value) => {
                    writer.write_u8(OP_PUT)?;
                    writer.write_u32::<BigEndian>(key.len() as u32)?;
                    writer.write_all(key)?;
                    writer.write_u32::<BigEndian>(value.len() as u32)?;
                    writer.write_all(value)?;
                }
                Op::Del(key) => {
                    writer.write_u8(OP_DEL)?;
                    writer.write_u32::<BigEndian>(key.len() as u32)?;
                    writer.write_all(key)?;
                    writer.write_u32::<BigEndian>(0)?;
                }
            }
        }
        writer.flush()?;
        drop(writer);
        self.file.sync_all()?;

        for op in ops {
            match op {
                Op::Put(key, value) => {
                    self.hasher.update(key, value);
                    self.index.insert(key.clone(), value.clone());
                }
                Op::Del(key) => {
                    self.hasher.update(key, &[]);
                    self.index.remove(key);
                }
            }
            self.record_count += 1;
        }

        self.write_header(self.record_count, self.hasher.value())?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Removes every entry: truncates the file back to a fresh header.
    pub fn drop_all(&mut self) -> Result<()> {
        self.index.clear();
        self.record_count = 0;
        self.hasher.reset();
        self.file.set_len(0)?;
        self.write_header(0, 0)?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Writes a compacted copy (one put record per live entry) next to the
    /// destination, then renames it into place.
    pub fn copy_to(&self, dest_dir: &Path) -> Result<()> {
        let tmp = dest_dir.join(format!("{}.tmp", self.name));
        let dest = dest_dir.join(&self.name);

        {
            let file = File::create(&tmp)?;
            let mut writer = BufWriter::new(file);
            let mut hasher = Hasher::new();

            write_header_to(&mut writer, self.index.len() as u64, 0)?;
            for (key, value) in &self.index {
                writer.write_u8(OP_PUT)?;
                writer.write_u32::<BigEndian>(key.len() as u32)?;
                writer.write_all(key)?;
                writer.write_u32::<BigEndian>(value.len() as u32)?;
                writer.write_all(value)?;
                hasher.update(key, value);
            }
            writer.flush()?;

            let mut file = writer.into_inner().map_err(|e| Error::IO(e.to_string()))?;
            file.seek(SeekFrom::Start(0))?;
            write_header_to(&mut file, self.index.len() as u64, hasher.value())?;
            file.sync_all()?;
        }

        std::fs::rename(&tmp, &dest)?;
        Ok(())
    }

    fn write_header(&mut self, record_count: u64, checksum: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        write_header_to(&mut self.file, record_count, checksum)?;
        Ok(())
    }

    fn replay(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut self.file);

        let magic = reader.read_u32::<BigEndian>().map_err(corrupt)?;
        if magic != MAGIC {
            return Err(Error::Corrupt(format!("bad magic in {}", self.name)));
        }
        let version = reader.read_u16::<BigEndian>().map_err(corrupt)?;
        if version != VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported version {version} in {}",
                self.name
            )));
        }
        let record_count = reader.read_u64::<BigEndian>().map_err(corrupt)?;
        let checksum = reader.read_u64::<BigEndian>().map_err(corrupt)?;

        let mut read = 0u64;
        while read < record_count {
            let op = reader.read_u8().map_err(corrupt)?;
            let key_len = reader.read_u32::<BigEndian>().map_err(corrupt)? as usize;
            let mut key = vec![0u8; key_len];
            reader.read_exact(&mut key).map_err(corrupt)?;
            let value_len = reader.read_u32::<BigEndian>().map_err(corrupt)? as usize;
            let mut value = vec![0u8; value_len];
            reader.read_exact(&mut value).map_err(corrupt)?;

            match op {
                OP_PUT => {
                    self.hasher.update(&key, &value);
                    self.index.insert(key, value);
                }
                OP_DEL => {
                    self.hasher.update(&key, &[]);
                    self.index.remove(&key);
                }
                other => {
                    return Err(Error::Corrupt(format!(
                        "unknown record op {other} in {}",
                        self.name
                    )));
                }
            }
            read += 1;
        }

        if self.hasher.value() != checksum {
            return Err(Error::Corrupt(format!(
                "checksum mismatch in {}: stored {checksum:#x}, computed {:#x}",
                self.name,
                self.hasher.value()
            )));
        }

        self.record_count = record_count;
        Ok(())
    }
}

fn write_header_to<W: Write>(writer: &mut W, record_count: u64, checksum: u64) -> Result<()> {
    writer.write_u32::<BigEndian>(MAGIC)?;
    writer.write_u16::<BigEndian>(VERSION)?;
    writer.write_u64::<BigEndian>(record_count)?;
    writer.write_u64::<BigEndian>(checksum)?;
    Ok(())
}

fn corrupt(e: std::io::Error) -> Error {
    Error::Corrupt(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_apply_and_get() {
        let dir = TempDir::new().expect("tempdir");
        let mut subdb = SubDb::open(dir.path(), "freezer_0").expect("open");

        subdb
            .apply(&[
                Op::Put(b"a".to_vec(), b"1".to_vec()),
                Op::Put(b"b".to_vec(), b"2".to_vec()),
                Op::Del(b"a".to_vec()),
            ])
            .expect("apply");

        assert_eq!(subdb.get(b"a"), None);
        assert_eq!(subdb.get(b"b"), Some(&b"2".to_vec()));
        assert_eq!(subdb.len(), 1);
    }

    #[test]
    fn test_reopen_replays_records() {
        let dir = TempDir::new().expect("tempdir");
        {
            let mut subdb = SubDb::open(dir.path(), "freezer_0").expect("open");
            subdb
                .apply(&[
                    Op::Put(b"a".to_vec(), b"1".to_vec()),
                    Op::Put(b"b".to_vec(), b"2".to_vec()),
                ])
                .expect("apply");
            subdb.apply(&[Op::Del(b"a".to_vec())]).expect("apply");
        }

        let subdb = SubDb::open(dir.path(), "freezer_0").expect("reopen");
        assert_eq!(subdb.get(b"a"), None);
        assert_eq!(subdb.get(b"b"), Some(&b"2".to_vec()));
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = TempDir::new().expect("tempdir");
        {
            let mut subdb = SubDb::open(dir.path(), "freezer_0").expect("open");
            subdb
                .apply(&[Op::Put(b"a".to_vec(), b"1".to_vec())])
                .expect("apply");
        }

        // Flip a byte inside the record area
        let path = dir.path().join("freezer_0");
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            SubDb::open(dir.path(), "freezer_0"),
            Err(Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_drop_all_truncates() {
        let dir = TempDir::new().expect("tempdir");
        let mut subdb = SubDb::open(dir.path(), "freezer_0").expect("open");
        subdb
            .apply(&[
                Op::Put(b"a".to_vec(), b"1".to_vec()),
                Op::Put(b"b".to_vec(), b"2".to_vec()),
            ])
            .expect("apply");

        subdb.drop_all().expect("drop_all");
        assert!(subdb.is_empty());

        // Survives reopen
        drop(subdb);
        let subdb = SubDb::open(dir.path(), "freezer_0").expect("reopen");
        assert!(subdb.is_empty());
    }

    #[test]
    fn test_copy_to_is_compacted_and_loadable() {
        let src = TempDir::new().expect("tempdir");
        let dst = TempDir::new().expect("tempdir");
        let mut subdb = SubDb::open(src.path(), "freezer_0").expect("open");
        subdb
            .apply(&[
                Op::Put(b"a".to_vec(), b"1".to_vec()),
                Op::Put(b"a".to_vec(), b"2".to_vec()),
                Op::Put(b"b".to_vec(), b"3".to_vec()),
                Op::Del(b"b".to_vec()),
            ])
            .expect("apply");

        subdb.copy_to(dst.path()).expect("copy");

        let copy = SubDb::open(dst.path(), "freezer_0").expect("open copy");
        assert_eq!(copy.get(b"a"), Some(&b"2".to_vec()));
        assert_eq!(copy.get(b"b"), None);
        assert_eq!(copy.len(), 1);
    }
}
