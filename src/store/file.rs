//! File-backed store
//!
//! Payloads are appended to a log; an on-disk search tree maps each address
//! to its record. Directory structure:
//! ```text
//! root/
//!   log      (format magic, then records)
//!   index    (header, then search tree entries)
//! ```

use super::index::{DiskIndex, Lookup};
use super::record::{self, RecordHeader, LOG_MAGIC};
use super::{Backend, StoreError, StoreResult, StoreStats, MAX_BLOCK_SIZE};
use crate::address::Address;
use crate::logging::{emit, Logger};
use log::Level;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const LOG_FILE: &str = "log";
const INDEX_FILE: &str = "index";

/// Log-structured store in a directory
pub struct FileStore {
    root: PathBuf,
    log: File,
    log_size: u64,
    index: DiskIndex,
    sync_writes: bool,
    logger: Logger,
}

impl FileStore {
    /// Create an empty store in `root`, creating the directory if needed.
    /// Fails if a log or index already exists there.
    pub fn create<P: AsRef<Path>>(root: P) -> StoreResult<()> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;

        let mut log = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(root.join(LOG_FILE))?;
        log.write_all(&LOG_MAGIC)?;
        log.sync_all()?;

        DiskIndex::create(root.join(INDEX_FILE))
    }

    /// Open an existing store
    pub fn open<P: AsRef<Path>>(root: P, logger: Logger) -> StoreResult<Self> {
        let root = root.as_ref().to_path_buf();

        let log_path = root.join(LOG_FILE);
        let mut log = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&log_path)
            .map_err(|e| {
                emit!(logger, Level::Error, "could not open log {}: {}", log_path.display(), e);
                e
            })?;
        record::check_log_magic(&mut log).map_err(|e| {
            emit!(logger, Level::Error, "invalid log {}: {}", log_path.display(), e);
            e
        })?;
        let log_size = log.metadata()?.len();

        let index_path = root.join(INDEX_FILE);
        let index = DiskIndex::open(&index_path, &logger).map_err(|e| {
            emit!(logger, Level::Error, "invalid index {}: {}", index_path.display(), e);
            e
        })?;

        emit!(
            logger,
            Level::Debug,
            "opened store {} ({} entries, {} log bytes)",
            root.display(),
            index.len(),
            log_size
        );

        Ok(Self {
            root,
            log,
            log_size,
            index,
            sync_writes: false,
            logger,
        })
    }

    /// Fsync log and index after every put
    pub fn set_sync_writes(&mut self, sync_writes: bool) {
        self.sync_writes = sync_writes;
    }

    /// Directory this store lives in
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Report a corrupt read and build the error for it
    fn corrupt(&self, addr: &Address, offset: u64, what: &str) -> StoreError {
        emit!(
            self.logger,
            Level::Error,
            "block {} at log offset {}: {}",
            addr,
            offset,
            what
        );
        StoreError::Corrupt(format!("block {} at log offset {}: {}", addr, offset, what))
    }
}

impl Backend for FileStore {
    fn put(&mut self, data: &[u8]) -> StoreResult<Address> {
        if data.len() > MAX_BLOCK_SIZE {
            return Err(StoreError::TooLarge(data.len()));
        }

        let addr = Address::of(data);
        let parent = match self.index.lookup(&addr)? {
            Lookup::Found { .. } => return Ok(addr),
            Lookup::Vacant { parent } => parent,
        };

        let buf = record::encode_record(addr, data)?;
        let offset = self.log_size;
        self.log.seek(SeekFrom::Start(offset))?;
        self.log.write_all(&buf)?;
        self.log_size += buf.len() as u64;

        self.index.insert(addr, offset, parent)?;

        if self.sync_writes {
            self.log.sync_data()?;
            self.index.sync()?;
        }

        emit!(
            self.logger,
            Level::Trace,
            "stored {} ({} bytes) at log offset {}",
            addr,
            data.len(),
            offset
        );
        Ok(addr)
    }

    fn get(&mut self, addr: &Address, buf: &mut [u8]) -> StoreResult<usize> {
        let offset = self
            .index
            .find(addr)?
            .ok_or(StoreError::NotFound(*addr))?;

        self.log.seek(SeekFrom::Start(offset))?;
        let header = match RecordHeader::read(&mut self.log) {
            Ok(header) => header,
            Err(StoreError::Corrupt(_)) => return Err(self.corrupt(addr, offset, "invalid magic in log")),
            Err(e) => {
                emit!(self.logger, Level::Error, "could not read log entry at {}: {}", offset, e);
                return Err(e);
            }
        };
        if header.address != *addr {
            return Err(self.corrupt(addr, offset, "log record names a different block"));
        }

        let mut payload = vec![0u8; header.len as usize];
        if let Err(e) = self.log.read_exact(&mut payload) {
            emit!(self.logger, Level::Error, "could not read log data at {}: {}", offset, e);
            return Err(e.into());
        }
        if Address::of(&payload) != *addr {
            return Err(self.corrupt(addr, offset, "log data did not verify against its hash"));
        }

        let n = payload.len().min(buf.len());
        buf[..n].copy_from_slice(&payload[..n]);
        Ok(payload.len())
    }

    fn release(&mut self) -> StoreResult<()> {
        self.log.sync_all()?;
        self.index.sync()?;
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            entries: self.index.len(),
            bytes: self.log_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::{self, capture::Capture};
    use crate::store::record::RECORD_HEADER_SIZE;
    use rand::RngCore;
    use tempfile::TempDir;

    fn create_test_store() -> (TempDir, FileStore) {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("store");
        FileStore::create(&root).unwrap();
        let store = FileStore::open(&root, logging::discard()).unwrap();
        (temp, store)
    }

    fn read(store: &mut FileStore, addr: &Address) -> StoreResult<Vec<u8>> {
        let mut buf = vec![0u8; MAX_BLOCK_SIZE];
        let len = store.get(addr, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    #[test]
    fn test_file_store_put_get() {
        let (_temp, mut store) = create_test_store();

        let data = b"hello world";
        let addr = store.put(data).unwrap();
        assert_eq!(addr, Address::of(data));
        assert_eq!(read(&mut store, &addr).unwrap(), data);
    }

    #[test]
    fn test_file_store_dedup() {
        let (_temp, mut store) = create_test_store();

        let data = b"duplicate data";
        let first = store.put(data).unwrap();
        let size = store.stats().bytes;

        let second = store.put(data).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.stats().bytes, size);
        assert_eq!(store.stats().entries, 1);
    }

    #[test]
    fn test_file_store_not_found() {
        let (_temp, mut store) = create_test_store();
        store.put(b"something else").unwrap();

        let addr = Address::of(b"nonexistent");
        assert!(matches!(read(&mut store, &addr), Err(StoreError::NotFound(a)) if a == addr));
    }

    #[test]
    fn test_file_store_empty_payload() {
        let (_temp, mut store) = create_test_store();
        let addr = store.put(b"").unwrap();
        assert_eq!(read(&mut store, &addr).unwrap(), b"");
    }

    #[test]
    fn test_file_store_many_random_blocks() {
        let (_temp, mut store) = create_test_store();
        let mut rng = rand::thread_rng();

        let mut blocks = Vec::new();
        for i in 0..200 {
            let mut data = vec![0u8; (i * 37) % 5000];
            rng.fill_bytes(&mut data);
            let addr = store.put(&data).unwrap();
            blocks.push((addr, data));
        }
        for (addr, data) in &blocks {
            assert_eq!(&read(&mut store, addr).unwrap(), data);
        }
    }

    #[test]
    fn test_file_store_max_size() {
        let (_temp, mut store) = create_test_store();

        let data = vec![0x5a; MAX_BLOCK_SIZE];
        let addr = store.put(&data).unwrap();
        assert_eq!(read(&mut store, &addr).unwrap(), data);

        let too_big = vec![0x5a; MAX_BLOCK_SIZE + 1];
        assert!(matches!(store.put(&too_big), Err(StoreError::TooLarge(_))));
    }

    #[test]
    fn test_file_store_reopen() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("store");
        FileStore::create(&root).unwrap();

        let addrs: Vec<Address> = {
            let mut store = FileStore::open(&root, logging::discard()).unwrap();
            let addrs = (0..10u8).map(|i| store.put(&[i; 100]).unwrap()).collect();
            store.release().unwrap();
            addrs
        };

        let mut store = FileStore::open(&root, logging::discard()).unwrap();
        assert_eq!(store.stats().entries, 10);
        for (i, addr) in addrs.iter().enumerate() {
            assert_eq!(read(&mut store, addr).unwrap(), vec![i as u8; 100]);
        }

        // Appends continue after the existing records
        let size = store.stats().bytes;
        store.put(b"after reopen").unwrap();
        assert_eq!(store.stats().bytes, size + RECORD_HEADER_SIZE + 12);
    }

    #[test]
    fn test_put_after_unlinked_index_entry() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("store");
        FileStore::create(&root).unwrap();

        let orphan = Address::of(b"orphan");
        {
            let mut store = FileStore::open(&root, logging::discard()).unwrap();
            store.put(b"first").unwrap();
            // Counted index entry that no parent links to
            store.index.insert(orphan, 0, None).unwrap();
            store.release().unwrap();
        }

        let mut store = FileStore::open(&root, logging::discard()).unwrap();
        assert_eq!(store.stats().entries, 2);
        assert!(matches!(read(&mut store, &orphan), Err(StoreError::NotFound(_))));

        assert_eq!(store.put(b"orphan").unwrap(), orphan);
        assert_eq!(read(&mut store, &orphan).unwrap(), b"orphan");
        assert_eq!(read(&mut store, &Address::of(b"first")).unwrap(), b"first");
    }

    #[test]
    fn test_create_twice_fails() {
        let temp = TempDir::new().unwrap();
        FileStore::create(temp.path()).unwrap();
        assert!(matches!(FileStore::create(temp.path()), Err(StoreError::Io(_))));
    }

    #[test]
    fn test_open_missing_store() {
        let temp = TempDir::new().unwrap();
        let result = FileStore::open(temp.path().join("absent"), logging::discard());
        assert!(matches!(result, Err(StoreError::Io(_))));
    }

    #[test]
    fn test_open_rejects_foreign_log() {
        let temp = TempDir::new().unwrap();
        FileStore::create(temp.path()).unwrap();
        fs::write(temp.path().join(LOG_FILE), b"some other file format").unwrap();

        let result = FileStore::open(temp.path(), logging::discard());
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
    }

    /// Flip one byte of the log file at `offset`
    fn flip_log_byte(root: &Path, offset: u64) {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(root.join(LOG_FILE))
            .unwrap();
        let mut byte = [0u8; 1];
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.read_exact(&mut byte).unwrap();
        byte[0] ^= 0xff;
        file.seek(SeekFrom::Start(offset)).unwrap();
        file.write_all(&byte).unwrap();
    }

    #[test]
    fn test_corrupt_payload_detected() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("store");
        FileStore::create(&root).unwrap();

        let capture = Capture::new();
        let logger: Logger = capture.clone();
        let mut store = FileStore::open(&root, logger).unwrap();
        store.put(b"first block").unwrap();
        let addr = store.put(b"second block").unwrap();

        // Second record starts after the header and the first record
        let offset = LOG_MAGIC.len() as u64 + RECORD_HEADER_SIZE + 11;
        flip_log_byte(&root, offset + RECORD_HEADER_SIZE + 3);

        assert!(matches!(read(&mut store, &addr), Err(StoreError::Corrupt(_))));
        assert!(capture.contains(Level::Error, "did not verify"));
    }

    #[test]
    fn test_corrupt_record_magic_detected() {
        let (temp, mut store) = create_test_store();
        let addr = store.put(b"block").unwrap();

        flip_log_byte(&temp.path().join("store"), LOG_MAGIC.len() as u64);
        assert!(matches!(read(&mut store, &addr), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_corrupt_record_name_detected() {
        let (temp, mut store) = create_test_store();
        let addr = store.put(b"block").unwrap();

        flip_log_byte(&temp.path().join("store"), LOG_MAGIC.len() as u64 + 4);
        assert!(matches!(read(&mut store, &addr), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_short_buffer() {
        let (_temp, mut store) = create_test_store();
        let addr = store.put(b"abcdefgh").unwrap();

        let mut buf = [0u8; 3];
        assert_eq!(store.get(&addr, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"abc");
    }
}
