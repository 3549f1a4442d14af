//! Content-addressed block store
//!
//! A [`Backend`] persists payloads under their content address. [`Store`]
//! wraps a backend with the associative front cache and is what the block
//! tree and the command-line tool talk to.

pub mod cache;
pub mod file;
pub mod index;
pub mod memory;
pub mod record;

use crate::address::Address;
use crate::config::StoreConfig;
use crate::logging::{emit, Logger};
use log::Level;
use serde::Serialize;
use std::path::Path;
use thiserror::Error;

pub use cache::{BlockCache, Cached};
pub use file::FileStore;
pub use memory::MemoryBackend;

/// Largest payload a single block may carry
pub const MAX_BLOCK_SIZE: usize = 65535;

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("block not found: {0}")]
    NotFound(Address),

    #[error("data corruption detected: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("block of {0} bytes exceeds the maximum block size")]
    TooLarge(usize),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Bookkeeping counters of a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Number of distinct payloads stored
    pub entries: u64,
    /// Bytes of payload data held (log size for the file backend)
    pub bytes: u64,
}

/// Backend trait - the persistence contract beneath the cache
pub trait Backend: Send {
    /// Store a payload and return its address.
    /// Storing the same bytes again must not store a second copy.
    fn put(&mut self, data: &[u8]) -> StoreResult<Address>;

    /// Copy up to `buf.len()` bytes of the payload into `buf`.
    /// Returns the full payload length, which may exceed `buf.len()`.
    /// Implementations verify the payload against `addr` before copying.
    fn get(&mut self, addr: &Address, buf: &mut [u8]) -> StoreResult<usize>;

    /// Flush everything to stable storage.
    fn release(&mut self) -> StoreResult<()>;

    /// Current counters.
    fn stats(&self) -> StoreStats;
}

/// Cached content store
pub struct Store {
    backend: Box<dyn Backend>,
    cache: Option<BlockCache>,
    logger: Logger,
}

impl Store {
    /// Wrap a backend with the front cache
    pub fn new(backend: Box<dyn Backend>, logger: Logger) -> Self {
        Self {
            backend,
            cache: Some(BlockCache::new()),
            logger,
        }
    }

    /// Wrap a backend without a cache; every call reaches the backend
    pub fn uncached(backend: Box<dyn Backend>, logger: Logger) -> Self {
        Self {
            backend,
            cache: None,
            logger,
        }
    }

    /// Store a payload, returning its address
    pub fn put(&mut self, data: &[u8]) -> StoreResult<Address> {
        if data.len() > MAX_BLOCK_SIZE {
            return Err(StoreError::TooLarge(data.len()));
        }

        let addr = self.backend.put(data)?;
        if let Some(cache) = self.cache.as_mut() {
            cache.insert(addr, Cached::Present(data.into()));
        }
        Ok(addr)
    }

    /// Fetch a payload into `buf`, returning its full length
    pub fn get(&mut self, addr: &Address, buf: &mut [u8]) -> StoreResult<usize> {
        if let Some(cache) = self.cache.as_mut() {
            match cache.lookup(addr) {
                Some(Cached::Present(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    return Ok(data.len());
                }
                Some(Cached::Missing) => return Err(StoreError::NotFound(*addr)),
                None => {}
            }
        }

        match self.backend.get(addr, buf) {
            Ok(len) => {
                // Only a complete payload can be served from the cache later
                if len <= buf.len() {
                    if let Some(cache) = self.cache.as_mut() {
                        cache.insert(*addr, Cached::Present(buf[..len].into()));
                    }
                }
                Ok(len)
            }
            Err(StoreError::NotFound(missing)) => {
                if let Some(cache) = self.cache.as_mut() {
                    cache.insert(missing, Cached::Missing);
                }
                Err(StoreError::NotFound(missing))
            }
            Err(e) => Err(e),
        }
    }

    /// Fetch a whole payload
    pub fn read(&mut self, addr: &Address) -> StoreResult<Vec<u8>> {
        let mut buf = vec![0u8; MAX_BLOCK_SIZE];
        let len = self.get(addr, &mut buf)?;
        buf.truncate(len);
        Ok(buf)
    }

    /// Backend counters
    pub fn stats(&self) -> StoreStats {
        self.backend.stats()
    }

    /// Logger this store reports through
    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Flush and close the store
    pub fn release(mut self) -> StoreResult<()> {
        emit!(self.logger, Level::Debug, "releasing store");
        self.backend.release()
    }
}

/// Create an empty file store in `dir`
pub fn create_store<P: AsRef<Path>>(dir: P) -> StoreResult<()> {
    FileStore::create(dir)
}

/// Open the file store in `dir` behind the front cache
pub fn open_store<P: AsRef<Path>>(
    dir: P,
    config: &StoreConfig,
    logger: Logger,
) -> StoreResult<Store> {
    let mut backend = FileStore::open(dir, logger.clone())?;
    backend.set_sync_writes(config.sync_writes);

    let backend: Box<dyn Backend> = Box::new(backend);
    Ok(if config.cache {
        Store::new(backend, logger)
    } else {
        Store::uncached(backend, logger)
    })
}
