//! In-memory backend for tests, scratch trees, and embedding.

use super::{Backend, StoreError, StoreResult, StoreStats, MAX_BLOCK_SIZE};
use crate::address::Address;
use std::collections::HashMap;

/// Backend keeping every payload in a hash map
#[derive(Default)]
pub struct MemoryBackend {
    blocks: HashMap<Address, Box<[u8]>>,
    bytes: u64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `addr` is stored
    pub fn contains(&self, addr: &Address) -> bool {
        self.blocks.contains_key(addr)
    }
}

impl Backend for MemoryBackend {
    fn put(&mut self, data: &[u8]) -> StoreResult<Address> {
        if data.len() > MAX_BLOCK_SIZE {
            return Err(StoreError::TooLarge(data.len()));
        }

        let addr = Address::of(data);
        if !self.blocks.contains_key(&addr) {
            self.blocks.insert(addr, data.into());
            self.bytes += data.len() as u64;
        }
        Ok(addr)
    }

    fn get(&mut self, addr: &Address, buf: &mut [u8]) -> StoreResult<usize> {
        let data = self.blocks.get(addr).ok_or(StoreError::NotFound(*addr))?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok(data.len())
    }

    fn release(&mut self) -> StoreResult<()> {
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            entries: self.blocks.len() as u64,
            bytes: self.bytes,
        }
    }
}
