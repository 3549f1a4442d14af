//! Persistent address index
//!
//! An on-disk binary search tree keyed by address bytes, mapping each
//! address to the offset of its record in the log.
//!
//! ```text
//! [HEADER: 24 bytes]
//!   - magic: 14 bytes
//!   - reserved: 2 bytes
//!   - entry count: 8 bytes (u64 LE)
//! [ENTRY: 56 bytes]*
//!   - address: 32 bytes
//!   - left child: 8 bytes (u64 LE, 0 = none)
//!   - right child: 8 bytes (u64 LE, 0 = none)
//!   - log offset: 8 bytes (u64 LE)
//! ```
//!
//! Entry 0 is the root. The tree is never rebalanced.
//!
//! Inserts write the new entry, then the entry count, then the link from its
//! parent. A crash between those steps leaves either a torn tail past the
//! counted entries (dropped at open) or a counted entry nothing links to
//! (never found, harmless).

use super::{StoreError, StoreResult};
use crate::address::{Address, ADDRESS_SIZE};
use crate::logging::{emit, Logger};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::Level;
use std::cmp::Ordering;
use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Magic at the start of every index file
pub const INDEX_MAGIC: [u8; 14] = *b"vcstore-idx-1\n";

/// Size of the index header
pub const INDEX_HEADER_SIZE: u64 = 24;

/// Size of one index entry
pub const INDEX_ENTRY_SIZE: u64 = ADDRESS_SIZE as u64 + 8 + 8 + 8;

const COUNT_OFFSET: u64 = 16;

/// One node of the on-disk search tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub address: Address,
    pub left: u64,
    pub right: u64,
    pub offset: u64,
}

impl IndexEntry {
    fn leaf(address: Address, offset: u64) -> Self {
        Self {
            address,
            left: 0,
            right: 0,
            offset,
        }
    }

    fn read<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut address = [0u8; ADDRESS_SIZE];
        reader.read_exact(&mut address)?;
        let left = reader.read_u64::<LittleEndian>()?;
        let right = reader.read_u64::<LittleEndian>()?;
        let offset = reader.read_u64::<LittleEndian>()?;
        Ok(Self {
            address: Address::from_bytes(address),
            left,
            right,
            offset,
        })
    }

    fn write<W: Write>(&self, writer: &mut W) -> std::io::Result<()> {
        writer.write_all(self.address.as_bytes())?;
        writer.write_u64::<LittleEndian>(self.left)?;
        writer.write_u64::<LittleEndian>(self.right)?;
        writer.write_u64::<LittleEndian>(self.offset)?;
        Ok(())
    }
}

/// Which child link of a parent a new entry hangs from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// Outcome of a search
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The address is indexed at this slot
    Found { slot: u64, entry: IndexEntry },
    /// The address is absent; an insert attaches below `parent`
    /// (`None` when the index is empty)
    Vacant { parent: Option<(u64, Side)> },
}

/// Handle on an open index file
pub struct DiskIndex {
    file: File,
    len: u64,
}

impl DiskIndex {
    /// Create an empty index file. Fails if the file exists.
    pub fn create<P: AsRef<Path>>(path: P) -> StoreResult<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_ref())?;

        let mut header = Vec::with_capacity(INDEX_HEADER_SIZE as usize);
        header.write_all(&INDEX_MAGIC)?;
        header.write_all(&[0u8; 2])?;
        header.write_u64::<LittleEndian>(0)?;
        file.write_all(&header)?;
        file.sync_all()?;
        Ok(())
    }

    /// Open an index file, validating its header against its size
    pub fn open<P: AsRef<Path>>(path: P, logger: &Logger) -> StoreResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())?;

        let mut header = [0u8; INDEX_HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if header[..INDEX_MAGIC.len()] != INDEX_MAGIC {
            return Err(StoreError::Corrupt("invalid index magic".to_string()));
        }
        let len = Cursor::new(&header[COUNT_OFFSET as usize..]).read_u64::<LittleEndian>()?;

        let expected = len
            .checked_mul(INDEX_ENTRY_SIZE)
            .and_then(|n| n.checked_add(INDEX_HEADER_SIZE))
            .ok_or_else(|| StoreError::Corrupt(format!("invalid index entry count {}", len)))?;
        let actual = file.metadata()?.len();

        match actual.cmp(&expected) {
            Ordering::Less => {
                return Err(StoreError::Corrupt(format!(
                    "index holds {} bytes but its header claims {} entries",
                    actual, len
                )));
            }
            Ordering::Greater => {
                emit!(
                    logger,
                    Level::Warn,
                    "index has {} bytes past its {} entries, truncating",
                    actual - expected,
                    len
                );
                file.set_len(expected)?;
            }
            Ordering::Equal => {}
        }

        Ok(Self { file, len })
    }

    /// Number of entries
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read the entry in `slot`
    pub fn entry(&mut self, slot: u64) -> StoreResult<IndexEntry> {
        if slot >= self.len {
            return Err(StoreError::Corrupt(format!(
                "index link to slot {} beyond {} entries",
                slot, self.len
            )));
        }
        self.file.seek(SeekFrom::Start(slot_offset(slot)))?;
        Ok(IndexEntry::read(&mut self.file)?)
    }

    /// Walk the tree from the root looking for `addr`
    pub fn lookup(&mut self, addr: &Address) -> StoreResult<Lookup> {
        if self.len == 0 {
            return Ok(Lookup::Vacant { parent: None });
        }

        let mut slot = 0;
        // A well-formed tree cannot be deeper than it has entries
        for _ in 0..self.len {
            let entry = self.entry(slot)?;
            match addr.cmp(&entry.address) {
                Ordering::Equal => return Ok(Lookup::Found { slot, entry }),
                Ordering::Less if entry.left == 0 => {
                    return Ok(Lookup::Vacant {
                        parent: Some((slot, Side::Left)),
                    })
                }
                Ordering::Less => slot = entry.left,
                Ordering::Greater if entry.right == 0 => {
                    return Ok(Lookup::Vacant {
                        parent: Some((slot, Side::Right)),
                    })
                }
                Ordering::Greater => slot = entry.right,
            }
        }

        Err(StoreError::Corrupt("cycle in index tree".to_string()))
    }

    /// Log offset recorded for `addr`, if indexed
    pub fn find(&mut self, addr: &Address) -> StoreResult<Option<u64>> {
        Ok(match self.lookup(addr)? {
            Lookup::Found { entry, .. } => Some(entry.offset),
            Lookup::Vacant { .. } => None,
        })
    }

    /// Attach a new entry at the position a previous [`lookup`](Self::lookup)
    /// reported as vacant. Returns the new entry's slot.
    pub fn insert(
        &mut self,
        addr: Address,
        offset: u64,
        parent: Option<(u64, Side)>,
    ) -> StoreResult<u64> {
        let slot = self.len;

        let mut buf = Vec::with_capacity(INDEX_ENTRY_SIZE as usize);
        IndexEntry::leaf(addr, offset).write(&mut buf)?;
        self.file.seek(SeekFrom::Start(slot_offset(slot)))?;
        self.file.write_all(&buf)?;

        self.file.seek(SeekFrom::Start(COUNT_OFFSET))?;
        self.file.write_u64::<LittleEndian>(slot + 1)?;
        self.len = slot + 1;

        if let Some((parent_slot, side)) = parent {
            let mut entry = self.entry(parent_slot)?;
            match side {
                Side::Left => entry.left = slot,
                Side::Right => entry.right = slot,
            }
            let mut buf = Vec::with_capacity(INDEX_ENTRY_SIZE as usize);
            entry.write(&mut buf)?;
            self.file.seek(SeekFrom::Start(slot_offset(parent_slot)))?;
            self.file.write_all(&buf)?;
        }

        Ok(slot)
    }

    /// Flush to stable storage
    pub fn sync(&mut self) -> StoreResult<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

fn slot_offset(slot: u64) -> u64 {
    INDEX_HEADER_SIZE + slot * INDEX_ENTRY_SIZE
}
