//! Log file format
//!
//! ```text
//! [HEADER: 14 bytes]   format magic
//! [RECORD]*
//!   - magic:   4 bytes
//!   - address: 32 bytes
//!   - length:  2 bytes (u16 LE)
//!   - flags:   1 byte
//!   - payload: length bytes
//! ```

use super::{StoreError, StoreResult};
use crate::address::{Address, ADDRESS_SIZE};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Magic at the start of every log file
pub const LOG_MAGIC: [u8; 14] = *b"vcstore-log-1\n";

/// Magic at the start of every record
pub const RECORD_MAGIC: [u8; 4] = [0xca, 0xe5, 0x7a, 0x93];

/// Size of the fixed record header preceding each payload
pub const RECORD_HEADER_SIZE: u64 = 4 + ADDRESS_SIZE as u64 + 2 + 1;

/// Fixed part of a log record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub address: Address,
    pub len: u16,
    pub flags: u8,
}

impl RecordHeader {
    pub fn new(address: Address, len: u16) -> Self {
        Self {
            address,
            len,
            flags: 0,
        }
    }

    /// Read a record header, rejecting a wrong record magic
    pub fn read<R: Read>(reader: &mut R) -> StoreResult<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != RECORD_MAGIC {
            return Err(StoreError::Corrupt(format!(
                "invalid record magic {}",
                hex::encode(magic)
            )));
        }

        let mut address = [0u8; ADDRESS_SIZE];
        reader.read_exact(&mut address)?;
        let len = reader.read_u16::<LittleEndian>()?;
        let flags = reader.read_u8()?;

        Ok(Self {
            address: Address::from_bytes(address),
            len,
            flags,
        })
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_all(&RECORD_MAGIC)?;
        writer.write_all(self.address.as_bytes())?;
        writer.write_u16::<LittleEndian>(self.len)?;
        writer.write_u8(self.flags)?;
        Ok(())
    }

    /// Total size of the record on disk, header included
    pub fn record_size(&self) -> u64 {
        RECORD_HEADER_SIZE + self.len as u64
    }
}

/// Encode a complete record (header and payload) into one buffer
pub fn encode_record(address: Address, payload: &[u8]) -> StoreResult<Vec<u8>> {
    let len = u16::try_from(payload.len()).map_err(|_| StoreError::TooLarge(payload.len()))?;
    let header = RecordHeader::new(address, len);

    let mut buf = Vec::with_capacity(header.record_size() as usize);
    header.write(&mut buf)?;
    buf.extend_from_slice(payload);
    Ok(buf)
}

/// Check the magic at the start of a log file
pub fn check_log_magic<R: Read>(reader: &mut R) -> StoreResult<()> {
    let mut magic = [0u8; LOG_MAGIC.len()];
    reader.read_exact(&mut magic)?;
    if magic != LOG_MAGIC {
        return Err(StoreError::Corrupt("invalid log magic".to_string()));
    }
    Ok(())
}
