//! On-disk trace: a header, a memory map naming every traced global, then the packets.
//!
//! ```text
//!   magic     "HTRC"
//!   version   u32
//!   flags     u32    bit 0: FINISHED
//!   globals   u32    number of memory map entries
//!   data      u64    file offset of the packet stream
//!   map       { offset u32, size u32, name_len u32, name, padding to 4 } * globals
//!   packets
//! ```
//!
//! The FINISHED flag is written last, so a file cut short by a crash is never mistaken
//! for a complete one.

use std::io::{self, Seek, SeekFrom, Write};

use crate::error::{Error, Result};
use crate::packet::Packets;
use crate::registry::TracedGlobal;

pub const MAGIC: &[u8; 4] = b"HTRC";
pub const VERSION: u32 = 1;
pub const FLAG_FINISHED: u32 = 1;

pub const HEADER_SIZE: usize = 24;

const FLAGS_OFFSET: u64 = 8;
const ENTRY_HEADER_SIZE: usize = 12;

/// Write a complete trace.
///
/// Performs no allocation beyond what `out` does itself, so an unbuffered `File` may be
/// written from a signal handler.
pub fn write_trace<W: Write + Seek>(out: &mut W, globals: &[TracedGlobal], packets: &[u8]) -> io::Result<()> {
    let data_offset = HEADER_SIZE + globals.iter().map(|g| entry_size(g.name.len())).sum::<usize>();

    let mut header = [0u8; HEADER_SIZE];
    header[0..4].copy_from_slice(MAGIC);
    header[4..8].copy_from_slice(&VERSION.to_le_bytes());
    header[8..12].copy_from_slice(&0u32.to_le_bytes());
    header[12..16].copy_from_slice(&(globals.len() as u32).to_le_bytes());
    header[16..24].copy_from_slice(&(data_offset as u64).to_le_bytes());
    out.write_all(&header)?;

    for global in globals {
        let name = global.name.as_bytes();

        let mut entry = [0u8; ENTRY_HEADER_SIZE];
        entry[0..4].copy_from_slice(&global.offset.to_le_bytes());
        entry[4..8].copy_from_slice(&global.size.to_le_bytes());
        entry[8..12].copy_from_slice(&(name.len() as u32).to_le_bytes());
        out.write_all(&entry)?;
        out.write_all(name)?;

        let padding = entry_size(name.len()) - ENTRY_HEADER_SIZE - name.len();
        out.write_all(&[0u8; 3][..padding])?;
    }

    out.write_all(packets)?;

    out.seek(SeekFrom::Start(FLAGS_OFFSET))?;
    out.write_all(&FLAG_FINISHED.to_le_bytes())?;
    out.seek(SeekFrom::End(0))?;
    out.flush()
}

fn entry_size(name_len: usize) -> usize {
    (ENTRY_HEADER_SIZE + name_len + 3) & !3
}

/// A memory map entry read back from a trace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MapEntry {
    pub offset: u32,
    pub size: u32,
    pub name: String,
}

/// A parsed trace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TraceFile {
    pub version: u32,
    pub flags: u32,
    pub globals: Vec<MapEntry>,
    pub data: Vec<u8>,
}

impl TraceFile {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut reader = Reader { bytes, cursor: 0 };

        if reader.take(4)? != MAGIC {
            return Err(Error::Format("bad magic".into()));
        }

        let version = reader.u32()?;
        if version != VERSION {
            return Err(Error::Format(format!("unsupported version {}", version)));
        }

        let flags = reader.u32()?;
        let count = reader.u32()?;
        let data_offset = reader.u64()? as usize;

        let mut globals = Vec::with_capacity(count.min(1024) as usize);

        for _ in 0..count {
            let start = reader.cursor;
            let offset = reader.u32()?;
            let size = reader.u32()?;
            let name_len = reader.u32()? as usize;

            let name = std::str::from_utf8(reader.take(name_len)?)
                .map_err(|_| Error::Format("global name is not UTF-8".into()))?
                .to_owned();

            reader.cursor = start + entry_size(name_len);
            globals.push(MapEntry { offset, size, name });
        }

        if data_offset < reader.cursor || data_offset > bytes.len() {
            return Err(Error::Format(format!("packet stream offset {} out of bounds", data_offset)));
        }

        Ok(Self {
            version,
            flags,
            globals,
            data: bytes[data_offset..].to_vec(),
        })
    }

    pub fn is_finished(&self) -> bool {
        self.flags & FLAG_FINISHED != 0
    }

    pub fn packets(&self) -> Packets<'_> {
        Packets::new(&self.data)
    }
}

struct Reader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.cursor.checked_add(len).filter(|&end| end <= self.bytes.len());
        let end = end.ok_or_else(|| Error::Format("unexpected end of file".into()))?;

        let bytes = &self.bytes[self.cursor..end];
        self.cursor = end;

        Ok(bytes)
    }

    fn u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }
}
