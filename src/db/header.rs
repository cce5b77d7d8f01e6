// src/db/header.rs
// On-disk SQLite header parsing, read straight from the file

//! Reads the first 100 bytes of a database file without going through SQLite.
//!
//! A connection that already has pages cached can keep answering queries after
//! the header on disk has been overwritten, so the integrity checker looks at
//! the raw bytes first.

use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Size of the SQLite database header in bytes
pub const HEADER_SIZE: usize = 100;

/// Magic string at the start of every SQLite file
const MAGIC: &[u8; 16] = b"SQLite format 3\0";

/// Fields of the header the maintenance code cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseHeader {
    /// Effective page size in bytes (the raw value 1 means 65536)
    pub page_size: u32,
    /// 1 = legacy rollback journal, 2 = WAL
    pub write_version: u8,
    pub read_version: u8,
    pub file_change_counter: u32,
    /// In-header database size in pages
    pub page_count: u32,
    pub freelist_pages: u32,
    /// 1 = UTF-8, 2 = UTF-16le, 3 = UTF-16be
    pub text_encoding: u32,
    pub user_version: u32,
    pub application_id: u32,
}

fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

impl DatabaseHeader {
    /// Parse a header from raw bytes.
    pub fn parse(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() < HEADER_SIZE {
            return Err(format!(
                "header too short: {} bytes, expected {}",
                bytes.len(),
                HEADER_SIZE
            ));
        }
        if &bytes[0..16] != MAGIC {
            return Err("file header is not a SQLite database header".to_string());
        }

        let raw_page_size = u16::from_be_bytes([bytes[16], bytes[17]]);
        let page_size = match raw_page_size {
            1 => 65_536,
            n if (512..=32_768).contains(&n) && n.is_power_of_two() => u32::from(n),
            n => return Err(format!("invalid page size {n} in database header")),
        };

        let write_version = bytes[18];
        let read_version = bytes[19];
        if !matches!(write_version, 1 | 2) || !matches!(read_version, 1 | 2) {
            return Err(format!(
                "invalid file format versions {write_version}/{read_version} in database header"
            ));
        }

        Ok(Self {
            page_size,
            write_version,
            read_version,
            file_change_counter: be_u32(bytes, 24),
            page_count: be_u32(bytes, 28),
            freelist_pages: be_u32(bytes, 36),
            text_encoding: be_u32(bytes, 56),
            user_version: be_u32(bytes, 60),
            application_id: be_u32(bytes, 68),
        })
    }

    /// Read and parse the header of a database file.
    ///
    /// Returns `Ok(None)` when the file is shorter than a header (new or empty
    /// database), since SQLite has not written one yet.
    pub fn read_from(path: &Path) -> std::io::Result<Option<Result<Self, String>>> {
        let mut file = File::open(path)?;
        let mut buf = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < HEADER_SIZE {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled < HEADER_SIZE {
            return Ok(None);
        }
        Ok(Some(Self::parse(&buf)))
    }

    pub fn is_wal(&self) -> bool {
        self.write_version == 2
    }
}
