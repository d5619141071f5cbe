//! ZIP container access.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use thiserror::Error;
use zip::ZipArchive;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("cannot open archive container: {0}")]
    Corrupt(zip::result::ZipError),
    #[error("cannot read archive member: {0}")]
    Member(#[from] zip::result::ZipError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Name, size and kind of one container entry.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub name: String,
    pub size: u64,
    /// Regular file whose name ends in `.xml`; everything else is skipped.
    pub is_xml: bool,
}

/// Reader over one downloaded archive. Entries are visited in container
/// order; member bytes are read one entry at a time, never all at once.
#[derive(Debug)]
pub struct ArchiveReader {
    zip: ZipArchive<File>,
}

impl ArchiveReader {
    /// Open an archive. An unreadable container aborts the whole archive;
    /// there is no partial member list.
    pub fn open(path: &Path) -> Result<Self, ArchiveError> {
        let file = File::open(path)?;
        let zip = ZipArchive::new(file).map_err(ArchiveError::Corrupt)?;
        Ok(Self { zip })
    }

    pub fn len(&self) -> usize {
        self.zip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zip.is_empty()
    }

    /// Entry metadata without decompressing its payload.
    pub fn entry_info(&mut self, index: usize) -> Result<EntryInfo, ArchiveError> {
        let entry = self.zip.by_index(index)?;
        let name = entry.name().to_string();
        let is_xml = !entry.is_dir() && name.ends_with(".xml");
        Ok(EntryInfo {
            size: entry.size(),
            name,
            is_xml,
        })
    }

    /// Decompress one entry into memory.
    pub fn read_entry(&mut self, index: usize) -> Result<Vec<u8>, ArchiveError> {
        let mut entry = self.zip.by_index(index)?;
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf)?;
        Ok(buf)
    }
}
