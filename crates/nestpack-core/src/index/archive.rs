//! Open ZIP archives backing the index
//!
//! The root container is read through its file handle; nested archives are
//! held in memory once extracted from their parent.

use std::fs::File;
use std::io::{Cursor, Read, Seek};
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use zip::result::{ZipError, ZipResult};
use zip::ZipArchive;

/// Upper bound for buffer preallocation based on the size an entry claims.
const PREALLOC_LIMIT: u64 = 16 * 1024 * 1024;

/// Raw listing information for one archive entry.
#[derive(Debug, Clone)]
pub(crate) struct RawEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// An opened archive that entries can be read from.
pub(crate) enum ArchiveHandle {
    /// The root container on disk.
    File(Mutex<ZipArchive<File>>),

    /// A nested archive kept in memory. Cloning the archive is cheap: the
    /// central directory and the buffer are shared.
    Memory(ZipArchive<Cursor<Arc<[u8]>>>),
}

impl ArchiveHandle {
    /// Open an archive file on disk.
    pub fn open_file(path: &Path) -> ZipResult<Self> {
        let file = File::open(path)?;
        Ok(ArchiveHandle::File(Mutex::new(ZipArchive::new(file)?)))
    }

    /// Open an archive held in memory.
    pub fn from_bytes(bytes: Arc<[u8]>) -> ZipResult<Self> {
        Ok(ArchiveHandle::Memory(ZipArchive::new(Cursor::new(bytes))?))
    }

    /// List every entry of the archive, in central directory order.
    pub fn list(&self) -> ZipResult<Vec<RawEntry>> {
        match self {
            ArchiveHandle::File(archive) => list_entries(&mut archive.lock()),
            ArchiveHandle::Memory(archive) => list_entries(&mut archive.clone()),
        }
    }

    /// Read and decompress one entry.
    pub fn read_entry(&self, path: &str) -> ZipResult<Vec<u8>> {
        match self {
            ArchiveHandle::File(archive) => read_entry(&mut archive.lock(), path),
            ArchiveHandle::Memory(archive) => read_entry(&mut archive.clone(), path),
        }
    }
}

fn list_entries<R: Read + Seek>(archive: &mut ZipArchive<R>) -> ZipResult<Vec<RawEntry>> {
    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index_raw(i)?;
        entries.push(RawEntry {
            name: entry.name().to_string(),
            is_dir: entry.is_dir(),
            size: entry.size(),
        });
    }
    Ok(entries)
}

fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, path: &str) -> ZipResult<Vec<u8>> {
    let mut entry = archive.by_name(path)?;
    let mut bytes = Vec::with_capacity(entry.size().min(PREALLOC_LIMIT) as usize);
    entry.read_to_end(&mut bytes)?;
    Ok(bytes)
}

/// Extract `path` from an archive whose bytes are already in memory.
pub(crate) fn extract(archive_bytes: Vec<u8>, path: &str) -> ZipResult<Vec<u8>> {
    let mut archive = ZipArchive::new(Cursor::new(archive_bytes))?;
    read_entry(&mut archive, path)
}

/// Whether a ZIP error means "no such entry" rather than a broken archive.
pub(crate) fn is_not_found(err: &ZipError) -> bool {
    matches!(err, ZipError::FileNotFound)
}
