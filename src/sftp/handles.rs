//! Per-session table of open files and directory snapshots.

use bytes::Bytes;
use std::collections::HashMap;
use std::fs::Metadata;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::error::{Error, Result};
use crate::sftp::protocol::OpenFlags;

/// Opaque handle identifier, sent on the wire as 4 big-endian bytes.
///
/// Only [`HandleTable`] mints these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u32);

impl HandleId {
    pub fn get(self) -> u32 {
        self.0
    }

    pub fn to_bytes(self) -> Bytes {
        Bytes::copy_from_slice(&self.0.to_be_bytes())
    }

    fn parse(raw: &[u8]) -> Option<Self> {
        let raw: [u8; 4] = raw.try_into().ok()?;
        Some(Self(u32::from_be_bytes(raw)))
    }
}

/// A directory entry captured when the directory was opened.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub metadata: Metadata,
}

enum OpenHandle {
    File {
        path: PathBuf,
        file: File,
    },
    Dir {
        path: PathBuf,
        entries: Vec<DirEntry>,
        cursor: usize,
    },
}

/// Handles owned by one session; dropped (and thereby closed) with it.
pub struct HandleTable {
    open: HashMap<HandleId, OpenHandle>,
    /// Next identifier; `None` once the u32 space is spent.
    next: Option<u32>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            open: HashMap::new(),
            next: Some(0),
        }
    }

    #[cfg(test)]
    fn starting_at(next: u32) -> Self {
        Self {
            open: HashMap::new(),
            next: Some(next),
        }
    }

    pub fn len(&self) -> usize {
        self.open.len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    fn allocate(&mut self, handle: OpenHandle) -> Result<HandleId> {
        let id = self.next.ok_or(Error::HandleExhausted)?;
        self.next = id.checked_add(1);
        let id = HandleId(id);
        self.open.insert(id, handle);
        Ok(id)
    }

    fn lookup(&mut self, raw: &[u8]) -> Result<&mut OpenHandle> {
        HandleId::parse(raw)
            .and_then(|id| self.open.get_mut(&id))
            .ok_or(Error::UnknownHandle)
    }

    /// Open a regular file for reading.
    pub async fn create_file(&mut self, path: &Path, flags: OpenFlags) -> Result<HandleId> {
        if !flags.contains(OpenFlags::READ) || flags.wants_write() {
            return Err(Error::WriteDenied);
        }
        // Reserve the id before touching the disk so exhaustion never leaks a descriptor.
        if self.next.is_none() {
            return Err(Error::HandleExhausted);
        }

        let file = File::open(path).await?;
        if !file.metadata().await?.is_file() {
            return Err(Error::NotAFile);
        }

        self.allocate(OpenHandle::File {
            path: path.to_path_buf(),
            file,
        })
    }

    /// Snapshot a directory listing, sorted by name.
    pub async fn create_dir(&mut self, path: &Path) -> Result<HandleId> {
        if self.next.is_none() {
            return Err(Error::HandleExhausted);
        }

        let mut read_dir = fs::read_dir(path).await?;
        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await? {
            // A lossy name could never be opened again, so it is not listed.
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    tracing::debug!("Skipping non-UTF-8 name {:?} in {}", raw, path.display());
                    continue;
                }
            };
            // Entries removed between readdir and lstat are skipped.
            match entry.metadata().await {
                Ok(metadata) => entries.push(DirEntry { name, metadata }),
                Err(e) => {
                    tracing::debug!("Skipping {}: {}", entry.path().display(), e);
                }
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        self.allocate(OpenHandle::Dir {
            path: path.to_path_buf(),
            entries,
            cursor: 0,
        })
    }

    /// Read up to `len` bytes at `offset`. `None` means end of file.
    pub async fn read_file(&mut self, raw: &[u8], offset: u64, len: u32) -> Result<Option<Bytes>> {
        let file = match self.lookup(raw)? {
            OpenHandle::File { file, .. } => file,
            OpenHandle::Dir { .. } => return Err(Error::NotAFile),
        };

        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = vec![0u8; len as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        buf.truncate(filled);
        Ok(Some(Bytes::from(buf)))
    }

    /// Next entry of a directory snapshot. `None` once exhausted.
    pub fn list_next(&mut self, raw: &[u8]) -> Result<Option<DirEntry>> {
        match self.lookup(raw)? {
            OpenHandle::Dir {
                entries, cursor, ..
            } => {
                let entry = entries.get(*cursor).cloned();
                if entry.is_some() {
                    *cursor += 1;
                }
                Ok(entry)
            }
            OpenHandle::File { .. } => Err(Error::NotADirectory),
        }
    }

    /// Current metadata of whatever the handle refers to.
    pub async fn stat_handle(&mut self, raw: &[u8]) -> Result<Metadata> {
        match self.lookup(raw)? {
            OpenHandle::File { file, .. } => Ok(file.metadata().await?),
            OpenHandle::Dir { path, .. } => Ok(fs::metadata(path).await?),
        }
    }

    /// Path a handle was opened on.
    pub fn path_of(&mut self, raw: &[u8]) -> Result<&Path> {
        match self.lookup(raw)? {
            OpenHandle::File { path, .. } | OpenHandle::Dir { path, .. } => Ok(path),
        }
    }

    pub fn close(&mut self, raw: &[u8]) -> Result<()> {
        let id = HandleId::parse(raw).ok_or(Error::UnknownHandle)?;
        self.open.remove(&id).map(drop).ok_or(Error::UnknownHandle)
    }

    /// Release everything still open. Returns how many handles were dropped.
    pub fn close_all(&mut self) -> usize {
        let count = self.open.len();
        self.open.clear();
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const LOANS: &[u8] = b"id,borrower,amount\n1,alice,1200.00\n";

    fn fixture() -> TempDir {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("loans.csv"), LOANS).unwrap();
        std::fs::create_dir(tmp.path().join("archive")).unwrap();
        std::fs::write(tmp.path().join("archive").join("2023.csv"), b"old").unwrap();
        tmp
    }

    #[tokio::test]
    async fn test_ids_strictly_increase() {
        let tmp = fixture();
        let mut table = HandleTable::new();
        let path = tmp.path().join("loans.csv");

        let a = table.create_file(&path, OpenFlags::READ).await.unwrap();
        table.close(&a.to_bytes()).unwrap();
        let b = table.create_file(&path, OpenFlags::READ).await.unwrap();
        let c = table.create_dir(tmp.path()).await.unwrap();

        assert!(a < b && b < c);
        assert_eq!(a.get(), 0);
        assert_eq!(table.len(), 2);
    }

    #[tokio::test]
    async fn test_write_access_refused() {
        let tmp = fixture();
        let mut table = HandleTable::new();
        let path = tmp.path().join("loans.csv");

        for flags in [
            OpenFlags::READ | OpenFlags::WRITE,
            OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC,
            OpenFlags::empty(),
        ] {
            let err = table.create_file(&path, flags).await.unwrap_err();
            assert!(matches!(err, Error::WriteDenied));
        }
        assert!(table.is_empty());
        assert_eq!(std::fs::read(&path).unwrap(), LOANS);
    }

    #[tokio::test]
    async fn test_missing_file_propagates_not_found() {
        let tmp = fixture();
        let mut table = HandleTable::new();
        let err = table
            .create_file(&tmp.path().join("missing.csv"), OpenFlags::READ)
            .await
            .unwrap_err();
        match err {
            Error::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::NotFound),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_directory_is_not_a_file() {
        let tmp = fixture();
        let mut table = HandleTable::new();
        let err = table
            .create_file(&tmp.path().join("archive"), OpenFlags::READ)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotAFile));
    }

    #[tokio::test]
    async fn test_read_past_end_is_eof() {
        let tmp = fixture();
        let mut table = HandleTable::new();
        let handle = table
            .create_file(&tmp.path().join("loans.csv"), OpenFlags::READ)
            .await
            .unwrap()
            .to_bytes();

        let all = table.read_file(&handle, 0, 100).await.unwrap().unwrap();
        assert_eq!(&all[..], LOANS);

        let eof = table
            .read_file(&handle, LOANS.len() as u64, 100)
            .await
            .unwrap();
        assert!(eof.is_none());
    }

    #[tokio::test]
    async fn test_chunked_reads_reassemble() {
        let tmp = fixture();
        let mut table = HandleTable::new();
        let handle = table
            .create_file(&tmp.path().join("loans.csv"), OpenFlags::READ)
            .await
            .unwrap()
            .to_bytes();

        for chunk in [1u32, 3, 7, 16, 64] {
            let mut offset = 0u64;
            let mut out = Vec::new();
            while let Some(data) = table.read_file(&handle, offset, chunk).await.unwrap() {
                assert!(data.len() <= chunk as usize);
                offset += data.len() as u64;
                out.extend_from_slice(&data);
            }
            assert_eq!(out, LOANS, "chunk size {}", chunk);
        }
    }

    #[tokio::test]
    async fn test_closed_handle_is_unknown() {
        let tmp = fixture();
        let mut table = HandleTable::new();
        let handle = table
            .create_file(&tmp.path().join("loans.csv"), OpenFlags::READ)
            .await
            .unwrap()
            .to_bytes();

        table.close(&handle).unwrap();
        assert!(matches!(
            table.read_file(&handle, 0, 10).await,
            Err(Error::UnknownHandle)
        ));
        assert!(matches!(table.close(&handle), Err(Error::UnknownHandle)));
        assert!(matches!(
            table.stat_handle(&handle).await,
            Err(Error::UnknownHandle)
        ));
    }

    #[tokio::test]
    async fn test_malformed_handle_is_unknown() {
        let mut table = HandleTable::new();
        assert!(matches!(table.close(b"xyz"), Err(Error::UnknownHandle)));
        assert!(matches!(
            table.list_next(&[0, 0, 0, 0, 0]),
            Err(Error::UnknownHandle)
        ));
    }

    #[tokio::test]
    async fn test_listing_is_a_snapshot() {
        let tmp = fixture();
        let mut table = HandleTable::new();
        let handle = table.create_dir(tmp.path()).await.unwrap().to_bytes();

        std::fs::write(tmp.path().join("late.csv"), b"x").unwrap();

        let mut names = Vec::new();
        while let Some(entry) = table.list_next(&handle).unwrap() {
            names.push(entry.name);
        }
        assert_eq!(names, vec!["archive", "loans.csv"]);
        // Stays exhausted.
        assert!(table.list_next(&handle).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_kind_mismatch() {
        let tmp = fixture();
        let mut table = HandleTable::new();
        let dir = table.create_dir(tmp.path()).await.unwrap().to_bytes();
        let file = table
            .create_file(&tmp.path().join("loans.csv"), OpenFlags::READ)
            .await
            .unwrap()
            .to_bytes();

        assert!(matches!(
            table.read_file(&dir, 0, 1).await,
            Err(Error::NotAFile)
        ));
        assert!(matches!(table.list_next(&file), Err(Error::NotADirectory)));
        assert!(table.stat_handle(&dir).await.unwrap().is_dir());
        assert_eq!(
            table.stat_handle(&file).await.unwrap().len(),
            LOANS.len() as u64
        );
    }

    #[tokio::test]
    async fn test_counter_exhaustion_is_fatal_not_wraparound() {
        let tmp = fixture();
        let mut table = HandleTable::starting_at(u32::MAX);
        let path = tmp.path().join("loans.csv");

        let last = table.create_file(&path, OpenFlags::READ).await.unwrap();
        assert_eq!(last.get(), u32::MAX);

        let err = table.create_file(&path, OpenFlags::READ).await.unwrap_err();
        assert!(matches!(err, Error::HandleExhausted));
        let err = table.create_dir(tmp.path()).await.unwrap_err();
        assert!(matches!(err, Error::HandleExhausted));
    }

    #[tokio::test]
    async fn test_close_all_releases_everything() {
        let tmp = fixture();
        let mut table = HandleTable::new();
        table
            .create_file(&tmp.path().join("loans.csv"), OpenFlags::READ)
            .await
            .unwrap();
        table.create_dir(tmp.path()).await.unwrap();

        assert_eq!(table.close_all(), 2);
        assert!(table.is_empty());
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_non_utf8_names_are_not_listed() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let tmp = fixture();
        let odd = tmp.path().join(OsStr::from_bytes(b"loans-\xff.csv"));
        std::fs::write(&odd, b"x").unwrap();

        let mut table = HandleTable::new();
        let dir = table.create_dir(tmp.path()).await.unwrap();
        let raw = dir.to_bytes();

        let mut names = Vec::new();
        while let Some(entry) = table.list_next(&raw).unwrap() {
            names.push(entry.name);
        }
        assert_eq!(names, vec!["archive".to_string(), "loans.csv".to_string()]);
    }
}
