//! Command dispatcher for one SFTP session.
//!
//! Requests are handled strictly in arrival order; each one yields exactly
//! one response packet. Per-request failures become STATUS replies and the
//! session carries on. Malformed packets and handle exhaustion end it.

use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::sandbox::{self, Sandbox};
use crate::sftp::attrs;
use crate::sftp::handles::HandleTable;
use crate::sftp::protocol::{
    read_packet, write_packet, FileAttrs, NameEntry, OpenFlags, Request, Response, StatusCode,
    MAX_DATA_LEN, SFTP_VERSION,
};

/// Default clamp for READ lengths (256KB)
pub const DEFAULT_MAX_READ_LEN: u32 = 256 * 1024;

/// Wire status for a request-local failure.
///
/// Everything except refused write access collapses to FAILURE so clients
/// cannot map where the sandbox boundary lies.
fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::WriteDenied => StatusCode::PermissionDenied,
        _ => StatusCode::Failure,
    }
}

pub struct SftpSession {
    sandbox: Arc<Sandbox>,
    handles: HandleTable,
    max_read_len: u32,
}

impl SftpSession {
    pub fn new(sandbox: Arc<Sandbox>) -> Self {
        Self {
            sandbox,
            handles: HandleTable::new(),
            max_read_len: DEFAULT_MAX_READ_LEN,
        }
    }

    /// Clamped so every DATA reply fits in one packet.
    pub fn with_max_read_len(mut self, max_read_len: u32) -> Self {
        self.max_read_len = max_read_len.clamp(1, MAX_DATA_LEN);
        self
    }

    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Serve requests until the client closes the stream.
    ///
    /// Open handles are released on the way out, whether or not the client
    /// closed them.
    pub async fn serve<R, W>(mut self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let outcome = self.run(&mut reader, &mut writer).await;

        let released = self.handles.close_all();
        if released > 0 {
            debug!("Session ended with {} open handle(s); released", released);
        }
        let _ = writer.shutdown().await;

        outcome
    }

    async fn run<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        while let Some((kind, payload)) = read_packet(reader).await? {
            let request = Request::decode(kind, payload)?;
            let response = self.handle(request).await?;
            write_packet(writer, &response.encode()).await?;
            writer.flush().await?;
        }
        Ok(())
    }

    /// Handle one request. `Err` is reserved for session-fatal conditions.
    pub async fn handle(&mut self, request: Request) -> Result<Response> {
        let (id, outcome) = match request {
            Request::Init { version } => {
                debug!("SFTP init, client version {}", version);
                return Ok(Response::Version {
                    version: SFTP_VERSION,
                });
            }
            Request::Realpath { id, path } => (id, Ok(self.realpath(id, &path))),
            Request::Stat { id, path } => (id, self.stat(id, &path, true).await),
            Request::Lstat { id, path } => (id, self.stat(id, &path, false).await),
            Request::Fstat { id, handle } => (id, self.fstat(id, &handle).await),
            Request::Opendir { id, path } => (id, self.opendir(id, &path).await),
            Request::Readdir { id, handle } => (id, self.readdir(id, &handle)),
            Request::Open {
                id, path, flags, ..
            } => (id, self.open(id, &path, flags).await),
            Request::Read {
                id,
                handle,
                offset,
                len,
            } => (id, self.read(id, &handle, offset, len).await),
            Request::Close { id, handle } => (id, self.close(id, &handle)),
            Request::Unsupported { id, kind } => {
                debug!("Rejecting unsupported packet type {}", kind);
                (id, Ok(Response::status(id, StatusCode::OpUnsupported)))
            }
        };

        match outcome {
            Ok(response) => Ok(response),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Request {} failed: {}", id, e);
                Ok(Response::status(id, status_for(&e)))
            }
        }
    }

    fn realpath(&self, id: u32, path: &str) -> Response {
        let canonical = sandbox::client_view(path);
        debug!("REALPATH {:?} -> {}", path, canonical);
        Response::Name {
            id,
            entries: vec![NameEntry {
                filename: canonical.clone(),
                longname: canonical,
                attrs: FileAttrs::default(),
            }],
        }
    }

    async fn stat(&self, id: u32, path: &str, follow: bool) -> Result<Response> {
        let resolved = self.sandbox.resolve(path)?;
        debug!("{} {}", if follow { "STAT" } else { "LSTAT" }, resolved.display());

        let metadata = if follow {
            let real = self.sandbox.confine_existing(&resolved).await?;
            tokio::fs::metadata(real).await?
        } else {
            let target = self.sandbox.confine_parent(&resolved).await?;
            tokio::fs::symlink_metadata(target).await?
        };

        Ok(Response::Attrs {
            id,
            attrs: attrs::from_metadata(&metadata),
        })
    }

    async fn fstat(&mut self, id: u32, handle: &Bytes) -> Result<Response> {
        let metadata = self.handles.stat_handle(handle).await?;
        Ok(Response::Attrs {
            id,
            attrs: attrs::from_metadata(&metadata),
        })
    }

    async fn opendir(&mut self, id: u32, path: &str) -> Result<Response> {
        let resolved = self.sandbox.resolve(path)?;
        let real = self.sandbox.confine_existing(&resolved).await?;
        let handle = self.handles.create_dir(&real).await?;
        debug!("OPENDIR {} -> handle {}", real.display(), handle.get());
        Ok(Response::Handle {
            id,
            handle: handle.to_bytes(),
        })
    }

    fn readdir(&mut self, id: u32, handle: &Bytes) -> Result<Response> {
        match self.handles.list_next(handle)? {
            Some(entry) => Ok(Response::Name {
                id,
                entries: vec![NameEntry {
                    longname: attrs::long_name(&entry.name, &entry.metadata),
                    attrs: attrs::from_metadata(&entry.metadata),
                    filename: entry.name,
                }],
            }),
            None => Ok(Response::status(id, StatusCode::Eof)),
        }
    }

    async fn open(&mut self, id: u32, path: &str, flags: OpenFlags) -> Result<Response> {
        // Write intent is refused before the path is even resolved.
        if flags.wants_write() || !flags.contains(OpenFlags::READ) {
            return Err(Error::WriteDenied);
        }
        let resolved = self.sandbox.resolve(path)?;
        let real = self.sandbox.confine_existing(&resolved).await?;
        let handle = self.handles.create_file(&real, flags).await?;
        debug!("OPEN {} -> handle {}", real.display(), handle.get());
        Ok(Response::Handle {
            id,
            handle: handle.to_bytes(),
        })
    }

    async fn read(&mut self, id: u32, handle: &Bytes, offset: u64, len: u32) -> Result<Response> {
        let len = len.min(self.max_read_len);
        match self.handles.read_file(handle, offset, len).await? {
            Some(data) => Ok(Response::Data { id, data }),
            None => Ok(Response::status(id, StatusCode::Eof)),
        }
    }

    fn close(&mut self, id: u32, handle: &Bytes) -> Result<Response> {
        if let Ok(path) = self.handles.path_of(handle) {
            debug!("CLOSE {}", path.display());
        }
        self.handles.close(handle)?;
        Ok(Response::status(id, StatusCode::Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn session() -> (TempDir, SftpSession) {
        let tmp = TempDir::new().unwrap();
        let sandbox = Sandbox::open(&tmp.path().join("root")).unwrap();
        std::fs::write(sandbox.root().join("loans.csv"), b"0123456789").unwrap();
        (tmp, SftpSession::new(Arc::new(sandbox)))
    }

    fn expect_status(response: Response, want: StatusCode) {
        match response {
            Response::Status { code, .. } => assert_eq!(code, want),
            other => panic!("expected {:?}, got {:?}", want, other),
        }
    }

    #[tokio::test]
    async fn test_init_replies_version() {
        let (_tmp, mut session) = session();
        let response = session.handle(Request::Init { version: 6 }).await.unwrap();
        assert_eq!(response, Response::Version { version: 3 });
    }

    #[tokio::test]
    async fn test_read_length_is_clamped() {
        let (_tmp, session) = session();
        let mut session = session.with_max_read_len(4);
        let handle = match session
            .handle(Request::Open {
                id: 1,
                path: "/loans.csv".into(),
                flags: OpenFlags::READ,
                attrs: FileAttrs::default(),
            })
            .await
            .unwrap()
        {
            Response::Handle { handle, .. } => handle,
            other => panic!("unexpected {:?}", other),
        };

        let response = session
            .handle(Request::Read {
                id: 2,
                handle,
                offset: 0,
                len: 1000,
            })
            .await
            .unwrap();
        assert_eq!(
            response,
            Response::Data {
                id: 2,
                data: Bytes::from_static(b"0123")
            }
        );
    }

    #[tokio::test]
    async fn test_write_open_is_permission_denied() {
        let (_tmp, mut session) = session();
        let response = session
            .handle(Request::Open {
                id: 5,
                path: "/loans.csv".into(),
                flags: OpenFlags::WRITE | OpenFlags::TRUNC,
                attrs: FileAttrs::default(),
            })
            .await
            .unwrap();
        assert_eq!(response.id(), Some(5));
        expect_status(response, StatusCode::PermissionDenied);
        assert_eq!(session.open_handles(), 0);
    }

    #[tokio::test]
    async fn test_escape_is_generic_failure() {
        let (_tmp, mut session) = session();
        let response = session
            .handle(Request::Stat {
                id: 8,
                path: "/../../etc/passwd".into(),
            })
            .await
            .unwrap();
        match response {
            Response::Status { id, code, message } => {
                assert_eq!(id, 8);
                assert_eq!(code, StatusCode::Failure);
                assert_eq!(message, "Failure");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_file_is_generic_failure() {
        let (_tmp, mut session) = session();
        let response = session
            .handle(Request::Stat {
                id: 1,
                path: "/nope.csv".into(),
            })
            .await
            .unwrap();
        expect_status(response, StatusCode::Failure);
    }

    #[tokio::test]
    async fn test_unsupported_keeps_id() {
        let (_tmp, mut session) = session();
        let response = session
            .handle(Request::Unsupported { id: 77, kind: 13 })
            .await
            .unwrap();
        assert_eq!(response.id(), Some(77));
        expect_status(response, StatusCode::OpUnsupported);
    }

    #[tokio::test]
    async fn test_realpath_reports_rooted_path() {
        let (_tmp, mut session) = session();
        let response = session
            .handle(Request::Realpath {
                id: 1,
                path: ".".into(),
            })
            .await
            .unwrap();
        match response {
            Response::Name { entries, .. } => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].filename, "/");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lstat_sees_directory() {
        let (_tmp, mut session) = session();
        let response = session
            .handle(Request::Lstat {
                id: 4,
                path: "/".into(),
            })
            .await
            .unwrap();
        match response {
            Response::Attrs { id, attrs } => {
                assert_eq!(id, 4);
                assert!(attrs.is_dir());
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
