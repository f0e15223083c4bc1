//! Minimal SFTP v3 client over any async byte stream.
//!
//! Requests are issued one at a time; each call waits for the reply carrying
//! its request id.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::sftp::protocol::{
    read_packet, write_packet, FileAttrs, NameEntry, OpenFlags, Request, Response, StatusCode,
    SFTP_VERSION,
};

pub struct SftpClient<S> {
    stream: S,
    next_id: u32,
    server_version: u32,
}

impl<S> SftpClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Perform the INIT/VERSION exchange.
    pub async fn init(mut stream: S) -> Result<Self> {
        write_packet(
            &mut stream,
            &Request::Init {
                version: SFTP_VERSION,
            }
            .encode(),
        )
        .await?;
        stream.flush().await?;

        let server_version = match Self::receive(&mut stream).await? {
            Response::Version { version } => version,
            other => {
                return Err(Error::Protocol(format!(
                    "Expected VERSION, got {:?}",
                    other
                )))
            }
        };

        Ok(Self {
            stream,
            next_id: 0,
            server_version,
        })
    }

    pub fn server_version(&self) -> u32 {
        self.server_version
    }

    async fn receive(stream: &mut S) -> Result<Response> {
        let (kind, payload) = read_packet(stream)
            .await?
            .ok_or_else(|| Error::Protocol("Server closed the channel".into()))?;
        Response::decode(kind, payload)
    }

    async fn call(&mut self, build: impl FnOnce(u32) -> Request) -> Result<Response> {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        write_packet(&mut self.stream, &build(id).encode()).await?;
        self.stream.flush().await?;

        let response = Self::receive(&mut self.stream).await?;
        if response.id() != Some(id) {
            return Err(Error::Protocol(format!(
                "Reply id {:?} does not match request {}",
                response.id(),
                id
            )));
        }
        Ok(response)
    }

    pub async fn realpath(&mut self, path: &str) -> Result<String> {
        let path = path.to_string();
        match self.call(|id| Request::Realpath { id, path }).await? {
            Response::Name { mut entries, .. } if !entries.is_empty() => {
                Ok(entries.swap_remove(0).filename)
            }
            other => unexpected(other),
        }
    }

    pub async fn stat(&mut self, path: &str) -> Result<FileAttrs> {
        let path = path.to_string();
        match self.call(|id| Request::Stat { id, path }).await? {
            Response::Attrs { attrs, .. } => Ok(attrs),
            other => unexpected(other),
        }
    }

    pub async fn lstat(&mut self, path: &str) -> Result<FileAttrs> {
        let path = path.to_string();
        match self.call(|id| Request::Lstat { id, path }).await? {
            Response::Attrs { attrs, .. } => Ok(attrs),
            other => unexpected(other),
        }
    }

    pub async fn fstat(&mut self, handle: &Bytes) -> Result<FileAttrs> {
        let handle = handle.clone();
        match self.call(|id| Request::Fstat { id, handle }).await? {
            Response::Attrs { attrs, .. } => Ok(attrs),
            other => unexpected(other),
        }
    }

    /// Open `path` read-only and return its handle.
    pub async fn open(&mut self, path: &str) -> Result<Bytes> {
        self.open_with(path, OpenFlags::READ).await
    }

    pub async fn open_with(&mut self, path: &str, flags: OpenFlags) -> Result<Bytes> {
        let path = path.to_string();
        match self
            .call(|id| Request::Open {
                id,
                path,
                flags,
                attrs: FileAttrs::default(),
            })
            .await?
        {
            Response::Handle { handle, .. } => Ok(handle),
            other => unexpected(other),
        }
    }

    pub async fn opendir(&mut self, path: &str) -> Result<Bytes> {
        let path = path.to_string();
        match self.call(|id| Request::Opendir { id, path }).await? {
            Response::Handle { handle, .. } => Ok(handle),
            other => unexpected(other),
        }
    }

    /// Next batch of directory entries; `None` at end of listing.
    pub async fn readdir(&mut self, handle: &Bytes) -> Result<Option<Vec<NameEntry>>> {
        let handle = handle.clone();
        match self.call(|id| Request::Readdir { id, handle }).await? {
            Response::Name { entries, .. } => Ok(Some(entries)),
            Response::Status {
                code: StatusCode::Eof,
                ..
            } => Ok(None),
            other => unexpected(other),
        }
    }

    /// Read up to `len` bytes at `offset`; `None` at end of file.
    pub async fn read(&mut self, handle: &Bytes, offset: u64, len: u32) -> Result<Option<Bytes>> {
        let handle = handle.clone();
        match self
            .call(|id| Request::Read {
                id,
                handle,
                offset,
                len,
            })
            .await?
        {
            Response::Data { data, .. } => Ok(Some(data)),
            Response::Status {
                code: StatusCode::Eof,
                ..
            } => Ok(None),
            other => unexpected(other),
        }
    }

    pub async fn close(&mut self, handle: &Bytes) -> Result<()> {
        let handle = handle.clone();
        match self.call(|id| Request::Close { id, handle }).await? {
            Response::Status {
                code: StatusCode::Ok,
                ..
            } => Ok(()),
            other => unexpected(other),
        }
    }

    /// Hand back the underlying stream.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Failure statuses become [`Error::Status`]; anything else is a protocol error.
fn unexpected<T>(response: Response) -> Result<T> {
    match response {
        Response::Status { code, message, .. } => Err(Error::Status { code, message }),
        other => Err(Error::Protocol(format!("Unexpected reply {:?}", other))),
    }
}
