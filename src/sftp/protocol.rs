//! SFTP v3 wire format (draft-ietf-secsh-filexfer-02).
//!
//! Only the read-only subset is decoded into structured requests; every other
//! well-formed request is surfaced as [`Request::Unsupported`] so the session
//! can answer it without dropping the channel.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Protocol version spoken by both ends
pub const SFTP_VERSION: u32 = 3;

/// Wire format: all multi-byte integers are big-endian
/// Strings are length-prefixed (u32 len + bytes)
/// Packet format: len:u32 | type:u8 | payload  (len counts type + payload)

/// Maximum packet size (1MB) - bounds allocation for hostile length prefixes
pub const MAX_PACKET_SIZE: u32 = 1024 * 1024;

/// Largest READ payload whose DATA reply still fits in one packet
/// (length prefix, type, request id and data length take 13 bytes).
pub const MAX_DATA_LEN: u32 = MAX_PACKET_SIZE - 13;

// =============================================================================
// Packet Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Init = 1,
    Version = 2,
    Open = 3,
    Close = 4,
    Read = 5,
    Write = 6,
    Lstat = 7,
    Fstat = 8,
    Setstat = 9,
    Fsetstat = 10,
    Opendir = 11,
    Readdir = 12,
    Remove = 13,
    Mkdir = 14,
    Rmdir = 15,
    Realpath = 16,
    Stat = 17,
    Rename = 18,
    Readlink = 19,
    Symlink = 20,
    Status = 101,
    Handle = 102,
    Data = 103,
    Name = 104,
    Attrs = 105,
    Extended = 200,
    ExtendedReply = 201,
}

impl PacketType {
    pub fn from_u8(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Init),
            2 => Some(Self::Version),
            3 => Some(Self::Open),
            4 => Some(Self::Close),
            5 => Some(Self::Read),
            6 => Some(Self::Write),
            7 => Some(Self::Lstat),
            8 => Some(Self::Fstat),
            9 => Some(Self::Setstat),
            10 => Some(Self::Fsetstat),
            11 => Some(Self::Opendir),
            12 => Some(Self::Readdir),
            13 => Some(Self::Remove),
            14 => Some(Self::Mkdir),
            15 => Some(Self::Rmdir),
            16 => Some(Self::Realpath),
            17 => Some(Self::Stat),
            18 => Some(Self::Rename),
            19 => Some(Self::Readlink),
            20 => Some(Self::Symlink),
            101 => Some(Self::Status),
            102 => Some(Self::Handle),
            103 => Some(Self::Data),
            104 => Some(Self::Name),
            105 => Some(Self::Attrs),
            200 => Some(Self::Extended),
            201 => Some(Self::ExtendedReply),
            _ => None,
        }
    }
}

// =============================================================================
// Status Codes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    Eof = 1,
    NoSuchFile = 2,
    PermissionDenied = 3,
    Failure = 4,
    BadMessage = 5,
    NoConnection = 6,
    ConnectionLost = 7,
    OpUnsupported = 8,
}

impl StatusCode {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Ok),
            1 => Some(Self::Eof),
            2 => Some(Self::NoSuchFile),
            3 => Some(Self::PermissionDenied),
            4 => Some(Self::Failure),
            5 => Some(Self::BadMessage),
            6 => Some(Self::NoConnection),
            7 => Some(Self::ConnectionLost),
            8 => Some(Self::OpUnsupported),
            _ => None,
        }
    }

    /// Fixed human-readable text sent with each status.
    pub fn message(&self) -> &'static str {
        match self {
            Self::Ok => "Success",
            Self::Eof => "End of file",
            Self::NoSuchFile => "No such file",
            Self::PermissionDenied => "Permission denied",
            Self::Failure => "Failure",
            Self::BadMessage => "Bad message",
            Self::NoConnection => "No connection",
            Self::ConnectionLost => "Connection lost",
            Self::OpUnsupported => "Operation unsupported",
        }
    }
}

// =============================================================================
// Open / Attribute Flags
// =============================================================================

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenFlags: u32 {
        const READ = 0x01;
        const WRITE = 0x02;
        const APPEND = 0x04;
        const CREAT = 0x08;
        const TRUNC = 0x10;
        const EXCL = 0x20;
    }
}

impl OpenFlags {
    /// Any flag that would let the client modify the tree.
    pub fn wants_write(&self) -> bool {
        self.intersects(Self::WRITE | Self::APPEND | Self::CREAT | Self::TRUNC | Self::EXCL)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AttrFlags: u32 {
        const SIZE = 0x0000_0001;
        const UIDGID = 0x0000_0002;
        const PERMISSIONS = 0x0000_0004;
        const ACMODTIME = 0x0000_0008;
        const EXTENDED = 0x8000_0000;
    }
}

// =============================================================================
// Primitive helpers
// =============================================================================

fn need(buf: &Bytes, n: usize, what: &str) -> Result<()> {
    if buf.remaining() < n {
        return Err(Error::Protocol(format!(
            "{} truncated: expected {} bytes, got {}",
            what,
            n,
            buf.remaining()
        )));
    }
    Ok(())
}

fn get_u32(buf: &mut Bytes, what: &str) -> Result<u32> {
    need(buf, 4, what)?;
    Ok(buf.get_u32())
}

fn get_u64(buf: &mut Bytes, what: &str) -> Result<u64> {
    need(buf, 8, what)?;
    Ok(buf.get_u64())
}

fn get_bytes(buf: &mut Bytes, what: &str) -> Result<Bytes> {
    let len = get_u32(buf, what)? as usize;
    need(buf, len, what)?;
    Ok(buf.copy_to_bytes(len))
}

fn get_string(buf: &mut Bytes, what: &str) -> Result<String> {
    let raw = get_bytes(buf, what)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| Error::Protocol(format!("Invalid UTF-8 in {}", what)))
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

/// Prefix `body` (type byte + payload) with its length.
fn frame(body: BytesMut) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    buf.freeze()
}

// =============================================================================
// ATTRS
// =============================================================================

/// File attributes as carried by ATTRS, NAME and OPEN packets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    pub size: Option<u64>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub permissions: Option<u32>,
    pub atime: Option<u32>,
    pub mtime: Option<u32>,
}

impl FileAttrs {
    pub fn flags(&self) -> AttrFlags {
        let mut flags = AttrFlags::empty();
        if self.size.is_some() {
            flags |= AttrFlags::SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= AttrFlags::UIDGID;
        }
        if self.permissions.is_some() {
            flags |= AttrFlags::PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= AttrFlags::ACMODTIME;
        }
        flags
    }

    pub fn is_dir(&self) -> bool {
        self.permissions
            .map(|mode| mode & 0o170000 == 0o040000)
            .unwrap_or(false)
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        let flags = self.flags();
        buf.put_u32(flags.bits());
        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        let flags = AttrFlags::from_bits_retain(get_u32(buf, "attribute flags")?);
        let mut attrs = FileAttrs::default();

        if flags.contains(AttrFlags::SIZE) {
            attrs.size = Some(get_u64(buf, "attribute size")?);
        }
        if flags.contains(AttrFlags::UIDGID) {
            attrs.uid = Some(get_u32(buf, "attribute uid")?);
            attrs.gid = Some(get_u32(buf, "attribute gid")?);
        }
        if flags.contains(AttrFlags::PERMISSIONS) {
            attrs.permissions = Some(get_u32(buf, "attribute permissions")?);
        }
        if flags.contains(AttrFlags::ACMODTIME) {
            attrs.atime = Some(get_u32(buf, "attribute atime")?);
            attrs.mtime = Some(get_u32(buf, "attribute mtime")?);
        }
        if flags.contains(AttrFlags::EXTENDED) {
            // Extended pairs carry nothing this server acts on.
            let count = get_u32(buf, "extended attribute count")?;
            for _ in 0..count {
                get_bytes(buf, "extended attribute type")?;
                get_bytes(buf, "extended attribute data")?;
            }
        }

        Ok(attrs)
    }
}

/// One entry of a NAME reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameEntry {
    pub filename: String,
    pub longname: String,
    pub attrs: FileAttrs,
}

// =============================================================================
// Requests (client -> server)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Init {
        version: u32,
    },
    Realpath {
        id: u32,
        path: String,
    },
    Stat {
        id: u32,
        path: String,
    },
    Lstat {
        id: u32,
        path: String,
    },
    Fstat {
        id: u32,
        handle: Bytes,
    },
    Opendir {
        id: u32,
        path: String,
    },
    Readdir {
        id: u32,
        handle: Bytes,
    },
    Open {
        id: u32,
        path: String,
        flags: OpenFlags,
        attrs: FileAttrs,
    },
    Read {
        id: u32,
        handle: Bytes,
        offset: u64,
        len: u32,
    },
    Close {
        id: u32,
        handle: Bytes,
    },
    /// A request outside the read-only subset; only its id is kept.
    Unsupported {
        id: u32,
        kind: u8,
    },
}

impl Request {
    /// Request id to echo back; INIT has none.
    pub fn id(&self) -> Option<u32> {
        match self {
            Request::Init { .. } => None,
            Request::Realpath { id, .. }
            | Request::Stat { id, .. }
            | Request::Lstat { id, .. }
            | Request::Fstat { id, .. }
            | Request::Opendir { id, .. }
            | Request::Readdir { id, .. }
            | Request::Open { id, .. }
            | Request::Read { id, .. }
            | Request::Close { id, .. }
            | Request::Unsupported { id, .. } => Some(*id),
        }
    }

    pub fn decode(kind: u8, mut payload: Bytes) -> Result<Self> {
        let packet_type = PacketType::from_u8(kind);

        if packet_type == Some(PacketType::Init) {
            let version = get_u32(&mut payload, "INIT version")?;
            // Trailing extension pairs are ignored.
            return Ok(Request::Init { version });
        }

        let id = get_u32(&mut payload, "request id")?;
        let request = match packet_type {
            Some(PacketType::Realpath) => Request::Realpath {
                id,
                path: get_string(&mut payload, "REALPATH path")?,
            },
            Some(PacketType::Stat) => Request::Stat {
                id,
                path: get_string(&mut payload, "STAT path")?,
            },
            Some(PacketType::Lstat) => Request::Lstat {
                id,
                path: get_string(&mut payload, "LSTAT path")?,
            },
            Some(PacketType::Fstat) => Request::Fstat {
                id,
                handle: get_bytes(&mut payload, "FSTAT handle")?,
            },
            Some(PacketType::Opendir) => Request::Opendir {
                id,
                path: get_string(&mut payload, "OPENDIR path")?,
            },
            Some(PacketType::Readdir) => Request::Readdir {
                id,
                handle: get_bytes(&mut payload, "READDIR handle")?,
            },
            Some(PacketType::Open) => {
                let path = get_string(&mut payload, "OPEN path")?;
                let flags = OpenFlags::from_bits_retain(get_u32(&mut payload, "OPEN pflags")?);
                let attrs = FileAttrs::decode(&mut payload)?;
                Request::Open {
                    id,
                    path,
                    flags,
                    attrs,
                }
            }
            Some(PacketType::Read) => {
                let handle = get_bytes(&mut payload, "READ handle")?;
                let offset = get_u64(&mut payload, "READ offset")?;
                let len = get_u32(&mut payload, "READ length")?;
                Request::Read {
                    id,
                    handle,
                    offset,
                    len,
                }
            }
            Some(PacketType::Close) => Request::Close {
                id,
                handle: get_bytes(&mut payload, "CLOSE handle")?,
            },
            Some(
                PacketType::Version
                | PacketType::Status
                | PacketType::Handle
                | PacketType::Data
                | PacketType::Name
                | PacketType::Attrs
                | PacketType::ExtendedReply,
            ) => {
                return Err(Error::Protocol(format!(
                    "Server-to-client packet type {} sent by client",
                    kind
                )));
            }
            _ => Request::Unsupported { id, kind },
        };

        Ok(request)
    }

    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            Request::Init { version } => {
                body.put_u8(PacketType::Init as u8);
                body.put_u32(*version);
            }
            Request::Realpath { id, path } => {
                body.put_u8(PacketType::Realpath as u8);
                body.put_u32(*id);
                put_string(&mut body, path);
            }
            Request::Stat { id, path } => {
                body.put_u8(PacketType::Stat as u8);
                body.put_u32(*id);
                put_string(&mut body, path);
            }
            Request::Lstat { id, path } => {
                body.put_u8(PacketType::Lstat as u8);
                body.put_u32(*id);
                put_string(&mut body, path);
            }
            Request::Fstat { id, handle } => {
                body.put_u8(PacketType::Fstat as u8);
                body.put_u32(*id);
                put_bytes(&mut body, handle);
            }
            Request::Opendir { id, path } => {
                body.put_u8(PacketType::Opendir as u8);
                body.put_u32(*id);
                put_string(&mut body, path);
            }
            Request::Readdir { id, handle } => {
                body.put_u8(PacketType::Readdir as u8);
                body.put_u32(*id);
                put_bytes(&mut body, handle);
            }
            Request::Open {
                id,
                path,
                flags,
                attrs,
            } => {
                body.put_u8(PacketType::Open as u8);
                body.put_u32(*id);
                put_string(&mut body, path);
                body.put_u32(flags.bits());
                attrs.encode_into(&mut body);
            }
            Request::Read {
                id,
                handle,
                offset,
                len,
            } => {
                body.put_u8(PacketType::Read as u8);
                body.put_u32(*id);
                put_bytes(&mut body, handle);
                body.put_u64(*offset);
                body.put_u32(*len);
            }
            Request::Close { id, handle } => {
                body.put_u8(PacketType::Close as u8);
                body.put_u32(*id);
                put_bytes(&mut body, handle);
            }
            Request::Unsupported { id, kind } => {
                body.put_u8(*kind);
                body.put_u32(*id);
            }
        }
        frame(body)
    }
}

// =============================================================================
// Responses (server -> client)
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Version {
        version: u32,
    },
    Status {
        id: u32,
        code: StatusCode,
        message: String,
    },
    Handle {
        id: u32,
        handle: Bytes,
    },
    Data {
        id: u32,
        data: Bytes,
    },
    Name {
        id: u32,
        entries: Vec<NameEntry>,
    },
    Attrs {
        id: u32,
        attrs: FileAttrs,
    },
}

impl Response {
    /// Status reply carrying the code's fixed message.
    pub fn status(id: u32, code: StatusCode) -> Self {
        Response::Status {
            id,
            code,
            message: code.message().to_string(),
        }
    }

    pub fn id(&self) -> Option<u32> {
        match self {
            Response::Version { .. } => None,
            Response::Status { id, .. }
            | Response::Handle { id, .. }
            | Response::Data { id, .. }
            | Response::Name { id, .. }
            | Response::Attrs { id, .. } => Some(*id),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::new();
        match self {
            Response::Version { version } => {
                body.put_u8(PacketType::Version as u8);
                body.put_u32(*version);
            }
            Response::Status { id, code, message } => {
                body.put_u8(PacketType::Status as u8);
                body.put_u32(*id);
                body.put_u32(*code as u32);
                put_string(&mut body, message);
                put_string(&mut body, "en");
            }
            Response::Handle { id, handle } => {
                body.put_u8(PacketType::Handle as u8);
                body.put_u32(*id);
                put_bytes(&mut body, handle);
            }
            Response::Data { id, data } => {
                body.reserve(9 + data.len());
                body.put_u8(PacketType::Data as u8);
                body.put_u32(*id);
                put_bytes(&mut body, data);
            }
            Response::Name { id, entries } => {
                body.put_u8(PacketType::Name as u8);
                body.put_u32(*id);
                body.put_u32(entries.len() as u32);
                for entry in entries {
                    put_string(&mut body, &entry.filename);
                    put_string(&mut body, &entry.longname);
                    entry.attrs.encode_into(&mut body);
                }
            }
            Response::Attrs { id, attrs } => {
                body.put_u8(PacketType::Attrs as u8);
                body.put_u32(*id);
                attrs.encode_into(&mut body);
            }
        }
        frame(body)
    }

    pub fn decode(kind: u8, mut payload: Bytes) -> Result<Self> {
        let packet_type = PacketType::from_u8(kind)
            .ok_or_else(|| Error::Protocol(format!("Unknown packet type {}", kind)))?;

        let response = match packet_type {
            PacketType::Version => Response::Version {
                version: get_u32(&mut payload, "VERSION version")?,
            },
            PacketType::Status => {
                let id = get_u32(&mut payload, "request id")?;
                let raw = get_u32(&mut payload, "STATUS code")?;
                let code = StatusCode::from_u32(raw)
                    .ok_or_else(|| Error::Protocol(format!("Unknown status code {}", raw)))?;
                // Servers predating v3 may omit the message and language tag.
                let message = if payload.has_remaining() {
                    get_string(&mut payload, "STATUS message")?
                } else {
                    String::new()
                };
                Response::Status { id, code, message }
            }
            PacketType::Handle => Response::Handle {
                id: get_u32(&mut payload, "request id")?,
                handle: get_bytes(&mut payload, "HANDLE handle")?,
            },
            PacketType::Data => Response::Data {
                id: get_u32(&mut payload, "request id")?,
                data: get_bytes(&mut payload, "DATA data")?,
            },
            PacketType::Name => {
                let id = get_u32(&mut payload, "request id")?;
                let count = get_u32(&mut payload, "NAME count")?;
                let mut entries = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    let filename = get_string(&mut payload, "NAME filename")?;
                    let longname = get_string(&mut payload, "NAME longname")?;
                    let attrs = FileAttrs::decode(&mut payload)?;
                    entries.push(NameEntry {
                        filename,
                        longname,
                        attrs,
                    });
                }
                Response::Name { id, entries }
            }
            PacketType::Attrs => Response::Attrs {
                id: get_u32(&mut payload, "request id")?,
                attrs: FileAttrs::decode(&mut payload)?,
            },
            other => {
                return Err(Error::Protocol(format!(
                    "Unexpected packet type {:?} from server",
                    other
                )))
            }
        };

        Ok(response)
    }
}

// =============================================================================
// Packet reading/writing
// =============================================================================

/// Read a single packet from the stream.
/// Returns `None` on a clean end of stream at a packet boundary,
/// otherwise (packet_type, payload).
pub async fn read_packet<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<(u8, Bytes)>> {
    let len = match r.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    if len == 0 {
        return Err(Error::Protocol("Empty packet".into()));
    }
    // Validate packet size before allocation
    if len > MAX_PACKET_SIZE {
        return Err(Error::Protocol(format!(
            "Packet size {} exceeds maximum allowed size {}",
            len, MAX_PACKET_SIZE
        )));
    }

    let kind = r.read_u8().await?;
    let mut payload = vec![0u8; len as usize - 1];
    r.read_exact(&mut payload).await?;

    Ok(Some((kind, Bytes::from(payload))))
}

/// Write a pre-encoded packet to the stream.
pub async fn write_packet<W: AsyncWrite + Unpin>(w: &mut W, packet: &Bytes) -> Result<()> {
    w.write_all(packet).await?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    /// Split an encoded packet into (type, payload), skipping the length prefix.
    fn split(packet: &Bytes) -> (u8, Bytes) {
        let len = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]) as usize;
        assert_eq!(len, packet.len() - 4);
        (packet[4], packet.slice(5..))
    }

    #[test]
    fn test_open_request_decodes_flags_and_attrs() {
        let request = Request::Open {
            id: 7,
            path: "/loans.csv".to_string(),
            flags: OpenFlags::READ,
            attrs: FileAttrs::default(),
        };
        let (kind, payload) = split(&request.encode());
        assert_eq!(kind, PacketType::Open as u8);

        let decoded = Request::decode(kind, payload).unwrap();
        assert_eq!(decoded, request);
        assert_eq!(decoded.id(), Some(7));
    }

    #[test]
    fn test_read_request_layout() {
        let request = Request::Read {
            id: 3,
            handle: Bytes::from_static(&[0, 0, 0, 1]),
            offset: 37,
            len: 100,
        };
        let packet = request.encode();
        // len | type | id | handle(len + 4) | offset | length
        assert_eq!(packet.len(), 4 + 1 + 4 + 4 + 4 + 8 + 4);
        let (kind, payload) = split(&packet);
        assert_eq!(Request::decode(kind, payload).unwrap(), request);
    }

    #[test]
    fn test_write_family_becomes_unsupported() {
        let mut body = BytesMut::new();
        body.put_u32(11);
        put_bytes(&mut body, &[0, 0, 0, 0]);
        body.put_u64(0);
        put_bytes(&mut body, b"payload");

        let decoded = Request::decode(PacketType::Write as u8, body.freeze()).unwrap();
        assert_eq!(
            decoded,
            Request::Unsupported {
                id: 11,
                kind: PacketType::Write as u8
            }
        );
    }

    #[test]
    fn test_unknown_packet_type_keeps_id() {
        let decoded = Request::decode(99, Bytes::from_static(&[0, 0, 0, 42])).unwrap();
        assert_eq!(decoded, Request::Unsupported { id: 42, kind: 99 });
    }

    #[test]
    fn test_truncated_request_is_protocol_error() {
        let err = Request::decode(PacketType::Read as u8, Bytes::from_static(&[0, 0, 0, 1, 0]))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_reply_type_from_client_is_rejected() {
        let err = Request::decode(PacketType::Status as u8, Bytes::from_static(&[0, 0, 0, 1]))
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_attrs_partial_fields() {
        let attrs = FileAttrs {
            size: Some(37),
            permissions: Some(0o100644),
            ..Default::default()
        };
        assert_eq!(attrs.flags(), AttrFlags::SIZE | AttrFlags::PERMISSIONS);

        let mut buf = BytesMut::new();
        attrs.encode_into(&mut buf);
        assert_eq!(buf.len(), 4 + 8 + 4);

        let decoded = FileAttrs::decode(&mut buf.freeze()).unwrap();
        assert_eq!(decoded, attrs);
        assert!(!decoded.is_dir());
    }

    #[test]
    fn test_attrs_skip_extended_pairs() {
        let mut buf = BytesMut::new();
        buf.put_u32((AttrFlags::SIZE | AttrFlags::EXTENDED).bits());
        buf.put_u64(5);
        buf.put_u32(1);
        put_string(&mut buf, "vendor@example.com");
        put_string(&mut buf, "value");
        buf.put_u8(0xAA);

        let mut bytes = buf.freeze();
        let attrs = FileAttrs::decode(&mut bytes).unwrap();
        assert_eq!(attrs.size, Some(5));
        assert_eq!(bytes.remaining(), 1);
    }

    #[test]
    fn test_status_response_layout() {
        let packet = Response::status(9, StatusCode::Eof).encode();
        let (kind, payload) = split(&packet);
        assert_eq!(kind, PacketType::Status as u8);

        match Response::decode(kind, payload).unwrap() {
            Response::Status { id, code, message } => {
                assert_eq!(id, 9);
                assert_eq!(code, StatusCode::Eof);
                assert_eq!(message, "End of file");
            }
            other => panic!("unexpected response {:?}", other),
        }
    }

    #[test]
    fn test_name_response_multiple_entries() {
        let response = Response::Name {
            id: 4,
            entries: vec![
                NameEntry {
                    filename: "a.csv".into(),
                    longname: "-rw-r--r-- 1 0 0 1 Jan  1 00:00 a.csv".into(),
                    attrs: FileAttrs {
                        size: Some(1),
                        ..Default::default()
                    },
                },
                NameEntry {
                    filename: "b".into(),
                    longname: "b".into(),
                    attrs: FileAttrs::default(),
                },
            ],
        };
        let (kind, payload) = split(&response.encode());
        assert_eq!(Response::decode(kind, payload).unwrap(), response);
    }

    #[test]
    fn test_wants_write() {
        assert!(!OpenFlags::READ.wants_write());
        assert!((OpenFlags::READ | OpenFlags::WRITE).wants_write());
        assert!(OpenFlags::CREAT.wants_write());
        assert!((OpenFlags::READ | OpenFlags::TRUNC).wants_write());
    }

    #[tokio::test]
    async fn test_read_packet_clean_eof() {
        let mut empty: &[u8] = &[];
        assert!(read_packet(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_packet_rejects_oversized() {
        let mut input: &[u8] = &[0xFF, 0xFF, 0xFF, 0xFF, 1];
        let err = read_packet(&mut input).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn test_read_packet_splits_type_and_payload() {
        let packet = Request::Init { version: 3 }.encode();
        let mut input: &[u8] = &packet;
        let (kind, payload) = read_packet(&mut input).await.unwrap().unwrap();
        assert_eq!(kind, PacketType::Init as u8);
        assert_eq!(&payload[..], &[0, 0, 0, 3]);
    }
}
