//! SFTP v3 subsystem: wire codec, handle table and the per-session dispatcher.
//!
//! # Session flow
//!
//! ```text
//! channel bytes -> read_packet -> Request::decode -> SftpSession::handle
//!                                                      |        |
//!                                                   Sandbox  HandleTable
//!                                                      |
//! channel bytes <- write_packet <- Response::encode <--+
//! ```

pub mod attrs;
pub mod handles;
pub mod protocol;
pub mod session;

pub use handles::{DirEntry, HandleId, HandleTable};
pub use protocol::{
    read_packet, write_packet, AttrFlags, FileAttrs, NameEntry, OpenFlags, PacketType, Request,
    Response, StatusCode, MAX_DATA_LEN, MAX_PACKET_SIZE, SFTP_VERSION,
};
pub use session::{SftpSession, DEFAULT_MAX_READ_LEN};
