//! # loanvault
//!
//! Read-only SFTP export of a single directory tree, plus the fetcher that
//! pulls the exported data file back down.
//!
//! - [`server`]: SSH listener, password authentication, per-connection sessions
//! - [`sftp`]: SFTP v3 codec, handle table and command dispatcher
//! - [`sandbox`]: client path resolution confined to the served root
//! - [`keys`]: persistent host identity
//! - [`fetch`]: SFTP client and whole-file download

pub mod cli;
pub mod config;
pub mod error;
pub mod fetch;
pub mod keys;
pub mod sandbox;
pub mod server;
pub mod sftp;

pub use config::{Credentials, ServerConfig};
pub use error::{Error, Result};
pub use fetch::{fetch, FetchConfig};
pub use sandbox::Sandbox;
pub use server::{ServerHandle, ServerRegistry};
