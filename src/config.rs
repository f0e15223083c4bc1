//! Server configuration.
//!
//! Values are layered: command line / environment, then an optional TOML
//! file, then built-in defaults. The merge lives in `cli`; this module holds
//! the resolved, immutable result.

use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use subtle::ConstantTimeEq;

use crate::error::{Error, Result};
use crate::sftp::{DEFAULT_MAX_READ_LEN, MAX_DATA_LEN};

pub const DEFAULT_PORT: u16 = 2222;
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0";
pub const DEFAULT_ROOT: &str = "./data";
pub const DEFAULT_HOST_KEY_PATH: &str = "./keys/host_ed25519";
pub const DEFAULT_AUTH_REJECTION_SECS: u64 = 0;

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            home.join(rest)
        } else {
            path.to_path_buf()
        }
    } else {
        path.to_path_buf()
    }
}

/// The single accepted username/password pair.
#[derive(Clone)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Both factors are always compared in full so timing does not reveal
    /// which one was wrong.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let user_ok = self.username.as_bytes().ct_eq(username.as_bytes());
        let pass_ok = self.password.as_bytes().ct_eq(password.as_bytes());
        (user_ok & pass_ok).into()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Fully resolved server settings, fixed for the life of the process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    pub credentials: Credentials,
    /// Served directory; canonicalized when the server starts.
    pub root: PathBuf,
    pub host_key_path: PathBuf,
    /// Delay before answering a failed authentication.
    pub auth_rejection_time: Duration,
    /// Upper bound on the bytes returned by one READ.
    pub max_read_len: u32,
}

impl ServerConfig {
    pub fn new(root: impl Into<PathBuf>, credentials: Credentials) -> Self {
        Self {
            bind_address: DEFAULT_BIND_ADDRESS.to_string(),
            port: DEFAULT_PORT,
            credentials,
            root: root.into(),
            host_key_path: PathBuf::from(DEFAULT_HOST_KEY_PATH),
            auth_rejection_time: Duration::from_secs(DEFAULT_AUTH_REJECTION_SECS),
            max_read_len: DEFAULT_MAX_READ_LEN,
        }
    }

    pub fn listen_addr(&self) -> String {
        if self.bind_address.contains(':') && !self.bind_address.starts_with('[') {
            format!("[{}]:{}", self.bind_address, self.port)
        } else {
            format!("{}:{}", self.bind_address, self.port)
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.credentials.username.is_empty() {
            return Err(Error::Config("username must not be empty".into()));
        }
        if self.credentials.password.is_empty() {
            return Err(Error::Config("password must not be empty".into()));
        }
        if self.max_read_len == 0 {
            return Err(Error::Config("max_read_len must be positive".into()));
        }
        // A DATA reply must still fit in one packet.
        if self.max_read_len > MAX_DATA_LEN {
            return Err(Error::Config(format!(
                "max_read_len {} exceeds the largest DATA payload ({})",
                self.max_read_len, MAX_DATA_LEN
            )));
        }
        Ok(())
    }
}

/// Optional on-disk configuration. Every key may be omitted.
#[derive(Debug, Default, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub root: Option<PathBuf>,
    pub host_key_path: Option<PathBuf>,
    pub auth_rejection_secs: Option<u64>,
    pub max_read_len: Option<u32>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let path = expand_tilde(path);
        let text = std::fs::read_to_string(&path).map_err(|e| {
            Error::Config(format!("Cannot read config {}: {}", path.display(), e))
        })?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(format!("Invalid config: {}", e)))
    }
}
