//! Command-line interface.
//!
//! Every server setting can come from a flag, its environment variable, or the
//! optional TOML file, in that order of precedence.

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{
    Credentials, FileConfig, ServerConfig, DEFAULT_AUTH_REJECTION_SECS, DEFAULT_BIND_ADDRESS,
    DEFAULT_HOST_KEY_PATH, DEFAULT_PORT, DEFAULT_ROOT,
};
use crate::error::{Error, Result};
use crate::fetch::{FetchConfig, FETCH_CHUNK_SIZE};
use crate::sftp::DEFAULT_MAX_READ_LEN;

#[derive(Parser, Debug)]
#[command(name = "loanvault")]
#[command(about = "Read-only SFTP export and fetcher for the loan data file", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// Default filter directive when RUST_LOG is unset.
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "warn";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the root directory over SFTP until interrupted
    Serve(ServeArgs),
    /// Download one file from a running export
    Fetch(FetchArgs),
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// TOML file with any of the settings below
    #[arg(long, env = "LOANVAULT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind
    #[arg(long, env = "SFTP_HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "SFTP_PORT")]
    pub port: Option<u16>,

    /// Accepted username
    #[arg(long, env = "SFTP_USERNAME")]
    pub username: Option<String>,

    /// Accepted password
    #[arg(long, env = "SFTP_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Directory to serve (created if missing)
    #[arg(long, env = "SFTP_ROOT")]
    pub root: Option<PathBuf>,

    /// Host key file (generated on first start)
    #[arg(long, env = "SFTP_HOST_KEY_PATH")]
    pub host_key_path: Option<PathBuf>,
}

impl ServeArgs {
    pub fn into_config(self) -> Result<ServerConfig> {
        let file = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };
        self.merge(file)
    }

    /// Layer these arguments over `file`, falling back to defaults.
    pub fn merge(self, file: FileConfig) -> Result<ServerConfig> {
        let username = self.username.or(file.username).ok_or_else(|| {
            Error::Config("username is required (--username or SFTP_USERNAME)".into())
        })?;
        let password = self.password.or(file.password).ok_or_else(|| {
            Error::Config("password is required (--password or SFTP_PASSWORD)".into())
        })?;

        let config = ServerConfig {
            bind_address: self
                .host
                .or(file.host)
                .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string()),
            port: self.port.or(file.port).unwrap_or(DEFAULT_PORT),
            credentials: Credentials::new(username, password),
            root: self
                .root
                .or(file.root)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_ROOT)),
            host_key_path: self
                .host_key_path
                .or(file.host_key_path)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_HOST_KEY_PATH)),
            auth_rejection_time: Duration::from_secs(
                file.auth_rejection_secs
                    .unwrap_or(DEFAULT_AUTH_REJECTION_SECS),
            ),
            max_read_len: file.max_read_len.unwrap_or(DEFAULT_MAX_READ_LEN),
        };
        config.validate()?;
        Ok(config)
    }
}

#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Remote path of the file to download
    pub remote_path: String,

    /// Write here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Server to connect to
    #[arg(long, env = "SFTP_HOST", default_value = "127.0.0.1")]
    pub host: String,

    #[arg(short, long, env = "SFTP_PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    #[arg(long, env = "SFTP_USERNAME")]
    pub username: String,

    #[arg(long, env = "SFTP_PASSWORD", hide_env_values = true)]
    pub password: String,

    /// Expected host key fingerprint (SHA256:...)
    #[arg(long, env = "SFTP_HOST_FINGERPRINT")]
    pub fingerprint: Option<String>,

    /// Bytes requested per read
    #[arg(long, default_value_t = FETCH_CHUNK_SIZE)]
    pub chunk_size: u32,
}

impl FetchArgs {
    pub fn fetch_config(&self) -> FetchConfig {
        let mut config = FetchConfig::new(
            self.host.clone(),
            self.port,
            self.username.clone(),
            self.password.clone(),
        );
        config.host_fingerprint = self.fingerprint.clone();
        config.chunk_size = self.chunk_size;
        config
    }
}
