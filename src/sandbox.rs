//! Client path resolution confined to the served root.
//!
//! Resolution is lexical: nothing touches the filesystem until a path has
//! been proven to stay under the root.

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// The directory tree exposed to clients.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
}

impl Sandbox {
    /// Wrap an already canonical root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the root if needed and canonicalize it.
    pub fn open(root: &Path) -> Result<Self> {
        if !root.exists() {
            std::fs::create_dir_all(root)?;
        }
        let root = std::fs::canonicalize(root)?;
        if !root.is_dir() {
            return Err(Error::Config(format!(
                "Served root is not a directory: {}",
                root.display()
            )));
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, client_path: &str) -> Result<PathBuf> {
        resolve(client_path, &self.root)
    }

    /// Re-check a resolved path after following links on disk.
    pub async fn confine_existing(&self, resolved: &Path) -> Result<PathBuf> {
        let real = tokio::fs::canonicalize(resolved).await?;
        if !real.starts_with(&self.root) {
            return Err(Error::PathEscape(resolved.display().to_string()));
        }
        Ok(real)
    }

    /// Like [`Sandbox::confine_existing`] but leaves the final component
    /// unfollowed, for LSTAT.
    pub async fn confine_parent(&self, resolved: &Path) -> Result<PathBuf> {
        match (resolved.parent(), resolved.file_name()) {
            (Some(parent), Some(name)) if resolved != self.root => {
                Ok(self.confine_existing(parent).await?.join(name))
            }
            _ => self.confine_existing(resolved).await,
        }
    }
}

/// Join `client_path` onto `root` and prove the result stays inside it.
///
/// Empty and `.` map to the root. Every path is treated as rooted, so
/// `loans.csv` and `/loans.csv` name the same file.
pub fn resolve(client_path: &str, root: &Path) -> Result<PathBuf> {
    if client_path.is_empty() || client_path == "." {
        return Ok(root.to_path_buf());
    }

    let relative = client_path.trim_start_matches('/');
    let candidate = normalize_path(&root.join(relative));

    if !candidate.starts_with(normalize_path(root)) {
        return Err(Error::PathEscape(client_path.to_string()));
    }

    Ok(candidate)
}

/// Canonical client-side spelling of a path, as REALPATH reports it.
pub fn client_view(client_path: &str) -> String {
    let rooted = Path::new("/").join(client_path.trim_start_matches('/'));
    let normalized = normalize_path(&rooted);
    let mut view = String::from("/");
    let mut first = true;
    for component in normalized.components() {
        if let Component::Normal(part) = component {
            if !first {
                view.push('/');
            }
            view.push_str(&part.to_string_lossy());
            first = false;
        }
    }
    view
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
