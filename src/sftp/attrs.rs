//! Filesystem metadata as SFTP attributes and `ls -l` long names.

use chrono::{DateTime, Duration, Utc};
use std::fs::Metadata;

use crate::sftp::protocol::FileAttrs;

const S_IFMT: u32 = 0o170000;
const S_IFDIR: u32 = 0o040000;
const S_IFLNK: u32 = 0o120000;
const S_IFREG: u32 = 0o100000;

/// Seconds since the epoch, clamped into the v3 32-bit time field.
fn clamp_secs(secs: i64) -> u32 {
    secs.clamp(0, u32::MAX as i64) as u32
}

#[cfg(unix)]
pub fn from_metadata(meta: &Metadata) -> FileAttrs {
    use std::os::unix::fs::MetadataExt;

    FileAttrs {
        size: Some(meta.size()),
        uid: Some(meta.uid()),
        gid: Some(meta.gid()),
        permissions: Some(meta.mode()),
        atime: Some(clamp_secs(meta.atime())),
        mtime: Some(clamp_secs(meta.mtime())),
    }
}

#[cfg(not(unix))]
pub fn from_metadata(meta: &Metadata) -> FileAttrs {
    let secs = |t: std::io::Result<std::time::SystemTime>| {
        t.ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| clamp_secs(d.as_secs() as i64))
            .unwrap_or(0)
    };
    let kind = if meta.is_dir() {
        S_IFDIR | 0o755
    } else if meta.file_type().is_symlink() {
        S_IFLNK | 0o777
    } else {
        S_IFREG | if meta.permissions().readonly() { 0o444 } else { 0o644 }
    };

    FileAttrs {
        size: Some(meta.len()),
        uid: Some(0),
        gid: Some(0),
        permissions: Some(kind),
        atime: Some(secs(meta.accessed())),
        mtime: Some(secs(meta.modified())),
    }
}

#[cfg(unix)]
fn link_count(meta: &Metadata) -> u64 {
    use std::os::unix::fs::MetadataExt;
    meta.nlink()
}

#[cfg(not(unix))]
fn link_count(_meta: &Metadata) -> u64 {
    1
}

/// `drwxr-xr-x` style rendering of a mode.
pub fn mode_string(mode: u32) -> String {
    let kind = match mode & S_IFMT {
        S_IFDIR => 'd',
        S_IFLNK => 'l',
        S_IFREG => '-',
        0o020000 => 'c',
        0o060000 => 'b',
        0o010000 => 'p',
        0o140000 => 's',
        _ => '?',
    };

    let mut out = String::with_capacity(10);
    out.push(kind);
    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }
    out
}

/// Long-form listing line for READDIR, in the layout OpenSSH produces.
pub fn long_name(name: &str, meta: &Metadata) -> String {
    let attrs = from_metadata(meta);
    format_long_name(name, &attrs, link_count(meta), Utc::now())
}

fn format_long_name(name: &str, attrs: &FileAttrs, nlink: u64, now: DateTime<Utc>) -> String {
    let mtime = DateTime::from_timestamp(attrs.mtime.unwrap_or(0) as i64, 0).unwrap_or_default();
    // Recent files show the time of day, older ones the year.
    let date = if now.signed_duration_since(mtime) < Duration::days(182) && mtime <= now {
        mtime.format("%b %e %H:%M")
    } else {
        mtime.format("%b %e  %Y")
    };

    format!(
        "{:<10} {:>3} {:<8} {:<8} {:>8} {} {}",
        mode_string(attrs.permissions.unwrap_or(0)),
        nlink,
        attrs.uid.unwrap_or(0),
        attrs.gid.unwrap_or(0),
        attrs.size.unwrap_or(0),
        date,
        name
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_string() {
        assert_eq!(mode_string(0o100644), "-rw-r--r--");
        assert_eq!(mode_string(0o040755), "drwxr-xr-x");
        assert_eq!(mode_string(0o120777), "lrwxrwxrwx");
        assert_eq!(mode_string(0o100600), "-rw-------");
    }

    #[test]
    fn test_long_name_recent_file() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let attrs = FileAttrs {
            size: Some(37),
            uid: Some(1000),
            gid: Some(100),
            permissions: Some(0o100644),
            atime: Some(1_699_990_000),
            mtime: Some(1_699_990_000),
        };
        let line = format_long_name("loans.csv", &attrs, 1, now);
        assert!(line.starts_with("-rw-r--r--   1 1000     100      "));
        assert!(line.ends_with(" loans.csv"));
        assert!(line.contains("Nov 14"));
        assert!(line.contains(':'));
    }

    #[test]
    fn test_long_name_old_file_shows_year() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let attrs = FileAttrs {
            size: Some(0),
            uid: Some(0),
            gid: Some(0),
            permissions: Some(0o040755),
            atime: Some(0),
            mtime: Some(0),
        };
        let line = format_long_name("archive", &attrs, 2, now);
        assert!(line.starts_with("drwxr-xr-x   2 0"));
        assert!(line.contains("Jan  1  1970"));
    }

    #[cfg(unix)]
    #[test]
    fn test_from_metadata_truncates_to_seconds() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("loans.csv");
        std::fs::write(&path, b"id,amount\n1,100\n").unwrap();
        let mtime = filetime::FileTime::from_unix_time(1_650_000_000, 999_000_000);
        filetime::set_file_times(&path, mtime, mtime).unwrap();

        let attrs = from_metadata(&std::fs::metadata(&path).unwrap());
        assert_eq!(attrs.size, Some(16));
        assert_eq!(attrs.mtime, Some(1_650_000_000));
        assert_eq!(attrs.atime, Some(1_650_000_000));
        assert_eq!(attrs.permissions.unwrap() & S_IFMT, S_IFREG);
    }
}
