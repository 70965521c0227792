//! Tar stream consumption
//!
//! Containers hand their files out as tar streams. Two consumers exist:
//! a single named entry copied to a writer, and a bulk extract of every
//! regular file under a prefix. A stream with no matching regular file is
//! the empty-tarball condition, which callers treat as a sentinel rather
//! than an I/O failure.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

/// Cumulative size cap for pipeline artifacts
pub const ARTIFACT_SIZE_CAP: u64 = 5_000 * 1024 * 1024;

/// Cumulative size cap for cache collection
pub const CACHE_SIZE_CAP: u64 = 1_000 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ExtractError {
    /// No regular file matched; distinct from an I/O failure
    #[error("Empty tarball")]
    EmptyTarball,

    #[error("Archive exceeds size cap of {limit} bytes")]
    SizeExceeded { limit: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExtractError {
    pub fn is_empty_tarball(&self) -> bool {
        matches!(self, ExtractError::EmptyTarball)
    }
}

/// One pass over a tar byte stream
pub struct Archive<R: Read> {
    inner: tar::Archive<R>,
}

impl<R: Read> Archive<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: tar::Archive::new(reader),
        }
    }

    /// Copy the body of the entry named `name` (full path or basename)
    /// into `writer`. A stream without it is an empty tarball.
    pub fn single_bytes<W: Write>(mut self, name: &str, writer: &mut W) -> Result<(), ExtractError> {
        for entry in self.inner.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let path = entry.path()?.into_owned();
            let matches = path == Path::new(name)
                || path.file_name().map(|f| f == name).unwrap_or(false);

            if matches {
                std::io::copy(&mut entry, writer)?;
                return Ok(());
            }
        }
        Err(ExtractError::EmptyTarball)
    }

    /// Extract every regular file under `prefix` into `dst_dir`.
    ///
    /// The destination is created lazily on the first file, so an empty
    /// stream leaves no trace on disk. Cumulative body bytes above
    /// `size_cap` abort the extraction.
    pub fn multi(mut self, prefix: &str, dst_dir: &Path, size_cap: u64) -> Result<(), ExtractError> {
        let mut extracted = 0usize;
        let mut total_bytes = 0u64;

        for entry in self.inner.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }

            let path = entry.path()?.into_owned();
            let Some(relative) = strip_prefix(&path, prefix) else {
                continue;
            };
            if relative.as_os_str().is_empty() {
                continue;
            }

            total_bytes += entry.header().size()?;
            if total_bytes > size_cap {
                return Err(ExtractError::SizeExceeded { limit: size_cap });
            }

            if extracted == 0 {
                std::fs::create_dir_all(dst_dir)?;
            }

            let target = dst_dir.join(&relative);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let mut file = std::fs::File::create(&target)?;
            std::io::copy(&mut entry, &mut file)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                if let Ok(mode) = entry.header().mode() {
                    let _ = std::fs::set_permissions(
                        &target,
                        std::fs::Permissions::from_mode(mode),
                    );
                }
            }

            extracted += 1;
        }

        if extracted == 0 {
            return Err(ExtractError::EmptyTarball);
        }

        debug!("Extracted {} files ({} bytes)", extracted, total_bytes);
        Ok(())
    }
}

/// Path relative to `prefix`, or None when the entry lives elsewhere
fn strip_prefix(path: &Path, prefix: &str) -> Option<PathBuf> {
    if prefix.is_empty() {
        return Some(path.to_path_buf());
    }
    // Tolerate a leading ./ in entry names
    let cleaned = path.strip_prefix("./").unwrap_or(path);
    cleaned.strip_prefix(prefix).ok().map(|p| p.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tarball(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, body) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(body.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, body.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn dir_only_tarball(name: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, &[][..]).unwrap();
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_single_bytes_by_basename() {
        let data = tarball(&[("report/message.txt", "all good")]);
        let mut out = Vec::new();
        Archive::new(&data[..])
            .single_bytes("message.txt", &mut out)
            .unwrap();
        assert_eq!(out, b"all good");
    }

    #[test]
    fn test_single_bytes_missing_is_empty_tarball() {
        let data = tarball(&[("report/other.txt", "x")]);
        let mut out = Vec::new();
        let err = Archive::new(&data[..])
            .single_bytes("message.txt", &mut out)
            .unwrap_err();
        assert!(err.is_empty_tarball());
        assert!(out.is_empty());
    }

    #[test]
    fn test_multi_extracts_under_prefix() {
        let tmp = TempDir::new().unwrap();
        let dst = tmp.path().join("out");
        let data = tarball(&[
            ("artifacts/a.txt", "one"),
            ("artifacts/sub/b.txt", "two"),
            ("elsewhere/c.txt", "three"),
        ]);

        Archive::new(&data[..])
            .multi("artifacts", &dst, ARTIFACT_SIZE_CAP)
            .unwrap();

        assert_eq!(std::fs::read_to_string(dst.join("a.txt")).unwrap(), "one");
        assert_eq!(
            std::fs::read_to_string(dst.join("sub/b.txt")).unwrap(),
            "two"
        );
        assert!(!dst.join("c.txt").exists());
    }

    #[test]
    fn test_multi_empty_creates_no_directory() {
        let tmp = TempDir::new().unwrap();
        let dst = tmp.path().join("out");

        let err = Archive::new(&tarball(&[])[..])
            .multi("artifacts", &dst, ARTIFACT_SIZE_CAP)
            .unwrap_err();
        assert!(err.is_empty_tarball());
        assert!(!dst.exists());

        // Directory-only streams are just as empty
        let err = Archive::new(&dir_only_tarball("artifacts/")[..])
            .multi("artifacts", &dst, ARTIFACT_SIZE_CAP)
            .unwrap_err();
        assert!(err.is_empty_tarball());
        assert!(!dst.exists());
    }

    #[test]
    fn test_multi_size_cap() {
        let tmp = TempDir::new().unwrap();
        let dst = tmp.path().join("out");
        let data = tarball(&[("artifacts/big.bin", "0123456789")]);

        let err = Archive::new(&data[..])
            .multi("artifacts", &dst, 5)
            .unwrap_err();
        assert!(matches!(err, ExtractError::SizeExceeded { limit: 5 }));
    }
}
