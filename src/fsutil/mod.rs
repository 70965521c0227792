//! Host filesystem helpers used by the runner

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use flate2::read::GzDecoder;
use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Download failed: {0}")]
    Download(String),

    #[error("Archive error: {0}")]
    Archive(String),
}

pub type FsResult<T> = Result<T, FsError>;

/// Recursively copy a directory tree, following symlinks
pub fn copy_tree(src: &Path, dst: &Path) -> FsResult<()> {
    std::fs::create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(|e| FsError::Archive(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| FsError::Archive(e.to_string()))?;
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Copy a project checkout, honoring its ignore file.
///
/// The default consults `.gitignore`; `ignore_file` overrides the file
/// name. Hidden files are copied, the VCS dir is not.
pub fn copy_project(src: &Path, dst: &Path, ignore_file: &str) -> FsResult<()> {
    std::fs::create_dir_all(dst)?;

    let mut builder = ignore::WalkBuilder::new(src);
    builder.hidden(false).git_global(false).git_exclude(false);
    if ignore_file.is_empty() {
        builder.git_ignore(true);
    } else {
        builder.git_ignore(false);
        builder.add_custom_ignore_filename(ignore_file);
    }

    for entry in builder.build() {
        let entry = entry.map_err(|e| FsError::Archive(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| FsError::Archive(e.to_string()))?;
        if relative.as_os_str().is_empty() || relative.starts_with(".git") {
            continue;
        }
        let target = dst.join(relative);
        match entry.file_type() {
            Some(ft) if ft.is_dir() => std::fs::create_dir_all(&target)?,
            Some(ft) if ft.is_file() => {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(entry.path(), &target)?;
            }
            _ => {}
        }
    }
    Ok(())
}

/// Download a gzipped tarball and unpack it into `dst`
pub async fn download_tarball(url: &str, dst: &Path) -> FsResult<()> {
    let response = reqwest::get(url)
        .await
        .map_err(|e| FsError::Download(e.to_string()))?;

    if !response.status().is_success() {
        return Err(FsError::Download(format!(
            "GET {} returned {}",
            url,
            response.status()
        )));
    }

    let tmp = dst.with_extension("download");
    if let Some(parent) = tmp.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::File::create(&tmp).await?;
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| FsError::Download(e.to_string()))?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    drop(file);

    let tmp_clone = tmp.clone();
    let dst = dst.to_path_buf();
    tokio::task::spawn_blocking(move || untar_gzip(&tmp_clone, &dst))
        .await
        .map_err(|e| FsError::Archive(e.to_string()))??;

    let _ = std::fs::remove_file(&tmp);
    Ok(())
}

/// Unpack a gzipped tarball (blocking)
pub fn untar_gzip(archive: &Path, dst: &Path) -> FsResult<()> {
    std::fs::create_dir_all(dst)?;
    let file = std::fs::File::open(archive)?;
    let decoder = GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(dst)
        .map_err(|e| FsError::Archive(e.to_string()))?;
    Ok(())
}

/// Tar a directory into `writer`, resolving symlinks to their targets
/// so the stream survives a daemon that cannot see this host.
pub fn tar_dir_resolving_symlinks<W: std::io::Write>(src: &Path, writer: W) -> FsResult<W> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(true);
    let name = src
        .file_name()
        .map(|f| f.to_string_lossy().into_owned())
        .unwrap_or_else(|| ".".to_string());
    builder
        .append_dir_all(&name, src)
        .map_err(|e| FsError::Archive(e.to_string()))?;
    builder
        .into_inner()
        .map_err(|e| FsError::Archive(e.to_string()))
}

/// Keep the newest `keep` build directories; older ones are removed once
/// their mtime passes `max_age`.
pub fn prune_old_builds(builds_dir: &Path, keep: usize, max_age: Duration) -> FsResult<Vec<PathBuf>> {
    if !builds_dir.exists() {
        return Ok(Vec::new());
    }

    let mut dirs: Vec<(PathBuf, SystemTime)> = Vec::new();
    for entry in std::fs::read_dir(builds_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            let mtime = entry.metadata()?.modified()?;
            dirs.push((entry.path(), mtime));
        }
    }

    // Newest first
    dirs.sort_by(|a, b| b.1.cmp(&a.1));

    let cutoff = SystemTime::now() - max_age;
    let mut removed = Vec::new();
    for (path, mtime) in dirs.into_iter().skip(keep) {
        if mtime < cutoff {
            debug!("Removing old build dir {}", path.display());
            if let Err(e) = std::fs::remove_dir_all(&path) {
                warn!("Failed to remove {}: {}", path.display(), e);
            } else {
                removed.push(path);
            }
        }
    }
    Ok(removed)
}

/// Read a `KEY=VALUE` env file, skipping blanks and comments
pub fn load_env_file(path: &Path) -> FsResult<Vec<(String, String)>> {
    let content = std::fs::read_to_string(path)?;
    let mut pairs = Vec::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            let value = value.trim().trim_matches('"').trim_matches('\'');
            pairs.push((key.trim().to_string(), value.to_string()));
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_copy_tree() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();
        fs::write(src.join("sub/b.txt"), "b").unwrap();

        let dst = tmp.path().join("dst");
        copy_tree(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "a");
        assert_eq!(fs::read_to_string(dst.join("sub/b.txt")).unwrap(), "b");
    }

    #[test]
    fn test_copy_project_honors_gitignore() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join(".git")).unwrap();
        fs::write(src.join(".gitignore"), "target/\n*.log\n").unwrap();
        fs::write(src.join("keep.rs"), "fn main() {}").unwrap();
        fs::write(src.join("noisy.log"), "x").unwrap();
        fs::create_dir_all(src.join("target")).unwrap();
        fs::write(src.join("target/bin"), "x").unwrap();
        fs::write(src.join(".git/HEAD"), "ref").unwrap();

        let dst = tmp.path().join("dst");
        copy_project(&src, &dst, "").unwrap();

        assert!(dst.join("keep.rs").exists());
        assert!(dst.join(".gitignore").exists());
        assert!(!dst.join("noisy.log").exists());
        assert!(!dst.join("target").join("bin").exists());
        assert!(!dst.join(".git").exists());
    }

    #[test]
    fn test_prune_old_builds_keeps_newest_two() {
        let tmp = TempDir::new().unwrap();
        let builds = tmp.path().join("builds");
        for name in ["one", "two", "three"] {
            fs::create_dir_all(builds.join(name)).unwrap();
        }

        // Nothing is old enough to remove
        let removed = prune_old_builds(&builds, 2, Duration::from_secs(24 * 3600)).unwrap();
        assert!(removed.is_empty());

        // With a zero age limit the oldest one beyond the keep set goes
        std::thread::sleep(Duration::from_millis(20));
        let removed = prune_old_builds(&builds, 2, Duration::ZERO).unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(builds.read_dir().unwrap().count(), 2);
    }

    #[test]
    fn test_load_env_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("env");
        fs::write(&path, "# comment\nFOO=bar\nQUOTED=\"a b\"\n\nBAD_LINE\n").unwrap();
        let pairs = load_env_file(&path).unwrap();
        assert_eq!(
            pairs,
            vec![
                ("FOO".to_string(), "bar".to_string()),
                ("QUOTED".to_string(), "a b".to_string()),
            ]
        );
    }

    #[test]
    fn test_tar_dir_resolving_symlinks() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("data");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("real.txt"), "content").unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink(src.join("real.txt"), src.join("link.txt")).unwrap();

        let bytes = tar_dir_resolving_symlinks(&src, Vec::new()).unwrap();
        let mut archive = tar::Archive::new(&bytes[..]);
        let mut regular = 0;
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            if entry.header().entry_type().is_file() {
                regular += 1;
            }
        }
        #[cfg(unix)]
        assert_eq!(regular, 2);
    }
}
