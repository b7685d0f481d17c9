use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;
use uuid::Uuid;

use crate::error::Result;
use crate::platform::Platform;

pub fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn sibling_temp_path(path: &Path) -> PathBuf {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "warden".to_string());
    parent.join(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Uuid::new_v4().simple()
    ))
}

/// Write `contents` to a unique sibling and rename it over `path`.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    write_atomic_inner(path, contents, None)
}

/// Like [`write_atomic`], but owner-only. Permissions are applied to the
/// temporary file and again after the rename, since not every platform keeps
/// the mode across rename.
pub fn write_atomic_private(path: &Path, contents: &[u8], platform: &dyn Platform) -> Result<()> {
    write_atomic_inner(path, contents, Some(platform))
}

fn write_atomic_inner(path: &Path, contents: &[u8], platform: Option<&dyn Platform>) -> Result<()> {
    ensure_parent(path)?;
    let tmp_path = sibling_temp_path(path);
    let written = (|| -> Result<()> {
        fs::write(&tmp_path, contents)?;
        if let Some(platform) = platform {
            platform.restrict_permissions(&tmp_path);
        }
        fs::rename(&tmp_path, path)?;
        Ok(())
    })();
    if written.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    written?;
    if let Some(platform) = platform {
        platform.restrict_permissions(path);
    }
    Ok(())
}

pub fn remove_path(path: &Path) -> Result<bool> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    if meta.file_type().is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(true)
}

/// Recursively copy `src` into `dst`. Symlinks are skipped.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let target = dst.join(entry.file_name());
        if file_type.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// A scratch directory under the system temp dir, removed on drop.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    pub fn create(prefix: &str) -> Result<Self> {
        let path = env::temp_dir().join(format!(
            "{}-{}-{}",
            prefix,
            std::process::id(),
            Uuid::new_v4().simple()
        ));
        fs::create_dir_all(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.path) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %err, "failed to remove scratch directory");
            }
        }
    }
}
