//! Gzip tar snapshots of a directory tree, and guarded extraction.
//!
//! Extraction validates every entry before writing anything, so an archive
//! carrying a single escaping path (`../`, absolute, drive prefix) or a link
//! entry produces no output at all.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, EntryType};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Result, WardenError};
use crate::fsutil::remove_path;

/// Pack every regular file under `root` into an in-memory `.tar.gz`,
/// skipping files whose root-relative name is listed in `exclude`.
///
/// Entry names are root-relative and always use `/` separators.
pub fn create_tar_gz(root: &Path, exclude: &[&str]) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut count = 0usize;
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|err| WardenError::Archive(format!("walk failed: {err}")))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(root)
            .map_err(|err| WardenError::Archive(err.to_string()))?;
        let name = posix_relative_name(relative);
        if exclude.contains(&name.as_str()) {
            debug!(name = %name, "excluded from archive");
            continue;
        }
        builder
            .append_path_with_name(entry.path(), &name)
            .map_err(|err| WardenError::Archive(format!("failed to add {name}: {err}")))?;
        count += 1;
    }

    let encoder = builder
        .into_inner()
        .map_err(|err| WardenError::Archive(format!("failed to finish archive: {err}")))?;
    let bytes = encoder
        .finish()
        .map_err(|err| WardenError::Archive(format!("failed to compress archive: {err}")))?;
    debug!(files = count, bytes = bytes.len(), root = %root.display(), "archive assembled");
    Ok(bytes)
}

fn posix_relative_name(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().to_string()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Extract the `.tar.gz` at `archive_path` into `dest`.
pub fn extract_tar_gz(archive_path: &Path, dest: &Path) -> Result<()> {
    validate_archive(archive_path)?;

    fs::create_dir_all(dest)?;
    let preexisting: Vec<PathBuf> = fs::read_dir(dest)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .collect();

    let unpacked = unpack_validated(archive_path, dest);
    if unpacked.is_err() {
        // Drop whatever this call created; leave earlier contents alone.
        if let Ok(entries) = fs::read_dir(dest) {
            for entry in entries.flatten() {
                let path = entry.path();
                if !preexisting.contains(&path) {
                    let _ = remove_path(&path);
                }
            }
        }
    }
    unpacked
}

fn open_archive(archive_path: &Path) -> Result<Archive<GzDecoder<File>>> {
    let file = File::open(archive_path)?;
    Ok(Archive::new(GzDecoder::new(file)))
}

fn validate_archive(archive_path: &Path) -> Result<()> {
    let mut archive = open_archive(archive_path)?;
    let entries = archive
        .entries()
        .map_err(|err| WardenError::Archive(format!("failed to read archive entries: {err}")))?;
    let mut count = 0usize;
    for entry in entries {
        let entry =
            entry.map_err(|err| WardenError::Archive(format!("failed to read archive entry: {err}")))?;
        let path = entry
            .path()
            .map_err(|err| WardenError::Archive(format!("failed to read entry path: {err}")))?
            .into_owned();
        if !is_safe_entry_type(entry.header().entry_type()) {
            return Err(WardenError::Archive(format!(
                "unsupported entry type {:?} at {}",
                entry.header().entry_type(),
                path.display()
            )));
        }
        relative_target(&path)?;
        count += 1;
    }
    if count == 0 {
        return Err(WardenError::Archive("archive is empty".to_string()));
    }
    Ok(())
}

fn unpack_validated(archive_path: &Path, dest: &Path) -> Result<()> {
    let mut archive = open_archive(archive_path)?;
    let entries = archive
        .entries()
        .map_err(|err| WardenError::Archive(format!("failed to read archive entries: {err}")))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|err| WardenError::Archive(format!("failed to read archive entry: {err}")))?;
        let path = entry
            .path()
            .map_err(|err| WardenError::Archive(format!("failed to read entry path: {err}")))?
            .into_owned();
        let Some(relative) = relative_target(&path)? else {
            continue;
        };
        let target = dest.join(relative);
        match entry.header().entry_type() {
            EntryType::Directory => {
                fs::create_dir_all(&target)?;
            }
            EntryType::Regular => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents)?;
                fs::write(&target, contents)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn is_safe_entry_type(entry_type: EntryType) -> bool {
    matches!(
        entry_type,
        EntryType::Regular
            | EntryType::Directory
            | EntryType::GNULongName
            | EntryType::XHeader
            | EntryType::XGlobalHeader
    )
}

/// Destination of an entry relative to the extraction root, or `None` for
/// entries that name the root itself (`./`). Anything that could resolve
/// outside the root is rejected.
fn relative_target(path: &Path) -> Result<Option<PathBuf>> {
    let mut relative = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(WardenError::PathTraversal {
                    path: path.display().to_string(),
                });
            }
        }
    }
    // Backslash-separated names never split into components on unix.
    let text = relative.to_string_lossy();
    if text.contains('\\') && text.split('\\').any(|part| part == ".." || part.ends_with(':')) {
        return Err(WardenError::PathTraversal {
            path: path.display().to_string(),
        });
    }
    if relative.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(relative))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    /// Build a gzip tar from raw 512-byte headers so unsafe names survive the
    /// `tar` crate's own path validation.
    pub(crate) fn raw_tar_gz(entries: &[(&[u8], &[u8])]) -> Vec<u8> {
        let mut tar_data = Vec::new();
        for (name, data) in entries {
            let mut header = [0u8; 512];
            let len = name.len().min(100);
            header[..len].copy_from_slice(&name[..len]);
            header[100..108].copy_from_slice(b"0000644\0");
            header[108..116].copy_from_slice(b"0000000\0");
            header[116..124].copy_from_slice(b"0000000\0");
            let size = format!("{:011o}\0", data.len());
            header[124..136].copy_from_slice(size.as_bytes());
            header[136..148].copy_from_slice(b"00000000000\0");
            header[156] = b'0';
            header[257..263].copy_from_slice(b"ustar\0");
            header[263..265].copy_from_slice(b"00");
            header[148..156].copy_from_slice(b"        ");
            let checksum: u32 = header.iter().map(|b| u32::from(*b)).sum();
            let checksum = format!("{checksum:06o}\0 ");
            header[148..156].copy_from_slice(checksum.as_bytes());
            tar_data.extend_from_slice(&header);
            tar_data.extend_from_slice(data);
            let padding = (512 - data.len() % 512) % 512;
            tar_data.extend(std::iter::repeat(0u8).take(padding));
        }
        tar_data.extend(std::iter::repeat(0u8).take(1024));
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(&tar_data).unwrap();
        encoder.finish().unwrap()
    }

    fn write_archive(dir: &Path, bytes: &[u8]) -> PathBuf {
        let path = dir.join("archive.tar.gz");
        fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn snapshot_uses_relative_posix_names() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("state");
        fs::create_dir_all(root.join("agents/main/agent")).unwrap();
        fs::write(root.join("config.json"), b"{}").unwrap();
        fs::write(root.join("agents/main/agent/auth-profiles.json"), b"{}").unwrap();
        fs::write(root.join("gateway.pid"), b"123\n").unwrap();
        fs::write(root.join("agents/main/gateway.pid"), b"keep").unwrap();

        let bytes = create_tar_gz(&root, &["gateway.pid"]).unwrap();
        let mut archive = Archive::new(GzDecoder::new(bytes.as_slice()));
        let mut names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "agents/main/agent/auth-profiles.json",
                "agents/main/gateway.pid",
                "config.json"
            ]
        );
    }

    #[test]
    fn snapshot_extracts_back_to_same_tree() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("state");
        fs::create_dir_all(root.join("sessions")).unwrap();
        fs::write(root.join("config.json"), b"{\"a\":1}").unwrap();
        fs::write(root.join("sessions/s1.jsonl"), b"line\n").unwrap();

        let archive_path = write_archive(dir.path(), &create_tar_gz(&root, &[]).unwrap());
        let dest = dir.path().join("out");
        extract_tar_gz(&archive_path, &dest).unwrap();
        assert_eq!(fs::read(dest.join("config.json")).unwrap(), b"{\"a\":1}");
        assert_eq!(fs::read(dest.join("sessions/s1.jsonl")).unwrap(), b"line\n");
    }

    #[test]
    fn traversal_entry_aborts_without_writing() {
        let dir = tempdir().unwrap();
        let bytes = raw_tar_gz(&[
            (b"config.json", b"{}"),
            (b"notes/ok.txt", b"fine"),
            (b"../../evil", b"pwned"),
        ]);
        let archive_path = write_archive(dir.path(), &bytes);
        let dest = dir.path().join("dest");

        let err = extract_tar_gz(&archive_path, &dest).unwrap_err();
        assert!(matches!(err, WardenError::PathTraversal { .. }));
        let written = fs::read_dir(&dest).map(|it| it.count()).unwrap_or(0);
        assert_eq!(written, 0);
        assert!(!dir.path().join("evil").exists());
    }

    #[test]
    fn absolute_entry_is_rejected() {
        let dir = tempdir().unwrap();
        let bytes = raw_tar_gz(&[(b"/tmp/warden-absolute", b"x")]);
        let archive_path = write_archive(dir.path(), &bytes);
        let err = extract_tar_gz(&archive_path, &dir.path().join("dest")).unwrap_err();
        assert!(matches!(err, WardenError::PathTraversal { .. }));
    }

    #[test]
    fn empty_archive_is_rejected() {
        let dir = tempdir().unwrap();
        let archive_path = write_archive(dir.path(), &raw_tar_gz(&[]));
        let err = extract_tar_gz(&archive_path, &dir.path().join("dest")).unwrap_err();
        assert!(matches!(err, WardenError::Archive(_)));
    }

    #[test]
    fn relative_target_skips_current_dir_markers() {
        assert_eq!(relative_target(Path::new("./")).unwrap(), None);
        assert_eq!(
            relative_target(Path::new("./a/b")).unwrap(),
            Some(PathBuf::from("a/b"))
        );
        assert!(relative_target(Path::new("a/../../b")).is_err());
    }
}
