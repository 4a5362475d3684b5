//! Zip a function directory into a deployment archive

use crate::error::{ProvisionError, ProvisionResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha2::{Digest, Sha256};
use std::io::{Cursor, Write};
use std::path::Path;
use tracing::debug;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

/// Entry point the `provided` runtimes execute
pub const BOOTSTRAP: &str = "bootstrap";

/// Archive every file under `dir`, with paths relative to it. Entries are
/// sorted and carry a fixed timestamp, so the same tree always yields the same
/// bytes.
pub fn zip_directory(dir: &Path) -> ProvisionResult<Vec<u8>> {
    let fail = |message: String| ProvisionError::Package {
        path: dir.display().to_string(),
        message,
    };

    if !dir.is_dir() {
        return Err(fail("not a directory".to_string()));
    }

    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    let mut files = 0usize;

    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| fail(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let relative = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| fail(e.to_string()))?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        let mode = if name == BOOTSTRAP { 0o755 } else { 0o644 };
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(DateTime::default())
            .unix_permissions(mode);

        let contents = std::fs::read(entry.path()).map_err(|e| fail(e.to_string()))?;
        writer
            .start_file(name.as_str(), options)
            .map_err(|e| fail(e.to_string()))?;
        writer.write_all(&contents).map_err(|e| fail(e.to_string()))?;
        debug!(file = %name, bytes = contents.len(), "Added to archive");
        files += 1;
    }

    if files == 0 {
        return Err(fail("directory contains no files".to_string()));
    }

    let archive = writer.finish().map_err(|e| fail(e.to_string()))?;
    Ok(archive.into_inner())
}

/// Base64 SHA-256 of the archive [`zip_directory`] builds, in the same
/// encoding Lambda reports as `CodeSha256`
pub fn code_sha256(dir: &Path) -> ProvisionResult<String> {
    let archive = zip_directory(dir)?;
    Ok(STANDARD.encode(Sha256::digest(&archive)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;
    use zip::ZipArchive;

    #[test]
    fn archives_nested_files_with_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(BOOTSTRAP), b"#!/bin/sh\n").unwrap();
        std::fs::create_dir(dir.path().join("assets")).unwrap();
        std::fs::write(dir.path().join("assets").join("message.txt"), b"hello").unwrap();

        let bytes = zip_directory(dir.path()).unwrap();
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();

        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["assets/message.txt", "bootstrap"]);

        let mut contents = String::new();
        archive
            .by_name("assets/message.txt")
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "hello");
        assert_eq!(archive.by_name(BOOTSTRAP).unwrap().unix_mode().map(|m| m & 0o777), Some(0o755));
    }

    #[test]
    fn same_tree_produces_same_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(BOOTSTRAP), b"binary").unwrap();
        assert_eq!(zip_directory(dir.path()).unwrap(), zip_directory(dir.path()).unwrap());
    }

    #[test]
    fn empty_or_missing_directories_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(zip_directory(dir.path()), Err(ProvisionError::Package { .. })));
        assert!(zip_directory(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn digest_follows_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let bootstrap = dir.path().join(BOOTSTRAP);
        std::fs::write(&bootstrap, b"v1").unwrap();
        let first = code_sha256(dir.path()).unwrap();
        assert_eq!(first, code_sha256(dir.path()).unwrap());

        std::fs::write(&bootstrap, b"v2 new code").unwrap();
        assert_ne!(first, code_sha256(dir.path()).unwrap());
    }
}
