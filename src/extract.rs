//! Archive unpacking for downloaded monthly payloads.
//!
//! A payload is a ZIP archive holding one trip table (sometimes alongside
//! macOS resource-fork folders). Only the first `.csv` entry is extracted.

use std::fs::File;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Folder macOS adds to archives it creates; never holds trip data.
const RESOURCE_FORK_DIR: &str = "__MACOSX";

/// Extract the first tabular entry of `archive` under `dir`.
///
/// Returns `Ok(None)` when the archive holds no `.csv` entry. Non-archive or
/// corrupt payloads are reported as [`Error::TransientIo`].
pub fn extract_first_table(archive: &Path, dir: &Path) -> Result<Option<PathBuf>> {
    let file = File::open(archive)
        .map_err(|e| Error::TransientIo(format!("cannot open {}: {}", archive.display(), e)))?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| {
        Error::TransientIo(format!("{} is not a readable archive: {}", archive.display(), e))
    })?;

    for index in 0..zip.len() {
        let mut entry = zip
            .by_index(index)
            .map_err(|e| Error::TransientIo(format!("corrupt archive entry {}: {}", index, e)))?;
        if entry.is_dir() || !is_table_entry(entry.name()) {
            continue;
        }

        let relative = entry.enclosed_name().ok_or_else(|| {
            Error::TransientIo(format!("unsafe path in archive: {}", entry.name()))
        })?;
        let destination = dir.join(relative);
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::TransientIo(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let mut out = File::create(&destination).map_err(|e| {
            Error::TransientIo(format!("cannot create {}: {}", destination.display(), e))
        })?;
        let bytes = std::io::copy(&mut entry, &mut out).map_err(|e| {
            Error::TransientIo(format!("extracting {} failed: {}", entry.name(), e))
        })?;

        tracing::debug!(
            archive = %archive.display(),
            entry = %destination.display(),
            bytes,
            "table extracted"
        );
        return Ok(Some(destination));
    }

    Ok(None)
}

fn is_table_entry(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".csv")
        && !name.split('/').any(|part| part == RESOURCE_FORK_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, body) in entries {
            zip.start_file(*name, SimpleFileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn skips_resource_fork_entries() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("202301-trips.zip");
        write_zip(
            &archive,
            &[
                ("__MACOSX/._202301-trips.csv", "junk"),
                ("readme.txt", "hello"),
                ("202301-trips.csv", "ride_id\nA\n"),
                ("second.csv", "ignored"),
            ],
        );

        let out = tmp.path().join("out");
        let table = extract_first_table(&archive, &out).unwrap().unwrap();
        assert_eq!(table, out.join("202301-trips.csv"));
        assert_eq!(std::fs::read_to_string(&table).unwrap(), "ride_id\nA\n");
        assert!(!out.join("second.csv").exists());
    }

    #[test]
    fn nested_entries_create_parent_folders() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("trips.zip");
        write_zip(&archive, &[("2023/01/trips.CSV", "x\n")]);

        let table = extract_first_table(&archive, tmp.path()).unwrap().unwrap();
        assert_eq!(table, tmp.path().join("2023/01/trips.CSV"));
        assert!(table.exists());
    }

    #[test]
    fn archive_without_table_yields_none() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("empty.zip");
        write_zip(&archive, &[("notes.txt", "nothing here")]);
        assert!(extract_first_table(&archive, tmp.path()).unwrap().is_none());
    }

    #[test]
    fn non_archive_payload_is_transient() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("error.zip");
        std::fs::write(&archive, "<Error><Code>NoSuchKey</Code></Error>").unwrap();
        let err = extract_first_table(&archive, tmp.path()).unwrap_err();
        assert!(matches!(err, Error::TransientIo(_)));
    }
}
