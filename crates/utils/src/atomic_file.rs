//! Atomic file operations to prevent torn index records

use cachestorage_core::{Error, Result};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

/// Write data to a file atomically by writing to a temporary file and renaming
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| Error::invalid_argument("atomic write", "path has no parent directory"))?;

    fs::create_dir_all(parent).map_err(|e| Error::io(parent, "create parent directory", e))?;

    // Same directory as the target so the rename never crosses filesystems
    let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));

    let result = (|| -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&temp_path)
            .map_err(|e| Error::io(&temp_path, "create temporary file", e))?;

        file.write_all(content)
            .map_err(|e| Error::io(&temp_path, "write to temporary file", e))?;

        file.sync_all()
            .map_err(|e| Error::io(&temp_path, "sync temporary file", e))?;

        Ok(())
    })();

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
        return result;
    }

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::io(path, "atomic rename", e)
    })?;

    Ok(())
}
