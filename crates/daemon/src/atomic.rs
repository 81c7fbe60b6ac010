//! Crash-consistent file writes.
//!
//! Content is written to a sibling temporary file, flushed, and then renamed
//! over the destination. A reader therefore sees either the previous complete
//! file or the new complete file, never a partial one.

use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Suffix carried by every in-progress temporary file.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Generates the temporary path used while writing `target`.
///
/// The temp file lives in the same directory (so the rename stays on one
/// filesystem) and is hidden with a leading `.` and a `.tmp` extension, which
/// keeps it out of `*.json` listings.
///
/// # Example
///
/// ```
/// use std::path::Path;
/// use reelq::atomic::temp_path_for;
///
/// let tmp = temp_path_for(Path::new("/data/b1/tasks/t1.json"));
/// assert!(tmp.to_string_lossy().starts_with("/data/b1/tasks/.t1.json."));
/// assert!(tmp.to_string_lossy().ends_with(".tmp"));
/// ```
pub fn temp_path_for(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_name = format!(".{}.{}{}", name, Uuid::new_v4().simple(), TEMP_SUFFIX);
    match target.parent() {
        Some(parent) => parent.join(tmp_name),
        None => PathBuf::from(tmp_name),
    }
}

/// Returns true if `path` names an in-progress temporary file.
pub fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.starts_with('.') && n.ends_with(TEMP_SUFFIX))
        .unwrap_or(false)
}

/// Atomically replaces `path` with `contents`.
///
/// Creates the parent directory if needed. On failure the temporary file is
/// removed and the previously committed file (if any) is left untouched.
pub fn atomic_write(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = temp_path_for(path);
    let result = write_and_sync(&tmp, contents).and_then(|()| fs::rename(&tmp, path));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Serializes `value` as pretty JSON and writes it with [`atomic_write`].
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let json = serde_json::to_vec_pretty(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    atomic_write(path, &json)
}

fn write_and_sync(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
