use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone, Debug)]
pub struct FileEntry {
    pub name: String,
    pub stem: String,
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size: u64,
}

/// Files in `dir` with the given extension, sorted by name. A missing directory yields nothing.
pub fn list_files_with_extension(dir: impl AsRef<Path>, extension: &str) -> io::Result<Vec<FileEntry>> {
    let read_dir = match fs::read_dir(dir.as_ref()) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err),
    };

    let mut entries = Vec::new();
    for entry in read_dir.flatten() {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(extension) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(meta) if meta.is_file() => meta,
            _ => continue,
        };

        let (Some(name), Some(stem)) = (
            path.file_name().and_then(|s| s.to_str()).map(str::to_string),
            path.file_stem().and_then(|s| s.to_str()).map(str::to_string),
        ) else {
            continue;
        };

        entries.push(FileEntry {
            name,
            stem,
            modified: metadata.modified().unwrap_or(UNIX_EPOCH),
            size: metadata.len(),
            path,
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

pub fn list_json_files(dir: impl AsRef<Path>) -> io::Result<Vec<FileEntry>> {
    list_files_with_extension(dir, "json")
}

/// Sibling path used while a write to `path` is in flight.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `bytes` next to `path`, sync, then rename over it. Readers see the old
/// content or the new content, never a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = temp_path_for(path);
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();

    if result.is_err() && tmp.is_file() {
        let _ = fs::remove_file(&tmp);
    }
    result
}
