// Durable JSON files for the supervisor's data directory.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

#[cfg(target_family = "unix")]
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};

/// Outcome of reading a durable JSON file.
#[derive(Debug)]
pub enum Loaded<T> {
    Missing,
    Parsed(T),
    /// File exists but could not be decoded; carries the parse error text.
    Corrupt(String),
}

/// Read and decode `path`; a missing file is not an error.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> io::Result<Loaded<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Loaded::Missing),
        Err(err) => return Err(err),
    };
    match serde_json::from_reader(io::BufReader::new(file)) {
        Ok(value) => Ok(Loaded::Parsed(value)),
        Err(err) => Ok(Loaded::Corrupt(err.to_string())),
    }
}

/// Create a directory tree for durable state (0700 on Unix).
#[cfg(target_family = "unix")]
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    std::fs::DirBuilder::new()
        .mode(0o700)
        .recursive(true)
        .create(dir)
}

#[cfg(not(target_family = "unix"))]
pub fn ensure_dir(dir: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dir)
}

/// Write `value` to `path` with durability guarantees
/// - parent dir created with 0700
/// - sibling `.lock` file held with flock
/// - temp file written with 0600 and fsynced
/// - atomic rename over the target
/// - parent dir fsynced
#[cfg(target_family = "unix")]
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    use fs2::FileExt;

    let dir = parent_dir(path)?;
    ensure_dir(dir)?;

    let lock = File::create(sidecar(path, "lock"))?;
    lock.lock_exclusive()?;

    let temp_path = sidecar(path, "tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(&temp_path)?;

    serde_json::to_writer_pretty(&mut file, value).map_err(|e| {
        io::Error::other(format!("Failed to serialize {}: {}", path.display(), e))
    })?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&temp_path, path)?;

    let dir_handle = File::open(dir)?;
    dir_handle.sync_all()?;

    drop(lock);
    Ok(())
}

/// Windows variant: no mode bits, no flock, no directory fsync.
#[cfg(not(target_family = "unix"))]
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> io::Result<()> {
    let dir = parent_dir(path)?;
    ensure_dir(dir)?;

    let temp_path = sidecar(path, "tmp");
    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)?;

    serde_json::to_writer_pretty(&mut file, value).map_err(|e| {
        io::Error::other(format!("Failed to serialize {}: {}", path.display(), e))
    })?;
    file.sync_all()?;
    drop(file);

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

fn parent_dir(path: &Path) -> io::Result<&Path> {
    path.parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no parent directory", path.display()),
            )
        })
}

fn sidecar(path: &Path, suffix: &str) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    name.into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let mut value = BTreeMap::new();
        value.insert("a".to_string(), 1u32);

        write_json_atomic(&path, &value).unwrap();
        assert!(!dir.path().join("nested/state.json.tmp").exists());

        match read_json::<BTreeMap<String, u32>>(&path).unwrap() {
            Loaded::Parsed(back) => assert_eq!(back, value),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn missing_and_corrupt_are_distinguished() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        assert!(matches!(
            read_json::<BTreeMap<String, u32>>(&path).unwrap(),
            Loaded::Missing
        ));

        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(
            read_json::<BTreeMap<String, u32>>(&path).unwrap(),
            Loaded::Corrupt(_)
        ));
    }

    #[cfg(target_family = "unix")]
    #[test]
    fn written_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret.json");
        write_json_atomic(&path, &vec!["token"]).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
