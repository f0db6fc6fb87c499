use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use tempfile::NamedTempFile;

use crate::geolocate::LocationRecord;

/// Loads the saved location set. A missing file means this is the first run.
pub fn load(path: &Path) -> Result<Option<Vec<LocationRecord>>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read location cache {}", path.display()))?;
    let records: Vec<LocationRecord> = serde_json::from_str(&raw)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    Ok(Some(records))
}

/// Replaces the saved location set. The new contents are written to a sibling
/// temporary file and renamed over `path`, so a failed save leaves the
/// previous file untouched.
pub fn save(path: &Path, records: &[LocationRecord]) -> Result<()> {
    let data = encode(records)?;
    let parent = parent_dir(path);
    fs::create_dir_all(&parent)
        .with_context(|| format!("failed to create cache directory {}", parent.display()))?;

    let mut tmp = NamedTempFile::new_in(&parent)
        .with_context(|| format!("failed to create temporary file in {}", parent.display()))?;
    let tmp_path = tmp.path().to_path_buf();
    tmp.write_all(&data)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("failed to flush {}", tmp_path.display()))?;
    tmp.persist(path)
        .with_context(|| format!("failed to move new location cache into {}", path.display()))?;
    Ok(())
}

fn encode(records: &[LocationRecord]) -> Result<Vec<u8>> {
    if let Some(bad) = records
        .iter()
        .find(|record| !record.lat.is_finite() || !record.lng.is_finite())
    {
        bail!("refusing to save non-finite location for {}", bad.name);
    }
    let mut data = Vec::new();
    let mut serializer =
        serde_json::Serializer::with_formatter(&mut data, PrettyFormatter::with_indent(b"\t"));
    records
        .serialize(&mut serializer)
        .context("failed to serialize location cache")?;
    Ok(data)
}

fn parent_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

pub fn lock_path_for(cache_path: &Path) -> PathBuf {
    let mut name = cache_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "ips.json".into());
    name.push(".lock");
    cache_path.with_file_name(name)
}

/// Exclusive lock held for the duration of a run so two runs never interleave
/// their read and write of the same cache.
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    pub fn acquire(cache_path: &Path) -> Result<Self> {
        let path = lock_path_for(cache_path);
        let parent = parent_dir(&path);
        fs::create_dir_all(&parent)
            .with_context(|| format!("failed to create lock directory {}", parent.display()))?;
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;
        if file.try_lock_exclusive().is_err() {
            bail!(
                "another run holds {}; wait for it to finish and retry",
                path.display()
            );
        }
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_cache_loads_as_none() {
        let tmp = TempDir::new().expect("temp dir");
        assert!(load(&tmp.path().join("ips.json")).expect("load").is_none());
    }

    #[test]
    fn saved_cache_loads_back() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("ips.json");
        let records = vec![
            LocationRecord::new("alice", 12.0, 34.0),
            LocationRecord::new("bob", -10.5, 20.25),
        ];

        save(&path, &records).expect("save");
        assert_eq!(load(&path).expect("load"), Some(records));
    }

    #[test]
    fn cache_uses_tab_indented_capitalized_keys() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("ips.json");
        save(&path, &[LocationRecord::new("alice", 12.5, 34.0)]).expect("save");

        let raw = fs::read_to_string(&path).expect("read");
        assert!(raw.contains("\t{\n\t\t\"Name\": \"alice\""));
        assert!(raw.contains("\"Lat\": 12.5"));
        assert!(raw.contains("\"Lng\": 34.0"));
    }

    #[test]
    fn lowercase_keys_are_accepted() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("ips.json");
        fs::write(&path, r#"[{"name":"bob","lat":10,"lng":20}]"#).expect("write");

        assert_eq!(
            load(&path).expect("load"),
            Some(vec![LocationRecord::new("bob", 10.0, 20.0)])
        );
    }

    #[test]
    fn corrupt_cache_is_an_error() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("ips.json");
        fs::write(&path, "[{\"Name\":").expect("write");
        assert!(load(&path).is_err());
    }

    #[test]
    fn failed_save_keeps_previous_cache() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("ips.json");
        let previous = vec![LocationRecord::new("bob", 10.0, 20.0)];
        save(&path, &previous).expect("save");

        let non_finite = vec![LocationRecord::new("carol", f64::NAN, 1.0)];
        assert!(save(&path, &non_finite).is_err());

        assert_eq!(load(&path).expect("load"), Some(previous));
    }

    #[test]
    fn save_creates_missing_directories() {
        let tmp = TempDir::new().expect("temp dir");
        let path = tmp.path().join("nested/dir/ips.json");
        save(&path, &[]).expect("save");
        assert_eq!(load(&path).expect("load"), Some(Vec::new()));
    }

    #[test]
    fn second_lock_on_same_cache_is_refused() {
        let tmp = TempDir::new().expect("temp dir");
        let cache = tmp.path().join("ips.json");

        let first = RunLock::acquire(&cache).expect("first lock");
        assert_eq!(first.path(), tmp.path().join("ips.json.lock"));
        assert!(RunLock::acquire(&cache).is_err());

        drop(first);
        assert!(RunLock::acquire(&cache).is_ok());
    }
}
