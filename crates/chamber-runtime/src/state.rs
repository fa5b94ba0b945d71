//! Persistent container records.
//!
//! Each running container has up to three files in the records directory,
//! keyed by its sanitized name:
//!
//! - `<key>.pid`: global PID of the guest init, as text
//! - `<key>.json`: the [`ContainerRecord`] metadata sidecar
//! - `<key>.config.json`: the [`ContainerConfig`] it was started with
//!
//! Writes go to a temporary file first and are renamed into place, so a
//! reader never sees a half-written record. Concurrent writers for the same
//! name are last-writer-wins.

use std::path::{Path, PathBuf};

use chamber_common::config::ContainerConfig;
use chamber_common::error::{ChamberError, Result};
use chamber_common::types::{ContainerName, ContainerState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Persistent record of a running container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Container name.
    pub name: ContainerName,
    /// Global PID of the guest init.
    pub pid: i32,
    /// Host path used as the container root.
    pub rootfs: PathBuf,
    /// Loop mount point when the rootfs is a block image.
    pub mount_path: Option<PathBuf>,
    /// Whether hardware passthrough was enabled.
    pub hw_access: bool,
    /// PID of the background terminal holder, if any.
    pub holder_pid: Option<i32>,
    /// When the guest init was discovered.
    pub started_at: DateTime<Utc>,
    /// Lifecycle state; records written before a stop began are running.
    #[serde(default = "running")]
    pub state: ContainerState,
}

const fn running() -> ContainerState {
    ContainerState::Running
}

/// File-backed store of [`ContainerRecord`]s.
#[derive(Debug, Clone)]
pub struct RecordStore {
    dir: PathBuf,
}

impl RecordStore {
    /// Opens (and creates if needed) a store rooted at `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|e| ChamberError::io(&dir, e))?;
        Ok(Self { dir })
    }

    /// Directory holding the records.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn pid_path(&self, name: &ContainerName) -> PathBuf {
        self.dir.join(format!("{}.pid", name.sanitized()))
    }

    fn meta_path(&self, name: &ContainerName) -> PathBuf {
        self.dir.join(format!("{}.json", name.sanitized()))
    }

    fn config_path(&self, name: &ContainerName) -> PathBuf {
        self.dir.join(format!("{}.config.json", name.sanitized()))
    }

    /// Persists a record, replacing any previous one for the same name.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, record: &ContainerRecord) -> Result<()> {
        let json = serde_json::to_vec_pretty(record)?;
        write_atomic(&self.meta_path(&record.name), &json)?;
        write_atomic(&self.pid_path(&record.name), format!("{}\n", record.pid).as_bytes())?;
        tracing::debug!(name = %record.name, pid = record.pid, "record saved");
        Ok(())
    }

    /// Loads the record for `name`.
    ///
    /// The `.pid` file is authoritative for the PID. Returns `None` when no
    /// PID file exists.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be read or parsed.
    pub fn load(&self, name: &ContainerName) -> Result<Option<ContainerRecord>> {
        let pid_path = self.pid_path(name);
        let raw_pid = match std::fs::read_to_string(&pid_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ChamberError::io(pid_path, e)),
        };
        let pid: i32 = raw_pid.trim().parse().map_err(|_| ChamberError::Config {
            message: format!("corrupt pid file {}: {raw_pid:?}", pid_path.display()),
        })?;

        let meta_path = self.meta_path(name);
        let text = std::fs::read_to_string(&meta_path).map_err(|e| ChamberError::io(&meta_path, e))?;
        let mut record: ContainerRecord = serde_json::from_str(&text)?;
        record.pid = pid;
        Ok(Some(record))
    }

    /// Deletes every file belonging to `name`. Missing files are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be removed.
    pub fn remove(&self, name: &ContainerName) -> Result<()> {
        for path in [self.pid_path(name), self.meta_path(name), self.config_path(name)] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ChamberError::io(path, e)),
            }
        }
        tracing::debug!(%name, "record removed");
        Ok(())
    }

    /// Loads every record in the store. Unreadable entries are skipped with
    /// a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be listed.
    pub fn list(&self) -> Result<Vec<ContainerRecord>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| ChamberError::io(&self.dir, e))?;
        let mut records = Vec::new();
        for entry in entries.filter_map(std::result::Result::ok) {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            if !file_name.ends_with(".json") || file_name.ends_with(".config.json") {
                continue;
            }
            let parsed = std::fs::read_to_string(entry.path())
                .map_err(|e| ChamberError::io(entry.path(), e))
                .and_then(|text| Ok(serde_json::from_str::<ContainerRecord>(&text)?))
                .and_then(|record| self.load(&record.name));
            match parsed {
                Ok(Some(record)) => records.push(record),
                Ok(None) => tracing::warn!(file = file_name, "record without pid file, skipping"),
                Err(e) => tracing::warn!(file = file_name, error = %e, "unreadable record, skipping"),
            }
        }
        records.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
        Ok(records)
    }

    /// Persists the configuration a container was started with.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save_config(&self, config: &ContainerConfig) -> Result<()> {
        let json = serde_json::to_vec_pretty(config)?;
        write_atomic(&self.config_path(&config.name), &json)
    }

    /// Loads the persisted configuration for `name`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_config(&self, name: &ContainerName) -> Result<Option<ContainerConfig>> {
        let path = self.config_path(name);
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ChamberError::io(path, e)),
        }
    }
}

/// Writes `bytes` to a sibling temporary file and renames it over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).map_err(|e| ChamberError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| ChamberError::io(path, e))
}

#[cfg(test)]
mod tests {
    use chamber_common::config::RootfsSource;

    use super::*;

    fn record(name: &str, pid: i32) -> ContainerRecord {
        ContainerRecord {
            name: ContainerName::new(name).unwrap(),
            pid,
            rootfs: PathBuf::from("/srv/debian"),
            mount_path: None,
            hw_access: false,
            holder_pid: Some(pid + 1),
            started_at: Utc::now(),
            state: ContainerState::Running,
        }
    }

    #[test]
    fn missing_record_loads_as_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open(dir.path()).expect("open");
        let name = ContainerName::new("ghost").unwrap();
        assert!(store.load(&name).expect("load").is_none());
    }

    #[test]
    fn save_writes_pid_file_and_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open(dir.path()).expect("open");
        let rec = record("debian", 4242);
        store.save(&rec).expect("save");

        let pid_text = std::fs::read_to_string(dir.path().join("debian.pid")).expect("pid file");
        assert_eq!(pid_text.trim(), "4242");
        assert!(dir.path().join("debian.json").exists());
        assert!(!dir.path().join("debian.json.tmp").exists());
        assert_eq!(store.load(&rec.name).expect("load"), Some(rec));
    }

    #[test]
    fn pid_file_wins_over_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open(dir.path()).expect("open");
        let rec = record("alpine", 100);
        store.save(&rec).expect("save");
        std::fs::write(dir.path().join("alpine.pid"), "200\n").expect("overwrite");
        assert_eq!(store.load(&rec.name).expect("load").expect("some").pid, 200);
    }

    #[test]
    fn names_are_sanitized_on_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open(dir.path()).expect("open");
        let rec = record("my box", 7);
        store.save(&rec).expect("save");
        assert!(dir.path().join("my_box.pid").exists());
        let listed = store.list().expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name.as_str(), "my box");
    }

    #[test]
    fn remove_deletes_everything_and_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rootfs = tempfile::tempdir().expect("rootfs");
        let store = RecordStore::open(dir.path()).expect("open");
        let rec = record("arch", 9);
        store.save(&rec).expect("save");
        let config = ContainerConfig::builder("arch", RootfsSource::Directory(rootfs.path().to_path_buf()))
            .build()
            .expect("config");
        store.save_config(&config).expect("save config");

        store.remove(&rec.name).expect("remove");
        store.remove(&rec.name).expect("remove again");
        assert!(store.load(&rec.name).expect("load").is_none());
        assert!(store.load_config(&rec.name).expect("load config").is_none());
        assert_eq!(std::fs::read_dir(dir.path()).expect("read_dir").count(), 0);
    }

    #[test]
    fn sidecars_without_state_load_as_running() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open(dir.path()).expect("open");
        let mut rec = record("old", 55);
        rec.state = ContainerState::Stopping;
        store.save(&rec).expect("save");
        let sidecar = dir.path().join("old.json");
        let mut json: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&sidecar).expect("read")).expect("json");
        let _ = json.as_object_mut().expect("object").remove("state");
        std::fs::write(&sidecar, json.to_string()).expect("write");
        assert_eq!(store.load(&rec.name).expect("load").expect("some").state, ContainerState::Running);
    }

    #[test]
    fn list_skips_corrupt_entries() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = RecordStore::open(dir.path()).expect("open");
        store.save(&record("good", 10)).expect("save");
        std::fs::write(dir.path().join("bad.json"), "{not json").expect("write");
        let listed = store.list().expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name.as_str(), "good");
    }

    #[test]
    fn config_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let rootfs = tempfile::tempdir().expect("rootfs");
        let store = RecordStore::open(dir.path()).expect("open");
        let config = ContainerConfig::builder("deb", RootfsSource::Directory(rootfs.path().to_path_buf()))
            .tty_count(3)
            .build()
            .expect("config");
        store.save_config(&config).expect("save");
        let loaded = store.load_config(&config.name).expect("load").expect("present");
        assert_eq!(loaded.tty_count, 3);
        assert_eq!(loaded.hostname, "deb");
    }
}
