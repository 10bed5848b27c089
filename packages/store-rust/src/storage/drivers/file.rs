//! One-file-per-record [`StorageDriver`](crate::storage::StorageDriver).
//!
//! Each record lives at `<root>/<id>.<ext>`; ids containing `/` nest into
//! subdirectories. `begin()` scans the whole tree; enumeration order is file
//! modification time, ties broken by id. Writes are deferred to commit,
//! which runs in two phases: every new file body is written to a temp file
//! beside its target, then temp files are renamed into place and deletions
//! applied. A failure in the first phase leaves the tree untouched.
//!
//! Created directories copy the root's permissions. Deleting a record prunes
//! parent directories that became empty, stopping at the root.

use std::fs;
use std::io::Write as _;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use restkit_core::{Record, RecordSet, ResourceId, StoreError, StoreResult};
use walkdir::WalkDir;

use super::file_format::FileFormat;
use crate::config::FileConfig;
use crate::storage::buffered::{BufferedDriver, Change, Medium, WorkingSet};
use crate::storage::driver::DriverKind;

const TEMP_PREFIX: &str = ".rk-";

/// Durable side of the file driver.
#[derive(Debug, Clone)]
pub struct FileMedium {
    root: PathBuf,
    format: FileFormat,
}

/// A pending write produced from the working set.
enum FileOp {
    Write { path: PathBuf, body: Vec<u8> },
    Remove { path: PathBuf },
}

impl FileMedium {
    /// Binds to `root`, creating it when missing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidConfiguration`] if the root cannot be
    /// created, is not a directory, or is read-only.
    pub fn open(config: &FileConfig) -> StoreResult<Self> {
        let root = config.path.clone();
        fs::create_dir_all(&root).map_err(|e| {
            StoreError::InvalidConfiguration(format!("cannot create {}: {e}", root.display()))
        })?;
        let meta = fs::metadata(&root).map_err(|e| {
            StoreError::InvalidConfiguration(format!("cannot stat {}: {e}", root.display()))
        })?;
        if !meta.is_dir() {
            return Err(StoreError::InvalidConfiguration(format!(
                "{} is not a directory",
                root.display()
            )));
        }
        if meta.permissions().readonly() {
            return Err(StoreError::InvalidConfiguration(format!(
                "{} is not writable",
                root.display()
            )));
        }
        tracing::info!(root = %root.display(), format = ?config.format, "opened file store");
        Ok(Self {
            root,
            format: config.format,
        })
    }

    /// Store root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding `id`.
    #[must_use]
    pub fn path_for(&self, id: &ResourceId) -> PathBuf {
        let mut path = self.root.clone();
        let id = id.to_string();
        let mut segments = id.split('/').peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_some() {
                path.push(segment);
            } else {
                path.push(format!("{segment}.{}", self.format.extension()));
            }
        }
        path
    }

    /// Recovers the id from a record file path, or `None` for foreign files.
    fn id_for(&self, path: &Path) -> Option<ResourceId> {
        if path.extension()? != self.format.extension() {
            return None;
        }
        let name = path.file_name()?.to_str()?;
        if name.starts_with('.') {
            return None;
        }
        let relative = path.strip_prefix(&self.root).ok()?.with_extension("");
        let segments: Option<Vec<&str>> = relative
            .components()
            .map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();
        Some(ResourceId::parse(&segments?.join("/")))
    }

    fn scan(&self) -> StoreResult<RecordSet> {
        let mut found: Vec<(SystemTime, ResourceId, Record)> = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1) {
            let entry = entry.map_err(|e| {
                StoreError::medium(format!("scanning {}", self.root.display()), e)
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(id) = self.id_for(entry.path()) else {
                continue;
            };
            let path = entry.path();
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let body = fs::read(path)
                .map_err(|e| StoreError::medium(format!("reading {}", path.display()), e))?;
            let record = self.format.decode(body, &path.display().to_string())?;
            found.push((modified, id, record));
        }
        found.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        Ok(found.into_iter().map(|(_, id, record)| (id, record)).collect())
    }

    fn plan(&self, working: &WorkingSet) -> StoreResult<Vec<FileOp>> {
        working
            .changes()
            .iter()
            .map(|(id, change)| {
                let path = self.path_for(id);
                match change {
                    Change::Put => {
                        let record = working.records().get(id).ok_or_else(|| {
                            StoreError::not_found(id)
                        })?;
                        Ok(FileOp::Write {
                            path,
                            body: self.format.encode(record)?,
                        })
                    }
                    Change::Delete => Ok(FileOp::Remove { path }),
                }
            })
            .collect()
    }

    fn apply(&self, ops: Vec<FileOp>) -> StoreResult<()> {
        // Phase one: stage every body next to its target.
        let mut staged = Vec::new();
        let mut removals = Vec::new();
        for op in ops {
            match op {
                FileOp::Write { path, body } => {
                    let parent = path.parent().unwrap_or(&self.root).to_path_buf();
                    self.ensure_dir(&parent)?;
                    let mut temp = tempfile::Builder::new()
                        .prefix(TEMP_PREFIX)
                        .tempfile_in(&parent)
                        .map_err(|e| {
                            StoreError::medium(format!("staging in {}", parent.display()), e)
                        })?;
                    temp.write_all(&body)
                        .and_then(|()| temp.as_file().sync_all())
                        .map_err(|e| StoreError::medium(format!("staging {}", path.display()), e))?;
                    staged.push((temp, path));
                }
                FileOp::Remove { path } => removals.push(path),
            }
        }

        // Phase two: publish.
        for (temp, path) in staged {
            temp.persist(&path)
                .map_err(|e| StoreError::medium(format!("writing {}", path.display()), e.error))?;
        }
        for path in removals {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StoreError::medium(format!("removing {}", path.display()), e))
                }
            }
            self.prune_empty_parents(&path);
        }
        Ok(())
    }

    /// Creates `dir` and any missing ancestors below the root, copying the root's permissions.
    fn ensure_dir(&self, dir: &Path) -> StoreResult<()> {
        if dir.is_dir() {
            return Ok(());
        }
        let root_perms = fs::metadata(&self.root)
            .map_err(|e| StoreError::medium(format!("stat {}", self.root.display()), e))?
            .permissions();
        let relative = dir.strip_prefix(&self.root).map_err(|_| {
            StoreError::SchemaViolation(format!("{} escapes the store root", dir.display()))
        })?;
        let mut current = self.root.clone();
        for component in relative.components() {
            current.push(component);
            if current.is_dir() {
                continue;
            }
            fs::create_dir(&current)
                .map_err(|e| StoreError::medium(format!("creating {}", current.display()), e))?;
            fs::set_permissions(&current, root_perms.clone()).map_err(|e| {
                StoreError::medium(format!("setting permissions on {}", current.display()), e)
            })?;
        }
        Ok(())
    }

    /// Removes now-empty directories above `path`, stopping at the root.
    fn prune_empty_parents(&self, path: &Path) {
        let mut dir = path.parent();
        while let Some(current) = dir {
            if current == self.root || !current.starts_with(&self.root) {
                break;
            }
            let empty = fs::read_dir(current).is_ok_and(|mut entries| entries.next().is_none());
            if !empty {
                break;
            }
            if let Err(e) = fs::remove_dir(current) {
                tracing::warn!(dir = %current.display(), error = %e, "could not prune empty directory");
                break;
            }
            dir = current.parent();
        }
    }
}

#[async_trait]
impl Medium for FileMedium {
    fn kind(&self) -> DriverKind {
        DriverKind::File
    }

    async fn load(&self) -> StoreResult<RecordSet> {
        let medium = self.clone();
        tokio::task::spawn_blocking(move || medium.scan())
            .await
            .map_err(|e| StoreError::medium("file scan task failed", e))?
    }

    async fn persist(&self, working: &WorkingSet) -> StoreResult<()> {
        let ops = self.plan(working)?;
        let medium = self.clone();
        tokio::task::spawn_blocking(move || medium.apply(ops))
            .await
            .map_err(|e| StoreError::medium("file commit task failed", e))?
    }

    fn check_id(&self, id: &ResourceId) -> StoreResult<()> {
        let ResourceId::Str(text) = id else {
            return Ok(());
        };
        let valid = text.split('/').all(|segment| {
            !segment.is_empty()
                && segment != "."
                && segment != ".."
                && !segment.starts_with('.')
                && !segment.contains(['\\', '\0'])
        });
        if valid {
            Ok(())
        } else {
            Err(StoreError::SchemaViolation(format!(
                "id `{text}` cannot be mapped to a file path"
            )))
        }
    }

    fn reorders_on_commit(&self) -> bool {
        true
    }
}

/// File-backed store.
pub type FileDriver = BufferedDriver<FileMedium>;

impl FileDriver {
    /// Opens a file store.
    ///
    /// # Errors
    ///
    /// See [`FileMedium::open`].
    pub fn open(config: &FileConfig) -> StoreResult<Self> {
        Ok(BufferedDriver::new(FileMedium::open(config)?))
    }
}

#[cfg(test)]
mod tests {
    use restkit_core::{Page, Value};

    use super::*;
    use crate::storage::driver::StorageDriver;

    fn config(dir: &Path, format: FileFormat) -> FileConfig {
        FileConfig {
            path: dir.join("store"),
            format,
        }
    }

    fn dog(name: &str) -> Value {
        [("name", Value::from(name)), ("age", Value::Int(3))]
            .into_iter()
            .collect()
    }

    #[tokio::test]
    async fn records_land_in_one_file_each() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDriver::open(&config(dir.path(), FileFormat::Json)).unwrap();
        store.begin().await.unwrap();
        let id = store.create(dog("Rex"), None).await.unwrap();
        store.commit().await.unwrap();

        let path = dir.path().join("store").join("1.json");
        assert_eq!(store.medium().path_for(&id), path);
        let on_disk: Value = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(on_disk, dog("Rex"));
    }

    #[tokio::test]
    async fn round_trip_through_a_fresh_store_for_every_format() {
        for format in [FileFormat::Json, FileFormat::MsgPack, FileFormat::Toml] {
            let dir = tempfile::tempdir().unwrap();
            let writer = FileDriver::open(&config(dir.path(), format)).unwrap();
            let id = writer.create(dog("Rex"), None).await.unwrap();
            writer.commit().await.unwrap();

            let reader = FileDriver::open(&config(dir.path(), format)).unwrap();
            reader.begin().await.unwrap();
            assert_eq!(reader.read(&id).await.unwrap(), dog("Rex"), "{format:?}");
        }
    }

    #[tokio::test]
    async fn raw_records_round_trip_through_a_fresh_store() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), FileFormat::Raw);
        let writer = FileDriver::open(&cfg).unwrap();
        let text = writer.create(Value::from("woof"), None).await.unwrap();
        let blob = writer
            .create(Value::Bytes(vec![0xff, 0x00, 0xfe]), None)
            .await
            .unwrap();
        let number = writer.create(Value::Int(5), None).await.unwrap();
        writer.commit().await.unwrap();
        assert_eq!(fs::read(cfg.path.join(format!("{blob}.raw"))).unwrap(), [0xff, 0x00, 0xfe]);

        let reader = FileDriver::open(&cfg).unwrap();
        reader.begin().await.unwrap();
        assert_eq!(reader.read(&text).await.unwrap(), Value::from("woof"));
        assert_eq!(reader.read(&blob).await.unwrap(), Value::Bytes(vec![0xff, 0x00, 0xfe]));
        // Raw files carry no type information: scalars come back as text.
        assert_eq!(reader.read(&number).await.unwrap(), Value::from("5"));
    }

    #[tokio::test]
    async fn uncommitted_writes_are_invisible_to_new_stores() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), FileFormat::Json);
        let writer = FileDriver::open(&cfg).unwrap();
        writer.begin().await.unwrap();
        writer.create(dog("Rex"), None).await.unwrap();

        let reader = FileDriver::open(&cfg).unwrap();
        reader.begin().await.unwrap();
        assert_eq!(reader.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn nested_ids_create_and_prune_directories() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), FileFormat::Json);
        let store = FileDriver::open(&cfg).unwrap();
        let id = ResourceId::from("kennel/north/rex");
        store.create(dog("Rex"), Some(id.clone())).await.unwrap();
        store.commit().await.unwrap();

        let nested = cfg.path.join("kennel").join("north");
        assert!(nested.join("rex.json").is_file());

        store.delete(&id).await.unwrap();
        store.commit().await.unwrap();
        assert!(!cfg.path.join("kennel").exists());
        assert!(cfg.path.is_dir(), "store root must survive pruning");
    }

    #[tokio::test]
    async fn pruning_stops_at_non_empty_directories() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), FileFormat::Json);
        let store = FileDriver::open(&cfg).unwrap();
        store.create(dog("a"), Some(ResourceId::from("k/a"))).await.unwrap();
        store.create(dog("b"), Some(ResourceId::from("k/b"))).await.unwrap();
        store.commit().await.unwrap();

        store.delete(&ResourceId::from("k/a")).await.unwrap();
        store.commit().await.unwrap();
        assert!(cfg.path.join("k").join("b.json").is_file());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn created_directories_inherit_root_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), FileFormat::Json);
        let store = FileDriver::open(&cfg).unwrap();
        fs::set_permissions(&cfg.path, fs::Permissions::from_mode(0o750)).unwrap();

        store.create(dog("a"), Some(ResourceId::from("k/a"))).await.unwrap();
        store.commit().await.unwrap();
        let mode = fs::metadata(cfg.path.join("k")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o750);
    }

    #[tokio::test]
    async fn traversal_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileDriver::open(&config(dir.path(), FileFormat::Json)).unwrap();
        for bad in ["../escape", "a//b", ".hidden", "a/./b"] {
            let err = store
                .create(dog("x"), Some(ResourceId::Str(bad.to_string())))
                .await
                .unwrap_err();
            assert!(matches!(err, StoreError::SchemaViolation(_)), "{bad}");
        }
    }

    #[tokio::test]
    async fn enumeration_follows_modification_time() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), FileFormat::Json);
        let store = FileDriver::open(&cfg).unwrap();
        store.create(dog("old"), Some(ResourceId::from("b"))).await.unwrap();
        store.commit().await.unwrap();

        // Age the first file so the second is strictly newer.
        let old = fs::File::options()
            .write(true)
            .open(cfg.path.join("b.json"))
            .unwrap();
        old.set_modified(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(60))
            .unwrap();
        store.create(dog("new"), Some(ResourceId::from("a"))).await.unwrap();
        store.commit().await.unwrap();

        let fresh = FileDriver::open(&cfg).unwrap();
        let ids: Vec<ResourceId> = fresh.all(None).await.unwrap().into_keys().collect();
        assert_eq!(ids, vec![ResourceId::from("b"), ResourceId::from("a")]);
        let (first, _) = fresh.first().await.unwrap().unwrap();
        assert_eq!(first, ResourceId::from("b"));
        let paged = fresh.all(Some(Page::new(1, 2))).await.unwrap();
        assert_eq!(paged.keys().next(), Some(&ResourceId::from("a")));
    }

    #[tokio::test]
    async fn committed_updates_reorder_the_writing_store() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), FileFormat::Json);
        let store = FileDriver::open(&cfg).unwrap();
        store.create(dog("a"), Some(ResourceId::from("a"))).await.unwrap();
        store.create(dog("b"), Some(ResourceId::from("b"))).await.unwrap();
        store.commit().await.unwrap();
        for (name, secs) in [("a", 60), ("b", 120)] {
            fs::File::options()
                .write(true)
                .open(cfg.path.join(format!("{name}.json")))
                .unwrap()
                .set_modified(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(secs))
                .unwrap();
        }

        store.update(dog("a2"), &ResourceId::from("a")).await.unwrap();
        store.commit().await.unwrap();

        let fresh = FileDriver::open(&cfg).unwrap();
        let fresh_ids: Vec<ResourceId> = fresh.all(None).await.unwrap().into_keys().collect();
        let same_ids: Vec<ResourceId> = store.all(None).await.unwrap().into_keys().collect();
        assert_eq!(fresh_ids, vec![ResourceId::from("b"), ResourceId::from("a")]);
        assert_eq!(same_ids, fresh_ids);
        assert_eq!(store.last().await.unwrap().unwrap().0, ResourceId::from("a"));
    }

    #[tokio::test]
    async fn numbering_resumes_from_files_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), FileFormat::MsgPack);
        let first = FileDriver::open(&cfg).unwrap();
        first.create(dog("a"), None).await.unwrap();
        first.create(dog("b"), None).await.unwrap();
        first.commit().await.unwrap();

        let second = FileDriver::open(&cfg).unwrap();
        assert_eq!(second.create(dog("c"), None).await.unwrap(), ResourceId::Int(3));
    }

    #[tokio::test]
    async fn foreign_and_temp_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), FileFormat::Json);
        let store = FileDriver::open(&cfg).unwrap();
        fs::write(cfg.path.join("notes.txt"), "hello").unwrap();
        fs::write(cfg.path.join(".rk-abc.json"), "{").unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_staging_leaves_tree_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path(), FileFormat::Toml);
        let store = FileDriver::open(&cfg).unwrap();
        store.create(dog("ok"), Some(ResourceId::from("ok"))).await.unwrap();
        // A scalar cannot be expressed as TOML, so planning fails before any write.
        store.create(Value::from("scalar"), Some(ResourceId::from("bad"))).await.unwrap();
        let err = store.commit().await.unwrap_err();
        assert!(matches!(err, StoreError::SchemaViolation(_)));
        assert!(!cfg.path.join("ok.toml").exists());

        store.rollback().await.unwrap();
        assert_eq!(store.count().await.unwrap(), 0);
    }

    #[test]
    fn root_that_is_a_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("occupied");
        fs::write(&file, "x").unwrap();
        let err = FileDriver::open(&FileConfig {
            path: file,
            format: FileFormat::Json,
        })
        .err()
        .unwrap();
        assert!(matches!(err, StoreError::InvalidConfiguration(_)));
    }
}
