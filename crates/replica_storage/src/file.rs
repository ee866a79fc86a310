//! File-based storage engine with one directory per database.
//!
//! Layout under the storage root:
//!
//! ```text
//! <root>/
//! ├─ LOCK                    # Advisory lock for single-process access
//! ├─ <db>/
//! │  └─ <db>.0               # CBOR image of the database
//! └─ backup_<db>_<secs>/     # Originals kept by repair_database
//! ```
//!
//! Writes go to memory first and reach disk on [`StorageEngine::flush`],
//! which rewrites every dirty database with write-then-rename.

use crate::data::DatabaseData;
use crate::engine::{validate_database_name, DatabaseImage, StorageEngine};
use crate::error::{StorageError, StorageResult};
use crate::memory::apply_to;
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use replica_protocol::{from_cbor, to_cbor, Document, DocumentId, OperationEntry};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const LOCK_FILE: &str = "LOCK";
const DATA_SUFFIX: &str = ".0";
const TEMP_SUFFIX: &str = ".tmp";
const BACKUP_PREFIX: &str = "backup_";

/// Outcome of [`FileStorage::repair_database`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepairReport {
    /// Repaired database.
    pub database: String,
    /// Documents in the rewritten image.
    pub documents: u64,
    /// On-disk bytes before the repair.
    pub size_before: u64,
    /// On-disk bytes after the repair.
    pub size_after: u64,
    /// Directory holding the original files, if they were kept.
    pub backup: Option<PathBuf>,
}

/// A persistent storage engine keeping one directory per database.
///
/// # Thread Safety
///
/// The engine holds an exclusive lock on the root directory. Only one
/// `FileStorage` may be open per root at a time, across processes.
#[derive(Debug)]
pub struct FileStorage {
    root: PathBuf,
    _lock_file: File,
    databases: RwLock<BTreeMap<String, DatabaseData>>,
    dirty: Mutex<BTreeSet<String>>,
}

impl FileStorage {
    /// Opens or creates a storage root and loads every database in it.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process holds the lock (`Locked`)
    /// - A database image cannot be decoded (`Corrupted`)
    /// - I/O errors occur
    pub fn open(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(root.display().to_string()));
        }

        let mut databases = BTreeMap::new();
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with(BACKUP_PREFIX) || validate_database_name(&name).is_err() {
                continue;
            }
            let path = data_path(&root, &name);
            if !path.exists() {
                continue;
            }
            let bytes = fs::read(&path)?;
            let data: DatabaseData = from_cbor(&bytes).map_err(|e| {
                StorageError::Corrupted(format!("{}: {e}", path.display()))
            })?;
            databases.insert(name, data);
        }

        tracing::debug!(root = %root.display(), databases = databases.len(), "opened file storage");

        Ok(Self {
            root,
            _lock_file: lock_file,
            databases: RwLock::new(databases),
            dirty: Mutex::new(BTreeSet::new()),
        })
    }

    /// Returns the storage root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the directory of a database.
    #[must_use]
    pub fn database_dir(&self, database: &str) -> PathBuf {
        self.root.join(database)
    }

    /// Rewrites a database image from its in-memory contents.
    ///
    /// With `backup_original`, the current directory is first copied to
    /// `backup_<db>_<unix-secs>/` under the root.
    ///
    /// # Errors
    ///
    /// Returns `UnknownDatabase` if the database does not exist.
    pub fn repair_database(
        &self,
        database: &str,
        backup_original: bool,
    ) -> StorageResult<RepairReport> {
        let data = self
            .databases
            .read()
            .get(database)
            .cloned()
            .ok_or_else(|| StorageError::UnknownDatabase(database.to_string()))?;

        let dir = self.database_dir(database);
        let size_before = dir_size(&dir)?;

        let backup = if backup_original && dir.exists() {
            let target = self.backup_dir(database);
            copy_dir(&dir, &target)?;
            Some(target)
        } else {
            None
        };

        self.write_image(database, &data)?;
        self.dirty.lock().remove(database);
        let size_after = dir_size(&dir)?;

        tracing::info!(
            database,
            size_before,
            size_after,
            backup = ?backup,
            "repaired database"
        );

        Ok(RepairReport {
            database: database.to_string(),
            documents: data.document_count(),
            size_before,
            size_after,
            backup,
        })
    }

    fn backup_dir(&self, database: &str) -> PathBuf {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let base = format!("{BACKUP_PREFIX}{database}_{secs}");
        let mut candidate = self.root.join(&base);
        let mut n = 1;
        while candidate.exists() {
            candidate = self.root.join(format!("{base}_{n}"));
            n += 1;
        }
        candidate
    }

    fn write_image(&self, database: &str, data: &DatabaseData) -> StorageResult<()> {
        let dir = self.database_dir(database);
        fs::create_dir_all(&dir)?;

        let final_path = data_path(&self.root, database);
        let temp_path = dir.join(format!("{database}{DATA_SUFFIX}{TEMP_SUFFIX}"));

        let bytes = to_cbor(data)?;
        let mut file = File::create(&temp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &final_path)?;
        Ok(())
    }

    fn remove_dir(&self, database: &str) -> StorageResult<()> {
        let dir = self.database_dir(database);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        Ok(())
    }
}

fn data_path(root: &Path, database: &str) -> PathBuf {
    root.join(database).join(format!("{database}{DATA_SUFFIX}"))
}

fn dir_size(dir: &Path) -> StorageResult<u64> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut total = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

fn copy_dir(from: &Path, to: &Path) -> StorageResult<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

impl StorageEngine for FileStorage {
    fn apply(&self, entry: &OperationEntry) -> StorageResult<()> {
        validate_database_name(&entry.database)?;
        let mut databases = self.databases.write();
        apply_to(&mut databases, entry);
        self.dirty.lock().insert(entry.database.clone());
        Ok(())
    }

    fn insert_many(
        &self,
        database: &str,
        collection: &str,
        documents: Vec<Document>,
    ) -> StorageResult<()> {
        validate_database_name(database)?;
        let mut databases = self.databases.write();
        let coll = databases
            .entry(database.to_string())
            .or_default()
            .collection_mut(collection);
        for doc in documents {
            coll.upsert(doc);
        }
        self.dirty.lock().insert(database.to_string());
        Ok(())
    }

    fn drop_database(&self, database: &str) -> StorageResult<()> {
        let mut databases = self.databases.write();
        databases.remove(database);
        self.dirty.lock().remove(database);
        self.remove_dir(database)
    }

    fn snapshot(&self, database: &str) -> StorageResult<DatabaseImage> {
        let data = self.databases.read().get(database).cloned().unwrap_or_default();
        Ok(DatabaseImage {
            database: database.to_string(),
            data,
        })
    }

    fn database_names(&self) -> StorageResult<Vec<String>> {
        Ok(self.databases.read().keys().cloned().collect())
    }

    fn count(&self, database: &str, collection: &str) -> StorageResult<u64> {
        Ok(self
            .databases
            .read()
            .get(database)
            .and_then(|db| db.collection(collection))
            .map(|c| c.len() as u64)
            .unwrap_or(0))
    }

    fn get(
        &self,
        database: &str,
        collection: &str,
        id: &DocumentId,
    ) -> StorageResult<Option<Document>> {
        Ok(self
            .databases
            .read()
            .get(database)
            .and_then(|db| db.collection(collection))
            .and_then(|c| c.get(id).cloned()))
    }

    fn find_eq(
        &self,
        database: &str,
        collection: &str,
        field: &str,
        value: &Value,
    ) -> StorageResult<Vec<Document>> {
        Ok(self
            .databases
            .read()
            .get(database)
            .and_then(|db| db.collection(collection))
            .map(|c| c.find_eq(field, value))
            .unwrap_or_default())
    }

    /// On-disk bytes of the database directory. Databases with unflushed
    /// writes report their in-memory encoded size instead.
    fn database_size(&self, database: &str) -> StorageResult<u64> {
        if self.dirty.lock().contains(database) {
            return Ok(self
                .databases
                .read()
                .get(database)
                .map(|db| db.approximate_size())
                .unwrap_or(0));
        }
        dir_size(&self.database_dir(database))
    }

    fn flush(&self) -> StorageResult<()> {
        let pending: Vec<(String, Option<DatabaseData>)> = {
            let databases = self.databases.read();
            let mut dirty = self.dirty.lock();
            let names = std::mem::take(&mut *dirty);
            names
                .into_iter()
                .map(|name| {
                    let data = databases.get(&name).cloned();
                    (name, data)
                })
                .collect()
        };

        for (name, data) in pending {
            let result = match &data {
                Some(data) => self.write_image(&name, data),
                // Dropped through a replicated DropDatabase
                None => self.remove_dir(&name),
            };
            if let Err(e) = result {
                self.dirty.lock().insert(name);
                return Err(e);
            }
        }
        Ok(())
    }
}

impl Drop for FileStorage {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::warn!(root = %self.root.display(), error = %e, "flush on close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_protocol::{NewOperation, OpPayload, OpTime};
    use tempfile::tempdir;

    fn insert(db: &str, id: &str, t: u32) -> OperationEntry {
        NewOperation::insert(db, "a", Document::with_id(id).set("i", t)).at(OpTime::new(t, 1))
    }

    #[test]
    fn reopen_restores_databases() {
        let dir = tempdir().unwrap();
        {
            let storage = FileStorage::open(dir.path()).unwrap();
            storage.apply(&insert("one", "1", 1)).unwrap();
            storage.apply(&insert("two", "1", 2)).unwrap();
            storage.flush().unwrap();
        }

        let storage = FileStorage::open(dir.path()).unwrap();
        assert_eq!(storage.database_names().unwrap(), vec!["one", "two"]);
        assert_eq!(storage.count("one", "a").unwrap(), 1);
        assert!(dir.path().join("one").join("one.0").exists());
    }

    #[test]
    fn second_open_is_locked() {
        let dir = tempdir().unwrap();
        let _first = FileStorage::open(dir.path()).unwrap();
        let second = FileStorage::open(dir.path());
        assert!(matches!(second, Err(StorageError::Locked(_))));
    }

    #[test]
    fn drop_database_removes_directory() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        storage.apply(&insert("db", "1", 1)).unwrap();
        storage.flush().unwrap();
        assert!(dir.path().join("db").is_dir());

        storage.drop_database("db").unwrap();
        assert!(!dir.path().join("db").exists());
        assert!(storage.database_names().unwrap().is_empty());
    }

    #[test]
    fn replicated_drop_removes_directory_on_flush() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        storage.apply(&insert("db", "1", 1)).unwrap();
        storage.flush().unwrap();

        storage
            .apply(&NewOperation::new("db", OpPayload::DropDatabase).at(OpTime::new(2, 1)))
            .unwrap();
        storage.flush().unwrap();
        assert!(!dir.path().join("db").exists());
    }

    #[test]
    fn repair_keeps_backup() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        storage.apply(&insert("db", "1", 1)).unwrap();
        storage.flush().unwrap();

        let report = storage.repair_database("db", true).unwrap();
        assert_eq!(report.documents, 1);
        let backup = report.backup.unwrap();
        assert!(backup
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("backup_db_"));
        assert!(backup.join("db.0").exists());

        // Backups are not loaded as databases
        drop(storage);
        let storage = FileStorage::open(dir.path()).unwrap();
        assert_eq!(storage.database_names().unwrap(), vec!["db"]);
    }

    #[test]
    fn repair_unknown_database() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        assert!(matches!(
            storage.repair_database("nope", false),
            Err(StorageError::UnknownDatabase(_))
        ));
    }

    #[test]
    fn total_size_counts_files() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        storage.apply(&insert("a", "1", 1)).unwrap();
        storage.apply(&insert("b", "1", 1)).unwrap();
        storage.flush().unwrap();

        let a = fs::metadata(dir.path().join("a").join("a.0")).unwrap().len();
        let b = fs::metadata(dir.path().join("b").join("b.0")).unwrap().len();
        assert_eq!(storage.total_size().unwrap(), a + b);
    }

    #[test]
    fn corrupted_image_is_reported() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("bad")).unwrap();
        fs::write(dir.path().join("bad").join("bad.0"), b"\xff\x00garbage").unwrap();
        let err = FileStorage::open(dir.path()).unwrap_err();
        assert!(err.is_corruption());
    }
}
