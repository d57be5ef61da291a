//! Durable storage for one opaque blob (the sealed gallery).
//!
//! Backends only ever replace the whole blob. A crash mid-write must leave
//! either the previous blob or the new one, never a mix.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Whole-blob read / atomic replace.
pub trait Persistence: Send + Sync {
    /// Current blob, or `None` if nothing was ever written.
    fn read(&self) -> Result<Option<Vec<u8>>, PersistenceError>;
    /// Atomically replace the blob.
    fn replace(&self, bytes: &[u8]) -> Result<(), PersistenceError>;
    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

/// Single file, replaced via temp file + rename.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "gallery".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Persistence for FileBackend {
    fn read(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn replace(&self, bytes: &[u8]) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let temp_path = self.temp_path();
        {
            let mut temp_file = File::create(&temp_path)?;
            temp_file.write_all(bytes)?;
            temp_file.sync_all()?;
        }

        fs::rename(&temp_path, &self.path)?;

        // Sync parent directory so the rename itself is durable.
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        tracing::debug!(path = %self.path.display(), len = bytes.len(), "gallery file replaced");
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// Single-row blob table in a SQLite database.
pub struct SqliteBackend {
    conn: Mutex<Connection>,
    label: String,
}

impl SqliteBackend {
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn, format!("sqlite:{}", path.display()))
    }

    pub fn in_memory() -> Result<Self, PersistenceError> {
        Self::init(Connection::open_in_memory()?, "sqlite::memory:".into())
    }

    fn init(conn: Connection, label: String) -> Result<Self, PersistenceError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS gallery_blob (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 data BLOB NOT NULL,
                 updated_at TEXT NOT NULL
             );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            label,
        })
    }

    fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Persistence for SqliteBackend {
    fn read(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        let conn = self.conn();
        let data = conn
            .query_row("SELECT data FROM gallery_blob WHERE id = 1", [], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(data)
    }

    fn replace(&self, bytes: &[u8]) -> Result<(), PersistenceError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT OR REPLACE INTO gallery_blob (id, data, updated_at) VALUES (1, ?1, ?2)",
            params![bytes, chrono::Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        tracing::debug!(db = %self.label, len = bytes.len(), "gallery blob replaced");
        Ok(())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Process-local blob, for tests and throwaway galleries.
#[derive(Default)]
pub struct MemoryBackend {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite the stored blob directly, bypassing the store.
    pub fn set(&self, bytes: Option<Vec<u8>>) {
        *self.blob.lock().unwrap_or_else(|p| p.into_inner()) = bytes;
    }
}

impl Persistence for MemoryBackend {
    fn read(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        Ok(self.blob.lock().unwrap_or_else(|p| p.into_inner()).clone())
    }

    fn replace(&self, bytes: &[u8]) -> Result<(), PersistenceError> {
        *self.blob.lock().unwrap_or_else(|p| p.into_inner()) = Some(bytes.to_vec());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".into()
    }
}

impl<P: Persistence + ?Sized> Persistence for Box<P> {
    fn read(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        (**self).read()
    }

    fn replace(&self, bytes: &[u8]) -> Result<(), PersistenceError> {
        (**self).replace(bytes)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

impl<P: Persistence + ?Sized> Persistence for std::sync::Arc<P> {
    fn read(&self) -> Result<Option<Vec<u8>>, PersistenceError> {
        (**self).read()
    }

    fn replace(&self, bytes: &[u8]) -> Result<(), PersistenceError> {
        (**self).replace(bytes)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
