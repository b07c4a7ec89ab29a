use chrono::Utc;
use dashmap::DashMap;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::config::{CacheBackend, CacheConfig};
use crate::error::{ConsistencyError, Result};

/// Content address of a generator call: blake3 over the canonical JSON of
/// every parameter that can change the response.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// `serde_json::Map` keeps keys sorted, so `to_string` is canonical.
    pub fn from_request(request: &Value) -> Self {
        let canonical = request.to_string();
        Self(blake3::hash(canonical.as_bytes()).to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Read-through / write-through store for structured generator responses.
pub trait ResponseCache: Send + Sync {
    fn get(&self, key: &CacheKey) -> Result<Option<Value>>;
    fn put(&self, key: &CacheKey, value: &Value) -> Result<()>;
    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// In-process cache for a single run. Entries live as long as the cache.
#[derive(Default)]
pub struct MemoryCache {
    cache: DashMap<String, Value>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResponseCache for MemoryCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Value>> {
        Ok(self.cache.get(key.as_str()).map(|entry| entry.value().clone()))
    }

    fn put(&self, key: &CacheKey, value: &Value) -> Result<()> {
        self.cache.insert(key.as_str().to_string(), value.clone());
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.cache.len())
    }
}

/// One JSON file per key. Writes go to a temporary sibling and are renamed
/// into place, so readers see either the old file or the new one.
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        Ok(Self { dir: dir.to_path_buf() })
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.json", key.as_str()))
    }
}

impl ResponseCache for FileCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Value>> {
        let path = self.entry_path(key);
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, key: &CacheKey, value: &Value) -> Result<()> {
        let path = self.entry_path(key);
        let tmp = self.dir.join(format!(
            ".{}.{}.tmp",
            key.as_str(),
            rand::random::<u64>()
        ));
        std::fs::write(&tmp, serde_json::to_vec(value)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        let mut count = 0;
        for entry in std::fs::read_dir(&self.dir)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if name.ends_with(".json") && !name.starts_with('.') {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// SQLite-backed store, suitable for sharing one cache between runs.
pub struct SqliteCache {
    conn: Mutex<Connection>,
}

impl SqliteCache {
    pub fn new(db_path: &Path) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(db_path)?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS responses (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL
            );
            "#,
        )?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| ConsistencyError::Config("cache connection poisoned".to_string()))
    }
}

impl ResponseCache for SqliteCache {
    fn get(&self, key: &CacheKey) -> Result<Option<Value>> {
        let conn = self.lock()?;
        let raw: Option<String> = conn
            .query_row(
                "SELECT value FROM responses WHERE key = ?1",
                params![key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    fn put(&self, key: &CacheKey, value: &Value) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO responses (key, value, created_at) VALUES (?1, ?2, ?3)",
            params![key.as_str(), value.to_string(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM responses", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Build the configured backend. `None` means caching is off.
pub fn open_cache(config: &CacheConfig, disabled: bool) -> Result<Option<Arc<dyn ResponseCache>>> {
    if disabled {
        debug!("Response cache disabled at runtime");
        return Ok(None);
    }
    let cache: Arc<dyn ResponseCache> = match config.backend {
        CacheBackend::None => return Ok(None),
        CacheBackend::Memory => Arc::new(MemoryCache::new()),
        CacheBackend::File => Arc::new(FileCache::new(Path::new(&config.path))?),
        CacheBackend::Sqlite => Arc::new(SqliteCache::new(Path::new(&config.path))?),
    };
    debug!("Response cache opened: {:?} at {}", config.backend, config.path);
    Ok(Some(cache))
}
