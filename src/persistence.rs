//! Key-value persistence of the store.
//!
//! Each collection is written as a JSON array under its own key; dates travel
//! as RFC 3339 strings and are re-hydrated through
//! [`EntityKind::date_fields`] on the way back in.

use std::{
    cell::RefCell,
    collections::HashMap,
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    rc::Rc,
};

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::{
    events::ActivityEntry,
    store::{EntityKind, Store},
};

/// Key of the activity log
pub const ACTIVITIES_KEY: &str = "activities";
/// Key of the last persist timestamp
pub const LAST_SAVE_TIME_KEY: &str = "lastSaveTime";
/// Key of the last maintenance date
pub const LAST_MAINTENANCE_KEY: &str = "lastMaintenanceDate";

/// Failures reading or writing the backing storage
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not read or write a key
    #[error("I/O error on key {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
    /// A value could not be encoded or decoded as JSON
    #[error("JSON error on key {key}: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    /// A stored date field could not be understood
    #[error("invalid date in {key}: {message}")]
    InvalidDate { key: String, message: String },
    /// The backend refused the write
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// A string key-value store, the shape of browser local storage
pub trait KeyValueStorage {
    /// Read the value under `key`
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` when the backend cannot be read.
    fn get(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Write `value` under `key`
    ///
    /// # Errors
    ///
    /// Returns a `StorageError` when the backend rejects the write.
    fn set(&mut self, key: &str, value: String) -> Result<(), StorageError>;
}

/// In-process storage; clones share the same map
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    /// Stored values by key
    entries: Rc<RefCell<HashMap<String, String>>>,
}

impl MemoryStorage {
    /// Create empty storage
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys written
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.borrow().len()
    }

    /// Whether nothing was written yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.borrow().is_empty()
    }
}

impl KeyValueStorage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.entries.borrow().get(key).cloned())
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), StorageError> {
        self.entries.borrow_mut().insert(key.to_string(), value);
        Ok(())
    }
}

/// One `<key>.json` file per key inside a directory
#[derive(Debug, Clone)]
pub struct FileStorage {
    /// Directory holding the files
    dir: PathBuf,
}

impl FileStorage {
    /// Use `dir` for storage; it is created on first write
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The storage directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File backing `key`
    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let io_err = |source| StorageError::Io { key: key.to_string(), source };
        let mut file = File::open(&path).map_err(io_err)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents).map_err(io_err)?;
        Ok(Some(contents))
    }

    fn set(&mut self, key: &str, value: String) -> Result<(), StorageError> {
        let io_err = |source| StorageError::Io { key: key.to_string(), source };
        fs::create_dir_all(&self.dir).map_err(io_err)?;
        let mut file = File::create(self.path_for(key)).map_err(io_err)?;
        file.write_all(value.as_bytes()).map_err(io_err)?;
        Ok(())
    }
}

/// Rewrite the date fields of every record in `items` as RFC 3339 UTC.
///
/// Accepts RFC 3339 strings, plain `YYYY-MM-DD` dates (midnight UTC) and
/// epoch milliseconds. Empty strings become `null`.
///
/// # Errors
///
/// Returns a message naming the record and field of the first bad value.
pub fn hydrate_dates(kind: EntityKind, items: &mut Value) -> Result<(), String> {
    let Some(records) = items.as_array_mut() else {
        return Err(format!("{} must be an array", kind.key()));
    };
    for record in records {
        let Some(fields) = record.as_object_mut() else {
            return Err(format!("{} must contain objects", kind.key()));
        };
        let id = fields.get("id").and_then(Value::as_str).unwrap_or("?").to_string();
        for field in kind.date_fields() {
            let Some(value) = fields.get_mut(*field) else {
                continue;
            };
            let hydrated = hydrate_value(value)
                .map_err(|raw| format!("{}[{id}].{field}: cannot read {raw} as a date", kind.key()))?;
            *value = hydrated;
        }
    }
    Ok(())
}

/// Normalize one date value, returning the raw text on failure
fn hydrate_value(value: &Value) -> Result<Value, String> {
    let instant = match value {
        Value::Null => return Ok(Value::Null),
        Value::String(text) if text.trim().is_empty() => return Ok(Value::Null),
        Value::String(text) => parse_date_text(text.trim()).ok_or_else(|| text.clone())?,
        Value::Number(number) => number
            .as_i64()
            .and_then(DateTime::<Utc>::from_timestamp_millis)
            .ok_or_else(|| number.to_string())?,
        other => return Err(other.to_string()),
    };
    Ok(Value::String(instant.to_rfc3339_opts(SecondsFormat::Millis, true)))
}

/// Parse an RFC 3339 timestamp or a bare calendar date
fn parse_date_text(text: &str) -> Option<DateTime<Utc>> {
    if let Ok(instant) = DateTime::parse_from_rfc3339(text) {
        return Some(instant.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Read, hydrate and decode one collection; a missing key is empty
fn read_collection<T: DeserializeOwned>(
    storage: &dyn KeyValueStorage,
    kind: EntityKind,
) -> Result<Vec<T>, StorageError> {
    let key = kind.key();
    let Some(raw) = storage.get(key)? else {
        return Ok(Vec::new());
    };
    let json_err = |source| StorageError::Json { key: key.to_string(), source };
    let mut items: Value = serde_json::from_str(&raw).map_err(json_err)?;
    hydrate_dates(kind, &mut items)
        .map_err(|message| StorageError::InvalidDate { key: key.to_string(), message })?;
    serde_json::from_value(items).map_err(json_err)
}

/// Read and decode a plain JSON value; a missing key yields the default
fn read_value<T: DeserializeOwned + Default>(
    storage: &dyn KeyValueStorage,
    key: &str,
) -> Result<T, StorageError> {
    match storage.get(key)? {
        Some(raw) => serde_json::from_str(&raw)
            .map_err(|source| StorageError::Json { key: key.to_string(), source }),
        None => Ok(T::default()),
    }
}

/// Encode and write one value
fn write_value<T: Serialize + ?Sized>(
    storage: &mut dyn KeyValueStorage,
    key: &str,
    value: &T,
) -> Result<(), StorageError> {
    let encoded = serde_json::to_string(value)
        .map_err(|source| StorageError::Json { key: key.to_string(), source })?;
    storage.set(key, encoded)
}

/// Load every collection from `storage` into a fresh store.
///
/// # Errors
///
/// Returns a `StorageError` when a key cannot be read or decoded.
pub fn load_store(storage: &dyn KeyValueStorage) -> Result<Store, StorageError> {
    let store = Store {
        readers: read_collection(storage, EntityKind::Readers)?,
        books: read_collection(storage, EntityKind::Books)?,
        borrow_records: read_collection(storage, EntityKind::BorrowRecords)?,
        categories: read_collection(storage, EntityKind::Categories)?,
        authors: read_collection(storage, EntityKind::Authors)?,
        publishers: read_collection(storage, EntityKind::Publishers)?,
        fines: read_collection(storage, EntityKind::Fines)?,
        renewals: read_collection(storage, EntityKind::Renewals)?,
        reservations: read_collection(storage, EntityKind::Reservations)?,
        activities: read_value::<Vec<ActivityEntry>>(storage, ACTIVITIES_KEY)?,
        last_save_time: read_value(storage, LAST_SAVE_TIME_KEY)?,
        last_maintenance_date: read_value(storage, LAST_MAINTENANCE_KEY)?,
    };
    debug!(
        readers = store.readers.len(),
        books = store.books.len(),
        borrow_records = store.borrow_records.len(),
        "loaded store"
    );
    Ok(store)
}

/// Write every collection of `store` to `storage`.
///
/// # Errors
///
/// Returns the first `StorageError` raised while encoding or writing.
pub fn save_store(store: &Store, storage: &mut dyn KeyValueStorage) -> Result<(), StorageError> {
    for kind in EntityKind::ALL {
        let key = kind.key();
        match kind {
            EntityKind::Readers => write_value(storage, key, &store.readers)?,
            EntityKind::Books => write_value(storage, key, &store.books)?,
            EntityKind::BorrowRecords => write_value(storage, key, &store.borrow_records)?,
            EntityKind::Categories => write_value(storage, key, &store.categories)?,
            EntityKind::Authors => write_value(storage, key, &store.authors)?,
            EntityKind::Publishers => write_value(storage, key, &store.publishers)?,
            EntityKind::Fines => write_value(storage, key, &store.fines)?,
            EntityKind::Renewals => write_value(storage, key, &store.renewals)?,
            EntityKind::Reservations => write_value(storage, key, &store.reservations)?,
        }
    }
    write_value(storage, ACTIVITIES_KEY, &store.activities)?;
    write_value(storage, LAST_SAVE_TIME_KEY, &store.last_save_time)?;
    write_value(storage, LAST_MAINTENANCE_KEY, &store.last_maintenance_date)?;
    debug!(readers = store.readers.len(), books = store.books.len(), "saved store");
    Ok(())
}
