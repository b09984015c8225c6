use crate::commitment::Commitment;
use crate::error::AppError;
use crate::pk::{Document, PkRef};
use crate::source::SourceMeta;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Name of the driver of cache-only sources.
pub const NO_STORAGE: &str = "none";

/// Iterator over fetched rows.
pub trait RecordCursor: Send {
    fn next(&mut self) -> bool;
    /// Row under the cursor.
    fn decode(&mut self) -> Result<Document, AppError>;
    /// Remaining rows.
    fn all(&mut self) -> Result<Vec<Document>, AppError>;
    fn close(&mut self) -> Result<(), AppError>;
}

impl dyn RecordCursor + '_ {
    pub fn decode_as<T: DeserializeOwned>(&mut self) -> Result<T, AppError> {
        Ok(serde_json::from_value(Value::Object(self.decode()?))?)
    }

    pub fn all_as<T: DeserializeOwned>(&mut self) -> Result<Vec<T>, AppError> {
        self.all()?
            .into_iter()
            .map(|doc| serde_json::from_value(Value::Object(doc)).map_err(AppError::from))
            .collect()
    }
}

pub trait Table: Send + Sync {
    fn name(&self) -> &str;

    fn recover(&self, commitments: Vec<Box<dyn Commitment>>) -> Result<(), AppError>;

    /// Applies `commitments` in order, retrying transient failures every `retry_interval`
    /// while `running()` holds. False means the batch was abandoned.
    /// Saves outlasting `write_timeout` are reported, not interrupted.
    fn save(&self, commitments: &[Box<dyn Commitment>], write_timeout: Duration, retry_interval: Duration, running: &dyn Fn() -> bool) -> bool;

    fn fetch(&self, only_one: bool, pk: &dyn PkRef) -> Result<Box<dyn RecordCursor>, AppError>;

    fn fetch_multi(&self, pks: &[&dyn PkRef]) -> Result<Box<dyn RecordCursor>, AppError>;

    fn find(&self, filter: &Document) -> Result<Box<dyn RecordCursor>, AppError>;
}

/// Connection-level handle shared by the sources of one dao key.
pub trait Dao: Send + Sync {
    /// Table of `meta`, created on first request and memoized.
    fn table(&self, meta: &SourceMeta) -> Result<Arc<dyn Table>, AppError>;
}

pub trait Driver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Called once before any dao is created.
    fn init(&self, options: &Value) -> Result<(), AppError>;

    fn validate(&self, meta: &SourceMeta) -> Result<(), AppError>;

    fn new_dao(&self, options: &Value) -> Result<Arc<dyn Dao>, AppError>;

    fn extend_type(&self, _meta: &SourceMeta) -> Result<(), AppError> {
        Ok(())
    }
}

/// Cursor over rows already in memory.
#[derive(Debug, Default)]
pub struct DocumentCursor {
    pending: VecDeque<Document>,
    current: Option<Document>,
}

impl DocumentCursor {
    pub fn new(rows: Vec<Document>) -> Self {
        DocumentCursor { pending: rows.into(), current: None }
    }

    pub fn boxed(rows: Vec<Document>) -> Box<dyn RecordCursor> {
        Box::new(DocumentCursor::new(rows))
    }
}

impl RecordCursor for DocumentCursor {
    fn next(&mut self) -> bool {
        self.current = self.pending.pop_front();
        self.current.is_some()
    }

    fn decode(&mut self) -> Result<Document, AppError> {
        self.current.clone().ok_or_else(|| AppError::NotFound("cursor is not positioned on a row".to_string()))
    }

    fn all(&mut self) -> Result<Vec<Document>, AppError> {
        self.current = None;
        Ok(self.pending.drain(..).collect())
    }

    fn close(&mut self) -> Result<(), AppError> {
        self.pending.clear();
        self.current = None;
        Ok(())
    }
}

/// Per-dao memo of tables by namespace.
pub struct TableMemo<T> {
    tables: Mutex<HashMap<&'static str, Arc<T>>>,
}

impl<T> Default for TableMemo<T> {
    fn default() -> Self {
        TableMemo { tables: Mutex::new(HashMap::new()) }
    }
}

impl<T> TableMemo<T> {
    pub fn get(&self, namespace: &str) -> Option<Arc<T>> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner).get(namespace).cloned()
    }

    pub fn get_or_create<F>(&self, namespace: &'static str, create: F) -> Result<Arc<T>, AppError>
    where
        F: FnOnce() -> Result<T, AppError>,
    {
        let mut tables = self.tables.lock()?;
        if let Some(table) = tables.get(namespace) {
            return Ok(Arc::clone(table));
        }
        let table = Arc::new(create()?);
        tables.insert(namespace, Arc::clone(&table));
        Ok(table)
    }
}

/// Driver of cache-only sources.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoStorage;

impl Driver for NoStorage {
    fn name(&self) -> &'static str {
        NO_STORAGE
    }

    fn init(&self, _options: &Value) -> Result<(), AppError> {
        Ok(())
    }

    fn validate(&self, _meta: &SourceMeta) -> Result<(), AppError> {
        Ok(())
    }

    fn new_dao(&self, _options: &Value) -> Result<Arc<dyn Dao>, AppError> {
        Ok(Arc::new(NoStorage))
    }
}

impl Dao for NoStorage {
    fn table(&self, _meta: &SourceMeta) -> Result<Arc<dyn Table>, AppError> {
        Ok(Arc::new(NoStorage))
    }
}

impl Table for NoStorage {
    fn name(&self) -> &str {
        NO_STORAGE
    }

    fn recover(&self, _commitments: Vec<Box<dyn Commitment>>) -> Result<(), AppError> {
        Ok(())
    }

    fn save(&self, _commitments: &[Box<dyn Commitment>], _write_timeout: Duration, _retry_interval: Duration, _running: &dyn Fn() -> bool) -> bool {
        true
    }

    fn fetch(&self, _only_one: bool, _pk: &dyn PkRef) -> Result<Box<dyn RecordCursor>, AppError> {
        Ok(DocumentCursor::boxed(Vec::new()))
    }

    fn fetch_multi(&self, _pks: &[&dyn PkRef]) -> Result<Box<dyn RecordCursor>, AppError> {
        Ok(DocumentCursor::boxed(Vec::new()))
    }

    fn find(&self, _filter: &Document) -> Result<Box<dyn RecordCursor>, AppError> {
        Ok(DocumentCursor::boxed(Vec::new()))
    }
}
