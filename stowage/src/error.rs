use std::sync::PoisonError;
use crossbeam::channel::{RecvError, SendError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {

    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serde error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("bincode error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Recv: {0}")]
    RecvError(#[from] RecvError),

    #[error("duplicate key {key} in {namespace}")]
    Duplicate { namespace: String, key: String },

    #[error("namespace {0} registered twice")]
    DuplicateNamespace(String),

    #[error("namespace {0} is not registered")]
    UnregisteredNamespace(String),

    #[error("driver {0} is not registered")]
    UnknownDriver(String),

    #[error("no table options for {namespace} on driver {driver}")]
    MissingTableOptions { driver: String, namespace: String },

    #[error("table options of {0} carry no dao key")]
    MissingDaoKey(String),

    #[error("no dao options for dao key {0}")]
    MissingDaoOptions(String),

    #[error("{namespace} rejected by driver {driver}: {reason}")]
    Validation { driver: String, namespace: String, reason: String },

    #[error("cannot change fields of a {0:?} record")]
    InvalidLifecycle(crate::header::Lifecycle),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("saver of {0} is closed")]
    SaverClosed(String),

    #[error("saving of {0} was aborted")]
    SaveAborted(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Custom error: {0}")]
    Custom(String),
}

impl AppError {
    pub fn duplicate(namespace: &str, key: impl ToString) -> Self {
        AppError::Duplicate { namespace: namespace.to_string(), key: key.to_string() }
    }
}

impl<T> From<SendError<T>> for AppError
{
    fn from(e: SendError<T>) -> Self {
        AppError::Custom(format!("send error: {:?}", e.to_string()))
    }
}

impl<T> From<PoisonError<T>> for AppError
{
    fn from(e: PoisonError<T>) -> Self {
        AppError::Custom(format!("Poison error: {:?}", e.to_string()))
    }
}
