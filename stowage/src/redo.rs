use crate::commitment::Commitment;
use crate::error::AppError;
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct RedoOptions {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

/// Write-ahead hook of the savers. One log per saver, one file per batch.
pub trait RedoLog: Send + Sync {
    /// Opens the file backing the next batch of `worker`.
    fn serve(&self, namespace: &'static str, worker: usize) -> Box<dyn RedoLogFile>;

    /// Commitments logged in files that were never destroyed, replayed on startup.
    fn pending(&self, namespace: &'static str) -> Result<Vec<Box<dyn Commitment>>, AppError>;
}

pub trait RedoLogFile: Send {
    fn log(&mut self, commitment: &dyn Commitment);
    /// The batch left the producers' hands.
    fn retire(&mut self);
    /// The batch reached storage.
    fn destroy(&mut self);
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoRedo;

impl RedoLog for NoRedo {
    fn serve(&self, _namespace: &'static str, _worker: usize) -> Box<dyn RedoLogFile> {
        Box::new(NoRedo)
    }

    fn pending(&self, _namespace: &'static str) -> Result<Vec<Box<dyn Commitment>>, AppError> {
        Ok(Vec::new())
    }
}

impl RedoLogFile for NoRedo {
    fn log(&mut self, _commitment: &dyn Commitment) {}
    fn retire(&mut self) {}
    fn destroy(&mut self) {}
}
