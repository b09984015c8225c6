//! stowage is an entity cache with write-behind persistence for game servers.
//!
//! Entities are looked up through a sharded identity cache that holds at most one live instance per
//! primary key and caches confirmed absence. Changes are tracked per field in the entity header,
//! committed into immutable snapshots and handed to a per-type saver whose workers coalesce them by key
//! and flush them to a pluggable storage backend in batches, on size or on a debounce deadline.
//!
//! Storage backends implement the `Driver`/`Dao`/`Table` interfaces; an in-memory backend and a
//! [Redb](https://github.com/cberner/redb) backend ship with the crate.
//!

pub mod error;
pub mod logger;
pub mod field;
pub mod header;
pub mod pk;
pub mod record;
pub mod commitment;
pub mod repo;
pub mod redo;
pub mod driver;
pub mod drivers;
pub mod saver;
pub mod retry;
pub mod source;
pub mod settings;
pub mod cache;

#[cfg(test)]
mod test_utils;

pub use commitment::{Commitment, PreparedWrite, Snapshot};
pub use driver::{Dao, DocumentCursor, Driver, NoStorage, RecordCursor, Table, NO_STORAGE};
pub use drivers::memory::{MemoryDriver, MemoryTable, MEMORY};
pub use drivers::redb_store::{RedbDriver, REDB};
pub use error::AppError;
pub use field::{Field, FieldDesc, FieldSet};
pub use header::{Header, Lifecycle};
pub use inventory;
pub use pk::{Document, Key, KeyPart, Pk, PkRef};
pub use record::{Bare, DataOf, Handle, Listener, Model, MutableRecord, PkOf, Record};
pub use redo::{NoRedo, RedoLog, RedoLogFile, RedoOptions};
pub use settings::{Configurator, Settings, TableOptions};
pub use source::{Registry, Source, SourceDesc, SourceInfo, SourceMeta};
pub use cache::{CreateFlags, Stowage};
