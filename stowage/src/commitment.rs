use crate::error::AppError;
use crate::field::{FieldDesc, FieldSet};
use crate::header::{Header, Lifecycle};
use crate::pk::{Document, Pk, PkRef};
use crate::record::{MutableRecord, Record};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::Any;
use std::fmt;

/// Backend-ready form of one commitment.
#[derive(Clone, Debug, PartialEq)]
pub struct PreparedWrite {
    pub key: String,
    pub lifecycle: Lifecycle,
    pub filter: Document,
    /// Full row for `New`, changed and key fields for `Normal`, empty otherwise.
    pub data: Document,
}

/// Immutable snapshot of one pending write.
pub trait Commitment: Send + fmt::Debug + 'static {
    fn namespace(&self) -> &'static str;
    fn pk(&self) -> &dyn PkRef;
    fn lifecycle(&self) -> Lifecycle;
    fn changes(&self) -> FieldSet;
    fn version(&self) -> u64;

    /// Whether `merge` would absorb `other`.
    fn absorbs(&self, other: &dyn Commitment) -> bool;

    /// Absorbs a later commitment of the same key. The argument is handed back when it cannot be absorbed.
    fn merge(&mut self, other: Box<dyn Commitment>) -> Result<(), Box<dyn Commitment>>;

    fn prepare_write(&self) -> Result<PreparedWrite, AppError>;

    /// Binary form for redo logging.
    fn marshal(&self) -> Result<Vec<u8>, AppError>;

    fn as_any(&self) -> &dyn Any;
}

pub(crate) fn to_document<T: Serialize>(value: &T) -> Result<Document, AppError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(AppError::Custom(format!("expected a document, got {other}"))),
    }
}

fn project(mut doc: Document, fields: &[FieldDesc], mask: Option<FieldSet>) -> Document {
    if fields.is_empty() {
        return doc;
    }
    let mut out = Document::new();
    for desc in fields.iter().filter(|d| !d.runtime) {
        let wanted = desc.key || mask.map_or(true, |m| m.contains(desc.code));
        if wanted {
            if let Some(value) = doc.remove(desc.name) {
                out.insert(desc.name.to_string(), value);
            }
        }
    }
    out
}

#[derive(Serialize, Deserialize)]
struct Wire<D> {
    lifecycle: Lifecycle,
    changes: FieldSet,
    version: u64,
    data: D,
}

/// Commitment of any record type, captured at commit time.
pub struct Snapshot<R: Record> {
    pk: R::Pk,
    header: Header,
    version: u64,
    data: R::Data,
}

impl<R: Record> Snapshot<R> {
    pub fn capture(record: &R) -> Self {
        let header = record.header();
        let mut captured = Header::new(header.lifecycle());
        captured.set_changes(header.changes());
        Snapshot { pk: record.pk(), header: captured, version: record.version(), data: record.snapshot() }
    }

    pub fn data(&self) -> &R::Data {
        &self.data
    }

    pub fn key(&self) -> &R::Pk {
        &self.pk
    }
}

impl<R: MutableRecord> Snapshot<R> {
    pub fn unmarshal(bytes: &[u8]) -> Result<Self, AppError> {
        let wire: Wire<R::Data> = bincode::deserialize(bytes)?;
        let pk = R::from_data(wire.data.clone()).pk();
        let mut header = Header::new(wire.lifecycle);
        header.set_changes(wire.changes);
        Ok(Snapshot { pk, header, version: wire.version, data: wire.data })
    }
}

impl<R: Record> fmt::Debug for Snapshot<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("namespace", &R::NAMESPACE)
            .field("pk", &self.pk)
            .field("lifecycle", &self.header.lifecycle())
            .field("changes", &self.header.changes())
            .finish()
    }
}

impl<R: Record> Commitment for Snapshot<R> {
    fn namespace(&self) -> &'static str {
        R::NAMESPACE
    }

    fn pk(&self) -> &dyn PkRef {
        &self.pk
    }

    fn lifecycle(&self) -> Lifecycle {
        self.header.lifecycle()
    }

    fn changes(&self) -> FieldSet {
        self.header.changes()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn absorbs(&self, other: &dyn Commitment) -> bool {
        let mut header = self.header;
        match other.as_any().downcast_ref::<Self>() {
            Some(incoming) => incoming.pk == self.pk && header.merge(&incoming.header),
            None => false,
        }
    }

    fn merge(&mut self, other: Box<dyn Commitment>) -> Result<(), Box<dyn Commitment>> {
        let Some(incoming) = other.as_any().downcast_ref::<Self>() else {
            return Err(other);
        };
        if incoming.pk != self.pk {
            return Err(other);
        }
        let mut merged = self.header;
        if !merged.merge(&incoming.header) {
            return Err(other);
        }
        if !incoming.header.lifecycle().is_gone() {
            self.data = incoming.data.clone();
        }
        self.version = self.version.max(incoming.version);
        self.header = merged;
        Ok(())
    }

    fn prepare_write(&self) -> Result<PreparedWrite, AppError> {
        let lifecycle = self.header.lifecycle();
        let data = match lifecycle {
            Lifecycle::New => project(to_document(&self.data)?, R::FIELDS, None),
            Lifecycle::Normal => project(to_document(&self.data)?, R::FIELDS, Some(self.header.changes())),
            Lifecycle::Deleted | Lifecycle::Unavailable => Document::new(),
        };
        Ok(PreparedWrite { key: self.pk.to_string(), lifecycle, filter: self.pk.fetch_filter(), data })
    }

    fn marshal(&self) -> Result<Vec<u8>, AppError> {
        let wire = Wire { lifecycle: self.header.lifecycle(), changes: self.header.changes(), version: self.version, data: &self.data };
        Ok(bincode::serialize(&wire)?)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
