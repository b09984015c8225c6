use crate::commitment::{to_document, Commitment, Snapshot};
use crate::error::AppError;
use crate::field::{Field, FieldDesc, FieldSet};
use crate::header::{Header, Lifecycle};
use crate::pk::Pk;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Persistable entity state. Implemented by generated entity code.
pub trait Record: Send + 'static {
    type Pk: Pk;
    type Data: Clone + Serialize + DeserializeOwned + Send + Sync + fmt::Debug + 'static;

    /// Stable tag of the entity type, also the name it is registered under.
    const NAMESPACE: &'static str;
    /// Field table. An empty table persists the whole serialized document.
    const FIELDS: &'static [FieldDesc];

    fn pk(&self) -> Self::Pk;
    fn header(&self) -> &Header;
    fn header_mut(&mut self) -> &mut Header;
    fn data(&self) -> &Self::Data;

    fn x_id(&self) -> String {
        format!("{}:{}", Self::NAMESPACE, self.pk())
    }

    fn lifecycle(&self) -> Lifecycle {
        self.header().lifecycle()
    }

    fn snapshot(&self) -> Self::Data {
        self.data().clone()
    }

    fn version(&self) -> u64 {
        0
    }
}

pub trait MutableRecord: Record + Sized {
    /// Bare construction; lifecycle stays `Unavailable` until `init` or `load`.
    fn from_data(data: Self::Data) -> Self;

    fn data_mut(&mut self) -> &mut Self::Data;

    fn init(data: Self::Data) -> Self {
        let mut record = Self::from_data(data);
        record.header_mut().init(Lifecycle::New);
        record
    }

    fn load(data: Self::Data) -> Self {
        let mut record = Self::from_data(data);
        record.header_mut().init(Lifecycle::Normal);
        record.header_mut().load_complete();
        record
    }

    fn set_changed(&mut self, fields: &[Field]) -> Result<(), AppError> {
        self.header_mut().set_changed(fields)
    }

    /// Copies the listed fields of `changes` into this record and marks them changed.
    fn update(&mut self, changes: &Self::Data, fields: FieldSet) -> Result<(), AppError> {
        let lifecycle = self.lifecycle();
        if lifecycle.is_gone() {
            return Err(AppError::InvalidLifecycle(lifecycle));
        }
        let incoming = to_document(changes)?;
        let mut current = to_document(self.data())?;
        for desc in Self::FIELDS.iter().filter(|d| fields.contains(d.code)) {
            if let Some(value) = incoming.get(desc.name) {
                current.insert(desc.name.to_string(), value.clone());
            }
        }
        *self.data_mut() = serde_json::from_value(Value::Object(current))?;
        let codes: Vec<Field> = fields.iter().collect();
        self.header_mut().set_changed(&codes)
    }

    fn delete(&mut self) -> bool {
        self.header_mut().mark_as_deleted()
    }

    fn dirty(&self) -> bool {
        self.header().dirty()
    }

    fn committing(&self) -> bool {
        self.header().committing()
    }

    fn saving_index(&self) -> Option<usize> {
        self.header().saving_index()
    }

    fn set_saving_index(&mut self, index: Option<usize>) {
        self.header_mut().set_saving_index(index)
    }

    /// Captures the pending change and finalizes the header. None when nothing is pending.
    fn commit(&mut self) -> Option<(Box<dyn Commitment>, FieldSet)> {
        if !self.dirty() {
            return None;
        }
        let finish = self.header_mut().commit();
        let changes = self.header().changes();
        let snapshot = Snapshot::capture(self);
        finish(self.header_mut());
        Some((Box::new(snapshot), changes))
    }
}

/// Lifecycle callbacks of a cached model.
pub trait Listener {
    fn on_create(&mut self) {}
    fn on_load(&mut self) {}
    fn on_update(&mut self, _changes: FieldSet) {}
    fn on_delete(&mut self) {}
    fn on_reload(&mut self) {}
    fn on_refresh(&mut self) {}
}

/// Cache-visible wrapper around a record.
pub trait Model: Listener + Send + 'static {
    type Record: MutableRecord;

    /// Volatile models are never negatively cached.
    const VOLATILE: bool = false;

    fn from_record(record: Self::Record) -> Self;
    fn record(&self) -> &Self::Record;
    fn record_mut(&mut self) -> &mut Self::Record;

    fn validate_affinity(&self) -> bool {
        self.record().header().validate_affinity()
    }
}

pub type PkOf<M> = <<M as Model>::Record as Record>::Pk;
pub type DataOf<M> = <<M as Model>::Record as Record>::Data;

/// Model for record types registered without one.
pub struct Bare<R>(R);

impl<R> Listener for Bare<R> {}

impl<R: MutableRecord> Model for Bare<R> {
    type Record = R;

    fn from_record(record: R) -> Self {
        Bare(record)
    }

    fn record(&self) -> &R {
        &self.0
    }

    fn record_mut(&mut self) -> &mut R {
        &mut self.0
    }
}

/// Shared cached instance. Holding the lock is the per-entity critical section.
pub struct Handle<M>(Arc<Mutex<M>>);

impl<M> Handle<M> {
    pub fn new(model: M) -> Self {
        Handle(Arc::new(Mutex::new(model)))
    }

    pub(crate) fn from_arc(inner: Arc<Mutex<M>>) -> Self {
        Handle(inner)
    }

    pub(crate) fn arc(&self) -> &Arc<Mutex<M>> {
        &self.0
    }

    pub fn lock(&self) -> MutexGuard<'_, M> {
        lock_model(&self.0)
    }

    /// Both handles point at the same cached instance.
    pub fn same(&self, other: &Handle<M>) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<M> Clone for Handle<M> {
    fn clone(&self) -> Self {
        Handle(Arc::clone(&self.0))
    }
}

impl<M> fmt::Debug for Handle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({:p})", Arc::as_ptr(&self.0))
    }
}

pub(crate) fn lock_model<M>(model: &Mutex<M>) -> MutexGuard<'_, M> {
    model.lock().unwrap_or_else(PoisonError::into_inner)
}
