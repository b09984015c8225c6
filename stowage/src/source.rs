use crate::driver::{Driver, NoStorage, Table, NO_STORAGE};
use crate::error::AppError;
use crate::field::{self, FieldDesc, FieldSet};
use crate::record::{Bare, Model, MutableRecord, PkOf, Record};
use crate::redo::{NoRedo, RedoLog};
use crate::repo::{Repo, RepoOptions, DEFAULT_GROUPS};
use crate::saver::Saver;
use once_cell::sync::OnceCell;
use std::any::{type_name, Any};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

/// Registration-time description of an entity type's storage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceDesc {
    pub driver: &'static str,
    pub db_name: &'static str,
    pub table_name: &'static str,
    /// Loaded copies mirror data owned by another service.
    pub replica: bool,
    pub repo: Option<RepoOptions>,
}

impl SourceDesc {
    pub fn new(driver: &'static str, table_name: &'static str) -> Self {
        SourceDesc { driver, db_name: "", table_name, replica: false, repo: None }
    }

    /// Cache-only source.
    pub fn cache_only() -> Self {
        SourceDesc::new(NO_STORAGE, "")
    }

    pub fn db(self, db_name: &'static str) -> Self {
        SourceDesc { db_name, ..self }
    }

    pub fn replica(self) -> Self {
        SourceDesc { replica: true, ..self }
    }

    pub fn groups(self, groups: usize) -> Self {
        SourceDesc { repo: Some(RepoOptions { groups }), ..self }
    }
}

/// Resolved metadata of a registered source, as seen by drivers.
#[derive(Clone, Debug)]
pub struct SourceMeta {
    pub namespace: &'static str,
    pub driver: &'static str,
    pub db_name: &'static str,
    pub table_name: &'static str,
    pub fields: &'static [FieldDesc],
    pub persisted: FieldSet,
    pub replica: bool,
    pub volatile: bool,
    pub repo: RepoOptions,
    pub model: &'static str,
}

impl SourceMeta {
    pub fn new<M: Model>(desc: &SourceDesc) -> Self {
        let fields = <M::Record as Record>::FIELDS;
        let groups = if desc.driver == NO_STORAGE { 1 } else { DEFAULT_GROUPS };
        SourceMeta {
            namespace: <M::Record as Record>::NAMESPACE,
            driver: desc.driver,
            db_name: desc.db_name,
            table_name: desc.table_name,
            fields,
            persisted: field::persisted(fields),
            replica: desc.replica,
            volatile: M::VOLATILE,
            repo: desc.repo.unwrap_or(RepoOptions { groups }),
            model: type_name::<M>(),
        }
    }

    pub fn field_names(&self, with_runtime: bool) -> Vec<&'static str> {
        self.fields.iter().filter(|d| with_runtime || !d.runtime).map(|d| d.name).collect()
    }

    pub fn is_persisted(&self) -> bool {
        self.driver != NO_STORAGE
    }
}

pub(crate) struct Runtime {
    pub(crate) table: Arc<dyn Table>,
    pub(crate) saver: Option<Saver>,
}

/// Registered entity type: its metadata, its cache and, once set up, its table and saver.
pub struct Source<M: Model> {
    meta: SourceMeta,
    repo: Repo<PkOf<M>, Mutex<M>>,
    runtime: OnceCell<Runtime>,
}

impl<M: Model> Source<M> {
    pub fn new(desc: &SourceDesc) -> Self {
        let meta = SourceMeta::new::<M>(desc);
        let repo = Repo::new(meta.repo.groups, meta.volatile);
        Source { meta, repo, runtime: OnceCell::new() }
    }

    pub fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    pub fn repo(&self) -> &Repo<PkOf<M>, Mutex<M>> {
        &self.repo
    }

    pub(crate) fn table(&self) -> Result<&Arc<dyn Table>, AppError> {
        self.runtime
            .get()
            .map(|rt| &rt.table)
            .ok_or_else(|| AppError::Custom(format!("{} is not set up", self.meta.namespace)))
    }

    pub(crate) fn saver(&self) -> Option<&Saver> {
        self.runtime.get().and_then(|rt| rt.saver.as_ref())
    }
}

/// Type-erased view the registry and the facade keep of every source.
pub(crate) trait ErasedSource: Send + Sync {
    fn meta(&self) -> &SourceMeta;
    fn install(&self, table: Arc<dyn Table>, saver: Option<Saver>) -> Result<(), AppError>;
    fn saver(&self) -> Option<&Saver>;
    fn as_any(&self) -> &dyn Any;
}

impl<M: Model> ErasedSource for Source<M> {
    fn meta(&self) -> &SourceMeta {
        &self.meta
    }

    fn install(&self, table: Arc<dyn Table>, saver: Option<Saver>) -> Result<(), AppError> {
        self.runtime
            .set(Runtime { table, saver })
            .map_err(|_| AppError::Custom(format!("{} is already set up", self.meta.namespace)))
    }

    fn saver(&self) -> Option<&Saver> {
        Source::saver(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Statically submitted source registration, collected with `inventory`.
pub struct SourceInfo {
    pub namespace: &'static str,
    pub register: fn(&mut Registry) -> Result<(), AppError>,
}

inventory::collect!(SourceInfo);

/// Sources and drivers known before setup.
pub struct Registry {
    sources: BTreeMap<&'static str, Arc<dyn ErasedSource>>,
    drivers: HashMap<&'static str, Arc<dyn Driver>>,
    redo: Arc<dyn RedoLog>,
}

impl Default for Registry {
    fn default() -> Self {
        Registry::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        let mut registry = Registry { sources: BTreeMap::new(), drivers: HashMap::new(), redo: Arc::new(NoRedo) };
        registry.register_driver(Arc::new(NoStorage));
        registry
    }

    pub fn register_driver(&mut self, driver: Arc<dyn Driver>) -> &mut Self {
        self.drivers.insert(driver.name(), driver);
        self
    }

    /// Binds model `M` to its namespace. One registration per namespace.
    pub fn register_source<M: Model>(&mut self, desc: SourceDesc) -> Result<&mut Self, AppError> {
        let namespace = <M::Record as Record>::NAMESPACE;
        if self.sources.contains_key(namespace) {
            return Err(AppError::DuplicateNamespace(namespace.to_string()));
        }
        if desc.repo.is_some_and(|r| r.groups == 0) {
            return Err(AppError::Custom(format!("{} needs at least one repo group", namespace)));
        }
        self.sources.insert(namespace, Arc::new(Source::<M>::new(&desc)));
        Ok(self)
    }

    pub fn must_register_source<M: Model>(&mut self, desc: SourceDesc) -> &mut Self {
        if let Err(e) = self.register_source::<M>(desc) {
            panic!("cannot register {}: {}", type_name::<M>(), e);
        }
        self
    }

    /// Registers a record type that has no model of its own.
    pub fn register_record<R: MutableRecord>(&mut self, desc: SourceDesc) -> Result<&mut Self, AppError> {
        self.register_source::<Bare<R>>(desc)
    }

    /// Registers every source submitted with `inventory::submit!`.
    pub fn register_submitted(&mut self) -> Result<&mut Self, AppError> {
        for info in inventory::iter::<SourceInfo> {
            (info.register)(self)?;
        }
        Ok(self)
    }

    pub fn with_redo(&mut self, redo: Arc<dyn RedoLog>) -> &mut Self {
        self.redo = redo;
        self
    }

    pub fn namespaces(&self) -> Vec<&'static str> {
        self.sources.keys().copied().collect()
    }

    pub fn meta(&self, namespace: &str) -> Option<&SourceMeta> {
        self.sources.get(namespace).map(|s| s.meta())
    }

    pub(crate) fn into_parts(self) -> (BTreeMap<&'static str, Arc<dyn ErasedSource>>, HashMap<&'static str, Arc<dyn Driver>>, Arc<dyn RedoLog>) {
        (self.sources, self.drivers, self.redo)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::memory::MEMORY;
    use crate::test_utils::Hero;

    #[test]
    fn duplicate_namespace_is_rejected() {
        let mut registry = Registry::new();
        registry.register_record::<Hero>(SourceDesc::new(MEMORY, "heroes")).unwrap();
        let err = registry.register_record::<Hero>(SourceDesc::new(MEMORY, "heroes")).err().unwrap();
        assert!(matches!(err, AppError::DuplicateNamespace(ns) if ns == "hero"));
        assert_eq!(registry.namespaces(), vec!["hero"]);
    }

    #[test]
    fn zero_repo_groups_are_rejected() {
        let mut registry = Registry::new();
        let err = registry.register_record::<Hero>(SourceDesc::new(MEMORY, "heroes").groups(0)).err().unwrap();
        assert!(matches!(err, AppError::Custom(msg) if msg.contains("repo group")));
        assert!(registry.namespaces().is_empty());
    }

    #[test]
    #[should_panic(expected = "cannot register")]
    fn must_register_panics_on_duplicates() {
        let mut registry = Registry::new();
        registry.must_register_source::<Bare<Hero>>(SourceDesc::cache_only());
        registry.must_register_source::<Bare<Hero>>(SourceDesc::cache_only());
    }

    #[test]
    fn meta_resolves_cache_policy_and_fields() {
        let persisted = SourceMeta::new::<Bare<Hero>>(&SourceDesc::new(MEMORY, "heroes").db("game"));
        assert_eq!(persisted.repo.groups, DEFAULT_GROUPS);
        assert_eq!(persisted.field_names(false), vec!["id", "name", "level"]);
        assert_eq!(persisted.field_names(true).len(), 4);
        assert_eq!(persisted.db_name, "game");
        assert!(persisted.is_persisted());

        let cache_only = SourceMeta::new::<Bare<Hero>>(&SourceDesc::cache_only());
        assert_eq!(cache_only.repo.groups, 1);
        assert!(!cache_only.is_persisted());

        let tuned = SourceMeta::new::<Bare<Hero>>(&SourceDesc::new(MEMORY, "heroes").groups(64).replica());
        assert_eq!(tuned.repo.groups, 64);
        assert!(tuned.replica);
    }

    #[test]
    fn none_driver_is_always_known() {
        let registry = Registry::new();
        let (_, drivers, _) = registry.into_parts();
        assert!(drivers.contains_key(NO_STORAGE));
    }
}
