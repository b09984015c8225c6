use crate::driver::{Dao, Driver, NoStorage, NO_STORAGE};
use crate::error::AppError;
use crate::header::Lifecycle;
use crate::pk::{Document, Key, KeyPart, Pk, PkRef};
use crate::record::{lock_model, DataOf, Handle, Model, MutableRecord, PkOf, Record};
use crate::repo::Slot;
use crate::saver::Saver;
use crate::settings::{Configurator, TableOptions};
use crate::source::{ErasedSource, Registry, Source};
use crate::{error, info, warn};
use serde_json::Value;
use std::any::type_name;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CreateFlags {
    /// Marks the instance temporary.
    pub tmp: bool,
    /// Mirrors are neither checked for duplicates nor cached.
    pub mirror: bool,
}

/// Entity cache with write-behind persistence, built once by [`Stowage::setup`].
pub struct Stowage {
    sources: BTreeMap<&'static str, Arc<dyn ErasedSource>>,
    dry_run: bool,
    stopped: AtomicBool,
}

struct SetupPlan<'a> {
    source: &'a Arc<dyn ErasedSource>,
    driver: Arc<dyn Driver>,
    options: Option<TableOptions>,
}

impl Stowage {
    /// Resolves options, initializes drivers once, validates sources, opens one dao per dao key,
    /// installs tables and savers, replays pending commitments and starts the savers.
    pub fn setup(registry: Registry, configurator: &dyn Configurator) -> Result<Stowage, AppError> {
        let (sources, drivers, redo) = registry.into_parts();
        if let Some(redo_options) = configurator.redo_options().filter(|o| o.enabled) {
            warn!("redo log enabled at {:?}, durability depends on the installed hook", redo_options.dir);
        }
        let dry_run = configurator.dry_run();

        let mut plans = Vec::with_capacity(sources.len());
        let mut used_drivers: BTreeMap<&'static str, Arc<dyn Driver>> = BTreeMap::new();
        let mut dao_creations: BTreeMap<String, (Arc<dyn Driver>, Value)> = BTreeMap::new();
        for (namespace, source) in &sources {
            let meta = source.meta();
            let driver = drivers.get(meta.driver).cloned().ok_or_else(|| AppError::UnknownDriver(meta.driver.to_string()))?;
            if meta.driver == NO_STORAGE {
                plans.push(SetupPlan { source, driver, options: None });
                continue;
            }
            let options = configurator
                .table_options(meta.driver, namespace)
                .ok_or_else(|| AppError::MissingTableOptions { driver: meta.driver.to_string(), namespace: namespace.to_string() })?;
            if options.dao_key.is_empty() {
                return Err(AppError::MissingDaoKey(namespace.to_string()));
            }
            let dao_options = configurator.dao_options(&options.dao_key).ok_or_else(|| AppError::MissingDaoOptions(options.dao_key.clone()))?;
            used_drivers.entry(meta.driver).or_insert_with(|| Arc::clone(&driver));
            dao_creations.entry(options.dao_key.clone()).or_insert_with(|| (Arc::clone(&driver), dao_options));
            plans.push(SetupPlan { source, driver, options: Some(options) });
        }

        for (name, driver) in &used_drivers {
            driver.init(&configurator.driver_options(name))?;
            info!("driver {} initialized", name);
        }

        for plan in plans.iter().filter(|p| p.options.is_some()) {
            plan.driver.validate(plan.source.meta())?;
            plan.driver.extend_type(plan.source.meta())?;
        }

        let mut daos: HashMap<String, Arc<dyn Dao>> = HashMap::new();
        for (dao_key, (driver, options)) in dao_creations {
            let dao = driver.new_dao(&options)?;
            info!("dao {} opened on driver {}", dao_key, driver.name());
            daos.insert(dao_key, dao);
        }

        for plan in plans {
            let meta = plan.source.meta();
            let Some(options) = plan.options else {
                plan.source.install(Arc::new(NoStorage), None)?;
                continue;
            };
            let dao = daos.get(&options.dao_key).ok_or_else(|| AppError::MissingDaoOptions(options.dao_key.clone()))?;
            let table = dao.table(meta)?;
            let saver = if dry_run {
                None
            } else {
                Some(Saver::new(meta.namespace, Arc::clone(&table), Arc::clone(&redo), options.concurrence, options.save_timeout, options.sync_interval))
            };
            info!(
                "{} bound to table {} on dao {} with {} workers{}",
                meta.namespace,
                table.name(),
                options.dao_key,
                saver.as_ref().map_or(0, Saver::concurrence),
                if dry_run { " (dry run)" } else { "" }
            );
            plan.source.install(table, saver)?;
        }

        let stowage = Stowage { sources, dry_run, stopped: AtomicBool::new(false) };
        for saver in stowage.savers() {
            saver.recover()?;
        }
        for saver in stowage.savers() {
            saver.run()?;
        }
        Ok(stowage)
    }

    pub fn must_setup(registry: Registry, configurator: &dyn Configurator) -> Stowage {
        match Stowage::setup(registry, configurator) {
            Ok(stowage) => stowage,
            Err(e) => panic!("stowage setup failed: {}", e),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn namespaces(&self) -> Vec<&'static str> {
        self.sources.keys().copied().collect()
    }

    fn savers(&self) -> impl Iterator<Item = &Saver> {
        self.sources.values().filter_map(|s| s.saver())
    }

    /// Source of model `M`.
    ///
    /// # Panics
    /// When the namespace of `M` is registered with another model type.
    pub fn source<M: Model>(&self) -> Result<&Source<M>, AppError> {
        self.source_by_namespace::<M>(<M::Record as Record>::NAMESPACE)
    }

    /// # Panics
    /// When `namespace` is registered with a model type other than `M`.
    pub fn source_by_namespace<M: Model>(&self, namespace: &str) -> Result<&Source<M>, AppError> {
        let source = self.sources.get(namespace).ok_or_else(|| AppError::UnregisteredNamespace(namespace.to_string()))?;
        match source.as_any().downcast_ref::<Source<M>>() {
            Some(source) => Ok(source),
            None => panic!("{} is registered with model {}, cannot serve it as {}", namespace, source.meta().model, type_name::<M>()),
        }
    }

    pub fn create<M: Model>(&self, data: DataOf<M>) -> Result<Handle<M>, AppError> {
        self.create_with(data, CreateFlags::default())
    }

    pub fn create_with<M: Model>(&self, data: DataOf<M>, flags: CreateFlags) -> Result<Handle<M>, AppError> {
        create_in(self.source::<M>()?, data, flags)
    }

    pub fn create_by_namespace<M: Model>(&self, namespace: &str, data: DataOf<M>) -> Result<Handle<M>, AppError> {
        create_in(self.source_by_namespace::<M>(namespace)?, data, CreateFlags::default())
    }

    /// Cached instance of `pk`, loading it from storage on a miss. None when the key is absent.
    pub fn get<M: Model>(&self, pk: PkOf<M>) -> Result<Option<Handle<M>>, AppError> {
        get_in(self.source::<M>()?, pk)
    }

    pub fn get_by_namespace<M: Model>(&self, namespace: &str, parts: &[KeyPart]) -> Result<Option<Handle<M>>, AppError> {
        let source = self.source_by_namespace::<M>(namespace)?;
        get_in(source, PkOf::<M>::from_parts(parts)?)
    }

    /// Instances of every present key in `pks`; uncached keys are fetched in one round trip.
    pub fn get_multi<M: Model>(&self, pks: &[PkOf<M>]) -> Result<Vec<Handle<M>>, AppError> {
        let source = self.source::<M>()?;
        let (cached, uncached) = source.repo().get_multi(pks);
        let mut handles: Vec<Handle<M>> = cached.into_iter().map(Handle::from_arc).collect();
        if uncached.is_empty() {
            return Ok(handles);
        }
        let refs: Vec<&dyn PkRef> = uncached.iter().map(|pk| pk as &dyn PkRef).collect();
        let rows = source.table()?.fetch_multi(&refs)?.all_as::<DataOf<M>>()?;
        let mut found = HashSet::with_capacity(rows.len());
        for data in rows {
            let record = <M::Record as MutableRecord>::load(data);
            let pk = record.pk();
            found.insert(pk.clone());
            handles.extend(publish(source, pk, Some(record)));
        }
        for pk in uncached.into_iter().filter(|pk| !found.contains(pk)) {
            publish(source, pk, None);
        }
        Ok(handles)
    }

    /// Stored instances matching `filter`. Instances already cached are returned as cached.
    pub fn find<M: Model>(&self, filter: &Document) -> Result<Vec<Handle<M>>, AppError> {
        let source = self.source::<M>()?;
        let rows = source.table()?.find(filter)?.all_as::<DataOf<M>>()?;
        let mut handles = Vec::with_capacity(rows.len());
        for data in rows {
            let record = <M::Record as MutableRecord>::load(data);
            handles.extend(publish(source, record.pk(), Some(record)));
        }
        Ok(handles)
    }

    /// Commits pending changes of `handle` and hands them to the saver.
    /// False when nothing was committed.
    pub fn save<M: Model>(&self, handle: &Handle<M>) -> Result<bool, AppError> {
        let source = self.source::<M>()?;
        let mut model = handle.lock();
        save_locked(source, handle, &mut model)
    }

    /// Saves `handle` and blocks until its worker flushed.
    pub fn sync<M: Model>(&self, handle: &Handle<M>) -> Result<(), AppError> {
        let source = self.source::<M>()?;
        let hash = {
            let mut model = handle.lock();
            save_locked(source, handle, &mut model)?;
            model.record().pk().hash_group()
        };
        match source.saver() {
            Some(saver) => saver.sync(Some(hash)),
            None => Ok(()),
        }
    }

    /// Blocks until every pending batch of every source flushed.
    pub fn sync_all(&self) -> Result<(), AppError> {
        for saver in self.savers() {
            saver.sync(None)?;
        }
        Ok(())
    }

    /// Commitments accepted but not yet flushed.
    pub fn ongoing(&self) -> usize {
        self.savers().map(Saver::ongoing).sum()
    }

    /// Evicts `pk` from the cache and flags the evicted instance expired, so later saves skip it.
    pub fn expire<M: Model>(&self, pk: &PkOf<M>) -> Result<bool, AppError> {
        let source = self.source::<M>()?;
        match source.repo().expire(pk) {
            Some(model) => {
                lock_model(&model).record_mut().header_mut().set_expired();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Closes every saver, flushing what is pending once. Idempotent.
    pub fn stop(&self) -> Result<(), AppError> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let mut result = Ok(());
        for (namespace, source) in &self.sources {
            if let Some(saver) = source.saver() {
                if let Err(e) = saver.close() {
                    error!("{} saver failed to close: {}", namespace, e);
                    result = Err(e);
                }
            }
        }
        info!("stowage stopped");
        result
    }
}

impl Drop for Stowage {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            error!("stowage stop on drop failed: {}", e);
        }
    }
}

fn create_in<M: Model>(source: &Source<M>, data: DataOf<M>, flags: CreateFlags) -> Result<Handle<M>, AppError> {
    let namespace = source.meta().namespace;
    let mut record = <M::Record as MutableRecord>::init(data);
    let pk = record.pk();
    if flags.tmp {
        record.header_mut().set_tmp();
    }
    if flags.mirror {
        record.header_mut().enable_mirror();
    } else if get_in(source, pk.clone())?.is_some() {
        return Err(AppError::duplicate(namespace, &pk));
    }

    let mut model = M::from_record(record);
    model.on_create();
    let handle = Handle::new(model);
    if flags.mirror || source.repo().set_on_store(pk.clone(), handle.arc()) {
        return Ok(handle);
    }
    // lost a race with a concurrent fetch or create; retry only if that entry is gone again
    match source.repo().get(&pk) {
        Some(Slot::Live(_)) => Err(AppError::duplicate(namespace, &pk)),
        _ if source.repo().set_on_store(pk.clone(), handle.arc()) => Ok(handle),
        _ => Err(AppError::duplicate(namespace, &pk)),
    }
}

fn get_in<M: Model>(source: &Source<M>, pk: PkOf<M>) -> Result<Option<Handle<M>>, AppError> {
    match source.repo().get(&pk) {
        Some(Slot::Live(model)) => return Ok(Some(Handle::from_arc(model))),
        Some(Slot::Missing) => return Ok(None),
        None => {}
    }
    let mut cursor = source.table()?.fetch(true, &pk)?;
    let record = if cursor.next() { Some(<M::Record as MutableRecord>::load(cursor.decode_as::<DataOf<M>>()?)) } else { None };
    cursor.close()?;
    Ok(publish(source, pk, record))
}

/// Offers a fetched record to the cache. The first published instance wins; listeners run once for it.
fn publish<M: Model>(source: &Source<M>, pk: PkOf<M>, record: Option<M::Record>) -> Option<Handle<M>> {
    let replica = source.meta().replica;
    let fresh = record.map(|r| Arc::new(Mutex::new(M::from_record(r))));
    source
        .repo()
        .set_on_fetch(pk, fresh, |model| {
            let mut model = lock_model(model);
            if replica {
                model.on_reload()
            } else {
                model.on_load()
            }
        })
        .map(Handle::from_arc)
}

fn save_locked<M: Model>(source: &Source<M>, handle: &Handle<M>, model: &mut M) -> Result<bool, AppError> {
    let header = *model.record().header();
    if header.is_expired() {
        return Ok(false);
    }
    let pk = model.record().pk();
    if !header.is_mirror() && header.lifecycle() == Lifecycle::Normal && !source.repo().set_on_store(pk.clone(), handle.arc()) {
        return Err(AppError::duplicate(source.meta().namespace, &pk));
    }

    let committed = match model.record_mut().commit() {
        Some((commitment, changes)) => {
            match commitment.lifecycle() {
                Lifecycle::Deleted => model.on_delete(),
                Lifecycle::Normal => model.on_update(changes),
                _ => {}
            }
            if let Some(saver) = source.saver() {
                let index = model.record().saving_index();
                let placed = saver.put(commitment, index);
                model.record_mut().set_saving_index(placed);
            }
            true
        }
        None => false,
    };

    if !header.is_mirror() && model.record().lifecycle() == Lifecycle::Unavailable {
        source.repo().set_on_delete(&pk, handle.arc());
    }
    Ok(committed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Table;
    use crate::drivers::memory::{MemoryDriver, MEMORY};
    use crate::record::Bare;
    use crate::settings::Settings;
    use crate::source::SourceDesc;
    use crate::test_utils::{created, hero, Hero, HeroPk, LEVEL};
    use serde_json::json;
    use std::time::Duration;

    type H = Bare<Hero>;

    fn open(dry_run: bool) -> (Stowage, Arc<MemoryDriver>) {
        let driver = Arc::new(MemoryDriver::new());
        let mut registry = Registry::new();
        registry.register_driver(driver.clone());
        registry.register_record::<Hero>(SourceDesc::new(MEMORY, "heroes")).unwrap();
        let settings = Settings::default()
            .with_dao("mem", json!({}))
            .with_default(MEMORY, TableOptions::new("mem").sync_interval(Duration::from_millis(20)))
            .with_dry_run(dry_run);
        (Stowage::setup(registry, &settings).unwrap(), driver)
    }

    #[test]
    fn created_instance_is_the_cached_one() {
        let (stowage, _driver) = open(false);
        let created = stowage.create::<H>(hero(1, "ann", 1)).unwrap();
        let fetched = stowage.get::<H>(HeroPk(1)).unwrap().unwrap();
        assert!(created.same(&fetched));
        assert!(stowage.get::<H>(HeroPk(2)).unwrap().is_none());
        assert!(matches!(stowage.source::<H>().unwrap().repo().get(&HeroPk(2)), Some(Slot::Missing)));
    }

    #[test]
    fn update_is_merged_into_stored_row() {
        let (stowage, driver) = open(false);
        let handle = stowage.create::<H>(hero(1, "ann", 1)).unwrap();
        stowage.sync(&handle).unwrap();
        {
            let mut model = handle.lock();
            model.record_mut().data_mut().level = 7;
            model.record_mut().set_changed(&[LEVEL]).unwrap();
        }
        assert!(stowage.save(&handle).unwrap());
        assert!(!stowage.save(&handle).unwrap());
        stowage.sync(&handle).unwrap();
        let row = driver.table("hero").unwrap().row("1").unwrap();
        assert_eq!(row.get("level"), Some(&json!(7)));
    }

    #[test]
    fn deleting_unsaved_instance_evicts_it() {
        let (stowage, driver) = open(false);
        let handle = stowage.create::<H>(hero(3, "cid", 1)).unwrap();
        assert!(handle.lock().record_mut().delete());
        assert!(!stowage.save(&handle).unwrap());
        assert!(stowage.get::<H>(HeroPk(3)).unwrap().is_none());
        stowage.sync_all().unwrap();
        assert!(driver.table("hero").unwrap().is_empty());
    }

    #[test]
    fn expired_instances_are_not_saved() {
        let (stowage, driver) = open(false);
        let handle = stowage.create::<H>(hero(4, "dan", 1)).unwrap();
        assert!(stowage.expire::<H>(&HeroPk(4)).unwrap());
        assert!(!stowage.expire::<H>(&HeroPk(4)).unwrap());
        assert!(!stowage.save(&handle).unwrap());
        stowage.sync_all().unwrap();
        assert!(driver.table("hero").unwrap().is_empty());
    }

    #[test]
    fn multi_get_and_find_reuse_cached_instances() {
        let (stowage, driver) = open(false);
        let table = driver.table("hero").unwrap();
        table.recover((10..13).map(|id| created(id, "eve")).collect()).unwrap();
        let cached = stowage.get::<H>(HeroPk(10)).unwrap().unwrap();
        let all = stowage.get_multi::<H>(&[HeroPk(10), HeroPk(11), HeroPk(12), HeroPk(99)]).unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().any(|h| h.same(&cached)));
        assert!(matches!(stowage.source::<H>().unwrap().repo().get(&HeroPk(99)), Some(Slot::Missing)));

        let mut filter = Document::new();
        filter.insert("name".into(), json!("eve"));
        let found = stowage.find::<H>(&filter).unwrap();
        assert_eq!(found.len(), 3);
        assert!(found.iter().any(|h| h.same(&cached)));
    }

    #[test]
    fn stop_is_idempotent_and_closes_savers() {
        let (stowage, _driver) = open(false);
        let handle = stowage.create::<H>(hero(5, "fay", 1)).unwrap();
        stowage.stop().unwrap();
        stowage.stop().unwrap();
        assert!(matches!(stowage.sync(&handle), Err(AppError::SaverClosed(_))));
    }

    #[test]
    fn dry_run_keeps_committing() {
        let (stowage, driver) = open(true);
        assert!(stowage.is_dry_run());
        let handle = stowage.create::<H>(hero(6, "gus", 1)).unwrap();
        stowage.sync(&handle).unwrap();
        assert_eq!(handle.lock().record().lifecycle(), Lifecycle::Normal);
        assert_eq!(driver.table("hero").unwrap().saves(), 0);
        assert_eq!(stowage.ongoing(), 0);
    }
}
