use super::{matches, prepare_all, report_overrun, row_change, RowChange};
use crate::commitment::{Commitment, PreparedWrite};
use crate::driver::{Dao, DocumentCursor, Driver, RecordCursor, Table, TableMemo};
use crate::error::AppError;
use crate::pk::{Document, PkRef};
use crate::retry::retry_while;
use crate::source::SourceMeta;
use crate::error;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

pub const MEMORY: &str = "memory";

/// Process-local table. Counts what reaches it and can be told to fail.
pub struct MemoryTable {
    name: String,
    rows: RwLock<BTreeMap<String, Document>>,
    saves: AtomicUsize,
    written: AtomicUsize,
    fail_next: AtomicUsize,
    failures: AtomicUsize,
}

impl MemoryTable {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryTable {
            name: name.into(),
            rows: RwLock::new(BTreeMap::new()),
            saves: AtomicUsize::new(0),
            written: AtomicUsize::new(0),
            fail_next: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
        }
    }

    /// Number of `save` calls.
    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Number of rows put or removed.
    pub fn written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }

    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }

    /// Makes the next `n` write attempts fail.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn row(&self, key: &str) -> Option<Document> {
        self.read().get(key).cloned()
    }

    pub fn rows(&self) -> Vec<Document> {
        self.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Document>> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, writes: &[PreparedWrite]) -> Result<(), AppError> {
        if self.fail_next.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            self.failures.fetch_add(1, Ordering::SeqCst);
            return Err(AppError::Custom(format!("{} refused the write", self.name)));
        }
        let mut rows = self.rows.write().unwrap_or_else(PoisonError::into_inner);
        for write in writes {
            match row_change(&self.name, rows.get(&write.key).cloned(), write) {
                RowChange::Put(row) => {
                    rows.insert(write.key.clone(), row);
                }
                RowChange::Remove => {
                    rows.remove(&write.key);
                }
                RowChange::Skip => continue,
            }
            self.written.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Table for MemoryTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn recover(&self, commitments: Vec<Box<dyn Commitment>>) -> Result<(), AppError> {
        self.apply(&prepare_all(&self.name, &commitments))
    }

    fn save(&self, commitments: &[Box<dyn Commitment>], write_timeout: Duration, retry_interval: Duration, running: &dyn Fn() -> bool) -> bool {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let writes = prepare_all(&self.name, commitments);
        let started = Instant::now();
        match retry_while(&self.name, retry_interval, running, || self.apply(&writes)) {
            Ok(()) => {
                report_overrun(&self.name, writes.len(), started.elapsed(), write_timeout);
                true
            }
            Err(e) => {
                error!("{} gave up saving {} rows: {}", self.name, writes.len(), e);
                false
            }
        }
    }

    fn fetch(&self, _only_one: bool, pk: &dyn PkRef) -> Result<Box<dyn RecordCursor>, AppError> {
        Ok(DocumentCursor::boxed(self.row(&pk.to_string()).into_iter().collect()))
    }

    fn fetch_multi(&self, pks: &[&dyn PkRef]) -> Result<Box<dyn RecordCursor>, AppError> {
        let rows = self.read();
        Ok(DocumentCursor::boxed(pks.iter().filter_map(|pk| rows.get(&pk.to_string()).cloned()).collect()))
    }

    fn find(&self, filter: &Document) -> Result<Box<dyn RecordCursor>, AppError> {
        let rows = self.read();
        Ok(DocumentCursor::boxed(rows.values().filter(|row| matches(row, filter)).cloned().collect()))
    }
}

pub struct MemoryDao {
    tables: Arc<TableMemo<MemoryTable>>,
}

impl Dao for MemoryDao {
    fn table(&self, meta: &SourceMeta) -> Result<Arc<dyn Table>, AppError> {
        let table = self.tables.get_or_create(meta.namespace, || Ok(MemoryTable::new(meta.table_name)))?;
        Ok(table as Arc<dyn Table>)
    }
}

/// Driver keeping every table in process memory. Tables survive their daos, so they can be inspected.
#[derive(Default)]
pub struct MemoryDriver {
    tables: Arc<TableMemo<MemoryTable>>,
    inits: AtomicUsize,
    daos: AtomicUsize,
}

impl MemoryDriver {
    pub fn new() -> Self {
        MemoryDriver::default()
    }

    pub fn table(&self, namespace: &str) -> Option<Arc<MemoryTable>> {
        self.tables.get(namespace)
    }

    pub fn inits(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn daos(&self) -> usize {
        self.daos.load(Ordering::SeqCst)
    }
}

impl Driver for MemoryDriver {
    fn name(&self) -> &'static str {
        MEMORY
    }

    fn init(&self, _options: &Value) -> Result<(), AppError> {
        self.inits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn validate(&self, meta: &SourceMeta) -> Result<(), AppError> {
        if meta.table_name.is_empty() {
            return Err(AppError::Validation { driver: MEMORY.to_string(), namespace: meta.namespace.to_string(), reason: "empty table name".to_string() });
        }
        Ok(())
    }

    fn new_dao(&self, options: &Value) -> Result<Arc<dyn Dao>, AppError> {
        if !options.is_object() {
            return Err(AppError::Custom(format!("memory dao options must be a map, got {options}")));
        }
        self.daos.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryDao { tables: Arc::clone(&self.tables) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Bare;
    use crate::source::SourceDesc;
    use crate::test_utils::{created, level_up, removed, Hero, HeroPk};
    use serde_json::json;

    fn meta() -> SourceMeta {
        SourceMeta::new::<Bare<Hero>>(&SourceDesc::new(MEMORY, "heroes"))
    }

    #[test]
    fn save_applies_lifecycle_in_order() {
        let table = MemoryTable::new("heroes");
        assert!(table.save(&[created(1, "ann"), created(2, "bob"), level_up(1, 5), removed(2)], Duration::from_secs(1), Duration::ZERO, &|| true));
        assert_eq!(table.len(), 1);
        assert_eq!(table.row("1").unwrap().get("level"), Some(&json!(5)));
        assert_eq!(table.written(), 4);
        assert_eq!(table.saves(), 1);
    }

    #[test]
    fn update_without_stored_row_writes_nothing() {
        let table = MemoryTable::new("heroes");
        assert!(table.save(&[level_up(1, 5)], Duration::from_secs(1), Duration::ZERO, &|| true));
        assert!(table.is_empty());
        assert_eq!(table.written(), 0);
    }

    #[test]
    fn stopped_save_gets_one_attempt() {
        let table = MemoryTable::new("heroes");
        table.fail_next(1);
        assert!(!table.save(&[created(1, "ann")], Duration::from_secs(1), Duration::ZERO, &|| false));
        assert!(table.is_empty());
        assert!(table.save(&[created(1, "ann")], Duration::from_secs(1), Duration::ZERO, &|| false));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn fetch_find_and_multi() {
        let table = MemoryTable::new("heroes");
        table.recover(vec![created(1, "ann"), created(2, "bob"), created(3, "ann")]).unwrap();

        let mut one = table.fetch(true, &HeroPk(2)).unwrap();
        assert!(one.next());
        assert_eq!(one.decode().unwrap().get("name"), Some(&json!("bob")));

        let (a, b) = (HeroPk(1), HeroPk(9));
        assert_eq!(table.fetch_multi(&[&a, &b]).unwrap().all().unwrap().len(), 1);

        let mut filter = Document::new();
        filter.insert("name".into(), json!("ann"));
        assert_eq!(table.find(&filter).unwrap().all().unwrap().len(), 2);
    }

    #[test]
    fn daos_share_tables_per_namespace() {
        let driver = MemoryDriver::new();
        let a = driver.new_dao(&json!({})).unwrap().table(&meta()).unwrap();
        let b = driver.new_dao(&json!({})).unwrap().table(&meta()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(driver.daos(), 2);
        assert!(driver.table("hero").is_some());
        assert!(driver.new_dao(&json!(3)).is_err());
        assert!(driver.validate(&SourceMeta::new::<Bare<Hero>>(&SourceDesc::new(MEMORY, ""))).is_err());
    }
}
