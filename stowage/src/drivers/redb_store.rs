use super::{matches, prepare_all, report_overrun, row_change, RowChange};
use crate::commitment::{Commitment, PreparedWrite};
use crate::driver::{Dao, DocumentCursor, Driver, RecordCursor, Table, TableMemo};
use crate::error::AppError;
use crate::pk::{Document, PkRef};
use crate::retry::retry_while;
use crate::source::SourceMeta;
use crate::{error, info};
use redb::{Database, ReadableTable, TableDefinition};
use serde::Deserialize;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const REDB: &str = "redb";

#[derive(Debug, Clone, Deserialize)]
struct RedbDaoOptions {
    path: PathBuf,
    #[serde(default)]
    cache_size_mb: Option<usize>,
}

/// Embedded key/value backend: one database file per dao key, one redb table per source,
/// rows stored as JSON keyed by the primary key string.
#[derive(Clone, Copy, Debug, Default)]
pub struct RedbDriver;

impl Driver for RedbDriver {
    fn name(&self) -> &'static str {
        REDB
    }

    fn init(&self, _options: &Value) -> Result<(), AppError> {
        Ok(())
    }

    fn validate(&self, meta: &SourceMeta) -> Result<(), AppError> {
        let valid = !meta.table_name.is_empty() && meta.table_name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Ok(())
        } else {
            Err(AppError::Validation {
                driver: REDB.to_string(),
                namespace: meta.namespace.to_string(),
                reason: format!("table name {:?} must be non-empty [A-Za-z0-9_]", meta.table_name),
            })
        }
    }

    fn new_dao(&self, options: &Value) -> Result<Arc<dyn Dao>, AppError> {
        let opts: RedbDaoOptions = serde_json::from_value(options.clone())?;
        if let Some(parent) = opts.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut builder = Database::builder();
        if let Some(mb) = opts.cache_size_mb {
            builder.set_cache_size(mb * 1024 * 1024);
        }
        let db = builder.create(&opts.path)?;
        info!("redb database opened at {}", opts.path.display());
        Ok(Arc::new(RedbDao { db: Arc::new(db), tables: TableMemo::default() }))
    }
}

pub struct RedbDao {
    db: Arc<Database>,
    tables: TableMemo<RedbTable>,
}

impl Dao for RedbDao {
    fn table(&self, meta: &SourceMeta) -> Result<Arc<dyn Table>, AppError> {
        let table = self.tables.get_or_create(meta.namespace, || RedbTable::create(Arc::clone(&self.db), meta.table_name))?;
        Ok(table as Arc<dyn Table>)
    }
}

pub struct RedbTable {
    db: Arc<Database>,
    name: String,
}

impl RedbTable {
    fn def(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
        TableDefinition::new(name)
    }

    fn create(db: Arc<Database>, name: &str) -> Result<Self, AppError> {
        let tx = db.begin_write()?;
        {
            tx.open_table(Self::def(name))?;
        }
        tx.commit()?;
        Ok(RedbTable { db, name: name.to_string() })
    }

    /// Applies `writes` in a single transaction.
    fn write(&self, writes: &[PreparedWrite]) -> Result<(), AppError> {
        let tx = self.db.begin_write()?;
        {
            let mut table = tx.open_table(Self::def(&self.name))?;
            for write in writes {
                let existing = match table.get(write.key.as_str())? {
                    Some(guard) => Some(serde_json::from_slice::<Document>(guard.value())?),
                    None => None,
                };
                match row_change(&self.name, existing, write) {
                    RowChange::Put(row) => {
                        let bytes = serde_json::to_vec(&row)?;
                        table.insert(write.key.as_str(), bytes.as_slice())?;
                    }
                    RowChange::Remove => {
                        table.remove(write.key.as_str())?;
                    }
                    RowChange::Skip => {}
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn read_keys(&self, keys: &[String]) -> Result<Vec<Document>, AppError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(Self::def(&self.name))?;
        let mut rows = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(guard) = table.get(key.as_str())? {
                rows.push(serde_json::from_slice::<Document>(guard.value())?);
            }
        }
        Ok(rows)
    }
}

impl Table for RedbTable {
    fn name(&self) -> &str {
        &self.name
    }

    fn recover(&self, commitments: Vec<Box<dyn Commitment>>) -> Result<(), AppError> {
        self.write(&prepare_all(&self.name, &commitments))
    }

    fn save(&self, commitments: &[Box<dyn Commitment>], write_timeout: Duration, retry_interval: Duration, running: &dyn Fn() -> bool) -> bool {
        let writes = prepare_all(&self.name, commitments);
        if writes.is_empty() {
            return true;
        }
        let started = Instant::now();
        match retry_while(&self.name, retry_interval, running, || self.write(&writes)) {
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
        Ok(DocumentCursor::boxed(self.read_keys(&[pk.to_string()])?))
    }

    fn fetch_multi(&self, pks: &[&dyn PkRef]) -> Result<Box<dyn RecordCursor>, AppError> {
        let keys: Vec<String> = pks.iter().map(|pk| pk.to_string()).collect();
        Ok(DocumentCursor::boxed(self.read_keys(&keys)?))
    }

    fn find(&self, filter: &Document) -> Result<Box<dyn RecordCursor>, AppError> {
        let tx = self.db.begin_read()?;
        let table = tx.open_table(Self::def(&self.name))?;
        let mut rows = Vec::new();
        for entry in table.iter()? {
            let (_key, value) = entry?;
            let row: Document = serde_json::from_slice(value.value())?;
            if matches(&row, filter) {
                rows.push(row);
            }
        }
        Ok(DocumentCursor::boxed(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Bare;
    use crate::source::SourceDesc;
    use crate::test_utils::{created, level_up, removed, temp_path, Hero, HeroPk};
    use serde_json::json;

    fn open(table_name: &'static str) -> (Arc<dyn Table>, PathBuf) {
        let path = temp_path("stowage_redb").join("store.redb");
        let dao = RedbDriver.new_dao(&json!({ "path": path, "cache_size_mb": 8 })).unwrap();
        let table = dao.table(&SourceMeta::new::<Bare<Hero>>(&SourceDesc::new(REDB, table_name))).unwrap();
        (table, path)
    }

    #[test]
    fn rows_round_trip_through_transactions() {
        let (table, _path) = open("heroes");
        assert!(table.save(&[created(1, "ann"), created(2, "bob")], Duration::from_secs(5), Duration::ZERO, &|| true));
        assert!(table.save(&[level_up(1, 12), removed(2), level_up(3, 4)], Duration::from_secs(5), Duration::ZERO, &|| true));

        let mut cursor = table.fetch(true, &HeroPk(1)).unwrap();
        assert!(cursor.next());
        let row = cursor.decode().unwrap();
        assert_eq!(row.get("name"), Some(&json!("ann")));
        assert_eq!(row.get("level"), Some(&json!(12)));
        assert!(!table.fetch(true, &HeroPk(2)).unwrap().next());
        assert!(!table.fetch(true, &HeroPk(3)).unwrap().next());
    }

    #[test]
    fn multi_fetch_and_find() {
        let (table, _path) = open("heroes");
        table.recover(vec![created(1, "ann"), created(2, "bob"), created(3, "ann")]).unwrap();
        let (a, b, c) = (HeroPk(1), HeroPk(3), HeroPk(4));
        assert_eq!(table.fetch_multi(&[&a, &b, &c]).unwrap().all().unwrap().len(), 2);

        let mut filter = Document::new();
        filter.insert("name".into(), json!("bob"));
        let found = table.find(&filter).unwrap().all().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].get("id"), Some(&json!(2)));
    }

    #[test]
    fn table_names_are_validated() {
        let meta = SourceMeta::new::<Bare<Hero>>(&SourceDesc::new(REDB, "bad-name"));
        assert!(matches!(RedbDriver.validate(&meta), Err(AppError::Validation { .. })));
        assert!(RedbDriver.new_dao(&json!({ "cache_size_mb": 1 })).is_err());
    }
}
