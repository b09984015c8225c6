#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use stowage::pk::{expect_parts, hash_i64};
use stowage::*;

pub const ID: Field = 0;
pub const NAME: Field = 1;
pub const GOLD: Field = 2;
pub const ONLINE: Field = 3;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlayerData {
    pub id: i64,
    pub name: String,
    pub gold: u64,
    #[serde(default)]
    pub online: bool,
}

pub fn player(id: i64, name: &str) -> PlayerData {
    PlayerData { id, name: name.to_string(), gold: 0, online: true }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlayerPk(pub i64);

impl fmt::Display for PlayerPk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Key for PlayerPk {
    fn hash_group(&self) -> u64 {
        hash_i64(self.0)
    }
}

impl Pk for PlayerPk {
    fn full(&self) -> bool {
        true
    }

    fn fetch_filter(&self) -> Document {
        let mut filter = Document::new();
        filter.insert("id".to_string(), json!(self.0));
        filter
    }

    fn from_parts(parts: &[KeyPart]) -> Result<Self, AppError> {
        expect_parts(parts, 1, "player")?;
        Ok(PlayerPk(parts[0].as_i64()?))
    }
}

pub struct PlayerRecord {
    header: Header,
    data: PlayerData,
}

impl Record for PlayerRecord {
    type Pk = PlayerPk;
    type Data = PlayerData;

    const NAMESPACE: &'static str = "player";
    const FIELDS: &'static [FieldDesc] = &[
        FieldDesc::key(ID, "id"),
        FieldDesc::new(NAME, "name"),
        FieldDesc::new(GOLD, "gold"),
        FieldDesc::runtime(ONLINE, "online"),
    ];

    fn pk(&self) -> PlayerPk {
        PlayerPk(self.data.id)
    }

    fn header(&self) -> &Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn data(&self) -> &PlayerData {
        &self.data
    }
}

impl MutableRecord for PlayerRecord {
    fn from_data(data: PlayerData) -> Self {
        PlayerRecord { header: Header::default(), data }
    }

    fn data_mut(&mut self) -> &mut PlayerData {
        &mut self.data
    }
}

/// Player model counting the lifecycle callbacks it received.
pub struct PlayerModel {
    record: PlayerRecord,
    pub created: usize,
    pub loaded: usize,
    pub reloaded: usize,
    pub updates: Vec<FieldSet>,
    pub deleted: usize,
}

impl PlayerModel {
    pub fn add_gold(&mut self, amount: u64) {
        self.record.data_mut().gold += amount;
        self.record.set_changed(&[GOLD]).unwrap();
    }
}

impl Listener for PlayerModel {
    fn on_create(&mut self) {
        self.created += 1;
    }

    fn on_load(&mut self) {
        self.loaded += 1;
    }

    fn on_update(&mut self, changes: FieldSet) {
        self.updates.push(changes);
    }

    fn on_delete(&mut self) {
        self.deleted += 1;
    }

    fn on_reload(&mut self) {
        self.reloaded += 1;
    }
}

impl Model for PlayerModel {
    type Record = PlayerRecord;

    fn from_record(record: PlayerRecord) -> Self {
        PlayerModel { record, created: 0, loaded: 0, reloaded: 0, updates: Vec::new(), deleted: 0 }
    }

    fn record(&self) -> &PlayerRecord {
        &self.record
    }

    fn record_mut(&mut self) -> &mut PlayerRecord {
        &mut self.record
    }
}

pub fn memory_settings(sync_interval: Duration) -> Settings {
    Settings::default()
        .with_dao("mem", json!({}))
        .with_default(MEMORY, TableOptions::new("mem").concurrence(2).sync_interval(sync_interval))
}

/// Stowage with players on a fresh memory driver.
pub fn memory_stowage(settings: &Settings) -> (Stowage, Arc<MemoryDriver>) {
    let driver = Arc::new(MemoryDriver::new());
    let mut registry = Registry::new();
    registry.register_driver(driver.clone());
    registry.must_register_source::<PlayerModel>(SourceDesc::new(MEMORY, "players"));
    (Stowage::must_setup(registry, settings), driver)
}

pub fn temp_path(prefix: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("{}_{}", prefix, rand::random::<u64>()))
}
