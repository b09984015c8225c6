use crate::error::AppError;
use crate::field::{Field, FieldDesc};
use crate::header::Header;
use crate::pk::{expect_parts, hash_i64, Document, Key, KeyPart, Pk};
use crate::record::{MutableRecord, Record};
use serde::{Deserialize, Serialize};
use std::fmt;

pub(crate) const ID: Field = 0;
pub(crate) const NAME: Field = 1;
pub(crate) const LEVEL: Field = 2;
pub(crate) const SESSION: Field = 3;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct HeroData {
    pub id: i64,
    pub name: String,
    pub level: i32,
    #[serde(default)]
    pub session: String,
}

pub(crate) fn hero(id: i64, name: &str, level: i32) -> HeroData {
    HeroData { id, name: name.to_string(), level, session: String::new() }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct HeroPk(pub i64);

impl fmt::Display for HeroPk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Key for HeroPk {
    fn hash_group(&self) -> u64 {
        hash_i64(self.0)
    }
}

impl Pk for HeroPk {
    fn full(&self) -> bool {
        true
    }

    fn fetch_filter(&self) -> Document {
        let mut doc = Document::new();
        doc.insert("id".to_string(), self.0.into());
        doc
    }

    fn from_parts(parts: &[KeyPart]) -> Result<Self, AppError> {
        expect_parts(parts, 1, "hero")?;
        Ok(HeroPk(parts[0].as_i64()?))
    }
}

pub(crate) struct Hero {
    header: Header,
    data: HeroData,
}

impl Record for Hero {
    type Pk = HeroPk;
    type Data = HeroData;

    const NAMESPACE: &'static str = "hero";
    const FIELDS: &'static [FieldDesc] = &[
        FieldDesc::key(ID, "id"),
        FieldDesc::new(NAME, "name"),
        FieldDesc::new(LEVEL, "level"),
        FieldDesc::runtime(SESSION, "session"),
    ];

    fn pk(&self) -> HeroPk {
        HeroPk(self.data.id)
    }

    fn header(&self) -> &Header {
        &self.header
    }

    fn header_mut(&mut self) -> &mut Header {
        &mut self.header
    }

    fn data(&self) -> &HeroData {
        &self.data
    }
}

impl MutableRecord for Hero {
    fn from_data(data: HeroData) -> Self {
        Hero { header: Header::default(), data }
    }

    fn data_mut(&mut self) -> &mut HeroData {
        &mut self.data
    }
}

/// Pending update of hero `id` to `level`.
pub(crate) fn level_up(id: i64, level: i32) -> Box<dyn crate::commitment::Commitment> {
    let mut h = Hero::load(hero(id, "hero", level));
    h.set_changed(&[LEVEL]).unwrap();
    h.commit().unwrap().0
}

pub(crate) fn created(id: i64, name: &str) -> Box<dyn crate::commitment::Commitment> {
    Hero::init(hero(id, name, 1)).commit().unwrap().0
}

pub(crate) fn removed(id: i64) -> Box<dyn crate::commitment::Commitment> {
    let mut h = Hero::load(hero(id, "hero", 1));
    h.delete();
    h.commit().unwrap().0
}

pub(crate) fn temp_path(prefix: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("{}_{}", prefix, rand::random::<u64>()))
}
