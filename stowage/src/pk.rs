use crate::error::AppError;
use serde_json::Value;
use std::fmt;
use std::hash::Hash;
use xxhash_rust::xxh3::xxh3_64;

/// Backend-neutral row: field name to JSON value.
pub type Document = serde_json::Map<String, Value>;

/// Cache key. Partial keys must report the same `hash_group` as every full key they prefix,
/// so prefix scans stay within one repo group.
pub trait Key: Clone + Eq + Hash + Send + Sync + fmt::Debug + 'static {
    fn hash_group(&self) -> u64;

    fn is_empty(&self) -> bool {
        false
    }

    fn prefix_of(&self, other: &Self) -> bool {
        self == other
    }
}

/// One raw component of a primary key, as handed over by callers that only know namespaces.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum KeyPart {
    Int(i64),
    Str(String),
}

impl KeyPart {
    pub fn as_i64(&self) -> Result<i64, AppError> {
        match self {
            KeyPart::Int(v) => Ok(*v),
            KeyPart::Str(s) => s.parse().map_err(|_| AppError::InvalidKey(format!("{s:?} is not an integer"))),
        }
    }

    pub fn as_str(&self) -> Result<&str, AppError> {
        match self {
            KeyPart::Str(s) => Ok(s),
            KeyPart::Int(v) => Err(AppError::InvalidKey(format!("{v} is not a string"))),
        }
    }
}

impl From<i64> for KeyPart {
    fn from(v: i64) -> Self {
        KeyPart::Int(v)
    }
}

impl From<i32> for KeyPart {
    fn from(v: i32) -> Self {
        KeyPart::Int(v as i64)
    }
}

impl From<&str> for KeyPart {
    fn from(v: &str) -> Self {
        KeyPart::Str(v.to_string())
    }
}

impl From<String> for KeyPart {
    fn from(v: String) -> Self {
        KeyPart::Str(v)
    }
}

/// Primary key of a record type. `Display` is the canonical string form used as storage key.
pub trait Pk: Key + Ord + fmt::Display {
    /// Every key component is set.
    fn full(&self) -> bool;

    /// Filter document matching the stored row(s) of this key.
    fn fetch_filter(&self) -> Document;

    fn from_parts(parts: &[KeyPart]) -> Result<Self, AppError>;
}

/// Object-safe view of a [`Pk`], used across the driver boundary.
pub trait PkRef: fmt::Display + fmt::Debug + Send + Sync {
    fn is_full(&self) -> bool;
    fn filter(&self) -> Document;
    fn routing_hash(&self) -> u64;
}

impl<P: Pk> PkRef for P {
    fn is_full(&self) -> bool {
        self.full()
    }
    fn filter(&self) -> Document {
        self.fetch_filter()
    }
    fn routing_hash(&self) -> u64 {
        self.hash_group()
    }
}

#[inline]
pub fn hash_bytes(bytes: &[u8]) -> u64 {
    xxh3_64(bytes)
}

#[inline]
pub fn hash_i64(v: i64) -> u64 {
    v as u64
}

/// Shard of `hash` among `n` shards, `n` a power of two.
#[inline]
pub fn group_of(hash: u64, n: usize) -> usize {
    debug_assert!(n.is_power_of_two(), "group count must be a power of two");
    (hash & (n as u64 - 1)) as usize
}

/// Checks the arity of raw key parts before a generated `from_parts` decodes them.
pub fn expect_parts(parts: &[KeyPart], n: usize, name: &str) -> Result<(), AppError> {
    if parts.len() == n {
        Ok(())
    } else {
        Err(AppError::InvalidKey(format!("{name} takes {n} key part(s), got {}", parts.len())))
    }
}
