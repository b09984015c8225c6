use serde::{Deserialize, Serialize};
use std::fmt;

/// Code of one tracked scalar attribute.
pub type Field = u8;

/// Upper bound of tracked fields per record type.
pub const MAX_FIELDS: usize = 64;

/// Bitmask over [`Field`] codes.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FieldSet(u64);

#[inline]
fn bit(field: Field) -> u64 {
    assert!((field as usize) < MAX_FIELDS, "field code {} exceeds capacity of {}", field, MAX_FIELDS);
    1u64 << field
}

impl FieldSet {
    pub const EMPTY: FieldSet = FieldSet(0);
    pub const ALL: FieldSet = FieldSet(u64::MAX);

    pub fn of(fields: &[Field]) -> Self {
        let mut fs = FieldSet::EMPTY;
        fs.add(fields);
        fs
    }

    pub const fn from_bits(bits: u64) -> Self {
        FieldSet(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn add(&mut self, fields: &[Field]) -> &mut Self {
        for f in fields {
            self.0 |= bit(*f);
        }
        self
    }

    pub fn del(&mut self, fields: &[Field]) -> &mut Self {
        for f in fields {
            self.0 &= !bit(*f);
        }
        self
    }

    pub fn union(self, other: FieldSet) -> FieldSet {
        FieldSet(self.0 | other.0)
    }

    pub fn intersect(self, other: FieldSet) -> FieldSet {
        FieldSet(self.0 & other.0)
    }

    pub fn subtract(self, other: FieldSet) -> FieldSet {
        FieldSet(self.0 & !other.0)
    }

    pub fn contains(self, field: Field) -> bool {
        self.0 & bit(field) != 0
    }

    /// True when every field of `other` is present.
    pub fn contains_all(self, other: FieldSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn contains_any(self, other: FieldSet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn contains_exact(self, other: FieldSet) -> bool {
        self.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn iter(self) -> impl Iterator<Item = Field> {
        let bits = self.0;
        (0..MAX_FIELDS as u8).filter(move |f| bits & (1u64 << f) != 0)
    }
}

impl fmt::Debug for FieldSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<Field> for FieldSet {
    fn from_iter<I: IntoIterator<Item = Field>>(iter: I) -> Self {
        let mut fs = FieldSet::EMPTY;
        for f in iter {
            fs.0 |= bit(f);
        }
        fs
    }
}

/// Static metadata of one record field as emitted by the entity generator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FieldDesc {
    pub code: Field,
    pub name: &'static str,
    /// Part of the primary key, written with every partial update.
    pub key: bool,
    /// Lives only in memory, never written to storage.
    pub runtime: bool,
}

impl FieldDesc {
    pub const fn new(code: Field, name: &'static str) -> Self {
        FieldDesc { code, name, key: false, runtime: false }
    }

    pub const fn key(code: Field, name: &'static str) -> Self {
        FieldDesc { code, name, key: true, runtime: false }
    }

    pub const fn runtime(code: Field, name: &'static str) -> Self {
        FieldDesc { code, name, key: false, runtime: true }
    }
}

/// Persisted subset of a field table.
pub fn persisted(fields: &[FieldDesc]) -> FieldSet {
    fields.iter().filter(|d| !d.runtime).map(|d| d.code).collect()
}

#[macro_export]
macro_rules! field_set {
    () => { $crate::field::FieldSet::EMPTY };
    ($($field:expr),+ $(,)?) => { $crate::field::FieldSet::of(&[$($field),+]) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_del_and_contains() {
        let mut fs = FieldSet::EMPTY;
        fs.add(&[0, 3, 63]);
        assert!(fs.contains(0));
        assert!(fs.contains(3));
        assert!(fs.contains(63));
        assert!(!fs.contains(1));
        fs.del(&[3]);
        assert!(!fs.contains(3));
        assert_eq!(fs.len(), 2);

        let before = field_set![5, 7];
        let mut round = before;
        round.add(&[12, 40]);
        round.del(&[12, 40]);
        assert_eq!(round, before);
    }

    #[test]
    fn set_algebra() {
        let a = field_set![1, 2, 3];
        let b = field_set![3, 4];
        assert_eq!(a.union(b), field_set![1, 2, 3, 4]);
        assert_eq!(a.intersect(b), field_set![3]);
        assert_eq!(a.subtract(b), field_set![1, 2]);
        assert!(a.contains_any(b));
        assert!(!a.contains_all(b));
        assert!(a.union(b).contains_all(b));
        assert!(a.contains_exact(field_set![3, 2, 1]));
        assert!(field_set![].is_empty());
    }

    #[test]
    fn iterates_member_codes_in_order() {
        let fs = field_set![9, 2, 40];
        assert_eq!(fs.iter().collect::<Vec<_>>(), vec![2, 9, 40]);
        assert_eq!(fs.iter().collect::<FieldSet>(), fs);
        assert_eq!(FieldSet::ALL.len(), MAX_FIELDS);
    }

    #[test]
    #[should_panic(expected = "exceeds capacity")]
    fn field_beyond_capacity_panics() {
        FieldSet::EMPTY.add(&[64]);
    }

    #[test]
    fn persisted_skips_runtime_fields() {
        let fields = [FieldDesc::key(0, "id"), FieldDesc::new(1, "name"), FieldDesc::runtime(2, "session")];
        assert_eq!(persisted(&fields), field_set![0, 1]);
    }
}
