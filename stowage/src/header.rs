use crate::error::AppError;
use crate::field::{Field, FieldSet};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lifecycle {
    #[default]
    Unavailable,
    New,
    Normal,
    Deleted,
}

impl Lifecycle {
    /// Deleted or never stored.
    pub fn is_gone(self) -> bool {
        matches!(self, Lifecycle::Deleted | Lifecycle::Unavailable)
    }
}

const DIRTY: u16 = 1 << 0;
const COMMITTING: u16 = 1 << 1;
const LOAD_COMPLETE: u16 = 1 << 2;
const TMP: u16 = 1 << 3;
const EXPIRED: u16 = 1 << 4;
const READONLY: u16 = 1 << 5;
const MIRROR: u16 = 1 << 6;

/// Change-tracking state embedded in every record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Header {
    lifecycle: Lifecycle,
    flags: u16,
    saving_index: Option<usize>,
    changes: FieldSet,
}

impl Header {
    pub fn new(lifecycle: Lifecycle) -> Self {
        let mut header = Header::default();
        header.init(lifecycle);
        header
    }

    pub fn init(&mut self, lifecycle: Lifecycle) {
        self.lifecycle = lifecycle;
        self.set_flag(DIRTY, lifecycle == Lifecycle::New);
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn changes(&self) -> FieldSet {
        self.changes
    }

    pub fn set_changes(&mut self, changes: FieldSet) {
        self.changes = changes;
    }

    pub fn changed(&self, field: Field) -> bool {
        self.changes.contains(field)
    }

    /// Marks fields as modified. A new record is written whole, so nothing is tracked for it.
    pub fn set_changed(&mut self, fields: &[Field]) -> Result<(), AppError> {
        match self.lifecycle {
            Lifecycle::New => Ok(()),
            Lifecycle::Deleted | Lifecycle::Unavailable => Err(AppError::InvalidLifecycle(self.lifecycle)),
            Lifecycle::Normal => {
                self.changes.add(fields);
                self.set_flag(DIRTY, true);
                Ok(())
            }
        }
    }

    pub fn mark_as_deleted(&mut self) -> bool {
        match self.lifecycle {
            Lifecycle::New => {
                self.lifecycle = Lifecycle::Unavailable;
                self.set_flag(DIRTY, false);
                true
            }
            Lifecycle::Normal => {
                self.lifecycle = Lifecycle::Deleted;
                self.set_flag(DIRTY, true);
                true
            }
            Lifecycle::Deleted | Lifecycle::Unavailable => false,
        }
    }

    /// Folds a later pending change of the same record into this one.
    /// Returns false when this state cannot absorb anything.
    pub fn merge(&mut self, other: &Header) -> bool {
        match self.lifecycle {
            Lifecycle::New => {
                if other.lifecycle.is_gone() {
                    self.lifecycle = Lifecycle::Unavailable;
                }
                true
            }
            Lifecycle::Normal => {
                if other.lifecycle.is_gone() {
                    self.lifecycle = Lifecycle::Deleted;
                } else {
                    self.changes = self.changes.union(other.changes);
                }
                true
            }
            Lifecycle::Deleted | Lifecycle::Unavailable => false,
        }
    }

    /// Enters the committing state and hands back the step that finalizes it.
    pub fn commit(&mut self) -> impl FnOnce(&mut Header) {
        self.set_flag(COMMITTING, true);
        |header: &mut Header| {
            header.lifecycle = match header.lifecycle {
                Lifecycle::New => Lifecycle::Normal,
                Lifecycle::Deleted => Lifecycle::Unavailable,
                other => other,
            };
            header.changes.clear();
            header.set_flag(DIRTY | COMMITTING, false);
        }
    }

    pub fn dirty(&self) -> bool {
        self.has_flag(DIRTY)
    }

    pub fn committing(&self) -> bool {
        self.has_flag(COMMITTING)
    }

    pub fn saving_index(&self) -> Option<usize> {
        self.saving_index
    }

    pub fn set_saving_index(&mut self, index: Option<usize>) {
        self.saving_index = index;
    }

    pub fn loading(&self) -> bool {
        !self.has_flag(LOAD_COMPLETE)
    }

    pub fn load_complete(&mut self) {
        self.set_flag(LOAD_COMPLETE, true);
    }

    pub fn is_tmp(&self) -> bool {
        self.has_flag(TMP)
    }

    pub fn set_tmp(&mut self) {
        self.set_flag(TMP, true);
    }

    pub fn is_expired(&self) -> bool {
        self.has_flag(EXPIRED)
    }

    pub fn set_expired(&mut self) {
        self.set_flag(EXPIRED, true);
    }

    pub fn readonly(&self) -> bool {
        self.has_flag(READONLY)
    }

    pub fn enable_readonly(&mut self) {
        self.set_flag(READONLY, true);
    }

    pub fn enable_write(&mut self) {
        self.set_flag(READONLY, false);
    }

    pub fn is_mirror(&self) -> bool {
        self.has_flag(MIRROR)
    }

    pub fn enable_mirror(&mut self) {
        self.set_flag(MIRROR, true);
    }

    pub fn validate_affinity(&self) -> bool {
        false
    }

    #[inline]
    fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }

    #[inline]
    fn set_flag(&mut self, flag: u16, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }
}
