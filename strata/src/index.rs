//! The capability set an ordered index offers to the engine.

use crate::error::{Result, StrataError};
use crate::wal::Action;
use crate::{Key, Value};

pub trait Index {
    fn find(&self, key: Key) -> Result<Option<Value>>;

    /// Fails with `DuplicateKey` if `key` is present.
    fn insert(&self, key: Key, value: Value) -> Result<()>;

    /// Fails with `KeyNotFound` if `key` is absent; returns the previous value.
    fn update(&self, key: Key, value: Value) -> Result<Value>;

    /// No-op for an absent key; returns whether an entry was removed.
    fn delete(&self, key: Key) -> Result<bool>;

    /// Inclusive on both ends.
    fn scan_range(&self, lo: Key, hi: Key) -> Result<Vec<(Key, Value)>>;
}

/// Brings `key` to the after-image of `action` regardless of its current
/// state: inserts over existing keys update, updates of absent keys insert.
pub fn reapply<I: Index>(index: &I, action: Action, key: Key, value: Option<Value>) -> Result<()> {
    match (action, value) {
        (Action::Delete, _) => {
            index.delete(key)?;
            Ok(())
        }
        (Action::Insert | Action::Update, Some(value)) => match index.insert(key, value) {
            Err(e) if e.is_replay_conflict() => index.update(key, value).map(|_| ()),
            other => other,
        },
        (action, None) => Err(StrataError::RecoveryInconsistency(format!(
            "{action:?} of key {key} carries no new value"
        ))),
    }
}
