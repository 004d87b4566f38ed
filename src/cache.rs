//! An in-memory bidirectional association between live OIDs and resurrected
//! host values, with transactional staging so an aborted transaction can
//! discard everything it resurrected or persisted without touching the
//! committed view.
//!
//! Two keying strategies on the persist side: immutable host values
//! (`int`, `float`, `str`) share one persistent copy keyed by value;
//! mutable values get an identity key so two distinct instances never
//! collapse into one persistent copy. In this crate the only "mutable
//! value" that ever reaches the codec before already having an `Oid` is a
//! user-defined [`crate::persistent::Persistent`] record being persisted
//! for the first time (`PersistentList` is always already a handle around
//! an `Oid` by construction, so it always takes the "already persistent"
//! fast path in `codec::persist` and never needs a cache key at all).

use std::cell::RefCell;
use std::collections::HashMap;

use crate::oid::Oid;

/// A resurrected host value. Unregistered user classes (and the reserved
/// list class) resurrect to a bare tagged `Oid`; the caller uses
/// `Pool::get::<T>` when it knows the concrete type, since Rust has no
/// runtime class objects to dispatch on.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Nothing,
    Int(i64),
    Float(f64),
    Str(String),
    List(Oid),
    Record(Oid),
}

impl Value {
    pub fn as_oid(&self) -> Oid {
        match self {
            Value::Nothing => Oid::NULL,
            Value::List(oid) | Value::Record(oid) => *oid,
            _ => Oid::NULL,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

/// Key used to dedupe persisted immutable values, or to identify a
/// not-yet-persisted mutable host value for the lifetime of one persist
/// call; the stable id must outlive all references to the object within
/// the current transaction.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum PersistKey {
    Int(i64),
    FloatBits(u64),
    Str(String),
    Identity(usize),
}

#[derive(Default)]
struct CacheMaps {
    resurrect: HashMap<Oid, Value>,
    persist: HashMap<PersistKey, Oid>,
}

/// Bidirectional OID <-> host-value cache with transactional staging.
pub struct ObjectCache {
    committed: RefCell<CacheMaps>,
    staged: RefCell<CacheMaps>,
}

impl ObjectCache {
    pub fn new() -> Self {
        ObjectCache {
            committed: RefCell::new(CacheMaps::default()),
            staged: RefCell::new(CacheMaps::default()),
        }
    }

    /// `OID_NULL` always resurrects to the nothing value.
    pub fn resurrect_lookup(&self, oid: Oid) -> Option<Value> {
        if oid.is_null() {
            return Some(Value::Nothing);
        }
        if let Some(v) = self.staged.borrow().resurrect.get(&oid) {
            return Some(v.clone());
        }
        self.committed.borrow().resurrect.get(&oid).cloned()
    }

    pub fn persist_lookup(&self, key: &PersistKey) -> Option<Oid> {
        if let Some(oid) = self.staged.borrow().persist.get(key) {
            return Some(*oid);
        }
        self.committed.borrow().persist.get(key).copied()
    }

    /// Record a fresh resurrection/persist pair in the staging maps. Every
    /// write made inside an unfinished transaction goes here first;
    /// `promote`/`discard_staged` decide its fate.
    pub fn insert_staged(&self, oid: Oid, value: Value, key: Option<PersistKey>) {
        if oid.is_null() {
            return;
        }
        let mut staged = self.staged.borrow_mut();
        staged.resurrect.insert(oid, value);
        if let Some(key) = key {
            staged.persist.insert(key, oid);
        }
    }

    /// Record a resurrection/persist pair straight into the committed maps,
    /// bypassing staging. Used when the pool has no transaction open at all
    /// (e.g. a plain read of an already-committed object): there is no
    /// pending commit/abort to promote or discard it, so staging it would
    /// just leak staged entries that nothing ever reclaims.
    pub fn insert_committed(&self, oid: Oid, value: Value, key: Option<PersistKey>) {
        if oid.is_null() {
            return;
        }
        let mut committed = self.committed.borrow_mut();
        committed.resurrect.insert(oid, value);
        if let Some(key) = key {
            committed.persist.insert(key, oid);
        }
    }

    /// Merge staged entries into the committed maps. Called once the
    /// outermost transaction commits.
    pub fn promote(&self) {
        let mut staged = self.staged.borrow_mut();
        let mut committed = self.committed.borrow_mut();
        for (oid, value) in staged.resurrect.drain() {
            committed.resurrect.insert(oid, value);
        }
        for (key, oid) in staged.persist.drain() {
            committed.persist.insert(key, oid);
        }
    }

    /// Drop everything staged. Called when the outermost transaction
    /// aborts.
    pub fn discard_staged(&self) {
        let mut staged = self.staged.borrow_mut();
        staged.resurrect.clear();
        staged.persist.clear();
    }

    /// Purge an OID from both maps. Run by the deallocator once an object
    /// is freed.
    pub fn purge(&self, oid: Oid) {
        if oid.is_null() {
            return;
        }
        let mut committed = self.committed.borrow_mut();
        committed.resurrect.remove(&oid);
        committed.persist.retain(|_, v| *v != oid);
        let mut staged = self.staged.borrow_mut();
        staged.resurrect.remove(&oid);
        staged.persist.retain(|_, v| *v != oid);
    }
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new()
    }
}
