//! The Pool facade: the single entry point an application talks to. Every
//! other module in this crate is an internal collaborator `Pool` drives;
//! nothing outside this file ever touches [`crate::pmem::Pmem`] or
//! [`crate::cache::ObjectCache`] directly.
//!
//! One root record holds the type table and the user's root object, a
//! transaction context manager serializes mutation, and a GC pass runs
//! once at open. All pool operations effectively acquire a re-entrant
//! pool-level lock -- this falls out for free because every sub-
//! collaborator already carries its own interior mutability
//! (`RefCell`/`Cell`), and `Pmem`'s raw `*mut u8` base pointer makes `Pool`
//! `!Send`/`!Sync` automatically, so a handle can only ever be driven by
//! the thread that holds it.

use std::cell::RefCell;
use std::collections::HashSet;
use std::path::Path;

use crate::cache::{ObjectCache, PersistKey, Value};
use crate::codec::{self, Persist};
use crate::error::{Error, Result};
use crate::gc::{self, GcReport};
use crate::header::RootRecord;
use crate::oid::Oid;
use crate::persistent::{self, Persistent};
use crate::pmem::Pmem;
use crate::refcount;
use crate::txn::{Transaction, TransactionStack};
use crate::typetable::TypeTable;

/// How to resolve a pool path against what's already on disk.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenFlag {
    /// `"w"`: the pool file must already exist.
    Open,
    /// `"x"`: the pool file must not already exist.
    Create,
    /// `"c"`: open it if present, otherwise create it.
    CreateOrOpen,
    /// `"r"`: read-only pools aren't something this crate's allocator can
    /// support (every read may need to extend the type table), so this
    /// flag is accepted only to be rejected with `InvalidArgument`.
    ReadOnly,
}

/// A live handle onto one memory-mapped pool file.
pub struct Pool {
    pmem: Pmem,
    cache: ObjectCache,
    txn_stack: TransactionStack,
    type_table: RefCell<TypeTable>,
    registered: RefCell<HashSet<&'static str>>,
    freeing: RefCell<HashSet<Oid>>,
}

impl Pool {
    /// Create a fresh pool file at `path`, sized `size` bytes, with mode
    /// `0o666`.
    pub fn create(path: &Path, size: u64) -> Result<Pool> {
        Pool::create_with_mode(path, size, 0o666)
    }

    pub fn create_with_mode(path: &Path, size: u64, mode: u32) -> Result<Pool> {
        let pmem = Pmem::create(path, size, mode)?;
        let pool = Pool {
            pmem,
            cache: ObjectCache::new(),
            txn_stack: TransactionStack::new(),
            type_table: RefCell::new(TypeTable::attach(Oid::NULL)),
            registered: RefCell::new(HashSet::new()),
            freeing: RefCell::new(HashSet::new()),
        };
        pool.in_transaction(|| {
            let root_slot = pool.pmem.root(RootRecord::SIZE)?;
            let table = TypeTable::create(&pool)?;
            *pool.type_table.borrow_mut() = TypeTable::attach(table.table_oid());

            let record = RootRecord {
                type_table: table.table_oid(),
                root_object: Oid::NULL,
            };
            let ptr = pool.pmem.direct(root_slot)? as *mut RootRecord;
            pool.pmem.tx_add_range_direct(ptr as *mut u8, RootRecord::SIZE)?;
            unsafe { std::ptr::write(ptr, record) };
            Ok(())
        })?;
        crate::trace!(Green, "pool", "created {:?}", path);
        Ok(pool)
    }

    /// Attach to an existing pool file, then run one GC pass.
    /// Unconditional, once, at open -- not on a timer, not skippable.
    pub fn open(path: &Path) -> Result<Pool> {
        let pmem = Pmem::open(path)?;
        let root_slot = pmem.root(0)?;
        let ptr = pmem.direct(root_slot)? as *const RootRecord;
        let record = unsafe { std::ptr::read(ptr) };
        if record.type_table.is_null() {
            return Err(Error::pool_not_initialized(format!(
                "pool {} never finished initialization: type table is unset",
                path.display()
            )));
        }
        let pool = Pool {
            pmem,
            cache: ObjectCache::new(),
            txn_stack: TransactionStack::new(),
            type_table: RefCell::new(TypeTable::attach(record.type_table)),
            registered: RefCell::new(HashSet::new()),
            freeing: RefCell::new(HashSet::new()),
        };
        let report = gc::collect(&pool)?;
        crate::trace!(
            Cyan,
            "pool",
            "opened {:?}, gc reclaimed {} object(s)",
            path,
            report.freed_count()
        );
        Ok(pool)
    }

    /// Resolve `flag` against whether `path` already exists.
    pub fn open_with_flag(path: &Path, flag: OpenFlag, size: u64) -> Result<Pool> {
        match flag {
            OpenFlag::Open => {
                if !path.exists() {
                    return Err(Error::invalid_argument(format!(
                        "pool file {} does not exist",
                        path.display()
                    )));
                }
                Pool::open(path)
            }
            OpenFlag::Create => {
                if path.exists() {
                    return Err(Error::invalid_argument(format!(
                        "pool file {} already exists",
                        path.display()
                    )));
                }
                Pool::create(path, size)
            }
            OpenFlag::CreateOrOpen => {
                if path.exists() {
                    Pool::open(path)
                } else {
                    Pool::create(path, size)
                }
            }
            OpenFlag::ReadOnly => Err(Error::invalid_argument(
                "read-only pools are not supported",
            )),
        }
    }

    pub fn close(&self) {
        self.pmem.close();
    }

    // ---- transactions ---------------------------------------------------

    /// Run `f` inside its own transaction level: commit on `Ok`, abort on
    /// `Err` or panic.
    pub fn in_transaction<R>(&self, f: impl FnOnce() -> Result<R>) -> Result<R> {
        self.txn_stack.scoped(&self.pmem, &self.cache, |_txn| f())
    }

    /// Explicit `begin()`, for callers that need a transaction open across
    /// several calls rather than one scoped closure.
    pub fn begin(&self) -> Transaction {
        self.txn_stack.begin(&self.pmem)
    }

    pub fn commit(&self) -> Result<()> {
        self.txn_stack.commit(&self.pmem, &self.cache)
    }

    pub fn abort(&self) -> Result<()> {
        self.txn_stack.abort(&self.pmem, &self.cache, crate::error::ERRNO_CANCELED)
    }

    pub fn in_transaction_depth(&self) -> usize {
        self.txn_stack.depth()
    }

    // ---- low-level accessors, used by codec/list/gc/refcount -----------

    pub fn pmem(&self) -> &Pmem {
        &self.pmem
    }

    pub fn get_type_code(&self, class: &str) -> Result<usize> {
        self.type_table.borrow().get_code(self, class)
    }

    pub fn resolve_type_code(&self, code: usize) -> Result<String> {
        self.type_table.borrow().resolve_code(self, code)
    }

    pub fn type_table_oid(&self) -> Oid {
        self.type_table.borrow().table_oid()
    }

    pub fn incref(&self, oid: Oid) -> Result<()> {
        refcount::incref(self, oid)
    }

    pub fn decref(&self, oid: Oid) -> Result<()> {
        refcount::decref(self, oid)
    }

    pub fn xdecref(&self, oid: Oid) -> Result<()> {
        refcount::xdecref(self, oid)
    }

    /// Resurrect `oid` to a host [`Value`], consulting the cache first.
    pub fn resurrect(&self, oid: Oid) -> Result<Value> {
        if let Some(value) = self.cache.resurrect_lookup(oid) {
            return Ok(value);
        }
        let value = codec::resurrect_dispatch(self, oid)?;
        self.cache_insert(oid, value.clone(), None);
        Ok(value)
    }

    pub fn cache_persist_lookup(&self, key: &PersistKey) -> Option<Oid> {
        self.cache.persist_lookup(key)
    }

    /// Record a fresh resurrect/persist pair, staged if a transaction is
    /// open so an abort can discard it, committed directly otherwise.
    pub fn cache_insert(&self, oid: Oid, value: Value, key: Option<PersistKey>) {
        if self.txn_stack.depth() > 0 {
            self.cache.insert_staged(oid, value, key);
        } else {
            self.cache.insert_committed(oid, value, key);
        }
    }

    pub fn cache_purge(&self, oid: Oid) {
        self.cache.purge(oid);
    }

    /// Mark `oid` as mid-deallocation so a self-referential object
    /// doesn't recurse into freeing itself a second time.
    pub fn track_free(&self, oid: Oid) {
        self.freeing.borrow_mut().insert(oid);
    }

    pub fn is_marked_freeing(&self, oid: Oid) -> bool {
        self.freeing.borrow().contains(&oid)
    }

    pub fn untrack_free(&self, oid: Oid) {
        self.freeing.borrow_mut().remove(&oid);
    }

    // ---- user-defined persistent records --------------------------------

    /// Make `T` persistable on this handle. Anything not registered fails
    /// with `TypeNotPersistable`.
    pub fn register<T: Persistent>(&self) {
        self.registered.borrow_mut().insert(T::class_name());
    }

    pub fn is_registered(&self, class: &str) -> bool {
        self.registered.borrow().contains(class)
    }

    pub fn new<T: Persistent>(&self, value: &T) -> Result<Oid> {
        Persist::persist(value, self)
    }

    pub fn get<T: Persistent>(&self, oid: Oid) -> Result<T> {
        persistent::resurrect_record(self, oid)
    }

    // ---- root -----------------------------------------------------------

    fn root_record(&self) -> Result<RootRecord> {
        let root_slot = self.pmem.root(0)?;
        let ptr = self.pmem.direct(root_slot)? as *const RootRecord;
        Ok(unsafe { std::ptr::read(ptr) })
    }

    pub fn root_object_oid(&self) -> Result<Oid> {
        Ok(self.root_record()?.root_object)
    }

    /// The pool's root value, or [`Value::Nothing`] if none has been set
    /// yet.
    pub fn root(&self) -> Result<Value> {
        let oid = self.root_object_oid()?;
        self.resurrect(oid)
    }

    /// Persist `value` and make it the pool's root, decref'ing whatever
    /// was there before.
    pub fn set_root(&self, value: &impl Persist) -> Result<()> {
        self.in_transaction(|| {
            let new_oid = value.persist(self)?;
            self.incref(new_oid)?;
            let root_slot = self.pmem.root(RootRecord::SIZE)?;
            let ptr = self.pmem.direct(root_slot)? as *mut RootRecord;
            let old_oid = unsafe { (*ptr).root_object };
            self.pmem.tx_add_range_direct(ptr as *mut u8, RootRecord::SIZE)?;
            unsafe { (*ptr).root_object = new_oid };
            self.xdecref(old_oid)?;
            Ok(())
        })
    }

    // ---- garbage collection ----------------------------------------------

    /// Run one collection pass over this pool, reclaiming any reference
    /// cycle the refcounting deallocator couldn't reach.
    pub fn gc(&self) -> Result<GcReport> {
        gc::collect(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::list::PersistentList;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        crate::testutil::scratch("pool", name)
    }

    #[test]
    fn create_then_reopen_preserves_root() {
        let path = scratch("root-roundtrip");
        {
            let pool = Pool::create(&path, crate::pmem::MIN_POOL_SIZE).unwrap();
            pool.set_root(&"hello".to_string()).unwrap();
            pool.close();
        }
        let pool = Pool::open(&path).unwrap();
        assert_eq!(pool.root().unwrap(), Value::Str("hello".to_string()));
    }

    #[test]
    fn open_rejects_a_pool_whose_init_never_linked_the_type_table() {
        let path = scratch("uninitialized");
        {
            // Bypass `Pool::create` to leave the root record's type-table
            // slot null, as a crash between `tx_zalloc`-ing the table and
            // writing the root record would.
            let pmem = Pmem::create(&path, crate::pmem::MIN_POOL_SIZE, 0o666).unwrap();
            let root_slot = pmem.root(RootRecord::SIZE).unwrap();
            pmem.tx_begin();
            let ptr = pmem.direct(root_slot).unwrap() as *mut RootRecord;
            pmem.tx_add_range_direct(ptr as *mut u8, RootRecord::SIZE).unwrap();
            unsafe {
                std::ptr::write(
                    ptr,
                    RootRecord {
                        type_table: Oid::NULL,
                        root_object: Oid::NULL,
                    },
                )
            };
            pmem.tx_commit().unwrap();
            pmem.close();
        }
        let err = Pool::open(&path).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::PoolNotInitialized);
    }

    #[test]
    fn open_flag_create_rejects_existing_file() {
        let path = scratch("flag-create");
        Pool::create(&path, crate::pmem::MIN_POOL_SIZE).unwrap();
        let err = Pool::open_with_flag(&path, OpenFlag::Create, crate::pmem::MIN_POOL_SIZE)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn open_flag_open_rejects_missing_file() {
        let path = scratch("flag-open-missing");
        let err = Pool::open_with_flag(&path, OpenFlag::Open, crate::pmem::MIN_POOL_SIZE)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn open_flag_read_only_is_rejected() {
        let path = scratch("flag-readonly");
        let err = Pool::open_with_flag(&path, OpenFlag::ReadOnly, crate::pmem::MIN_POOL_SIZE)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn list_roundtrips_through_root() {
        let path = scratch("list-root");
        let pool = Pool::create(&path, crate::pmem::MIN_POOL_SIZE).unwrap();
        let list = pool
            .in_transaction(|| {
                let list = PersistentList::new(&pool)?;
                list.append(&pool, &1i64)?;
                list.append(&pool, &2i64)?;
                list.append(&pool, &"three".to_string())?;
                Ok(list)
            })
            .unwrap();
        assert_eq!(list.len(&pool).unwrap(), 3);
        assert_eq!(list.get(&pool, 0).unwrap(), Value::Int(1));
        assert_eq!(list.get(&pool, -1).unwrap(), Value::Str("three".to_string()));
    }

    #[test]
    fn gc_reclaims_a_self_referential_cycle() {
        let path = scratch("gc-cycle");
        let pool = Pool::create(&path, crate::pmem::MIN_POOL_SIZE).unwrap();

        let orphan = pool
            .in_transaction(|| {
                let list = PersistentList::new(&pool)?;
                list.append(&pool, &list)?;
                Ok(list)
            })
            .unwrap();
        let _ = orphan; // unreachable from the root, refcount held up by itself

        let before = pool.gc().unwrap();
        assert!(before.freed_count() >= 1);
        let after = pool.gc().unwrap();
        assert_eq!(after.freed_count(), 0);
    }
}
