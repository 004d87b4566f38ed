//! User-defined persistent records: a `Persistent` trait plus a uniform
//! on-media **record body** (object header + field count + an indirected
//! array of field `Oid`s, [`crate::header::RecordHeader`]) so any
//! `#[derive(Persistent)]` struct gets a `traverse`/`release-contents`
//! hook for free, the same way [`crate::list::PersistentList`] does.
//!
//! Resurrecting an arbitrary user class calls for an explicit registration
//! API rather than reflecting over a running process's module table.
//! `Pool::register::<T>()` is that API: a type must be registered on a
//! pool handle before any instance of it can be persisted. Anything
//! unregistered fails with `TypeNotPersistable`, naming the class.
//!
//! Because every record shares the identical on-media shape, the GC and the
//! deallocator never need to dispatch back into `T`'s own code to traverse
//! or release one -- `record_fields`/`release_record_contents` read the
//! field array straight off persistent memory, the same way
//! `PersistentList::traverse` reads its items array. `Pool::register` is
//! therefore a lighter-weight presence check than a true per-type function
//! vtable; see DESIGN.md for the tradeoff.

use crate::cache::{PersistKey, Value};
use crate::codec::{FieldCodec, Persist};
use crate::error::{Error, Result};
use crate::header::{RecordHeader, POBJECT, RECORD_FIELD_ARRAY};
use crate::oid::Oid;
use crate::pool::Pool;

/// Implemented by `#[derive(Persistent)]` structs with named fields whose
/// types all implement [`FieldCodec`].
pub trait Persistent: Sized {
    /// A stable, unique identifier for this class. The derive macro uses
    /// the struct's bare name;
    /// callers with colliding names across modules should implement this
    /// trait by hand with a fully qualified string instead of deriving it.
    fn class_name() -> &'static str;

    /// Persist every field and return its `Oid`, in declaration order.
    fn to_fields(&self, pool: &Pool) -> Result<Vec<Oid>>;

    /// Reconstruct `Self` from field `Oid`s read back off a record body, in
    /// the same declaration order `to_fields` produced them.
    fn from_fields(pool: &Pool, fields: &[Oid]) -> Result<Self>;
}

/// Every `Persistent` type can be persisted, provided its class has been
/// registered on the pool (`Pool::register::<T>()`).
impl<T: Persistent> Persist for T {
    fn persist(&self, pool: &Pool) -> Result<Oid> {
        if !pool.is_registered(T::class_name()) {
            return Err(Error::type_not_persistable(T::class_name()));
        }
        let key = PersistKey::Identity(self as *const T as usize);
        if let Some(oid) = pool.cache_persist_lookup(&key) {
            return Ok(oid);
        }
        let oid = persist_record(pool, self)?;
        pool.cache_insert(oid, Value::Record(oid), Some(key));
        Ok(oid)
    }
}

/// Allocate a record body for `value` and write its persisted field `Oid`s
/// into a freshly allocated [`RECORD_FIELD_ARRAY`]. Must run inside a
/// transaction.
pub fn persist_record<T: Persistent>(pool: &Pool, value: &T) -> Result<Oid> {
    pool.in_transaction(|| {
        let field_oids = value.to_fields(pool)?;
        let type_code = pool.get_type_code(T::class_name())?;

        let fields_array = if field_oids.is_empty() {
            Oid::NULL
        } else {
            let arr = pool
                .pmem()
                .tx_zalloc(field_oids.len() * std::mem::size_of::<Oid>(), RECORD_FIELD_ARRAY)?;
            let ptr = pool.pmem().direct(arr)? as *mut Oid;
            for (i, oid) in field_oids.iter().enumerate() {
                unsafe { std::ptr::write(ptr.add(i), *oid) };
                pool.incref(*oid)?;
            }
            arr
        };

        let oid = pool.pmem().tx_zalloc(RecordHeader::SIZE, POBJECT)?;
        let ptr = pool.pmem().direct(oid)? as *mut RecordHeader;
        unsafe {
            (*ptr).header.refcount = 0;
            (*ptr).header.type_code = type_code;
            (*ptr).field_count = field_oids.len();
            (*ptr).fields = fields_array;
        }
        Ok(oid)
    })
}

/// Resurrect a concrete `T` from a record `Oid` (`Pool::get::<T>`).
pub fn resurrect_record<T: Persistent>(pool: &Pool, oid: Oid) -> Result<T> {
    let fields = record_fields(pool, oid)?;
    T::from_fields(pool, &fields)
}

/// Read a record's field `Oid`s straight off persistent memory -- the
/// generic "traverse" hook for any user record, regardless of `T`. The
/// tracing GC only ever needs outgoing `Oid`s, never the live host value.
pub fn record_fields(pool: &Pool, oid: Oid) -> Result<Vec<Oid>> {
    let ptr = pool.pmem().direct(oid)? as *const RecordHeader;
    let (field_count, fields_array) = unsafe { ((*ptr).field_count, (*ptr).fields) };
    if field_count == 0 {
        return Ok(Vec::new());
    }
    let arr_ptr = pool.pmem().direct(fields_array)? as *const Oid;
    Ok((0..field_count).map(|i| unsafe { *arr_ptr.add(i) }).collect())
}

/// The generic "release-contents" hook: decref every field `Oid` before
/// the record itself is freed.
pub fn release_record_contents(pool: &Pool, oid: Oid) -> Result<()> {
    for field_oid in record_fields(pool, oid)? {
        pool.xdecref(field_oid)?;
    }
    Ok(())
}

/// A helper for field types that are themselves a whole other
/// `#[derive(Persistent)]` record nested by value -- lets one record hold
/// another as a field type without the field itself being `Oid`-shaped at
/// the Rust level.
impl<T: Persistent> FieldCodec for Box<T> {
    fn persist_field(&self, pool: &Pool) -> Result<Oid> {
        Persist::persist(&**self, pool)
    }
    fn resurrect_field(pool: &Pool, oid: Oid) -> Result<Self> {
        Ok(Box::new(resurrect_record(pool, oid)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Persist;
    use crate::error::ErrorKind;
    use crate::pool::Pool;
    use pmemobj_derive::Persistent;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        crate::testutil::scratch("persistent", name)
    }

    #[derive(Persistent, Debug, PartialEq)]
    struct Account {
        name: String,
        cents: i64,
    }

    #[derive(Persistent, Debug, PartialEq)]
    struct Unregistered {
        value: i64,
    }

    #[test]
    fn persisting_an_unregistered_class_is_rejected_by_name() {
        let path = scratch("unregistered");
        let pool = Pool::create(&path, crate::pmem::MIN_POOL_SIZE).unwrap();
        let account = Unregistered { value: 7 };
        let err = pool.in_transaction(|| account.persist(&pool)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeNotPersistable);
        assert!(err.message().contains("Unregistered"));
    }

    #[test]
    fn registered_record_round_trips_through_fields() {
        let path = scratch("roundtrip");
        let pool = Pool::create(&path, crate::pmem::MIN_POOL_SIZE).unwrap();
        pool.register::<Account>();

        let account = Account {
            name: "checking".to_string(),
            cents: 12_345,
        };
        let oid = pool.in_transaction(|| pool.new(&account)).unwrap();
        let back: Account = pool.get(oid).unwrap();
        assert_eq!(back, account);
    }

    #[test]
    fn record_survives_close_and_reopen_as_root() {
        let path = scratch("durability");
        {
            let pool = Pool::create(&path, crate::pmem::MIN_POOL_SIZE).unwrap();
            pool.register::<Account>();
            pool.set_root(&Account {
                name: "savings".to_string(),
                cents: 500,
            })
            .unwrap();
            pool.close();
        }
        let pool = Pool::open(&path).unwrap();
        pool.register::<Account>();
        match pool.root().unwrap() {
            Value::Record(oid) => {
                let account: Account = pool.get(oid).unwrap();
                assert_eq!(account.name, "savings");
                assert_eq!(account.cents, 500);
            }
            other => panic!("expected a record root, found {:?}", other),
        }
    }

    #[test]
    fn releasing_a_record_decrefs_its_field_values() {
        let path = scratch("release");
        let pool = Pool::create(&path, crate::pmem::MIN_POOL_SIZE).unwrap();
        pool.register::<Account>();
        let oid = pool
            .in_transaction(|| {
                pool.new(&Account {
                    name: "temp".to_string(),
                    cents: 1,
                })
            })
            .unwrap();
        let name_oid = record_fields(&pool, oid).unwrap()[0];
        pool.in_transaction(|| {
            pool.incref(oid)?;
            pool.decref(oid)
        })
        .unwrap();
        // the record itself freed its field values on the way down; the
        // name string's OID is no longer a live allocation of `POBJECT` kind
        let mut found = false;
        let mut cur = pool.pmem().first();
        while !cur.is_null() {
            if cur == name_oid {
                found = true;
            }
            cur = pool.pmem().next(cur);
        }
        assert!(!found, "field value should have been freed along with its owning record");
    }
}
