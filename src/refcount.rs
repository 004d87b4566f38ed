//! Refcount increment/decrement and the cascading deallocator: snapshot
//! the refcount word before touching it, free on transition to zero, and
//! run the container's release-contents hook before calling `tx_free` so
//! outgoing references are decref'd first.

use crate::codec;
use crate::error::{Error, Result};
use crate::header::{ObjectHeader, LIST_TYPE_CODE};
use crate::list::PersistentList;
use crate::oid::Oid;
use crate::persistent;
use crate::pool::Pool;

pub fn incref(pool: &Pool, oid: Oid) -> Result<()> {
    if oid.is_null() {
        return Ok(());
    }
    pool.in_transaction(|| {
        let ptr = pool.pmem().direct(oid)? as *mut u8;
        pool.pmem().tx_add_range_direct(ptr, ObjectHeader::SIZE)?;
        unsafe {
            let header = ObjectHeader::at(ptr);
            (*header).refcount += 1;
        }
        Ok(())
    })
}

pub fn decref(pool: &Pool, oid: Oid) -> Result<()> {
    if oid.is_null() {
        return Ok(());
    }
    pool.in_transaction(|| {
        let ptr = pool.pmem().direct(oid)? as *mut u8;
        pool.pmem().tx_add_range_direct(ptr, ObjectHeader::SIZE)?;
        let remaining = unsafe {
            let header = ObjectHeader::at(ptr);
            if (*header).refcount == 0 {
                return Err(Error::internal(format!(
                    "decref on {:?} with refcount already zero",
                    oid
                )));
            }
            (*header).refcount -= 1;
            (*header).refcount
        };
        if remaining == 0 {
            deallocate(pool, oid)?;
        }
        Ok(())
    })
}

pub fn xdecref(pool: &Pool, oid: Oid) -> Result<()> {
    if oid.is_null() {
        Ok(())
    } else {
        decref(pool, oid)
    }
}

/// Free `oid`'s contents (via its container's release-contents hook, if
/// any) then the allocation itself, and purge it from the cache. If a GC
/// pass has a track-free set active, record the OID there so the GC
/// doesn't try to free it a second time.
pub fn deallocate(pool: &Pool, oid: Oid) -> Result<()> {
    if pool.is_marked_freeing(oid) {
        // Already being torn down further up this same call chain -- a
        // self-referential object decref'ing its own field. Nothing left
        // to do here.
        return Ok(());
    }
    pool.track_free(oid);
    let result = pool.in_transaction(|| {
        let type_code = codec::read_type_code(pool, oid)?;
        release_contents(pool, oid, type_code)?;
        pool.pmem().tx_free(oid)?;
        pool.cache_purge(oid);
        Ok(())
    });
    pool.untrack_free(oid);
    result
}

/// Decref every outgoing reference a container at `oid` holds, without
/// freeing the container itself -- the "release-contents" hook.
/// Dispatches structurally on type code: lists and user records are the
/// only two container shapes this crate has (`float`/`int`/`str` are
/// never containers).
pub fn release_contents(pool: &Pool, oid: Oid, type_code: usize) -> Result<()> {
    if type_code == LIST_TYPE_CODE {
        PersistentList::attach(oid).release_contents(pool)
    } else if is_record_type_code(pool, type_code)? {
        persistent::release_record_contents(pool, oid)
    } else {
        Ok(())
    }
}

/// The generic traverse hook the GC uses: outgoing `Oid`s a container at
/// `oid` directly references.
pub fn traverse(pool: &Pool, oid: Oid, type_code: usize) -> Result<Vec<Oid>> {
    if type_code == LIST_TYPE_CODE {
        PersistentList::attach(oid).traverse(pool)
    } else if is_record_type_code(pool, type_code)? {
        persistent::record_fields(pool, oid)
    } else {
        Ok(Vec::new())
    }
}

/// Whether `type_code` names a container class (a list or a user record),
/// as opposed to an immutable leaf (`str`/`i64`/`f64`).
pub fn is_container_type_code(pool: &Pool, type_code: usize) -> Result<bool> {
    if type_code == LIST_TYPE_CODE {
        return Ok(true);
    }
    is_record_type_code(pool, type_code)
}

fn is_record_type_code(pool: &Pool, type_code: usize) -> Result<bool> {
    use crate::header::STR_TYPE_CODE;
    use crate::typetable::FLOAT_CLASS;

    if type_code == STR_TYPE_CODE {
        return Ok(false);
    }
    let class = pool.resolve_type_code(type_code)?;
    Ok(class != "i64" && class != FLOAT_CLASS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        crate::testutil::scratch("refcount", name)
    }

    #[test]
    fn incref_decref_and_xdecref_are_no_ops_on_the_null_oid() {
        let path = scratch("null-oid");
        let pool = Pool::create(&path, crate::pmem::MIN_POOL_SIZE).unwrap();
        pool.incref(Oid::NULL).unwrap();
        pool.decref(Oid::NULL).unwrap();
        pool.xdecref(Oid::NULL).unwrap();
    }

    #[test]
    fn incref_then_decref_back_to_zero_frees_the_allocation() {
        let path = scratch("balanced");
        let pool = Pool::create(&path, crate::pmem::MIN_POOL_SIZE).unwrap();
        let oid = pool.in_transaction(|| crate::codec::persist_str(&pool, "owned")).unwrap();
        pool.in_transaction(|| pool.incref(oid)).unwrap();

        let mut found = false;
        let mut cur = pool.pmem().first();
        while !cur.is_null() {
            if cur == oid {
                found = true;
            }
            cur = pool.pmem().next(cur);
        }
        assert!(found, "allocation should still be live with refcount 1");

        pool.in_transaction(|| pool.decref(oid)).unwrap();
        found = false;
        let mut cur = pool.pmem().first();
        while !cur.is_null() {
            if cur == oid {
                found = true;
            }
            cur = pool.pmem().next(cur);
        }
        assert!(!found, "decref to zero should have freed the allocation");
    }

    #[test]
    fn decref_below_zero_is_rejected_rather_than_underflowing() {
        let path = scratch("underflow");
        let pool = Pool::create(&path, crate::pmem::MIN_POOL_SIZE).unwrap();
        let oid = pool.in_transaction(|| crate::codec::persist_str(&pool, "fresh")).unwrap();
        // freshly persisted, never incref'd -- refcount is already zero
        let err = pool.in_transaction(|| pool.decref(oid)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);
    }
}
