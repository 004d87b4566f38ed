//! The only mutable container this crate provides, and the one the type
//! table itself is stored as.
//!
//! The over-allocation policy, the insert/delitem/setitem shift-and-
//! snapshot sequencing, and the traverse/substructures/release-contents
//! hooks all follow the same contract: every mutating accessor snapshots
//! the bytes it's about to touch before writing through them.

use crate::cache::Value;
use crate::codec::Persist;
use crate::error::{Error, Result};
use crate::header::{ListBody, LIST_PTR_ARRAY, LIST_TYPE_CODE, POBJECT};
use crate::oid::Oid;
use crate::pool::Pool;
use crate::typetable::LIST_CLASS;

const OID_SIZE: usize = std::mem::size_of::<Oid>();

/// A handle onto a list stored entirely in persistent memory. Cheap to
/// copy -- it's just the list body's `Oid` -- and every method takes the
/// owning `Pool` explicitly, threading it through every mutating call the
/// way a journal handle would be threaded.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PersistentList {
    oid: Oid,
}

impl PersistentList {
    /// Wrap an existing list body's `Oid`. Does not validate that `oid`
    /// actually points at a list; callers get that guarantee from having
    /// resurrected a [`Value::List`] in the first place.
    pub fn attach(oid: Oid) -> PersistentList {
        PersistentList { oid }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// Allocate a new, empty list body.
    pub fn new(pool: &Pool) -> Result<PersistentList> {
        pool.in_transaction(|| {
            let type_code = pool.get_type_code(LIST_CLASS)?;
            let oid = pool.pmem().tx_zalloc(ListBody::SIZE, POBJECT)?;
            let ptr = pool.pmem().direct(oid)? as *mut ListBody;
            unsafe {
                (*ptr).var.header.refcount = 0;
                (*ptr).var.header.type_code = type_code;
                (*ptr).var.size = 0;
                (*ptr).items = Oid::NULL;
                (*ptr).allocated = 0;
            }
            Ok(PersistentList { oid })
        })
    }

    /// Allocate a new list pre-filled with `initial`'s elements, in order.
    pub fn from_iter<'a, V: Persist + 'a>(
        pool: &Pool,
        initial: impl IntoIterator<Item = &'a V>,
    ) -> Result<PersistentList> {
        pool.in_transaction(|| {
            let list = PersistentList::new(pool)?;
            for v in initial {
                list.append(pool, v)?;
            }
            Ok(list)
        })
    }

    fn body(&self, pool: &Pool) -> Result<*mut ListBody> {
        Ok(pool.pmem().direct(self.oid)? as *mut ListBody)
    }

    pub fn len(&self, pool: &Pool) -> Result<usize> {
        let body = self.body(pool)?;
        Ok(unsafe { (*body).var.size })
    }

    pub fn is_empty(&self, pool: &Pool) -> Result<bool> {
        Ok(self.len(pool)? == 0)
    }

    fn items_ptr(&self, pool: &Pool) -> Result<*mut Oid> {
        let body = self.body(pool)?;
        let items_oid = unsafe { (*body).items };
        if items_oid.is_null() {
            return Ok(std::ptr::null_mut());
        }
        Ok(pool.pmem().direct(items_oid)? as *mut Oid)
    }

    /// Normalize a possibly-negative index: negative counts from the end,
    /// anything still out of `[0, size)` is an error.
    fn normalize_index(&self, pool: &Pool, index: i64) -> Result<usize> {
        let size = self.len(pool)? as i64;
        let mut i = index;
        if i < 0 {
            i += size;
        }
        if i < 0 || i >= size {
            return Err(Error::index_out_of_range(index));
        }
        Ok(i as usize)
    }

    pub fn get(&self, pool: &Pool, index: i64) -> Result<Value> {
        let i = self.normalize_index(pool, index)?;
        let items = self.items_ptr(pool)?;
        let oid = unsafe { *items.add(i) };
        pool.resurrect(oid)
    }

    /// CPython-style over-allocation: shrinking within
    /// `[allocated/2, allocated]` reuses the existing
    /// array; anything else reallocs to `(newsize>>3) + (3|6) + newsize`,
    /// or to zero capacity when `newsize == 0`.
    fn resize(&self, pool: &Pool, newsize: usize) -> Result<()> {
        let body = self.body(pool)?;
        let allocated = unsafe { (*body).allocated };
        if allocated >= newsize && newsize >= allocated / 2 {
            pool.pmem()
                .tx_add_range_direct(body as *mut u8, ListBody::SIZE)?;
            unsafe { (*body).var.size = newsize };
            return Ok(());
        }
        let new_allocated = if newsize == 0 {
            0
        } else {
            (newsize >> 3) + if newsize < 9 { 3 } else { 6 } + newsize
        };
        let items_oid = unsafe { (*body).items };
        let new_items = if items_oid.is_null() {
            pool.pmem()
                .tx_zalloc(new_allocated * OID_SIZE, LIST_PTR_ARRAY)?
        } else {
            pool.pmem()
                .tx_zrealloc(items_oid, new_allocated * OID_SIZE, LIST_PTR_ARRAY)?
        };
        pool.pmem()
            .tx_add_range_direct(body as *mut u8, ListBody::SIZE)?;
        unsafe {
            (*body).items = new_items;
            (*body).allocated = new_allocated;
            (*body).var.size = newsize;
        }
        Ok(())
    }

    /// Insert `value` at `index`, clamped into `[0, len]` after normalizing
    /// negative indices.
    pub fn insert<V: Persist + ?Sized>(&self, pool: &Pool, index: i64, value: &V) -> Result<()> {
        pool.in_transaction(|| {
            let size = self.len(pool)?;
            self.resize(pool, size + 1)?;
            let mut i = index;
            if i < 0 {
                i += size as i64;
                if i < 0 {
                    i = 0;
                }
            }
            if i > size as i64 {
                i = size as i64;
            }
            let i = i as usize;

            let items = self.items_ptr(pool)?;
            let tail_bytes = (size + 1 - i) * OID_SIZE;
            pool.pmem()
                .tx_add_range_direct(unsafe { items.add(i) } as *mut u8, tail_bytes)?;
            let mut k = size;
            while k > i {
                unsafe { *items.add(k) = *items.add(k - 1) };
                k -= 1;
            }
            let v_oid = value.persist(pool)?;
            pool.incref(v_oid)?;
            unsafe { *items.add(i) = v_oid };
            Ok(())
        })
    }

    pub fn append<V: Persist + ?Sized>(&self, pool: &Pool, value: &V) -> Result<()> {
        let size = self.len(pool)? as i64;
        self.insert(pool, size, value)
    }

    pub fn set<V: Persist + ?Sized>(&self, pool: &Pool, index: i64, value: &V) -> Result<()> {
        pool.in_transaction(|| {
            let i = self.normalize_index(pool, index)?;
            let items = self.items_ptr(pool)?;
            let v_oid = value.persist(pool)?;
            pool.pmem()
                .tx_add_range_direct(unsafe { items.add(i) } as *mut u8, OID_SIZE)?;
            let old = unsafe { *items.add(i) };
            unsafe { *items.add(i) = v_oid };
            pool.incref(v_oid)?;
            pool.xdecref(old)?;
            Ok(())
        })
    }

    pub fn del(&self, pool: &Pool, index: i64) -> Result<()> {
        pool.in_transaction(|| {
            let i = self.normalize_index(pool, index)?;
            let size = self.len(pool)?;
            let items = self.items_ptr(pool)?;
            let tail_bytes = (size - i) * OID_SIZE;
            pool.pmem()
                .tx_add_range_direct(unsafe { items.add(i) } as *mut u8, tail_bytes)?;
            let old = unsafe { *items.add(i) };
            pool.decref(old)?;
            let mut k = i;
            while k < size - 1 {
                unsafe { *items.add(k) = *items.add(k + 1) };
                k += 1;
            }
            self.resize(pool, size - 1)?;
            Ok(())
        })
    }

    /// Decref every element and shrink to zero. Also the release-contents
    /// hook invoked by the deallocator.
    pub fn clear(&self, pool: &Pool) -> Result<()> {
        pool.in_transaction(|| {
            let size = self.len(pool)?;
            if size == 0 {
                return Ok(());
            }
            let items = self.items_ptr(pool)?;
            for k in 0..size {
                let oid = unsafe { *items.add(k) };
                if oid.is_null() {
                    continue;
                }
                pool.pmem()
                    .tx_add_range_direct(unsafe { items.add(k) } as *mut u8, OID_SIZE)?;
                unsafe { *items.add(k) = Oid::NULL };
                pool.decref(oid)?;
            }
            self.resize(pool, 0)
        })
    }

    pub fn release_contents(&self, pool: &Pool) -> Result<()> {
        self.clear(pool)
    }

    /// The outgoing `Oid`s this list directly references, in order. Used
    /// only by the GC.
    pub fn traverse(&self, pool: &Pool) -> Result<Vec<Oid>> {
        let size = self.len(pool)?;
        let items = self.items_ptr(pool)?;
        if items.is_null() {
            return Ok(Vec::new());
        }
        Ok((0..size).map(|i| unsafe { *items.add(i) }).collect())
    }

    /// `(items array oid, allocator kind)` -- used by GC debug checks.
    pub fn substructures(&self, pool: &Pool) -> Result<Vec<(Oid, u32)>> {
        let body = self.body(pool)?;
        Ok(vec![(unsafe { (*body).items }, LIST_PTR_ARRAY)])
    }

    /// Length, then element-wise equality, against anything resurrectable
    /// to a sequence of [`Value`]s.
    pub fn eq_values(&self, pool: &Pool, other: &[Value]) -> Result<bool> {
        let size = self.len(pool)?;
        if size != other.len() {
            return Ok(false);
        }
        for (i, expected) in other.iter().enumerate() {
            if self.get(pool, i as i64)? != *expected {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub fn to_vec(&self, pool: &Pool) -> Result<Vec<Value>> {
        let size = self.len(pool)?;
        (0..size as i64).map(|i| self.get(pool, i)).collect()
    }
}

/// Whether a type code names the reserved list class -- used by the GC and
/// the deallocator to recognize a list without a registry round trip.
pub fn is_list_type_code(type_code: usize) -> bool {
    type_code == LIST_TYPE_CODE
}
