//! Persist/resurrect rules for the built-in immutables (`int`, `float`,
//! `str`) plus the `Persist`/`FieldCodec` traits that both the built-ins
//! and `#[derive(Persistent)]` records implement.
//!
//! `int` is persisted as a string body whose header is then patched to the
//! int type code, keeping the on-media representation portable across host
//! word sizes.

use crate::cache::{PersistKey, Value};
use crate::error::{Error, Result};
use crate::header::{ObjectHeader, VarHeader, POBJECT, STR_TYPE_CODE};
use crate::oid::Oid;
use crate::pool::Pool;
use crate::typetable::{FLOAT_CLASS, LIST_CLASS};

/// Implemented by anything that can be turned into a persisted `Oid`.
///
/// Built-in scalars persist by value (two equal `i64`s share one copy);
/// [`crate::list::PersistentList`] is already an `Oid` handle and returns it
/// unchanged; `#[derive(Persistent)]` records get a blanket impl in
/// `persistent.rs`.
pub trait Persist {
    fn persist(&self, pool: &Pool) -> Result<Oid>;
}

impl Persist for i64 {
    fn persist(&self, pool: &Pool) -> Result<Oid> {
        persist_int(pool, *self)
    }
}

impl Persist for f64 {
    fn persist(&self, pool: &Pool) -> Result<Oid> {
        persist_float(pool, *self)
    }
}

impl Persist for String {
    fn persist(&self, pool: &Pool) -> Result<Oid> {
        persist_str(pool, self)
    }
}

impl Persist for str {
    fn persist(&self, pool: &Pool) -> Result<Oid> {
        persist_str(pool, self)
    }
}

impl Persist for Value {
    fn persist(&self, pool: &Pool) -> Result<Oid> {
        match self {
            Value::Nothing => Ok(Oid::NULL),
            Value::Int(i) => i.persist(pool),
            Value::Float(f) => f.persist(pool),
            Value::Str(s) => s.persist(pool),
            Value::List(oid) | Value::Record(oid) => Ok(*oid),
        }
    }
}

impl Persist for crate::list::PersistentList {
    fn persist(&self, _pool: &Pool) -> Result<Oid> {
        Ok(self.oid())
    }
}

/// Implemented for every type a `#[derive(Persistent)]` field may hold.
/// Mirrors `Persist`, but field (de)serialization additionally needs the
/// active transaction handle.
pub trait FieldCodec: Sized {
    fn persist_field(&self, pool: &Pool) -> Result<Oid>;
    fn resurrect_field(pool: &Pool, oid: Oid) -> Result<Self>;
}

impl FieldCodec for i64 {
    fn persist_field(&self, pool: &Pool) -> Result<Oid> {
        persist_int(pool, *self)
    }
    fn resurrect_field(pool: &Pool, oid: Oid) -> Result<Self> {
        match pool.resurrect(oid)? {
            Value::Int(i) => Ok(i),
            other => Err(Error::internal(format!("expected int field, found {:?}", other))),
        }
    }
}

impl FieldCodec for f64 {
    fn persist_field(&self, pool: &Pool) -> Result<Oid> {
        persist_float(pool, *self)
    }
    fn resurrect_field(pool: &Pool, oid: Oid) -> Result<Self> {
        match pool.resurrect(oid)? {
            Value::Float(f) => Ok(f),
            other => Err(Error::internal(format!("expected float field, found {:?}", other))),
        }
    }
}

impl FieldCodec for String {
    fn persist_field(&self, pool: &Pool) -> Result<Oid> {
        persist_str(pool, self)
    }
    fn resurrect_field(pool: &Pool, oid: Oid) -> Result<Self> {
        match pool.resurrect(oid)? {
            Value::Str(s) => Ok(s),
            other => Err(Error::internal(format!("expected string field, found {:?}", other))),
        }
    }
}

impl FieldCodec for Oid {
    fn persist_field(&self, _pool: &Pool) -> Result<Oid> {
        Ok(*self)
    }
    fn resurrect_field(_pool: &Pool, oid: Oid) -> Result<Self> {
        Ok(oid)
    }
}

impl<T: FieldCodec> FieldCodec for Option<T> {
    fn persist_field(&self, pool: &Pool) -> Result<Oid> {
        match self {
            Some(v) => v.persist_field(pool),
            None => Ok(Oid::NULL),
        }
    }
    fn resurrect_field(pool: &Pool, oid: Oid) -> Result<Self> {
        if oid.is_null() {
            Ok(None)
        } else {
            Ok(Some(T::resurrect_field(pool, oid)?))
        }
    }
}

impl FieldCodec for crate::list::PersistentList {
    fn persist_field(&self, _pool: &Pool) -> Result<Oid> {
        Ok(self.oid())
    }
    fn resurrect_field(_pool: &Pool, oid: Oid) -> Result<Self> {
        Ok(crate::list::PersistentList::attach(oid))
    }
}

fn cached_or(
    pool: &Pool,
    key: PersistKey,
    value_for_cache: impl FnOnce(Oid) -> Value,
    make: impl FnOnce() -> Result<Oid>,
) -> Result<Oid> {
    if let Some(oid) = pool.cache_persist_lookup(&key) {
        return Ok(oid);
    }
    let oid = make()?;
    pool.cache_insert(oid, value_for_cache(oid), Some(key));
    Ok(oid)
}

/// Persisted as a string body whose final header type code is reset to
/// the int code.
pub fn persist_int(pool: &Pool, value: i64) -> Result<Oid> {
    cached_or(pool, PersistKey::Int(value), |_| Value::Int(value), || {
        pool.in_transaction(|| {
            let digits = value.to_string();
            let oid = alloc_string_body(pool, digits.as_bytes())?;
            let type_code = pool.get_type_code("i64")?;
            patch_type_code(pool, oid, type_code)?;
            Ok(oid)
        })
    })
}

pub fn persist_float(pool: &Pool, value: f64) -> Result<Oid> {
    cached_or(
        pool,
        PersistKey::FloatBits(value.to_bits()),
        |_| Value::Float(value),
        || {
            pool.in_transaction(|| {
                let type_code = pool.get_type_code(FLOAT_CLASS)?;
                let oid = pool.pmem().tx_zalloc(16, POBJECT)?;
                let ptr = pool.pmem().direct(oid)? as *mut u8;
                unsafe {
                    let header = ObjectHeader::at(ptr);
                    (*header).refcount = 0;
                    (*header).type_code = type_code;
                    let payload = ptr.add(ObjectHeader::SIZE) as *mut f64;
                    std::ptr::write(payload, value);
                }
                Ok(oid)
            })
        },
    )
}

pub fn persist_str(pool: &Pool, value: &str) -> Result<Oid> {
    cached_or(
        pool,
        PersistKey::Str(value.to_string()),
        |_| Value::Str(value.to_string()),
        || pool.in_transaction(|| alloc_string_body(pool, value.as_bytes())),
    )
}

/// Allocate `header + bytes + NUL` with the reserved string type code.
/// `persist_int` reuses this, then patches the type code.
fn alloc_string_body(pool: &Pool, bytes: &[u8]) -> Result<Oid> {
    let size = VarHeader::SIZE + bytes.len() + 1;
    let oid = pool.pmem().tx_zalloc(size, POBJECT)?;
    let ptr = pool.pmem().direct(oid)? as *mut u8;
    unsafe {
        let header = ptr as *mut VarHeader;
        (*header).header.refcount = 0;
        (*header).header.type_code = STR_TYPE_CODE;
        (*header).size = bytes.len();
        let payload = ptr.add(VarHeader::SIZE);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), payload, bytes.len());
        *payload.add(bytes.len()) = 0;
    }
    Ok(oid)
}

fn patch_type_code(pool: &Pool, oid: Oid, type_code: usize) -> Result<()> {
    let ptr = pool.pmem().direct(oid)? as *mut u8;
    pool.pmem().tx_add_range_direct(ptr, ObjectHeader::SIZE)?;
    unsafe {
        (*ObjectHeader::at(ptr)).type_code = type_code;
    }
    Ok(())
}

fn read_string_body(pool: &Pool, oid: Oid) -> Result<String> {
    let ptr = pool.pmem().direct(oid)? as *const u8;
    let header = unsafe { &*(ptr as *const VarHeader) };
    let payload = unsafe { ptr.add(VarHeader::SIZE) };
    let bytes = unsafe { std::slice::from_raw_parts(payload, header.size) };
    String::from_utf8(bytes.to_vec())
        .map_err(|e| Error::internal(format!("string body is not valid UTF-8: {}", e)))
}

/// Read an object header's `type_code` without going through the cache;
/// used by `Pool::resurrect`'s dispatch and by the GC's catalog pass.
pub fn read_type_code(pool: &Pool, oid: Oid) -> Result<usize> {
    let ptr = pool.pmem().direct(oid)? as *const ObjectHeader;
    Ok(unsafe { (*ptr).type_code })
}

/// Dispatch an OID's body to a [`Value`] by its header's type code.
/// Used by `Pool::resurrect`'s uncached path.
pub fn resurrect_dispatch(pool: &Pool, oid: Oid) -> Result<Value> {
    let type_code = read_type_code(pool, oid)?;
    if type_code == crate::header::LIST_TYPE_CODE {
        return Ok(Value::List(oid));
    }
    if type_code == STR_TYPE_CODE {
        return Ok(Value::Str(read_string_body(pool, oid)?));
    }
    let class = pool.resolve_type_code(type_code)?;
    if class == "i64" {
        let s = read_string_body(pool, oid)?;
        let i: i64 = s
            .parse()
            .map_err(|e| Error::internal(format!("int body {:?} did not parse: {}", s, e)))?;
        Ok(Value::Int(i))
    } else if class == FLOAT_CLASS {
        let ptr = pool.pmem().direct(oid)? as *const u8;
        let value = unsafe { *(ptr.add(ObjectHeader::SIZE) as *const f64) };
        Ok(Value::Float(value))
    } else if class == LIST_CLASS {
        Ok(Value::List(oid))
    } else {
        Ok(Value::Record(oid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::Pool;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        crate::testutil::scratch("codec", name)
    }

    #[test]
    fn int_persists_as_a_string_body_with_a_patched_type_code() {
        let path = scratch("int-body");
        let pool = Pool::create(&path, crate::pmem::MIN_POOL_SIZE).unwrap();
        let oid = pool.in_transaction(|| persist_int(&pool, -42)).unwrap();
        assert_eq!(pool.pmem().type_num(oid).unwrap(), crate::header::POBJECT);
        assert_eq!(read_type_code(&pool, oid).unwrap(), pool.get_type_code("i64").unwrap());
        assert_eq!(resurrect_dispatch(&pool, oid).unwrap(), Value::Int(-42));
    }

    #[test]
    fn float_round_trips_its_raw_bits() {
        let path = scratch("float-body");
        let pool = Pool::create(&path, crate::pmem::MIN_POOL_SIZE).unwrap();
        let oid = pool.in_transaction(|| persist_float(&pool, 2.5)).unwrap();
        assert_eq!(resurrect_dispatch(&pool, oid).unwrap(), Value::Float(2.5));
    }

    #[test]
    fn string_round_trips_non_ascii_bytes() {
        let path = scratch("string-body");
        let pool = Pool::create(&path, crate::pmem::MIN_POOL_SIZE).unwrap();
        let oid = pool.in_transaction(|| persist_str(&pool, "héllo wörld 漢字")).unwrap();
        assert_eq!(
            resurrect_dispatch(&pool, oid).unwrap(),
            Value::Str("héllo wörld 漢字".to_string())
        );
    }

    #[test]
    fn equal_immutable_values_share_one_persisted_copy() {
        let path = scratch("dedup");
        let pool = Pool::create(&path, crate::pmem::MIN_POOL_SIZE).unwrap();
        let a = pool.in_transaction(|| persist_str(&pool, "shared")).unwrap();
        let b = pool.in_transaction(|| persist_str(&pool, "shared")).unwrap();
        assert_eq!(a, b, "two equal strings should persist to the same OID");

        let x = pool.in_transaction(|| persist_int(&pool, 7)).unwrap();
        let y = pool.in_transaction(|| persist_int(&pool, 7)).unwrap();
        assert_eq!(x, y, "two equal ints should persist to the same OID");
    }
}
