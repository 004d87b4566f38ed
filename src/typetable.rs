//! Bidirectional map between a class's stable string identity and the
//! small integer "type code" stamped into every [`crate::header::ObjectHeader`].
//!
//! The table itself is a [`crate::list::PersistentList`] of class-
//! identifier strings, and codes 0 and 1 are hardwired to the list and
//! string classes respectively so that persisting the table (a list of
//! strings) doesn't recurse into itself while looking up its own type
//! code.
//!
//! Rather than deriving the class string via reflection over a running
//! interpreter, every persistable class supplies its class string
//! explicitly, either hardwired here (list, string, float) or via
//! `Persistent::class_name()` for a `#[derive(Persistent)]` struct.

use std::cell::RefCell;
use std::collections::HashMap;

use crate::cache::Value;
use crate::error::{Error, Result};
use crate::header::{LIST_TYPE_CODE, STR_TYPE_CODE};
use crate::list::PersistentList;
use crate::oid::Oid;
use crate::pool::Pool;

/// The reserved class string for [`PersistentList`] (type code 0).
pub const LIST_CLASS: &str = "pmemobj::list::PersistentList";
/// The reserved class string for `String` (type code 1).
pub const STR_CLASS: &str = "alloc::string::String";
/// The class string `f64` is filed under. Not a reserved code -- it goes
/// through the same table as any other class, it just never comes from a
/// `#[derive(Persistent)]` struct.
pub const FLOAT_CLASS: &str = "f64";

/// Bidirectional class-string <-> type-code map, backed by a persistent
/// list of strings.
pub struct TypeTable {
    table_oid: Oid,
    code_cache: RefCell<HashMap<String, usize>>,
}

impl TypeTable {
    /// Allocate a fresh type table: a two-element persistent list
    /// pre-filled with the reserved classes' own names. Must run inside a
    /// transaction.
    pub fn create(pool: &Pool) -> Result<TypeTable> {
        let list = PersistentList::new(pool)?;
        list.append(pool, LIST_CLASS)?;
        list.append(pool, STR_CLASS)?;
        pool.incref(list.oid())?;
        Ok(TypeTable {
            table_oid: list.oid(),
            code_cache: RefCell::new(HashMap::new()),
        })
    }

    /// Reattach to a type table previously created in this pool.
    pub fn attach(table_oid: Oid) -> TypeTable {
        TypeTable {
            table_oid,
            code_cache: RefCell::new(HashMap::new()),
        }
    }

    pub fn table_oid(&self) -> Oid {
        self.table_oid
    }

    fn table(&self) -> PersistentList {
        PersistentList::attach(self.table_oid)
    }

    /// Return the type code for `class`, appending a new entry to the
    /// persistent table if this is the first time it's been seen. Must run
    /// inside a transaction when a new entry is appended.
    pub fn get_code(&self, pool: &Pool, class: &str) -> Result<usize> {
        if class == LIST_CLASS {
            return Ok(LIST_TYPE_CODE);
        }
        if class == STR_CLASS {
            return Ok(STR_TYPE_CODE);
        }
        if let Some(&code) = self.code_cache.borrow().get(class) {
            return Ok(code);
        }
        let table = self.table();
        let len = table.len(pool)?;
        for i in 0..len {
            if let Value::Str(s) = table.get(pool, i as i64)? {
                if s == class {
                    self.code_cache.borrow_mut().insert(class.to_string(), i);
                    return Ok(i);
                }
            }
        }
        let code = len;
        table.append(pool, class)?;
        self.code_cache.borrow_mut().insert(class.to_string(), code);
        Ok(code)
    }

    /// Inverse of [`get_code`](Self::get_code).
    pub fn resolve_code(&self, pool: &Pool, code: usize) -> Result<String> {
        if code == LIST_TYPE_CODE {
            return Ok(LIST_CLASS.to_string());
        }
        if code == STR_TYPE_CODE {
            return Ok(STR_CLASS.to_string());
        }
        let table = self.table();
        match table.get(pool, code as i64) {
            Ok(Value::Str(s)) => Ok(s),
            Ok(_) => Err(Error::internal(format!(
                "type table entry {} is not a string",
                code
            ))),
            Err(e) => Err(e),
        }
    }
}
