//! `pmemobj` is a persistent-memory object store: a memory-mapped pool file
//! holding reference-counted, transactionally-updated objects, with a
//! tracing garbage collector backing up the refcounts for reference cycles.
//!
//! The model is deliberately small next to a full persistent-memory
//! runtime: one pool type, one root object, a handful of built-in
//! persistable shapes (`i64`, `f64`, `String`, [`list::PersistentList`]),
//! and `#[derive(Persistent)]` for application-defined record types. Every
//! mutation happens inside a [`pool::Pool::in_transaction`] closure or an
//! explicit `begin()`/`commit()`/`abort()` pair; nothing is durable until
//! that transaction commits.
//!
//! # Example
//!
//! ```no_run
//! use pmemobj::pool::Pool;
//! use pmemobj::list::PersistentList;
//! use std::path::Path;
//!
//! let pool = Pool::create(Path::new("/pmem/ledger.pool"), 64 * 1024 * 1024).unwrap();
//! let entries = pool
//!     .in_transaction(|| {
//!         let list = PersistentList::new(&pool)?;
//!         list.append(&pool, &"opening balance".to_string())?;
//!         Ok(list)
//!     })
//!     .unwrap();
//! pool.set_root(&entries).unwrap();
//! ```
//!
//! # Deriving `Persistent`
//!
//! ```
//! use pmemobj::Persistent;
//!
//! #[derive(Persistent)]
//! struct Account {
//!     name: String,
//!     balance: i64,
//! }
//! ```
//!
//! A type must be registered on a pool handle with [`pool::Pool::register`]
//! before any instance of it can be persisted; an unregistered class fails
//! with [`error::ErrorKind::TypeNotPersistable`].

#![allow(dead_code)]

// Lets `#[derive(Persistent)]` resolve its generated `pmemobj::...` paths
// when used from this crate's own tests, not just from downstream crates.
extern crate self as pmemobj;

pub mod cache;
pub mod codec;
pub mod error;
pub mod gc;
pub mod header;
pub mod list;
pub mod oid;
pub mod persistent;
pub mod pmem;
pub mod pool;
pub mod refcount;
#[cfg(test)]
mod testutil;
pub mod txn;
pub mod typetable;
pub mod util;

pub use error::{Error, ErrorKind, Result};
pub use list::PersistentList;
pub use oid::Oid;
pub use persistent::Persistent;
pub use pool::{OpenFlag, Pool};

pub use pmemobj_derive::Persistent;
