//! Pool-scoped persistent pointers.
//!
//! An [`Oid`] is meaningful only within the pool that produced it: it pairs
//! the pool's UUID with a byte offset into the mapped file. Unlike a raw
//! pointer, it survives the file being unmapped and remapped at a different
//! virtual address, which is what makes it safe to store inside the pool
//! itself: raw addresses from `direct()` are never persisted, only
//! `Oid`s are.

use std::fmt;

/// A pool-scoped persistent pointer: `(pool_uuid_lo, off)`.
///
/// Compared and hashed by value, the same way `PMEMoid` is compared in the
/// library this crate's object model is patterned on.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Oid {
    pub pool_uuid_lo: u64,
    pub off: u64,
}

impl Oid {
    /// The null OID. Meaningful in every pool; always resurrects to the
    /// host-side "nothing" value.
    pub const NULL: Oid = Oid {
        pool_uuid_lo: 0,
        off: 0,
    };

    #[inline]
    pub fn is_null(&self) -> bool {
        *self == Oid::NULL
    }

    #[inline]
    pub fn as_tuple(&self) -> (u64, u64) {
        (self.pool_uuid_lo, self.off)
    }

    #[inline]
    pub fn new(pool_uuid_lo: u64, off: u64) -> Self {
        Oid { pool_uuid_lo, off }
    }
}

impl fmt::Debug for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "Oid(NULL)")
        } else {
            write!(f, "Oid({:#x}:{:#x})", self.pool_uuid_lo, self.off)
        }
    }
}
