//! On-media prefixes stamped into every managed allocation.
//!
//! These structs are `#[repr(C)]` because their byte layout *is* the
//! persisted layout: anything living behind a `*mut u8` handed back by
//! [`crate::pmem::Pmem::direct`] is cast directly to one of these shapes.

use crate::oid::Oid;

/// Allocator kind for a refcounted object header (`POBJECT`).
pub const POBJECT: u32 = 20;

/// Allocator kind for a list's backing OID array (not itself refcounted).
pub const LIST_PTR_ARRAY: u32 = 21;

/// Allocator kind for a user-defined persistent record's field array.
pub const RECORD_FIELD_ARRAY: u32 = 22;

/// Reserved type code: the persistent list class, wired in to break the
/// type-table bootstrap cycle (the type table is itself a list).
pub const LIST_TYPE_CODE: usize = 0;

/// Reserved type code: the string class, for the same reason.
pub const STR_TYPE_CODE: usize = 1;

/// Fixed prefix of every `POBJECT`-kind allocation.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ObjectHeader {
    pub refcount: usize,
    pub type_code: usize,
}

impl ObjectHeader {
    pub const SIZE: usize = std::mem::size_of::<ObjectHeader>();

    /// Reinterpret a raw payload pointer (as returned by
    /// [`crate::pmem::Pmem::direct`]) as a pointer to its object header.
    /// Every `POBJECT`-kind allocation starts with one (invariant 1).
    #[inline]
    pub unsafe fn at(ptr: *mut u8) -> *mut ObjectHeader {
        ptr as *mut ObjectHeader
    }
}

/// Object header plus an explicit size, used by variable-length bodies
/// (lists, strings).
#[repr(C)]
#[derive(Clone, Copy)]
pub struct VarHeader {
    pub header: ObjectHeader,
    pub size: usize,
}

impl VarHeader {
    pub const SIZE: usize = std::mem::size_of::<VarHeader>();
}

/// A persistent list's body: variable-size header (where `size` is the
/// element count) plus a pointer to a separately allocated OID array and
/// that array's capacity.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct ListBody {
    pub var: VarHeader,
    pub items: Oid,
    pub allocated: usize,
}

impl ListBody {
    pub const SIZE: usize = std::mem::size_of::<ListBody>();
}

/// A float value's body.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FloatBody {
    pub header: ObjectHeader,
    pub value: f64,
}

impl FloatBody {
    pub const SIZE: usize = std::mem::size_of::<FloatBody>();
}

/// A user-defined persistent record's body: object header, field count,
/// and a pointer to a separately allocated array of `field_count` OIDs
/// (allocator kind [`RECORD_FIELD_ARRAY`]) -- the same items-by-indirection
/// shape [`ListBody`] uses, so the GC's generic traversal of "a container is
/// header + size + one indirected OID array" covers both shapes uniformly.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RecordHeader {
    pub header: ObjectHeader,
    pub field_count: usize,
    pub fields: Oid,
}

impl RecordHeader {
    pub const SIZE: usize = std::mem::size_of::<RecordHeader>();
}

/// The persistent root record stored at the PMEM binding's root slot.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct RootRecord {
    pub type_table: Oid,
    pub root_object: Oid,
}

impl RootRecord {
    pub const SIZE: usize = std::mem::size_of::<RootRecord>();
}
