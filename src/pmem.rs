//! The PMEM binding: a self-contained transactional allocator over an
//! `mmap`'d region, playing the role an external PMDK-style library would
//! play in a production deployment. This module is the only place in the
//! crate that touches raw offsets into the mapped file; everything above
//! it (`oid`, `header`, `txn`, `cache`, `codec`, `list`, `gc`, `pool`) only
//! ever sees `Oid`s and a small, fixed set of allocator operations.
//!
//! # Layout
//!
//! ```text
//! [ PoolHeader | root area (fixed) | block, block, block, ... ]
//! ```
//!
//! Every block is an [`AllocHeader`] immediately followed by its payload.
//! Blocks are threaded together in address order via `prev`/`next`
//! regardless of whether they are free or live; [`Pmem::first`]/
//! [`Pmem::next`] walk that chain and skip free blocks. A volatile
//! (not persisted) free-offset list is rebuilt by one linear scan at
//! `open`/`create` time and used for first-fit allocation.

use std::cell::{Cell, RefCell};
use std::fs::OpenOptions;
use std::mem::size_of;
use std::path::Path;

use memmap::MmapMut;

use crate::error::{Error, ErrorKind, Result};
use crate::oid::Oid;

/// Structural minimum pool size: room for the header, the root area, and at
/// least a handful of small allocations.
pub const MIN_POOL_SIZE: u64 = 1024 * 1024;

/// Largest single allocation this binding will service.
pub const MAX_OBJ_SIZE: usize = 128 * 1024 * 1024;

const MAGIC: u64 = 0x706d656d_6f626a00; // "pmemobj\0" as bytes, big-endianish
const LAYOUT_PREFIX: &str = "pmemobj";
const LAYOUT_VERSION: (u32, u32, u32) = (1, 0, 0);
const LAYOUT_FIELD_LEN: usize = 64;
const ROOT_AREA_SIZE: usize = 256;

fn layout_string() -> String {
    format!(
        "{}-{}.{}.{}",
        LAYOUT_PREFIX, LAYOUT_VERSION.0, LAYOUT_VERSION.1, LAYOUT_VERSION.2
    )
}

#[repr(C)]
struct PoolHeader {
    magic: u64,
    layout: [u8; LAYOUT_FIELD_LEN],
    pool_uuid_lo: u64,
    total_size: u64,
    root_size: u64,
    heap_end: u64,
    heap_head: u64,
    heap_tail: u64,
}

const HEADER_SIZE: usize = size_of::<PoolHeader>();
const ROOT_OFFSET: u64 = HEADER_SIZE as u64;
const HEAP_START: u64 = ROOT_OFFSET + ROOT_AREA_SIZE as u64;

#[repr(C)]
#[derive(Clone, Copy)]
struct AllocHeader {
    size: u64,
    kind: u32,
    free: u32,
    prev: u64,
    next: u64,
}

const ALLOC_HEADER_SIZE: u64 = size_of::<AllocHeader>() as u64;

enum UndoOp {
    Allocated(u64),
    Freed(u64),
}

#[derive(Default)]
struct UndoFrame {
    snapshots: Vec<(usize, Vec<u8>)>,
    ops: Vec<UndoOp>,
}

/// A single mapped pool file and the transactional allocator over it.
pub struct Pmem {
    mmap: RefCell<MmapMut>,
    base: *mut u8,
    free_offsets: RefCell<Vec<u64>>,
    tx_stack: RefCell<Vec<UndoFrame>>,
    last_abort_errno: Cell<i32>,
}

fn random_u64() -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    use std::time::SystemTime;

    let local = 0u8;
    let mut h = DefaultHasher::new();
    SystemTime::now().hash(&mut h);
    (&local as *const u8 as usize).hash(&mut h);
    unsafe { libc::getpid() }.hash(&mut h);
    h.finish()
}

impl Pmem {
    /// Create a new pool file. Fails if `size < MIN_POOL_SIZE` or the file
    /// already exists with different content than expected by the caller
    /// (existence itself is the object manager's concern, see `pool::Pool`).
    pub fn create(path: &Path, size: u64, mode: u32) -> Result<Pmem> {
        if size < MIN_POOL_SIZE {
            return Err(Error::invalid_argument(format!(
                "pool size {} is smaller than the minimum pool size {}",
                size, MIN_POOL_SIZE
            )));
        }
        let mut open_opts = OpenOptions::new();
        open_opts.read(true).write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            open_opts.mode(mode);
        }
        #[cfg(not(unix))]
        {
            let _ = mode;
        }
        let file = open_opts.open(path)?;
        file.set_len(size)?;
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let base = mmap.as_mut_ptr();

        let header = PoolHeader {
            magic: MAGIC,
            layout: pack_layout(),
            pool_uuid_lo: random_u64(),
            total_size: size,
            root_size: 0,
            heap_end: HEAP_START,
            heap_head: 0,
            heap_tail: 0,
        };
        unsafe { std::ptr::write(base as *mut PoolHeader, header) };
        mmap.flush()?;

        Ok(Pmem {
            mmap: RefCell::new(mmap),
            base,
            free_offsets: RefCell::new(Vec::new()),
            tx_stack: RefCell::new(Vec::new()),
            last_abort_errno: Cell::new(0),
        })
    }

    /// Open an existing pool file, validating the layout version.
    pub fn open(path: &Path) -> Result<Pmem> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < HEAP_START {
            return Err(Error::internal("pool file is too small to contain a valid header"));
        }
        let mut mmap = unsafe { MmapMut::map_mut(&file)? };
        let base = mmap.as_mut_ptr();
        let header = unsafe { &*(base as *const PoolHeader) };
        if header.magic != MAGIC {
            return Err(Error::internal("pool file has an unrecognized magic number"));
        }
        let expected = pack_layout();
        if header.layout != expected {
            return Err(Error::internal(format!(
                "pool layout mismatch: found {:?}, expected {}",
                String::from_utf8_lossy(&header.layout).trim_end_matches('\0'),
                layout_string()
            )));
        }
        let pmem = Pmem {
            mmap: RefCell::new(mmap),
            base,
            free_offsets: RefCell::new(Vec::new()),
            tx_stack: RefCell::new(Vec::new()),
            last_abort_errno: Cell::new(0),
        };
        pmem.rebuild_free_list();
        Ok(pmem)
    }

    pub fn close(&self) {
        let _ = self.mmap.borrow_mut().flush();
    }

    #[inline]
    fn header(&self) -> &PoolHeader {
        unsafe { &*(self.base as *const PoolHeader) }
    }

    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn header_mut(&self) -> &mut PoolHeader {
        &mut *(self.base as *mut PoolHeader)
    }

    pub fn pool_uuid_lo(&self) -> u64 {
        self.header().pool_uuid_lo
    }

    // ---- root -------------------------------------------------------

    /// Return the OID of the root slot, reserving it with `size` bytes the
    /// first time it is called with a nonzero size.
    pub fn root(&self, size: usize) -> Result<Oid> {
        if size > ROOT_AREA_SIZE {
            return Err(Error::invalid_argument(format!(
                "root object size {} exceeds the reserved root area ({} bytes)",
                size, ROOT_AREA_SIZE
            )));
        }
        if size > 0 {
            let header = unsafe { self.header_mut() };
            if header.root_size == 0 {
                header.root_size = size as u64;
            }
        }
        Ok(Oid::new(self.pool_uuid_lo(), ROOT_OFFSET))
    }

    pub fn root_size(&self) -> usize {
        self.header().root_size as usize
    }

    // ---- catalog walk / direct access --------------------------------

    fn check_oid(&self, oid: Oid) -> Result<u64> {
        if oid.is_null() {
            return Err(Error::invalid_argument("null OID has no direct address"));
        }
        if oid.pool_uuid_lo != self.pool_uuid_lo() {
            return Err(Error::invalid_argument("OID does not belong to this pool"));
        }
        Ok(oid.off)
    }

    /// Raw pointer to the payload at `oid`. Valid only while this pool
    /// handle's mapping is live; never store the result in persistent
    /// memory (invariant 7).
    pub fn direct(&self, oid: Oid) -> Result<*mut u8> {
        if oid.is_null() {
            return Ok(std::ptr::null_mut());
        }
        let off = self.check_oid(oid)?;
        Ok(unsafe { self.base.add(off as usize) })
    }

    pub fn type_num(&self, oid: Oid) -> Result<u32> {
        let off = self.check_oid(oid)?;
        let h = unsafe { &*self.header_ptr(off) };
        Ok(h.kind)
    }

    /// First live (non-freed) allocation in address order, or `Oid::NULL`.
    pub fn first(&self) -> Oid {
        let mut off = self.header().heap_head;
        while off != 0 {
            let h = unsafe { &*self.header_ptr(off) };
            if h.free == 0 {
                return Oid::new(self.pool_uuid_lo(), off + ALLOC_HEADER_SIZE);
            }
            off = h.next;
        }
        Oid::NULL
    }

    /// Next live allocation after `oid` in address order, or `Oid::NULL`.
    pub fn next(&self, oid: Oid) -> Oid {
        if oid.is_null() {
            return Oid::NULL;
        }
        let mut off = oid.off - ALLOC_HEADER_SIZE;
        loop {
            let h = unsafe { &*self.header_ptr(off) };
            off = h.next;
            if off == 0 {
                return Oid::NULL;
            }
            let h = unsafe { &*self.header_ptr(off) };
            if h.free == 0 {
                return Oid::new(self.pool_uuid_lo(), off + ALLOC_HEADER_SIZE);
            }
        }
    }

    #[inline]
    unsafe fn header_ptr(&self, offset: u64) -> *mut AllocHeader {
        self.base.add(offset as usize) as *mut AllocHeader
    }

    // ---- transactions -------------------------------------------------

    pub fn tx_depth(&self) -> usize {
        self.tx_stack.borrow().len()
    }

    pub fn tx_begin(&self) {
        self.tx_stack.borrow_mut().push(UndoFrame::default());
    }

    pub fn tx_commit(&self) -> Result<()> {
        let mut stack = self.tx_stack.borrow_mut();
        let frame = stack
            .pop()
            .ok_or_else(|| Error::transaction_misuse("tx_commit with no active transaction"))?;
        match stack.last_mut() {
            // Not the outermost level: this frame's undo log is still live
            // if the parent later aborts, so it folds into the parent's
            // frame in chronological order rather than being discarded.
            Some(parent) => {
                parent.snapshots.extend(frame.snapshots);
                parent.ops.extend(frame.ops);
            }
            // Outermost commit: the mutations are durable, nothing above
            // can undo them, so the undo log is simply dropped.
            None => drop(frame),
        }
        drop(stack);
        self.last_abort_errno.set(0);
        Ok(())
    }

    pub fn tx_abort(&self, errno: i32) -> Result<()> {
        let frame = self
            .tx_stack
            .borrow_mut()
            .pop()
            .ok_or_else(|| Error::transaction_misuse("tx_abort with no active transaction"))?;
        for (ptr, bytes) in frame.snapshots.into_iter().rev() {
            unsafe {
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr as *mut u8, bytes.len());
            }
        }
        for op in frame.ops.into_iter().rev() {
            match op {
                UndoOp::Allocated(off) => self.mark_free(off),
                UndoOp::Freed(off) => self.unmark_free(off),
            }
        }
        self.last_abort_errno.set(errno);
        Ok(())
    }

    pub fn tx_end(&self) -> i32 {
        self.last_abort_errno.get()
    }

    fn current_frame<'a>(frames: &'a mut Vec<UndoFrame>) -> Result<&'a mut UndoFrame> {
        frames
            .last_mut()
            .ok_or_else(|| Error::transaction_misuse("operation requires an active transaction"))
    }

    /// Snapshot `size` bytes at `ptr` into the active transaction's undo
    /// log before the caller overwrites them.
    pub fn tx_add_range_direct(&self, ptr: *mut u8, size: usize) -> Result<()> {
        let mut stack = self.tx_stack.borrow_mut();
        let frame = Self::current_frame(&mut stack)?;
        let bytes = unsafe { std::slice::from_raw_parts(ptr, size) }.to_vec();
        frame.snapshots.push((ptr as usize, bytes));
        Ok(())
    }

    pub fn tx_zalloc(&self, size: usize, kind: u32) -> Result<Oid> {
        if size == 0 {
            return Ok(Oid::NULL);
        }
        if size > MAX_OBJ_SIZE {
            return Err(Error::invalid_argument(format!(
                "allocation of {} bytes exceeds the maximum object size {}",
                size, MAX_OBJ_SIZE
            )));
        }
        {
            let stack = self.tx_stack.borrow();
            if stack.is_empty() {
                return Err(Error::transaction_misuse("tx_zalloc outside a transaction"));
            }
        }
        let off = self.find_or_extend(size, kind)?;
        let data = unsafe { self.base.add((off + ALLOC_HEADER_SIZE) as usize) };
        unsafe { std::ptr::write_bytes(data, 0, size) };
        let mut stack = self.tx_stack.borrow_mut();
        Self::current_frame(&mut stack)?.ops.push(UndoOp::Allocated(off));
        Ok(Oid::new(self.pool_uuid_lo(), off + ALLOC_HEADER_SIZE))
    }

    pub fn tx_zrealloc(&self, oid: Oid, size: usize, kind: u32) -> Result<Oid> {
        if size == 0 {
            self.tx_free(oid)?;
            return Ok(Oid::NULL);
        }
        if oid.is_null() {
            return self.tx_zalloc(size, kind);
        }
        let off = self.check_oid(oid)?;
        let old_header = unsafe { *self.header_ptr(off) };
        if old_header.size as usize == size {
            return Ok(oid);
        }
        let new_oid = self.tx_zalloc(size, kind)?;
        let new_ptr = self.direct(new_oid)?;
        let old_ptr = self.direct(oid)?;
        let copy_len = std::cmp::min(old_header.size as usize, size);
        unsafe { std::ptr::copy_nonoverlapping(old_ptr, new_ptr, copy_len) };
        self.tx_free(oid)?;
        Ok(new_oid)
    }

    pub fn tx_free(&self, oid: Oid) -> Result<()> {
        if oid.is_null() {
            return Ok(());
        }
        let off = self.check_oid(oid)?;
        {
            let stack = self.tx_stack.borrow();
            if stack.is_empty() {
                return Err(Error::transaction_misuse("tx_free outside a transaction"));
            }
        }
        self.mark_free(off);
        let mut stack = self.tx_stack.borrow_mut();
        Self::current_frame(&mut stack)?.ops.push(UndoOp::Freed(off));
        Ok(())
    }

    // ---- allocator internals ------------------------------------------

    fn find_or_extend(&self, size: usize, kind: u32) -> Result<u64> {
        if let Some(off) = self.take_free(size) {
            let h = unsafe { &mut *self.header_ptr(off) };
            h.kind = kind;
            h.free = 0;
            return Ok(off);
        }
        self.coalesce_pass();
        if let Some(off) = self.take_free(size) {
            let h = unsafe { &mut *self.header_ptr(off) };
            h.kind = kind;
            h.free = 0;
            return Ok(off);
        }
        self.extend_heap(size, kind)
    }

    /// Merge adjacent free blocks in address order. Run opportunistically
    /// when a first-fit search comes up empty, the same "defragment before
    /// growing the heap" order real allocators use; not performed eagerly
    /// on every free since a single `tx_free` inside a transaction has no
    /// bearing on whether that transaction later aborts (coalescing is
    /// pure free-space bookkeeping, not part of the undo log).
    fn coalesce_pass(&self) {
        let mut off = self.header().heap_head;
        while off != 0 {
            let next_off = unsafe { (*self.header_ptr(off)).next };
            if next_off != 0 {
                let a_free = unsafe { (*self.header_ptr(off)).free != 0 };
                let b_free = unsafe { (*self.header_ptr(next_off)).free != 0 };
                if a_free && b_free {
                    let b_next = unsafe { (*self.header_ptr(next_off)).next };
                    let b_size = unsafe { (*self.header_ptr(next_off)).size };
                    {
                        let h = unsafe { &mut *self.header_ptr(off) };
                        h.size += ALLOC_HEADER_SIZE + b_size;
                        h.next = b_next;
                    }
                    if b_next != 0 {
                        unsafe { (*self.header_ptr(b_next)).prev = off };
                    } else {
                        unsafe { self.header_mut().heap_tail = off };
                    }
                    self.free_offsets.borrow_mut().retain(|&o| o != next_off);
                    continue;
                }
            }
            off = next_off;
        }
    }

    fn take_free(&self, size: usize) -> Option<u64> {
        let mut offsets = self.free_offsets.borrow_mut();
        let pos = offsets.iter().position(|&off| {
            let h = unsafe { &*self.header_ptr(off) };
            h.size as usize >= size
        })?;
        Some(offsets.remove(pos))
    }

    fn extend_heap(&self, size: usize, kind: u32) -> Result<u64> {
        let needed = ALLOC_HEADER_SIZE + size as u64;
        let header = unsafe { self.header_mut() };
        let off = header.heap_end;
        if off + needed > header.total_size {
            return Err(Error::out_of_memory(format!(
                "pool exhausted: cannot satisfy a {}-byte allocation",
                size
            )));
        }
        let prev = header.heap_tail;
        let block = AllocHeader {
            size: size as u64,
            kind,
            free: 0,
            prev,
            next: 0,
        };
        unsafe { std::ptr::write(self.header_ptr(off), block) };
        if prev != 0 {
            unsafe { (*self.header_ptr(prev)).next = off };
        } else {
            header.heap_head = off;
        }
        header.heap_tail = off;
        header.heap_end = off + needed;
        Ok(off)
    }

    fn mark_free(&self, off: u64) {
        unsafe { (*self.header_ptr(off)).free = 1 };
        self.free_offsets.borrow_mut().push(off);
    }

    fn unmark_free(&self, off: u64) {
        unsafe { (*self.header_ptr(off)).free = 0 };
        self.free_offsets.borrow_mut().retain(|&o| o != off);
    }

    fn rebuild_free_list(&self) {
        let mut offsets = Vec::new();
        let mut off = self.header().heap_head;
        while off != 0 {
            let h = unsafe { &*self.header_ptr(off) };
            if h.free != 0 {
                offsets.push(off);
            }
            off = h.next;
        }
        *self.free_offsets.borrow_mut() = offsets;
    }
}

fn pack_layout() -> [u8; LAYOUT_FIELD_LEN] {
    let s = layout_string();
    let mut buf = [0u8; LAYOUT_FIELD_LEN];
    let bytes = s.as_bytes();
    assert!(bytes.len() < LAYOUT_FIELD_LEN, "layout string too long");
    buf[..bytes.len()].copy_from_slice(bytes);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> std::path::PathBuf {
        crate::testutil::scratch("pmem", name)
    }

    #[test]
    fn create_reject_small_pool() {
        let path = scratch("small");
        let err = Pmem::create(&path, MIN_POOL_SIZE - 1, 0o666).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert!(err.message().contains(&(MIN_POOL_SIZE - 1).to_string()));
        assert!(err.message().contains(&MIN_POOL_SIZE.to_string()));
    }

    #[test]
    fn alloc_write_read_roundtrip() {
        let path = scratch("alloc");
        let pmem = Pmem::create(&path, MIN_POOL_SIZE, 0o666).unwrap();
        pmem.tx_begin();
        let oid = pmem.tx_zalloc(16, 20).unwrap();
        let ptr = pmem.direct(oid).unwrap();
        unsafe { std::ptr::write(ptr as *mut u64, 0xdead_beef) };
        pmem.tx_commit().unwrap();

        assert_eq!(pmem.type_num(oid).unwrap(), 20);
        let val = unsafe { std::ptr::read(ptr as *const u64) };
        assert_eq!(val, 0xdead_beef);
    }

    #[test]
    fn abort_restores_snapshot_and_frees_allocation() {
        let path = scratch("abort");
        let pmem = Pmem::create(&path, MIN_POOL_SIZE, 0o666).unwrap();

        pmem.tx_begin();
        let oid = pmem.tx_zalloc(8, 20).unwrap();
        pmem.tx_commit().unwrap();

        let ptr = pmem.direct(oid).unwrap();
        pmem.tx_begin();
        pmem.tx_add_range_direct(ptr, 8).unwrap();
        unsafe { std::ptr::write(ptr as *mut u64, 42) };
        pmem.tx_abort(0).unwrap();

        let val = unsafe { std::ptr::read(ptr as *const u64) };
        assert_eq!(val, 0);

        pmem.tx_begin();
        let new_oid = pmem.tx_zalloc(8, 20).unwrap();
        pmem.tx_commit().unwrap();
        assert_eq!(new_oid, oid, "freed block should be reused");
    }

    #[test]
    fn catalog_skips_freed_blocks() {
        let path = scratch("catalog");
        let pmem = Pmem::create(&path, MIN_POOL_SIZE, 0o666).unwrap();

        pmem.tx_begin();
        let a = pmem.tx_zalloc(8, 20).unwrap();
        let b = pmem.tx_zalloc(8, 20).unwrap();
        pmem.tx_commit().unwrap();

        pmem.tx_begin();
        pmem.tx_free(a).unwrap();
        pmem.tx_commit().unwrap();

        assert_eq!(pmem.first(), b);
        assert_eq!(pmem.next(b), Oid::NULL);
    }

    #[test]
    fn reopen_preserves_root_and_data() {
        let path = scratch("reopen");
        {
            let pmem = Pmem::create(&path, MIN_POOL_SIZE, 0o666).unwrap();
            let root = pmem.root(32).unwrap();
            pmem.tx_begin();
            let ptr = pmem.direct(root).unwrap();
            pmem.tx_add_range_direct(ptr, 8).unwrap();
            unsafe { std::ptr::write(ptr as *mut u64, 99) };
            pmem.tx_commit().unwrap();
            pmem.close();
        }
        let pmem = Pmem::open(&path).unwrap();
        assert_eq!(pmem.root_size(), 32);
        let root = pmem.root(0).unwrap();
        let ptr = pmem.direct(root).unwrap();
        let val = unsafe { std::ptr::read(ptr as *const u64) };
        assert_eq!(val, 99);
    }
}
