//! Reclaims what refcounting alone cannot -- reference cycles, and the
//! wreckage of a crash that allocated an object but never linked it in
//! before the process died.
//!
//! Catalogs every live allocation by walking the allocator's block chain
//! into three buckets (`orphans`, `containers`, `other`), sweeps orphans
//! immediately, traces everything reachable from the type table and the
//! root object, and whatever is left in `containers`/`other` afterward is
//! unreachable garbage -- a cycle, or (a bug) a leftover non-container
//! with a positive refcount nothing points at.
//!
//! Runs unconditionally, once, at the end of `Pool::open` -- not on a
//! timer and not configurable.

use std::collections::{HashMap, HashSet};

use crate::codec;
use crate::header::{RecordHeader, LIST_TYPE_CODE, POBJECT};
use crate::list::PersistentList;
use crate::oid::Oid;
use crate::pool::Pool;
use crate::refcount;

/// Outcome of one collection pass: per-type counts of what is live and
/// what was reclaimed, with the orphan/cycle/leftover split kept separate
/// so callers can tell the three apart.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcReport {
    pub live_count: usize,
    pub orphans_freed: usize,
    pub cycles_freed: usize,
    pub leftover_freed: usize,
    pub type_counts: HashMap<String, usize>,
    pub reclaimed_counts: HashMap<String, usize>,
}

impl GcReport {
    pub fn freed_count(&self) -> usize {
        self.orphans_freed + self.cycles_freed + self.leftover_freed
    }
}

struct Catalog {
    /// Every cataloged `POBJECT`, with its type code, for reporting and
    /// for the debug integrity check.
    all: Vec<(Oid, usize)>,
    orphans: Vec<Oid>,
    containers: HashSet<Oid>,
    other: HashSet<Oid>,
}

/// Run one full collection pass over `pool`. Must not be called from
/// inside a transaction already begun by the caller; it manages its own.
pub fn collect(pool: &Pool) -> crate::error::Result<GcReport> {
    pool.in_transaction(|| {
        let catalog = catalog_objects(pool)?;

        let mut type_counts = HashMap::new();
        for (oid, type_code) in &catalog.all {
            let class = pool.resolve_type_code(*type_code)?;
            *type_counts.entry(class).or_insert(0) += 1;
            let _ = oid;
        }

        #[cfg(debug_assertions)]
        check_substructure_integrity(pool, &catalog.all)?;

        // Phase 2: sweep orphans -- allocations a crash left behind
        // between `tx_zalloc` and being linked in anywhere.
        let orphans_freed = catalog.orphans.len();
        for oid in &catalog.orphans {
            refcount::deallocate(pool, *oid)?;
        }

        // Phase 4: trace live set from the type table and the root object.
        let type_codes: HashMap<Oid, usize> = catalog.all.iter().cloned().collect();
        let mut containers = catalog.containers;
        let mut other = catalog.other;
        let mut live = HashSet::new();
        let mut stack = Vec::new();
        for root in [pool.type_table_oid(), pool.root_object_oid()?] {
            if root.is_null() {
                continue;
            }
            if containers.remove(&root) {
                live.insert(root);
                stack.push(root);
            } else if other.remove(&root) {
                live.insert(root);
            }
        }
        while let Some(oid) = stack.pop() {
            let type_code = type_codes[&oid];
            for child in refcount::traverse(pool, oid, type_code)? {
                if child.is_null() || live.contains(&child) {
                    continue;
                }
                if containers.remove(&child) {
                    live.insert(child);
                    stack.push(child);
                } else if other.remove(&child) {
                    live.insert(child);
                }
            }
        }

        // Phase 5: everything left in `containers` has a positive refcount
        // but no path in from either root -- a reference cycle. A track-free
        // set records every OID this phase's cascading release actually
        // frees -- including leaves outside the group, like a `String`
        // uniquely owned by a cycle member -- so phase 6 doesn't free one
        // of them a second time.
        let mut reclaimed_counts = HashMap::new();
        let cycles_freed = containers.len();
        for oid in &containers {
            let type_code = type_codes[oid];
            let class = pool.resolve_type_code(type_code)?;
            *reclaimed_counts.entry(class).or_insert(0) += 1;
        }
        let mut freeing = HashSet::new();
        free_unreachable_group(pool, &containers, &type_codes, &mut freeing)?;

        // Phase 6: anything left in `other` is a non-container with a
        // positive refcount nothing references -- a bug, not a cycle, but
        // freed the same way so it doesn't leak forever. Anything phase 5
        // already freed as a cascading side effect is no longer a bug, and
        // must not be freed again.
        other.retain(|oid| !freeing.contains(oid));
        let leftover_freed = other.len();
        if leftover_freed > 0 {
            crate::trace!(
                Red,
                "gc",
                "{} leftover non-container object(s) with no live reference",
                leftover_freed
            );
        }
        for oid in &other {
            let type_code = type_codes[oid];
            let class = pool.resolve_type_code(type_code)?;
            *reclaimed_counts.entry(class).or_insert(0) += 1;
        }
        free_unreachable_group(pool, &other, &type_codes, &mut freeing)?;

        let report = GcReport {
            live_count: live.len(),
            orphans_freed,
            cycles_freed,
            leftover_freed,
            type_counts,
            reclaimed_counts,
        };
        crate::trace!(
            Yellow,
            "gc",
            "{} live, {} orphan(s), {} cycle member(s), {} leftover freed",
            report.live_count,
            report.orphans_freed,
            report.cycles_freed,
            report.leftover_freed
        );
        Ok(report)
    })
}

/// Free a group of unreachable objects: first decref every edge that
/// points from the group into something still live, then free each
/// member's own storage. Edges between two group members are left alone --
/// both sides are being freed in this same pass regardless of what their
/// refcount says.
///
/// `freeing` is the track-free set shared across every call in one
/// collection pass: a child outside the group whose refcount is about to
/// drop to zero here is recorded before the decref runs, and a member is
/// recorded once its own storage is freed, so a later call (or a later
/// iteration of the same call) never hands an already-freed OID to
/// `tx_free` a second time.
fn free_unreachable_group(
    pool: &Pool,
    group: &HashSet<Oid>,
    type_codes: &HashMap<Oid, usize>,
    freeing: &mut HashSet<Oid>,
) -> crate::error::Result<()> {
    for oid in group {
        if freeing.contains(oid) {
            continue;
        }
        let type_code = type_codes[oid];
        for child in refcount::traverse(pool, *oid, type_code)? {
            if child.is_null() || group.contains(&child) || freeing.contains(&child) {
                continue;
            }
            if object_refcount(pool, child)? <= 1 {
                // this decref is the one that will take it to zero
                freeing.insert(child);
            }
            pool.xdecref(child)?;
        }
    }
    for oid in group {
        if !freeing.insert(*oid) {
            continue;
        }
        let type_code = type_codes[oid];
        free_structural_storage(pool, *oid, type_code)?;
        pool.pmem().tx_free(*oid)?;
        pool.cache_purge(*oid);
    }
    Ok(())
}

/// Walk the allocator's block chain and bucket every `POBJECT`-kind
/// allocation. Indirected storage blocks
/// (`LIST_PTR_ARRAY`/`RECORD_FIELD_ARRAY`) are never objects in their own
/// right and are skipped; they're freed alongside their owning object.
fn catalog_objects(pool: &Pool) -> crate::error::Result<Catalog> {
    let mut all = Vec::new();
    let mut orphans = Vec::new();
    let mut containers = HashSet::new();
    let mut other = HashSet::new();

    let mut oid = pool.pmem().first();
    while !oid.is_null() {
        if pool.pmem().type_num(oid)? == POBJECT {
            let type_code = codec::read_type_code(pool, oid)?;
            let refcount = object_refcount(pool, oid)?;
            all.push((oid, type_code));
            if refcount == 0 {
                orphans.push(oid);
            } else if refcount::is_container_type_code(pool, type_code)? {
                containers.insert(oid);
            } else {
                other.insert(oid);
            }
        }
        oid = pool.pmem().next(oid);
    }
    Ok(Catalog {
        all,
        orphans,
        containers,
        other,
    })
}

fn object_refcount(pool: &Pool, oid: Oid) -> crate::error::Result<usize> {
    use crate::header::ObjectHeader;
    let ptr = pool.pmem().direct(oid)? as *const ObjectHeader;
    Ok(unsafe { (*ptr).refcount })
}

/// Debug-only sanity check: every cataloged container's indirected storage
/// block actually exists and carries the allocator kind its shape expects.
/// Not run in release builds.
#[cfg(debug_assertions)]
fn check_substructure_integrity(
    pool: &Pool,
    catalog: &[(Oid, usize)],
) -> crate::error::Result<()> {
    use crate::error::Error;

    for (oid, type_code) in catalog {
        if *type_code == LIST_TYPE_CODE {
            for (array_oid, kind) in PersistentList::attach(*oid).substructures(pool)? {
                if array_oid.is_null() {
                    continue;
                }
                let found_kind = pool.pmem().type_num(array_oid)?;
                if found_kind != kind {
                    return Err(Error::internal(format!(
                        "list {:?} substructure {:?} has allocator kind {}, expected {}",
                        oid, array_oid, found_kind, kind
                    )));
                }
            }
        } else if refcount::is_container_type_code(pool, *type_code)? {
            let ptr = pool.pmem().direct(*oid)? as *const RecordHeader;
            let fields = unsafe { (*ptr).fields };
            if !fields.is_null() {
                let found_kind = pool.pmem().type_num(fields)?;
                if found_kind != crate::header::RECORD_FIELD_ARRAY {
                    return Err(Error::internal(format!(
                        "record {:?} field array {:?} has allocator kind {}, expected {}",
                        oid, fields, found_kind, crate::header::RECORD_FIELD_ARRAY
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Free a dead container's own indirected storage (the items array or the
/// field array), without decref'ing what it points at -- that was already
/// handled, or deliberately skipped, by [`free_unreachable_group`].
fn free_structural_storage(pool: &Pool, oid: Oid, type_code: usize) -> crate::error::Result<()> {
    if type_code == LIST_TYPE_CODE {
        for (array_oid, _kind) in PersistentList::attach(oid).substructures(pool)? {
            if !array_oid.is_null() {
                pool.pmem().tx_free(array_oid)?;
            }
        }
    } else if refcount::is_container_type_code(pool, type_code)? {
        let ptr = pool.pmem().direct(oid)? as *const RecordHeader;
        let fields = unsafe { (*ptr).fields };
        if !fields.is_null() {
            pool.pmem().tx_free(fields)?;
        }
    }
    Ok(())
}
