//! End-to-end scenarios S1-S6, driven purely through the public `Pool`/
//! `PersistentList` surface the way an application would, as an integration
//! test crate sitting outside `src/` the way `original_source/tests/
//! test_pmemobj_pool.py` and `test_pmemobj_list.py` exercise `pynvm`'s own
//! pool from outside the package.

use std::path::PathBuf;

use pmemobj::cache::Value;
use pmemobj::list::PersistentList;
use pmemobj::pool::{OpenFlag, Pool};
use pmemobj::{Error, ErrorKind};

fn scratch(name: &str) -> PathBuf {
    let mut p = std::env::temp_dir();
    p.push(format!("pmemobj-scenarios-test-{}-{}", std::process::id(), name));
    let _ = std::fs::remove_file(&p);
    p
}

const POOL_SIZE: u64 = pmemobj::pmem::MIN_POOL_SIZE;

/// S1: create -> root = a four-element string list -> close -> reopen ->
/// root reads back equal.
#[test]
fn s1_create_open_round_trip_of_a_string_list() {
    let path = scratch("s1");
    {
        let pool = Pool::create(&path, POOL_SIZE).unwrap();
        let list = PersistentList::from_iter(
            &pool,
            &["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()],
        )
        .unwrap();
        pool.set_root(&list).unwrap();
        pool.close();
    }
    let pool = Pool::open(&path).unwrap();
    match pool.root().unwrap() {
        Value::List(oid) => {
            let list = PersistentList::attach(oid);
            assert!(list
                .eq_values(
                    &pool,
                    &[
                        Value::Str("a".into()),
                        Value::Str("b".into()),
                        Value::Str("c".into()),
                        Value::Str("d".into()),
                    ],
                )
                .unwrap());
        }
        other => panic!("expected a list root, found {:?}", other),
    }
}

/// S2: a scoped transaction that sets the root then panics leaves the root
/// at the nothing value, both immediately after the scope and after a
/// reopen.
#[test]
fn s2_transaction_abort_leaves_root_as_nothing_even_after_reopen() {
    let path = scratch("s2");
    {
        let pool = Pool::create(&path, POOL_SIZE).unwrap();
        assert_eq!(pool.root().unwrap(), Value::Nothing);

        let result: pmemobj::Result<()> = pool.in_transaction(|| {
            pool.set_root(&10i64)?;
            Err(Error::invalid_argument("deliberate failure inside the scope"))
        });
        assert!(result.is_err());
        assert_eq!(pool.root().unwrap(), Value::Nothing);
        pool.close();
    }
    let pool = Pool::open(&path).unwrap();
    assert_eq!(pool.root().unwrap(), Value::Nothing);
}

/// S3: repeated `insert` at clamped positive/negative/out-of-range indices
/// produces the same final order before and after a reopen.
#[test]
fn s3_insert_sequence_clamps_indices_and_survives_reopen() {
    let path = scratch("s3");
    {
        let pool = Pool::create(&path, POOL_SIZE).unwrap();
        let list = pool
            .in_transaction(|| {
                let list = PersistentList::new(&pool)?;
                list.insert(&pool, 0, "b")?;
                list.insert(&pool, -1, "a")?;
                list.insert(&pool, 2, "c")?;
                list.insert(&pool, -10, "z")?;
                list.insert(&pool, 10, "y")?;
                Ok(list)
            })
            .unwrap();
        let expected = [
            Value::Str("z".into()),
            Value::Str("a".into()),
            Value::Str("b".into()),
            Value::Str("c".into()),
            Value::Str("y".into()),
        ];
        assert!(list.eq_values(&pool, &expected).unwrap());
        pool.set_root(&list).unwrap();
        pool.close();
    }
    let pool = Pool::open(&path).unwrap();
    match pool.root().unwrap() {
        Value::List(oid) => {
            let list = PersistentList::attach(oid);
            assert!(list
                .eq_values(
                    &pool,
                    &[
                        Value::Str("z".into()),
                        Value::Str("a".into()),
                        Value::Str("b".into()),
                        Value::Str("c".into()),
                        Value::Str("y".into()),
                    ],
                )
                .unwrap());
        }
        other => panic!("expected a list root, found {:?}", other),
    }
}

/// S4: two lists that reference each other, appended under a shared root,
/// then detached from that root by `clear()`. The next `gc()` must report
/// at least 2 cycle members reclaimed.
#[test]
fn s4_cycle_detached_from_root_is_gc_reclaimed() {
    let path = scratch("s4");
    let pool = Pool::create(&path, POOL_SIZE).unwrap();

    let root = pool
        .in_transaction(|| {
            let root = PersistentList::new(&pool)?;
            let first = PersistentList::new(&pool)?;
            let second = PersistentList::new(&pool)?;
            root.append(&pool, &first)?;
            root.append(&pool, &second)?;
            first.append(&pool, &second)?;
            second.append(&pool, &first)?;
            Ok(root)
        })
        .unwrap();
    pool.set_root(&root).unwrap();

    pool.in_transaction(|| root.clear(&pool)).unwrap();
    let report = pool.gc().unwrap();
    assert!(
        report.cycles_freed >= 2,
        "expected at least 2 collections-gc'ed, got {}",
        report.cycles_freed
    );
}

/// S5: `open-x` against an already-existing pool file is an error.
#[test]
fn s5_create_flag_rejects_an_existing_pool_file() {
    let path = scratch("s5");
    Pool::create(&path, POOL_SIZE).unwrap().close();
    let err = Pool::open_with_flag(&path, OpenFlag::Create, POOL_SIZE).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

/// S6: creating a pool below the minimum size fails with a message naming
/// both the requested size and the minimum.
#[test]
fn s6_undersized_pool_creation_names_both_sizes_in_the_error() {
    let path = scratch("s6");
    let requested = POOL_SIZE - 1;
    let err = Pool::create(&path, requested).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    assert!(err.message().contains(&requested.to_string()));
    assert!(err.message().contains(&POOL_SIZE.to_string()));
}

/// Universal property 2: closing a pool handle twice is not an error.
#[test]
fn closing_a_pool_twice_is_idempotent() {
    let path = scratch("idempotent-close");
    let pool = Pool::create(&path, POOL_SIZE).unwrap();
    pool.close();
    pool.close();
}

/// Universal property 3 (flag matrix, `open-w`/`open-c` legs not covered by
/// S5): `open-w` against a missing file and `open-c` against both a missing
/// and an existing file.
#[test]
fn open_flag_matrix_open_and_create_or_open_legs() {
    let path = scratch("flag-matrix");
    assert_eq!(
        Pool::open_with_flag(&path, OpenFlag::Open, POOL_SIZE)
            .unwrap_err()
            .kind(),
        ErrorKind::InvalidArgument
    );

    // `open-c` against a missing file creates it.
    let pool = Pool::open_with_flag(&path, OpenFlag::CreateOrOpen, POOL_SIZE).unwrap();
    pool.set_root(&"seed".to_string()).unwrap();
    pool.close();

    // `open-c` against an existing file opens it, preserving the root.
    let pool = Pool::open_with_flag(&path, OpenFlag::CreateOrOpen, POOL_SIZE).unwrap();
    assert_eq!(pool.root().unwrap(), Value::Str("seed".to_string()));
}

/// Universal property 6: aborting the innermost of three nested
/// transactions leaves the root unchanged at every outer level too.
#[test]
fn nested_abort_unwinds_every_level_and_root_is_unchanged() {
    let path = scratch("nested-abort");
    let pool = Pool::create(&path, POOL_SIZE).unwrap();
    pool.set_root(&"stable".to_string()).unwrap();

    let result: pmemobj::Result<()> = pool.in_transaction(|| {
        pool.in_transaction(|| {
            pool.in_transaction(|| {
                pool.set_root(&"changed".to_string())?;
                Err(Error::invalid_argument("innermost failure"))
            })
        })
    });
    assert!(result.is_err());
    assert_eq!(pool.root().unwrap(), Value::Str("stable".to_string()));
}

/// Universal property 7, the nothing-value leg of property 1: an explicit
/// empty root round-trips as `Value::Nothing` with no registration or
/// allocation required.
#[test]
fn nothing_value_round_trips_without_ever_allocating() {
    let path = scratch("nothing-roundtrip");
    {
        let pool = Pool::create(&path, POOL_SIZE).unwrap();
        assert_eq!(pool.root().unwrap(), Value::Nothing);
        pool.close();
    }
    let pool = Pool::open(&path).unwrap();
    assert_eq!(pool.root().unwrap(), Value::Nothing);
}

/// Property 1's large-int and float legs, rounded through a reopen
/// together inside one list.
#[test]
fn large_int_and_float_round_trip_through_reopen() {
    let path = scratch("int-float-roundtrip");
    {
        let pool = Pool::create(&path, POOL_SIZE).unwrap();
        let list =
            PersistentList::from_iter(&pool, &[Value::Int(i64::MAX), Value::Float(std::f64::consts::PI)])
                .unwrap();
        pool.set_root(&list).unwrap();
        pool.close();
    }
    let pool = Pool::open(&path).unwrap();
    match pool.root().unwrap() {
        Value::List(oid) => {
            let list = PersistentList::attach(oid);
            assert_eq!(list.get(&pool, 0).unwrap(), Value::Int(i64::MAX));
            assert_eq!(list.get(&pool, 1).unwrap(), Value::Float(std::f64::consts::PI));
        }
        other => panic!("expected a list root, found {:?}", other),
    }
}
