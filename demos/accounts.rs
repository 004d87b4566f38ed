//! accounts -- a small ledger demo exercising `PersistentList` and
//! `#[derive(Persistent)]` records, grounded on the original `accounts.py`
//! demo (which used a `PersistentDict`; this crate has no dict, so the
//! ledger is a `PersistentList<Account>` instead, scanned by name).
//!
//! ```text
//! cargo run --example accounts -- create checking 100
//! cargo run --example accounts -- list
//! ```

use std::env;
use std::path::PathBuf;

use pmemobj::list::PersistentList;
use pmemobj::pool::{OpenFlag, Pool};
use pmemobj::Persistent;

#[derive(Persistent)]
struct Account {
    name: String,
    cents: i64,
}

fn pool_path() -> PathBuf {
    env::var("ACCOUNTS_POOL")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("accounts.pmem"))
}

fn open_ledger(pool: &Pool) -> pmemobj::Result<PersistentList> {
    use pmemobj::cache::Value;
    match pool.root()? {
        Value::Nothing => {
            let list = pool.in_transaction(|| {
                let list = PersistentList::new(pool)?;
                pool.set_root(&list)?;
                Ok(list)
            })?;
            Ok(list)
        }
        Value::List(oid) => Ok(PersistentList::attach(oid)),
        other => panic!("ledger root is not a list: {:?}", other),
    }
}

fn main() -> pmemobj::Result<()> {
    let path = pool_path();
    let pool = Pool::open_with_flag(&path, OpenFlag::CreateOrOpen, 8 * 1024 * 1024)?;
    pool.register::<Account>();
    let ledger = open_ledger(&pool)?;

    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("create") => {
            let name = args.get(1).expect("usage: accounts create <name> <cents>");
            let cents: i64 = args
                .get(2)
                .map(|s| s.parse().expect("amount must be an integer number of cents"))
                .unwrap_or(0);
            pool.in_transaction(|| {
                ledger.append(
                    &pool,
                    &Account {
                        name: name.clone(),
                        cents,
                    },
                )
            })?;
            println!("Created account '{}'.", name);
        }
        _ => {
            use pmemobj::cache::Value;
            let count = ledger.len(&pool)?;
            if count == 0 {
                println!("No accounts currently exist. Add one with 'accounts create <name> <cents>'.");
                return Ok(());
            }
            println!("Account           Balance");
            println!("-------           -------");
            let mut total = 0i64;
            for i in 0..count as i64 {
                if let Value::Record(oid) = ledger.get(&pool, i)? {
                    let account: Account = pool.get(oid)?;
                    println!("{:<18}{}", account.name, account.cents);
                    total += account.cents;
                }
            }
            println!("                         _______");
            println!("    Net Worth:           {}", total);
        }
    }

    pool.close();
    Ok(())
}
