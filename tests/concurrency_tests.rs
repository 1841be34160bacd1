//! Concurrency tests
//!
//! These tests verify:
//! - Racing table lookups converge on one cached instance
//! - Concurrent writers to one key never corrupt it
//! - Readers only ever observe complete values
//! - Exactly one of several racing creates wins
//! - Readers racing a key's creation and removal see the value or nothing
//! - Two Database handles on one root (as two processes would be) cooperate

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use flockd::Database;
use tempfile::TempDir;

/// Generous so contention never turns into a spurious timeout.
const TIMEOUT: Duration = Duration::from_secs(5);

fn setup_shared_db() -> (TempDir, Arc<Database>) {
    let temp_dir = TempDir::new().unwrap();
    let db = Arc::new(Database::new(temp_dir.path(), TIMEOUT).unwrap());
    (temp_dir, db)
}

#[test]
fn test_racing_table_lookups_share_one_instance() {
    let (_temp, db) = setup_shared_db();
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let db = Arc::clone(&db);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                db.table("shared").unwrap()
            })
        })
        .collect();

    let tables: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    for table in &tables[1..] {
        assert!(Arc::ptr_eq(&tables[0], table));
    }
    assert_eq!(db.cached_table_count(), 1);
}

#[test]
fn test_concurrent_writers_same_key() {
    let (temp, db) = setup_shared_db();
    let writers = 4;
    let writes_per_thread = 25;

    let handles: Vec<_> = (0..writers)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                for i in 0..writes_per_thread {
                    db.set("contended", format!("writer{t}-{i}").as_bytes())
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let value = String::from_utf8(db.get("contended").unwrap()).unwrap();
    assert!(value.starts_with("writer"));
    assert!(value.ends_with(&format!("-{}", writes_per_thread - 1)));

    // No temp files left behind by any writer.
    let leftovers: Vec<_> = std::fs::read_dir(temp.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|name| name != "contended.kv")
        .collect();
    assert!(leftovers.is_empty(), "leftover files: {leftovers:?}");
}

#[test]
fn test_readers_see_complete_values() {
    let (_temp, db) = setup_shared_db();
    let short = vec![b'a'; 16];
    let long = vec![b'b'; 64 * 1024];
    db.set("flip", &short).unwrap();

    let writer = {
        let db = Arc::clone(&db);
        let (short, long) = (short.clone(), long.clone());
        thread::spawn(move || {
            for i in 0..50 {
                let value = if i % 2 == 0 { &long } else { &short };
                db.set("flip", value).unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            let (short, long) = (short.clone(), long.clone());
            thread::spawn(move || {
                for _ in 0..50 {
                    let value = db.get("flip").unwrap();
                    assert!(value == short || value == long, "torn read of {} bytes", value.len());
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn test_racing_creates_have_one_winner() {
    let (_temp, db) = setup_shared_db();
    let contenders = 8;
    let barrier = Arc::new(Barrier::new(contenders));
    let winners = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..contenders)
        .map(|t| {
            let db = Arc::clone(&db);
            let barrier = Arc::clone(&barrier);
            let winners = Arc::clone(&winners);
            thread::spawn(move || {
                barrier.wait();
                match db.create("prize", format!("winner{t}").as_bytes()) {
                    Ok(()) => {
                        winners.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => assert!(e.is_already_exists(), "unexpected error: {e}"),
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(winners.load(Ordering::SeqCst), 1);
    let value = String::from_utf8(db.get("prize").unwrap()).unwrap();
    assert!(value.starts_with("winner"));
}

#[test]
fn test_readers_never_see_unwritten_values() {
    let (_temp, db) = setup_shared_db();
    let value = b"nonempty value";
    let done = Arc::new(AtomicBool::new(false));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let db = Arc::clone(&db);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut reads = 0;
                while !done.load(Ordering::SeqCst) {
                    match db.get("k") {
                        Ok(read) => {
                            assert_eq!(read, value, "read a value nobody wrote");
                            reads += 1;
                        }
                        Err(e) => assert!(e.is_not_found(), "unexpected error: {e}"),
                    }
                }
                reads
            })
        })
        .collect();

    for round in 0..1000 {
        if round % 2 == 0 {
            db.set("k", value).unwrap();
        } else {
            db.create("k", value).unwrap();
        }
        db.delete("k").unwrap();
    }
    done.store(true, Ordering::SeqCst);

    for reader in readers {
        reader.join().unwrap();
    }
}

#[test]
fn test_delete_racing_set_leaves_a_consistent_key() {
    let (_temp, db) = setup_shared_db();

    for _ in 0..200 {
        let writer = {
            let db = Arc::clone(&db);
            thread::spawn(move || db.set("k", b"value").unwrap())
        };
        db.delete("k").unwrap();
        writer.join().unwrap();

        // Either order is fine, but the key is whole or gone.
        match db.get("k") {
            Ok(read) => assert_eq!(read, b"value"),
            Err(e) => assert!(e.is_not_found(), "unexpected error: {e}"),
        }
        db.delete("k").unwrap();
    }
}

#[test]
fn test_distinct_keys_in_parallel() {
    let (_temp, db) = setup_shared_db();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let db = Arc::clone(&db);
            thread::spawn(move || {
                let table = db.table(&format!("t{t}")).unwrap();
                for i in 0..25 {
                    let key = format!("thread{t}_key{i}");
                    table.create(&key, format!("thread{t}_value{i}").as_bytes()).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for t in 0..4 {
        let table = db.table(&format!("t{t}")).unwrap();
        assert_eq!(table.keys().unwrap().len(), 25);
        for i in 0..25 {
            let value = table.get(&format!("thread{t}_key{i}")).unwrap();
            assert_eq!(value, format!("thread{t}_value{i}").as_bytes());
        }
    }
}

#[test]
fn test_two_handles_on_one_root() {
    let temp = TempDir::new().unwrap();
    let first = Database::new(temp.path(), TIMEOUT).unwrap();
    let second = Database::new(temp.path(), TIMEOUT).unwrap();

    first.table("shared").unwrap().set("k", b"from first").unwrap();
    assert_eq!(second.table("shared").unwrap().get("k").unwrap(), b"from first");

    second.table("shared").unwrap().update("k", b"from second").unwrap();
    assert_eq!(first.table("shared").unwrap().get("k").unwrap(), b"from second");

    first.table("shared").unwrap().delete("k").unwrap();
    assert!(second.table("shared").unwrap().get("k").unwrap_err().is_not_found());
}
