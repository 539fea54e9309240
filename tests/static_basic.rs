use anyhow::Result;
use std::fs;
use std::path::PathBuf;

use kilndb::StaticHashIndex;

const EMPTY_IDX_SIZE: u64 = 971;

#[test]
fn create_writes_fixed_image() -> Result<()> {
    let name = unique_db("create");
    let _ix = StaticHashIndex::open(&name, true)?;

    assert_eq!(fs::metadata(format!("{name}.idx"))?.len(), EMPTY_IDX_SIZE);
    assert_eq!(fs::metadata(format!("{name}.dat"))?.len(), 0);

    remove_db(&name);
    Ok(())
}

#[test]
fn insert_then_fetch() -> Result<()> {
    let name = unique_db("insert");
    let mut ix = StaticHashIndex::open(&name, true)?;

    ix.insert("k1", "v1")?;
    assert_eq!(ix.fetch("k1")?, "v1");
    assert_eq!(ix.fetch("k_absent")?, "", "missing keys read as empty");

    remove_db(&name);
    Ok(())
}

#[test]
fn many_records_roundtrip() -> Result<()> {
    let name = unique_db("many");
    let mut ix = StaticHashIndex::open(&name, true)?;

    for i in 0..100 {
        ix.insert(&format!("k{i}"), &format!("v{i}"))?;
    }
    for i in 0..100 {
        assert_eq!(ix.fetch(&format!("k{i}"))?, format!("v{i}"));
    }

    remove_db(&name);
    Ok(())
}

#[test]
fn delete_even_keys() -> Result<()> {
    let name = unique_db("delete");
    let mut ix = StaticHashIndex::open(&name, true)?;

    for i in 0..10 {
        ix.insert(&format!("k{i}"), &format!("v{i}"))?;
    }
    for i in (0..10).step_by(2) {
        ix.delete(&format!("k{i}"))?;
    }
    for i in 0..10 {
        let got = ix.fetch(&format!("k{i}"))?;
        if i % 2 == 0 {
            assert_eq!(got, "", "k{i} should be gone");
        } else {
            assert_eq!(got, format!("v{i}"));
        }
    }

    // deleting what is already gone is a no-op
    ix.delete("k0")?;
    ix.delete("never_there")?;

    remove_db(&name);
    Ok(())
}

#[test]
fn delete_then_insert_reuses_freed_slot() -> Result<()> {
    let name = unique_db("reuse");
    let mut ix = StaticHashIndex::open(&name, true)?;

    ix.insert("k1", "v1")?;
    let idx_size = fs::metadata(format!("{name}.idx"))?.len();
    let dat_size = fs::metadata(format!("{name}.dat"))?.len();

    ix.delete("k1")?;
    ix.insert("k1", "v3")?;

    assert_eq!(ix.fetch("k1")?, "v3");
    assert_eq!(
        fs::metadata(format!("{name}.idx"))?.len(),
        idx_size,
        "same-size reinsert must reuse the freed chain record"
    );
    assert_eq!(
        fs::metadata(format!("{name}.dat"))?.len(),
        dat_size,
        "same-size reinsert must reuse the freed data slot"
    );

    remove_db(&name);
    Ok(())
}

#[test]
fn update_same_length_is_in_place() -> Result<()> {
    let name = unique_db("update");
    let mut ix = StaticHashIndex::open(&name, true)?;

    ix.insert("k1", "v1")?;
    let dat_size = fs::metadata(format!("{name}.dat"))?.len();

    ix.update("k1", "v9")?;
    assert_eq!(ix.fetch("k1")?, "v9");
    assert_eq!(fs::metadata(format!("{name}.dat"))?.len(), dat_size);

    // a different length reinserts; the old slot goes to the free list
    ix.update("k1", "longer")?;
    assert_eq!(ix.fetch("k1")?, "longer");
    let grown = fs::metadata(format!("{name}.dat"))?.len();
    assert_eq!(grown, dat_size + "longer\n".len() as u64);

    // a new record with the freed slot's exact key/data lengths reuses it
    ix.insert("k2", "ab")?;
    assert_eq!(fs::metadata(format!("{name}.dat"))?.len(), grown);
    assert_eq!(ix.fetch("k2")?, "ab");
    assert_eq!(ix.fetch("k1")?, "longer");

    remove_db(&name);
    Ok(())
}

#[test]
fn insert_existing_key_fails_and_keeps_value() -> Result<()> {
    let name = unique_db("dup");
    let mut ix = StaticHashIndex::open(&name, true)?;

    ix.insert("k1", "v1")?;
    let err = ix.insert("k1", "v2").unwrap_err().to_string();
    assert!(err.contains("already exists"), "{err}");
    assert_eq!(ix.fetch("k1")?, "v1");

    remove_db(&name);
    Ok(())
}

#[test]
fn update_missing_key_fails() -> Result<()> {
    let name = unique_db("miss");
    let mut ix = StaticHashIndex::open(&name, true)?;

    let err = ix.update("ghost", "v1").unwrap_err().to_string();
    assert!(err.contains("does not exist"), "{err}");
    assert_eq!(ix.fetch("ghost")?, "");

    remove_db(&name);
    Ok(())
}

#[test]
fn upsert_inserts_then_replaces() -> Result<()> {
    let name = unique_db("upsert");
    let mut ix = StaticHashIndex::open(&name, true)?;

    ix.upsert("k1", "v1")?;
    assert_eq!(ix.fetch("k1")?, "v1");
    ix.upsert("k1", "v2")?;
    assert_eq!(ix.fetch("k1")?, "v2");
    ix.upsert("k1", "another")?;
    assert_eq!(ix.fetch("k1")?, "another");

    remove_db(&name);
    Ok(())
}

#[test]
fn fetch_all_returns_exact_mapping() -> Result<()> {
    let name = unique_db("all");
    let mut ix = StaticHashIndex::open(&name, true)?;

    for i in 0..100 {
        ix.insert(&format!("k{i}"), &format!("v{i}"))?;
    }
    ix.delete("k3")?;
    ix.delete("k77")?;

    let records = ix.fetch_all()?;
    assert_eq!(records.len(), 98);
    for i in 0..100 {
        let key = format!("k{i}");
        match records.get(&key) {
            Some(v) if i != 3 && i != 77 => assert_eq!(v, &format!("v{i}")),
            None if i == 3 || i == 77 => {}
            other => panic!("unexpected entry for {key}: {other:?}"),
        }
    }

    remove_db(&name);
    Ok(())
}

#[test]
fn value_length_bounds() -> Result<()> {
    let name = unique_db("bounds");
    let mut ix = StaticHashIndex::open(&name, true)?;

    // stored record is value + newline, capped at 1024
    let max_ok = "x".repeat(1023);
    ix.insert("big", &max_ok)?;
    assert_eq!(ix.fetch("big")?, max_ok);

    let too_big = "x".repeat(1024);
    assert!(ix.insert("big2", &too_big).is_err());
    assert!(ix.insert("empty", "").is_err());
    assert_eq!(ix.fetch("big2")?, "");

    remove_db(&name);
    Ok(())
}

#[test]
fn key_bounds() -> Result<()> {
    let name = unique_db("keys");
    let mut ix = StaticHashIndex::open(&name, true)?;

    assert!(ix.insert("", "v1").is_err());
    assert!(ix.insert("a:b", "v1").is_err());

    let long_ok = "k".repeat(900);
    ix.insert(&long_ok, "v1")?;
    assert_eq!(ix.fetch(&long_ok)?, "v1");

    // key pushes the chain record past IDXLEN_MAX
    let too_long = "k".repeat(1200);
    assert!(ix.insert(&too_long, "v1").is_err());

    remove_db(&name);
    Ok(())
}

fn unique_db(prefix: &str) -> String {
    let pid = std::process::id();
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let path: PathBuf = std::env::temp_dir().join(format!("kilndb-static-{prefix}-{pid}-{t}"));
    path.to_string_lossy().into_owned()
}

fn remove_db(name: &str) {
    for ext in ["idx", "bkt", "dat"] {
        let _ = fs::remove_file(format!("{name}.{ext}"));
    }
}
