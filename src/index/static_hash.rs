//! Fixed-size hash index: 137 bucket chains in `name.idx`, values in
//! `name.dat`.
//!
//! The index file is `header || free ptr || bucket array || chain
//! records`; all of it is mutated in place. Readers and writers on a
//! bucket serialize on a single-byte lock over that bucket's slot, so
//! operations on distinct buckets run in parallel, across threads and
//! processes alike.

use anyhow::{bail, Context, Result};
use log::debug;
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::consts::{
    IDXTYPE_STATIC, NHASH_STATIC, PTR_SZ, STATIC_FREE_OFF, STATIC_HASH_OFF,
};
use crate::hash::static_bucket;
use crate::index::{append_guard_off, check_store_bounds, open_db_file, FreeSlot, StoreOp};
use crate::lock::{acquire_range, LockMode, RangeGuard};
use crate::record::{self, encode_ptr, encode_static_header};

/// Handle to a static-table database. Every concurrent worker opens its
/// own handle: the advisory locks are per open file description, so a
/// shared handle's locks would never contend with themselves.
#[derive(Debug)]
pub struct StaticHashIndex {
    idx: File,
    dat: File,
}

/// Outcome of a chain walk. The chain-byte guard is handed back
/// separately so the caller decides when the bucket unlocks.
struct ChainWalk {
    chainoff: u64,
    hit: Option<ChainHit>,
}

/// A record located on its bucket chain. `ptroff` is the offset of the
/// pointer that references the record: the bucket slot itself or the
/// predecessor record's NEXT field.
struct ChainHit {
    idxoff: u64,
    ptroff: u64,
    next: u64,
    keylen: u64,
    datoff: u64,
    datlen: u64,
}

impl StaticHashIndex {
    /// Open `name.idx` and `name.dat`, creating and initializing them
    /// when `create` is set. The init/validate step runs under a write
    /// lock on the whole index file so racing creators produce exactly
    /// one 971-byte image.
    pub fn open(name: &str, create: bool) -> Result<Self> {
        let idx = open_db_file(&format!("{name}.idx"), create)?;
        let dat = open_db_file(&format!("{name}.dat"), create)?;
        if create {
            // lock, stat, and initialize atomically so racing creators
            // produce exactly one image
            let _init = acquire_range(&idx, LockMode::Exclusive, 0, 0)?;
            if idx.metadata().context("stat index file")?.len() == 0 {
                let mut image = encode_static_header();
                for _ in 0..(NHASH_STATIC + 1) {
                    image.push_str(&encode_ptr(0));
                }
                image.push('\n');
                idx.write_all_at(image.as_bytes(), 0)
                    .with_context(|| format!("initialize {name}.idx"))?;
                debug!("initialized static index {name}.idx ({} bytes)", image.len());
            } else {
                check_type_code(&idx, name)?;
            }
        } else {
            check_type_code(&idx, name)?;
        }
        Ok(Self { idx, dat })
    }

    /// Close the handle. The descriptors (and any lock they might still
    /// hold) are released on drop; this form makes the close point
    /// explicit for callers that want one.
    pub fn close(self) -> Result<()> {
        Ok(())
    }

    /// Look up `key`; absent keys yield an empty string, not an error.
    pub fn fetch(&self, key: &str) -> Result<String> {
        let (_chain, walk) = self.find_and_lock(key, LockMode::Shared)?;
        match walk.hit {
            Some(hit) => record::read_data(&self.dat, hit.datoff, hit.datlen),
            None => Ok(String::new()),
        }
    }

    pub fn insert(&mut self, key: &str, value: &str) -> Result<()> {
        self.store(key, value, StoreOp::Insert)
    }

    pub fn update(&mut self, key: &str, value: &str) -> Result<()> {
        self.store(key, value, StoreOp::Update)
    }

    pub fn upsert(&mut self, key: &str, value: &str) -> Result<()> {
        self.store(key, value, StoreOp::Upsert)
    }

    /// Remove `key` if present: blank its value and key bytes, push the
    /// chain record onto the free list, unlink it from its bucket.
    /// Deleting an absent key is a no-op.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        let (_chain, walk) = self.find_and_lock(key, LockMode::Exclusive)?;
        if let Some(hit) = walk.hit {
            self.delete_found(&hit)?;
        }
        Ok(())
    }

    /// Collect every record, bucket by bucket. Each bucket is walked
    /// under its own chain lock, so writers on other buckets proceed
    /// while the scan runs.
    pub fn fetch_all(&self) -> Result<HashMap<String, String>> {
        let mut records = HashMap::new();
        for bucket in 0..NHASH_STATIC {
            let chainoff = STATIC_HASH_OFF + bucket * PTR_SZ;
            let _chain = acquire_range(&self.idx, LockMode::Shared, chainoff, 1)?;
            let mut off = record::read_ptr(&self.idx, chainoff)?;
            while off != 0 {
                let rec = record::read_chain_record(&self.idx, off)?;
                let value = record::read_data(&self.dat, rec.datoff, rec.datlen)?;
                off = rec.next;
                records.insert(rec.key, value);
            }
        }
        Ok(records)
    }

    // ---------------- internals ----------------

    fn store(&mut self, key: &str, value: &str, op: StoreOp) -> Result<()> {
        let datlen = check_store_bounds(key, value)?;
        let (_chain, walk) = self.find_and_lock(key, LockMode::Exclusive)?;
        match walk.hit {
            None => {
                if op == StoreOp::Update {
                    bail!("record with key {key} does not exist");
                }
                self.link_new_record(walk.chainoff, key, value, datlen)
            }
            Some(hit) => {
                if op == StoreOp::Insert {
                    bail!("record already exists with key {key}");
                }
                if datlen == hit.datlen {
                    // same stored size: overwrite the value in place
                    record::write_data(&self.dat, hit.datoff, value)
                } else {
                    self.delete_found(&hit)?;
                    self.append_record(walk.chainoff, key, value, datlen)
                }
            }
        }
    }

    /// Lock the bucket byte for `key` and walk its chain. The caller
    /// unlocks by dropping the returned guard.
    fn find_and_lock(&self, key: &str, mode: LockMode) -> Result<(RangeGuard<'_>, ChainWalk)> {
        let chainoff = STATIC_HASH_OFF + static_bucket(key, NHASH_STATIC) * PTR_SZ;
        let guard = acquire_range(&self.idx, mode, chainoff, 1)?;

        let mut ptroff = chainoff;
        let mut off = record::read_ptr(&self.idx, chainoff)?;
        while off != 0 {
            let rec = record::read_chain_record(&self.idx, off)?;
            if rec.key == key {
                let hit = ChainHit {
                    idxoff: off,
                    ptroff,
                    next: rec.next,
                    keylen: rec.key.len() as u64,
                    datoff: rec.datoff,
                    datlen: rec.datlen,
                };
                return Ok((guard, ChainWalk { chainoff, hit: Some(hit) }));
            }
            ptroff = off;
            off = rec.next;
        }
        Ok((guard, ChainWalk { chainoff, hit: None }))
    }

    /// Insert path: reuse an exact-size free slot when one exists,
    /// append otherwise, then link the record at the head of its chain.
    fn link_new_record(&self, chainoff: u64, key: &str, value: &str, datlen: u64) -> Result<()> {
        if let Some(slot) = self.find_free(key.len() as u64, datlen)? {
            let head = record::read_ptr(&self.idx, chainoff)?;
            record::write_data(&self.dat, slot.datoff, value)?;
            record::write_chain_record(&self.idx, slot.idxoff, key, slot.datoff, datlen, head)?;
            record::write_ptr(&self.idx, chainoff, slot.idxoff)
        } else {
            self.append_record(chainoff, key, value, datlen)
        }
    }

    /// Append a fresh data record and chain record and link them at the
    /// head of the bucket chain.
    fn append_record(&self, chainoff: u64, key: &str, value: &str, datlen: u64) -> Result<()> {
        let head = record::read_ptr(&self.idx, chainoff)?;
        let datoff = self.append_data(value)?;
        let idxoff = self.append_chain_record(key, datoff, datlen, head)?;
        record::write_ptr(&self.idx, chainoff, idxoff)
    }

    /// Append `value` to the data file under a whole-file write lock and
    /// return its offset.
    fn append_data(&self, value: &str) -> Result<u64> {
        let _guard = acquire_range(&self.dat, LockMode::Exclusive, 0, 0)?;
        let off = self.dat.metadata().context("stat data file")?.len();
        record::write_data(&self.dat, off, value)?;
        Ok(off)
    }

    /// Append a chain record past the bucket array under the to-EOF
    /// append-guard lock and return its offset.
    fn append_chain_record(&self, key: &str, datoff: u64, datlen: u64, next: u64) -> Result<u64> {
        let guard_off = append_guard_off(STATIC_HASH_OFF, NHASH_STATIC);
        let _guard = acquire_range(&self.idx, LockMode::Exclusive, guard_off, 0)?;
        let off = self.idx.metadata().context("stat index file")?.len();
        record::write_chain_record(&self.idx, off, key, datoff, datlen, next)?;
        Ok(off)
    }

    /// Walk the free list under the free-head write lock for a slot
    /// whose key length and data length both match exactly. A match is
    /// unlinked and returned; no resizing of freed slots is attempted.
    fn find_free(&self, keylen: u64, datlen: u64) -> Result<Option<FreeSlot>> {
        let _guard = acquire_range(&self.idx, LockMode::Exclusive, STATIC_FREE_OFF, 1)?;
        let mut saveoff = STATIC_FREE_OFF;
        let mut off = record::read_ptr(&self.idx, STATIC_FREE_OFF)?;
        while off != 0 {
            let rec = record::read_chain_record(&self.idx, off)?;
            if rec.key.len() as u64 == keylen && rec.datlen == datlen {
                record::write_ptr(&self.idx, saveoff, rec.next)?;
                return Ok(Some(FreeSlot { idxoff: off, datoff: rec.datoff }));
            }
            saveoff = off;
            off = rec.next;
        }
        Ok(None)
    }

    /// Delete sequence for a located record, run under the caller's
    /// chain lock plus the free-head lock: blank the value and the key
    /// (so no future lookup can match the slot), thread the record onto
    /// the free list, then unlink it from its bucket chain.
    fn delete_found(&self, hit: &ChainHit) -> Result<()> {
        let _free = acquire_range(&self.idx, LockMode::Exclusive, STATIC_FREE_OFF, 1)?;
        let blank_value = " ".repeat((hit.datlen as usize).saturating_sub(1));
        record::write_data(&self.dat, hit.datoff, &blank_value)?;
        let freeptr = record::read_ptr(&self.idx, STATIC_FREE_OFF)?;
        let blank_key = " ".repeat(hit.keylen as usize);
        record::write_chain_record(&self.idx, hit.idxoff, &blank_key, hit.datoff, hit.datlen, freeptr)?;
        record::write_ptr(&self.idx, STATIC_FREE_OFF, hit.idxoff)?;
        record::write_ptr(&self.idx, hit.ptroff, hit.next)
    }
}

fn check_type_code(idx: &File, name: &str) -> Result<()> {
    let code = record::read_type_code(idx)
        .with_context(|| format!("index init failed for {name}.idx"))?;
    if code != IDXTYPE_STATIC {
        bail!("index init failed: {name}.idx has type code {code}, not a static index");
    }
    Ok(())
}
