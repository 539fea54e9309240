//! Linear-hashing index: a bucket array in `name.idx` that grows one
//! slot per split, chain records in `name.bkt`, values in `name.dat`.
//!
//! The 64-byte header carries `(nbuckets, split, nrecords)`. Every
//! operation holds a shared lock on header byte 0 for its whole
//! duration so its addressing stays valid; the split procedure runs
//! under an exclusive header lock and therefore alone.

use anyhow::{bail, Context, Result};
use log::debug;
use std::collections::HashMap;
use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::consts::{
    LINEAR_FREE_OFF, LINEAR_HASH_OFF, LOAD_DENOM, NBUCKETS_INIT, PTR_SZ, SPLIT_LOAD,
};
use crate::hash::linear_bucket;
use crate::index::{append_guard_off, check_store_bounds, open_db_file, FreeSlot, StoreOp};
use crate::lock::{acquire_range, LockMode, RangeGuard};
use crate::record::{self, encode_linear_header, encode_ptr, LinearHeader};

/// Handle to a linear-hash database. As with the static flavor, every
/// concurrent worker opens its own handle.
#[derive(Debug)]
pub struct LinearHashIndex {
    idx: File,
    bkt: File,
    dat: File,
}

/// Location of a chain pointer. Bucket slots and the free-list head
/// live in `.idx`; record NEXT fields live in `.bkt`.
#[derive(Debug, Clone, Copy)]
enum PtrLoc {
    Idx(u64),
    Bkt(u64),
}

struct ChainWalk {
    chainoff: u64,
    hit: Option<ChainHit>,
}

struct ChainHit {
    idxoff: u64,
    ptroff: PtrLoc,
    next: u64,
    keylen: u64,
    datoff: u64,
    datlen: u64,
}

impl LinearHashIndex {
    /// Open `name.idx`, `name.bkt` and `name.dat`, creating and
    /// initializing them when `create` is set. Initialization runs
    /// under a write lock on the whole index file.
    pub fn open(name: &str, create: bool) -> Result<Self> {
        let idx = open_db_file(&format!("{name}.idx"), create)?;
        let bkt = open_db_file(&format!("{name}.bkt"), create)?;
        let dat = open_db_file(&format!("{name}.dat"), create)?;
        if create {
            // lock, stat, and initialize atomically so racing creators
            // produce exactly one image
            let _init = acquire_range(&idx, LockMode::Exclusive, 0, 0)?;
            if idx.metadata().context("stat index file")?.len() == 0 {
                let hdr = LinearHeader::new(NBUCKETS_INIT);
                let mut image = encode_linear_header(&hdr);
                for _ in 0..(NBUCKETS_INIT + 1) {
                    image.push_str(&encode_ptr(0));
                }
                idx.write_all_at(image.as_bytes(), 0)
                    .with_context(|| format!("initialize {name}.idx"))?;
                // offset 0 of .bkt is the nil sentinel; pad it so the
                // first chain record lands past it
                bkt.write_all_at(b"\n", 0)
                    .with_context(|| format!("initialize {name}.bkt"))?;
                debug!("initialized linear index {name}.idx with {NBUCKETS_INIT} buckets");
            } else {
                record::read_linear_header(&idx)
                    .with_context(|| format!("index init failed for {name}.idx"))?;
            }
        } else {
            // existing database: validate the header under its byte lock
            let _hdr_lock = acquire_range(&idx, LockMode::Shared, 0, 1)?;
            record::read_linear_header(&idx)
                .with_context(|| format!("index init failed for {name}.idx"))?;
        }
        Ok(Self { idx, bkt, dat })
    }

    /// Close the handle; descriptors release on drop.
    pub fn close(self) -> Result<()> {
        Ok(())
    }

    /// Look up `key`; absent keys yield an empty string, not an error.
    pub fn fetch(&self, key: &str) -> Result<String> {
        let (_hdr_lock, hdr) = self.lock_header(LockMode::Shared)?;
        let (_chain, walk) = self.find_and_lock(&hdr, key, LockMode::Shared)?;
        match walk.hit {
            Some(hit) => record::read_data(&self.dat, hit.datoff, hit.datlen),
            None => Ok(String::new()),
        }
    }

    pub fn insert(&mut self, key: &str, value: &str) -> Result<()> {
        self.store(key, value, StoreOp::Insert)?;
        self.note_inserted()
    }

    pub fn update(&mut self, key: &str, value: &str) -> Result<()> {
        self.store(key, value, StoreOp::Update).map(|_| ())
    }

    pub fn upsert(&mut self, key: &str, value: &str) -> Result<()> {
        if self.store(key, value, StoreOp::Upsert)? {
            self.note_inserted()?;
        }
        Ok(())
    }

    /// Remove `key` if present and keep the header's record count in
    /// step. Deleting an absent key is a no-op.
    pub fn delete(&mut self, key: &str) -> Result<()> {
        let removed = {
            let (_hdr_lock, hdr) = self.lock_header(LockMode::Shared)?;
            let (_chain, walk) = self.find_and_lock(&hdr, key, LockMode::Exclusive)?;
            match walk.hit {
                Some(hit) => {
                    self.delete_found(&hit)?;
                    true
                }
                None => false,
            }
        };
        if removed {
            let (_hdr_lock, mut hdr) = self.lock_header(LockMode::Exclusive)?;
            hdr.nrecords = hdr.nrecords.saturating_sub(1);
            record::write_linear_header(&self.idx, &hdr)?;
        }
        Ok(())
    }

    /// Collect every record. The shared header lock held across the
    /// scan keeps the bucket count stable against splitters; buckets
    /// are still walked under their own chain locks.
    pub fn fetch_all(&self) -> Result<HashMap<String, String>> {
        let (_hdr_lock, hdr) = self.lock_header(LockMode::Shared)?;
        let mut records = HashMap::new();
        for bucket in 0..hdr.nbuckets {
            let chainoff = LINEAR_HASH_OFF + bucket * PTR_SZ;
            let _chain = acquire_range(&self.idx, LockMode::Shared, chainoff, 1)?;
            let mut off = record::read_ptr(&self.idx, chainoff)?;
            while off != 0 {
                let rec = record::read_chain_record(&self.bkt, off)?;
                let value = record::read_data(&self.dat, rec.datoff, rec.datlen)?;
                off = rec.next;
                records.insert(rec.key, value);
            }
        }
        Ok(records)
    }

    // ---------------- internals ----------------

    /// Lock header byte 0 and decode the header. The guard must outlive
    /// every addressing decision made from the snapshot.
    fn lock_header(&self, mode: LockMode) -> Result<(RangeGuard<'_>, LinearHeader)> {
        let guard = acquire_range(&self.idx, mode, 0, 1)?;
        let hdr = record::read_linear_header(&self.idx)?;
        Ok((guard, hdr))
    }

    /// Returns whether a new record was added (false for an in-place or
    /// delete-and-reinsert update of an existing key).
    fn store(&mut self, key: &str, value: &str, op: StoreOp) -> Result<bool> {
        let datlen = check_store_bounds(key, value)?;
        let (_hdr_lock, hdr) = self.lock_header(LockMode::Shared)?;
        let (_chain, walk) = self.find_and_lock(&hdr, key, LockMode::Exclusive)?;
        match walk.hit {
            None => {
                if op == StoreOp::Update {
                    bail!("record with key {key} does not exist");
                }
                self.link_new_record(&hdr, walk.chainoff, key, value, datlen)?;
                Ok(true)
            }
            Some(hit) => {
                if op == StoreOp::Insert {
                    bail!("record already exists with key {key}");
                }
                if datlen == hit.datlen {
                    record::write_data(&self.dat, hit.datoff, value)?;
                } else {
                    self.delete_found(&hit)?;
                    self.append_record(&hdr, walk.chainoff, key, value, datlen)?;
                }
                Ok(false)
            }
        }
    }

    /// Growth bookkeeping after a record was added: bump the persistent
    /// record count and split one bucket when the load crosses the
    /// threshold. The exclusive header lock keeps every other operation
    /// out while the table may be restructured.
    fn note_inserted(&mut self) -> Result<()> {
        let (_hdr_lock, mut hdr) = self.lock_header(LockMode::Exclusive)?;
        hdr.nrecords += 1;
        if load_factor(&hdr) >= SPLIT_LOAD {
            self.split(&mut hdr)?;
        }
        record::write_linear_header(&self.idx, &hdr)
    }

    fn find_and_lock(
        &self,
        hdr: &LinearHeader,
        key: &str,
        mode: LockMode,
    ) -> Result<(RangeGuard<'_>, ChainWalk)> {
        let bucket = linear_bucket(key, hdr.nbuckets, hdr.depth);
        let chainoff = LINEAR_HASH_OFF + bucket * PTR_SZ;
        let guard = acquire_range(&self.idx, mode, chainoff, 1)?;

        let mut ptroff = PtrLoc::Idx(chainoff);
        let mut off = record::read_ptr(&self.idx, chainoff)?;
        while off != 0 {
            let rec = record::read_chain_record(&self.bkt, off)?;
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
            ptroff = PtrLoc::Bkt(off);
            off = rec.next;
        }
        Ok((guard, ChainWalk { chainoff, hit: None }))
    }

    fn write_ptr_at(&self, loc: PtrLoc, val: u64) -> Result<()> {
        match loc {
            PtrLoc::Idx(off) => record::write_ptr(&self.idx, off, val),
            PtrLoc::Bkt(off) => record::write_ptr(&self.bkt, off, val),
        }
    }

    fn link_new_record(
        &self,
        hdr: &LinearHeader,
        chainoff: u64,
        key: &str,
        value: &str,
        datlen: u64,
    ) -> Result<()> {
        if let Some(slot) = self.find_free(key.len() as u64, datlen)? {
            let head = record::read_ptr(&self.idx, chainoff)?;
            record::write_data(&self.dat, slot.datoff, value)?;
            record::write_chain_record(&self.bkt, slot.idxoff, key, slot.datoff, datlen, head)?;
            record::write_ptr(&self.idx, chainoff, slot.idxoff)
        } else {
            self.append_record(hdr, chainoff, key, value, datlen)
        }
    }

    fn append_record(
        &self,
        hdr: &LinearHeader,
        chainoff: u64,
        key: &str,
        value: &str,
        datlen: u64,
    ) -> Result<()> {
        let head = record::read_ptr(&self.idx, chainoff)?;
        let datoff = self.append_data(value)?;
        let idxoff = self.append_chain_record(hdr, key, datoff, datlen, head)?;
        record::write_ptr(&self.idx, chainoff, idxoff)
    }

    fn append_data(&self, value: &str) -> Result<u64> {
        let _guard = acquire_range(&self.dat, LockMode::Exclusive, 0, 0)?;
        let off = self.dat.metadata().context("stat data file")?.len();
        record::write_data(&self.dat, off, value)?;
        Ok(off)
    }

    /// Append a chain record to `.bkt`. The append guard is a to-EOF
    /// lock on `.idx` past the bucket array, shared with nothing but
    /// other appenders.
    fn append_chain_record(
        &self,
        hdr: &LinearHeader,
        key: &str,
        datoff: u64,
        datlen: u64,
        next: u64,
    ) -> Result<u64> {
        let guard_off = append_guard_off(LINEAR_HASH_OFF, hdr.nbuckets);
        let _guard = acquire_range(&self.idx, LockMode::Exclusive, guard_off, 0)?;
        let off = self.bkt.metadata().context("stat bucket file")?.len();
        record::write_chain_record(&self.bkt, off, key, datoff, datlen, next)?;
        Ok(off)
    }

    fn find_free(&self, keylen: u64, datlen: u64) -> Result<Option<FreeSlot>> {
        let _guard = acquire_range(&self.idx, LockMode::Exclusive, LINEAR_FREE_OFF, 1)?;
        let mut save = PtrLoc::Idx(LINEAR_FREE_OFF);
        let mut off = record::read_ptr(&self.idx, LINEAR_FREE_OFF)?;
        while off != 0 {
            let rec = record::read_chain_record(&self.bkt, off)?;
            if rec.key.len() as u64 == keylen && rec.datlen == datlen {
                self.write_ptr_at(save, rec.next)?;
                return Ok(Some(FreeSlot { idxoff: off, datoff: rec.datoff }));
            }
            save = PtrLoc::Bkt(off);
            off = rec.next;
        }
        Ok(None)
    }

    /// Delete sequence for a located record; see the static flavor for
    /// the steps. The unlink write targets `.idx` when the predecessor
    /// is the bucket slot itself and `.bkt` otherwise.
    fn delete_found(&self, hit: &ChainHit) -> Result<()> {
        let _free = acquire_range(&self.idx, LockMode::Exclusive, LINEAR_FREE_OFF, 1)?;
        let blank_value = " ".repeat((hit.datlen as usize).saturating_sub(1));
        record::write_data(&self.dat, hit.datoff, &blank_value)?;
        let freeptr = record::read_ptr(&self.idx, LINEAR_FREE_OFF)?;
        let blank_key = " ".repeat(hit.keylen as usize);
        record::write_chain_record(&self.bkt, hit.idxoff, &blank_key, hit.datoff, hit.datlen, freeptr)?;
        record::write_ptr(&self.idx, LINEAR_FREE_OFF, hit.idxoff)?;
        self.write_ptr_at(hit.ptroff, hit.next)
    }

    /// Split the bucket at the split pointer: append a fresh bucket
    /// slot, advance the split state, rehash the old chain in place,
    /// and leave the updated header for the caller to persist. Records
    /// that now hash to the new bucket are prepended to it, NEXT first
    /// and bucket slot second, so both chains stay well formed after
    /// every single pointer write.
    fn split(&self, hdr: &mut LinearHeader) -> Result<()> {
        let old = hdr.split;
        let old_off = LINEAR_HASH_OFF + old * PTR_SZ;
        let _old_lock = acquire_range(&self.idx, LockMode::Exclusive, old_off, 1)?;

        let new_off = self.idx.metadata().context("stat index file")?.len();
        debug_assert_eq!(new_off, LINEAR_HASH_OFF + hdr.nbuckets * PTR_SZ);
        record::write_ptr(&self.idx, new_off, 0)?;
        let _new_lock = acquire_range(&self.idx, LockMode::Exclusive, new_off, 1)?;

        hdr.nbuckets += 1;
        if hdr.nbuckets > (1u64 << hdr.depth) {
            hdr.depth += 1;
        }
        hdr.split += 1;
        if hdr.split * 2 == hdr.nbuckets {
            hdr.split = 0;
        }
        debug!(
            "split bucket {old} -> {} (nbuckets {}, split {}, depth {})",
            hdr.nbuckets - 1,
            hdr.nbuckets,
            hdr.split,
            hdr.depth
        );

        let mut prev = PtrLoc::Idx(old_off);
        let mut new_head = 0u64;
        let mut off = record::read_ptr(&self.idx, old_off)?;
        while off != 0 {
            let rec = record::read_chain_record(&self.bkt, off)?;
            if linear_bucket(&rec.key, hdr.nbuckets, hdr.depth) != old {
                debug!("split: moving key {:?} from bucket {old} to {}", rec.key, hdr.nbuckets - 1);
                record::write_ptr(&self.bkt, off, new_head)?;
                record::write_ptr(&self.idx, new_off, off)?;
                new_head = off;
                self.write_ptr_at(prev, rec.next)?;
            } else {
                prev = PtrLoc::Bkt(off);
            }
            off = rec.next;
        }
        Ok(())
    }
}

fn load_factor(hdr: &LinearHeader) -> f64 {
    hdr.nrecords as f64 / (LOAD_DENOM * hdr.nbuckets) as f64
}
