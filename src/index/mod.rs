//! Disk-resident hash indexes.
//!
//! Two flavors share the record layout, the free-list discipline, and
//! the byte-range locking protocol: [`StaticHashIndex`] over a fixed
//! bucket table and [`LinearHashIndex`], which grows one bucket at a
//! time as load increases. The [`Index`] enum is what the facade
//! dispatches on once the stored type code is known.

pub mod linear_hash;
pub mod static_hash;

pub use linear_hash::LinearHashIndex;
pub use static_hash::StaticHashIndex;

use anyhow::{bail, Context, Result};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};

use crate::consts::{DATLEN_MAX, DATLEN_MIN, IDXTYPE_LINEAR, IDXTYPE_STATIC, PTR_SZ};

/// How `store` treats an existing or missing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOp {
    /// Add a new record; error if the key exists.
    Insert,
    /// Replace an existing record; error if the key is missing.
    Update,
    /// Insert or replace.
    Upsert,
}

/// Index flavor, stored as a 3-byte ASCII code at the start of `.idx`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    Static,
    Linear,
}

impl IndexType {
    pub fn code(self) -> u32 {
        match self {
            IndexType::Static => IDXTYPE_STATIC,
            IndexType::Linear => IDXTYPE_LINEAR,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            IDXTYPE_STATIC => Some(IndexType::Static),
            IDXTYPE_LINEAR => Some(IndexType::Linear),
            _ => None,
        }
    }
}

/// An opened index of either flavor.
#[derive(Debug)]
pub enum Index {
    Static(StaticHashIndex),
    Linear(LinearHashIndex),
}

impl Index {
    pub fn fetch(&self, key: &str) -> Result<String> {
        match self {
            Index::Static(ix) => ix.fetch(key),
            Index::Linear(ix) => ix.fetch(key),
        }
    }

    pub fn store(&mut self, key: &str, value: &str, op: StoreOp) -> Result<()> {
        match (self, op) {
            (Index::Static(ix), StoreOp::Insert) => ix.insert(key, value),
            (Index::Static(ix), StoreOp::Update) => ix.update(key, value),
            (Index::Static(ix), StoreOp::Upsert) => ix.upsert(key, value),
            (Index::Linear(ix), StoreOp::Insert) => ix.insert(key, value),
            (Index::Linear(ix), StoreOp::Update) => ix.update(key, value),
            (Index::Linear(ix), StoreOp::Upsert) => ix.upsert(key, value),
        }
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        match self {
            Index::Static(ix) => ix.delete(key),
            Index::Linear(ix) => ix.delete(key),
        }
    }

    pub fn fetch_all(&self) -> Result<HashMap<String, String>> {
        match self {
            Index::Static(ix) => ix.fetch_all(),
            Index::Linear(ix) => ix.fetch_all(),
        }
    }

    pub fn close(self) -> Result<()> {
        match self {
            Index::Static(ix) => ix.close(),
            Index::Linear(ix) => ix.close(),
        }
    }
}

// ---------------- shared internals ----------------

/// A free-list slot whose key and data lengths matched a new record
/// exactly, already unlinked by `find_free`.
pub(crate) struct FreeSlot {
    pub idxoff: u64,
    pub datoff: u64,
}

pub(crate) fn open_db_file(path: &str, create: bool) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .open(path)
        .with_context(|| format!("open {path}"))
}

/// Validate store arguments; returns the on-disk data length (`value`
/// plus its newline terminator).
pub(crate) fn check_store_bounds(key: &str, value: &str) -> Result<u64> {
    if key.is_empty() {
        bail!("invalid key: must not be empty");
    }
    if key.contains(':') || key.contains('\n') {
        bail!("invalid key {key:?}: ':' and newline are reserved");
    }
    let datlen = value.len() as u64 + 1;
    if !(DATLEN_MIN..=DATLEN_MAX).contains(&datlen) {
        bail!(
            "invalid data length {}: stored records span {DATLEN_MIN} to {DATLEN_MAX} bytes",
            value.len()
        );
    }
    Ok(datlen)
}

/// Offset of the to-EOF lock taken while appending chain records. Sits
/// past the free pointer and every bucket slot so it never conflicts
/// with a pointer-byte lock.
pub(crate) fn append_guard_off(hash_off: u64, nbuckets: u64) -> u64 {
    hash_off + (nbuckets + 1) * PTR_SZ + 1
}
