//! Database facade: selects the index flavor from the stored type code
//! and forwards operations to it.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use crate::index::{Index, IndexType, LinearHashIndex, StaticHashIndex, StoreOp};
use crate::record;

#[derive(Debug)]
pub struct Db {
    name: String,
    index_type: IndexType,
    index: Index,
}

impl Db {
    /// Open the database `name`, creating it with `requested` when no
    /// index file exists yet. An existing index file decides its own
    /// flavor via the stored type code, whatever was requested.
    pub fn open(name: &str, requested: IndexType) -> Result<Db> {
        let idx_path = format!("{name}.idx");
        let (index_type, create) = if Path::new(&idx_path).is_file() {
            (stored_index_type(&idx_path)?, false)
        } else {
            (requested, true)
        };
        let index = match index_type {
            IndexType::Static => Index::Static(StaticHashIndex::open(name, create)?),
            IndexType::Linear => Index::Linear(LinearHashIndex::open(name, create)?),
        };
        Ok(Db {
            name: name.to_string(),
            index_type,
            index,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index_type(&self) -> IndexType {
        self.index_type
    }

    /// Look up a key. Absent keys yield `Ok("")`.
    pub fn fetch(&self, key: &str) -> Result<String> {
        self.index.fetch(key)
    }

    pub fn store(&mut self, key: &str, value: &str, op: StoreOp) -> Result<()> {
        self.index.store(key, value, op)
    }

    pub fn delete(&mut self, key: &str) -> Result<()> {
        self.index.delete(key)
    }

    pub fn fetch_all(&self) -> Result<HashMap<String, String>> {
        self.index.fetch_all()
    }

    pub fn close(self) -> Result<()> {
        self.index.close()
    }
}

/// Read the 3-byte ASCII type code off an existing index file.
fn stored_index_type(path: &str) -> Result<IndexType> {
    let f = File::open(path).with_context(|| format!("open {path}"))?;
    let code = record::read_type_code(&f)
        .with_context(|| format!("index init failed for {path}"))?;
    IndexType::from_code(code)
        .ok_or_else(|| anyhow!("index init failed: unknown index type {code} in {path}"))
}
