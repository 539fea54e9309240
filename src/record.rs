//! ASCII record codec for the index, bucket, and data files.
//!
//! Integers are fixed-width, right-aligned, space-padded decimal; every
//! variable-length record ends in a single `'\n'` that doubles as the
//! corruption sentinel. All I/O is positional (`read_exact_at` /
//! `write_all_at`) so handles carry no seek state and concurrent
//! operations on one file never trample each other's cursor.

use anyhow::{anyhow, bail, Context, Result};
use std::fs::File;
use std::os::unix::fs::FileExt;

use crate::consts::{
    DATLEN_MAX, IDXLEN_MAX, IDXLEN_MIN, IDXLEN_SZ, IDXREC_HDR_SZ, IDXTYPE_LINEAR, IDXTYPE_SZ,
    IDXTYPE_STATIC, NBUCKETS_SZ, NRECORDS_SZ, PTR_SZ, PTR_MAX, SPLIT_SZ,
};

/// A decoded chain record. For deleted records on the free list, `key`
/// is all spaces of the original key's length.
#[derive(Debug, Clone)]
pub struct ChainRecord {
    pub next: u64,
    pub idxlen: u64,
    pub key: String,
    pub datoff: u64,
    pub datlen: u64,
}

// ---------------- pointers ----------------

/// Read a 7-byte chain pointer (free head, bucket slot, or a record's
/// NEXT field) at `off`.
pub fn read_ptr(file: &File, off: u64) -> Result<u64> {
    let mut buf = [0u8; PTR_SZ as usize];
    file.read_exact_at(&mut buf, off)
        .with_context(|| format!("read pointer at offset {off}"))?;
    let val = parse_ascii(&buf, "pointer", off)?;
    if val > PTR_MAX {
        bail!("corrupt pointer at offset {off}: {val} exceeds {PTR_MAX}");
    }
    Ok(val)
}

/// Write a 7-byte chain pointer at `off`.
pub fn write_ptr(file: &File, off: u64, val: u64) -> Result<()> {
    if val > PTR_MAX {
        bail!("pointer value {val} exceeds {PTR_MAX}");
    }
    file.write_all_at(encode_ptr(val).as_bytes(), off)
        .with_context(|| format!("write pointer at offset {off}"))
}

pub fn encode_ptr(val: u64) -> String {
    format!("{:width$}", val, width = PTR_SZ as usize)
}

// ---------------- chain records ----------------

/// Read and validate the chain record at `off`.
pub fn read_chain_record(file: &File, off: u64) -> Result<ChainRecord> {
    let mut hdr = [0u8; IDXREC_HDR_SZ as usize];
    file.read_exact_at(&mut hdr, off)
        .with_context(|| format!("read chain record header at offset {off}"))?;
    let next = parse_ascii(&hdr[..PTR_SZ as usize], "next pointer", off)?;
    if next > PTR_MAX {
        bail!("corrupt chain record at offset {off}: next pointer {next} exceeds {PTR_MAX}");
    }
    let idxlen = parse_ascii(&hdr[PTR_SZ as usize..], "record length", off)?;
    if !(IDXLEN_MIN..=IDXLEN_MAX).contains(&idxlen) {
        bail!("corrupt chain record at offset {off}: length {idxlen} out of range");
    }

    let mut body = vec![0u8; idxlen as usize];
    file.read_exact_at(&mut body, off + IDXREC_HDR_SZ)
        .with_context(|| format!("read chain record body at offset {off}"))?;
    if body.last() != Some(&b'\n') {
        bail!("corrupt chain record at offset {off}: missing trailing newline");
    }
    body.pop();
    let text = std::str::from_utf8(&body)
        .map_err(|_| anyhow!("corrupt chain record at offset {off}: not ascii"))?;

    let fields: Vec<&str> = text.split(':').collect();
    if fields.len() != 3 {
        bail!(
            "corrupt chain record at offset {off}: expected 3 fields, found {}",
            fields.len()
        );
    }
    let datoff = fields[1]
        .parse::<u64>()
        .map_err(|_| anyhow!("corrupt chain record at offset {off}: bad data offset"))?;
    let datlen = fields[2]
        .parse::<u64>()
        .map_err(|_| anyhow!("corrupt chain record at offset {off}: bad data length"))?;
    if datlen > DATLEN_MAX {
        bail!("corrupt chain record at offset {off}: data length {datlen} out of range");
    }

    Ok(ChainRecord {
        next,
        idxlen,
        key: fields[0].to_string(),
        datoff,
        datlen,
    })
}

/// Write a chain record at `off`. The caller guarantees that an
/// in-place rewrite has the same byte length as the record it replaces
/// (same key length, same `datoff`/`datlen` values).
pub fn write_chain_record(
    file: &File,
    off: u64,
    key: &str,
    datoff: u64,
    datlen: u64,
    next: u64,
) -> Result<()> {
    if next > PTR_MAX {
        bail!("pointer value {next} exceeds {PTR_MAX}");
    }
    let body = format!("{key}:{datoff}:{datlen}\n");
    let idxlen = body.len() as u64;
    if !(IDXLEN_MIN..=IDXLEN_MAX).contains(&idxlen) {
        bail!("invalid index record length {idxlen} for key of {} bytes", key.len());
    }
    let rec = format!(
        "{:ptr$}{:len$}{}",
        next,
        idxlen,
        body,
        ptr = PTR_SZ as usize,
        len = IDXLEN_SZ as usize
    );
    file.write_all_at(rec.as_bytes(), off)
        .with_context(|| format!("write chain record at offset {off}"))
}

// ---------------- data records ----------------

/// Read `datlen` bytes at `datoff`, verify the newline sentinel, and
/// return the value without it.
pub fn read_data(file: &File, datoff: u64, datlen: u64) -> Result<String> {
    let mut buf = vec![0u8; datlen as usize];
    file.read_exact_at(&mut buf, datoff)
        .with_context(|| format!("read data record at offset {datoff}"))?;
    if buf.last() != Some(&b'\n') {
        bail!("corrupt data record at offset {datoff}: missing trailing newline");
    }
    buf.pop();
    String::from_utf8(buf).map_err(|_| anyhow!("corrupt data record at offset {datoff}: not utf-8"))
}

/// Write `value` plus its newline terminator at `datoff`.
pub fn write_data(file: &File, datoff: u64, value: &str) -> Result<()> {
    let rec = format!("{value}\n");
    file.write_all_at(rec.as_bytes(), datoff)
        .with_context(|| format!("write data record at offset {datoff}"))
}

// ---------------- file headers ----------------

/// Mutable header of a linear index: 3-byte type code plus three
/// 20-digit counters and a newline, 64 bytes total. `depth` is derived:
/// the smallest `i` with `2^i >= nbuckets`.
#[derive(Debug, Clone)]
pub struct LinearHeader {
    pub nbuckets: u64,
    pub split: u64,
    pub nrecords: u64,
    pub depth: u32,
}

impl LinearHeader {
    pub fn new(nbuckets: u64) -> Self {
        Self {
            nbuckets,
            split: 0,
            nrecords: 0,
            depth: depth_for(nbuckets),
        }
    }
}

/// Smallest table depth covering `nbuckets` buckets.
pub fn depth_for(nbuckets: u64) -> u32 {
    nbuckets.next_power_of_two().trailing_zeros()
}

pub fn encode_static_header() -> String {
    format!("{:width$}\n", IDXTYPE_STATIC, width = IDXTYPE_SZ)
}

pub fn encode_linear_header(h: &LinearHeader) -> String {
    format!(
        "{:tw$}{:nw$}{:sw$}{:rw$}\n",
        IDXTYPE_LINEAR,
        h.nbuckets,
        h.split,
        h.nrecords,
        tw = IDXTYPE_SZ,
        nw = NBUCKETS_SZ,
        sw = SPLIT_SZ,
        rw = NRECORDS_SZ
    )
}

/// Read the 3-byte ASCII type code at the start of an index file.
pub fn read_type_code(file: &File) -> Result<u32> {
    let mut buf = [0u8; IDXTYPE_SZ];
    file.read_exact_at(&mut buf, 0).context("read index type code")?;
    Ok(parse_ascii(&buf, "index type", 0)? as u32)
}

/// Decode and validate the linear header.
pub fn read_linear_header(file: &File) -> Result<LinearHeader> {
    let mut buf = [0u8; (IDXTYPE_SZ + NBUCKETS_SZ + SPLIT_SZ + NRECORDS_SZ) + 1];
    file.read_exact_at(&mut buf, 0).context("read index header")?;
    if buf[buf.len() - 1] != b'\n' {
        bail!("corrupt index header: missing trailing newline");
    }
    let code = parse_ascii(&buf[..IDXTYPE_SZ], "index type", 0)? as u32;
    if code != IDXTYPE_LINEAR {
        bail!("index init failed: type code {code} is not a linear index");
    }
    let mut at = IDXTYPE_SZ;
    let nbuckets = parse_ascii(&buf[at..at + NBUCKETS_SZ], "bucket count", at as u64)?;
    at += NBUCKETS_SZ;
    let split = parse_ascii(&buf[at..at + SPLIT_SZ], "split pointer", at as u64)?;
    at += SPLIT_SZ;
    let nrecords = parse_ascii(&buf[at..at + NRECORDS_SZ], "record count", at as u64)?;

    if nbuckets == 0 {
        bail!("corrupt index header: bucket count is 0");
    }
    if split * 2 > nbuckets {
        bail!("corrupt index header: split pointer {split} beyond {nbuckets} buckets");
    }

    Ok(LinearHeader {
        nbuckets,
        split,
        nrecords,
        depth: depth_for(nbuckets),
    })
}

pub fn write_linear_header(file: &File, h: &LinearHeader) -> Result<()> {
    file.write_all_at(encode_linear_header(h).as_bytes(), 0)
        .context("write index header")
}

// ---------------- helpers ----------------

fn parse_ascii(buf: &[u8], what: &str, off: u64) -> Result<u64> {
    std::str::from_utf8(buf)
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .ok_or_else(|| anyhow!("corrupt {what} field at offset {off}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::NBUCKETS_INIT;
    use std::fs::OpenOptions;
    use std::path::PathBuf;

    fn tmp_file(tag: &str) -> (PathBuf, File) {
        let pid = std::process::id();
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("kilndb-rec-{tag}-{pid}-{t}"));
        let f = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        (path, f)
    }

    #[test]
    fn ptr_roundtrip_and_bounds() {
        let (path, f) = tmp_file("ptr");
        write_ptr(&f, 0, 0).unwrap();
        assert_eq!(read_ptr(&f, 0).unwrap(), 0);
        write_ptr(&f, 0, PTR_MAX).unwrap();
        assert_eq!(read_ptr(&f, 0).unwrap(), PTR_MAX);
        assert!(write_ptr(&f, 0, PTR_MAX + 1).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn chain_record_roundtrip() {
        let (path, f) = tmp_file("chain");
        write_chain_record(&f, 0, "alpha", 42, 7, 123).unwrap();
        let rec = read_chain_record(&f, 0).unwrap();
        assert_eq!(rec.key, "alpha");
        assert_eq!(rec.datoff, 42);
        assert_eq!(rec.datlen, 7);
        assert_eq!(rec.next, 123);
        assert_eq!(rec.idxlen, "alpha:42:7\n".len() as u64);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn chain_record_length_bounds() {
        let (path, f) = tmp_file("bounds");
        // smallest legal record: 1-char key, 1-digit offsets => "k:0:2\n"
        write_chain_record(&f, 0, "k", 0, 2, 0).unwrap();
        let rec = read_chain_record(&f, 0).unwrap();
        assert_eq!(rec.idxlen, IDXLEN_MIN);

        // largest legal record: pad the key so the body is exactly 1024
        let key = "x".repeat((IDXLEN_MAX as usize) - ":0:2\n".len());
        write_chain_record(&f, 64, &key, 0, 2, 0).unwrap();
        let rec = read_chain_record(&f, 64).unwrap();
        assert_eq!(rec.idxlen, IDXLEN_MAX);
        assert_eq!(rec.key, key);

        // one byte longer must be rejected on write
        let key = "x".repeat((IDXLEN_MAX as usize) - ":0:2\n".len() + 1);
        assert!(write_chain_record(&f, 64, &key, 0, 2, 0).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn chain_record_corruption_is_rejected() {
        let (path, f) = tmp_file("corrupt");

        // two-field body (old layout) must not decode
        let body = "12:34\n";
        let rec = format!("{:7}{:4}{}", 0, body.len(), body);
        f.write_all_at(rec.as_bytes(), 0).unwrap();
        let err = read_chain_record(&f, 0).unwrap_err().to_string();
        assert!(err.contains("3 fields"), "{err}");

        // missing newline sentinel
        let body = "k:0:22";
        let rec = format!("{:7}{:4}{}", 0, body.len(), body);
        f.write_all_at(rec.as_bytes(), 64).unwrap();
        let err = read_chain_record(&f, 64).unwrap_err().to_string();
        assert!(err.contains("newline"), "{err}");

        // record length below the minimum
        let rec = format!("{:7}{:4}k:0\n", 0, 4);
        f.write_all_at(rec.as_bytes(), 128).unwrap();
        assert!(read_chain_record(&f, 128).is_err());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn data_record_roundtrip_and_sentinel() {
        let (path, f) = tmp_file("data");
        write_data(&f, 0, "hello").unwrap();
        assert_eq!(read_data(&f, 0, 6).unwrap(), "hello");
        // reading with a length that lands off the newline is corruption
        assert!(read_data(&f, 0, 5).is_err());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn linear_header_roundtrip() {
        let (path, f) = tmp_file("hdr");
        let mut h = LinearHeader::new(NBUCKETS_INIT);
        h.nrecords = 12;
        h.split = 3;
        h.nbuckets = 11;
        write_linear_header(&f, &h).unwrap();
        assert_eq!(encode_linear_header(&h).len() as u64, crate::consts::LINEAR_HDR_SIZE);

        let got = read_linear_header(&f).unwrap();
        assert_eq!(got.nbuckets, 11);
        assert_eq!(got.split, 3);
        assert_eq!(got.nrecords, 12);
        assert_eq!(got.depth, 4);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn depth_covers_bucket_count() {
        assert_eq!(depth_for(1), 0);
        assert_eq!(depth_for(2), 1);
        assert_eq!(depth_for(8), 3);
        assert_eq!(depth_for(9), 4);
        assert_eq!(depth_for(1024), 10);
        assert_eq!(depth_for(1025), 11);
    }

    #[test]
    fn static_header_shape() {
        assert_eq!(encode_static_header(), "  1\n");
    }
}
