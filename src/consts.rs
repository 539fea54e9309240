//! On-disk format constants shared by both index flavors.
//!
//! Every integer on disk is fixed-width, right-aligned, space-padded
//! ASCII decimal; offsets below are byte offsets into the named file.

// -------- Index-type codes (3 ASCII chars at offset 0 of .idx) --------
pub const IDXTYPE_SZ: usize = 3;
pub const IDXTYPE_STATIC: u32 = 1;
pub const IDXTYPE_LINEAR: u32 = 2;

// -------- Pointers --------
pub const PTR_SZ: u64 = 7; // width of a chain-pointer field
pub const PTR_MAX: u64 = 9_999_999; // largest offset a 7-digit pointer can name

// -------- Chain records: NEXT(7) || IDXLEN(4) || key:datoff:datlen\n --------
pub const IDXLEN_SZ: u64 = 4;
pub const IDXREC_HDR_SZ: u64 = PTR_SZ + IDXLEN_SZ;
pub const IDXLEN_MIN: u64 = 6;
pub const IDXLEN_MAX: u64 = 1024;

// -------- Data records: value\n --------
// Bounds apply to the stored record, newline included.
pub const DATLEN_MIN: u64 = 2;
pub const DATLEN_MAX: u64 = 1024;

// -------- Static index file layout --------
// header(4) = idxtype(3) + '\n', then free ptr, then the bucket array,
// then a terminating '\n', then chain records.
pub const STATIC_HDR_SIZE: u64 = IDXTYPE_SZ as u64 + 1;
pub const STATIC_FREE_OFF: u64 = STATIC_HDR_SIZE;
pub const STATIC_HASH_OFF: u64 = STATIC_FREE_OFF + PTR_SZ;
pub const NHASH_STATIC: u64 = 137;

// -------- Linear index file layout --------
// header(64) = idxtype(3) + nbuckets(20) + split(20) + nrecords(20) + '\n',
// then free ptr, then the bucket array (grows one slot per split).
// Chain records live in .bkt, whose byte 0 is padding so that offset 0
// stays the nil sentinel.
pub const NBUCKETS_SZ: usize = 20;
pub const SPLIT_SZ: usize = 20;
pub const NRECORDS_SZ: usize = 20;
pub const LINEAR_HDR_SIZE: u64 = IDXTYPE_SZ as u64 + (NBUCKETS_SZ + SPLIT_SZ + NRECORDS_SZ) as u64 + 1;
pub const LINEAR_FREE_OFF: u64 = LINEAR_HDR_SIZE;
pub const LINEAR_HASH_OFF: u64 = LINEAR_FREE_OFF + PTR_SZ;
pub const NBUCKETS_INIT: u64 = 8;

// -------- Linear growth policy --------
// Split one bucket when nrecords / (LOAD_DENOM * nbuckets) reaches
// SPLIT_LOAD after an insert.
pub const LOAD_DENOM: u64 = 30;
pub const SPLIT_LOAD: f64 = 0.8;
