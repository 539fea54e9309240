//! Advisory byte-range locks on the database files.
//!
//! All cross-process and cross-thread coordination goes through these
//! locks; there is no in-memory mutex anywhere in the crate. On Linux
//! the open-file-description variants (F_OFD_*) are used so that two
//! handles opened by the same process contend exactly like two
//! processes; elsewhere the classic per-process fcntl locks apply.
//!
//! A range is `(start, len)`; `len == 1` locks a single byte, `len == 0`
//! locks from `start` to end of file (including bytes appended later).
//! Locks release on Drop; unlock errors on drop are ignored.

use anyhow::{Context, Result};
use nix::fcntl::{fcntl, FcntlArg};
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A held lock range. Dropping the guard releases the range.
pub struct RangeGuard<'a> {
    file: &'a File,
    start: u64,
    len: u64,
}

impl RangeGuard<'_> {
    pub fn range(&self) -> (u64, u64) {
        (self.start, self.len)
    }
}

impl Drop for RangeGuard<'_> {
    fn drop(&mut self) {
        let _ = set_lock(self.file.as_raw_fd(), libc::F_UNLCK, self.start, self.len, false);
    }
}

/// Acquire a lock on `[start, start+len)`, blocking until the range is
/// available.
pub fn acquire_range(file: &File, mode: LockMode, start: u64, len: u64) -> Result<RangeGuard<'_>> {
    set_lock(file.as_raw_fd(), lock_type(mode), start, len, true)
        .with_context(|| format!("lock range (start {start}, len {len}, {mode:?})"))?;
    Ok(RangeGuard { file, start, len })
}

/// Non-blocking variant of [`acquire_range`]: errors if any byte of the
/// range is already held in a conflicting mode.
pub fn try_acquire_range(
    file: &File,
    mode: LockMode,
    start: u64,
    len: u64,
) -> Result<RangeGuard<'_>> {
    set_lock(file.as_raw_fd(), lock_type(mode), start, len, false)
        .with_context(|| format!("try-lock range (start {start}, len {len}, {mode:?})"))?;
    Ok(RangeGuard { file, start, len })
}

fn lock_type(mode: LockMode) -> libc::c_int {
    match mode {
        LockMode::Shared => libc::F_RDLCK as libc::c_int,
        LockMode::Exclusive => libc::F_WRLCK as libc::c_int,
    }
}

fn set_lock(fd: RawFd, ltype: libc::c_int, start: u64, len: u64, wait: bool) -> nix::Result<()> {
    // zeroed() keeps this portable across libc flock layouts; l_pid must
    // stay 0 for the OFD commands.
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = ltype as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = start as libc::off_t;
    fl.l_len = len as libc::off_t;

    #[cfg(any(target_os = "linux", target_os = "android"))]
    let arg = if wait {
        FcntlArg::F_OFD_SETLKW(&fl)
    } else {
        FcntlArg::F_OFD_SETLK(&fl)
    };
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    let arg = if wait {
        FcntlArg::F_SETLKW(&fl)
    } else {
        FcntlArg::F_SETLK(&fl)
    };

    fcntl(fd, arg).map(|_| ())
}
