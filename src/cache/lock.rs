use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;

// Open-file-description locks conflict between threads of one process as well as between
// processes; classic record locks only conflict between processes.
#[cfg(any(target_os = "linux", target_os = "android"))]
const SET_LOCK: libc::c_int = libc::F_OFD_SETLK;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SET_LOCK: libc::c_int = libc::F_SETLK;

/// Takes an exclusive, non-blocking advisory lock on the whole of `file`.
///
/// The lock is released when the file is closed.
pub fn try_lock_exclusive(file: &File) -> io::Result<()> {
    // SAFETY: `flock` is plain data; all-zero is a valid value.
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = libc::F_WRLCK as libc::c_short;
    lock.l_whence = libc::SEEK_SET as libc::c_short;
    // l_start = l_len = 0 covers the whole file; l_pid stays 0 as OFD locks require.

    // SAFETY: the descriptor is owned by `file` and `lock` outlives the call.
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), SET_LOCK, &raw mut lock) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
