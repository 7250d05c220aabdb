use std::io;
use std::os::fd::RawFd;

/// Toggles `O_NONBLOCK` on `fd`, skipping the second syscall when the flag
/// already has the requested value.
pub fn set_socket_blocking(fd: RawFd, block: bool) -> io::Result<()> {
    // SAFETY: fcntl with F_GETFL/F_SETFL only reads and writes descriptor flags.
    let orig_flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if orig_flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let flags = if block {
        orig_flags & !libc::O_NONBLOCK
    } else {
        orig_flags | libc::O_NONBLOCK
    };
    if flags != orig_flags && unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub fn is_nonblocking(fd: RawFd) -> io::Result<bool> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags & libc::O_NONBLOCK != 0)
}

/// Raises (or lowers) RLIMIT_NOFILE to `size` for both soft and hard limits.
pub fn set_fdtable_size(size: usize) -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: size as libc::rlim_t,
        rlim_max: size as libc::rlim_t,
    };
    // SAFETY: `limit` is a valid, initialized rlimit for the duration of the call.
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &limit) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// "on" and "true" in any case are true, everything else is false.
pub fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("on") || value.eq_ignore_ascii_case("true")
}
