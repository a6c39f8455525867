//! Filesystem usage probing for the store health check.

use std::io;
use std::path::Path;

/// Usage threshold (percent) above which the store reports unhealthy.
pub const USAGE_THRESHOLD_PERCENT: u64 = 95;

/// Filesystem usage for the mount containing `path`.
#[derive(Debug, Clone, Copy)]
pub struct FsUsage {
    /// Total filesystem size in bytes.
    pub total_bytes: u64,
    /// Bytes available to unprivileged writers.
    pub available_bytes: u64,
}

impl FsUsage {
    /// Used space as an integer percentage.
    pub fn usage_percent(&self) -> u64 {
        if self.total_bytes == 0 {
            return 0;
        }
        self.total_bytes.saturating_sub(self.available_bytes).saturating_mul(100)
            / self.total_bytes
    }
}

/// Query filesystem usage via `statvfs`.
#[cfg(target_family = "unix")]
pub fn fs_usage(path: &Path) -> io::Result<FsUsage> {
    use std::os::unix::ffi::OsStrExt;

    let path_cstr = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    // SAFETY: statvfs is a plain C struct of integers with no invariants, so
    // zero-initialization is valid; path_cstr is a valid NUL-terminated
    // string and stat a valid out-pointer for the syscall.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let result = unsafe { libc::statvfs(path_cstr.as_ptr(), &mut stat) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(FsUsage {
        total_bytes: stat.f_blocks as u64 * stat.f_frsize as u64,
        available_bytes: stat.f_bavail as u64 * stat.f_frsize as u64,
    })
}

#[cfg(not(target_family = "unix"))]
pub fn fs_usage(_path: &Path) -> io::Result<FsUsage> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "filesystem usage probing requires unix"))
}
