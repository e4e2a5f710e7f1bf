//! System checks run before loading the packet probe

use crate::{Result, TracerError};
use std::path::Path;
use tracing::{info, warn};

pub const MIN_KERNEL: (u32, u32) = (5, 8);

const BTF_PATH: &str = "/sys/kernel/btf/vmlinux";

/// Validate that this host can load and attach the probe.
pub fn run_preflight_checks() -> Result<()> {
    info!("Running pre-flight checks...");

    check_kernel_version()?;
    check_btf();
    check_privileges();

    info!("Pre-flight checks passed");
    Ok(())
}

/// Parse `major.minor` out of a kernel release string such as
/// `6.8.0-45-generic`.
pub fn parse_kernel_version(release: &str) -> Option<(u32, u32)> {
    let mut parts = release.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .split(|c: char| !c.is_ascii_digit())
        .next()?
        .parse()
        .ok()?;
    Some((major, minor))
}

fn kernel_release() -> Result<String> {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    let release = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) };
    Ok(release.to_string_lossy().into_owned())
}

fn check_kernel_version() -> Result<()> {
    let release = kernel_release()?;
    let version = parse_kernel_version(&release).ok_or_else(|| {
        TracerError::UnsupportedFeature(format!("could not parse kernel version: {}", release))
    })?;

    if version < MIN_KERNEL {
        return Err(TracerError::KernelVersionTooOld {
            version: release,
            min_version: format!("{}.{}", MIN_KERNEL.0, MIN_KERNEL.1),
        });
    }

    info!(kernel = %release, "kernel version supported");
    Ok(())
}

fn check_btf() {
    if !Path::new(BTF_PATH).exists() {
        warn!(path = BTF_PATH, "BTF not found, probe relocation may fail");
        return;
    }
    info!("BTF available");
}

fn check_privileges() {
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        warn!(
            euid,
            "not running as root, ensure CAP_BPF and CAP_NET_ADMIN are granted"
        );
    } else {
        info!("Running with root privileges");
    }
}

/// Lift the locked-memory limit so map allocation does not fail on kernels
/// that still charge BPF memory against it.
pub fn raise_memlock_limit() {
    let rlim = libc::rlimit {
        rlim_cur: libc::RLIM_INFINITY,
        rlim_max: libc::RLIM_INFINITY,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_MEMLOCK, &rlim) };
    if ret != 0 {
        warn!(
            error = %std::io::Error::last_os_error(),
            "failed to remove memlock limit"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kernel_version() {
        assert_eq!(parse_kernel_version("6.8.0-45-generic"), Some((6, 8)));
        assert_eq!(parse_kernel_version("5.15.153.1-microsoft-standard-WSL2"), Some((5, 15)));
        assert_eq!(parse_kernel_version("5.8\n"), Some((5, 8)));
        assert_eq!(parse_kernel_version("4.19-rc1"), Some((4, 19)));
        assert_eq!(parse_kernel_version("garbage"), None);
    }

    #[test]
    fn test_minimum_kernel_ordering() {
        assert!((5, 4) < MIN_KERNEL);
        assert!((5, 10) >= MIN_KERNEL);
        assert!((6, 0) >= MIN_KERNEL);
    }
}
