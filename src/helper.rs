//! Helper utilities for Mixproxy
//!
//! This module provides common utility functions used throughout the application.

use std::time::Duration;

/// Maximum number of bytes taken from a stream in one read
pub const READ_LIMIT: usize = 64 * 1024;

/// Maximum UDP datagram size
pub const MAX_UDP_PACKET: usize = 65535;

/// Interval between two UDP idle sweeps
pub const UDP_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Raise the open-file soft limit
///
/// The limit is only changed when `current < requested < hard`. Returns the
/// soft limit in effect afterwards, or `None` where the platform has no
/// such limit.
#[cfg(unix)]
pub fn set_open_file_limit(soft_limit: Option<u64>) -> std::io::Result<Option<u64>> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes into the struct we pass.
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    let current = limit.rlim_cur as u64;
    let hard = limit.rlim_max as u64;
    let requested = match soft_limit {
        Some(requested) if current < requested && requested < hard => requested,
        _ => return Ok(Some(current)),
    };

    let raised = libc::rlimit {
        rlim_cur: requested as libc::rlim_t,
        rlim_max: limit.rlim_max,
    };
    // SAFETY: setrlimit only reads the struct we pass.
    if unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &raised) } != 0 {
        return Err(std::io::Error::last_os_error());
    }

    tracing::debug!("current file soft limit: {}", current);
    tracing::debug!("open file soft limit set to {}", requested);
    Ok(Some(requested))
}

/// Raise the open-file soft limit (no-op on this platform)
#[cfg(not(unix))]
pub fn set_open_file_limit(_soft_limit: Option<u64>) -> std::io::Result<Option<u64>> {
    Ok(None)
}
