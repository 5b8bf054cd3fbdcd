//! Single-instance guard backed by a Linux abstract unix socket.
//!
//! The socket name lives outside the filesystem, so the lock disappears with
//! the process and never needs cleaning up.

use std::io;

use thiserror::Error;

pub const LOCK_NAME: &str = "dsmr_mqtt_bridge_lockfile";

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another instance is already running")]
    AlreadyRunning,

    #[error("cannot acquire the single-instance lock: {0}")]
    Io(#[source] io::Error),
}

impl From<io::Error> for LockError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => LockError::AlreadyRunning,
            _ => LockError::Io(err),
        }
    }
}

/// Held for the lifetime of the process.
#[derive(Debug)]
pub struct InstanceLock {
    #[cfg(target_os = "linux")]
    _listener: std::os::unix::net::UnixListener,
}

/// Fails with [`LockError::AlreadyRunning`] when another instance holds `name`.
#[cfg(target_os = "linux")]
pub fn acquire(name: &str) -> Result<InstanceLock, LockError> {
    use std::os::linux::net::SocketAddrExt;
    use std::os::unix::net::{SocketAddr, UnixListener};

    let addr = SocketAddr::from_abstract_name(name.as_bytes())?;
    let listener = UnixListener::bind_addr(&addr)?;
    Ok(InstanceLock {
        _listener: listener,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn acquire(_name: &str) -> Result<InstanceLock, LockError> {
    Ok(InstanceLock {})
}
