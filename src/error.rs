//! Small, per-module error enums in the teacher's style: `Debug`-derived,
//! `std::error::Error` + `Display` impls, `From` conversions threaded
//! through `?`. Nothing here is surfaced to a caller outside the process —
//! the engine is a fire-and-forget worker — but a typed error still gives
//! every fallback an explicit decision site instead of a bare
//! `unwrap_or_default()`.

use std::fmt::{self, Display, Formatter};
use std::io;

/// Failures from shelling out to `iptables`/`ip6tables`.
#[derive(Debug)]
pub enum FwError {
    Spawn(String, io::Error),
    NonZeroExit { cmd: String, status: i32 },
}

impl std::error::Error for FwError {}

impl Display for FwError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FwError::Spawn(cmd, e) => write!(f, "failed to spawn '{}': {}", cmd, e),
            FwError::NonZeroExit { cmd, status } => {
                write!(f, "'{}' exited with status {}", cmd, status)
            }
        }
    }
}

/// Failures reading/writing the compressed register. These never
/// propagate out of `QuotaStore::load` (an empty set is returned instead)
/// but the type documents the cases that are being swallowed.
#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    Inflate(String),
    Malformed(String),
}

impl std::error::Error for StoreError {}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io(e) => write!(f, "i/o error: {}", e),
            StoreError::Inflate(e) => write!(f, "zlib inflate error: {}", e),
            StoreError::Malformed(e) => write!(f, "malformed register: {}", e),
        }
    }
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

/// Failures from the control-server round trip.
#[derive(Debug)]
pub enum ControlError {
    Transport(reqwest::Error),
    NoIdentity(String),
}

impl std::error::Error for ControlError {}

impl Display for ControlError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ControlError::Transport(e) => write!(f, "transport error: {}", e),
            ControlError::NoIdentity(e) => write!(f, "no usable device identity: {}", e),
        }
    }
}

impl From<reqwest::Error> for ControlError {
    fn from(e: reqwest::Error) -> Self {
        ControlError::Transport(e)
    }
}

impl ControlError {
    /// "Connectivity-class" transport errors retry after a fixed interval;
    /// anything else breaks the control loop.
    pub fn is_connectivity_class(&self) -> bool {
        match self {
            ControlError::Transport(e) => {
                e.is_connect() || e.is_timeout() || e.is_request()
            }
            ControlError::NoIdentity(_) => false,
        }
    }
}

/// Top-level error surfaced from `main` during startup only (the precondition
/// probe, logger init, config load). Once the workers are running, nothing
/// escapes the process.
#[derive(Debug)]
pub enum DaemonError {
    ConfigLoad(String),
    Logger(String),
}

impl std::error::Error for DaemonError {}

impl Display for DaemonError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            DaemonError::ConfigLoad(e) => write!(f, "failed to load config file: {}", e),
            DaemonError::Logger(e) => write!(f, "failed to init logger: {}", e),
        }
    }
}
