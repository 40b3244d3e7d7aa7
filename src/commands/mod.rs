//! Async entry points for callers running inside a Tokio runtime.

pub mod firmware;
pub mod flash;
pub mod ports;

pub use firmware::{
    download_firmware, download_release, release_firmware, verify_firmware, ReleaseSource,
};
pub use flash::{clear_failure_hook, set_failure_hook, spawn_flash, spawn_wipe, SessionOutcome};
pub use ports::{detect_ports, label_ports, PortInfo};

use crate::error::ProvisionError;

pub(crate) fn task_failed(what: &str, e: tokio::task::JoinError) -> ProvisionError {
    ProvisionError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{} task failed: {}", what, e),
    ))
}
