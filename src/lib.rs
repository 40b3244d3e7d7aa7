//! Firmware provisioning for Krux signing devices.
//!
//! The pipeline downloads a release, verifies its hash and signature, then
//! flashes or wipes a K210 board over USB serial:
//!
//! - [`download`]: streaming HTTP downloader
//! - [`verify`]: SHA-256 sidecars, secp256k1 signature checks, sidecar signer
//! - [`flasher`]: port resolution with bounded retry, flash and wipe drivers
//! - [`commands`]: async wrappers running the blocking work on Tokio tasks

pub mod cache;
pub mod commands;
pub mod config;
pub mod download;
pub mod error;
pub mod flasher;
pub mod logging;
pub mod release;
pub mod settings;
pub mod verify;

#[cfg(test)]
mod test_helpers;

pub use config::Device;
pub use download::StreamingDownloader;
pub use error::{ErrorKind, Failure, ProvisionError, ProvisionResult};
pub use flasher::{FlashDriver, FlasherBackend, ProgressEvent, WipeDriver};
pub use verify::{FirmwareArtifact, SignatureVerifier};
