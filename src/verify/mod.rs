//! Integrity and authenticity checks for firmware artifacts.

pub mod hash;
pub mod signature;
pub mod signer;

pub use hash::{calculate_sha256, verify_sha256_sidecar, FirmwareArtifact};
pub use signature::{FirmwareSignature, PublicKey, SignatureVerifier};
pub use signer::SidecarSigner;
