//! SHA-256 hashing of firmware artifacts and `.sha256.txt` sidecar checks.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{ProvisionError, ProvisionResult};

/// A firmware file on disk together with its size and digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareArtifact {
    pub path: PathBuf,
    pub size: u64,
    /// Lowercase hex, 64 characters.
    pub sha256: String,
}

impl FirmwareArtifact {
    /// Describe an existing file. Fails closed when the path is missing.
    pub fn open(path: impl AsRef<Path>) -> ProvisionResult<Self> {
        let path = path.as_ref();
        ensure_exists(path)?;

        let size = fs::metadata(path)?.len();
        let sha256 = calculate_sha256(path)?;

        Ok(Self {
            path: path.to_path_buf(),
            size,
            sha256,
        })
    }

    /// Re-hash the file and compare with the recorded digest.
    pub fn is_intact(&self) -> ProvisionResult<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        Ok(calculate_sha256(&self.path)? == self.sha256)
    }
}

/// Reject paths that do not exist with the canonical validation message.
pub fn ensure_exists(path: &Path) -> ProvisionResult<()> {
    if path.exists() {
        Ok(())
    } else {
        Err(ProvisionError::validation(format!(
            "File do not exist: {}",
            path.display()
        )))
    }
}

/// Calculate SHA256 hash of a file as lowercase hex.
pub fn calculate_sha256(file_path: &Path) -> ProvisionResult<String> {
    let mut file = fs::File::open(file_path)?;

    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// True when `hash` matches `^[a-f0-9]{64}$`.
pub fn is_valid_hash(hash: &str) -> bool {
    hash.len() == 64
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

/// Sidecar file name for an artifact: `<name>.sha256.txt`.
pub fn sidecar_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".sha256.txt");
    PathBuf::from(name)
}

/// Extract the digest from sidecar content (`"<hash> <name>"`, or the bare
/// hash with stray whitespace).
pub fn parse_sidecar(content: &str) -> ProvisionResult<String> {
    let hash = content
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_ascii_lowercase();

    if is_valid_hash(&hash) {
        Ok(hash)
    } else {
        Err(ProvisionError::validation(format!("Invalid hash: '{}'", hash)))
    }
}

/// Compare an artifact's digest with the one recorded in its sidecar.
pub fn verify_sha256_sidecar(artifact: &Path, sidecar: &Path) -> ProvisionResult<()> {
    ensure_exists(artifact)?;
    ensure_exists(sidecar)?;

    let expected = parse_sidecar(&fs::read_to_string(sidecar)?)?;
    let actual = calculate_sha256(artifact)?;

    if expected == actual {
        info!(
            target: "verifier",
            "sha256sum match: {} has a {} hash",
            artifact.display(),
            actual
        );
        Ok(())
    } else {
        warn!(
            target: "verifier",
            "sha256sum mismatch: {} has a hash of {} and {} summed a hash of {}",
            sidecar.display(),
            expected,
            artifact.display(),
            actual
        );
        Err(ProvisionError::Verification(format!(
            "{} expected {} but summed {}",
            artifact.display(),
            expected,
            actual
        )))
    }
}
