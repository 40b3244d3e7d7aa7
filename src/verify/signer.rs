//! Produces the `.sha256.txt`, `.sig` and `.pem` sidecars for an artifact.
//!
//! Nothing is written unless its precondition holds: a hash must be 64
//! lowercase hex characters, and a missing signature or public key is an
//! error rather than a skipped file.

use std::fs;
use std::path::{Path, PathBuf};

use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey};
use k256::pkcs8::EncodePublicKey;
use log::info;

use crate::error::{ProvisionError, ProvisionResult};
use crate::verify::hash::{calculate_sha256, ensure_exists, is_valid_hash, sidecar_path};

#[derive(Debug, Clone, Default)]
pub struct SidecarSigner {
    filename: PathBuf,
    filehash: Option<String>,
    signature: Option<Vec<u8>>,
    /// Base64 body of the SubjectPublicKeyInfo, without PEM markers.
    pubkey: Option<String>,
}

impl SidecarSigner {
    pub fn new(filename: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            ..Default::default()
        }
    }

    pub fn filename(&self) -> &Path {
        &self.filename
    }

    pub fn filehash(&self) -> Option<&str> {
        self.filehash.as_deref()
    }

    /// Hash the file and remember the digest.
    pub fn make_hash(&mut self) -> ProvisionResult<String> {
        ensure_exists(&self.filename)?;
        let hash = calculate_sha256(&self.filename)?;
        info!(target: "signer", "Hash of {}: {}", self.filename.display(), hash);
        self.filehash = Some(hash.clone());
        Ok(hash)
    }

    pub fn set_filehash(&mut self, hash: Option<String>) {
        self.filehash = hash;
    }

    pub fn set_signature(&mut self, signature: Option<Vec<u8>>) {
        self.signature = signature;
    }

    pub fn set_pubkey(&mut self, pubkey: Option<String>) {
        self.pubkey = pubkey;
    }

    /// Sign the current hash with `key`, filling in signature and public key.
    pub fn sign(&mut self, key: &SigningKey) -> ProvisionResult<()> {
        let hash = self
            .filehash
            .as_deref()
            .ok_or_else(|| ProvisionError::validation("Empty hash"))?;
        let digest = decode_hash(hash)?;

        let signature: Signature = key
            .sign_prehash(&digest)
            .map_err(|e| ProvisionError::validation(format!("Signing failed: {}", e)))?;

        let spki = key
            .verifying_key()
            .to_public_key_der()
            .map_err(|e| ProvisionError::validation(format!("Invalid public key: {}", e)))?;
        let pem = pem::encode(&pem::Pem::new("PUBLIC KEY", spki.as_bytes().to_vec()));

        self.signature = Some(signature.to_der().as_bytes().to_vec());
        self.pubkey = Some(pem_body(&pem));
        Ok(())
    }

    /// Write `<name>.sha256.txt` containing `"<hash> <name>"`.
    pub fn save_hash(&self) -> ProvisionResult<PathBuf> {
        let hash = match self.filehash.as_deref() {
            Some(hash) if !hash.is_empty() => hash,
            _ => return Err(ProvisionError::validation("Empty hash")),
        };
        if !is_valid_hash(hash) {
            return Err(ProvisionError::validation(format!("Invalid hash: '{}'", hash)));
        }

        let path = sidecar_path(&self.filename);
        fs::write(&path, format!("{} {}", hash, self.display_name()))?;
        info!(target: "signer", "Saved {}", path.display());
        Ok(path)
    }

    /// Write `<name>.sig` with the raw DER signature.
    pub fn save_signature(&self) -> ProvisionResult<PathBuf> {
        let signature = match &self.signature {
            Some(signature) if !signature.is_empty() => signature,
            _ => return Err(ProvisionError::validation("Empty signature")),
        };

        let path = self.sidecar("sig");
        fs::write(&path, signature)?;
        info!(target: "signer", "Saved {}", path.display());
        Ok(path)
    }

    /// Write `<name>.pem` with the public key between PEM markers.
    pub fn save_pubkey(&self) -> ProvisionResult<PathBuf> {
        let pubkey = match self.pubkey.as_deref().map(str::trim) {
            Some(pubkey) if !pubkey.is_empty() => pubkey,
            _ => return Err(ProvisionError::validation("Empty pubkey")),
        };

        let path = self.sidecar("pem");
        let body = if pubkey.contains("-----BEGIN") {
            pem_body(pubkey)
        } else {
            pubkey.to_string()
        };
        fs::write(
            &path,
            format!(
                "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----",
                body
            ),
        )?;
        info!(target: "signer", "Saved {}", path.display());
        Ok(path)
    }

    fn display_name(&self) -> String {
        self.filename
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.filename.to_string_lossy().to_string())
    }

    fn sidecar(&self, extension: &str) -> PathBuf {
        let mut name = self.filename.as_os_str().to_os_string();
        name.push(".");
        name.push(extension);
        PathBuf::from(name)
    }
}

fn decode_hash(hash: &str) -> ProvisionResult<Vec<u8>> {
    if !is_valid_hash(hash) {
        return Err(ProvisionError::validation(format!("Invalid hash: '{}'", hash)));
    }
    hex::decode(hash).map_err(|_| ProvisionError::validation(format!("Invalid hash: '{}'", hash)))
}

/// PEM text without the BEGIN/END lines.
fn pem_body(pem: &str) -> String {
    pem.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("-----"))
        .collect::<Vec<_>>()
        .join("\n")
}
