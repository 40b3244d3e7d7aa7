use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use k256::ecdsa::signature::hazmat::PrehashSigner;
use k256::ecdsa::{Signature, SigningKey};
use sha2::{Digest, Sha256};

use crate::cache::CachedRelease;
use crate::config::{CH340_PRODUCT_ID, FTDI_VENDOR_ID};
use crate::flasher::port::CandidatePort;
use crate::flasher::programmer::{
    Programmer, ProgrammerError, ProgrammerInvocation, ProgressEvent,
};

/// Builder for creating test CandidatePort instances
pub struct CandidatePortBuilder {
    port: CandidatePort,
}

impl CandidatePortBuilder {
    pub fn new(device: &str) -> Self {
        Self {
            port: CandidatePort::new(device),
        }
    }

    /// FTDI dual-channel bridge as found on Amigo/M5StickV boards.
    pub fn ftdi(mut self) -> Self {
        self.port.vid = Some(FTDI_VENDOR_ID);
        self.port.pid = Some(0x6010);
        self
    }

    /// WCH CH340 bridge as found on Dock boards.
    pub fn ch340(mut self) -> Self {
        self.port.vid = Some(0x1a86);
        self.port.pid = Some(CH340_PRODUCT_ID);
        self
    }

    pub fn serial_number(mut self, serial: &str) -> Self {
        self.port.serial_number = Some(serial.to_string());
        self
    }

    pub fn product(mut self, product: &str) -> Self {
        self.port.product = Some(product.to_string());
        self
    }

    pub fn build(self) -> CandidatePort {
        self.port
    }
}

/// Builder for creating test CachedRelease instances
pub struct CachedReleaseBuilder {
    release: CachedRelease,
}

impl CachedReleaseBuilder {
    pub fn new(version: &str) -> Self {
        Self {
            release: CachedRelease {
                version: version.to_string(),
                sha256_hash: "abc123def456789012345678901234567890123456789012345678901234"
                    .to_string(),
                zip_path: format!("/cache/{}.zip", version),
                extracted_path: format!("/cache/{}", version),
                downloaded_at: "2024-01-01T00:00:00Z".to_string(),
                file_size: 1024,
            },
        }
    }

    pub fn sha256_hash(mut self, hash: &str) -> Self {
        self.release.sha256_hash = hash.to_string();
        self
    }

    pub fn zip_path(mut self, path: impl AsRef<Path>) -> Self {
        self.release.zip_path = path.as_ref().to_string_lossy().to_string();
        self
    }

    pub fn extracted_path(mut self, path: impl AsRef<Path>) -> Self {
        self.release.extracted_path = path.as_ref().to_string_lossy().to_string();
        self
    }

    pub fn file_size(mut self, size: u64) -> Self {
        self.release.file_size = size;
        self
    }

    pub fn build(self) -> CachedRelease {
        self.release
    }
}

/// Deterministic secp256k1 key for signing test artifacts.
pub fn signing_key() -> SigningKey {
    SigningKey::from_slice(&[0x11; 32]).expect("valid scalar")
}

/// DER signature over the SHA-256 digest of `data`.
pub fn sign_bytes(key: &SigningKey, data: &[u8]) -> Vec<u8> {
    let digest = Sha256::digest(data);
    let signature: Signature = key.sign_prehash(&digest).expect("signing failed");
    signature.to_der().as_bytes().to_vec()
}

/// What a programmer was asked to do, minus the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedInvocation {
    pub terminal: bool,
    pub dev: String,
    pub baudrate: u32,
    pub board: String,
    pub file: Option<PathBuf>,
    pub erase: bool,
}

enum Step {
    Succeed(Vec<String>),
    Fail(String),
}

/// Programmer fake that plays back a script of outcomes, one per call, and
/// records every invocation. Calls beyond the script succeed silently.
/// Clones share the script and the record.
#[derive(Clone, Default)]
pub struct ScriptedProgrammer {
    script: Arc<Mutex<VecDeque<Step>>>,
    calls: Arc<Mutex<Vec<RecordedInvocation>>>,
}

impl ScriptedProgrammer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn succeed(self) -> Self {
        self.succeed_with_output(&[])
    }

    pub fn succeed_with_output(self, lines: &[&str]) -> Self {
        let lines = lines.iter().map(|l| l.to_string()).collect();
        self.script.lock().unwrap().push_back(Step::Succeed(lines));
        self
    }

    pub fn fail(self, reason: &str) -> Self {
        self.script
            .lock()
            .unwrap()
            .push_back(Step::Fail(reason.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<RecordedInvocation> {
        self.calls.lock().unwrap().clone()
    }
}

impl Programmer for ScriptedProgrammer {
    fn program(&self, invocation: ProgrammerInvocation<'_>) -> Result<(), ProgrammerError> {
        self.calls.lock().unwrap().push(RecordedInvocation {
            terminal: invocation.terminal,
            dev: invocation.dev.clone(),
            baudrate: invocation.baudrate,
            board: invocation.board.clone(),
            file: invocation.file.clone(),
            erase: invocation.erase,
        });

        let step = self.script.lock().unwrap().pop_front();
        match step {
            Some(Step::Fail(reason)) => Err(ProgrammerError::new(reason)),
            Some(Step::Succeed(lines)) => {
                for line in lines {
                    (invocation.callback)(ProgressEvent::Output(line));
                }
                Ok(())
            }
            None => Ok(()),
        }
    }
}
