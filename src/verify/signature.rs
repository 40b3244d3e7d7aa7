//! ECDSA (secp256k1) signature verification of firmware artifacts.
//!
//! Releases ship `<name>.sig` (DER signature over the SHA-256 digest of the
//! artifact) and a public key as PEM or as a raw point. The key is always
//! re-encoded into a secp256k1 SubjectPublicKeyInfo from its raw point, so a
//! key for any other curve never reaches the verifier.

use std::fs;
use std::path::Path;

use k256::ecdsa::signature::hazmat::PrehashVerifier;
use k256::ecdsa::{Signature, VerifyingKey};
use k256::pkcs8::DecodePublicKey;
use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use crate::config::MAX_ARTIFACT_SIZE;
use crate::error::{ProvisionError, ProvisionResult};
use crate::verify::hash::ensure_exists;

/// SPKI header for a 33-byte compressed secp256k1 point.
///
/// `SEQUENCE(54) { SEQUENCE(16) { OID ecPublicKey, OID secp256k1 }, BIT STRING(34) }`
pub const SPKI_PREFIX_COMPRESSED: [u8; 23] = [
    0x30, 0x36, 0x30, 0x10, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x05, 0x2b,
    0x81, 0x04, 0x00, 0x0a, 0x03, 0x22, 0x00,
];

/// SPKI header for a 65-byte uncompressed secp256k1 point (`04 || X || Y`).
pub const SPKI_PREFIX_UNCOMPRESSED: [u8; 23] = [
    0x30, 0x56, 0x30, 0x10, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x05, 0x2b,
    0x81, 0x04, 0x00, 0x0a, 0x03, 0x42, 0x00,
];

/// 24-byte header for a bare 64-byte `X || Y` point: the uncompressed header
/// plus the SEC1 `0x04` tag.
pub const SPKI_PREFIX_RAW_XY: [u8; 24] = [
    0x30, 0x56, 0x30, 0x10, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06, 0x05, 0x2b,
    0x81, 0x04, 0x00, 0x0a, 0x03, 0x42, 0x00, 0x04,
];

const PEM_BEGIN: &str = "-----BEGIN PUBLIC KEY-----";
const PEM_END: &str = "-----END PUBLIC KEY-----";

/// Raw DER-encoded ECDSA signature bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareSignature(Vec<u8>);

impl FirmwareSignature {
    pub fn from_der(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Load a `.sig` file.
    pub fn load(path: &Path) -> ProvisionResult<Self> {
        ensure_exists(path)?;
        Ok(Self(fs::read(path)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// A secp256k1 public key as supplied by the release or the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublicKey {
    /// PEM text, with or without the `BEGIN/END PUBLIC KEY` markers.
    Pem(String),
    /// SEC1 point bytes (33 or 65 bytes) or bare `X || Y` (64 bytes).
    Point(Vec<u8>),
    /// Hex text of a point, decoded lazily so bad hex fails closed at verify time.
    Hex(String),
}

impl PublicKey {
    pub fn from_pem(text: impl Into<String>) -> Self {
        PublicKey::Pem(text.into())
    }

    pub fn from_point(bytes: impl Into<Vec<u8>>) -> Self {
        PublicKey::Point(bytes.into())
    }

    pub fn from_hex(text: impl Into<String>) -> Self {
        PublicKey::Hex(text.into())
    }

    /// Load a `.pem` file (or a file holding a hex point).
    pub fn load(path: &Path) -> ProvisionResult<Self> {
        ensure_exists(path)?;
        let content = fs::read_to_string(path)?;
        let trimmed = content.trim();
        if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_hexdigit()) {
            Ok(PublicKey::Hex(trimmed.to_string()))
        } else {
            Ok(PublicKey::Pem(content))
        }
    }

    /// The raw point carried by this key.
    pub fn point(&self) -> ProvisionResult<Vec<u8>> {
        match self {
            PublicKey::Point(bytes) => Ok(bytes.clone()),
            PublicKey::Hex(text) => hex::decode(text.trim()).map_err(|e| {
                ProvisionError::Verification(format!("Invalid public key hex: {}", e))
            }),
            PublicKey::Pem(text) => point_from_pem(text),
        }
    }

    /// Canonical SubjectPublicKeyInfo DER rebuilt from the raw point.
    pub fn spki_der(&self) -> ProvisionResult<Vec<u8>> {
        spki_from_point(&self.point()?)
    }
}

/// Prefix a raw secp256k1 point with the fixed SPKI header.
pub fn spki_from_point(point: &[u8]) -> ProvisionResult<Vec<u8>> {
    let prefix: &[u8] = match point.len() {
        33 => &SPKI_PREFIX_COMPRESSED,
        64 => &SPKI_PREFIX_RAW_XY,
        65 => &SPKI_PREFIX_UNCOMPRESSED,
        n => {
            return Err(ProvisionError::Verification(format!(
                "Invalid public key point length: {}",
                n
            )))
        }
    };

    let mut der = Vec::with_capacity(prefix.len() + point.len());
    der.extend_from_slice(prefix);
    der.extend_from_slice(point);
    Ok(der)
}

fn point_from_pem(text: &str) -> ProvisionResult<Vec<u8>> {
    let wrapped;
    let text = if text.contains(PEM_BEGIN) {
        text
    } else {
        wrapped = format!("{}\n{}\n{}", PEM_BEGIN, text.trim(), PEM_END);
        &wrapped
    };

    let parsed = pem::parse(text)
        .map_err(|e| ProvisionError::Verification(format!("Invalid PEM public key: {}", e)))?;
    if parsed.tag() != "PUBLIC KEY" {
        return Err(ProvisionError::Verification(format!(
            "Unexpected PEM tag: {}",
            parsed.tag()
        )));
    }

    let der = parsed.contents();
    for prefix in [&SPKI_PREFIX_UNCOMPRESSED, &SPKI_PREFIX_COMPRESSED] {
        if der.len() > prefix.len() && der.starts_with(prefix) {
            return Ok(der[prefix.len()..].to_vec());
        }
    }

    Err(ProvisionError::Verification(
        "Public key is not a secp256k1 SubjectPublicKeyInfo".into(),
    ))
}

/// Verifies artifacts against a detached signature and public key.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    max_artifact_size: u64,
}

impl Default for SignatureVerifier {
    fn default() -> Self {
        Self {
            max_artifact_size: MAX_ARTIFACT_SIZE,
        }
    }
}

impl SignatureVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_artifact_size(mut self, max: u64) -> Self {
        self.max_artifact_size = max;
        self
    }

    /// True only on an exact cryptographic match; every other outcome,
    /// malformed input included, is `false`.
    pub fn verify(
        &self,
        artifact: &Path,
        signature: &FirmwareSignature,
        public_key: &PublicKey,
    ) -> bool {
        match self.check(artifact, signature, public_key) {
            Ok(()) => true,
            Err(e) => {
                warn!(target: "verifier", "{}: {}", artifact.display(), e);
                false
            }
        }
    }

    /// Like [`verify`](Self::verify) but reports why verification failed.
    pub fn check(
        &self,
        artifact: &Path,
        signature: &FirmwareSignature,
        public_key: &PublicKey,
    ) -> ProvisionResult<()> {
        ensure_exists(artifact)?;

        let size = fs::metadata(artifact)?.len();
        if size > self.max_artifact_size {
            return Err(ProvisionError::Verification(format!(
                "{} is {} bytes, above the {} byte limit",
                artifact.display(),
                size,
                self.max_artifact_size
            )));
        }

        let digest = Sha256::digest(fs::read(artifact)?);
        debug!(target: "verifier", "{} sha256 {:x}", artifact.display(), digest);

        let spki = public_key.spki_der()?;
        let verifying_key = VerifyingKey::from_public_key_der(&spki).map_err(|e| {
            ProvisionError::Verification(format!("Invalid secp256k1 public key: {}", e))
        })?;

        let signature = Signature::from_der(signature.as_bytes())
            .map_err(|e| ProvisionError::Verification(format!("Invalid DER signature: {}", e)))?;
        let signature = signature.normalize_s().unwrap_or(signature);

        verifying_key
            .verify_prehash(&digest, &signature)
            .map_err(|_| {
                ProvisionError::Verification(format!(
                    "Signature does not match {}",
                    artifact.display()
                ))
            })?;

        info!(target: "verifier", "Signature OK for {}", artifact.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RELEASE_PUBLIC_KEY;
    use crate::verify::hash::calculate_sha256;
    use crate::test_helpers::fixtures::{sign_bytes, signing_key};
    use crate::test_helpers::TestContext;
    use k256::ecdsa::SigningKey;

    const ARTIFACT: &[u8] = b"PK\x03\x04 krux firmware release payload";

    // README.md archived and signed with the release key.
    const SIGNED_README_ZIP: &str = concat!(
        "504b0304140000000800416a3e58660838deec0200004807000009001c00524541444d452e6d6455540900033a21b965",
        "78e3bb6575780b000104e803000004e8030000ad54c18ed33010bde72b06f542a5a6de450b87952a048b80d5b21212cb",
        "015548759c6962d58983eda49b1b1fc84731b613b5dd76118b38244ac69ef7de3ccf780237a6bd87ebda3aae149a2459",
        "3e5bbe6da5caa1e2b286ccf05a94df9f97ce35f692b142bab2cde64257cca25a8bd63a9df76c4320a91c4118174eeada",
        "b2ad369bb5d25bcb320f39ef2bc5329e1738b75df13a622f3ccff43f324c430d42e72874b7c31d0273a95951b21fcae4",
        "0f319d41641bd9f5ac30bc29f7943abdc17a71f3eee2fce38bb3db6f5fa64f802539871603979505a72143e0f0e1eb35",
        "64dc624e11ad42d817324bd68adb12789d438e595bc0d2a3fc954dc4f8c6827450ebed0c5c8950608d863b22e14da3a4",
        "e0de3cc07b14adc3196c094bb70e5cdfc8ba20ce3e21dcca73530b383495acb90a48cb28cb7faea5a9b6dc20e89a54fb",
        "488e9d14b8d3b8276c3ee8259bbc4456a073c49592278674b1c12e0ab149a04809301d29524f112291623a4f92643219",
        "3d4d925bbe41b02d89e9750b25ef109a9e8aaa2f9364b55a91c165120390a61d1a4bf5fb859399ab46a333fd0ac633cc",
        "07945f3ff7712a6864733f6e8298e4f711ea95d235064f0c36da4aa7e35210425680081bd234ce00f8ae8313477bd84a",
        "dec4a8fa7a248d5a726cb0ceb11612eda1d6206ad41873c9b7cf3a8a1b3487064d770dda5ab4c18515386e377413d4bc",
        "a0f85a87a7e2e1ec6640c7153e1287d6d9d0ab340ad469343670a7c1227538a9e41d978a670a039c9d81690f0e268aa4",
        "a017144592ca09bc0f5ce047ecb1dd839e987457d26e69c1ca8af80c0dd369964c71b18139b3469c0a876a46af26f089",
        "aaa4895a3b1caa8fa00f8578338e64ecab3848e8fdf66309433c4d7369bd618babb3f3f38b997fbf0cef57c7faeee8f7",
        "494718f21ff53f2cffb190a3a4dea79068c11b4793b47088a9ed6d1cb54c5b0c6b82c6572824a0a312ae86ae196d0ecb",
        "fe5ea2e6a15b922e7957faabd1b38d1d76fa14c6d5b47495fad72a764ae94f774087c4e267eac7d938f0e80765fc0650",
        "4b01021e03140000000800416a3e58660838deec02000048070000090018000000000001000000a48100000000524541",
        "444d452e6d6455540500033a21b96575780b000104e803000004e8030000504b050600000000010001004f0000002f03",
        "00000000",
    );
    const SIGNED_README_SIG: &str = concat!(
        "3045022100edfbb2990699976644510f25df3de75e68d1b66e169c426dc4ccbb623a50b523",
        "022066eef895fd277371489e4fa378b63edc8396d1f792cf2657f46ec0d3c8fed3fd",
    );

    struct Setup {
        ctx: TestContext,
        key: SigningKey,
        signature: FirmwareSignature,
    }

    impl Setup {
        fn new() -> Self {
            let ctx = TestContext::new();
            ctx.create_file_bytes("firmware.bin", ARTIFACT);
            let key = signing_key();
            let signature = FirmwareSignature::from_der(sign_bytes(&key, ARTIFACT));
            Self {
                ctx,
                key,
                signature,
            }
        }

        fn artifact(&self) -> std::path::PathBuf {
            self.ctx.path("firmware.bin")
        }

        fn point(&self, compress: bool) -> Vec<u8> {
            self.key
                .verifying_key()
                .to_encoded_point(compress)
                .as_bytes()
                .to_vec()
        }

        fn pem(&self) -> String {
            let der = spki_from_point(&self.point(false)).unwrap();
            pem::encode(&pem::Pem::new("PUBLIC KEY", der))
        }
    }

    #[test]
    fn test_spki_prefixes_share_the_oids() {
        assert_eq!(SPKI_PREFIX_RAW_XY[..23], SPKI_PREFIX_UNCOMPRESSED);
        assert_eq!(SPKI_PREFIX_COMPRESSED[2..20], SPKI_PREFIX_UNCOMPRESSED[2..20]);
        assert_eq!(SPKI_PREFIX_RAW_XY.len(), 24);
    }

    #[test]
    fn test_release_pem_reconstructs_identically() {
        let key = PublicKey::from_pem(RELEASE_PUBLIC_KEY);
        let point = key.point().unwrap();
        assert_eq!(point.len(), 65);
        assert_eq!(point[0], 0x04);

        let original = pem::parse(RELEASE_PUBLIC_KEY).unwrap().contents().to_vec();
        assert_eq!(key.spki_der().unwrap(), original);
        assert!(VerifyingKey::from_public_key_der(&original).is_ok());
    }

    #[test]
    fn test_official_release_signature_verifies() {
        let ctx = TestContext::new();
        let zip = ctx.create_file_bytes("test.zip", &hex::decode(SIGNED_README_ZIP).unwrap());
        let signature = FirmwareSignature::from_der(hex::decode(SIGNED_README_SIG).unwrap());
        let key = PublicKey::from_pem(RELEASE_PUBLIC_KEY);

        assert_eq!(
            calculate_sha256(&zip).unwrap(),
            "4ab12c3cc56b2641e7b216666186558cf40a36e76947edfd1b37cc1b190255ac"
        );
        SignatureVerifier::new().check(&zip, &signature, &key).unwrap();
        assert!(SignatureVerifier::new().verify(&zip, &signature, &key));
    }

    #[test]
    fn test_official_release_signature_rejects_other_key() {
        let ctx = TestContext::new();
        let zip = ctx.create_file_bytes("test.zip", &hex::decode(SIGNED_README_ZIP).unwrap());
        let signature = FirmwareSignature::from_der(hex::decode(SIGNED_README_SIG).unwrap());
        let other = PublicKey::from_point(
            signing_key()
                .verifying_key()
                .to_encoded_point(false)
                .as_bytes()
                .to_vec(),
        );

        assert!(!SignatureVerifier::new().verify(&zip, &signature, &other));
    }

    #[test]
    fn test_pem_body_without_markers() {
        let body = "MFYwEAYHKoZIzj0CAQYFK4EEAAoDQgAEax27s943R8m9u/80/soZST64+JGLyckJ\
                    XiyFGjKuWRkpLJzCGPW40sbXZcMOSvPBvCU2vs8Hkyfyhy4lSbySfA==";
        let point = PublicKey::from_pem(body).point().unwrap();
        assert_eq!(point, PublicKey::from_pem(RELEASE_PUBLIC_KEY).point().unwrap());
    }

    #[test]
    fn test_verify_valid_signature_all_key_encodings() {
        let s = Setup::new();
        let verifier = SignatureVerifier::new();
        let uncompressed = s.point(false);

        assert!(verifier.verify(&s.artifact(), &s.signature, &PublicKey::from_pem(s.pem())));
        assert!(verifier.verify(
            &s.artifact(),
            &s.signature,
            &PublicKey::from_point(uncompressed.clone())
        ));
        assert!(verifier.verify(
            &s.artifact(),
            &s.signature,
            &PublicKey::from_point(s.point(true))
        ));
        assert!(verifier.verify(
            &s.artifact(),
            &s.signature,
            &PublicKey::from_point(uncompressed[1..].to_vec())
        ));
        assert!(verifier.verify(
            &s.artifact(),
            &s.signature,
            &PublicKey::from_hex(hex::encode(&uncompressed))
        ));
    }

    #[test]
    fn test_flipped_artifact_byte_fails() {
        let s = Setup::new();
        let key = PublicKey::from_pem(s.pem());
        let verifier = SignatureVerifier::new();

        for index in [0, ARTIFACT.len() / 2, ARTIFACT.len() - 1] {
            let mut tampered = ARTIFACT.to_vec();
            tampered[index] ^= 0x01;
            s.ctx.create_file_bytes("firmware.bin", &tampered);
            assert!(!verifier.verify(&s.artifact(), &s.signature, &key));
        }
    }

    #[test]
    fn test_flipped_signature_byte_fails() {
        let s = Setup::new();
        let key = PublicKey::from_pem(s.pem());
        let verifier = SignatureVerifier::new();
        let der = s.signature.as_bytes().to_vec();

        for index in 0..der.len() {
            let mut tampered = der.clone();
            tampered[index] ^= 0x01;
            let signature = FirmwareSignature::from_der(tampered);
            assert!(
                !verifier.verify(&s.artifact(), &signature, &key),
                "flipping signature byte {} verified",
                index
            );
        }
    }

    #[test]
    fn test_flipped_key_byte_fails() {
        let s = Setup::new();
        let verifier = SignatureVerifier::new();
        let point = s.point(false);

        for index in [1, 20, 33, 64] {
            let mut tampered = point.clone();
            tampered[index] ^= 0x01;
            assert!(!verifier.verify(
                &s.artifact(),
                &s.signature,
                &PublicKey::from_point(tampered)
            ));
        }
    }

    #[test]
    fn test_malformed_inputs_fail_closed() {
        let s = Setup::new();
        let verifier = SignatureVerifier::new();
        let key = PublicKey::from_pem(s.pem());

        let short = FirmwareSignature::from_der(vec![0x30, 0x02, 0x01]);
        assert!(!verifier.verify(&s.artifact(), &short, &key));

        let bad_hex = PublicKey::from_hex("04zz");
        assert!(!verifier.verify(&s.artifact(), &s.signature, &bad_hex));

        let wrong_length = PublicKey::from_point(vec![0x04; 40]);
        assert!(!verifier.verify(&s.artifact(), &s.signature, &wrong_length));

        let missing = s.ctx.path("missing.bin");
        assert!(!verifier.verify(&missing, &s.signature, &key));
        let err = verifier.check(&missing, &s.signature, &key).unwrap_err();
        assert!(matches!(err, ProvisionError::Validation(_)));
    }

    #[test]
    fn test_wrong_curve_key_fails_closed() {
        let s = Setup::new();
        let verifier = SignatureVerifier::new();

        // prime256v1 SubjectPublicKeyInfo wrapping the same point bytes
        let mut der = vec![
            0x30, 0x59, 0x30, 0x13, 0x06, 0x07, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x02, 0x01, 0x06,
            0x08, 0x2a, 0x86, 0x48, 0xce, 0x3d, 0x03, 0x01, 0x07, 0x03, 0x42, 0x00,
        ];
        der.extend_from_slice(&s.point(false));
        let p256_pem = pem::encode(&pem::Pem::new("PUBLIC KEY", der));

        assert!(!verifier.verify(&s.artifact(), &s.signature, &PublicKey::from_pem(p256_pem)));
    }

    #[test]
    fn test_oversized_artifact_fails_closed() {
        let s = Setup::new();
        let verifier = SignatureVerifier::new().with_max_artifact_size(8);
        let err = verifier
            .check(&s.artifact(), &s.signature, &PublicKey::from_pem(s.pem()))
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Verification(_)));
    }

    #[test]
    fn test_load_sidecars_from_disk() {
        let s = Setup::new();
        let sig_path = s.ctx.create_file_bytes("firmware.bin.sig", s.signature.as_bytes());
        let pem_path = s.ctx.create_file("firmware.bin.pem", &s.pem());

        let signature = FirmwareSignature::load(&sig_path).unwrap();
        let key = PublicKey::load(&pem_path).unwrap();
        assert!(SignatureVerifier::new().verify(&s.artifact(), &signature, &key));
    }
}
