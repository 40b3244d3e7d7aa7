//! Download and verification commands.
//!
//! Both are blocking operations; these wrappers move them onto a blocking
//! task for async callers. A release is only extracted and cached once its
//! hash sidecar and signature check out.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{info, warn};

use super::task_failed;
use crate::cache::{ArtifactCache, CachedRelease};
use crate::config::Device;
use crate::download::StreamingDownloader;
use crate::error::{ProvisionError, ProvisionResult};
use crate::release::{device_firmware, unzip_release};
use crate::verify::hash::{sidecar_path, verify_sha256_sidecar, FirmwareArtifact};
use crate::verify::signature::{FirmwareSignature, PublicKey, SignatureVerifier};

/// Download `url` into `dest_dir`.
pub async fn download_firmware<F>(
    downloader: StreamingDownloader,
    url: String,
    dest_dir: PathBuf,
    chunk_size: usize,
    on_progress: F,
) -> ProvisionResult<FirmwareArtifact>
where
    F: FnMut(u64, Option<u64>) + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        downloader.download_to_file(&url, &dest_dir, chunk_size, on_progress)
    })
    .await
    .map_err(|e| task_failed("download", e))?
}

/// Where a release archive comes from and who must have signed it.
#[derive(Debug, Clone)]
pub struct ReleaseSource {
    pub version: String,
    /// Archive URL; `<url>.sha256.txt` and `<url>.sig` sit next to it.
    pub url: String,
    pub public_key: PublicKey,
}

/// Download, verify and extract a release, reusing the cached copy when its
/// archive still hashes to the recorded digest.
///
/// The archive's `.sha256.txt` and `.sig` are fetched alongside it. Nothing
/// is extracted or cached unless both match; on a mismatch the downloaded
/// files are removed again.
pub async fn download_release<F>(
    downloader: StreamingDownloader,
    cache: ArtifactCache,
    source: ReleaseSource,
    resources_dir: PathBuf,
    chunk_size: usize,
    on_progress: F,
) -> ProvisionResult<CachedRelease>
where
    F: FnMut(u64, Option<u64>) + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let version = &source.version;
        if let Some(cached) = cache.get_entry(version)? {
            if cache.verify_hash(version)? && PathBuf::from(&cached.extracted_path).exists() {
                info!(target: "cache", "Using cached release {}", version);
                return Ok(cached);
            }
        }

        let artifact =
            downloader.download_to_file(&source.url, &resources_dir, chunk_size, on_progress)?;
        let sidecar = sidecar_path(&artifact.path);
        let signature = signature_path(&artifact.path);

        let checked = fetch_and_check(&downloader, &source, &artifact, &resources_dir, chunk_size);
        if let Err(e) = checked {
            for path in [&artifact.path, &sidecar, &signature] {
                discard(path);
            }
            return Err(e);
        }

        let extracted = resources_dir.join(version);
        unzip_release(&artifact.path, &extracted)?;

        let release = CachedRelease::from_artifact(version, &artifact, &extracted);
        cache.update_entry(release.clone())?;
        Ok(release)
    })
    .await
    .map_err(|e| task_failed("download", e))?
}

fn fetch_and_check(
    downloader: &StreamingDownloader,
    source: &ReleaseSource,
    artifact: &FirmwareArtifact,
    resources_dir: &Path,
    chunk_size: usize,
) -> ProvisionResult<()> {
    let sidecar = downloader.download_to_file(
        &format!("{}.sha256.txt", source.url),
        resources_dir,
        chunk_size,
        |_, _| {},
    )?;
    let signature = downloader.download_to_file(
        &format!("{}.sig", source.url),
        resources_dir,
        chunk_size,
        |_, _| {},
    )?;

    verify_sha256_sidecar(&artifact.path, &sidecar.path)?;
    SignatureVerifier::new().check(
        &artifact.path,
        &FirmwareSignature::load(&signature.path)?,
        &source.public_key,
    )
}

fn signature_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".sig");
    PathBuf::from(name)
}

fn discard(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!(target: "cache", "Removed unverified {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(target: "cache", "Failed to remove {}: {}", path.display(), e),
    }
}

/// Firmware image for `device` from a downloaded release. The cached archive
/// must still hash to the digest recorded when it was verified.
pub fn release_firmware(
    cache: &ArtifactCache,
    version: &str,
    device: Device,
) -> ProvisionResult<PathBuf> {
    let release = cache
        .get_entry(version)?
        .ok_or_else(|| ProvisionError::validation(format!("Release {} is not downloaded", version)))?;

    if !cache.verify_hash(version)? {
        return Err(ProvisionError::Verification(format!(
            "Cached release {} no longer matches its recorded hash",
            version
        )));
    }

    device_firmware(Path::new(&release.extracted_path), device)
}

/// Check an artifact against its `.sha256.txt` sidecar (when present) and
/// its detached signature. Any failure blocks flashing.
pub async fn verify_firmware(
    artifact: PathBuf,
    signature: PathBuf,
    public_key: PathBuf,
) -> ProvisionResult<FirmwareArtifact> {
    tokio::task::spawn_blocking(move || {
        let artifact = FirmwareArtifact::open(&artifact)?;

        let sidecar = sidecar_path(&artifact.path);
        if sidecar.exists() {
            verify_sha256_sidecar(&artifact.path, &sidecar)?;
        }

        let signature = FirmwareSignature::load(&signature)?;
        let key = PublicKey::load(&public_key)?;
        SignatureVerifier::new().check(&artifact.path, &signature, &key)?;
        Ok(artifact)
    })
    .await
    .map_err(|e| task_failed("verification", e))?
}
