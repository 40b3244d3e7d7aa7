//! Index of downloaded firmware releases.
//!
//! The index lives in `firmware_cache.json` next to the downloads and maps a
//! release version to where its archive and extracted tree are stored.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use crate::error::ProvisionResult;
use crate::verify::hash::{calculate_sha256, FirmwareArtifact};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRelease {
    pub version: String,
    pub sha256_hash: String,
    pub zip_path: String,
    pub extracted_path: String,
    /// RFC 3339 timestamp.
    pub downloaded_at: String,
    pub file_size: u64,
}

impl CachedRelease {
    /// Entry for a freshly downloaded archive, stamped with the current time.
    pub fn from_artifact(version: &str, artifact: &FirmwareArtifact, extracted: &Path) -> Self {
        Self {
            version: version.to_string(),
            sha256_hash: artifact.sha256.clone(),
            zip_path: artifact.path.to_string_lossy().to_string(),
            extracted_path: extracted.to_string_lossy().to_string(),
            downloaded_at: chrono::Utc::now().to_rfc3339(),
            file_size: artifact.size,
        }
    }
}

pub type ReleaseCacheIndex = HashMap<String, CachedRelease>;

pub struct ArtifactCache {
    cache_file_path: PathBuf,
}

impl ArtifactCache {
    pub fn new(cache_dir: &Path) -> Self {
        Self {
            cache_file_path: cache_dir.join("firmware_cache.json"),
        }
    }

    /// Load the cache index from disk
    pub fn load_index(&self) -> ProvisionResult<ReleaseCacheIndex> {
        if !self.cache_file_path.exists() {
            return Ok(HashMap::new());
        }

        let contents = fs::read_to_string(&self.cache_file_path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Save the cache index to disk
    pub fn save_index(&self, index: &ReleaseCacheIndex) -> ProvisionResult<()> {
        let contents = serde_json::to_string_pretty(index)?;

        if let Some(parent) = self.cache_file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&self.cache_file_path, contents)?;
        debug!(target: "cache", "Wrote {} entries", index.len());
        Ok(())
    }

    /// Add or update a release entry
    pub fn update_entry(&self, release: CachedRelease) -> ProvisionResult<()> {
        let mut index = self.load_index()?;
        info!(target: "cache", "Caching {} ({})", release.version, release.sha256_hash);
        index.insert(release.version.clone(), release);
        self.save_index(&index)
    }

    pub fn remove_entry(&self, version: &str) -> ProvisionResult<()> {
        let mut index = self.load_index()?;
        index.remove(version);
        self.save_index(&index)
    }

    pub fn get_entry(&self, version: &str) -> ProvisionResult<Option<CachedRelease>> {
        let index = self.load_index()?;
        Ok(index.get(version).cloned())
    }

    pub fn clear_index(&self) -> ProvisionResult<()> {
        self.save_index(&HashMap::new())
    }

    /// Versions whose archive or extracted tree has disappeared, sorted.
    pub fn verify_cache_integrity(&self) -> ProvisionResult<Vec<String>> {
        let index = self.load_index()?;
        let mut missing_versions: Vec<String> = index
            .iter()
            .filter(|(_, release)| {
                !Path::new(&release.zip_path).exists()
                    || !Path::new(&release.extracted_path).exists()
            })
            .map(|(version, _)| version.clone())
            .collect();
        missing_versions.sort();

        for version in &missing_versions {
            warn!(target: "cache", "Cached release {} is incomplete", version);
        }
        Ok(missing_versions)
    }

    /// Re-hash a cached archive and compare with the recorded digest.
    pub fn verify_hash(&self, version: &str) -> ProvisionResult<bool> {
        match self.get_entry(version)? {
            Some(release) => {
                let zip_path = Path::new(&release.zip_path);
                if !zip_path.exists() {
                    return Ok(false);
                }
                Ok(calculate_sha256(zip_path)? == release.sha256_hash)
            }
            None => Ok(false),
        }
    }

    /// Drop incomplete or tampered entries, returning their versions.
    pub fn prune(&self) -> ProvisionResult<Vec<String>> {
        let mut removed = self.verify_cache_integrity()?;
        let mut index = self.load_index()?;

        let mut versions: Vec<String> = index.keys().cloned().collect();
        versions.sort();
        for version in versions {
            if !removed.contains(&version) && !self.verify_hash(&version)? {
                warn!(target: "cache", "Cached release {} failed hash check", version);
                removed.push(version);
            }
        }

        for version in &removed {
            index.remove(version);
        }
        if !removed.is_empty() {
            self.save_index(&index)?;
        }
        Ok(removed)
    }
}
