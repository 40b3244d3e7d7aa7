//! Release archives: extraction and locating a device's firmware image.
//!
//! A release zip holds one top-level folder (`krux-v24.03.0/`) containing a
//! `maixpy_<device>/kboot.kfpkg` per supported device.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::config::Device;
use crate::error::{ProvisionError, ProvisionResult};
use crate::verify::hash::ensure_exists;

/// Firmware image name inside each device folder.
pub const FIRMWARE_IMAGE: &str = "kboot.kfpkg";

/// Extract `zip_path` into `extract_to`, returning the number of files written.
///
/// Entries whose names would escape `extract_to` are skipped.
pub fn unzip_release(zip_path: &Path, extract_to: &Path) -> ProvisionResult<usize> {
    ensure_exists(zip_path)?;
    let file = fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    fs::create_dir_all(extract_to)?;

    let mut written = 0;
    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;

        let outpath = match file.enclosed_name() {
            Some(path) => extract_to.join(path),
            None => {
                debug!(target: "release", "Skipping unsafe entry {}", file.name());
                continue;
            }
        };

        if file.name().ends_with('/') {
            fs::create_dir_all(&outpath)?;
        } else {
            if let Some(p) = outpath.parent() {
                fs::create_dir_all(p)?;
            }
            let mut outfile = fs::File::create(&outpath)?;
            std::io::copy(&mut file, &mut outfile)?;
            written += 1;
        }
    }

    info!(
        target: "release",
        "Extracted {} files from {} into {}",
        written,
        zip_path.display(),
        extract_to.display()
    );
    Ok(written)
}

/// Locate `maixpy_<device>/kboot.kfpkg` under `root`, either directly or
/// inside the release's single top-level folder.
pub fn device_firmware(root: &Path, device: Device) -> ProvisionResult<PathBuf> {
    let relative = Path::new(&device.firmware_dir()).join(FIRMWARE_IMAGE);

    let direct = root.join(&relative);
    if direct.is_file() {
        return Ok(direct);
    }

    if root.is_dir() {
        let mut children: Vec<PathBuf> = fs::read_dir(root)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_dir())
            .collect();
        children.sort();

        for child in children {
            let candidate = child.join(&relative);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
    }

    Err(ProvisionError::validation(format!(
        "File do not exist: {}",
        direct.display()
    )))
}
