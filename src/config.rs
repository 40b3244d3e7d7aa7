//! Configuration constants and device profiles for provisioning.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProvisionError, ProvisionResult};

// ============================================================================
// USB Device Identifiers
// ============================================================================

/// FTDI USB Vendor ID, used by M5StickV, Amigo, Bit and Cube boards.
pub const FTDI_VENDOR_ID: u16 = 0x0403;

/// WCH CH340 product ID, used by the Dock, Yahboom and WonderMV bridges.
pub const CH340_PRODUCT_ID: u16 = 0x7523;

// ============================================================================
// Serial Communication
// ============================================================================

/// Baud rates accepted by the K210 bootloader programmer.
pub const VALID_BAUDRATES: &[u32] = &[
    9_600, 19_200, 28_800, 38_400, 57_600, 76_800, 115_200, 230_400, 460_800, 576_000, 921_600,
    1_500_000,
];

/// Baud rate used for flashing when none is configured.
pub const DEFAULT_BAUDRATE: u32 = 1_500_000;

/// Baud rate used for full-chip erase.
pub const WIPE_BAUDRATE: u32 = 1_500_000;

/// Timeout for the lightweight "is this port alive" open.
pub const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// A session never tries more candidate ports than this.
pub const MAX_PORT_ATTEMPTS: usize = 2;

// ============================================================================
// Download & Verification
// ============================================================================

/// Fixed request timeout for firmware downloads.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Default streaming chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;

/// Upper bound on artifact size loaded into memory for verification.
pub const MAX_ARTIFACT_SIZE: u64 = 64 * 1024 * 1024;

/// secp256k1 key that signs official Krux release archives.
pub const RELEASE_PUBLIC_KEY: &str = "-----BEGIN PUBLIC KEY-----
MFYwEAYHKoZIzj0CAQYFK4EEAAoDQgAEax27s943R8m9u/80/soZST64+JGLyckJ
XiyFGjKuWRkpLJzCGPW40sbXZcMOSvPBvCU2vs8Hkyfyhy4lSbySfA==
-----END PUBLIC KEY-----
";

/// Default name of the external programmer executable.
pub const DEFAULT_KTOOL: &str = "ktool";

// ============================================================================
// Device Profiles
// ============================================================================

/// Supported signing devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    M5stickv,
    Amigo,
    Bit,
    Cube,
    Dock,
    Yahboom,
    WonderMv,
}

impl Device {
    pub const ALL: &'static [Device] = &[
        Device::M5stickv,
        Device::Amigo,
        Device::Bit,
        Device::Cube,
        Device::Dock,
        Device::Yahboom,
        Device::WonderMv,
    ];

    /// Short name as used in release folders (`maixpy_<name>`).
    pub fn name(&self) -> &'static str {
        match self {
            Device::M5stickv => "m5stickv",
            Device::Amigo => "amigo",
            Device::Bit => "bit",
            Device::Cube => "cube",
            Device::Dock => "dock",
            Device::Yahboom => "yahboom",
            Device::WonderMv => "wonder_mv",
        }
    }

    /// Board identifier selecting the programmer's device profile.
    pub fn board(&self) -> &'static str {
        match self {
            Device::Dock => "dan",
            _ => "goE",
        }
    }

    /// USB identifier used to filter serial port enumeration.
    pub fn usb_filter(&self) -> u16 {
        match self {
            Device::Dock | Device::Yahboom | Device::WonderMv => CH340_PRODUCT_ID,
            _ => FTDI_VENDOR_ID,
        }
    }

    /// Release folder holding this device's firmware.
    pub fn firmware_dir(&self) -> String {
        format!("maixpy_{}", self.name())
    }

    /// Derive the device from a firmware path containing a `maixpy_<device>`
    /// component, e.g. `krux-v24.03.0/maixpy_amigo/kboot.kfpkg`.
    pub fn from_firmware_path(path: &Path) -> Option<Device> {
        path.components()
            .filter_map(|c| c.as_os_str().to_str())
            .filter_map(|c| c.strip_prefix("maixpy_"))
            .find_map(|name| name.parse().ok())
    }
}

impl FromStr for Device {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix("maixpy_").unwrap_or(s);
        Device::ALL
            .iter()
            .copied()
            .find(|d| d.name() == name)
            .ok_or_else(|| ProvisionError::validation(format!("Invalid device: {}", s)))
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Check a baudrate against the allowed set.
pub fn validate_baudrate(baudrate: u32) -> ProvisionResult<u32> {
    if VALID_BAUDRATES.contains(&baudrate) {
        Ok(baudrate)
    } else {
        Err(ProvisionError::validation(format!(
            "Invalid baudrate: {}",
            baudrate
        )))
    }
}

/// Format a USB filter the way port listings print it (4 lowercase hex digits).
pub fn format_usb_filter(id: u16) -> String {
    format!("{:04x}", id)
}
