//! Listing candidate ports for a device.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::task_failed;
use crate::config::Device;
use crate::error::ProvisionResult;
use crate::flasher::port::{CandidatePort, PortEnumerator, SerialPortEnumerator};

/// Port information for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Serial port path.
    pub device: String,
    /// Display label; duplicates are numbered.
    pub label: String,
    pub hwid: String,
    pub serial_number: Option<String>,
}

impl From<CandidatePort> for PortInfo {
    fn from(port: CandidatePort) -> Self {
        Self {
            label: port
                .product
                .clone()
                .unwrap_or_else(|| "USB Serial".to_string()),
            hwid: port.hwid(),
            device: port.device,
            serial_number: port.serial_number,
        }
    }
}

/// Convert ports to display entries, numbering duplicate labels
/// (e.g. "Sipeed-Debug #1", "Sipeed-Debug #2").
pub fn label_ports(ports: Vec<CandidatePort>) -> Vec<PortInfo> {
    let mut infos: Vec<PortInfo> = ports.into_iter().map(PortInfo::from).collect();

    let mut label_counts: HashMap<String, usize> = HashMap::new();
    for info in &infos {
        *label_counts.entry(info.label.clone()).or_insert(0) += 1;
    }

    let mut label_indices: HashMap<String, usize> = HashMap::new();
    for info in &mut infos {
        if let Some(&count) = label_counts.get(&info.label) {
            if count > 1 {
                let index = label_indices.entry(info.label.clone()).or_insert(0);
                *index += 1;
                info.label = format!("{} #{}", info.label, index);
            }
        }
    }

    infos
}

/// Detect the ports a device could be flashed through.
pub async fn detect_ports(device: Device) -> ProvisionResult<Vec<PortInfo>> {
    detect_ports_with(Box::new(SerialPortEnumerator), device).await
}

pub async fn detect_ports_with(
    enumerator: Box<dyn PortEnumerator>,
    device: Device,
) -> ProvisionResult<Vec<PortInfo>> {
    let ports = tokio::task::spawn_blocking(move || enumerator.list(device.usb_filter()))
        .await
        .map_err(|e| task_failed("port detection", e))??;

    Ok(label_ports(ports))
}
