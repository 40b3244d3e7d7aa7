//! Serial port discovery and liveness probing for K210 boards.
//!
//! Boards show up as USB serial bridges (FTDI or CH340). A board exposing two
//! interfaces enumerates twice, which is why the resolver may need a second
//! candidate.

use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};
use serialport::{available_ports, SerialPortType};

#[cfg(test)]
use mockall::automock;

use crate::config::{format_usb_filter, PORT_PROBE_TIMEOUT};
use crate::error::ProvisionResult;

/// A serial port that may host the target board.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidatePort {
    /// OS device path (e.g. "/dev/ttyUSB0" or "COM3").
    pub device: String,
    /// USB Vendor ID, if the port is USB.
    pub vid: Option<u16>,
    /// USB Product ID, if the port is USB.
    pub pid: Option<u16>,
    pub serial_number: Option<String>,
    pub product: Option<String>,
    pub manufacturer: Option<String>,
}

impl CandidatePort {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            vid: None,
            pid: None,
            serial_number: None,
            product: None,
            manufacturer: None,
        }
    }

    /// Whether the USB identifier appears in this port's hardware id, as
    /// either vendor or product.
    pub fn matches(&self, usb_id: u16) -> bool {
        self.vid == Some(usb_id) || self.pid == Some(usb_id)
    }

    /// Hardware id in the usual `USB VID:PID=xxxx:yyyy SER=...` shape.
    pub fn hwid(&self) -> String {
        match (self.vid, self.pid) {
            (Some(vid), Some(pid)) => {
                let mut id = format!(
                    "USB VID:PID={}:{}",
                    format_usb_filter(vid),
                    format_usb_filter(pid)
                );
                if let Some(serial) = &self.serial_number {
                    id.push_str(" SER=");
                    id.push_str(serial);
                }
                id
            }
            _ => "n/a".to_string(),
        }
    }

    /// Get a display label for this port.
    pub fn display_label(&self) -> String {
        match &self.product {
            Some(product) => format!("{} ({})", product, self.device),
            None => self.device.clone(),
        }
    }
}

/// Lists candidate ports matching a USB identifier, in enumeration order.
#[cfg_attr(test, automock)]
pub trait PortEnumerator: Send + Sync {
    fn list(&self, usb_id: u16) -> ProvisionResult<Vec<CandidatePort>>;
}

/// Checks whether a port can currently be opened.
#[cfg_attr(test, automock)]
pub trait PortProbe: Send + Sync {
    fn is_port_working(&self, device: &str) -> bool;
}

/// Enumerates ports through the `serialport` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortEnumerator;

impl PortEnumerator for SerialPortEnumerator {
    fn list(&self, usb_id: u16) -> ProvisionResult<Vec<CandidatePort>> {
        let ports: Vec<CandidatePort> = list_usb_ports()?
            .into_iter()
            .filter(|port| port.matches(usb_id))
            .collect();

        debug!(
            target: "port_resolver",
            "{} port(s) match {}",
            ports.len(),
            format_usb_filter(usb_id)
        );
        Ok(ports)
    }
}

/// All USB serial ports currently attached.
///
/// On macOS, `tty.*` duplicates of `cu.*` devices are skipped.
pub fn list_usb_ports() -> ProvisionResult<Vec<CandidatePort>> {
    let mut ports = Vec::new();

    for port in available_ports()? {
        #[cfg(target_os = "macos")]
        if port.port_name.contains("/dev/tty.") {
            continue;
        }

        if let SerialPortType::UsbPort(usb_info) = &port.port_type {
            ports.push(CandidatePort {
                device: port.port_name.clone(),
                vid: Some(usb_info.vid),
                pid: Some(usb_info.pid),
                serial_number: usb_info.serial_number.clone(),
                product: usb_info.product.clone(),
                manufacturer: usb_info.manufacturer.clone(),
            });
        }
    }

    Ok(ports)
}

/// Probes a port by opening it briefly.
#[derive(Debug, Clone, Copy)]
pub struct SerialPortProbe {
    timeout: Duration,
}

impl Default for SerialPortProbe {
    fn default() -> Self {
        Self {
            timeout: PORT_PROBE_TIMEOUT,
        }
    }
}

impl PortProbe for SerialPortProbe {
    fn is_port_working(&self, device: &str) -> bool {
        match serialport::new(device, 115_200).timeout(self.timeout).open() {
            Ok(_) => true,
            Err(e) => {
                debug!(target: "port_resolver", "Probe of {} failed: {}", device, e);
                false
            }
        }
    }
}
