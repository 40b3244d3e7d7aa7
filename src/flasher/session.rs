//! Per-invocation flash/wipe state.

use std::path::PathBuf;

use serde::Serialize;

use super::port::CandidatePort;
use super::programmer::{ProgrammerInvocation, ProgressEvent};
use crate::config::{validate_baudrate, Device, WIPE_BAUDRATE};
use crate::error::ProvisionResult;
use crate::verify::hash::ensure_exists;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionMode {
    Flash,
    Wipe,
}

/// State of one flash or wipe run. Owned by the driver that created it.
#[derive(Debug, Clone, Serialize)]
pub struct FlashSession {
    pub mode: SessionMode,
    pub device: Device,
    /// Firmware image; `None` for wipe.
    pub firmware: Option<PathBuf>,
    pub baudrate: u32,
    pub board: String,
    pub usb_filter: u16,
    /// Port the last attempt ran on.
    pub port: Option<CandidatePort>,
    pub done: bool,
}

impl FlashSession {
    /// Prepare a flash. The firmware must exist and the baudrate must be one
    /// of the allowed values; both are checked before any device I/O.
    pub fn flash(firmware: impl Into<PathBuf>, device: Device, baudrate: u32) -> ProvisionResult<Self> {
        let firmware = firmware.into();
        ensure_exists(&firmware)?;
        let baudrate = validate_baudrate(baudrate)?;

        Ok(Self {
            mode: SessionMode::Flash,
            device,
            firmware: Some(firmware),
            baudrate,
            board: device.board().to_string(),
            usb_filter: device.usb_filter(),
            port: None,
            done: false,
        })
    }

    /// Prepare a full-chip erase at the fixed wipe baudrate.
    pub fn wipe(device: Device) -> Self {
        Self {
            mode: SessionMode::Wipe,
            device,
            firmware: None,
            baudrate: WIPE_BAUDRATE,
            board: device.board().to_string(),
            usb_filter: device.usb_filter(),
            port: None,
            done: false,
        }
    }

    pub fn is_erase(&self) -> bool {
        self.mode == SessionMode::Wipe
    }

    /// Build the programmer invocation for `dev`.
    pub fn invocation<'a>(
        &self,
        dev: &str,
        callback: &'a mut dyn FnMut(ProgressEvent),
    ) -> ProgrammerInvocation<'a> {
        ProgrammerInvocation {
            terminal: false,
            dev: dev.to_string(),
            baudrate: self.baudrate,
            board: self.board.clone(),
            file: self.firmware.clone(),
            erase: self.is_erase(),
            callback,
        }
    }
}
