//! Flashing a firmware image.

use std::path::PathBuf;

use log::info;

use super::driver::FlasherBackend;
use super::port::CandidatePort;
use super::programmer::{ProgressCallback, ProgressEvent};
use super::session::FlashSession;
use crate::config::Device;
use crate::error::ProvisionResult;

/// Drives one flash session. Construction validates the inputs; [`run`]
/// does the device I/O and consumes the driver, so a driver never runs
/// more than one session.
///
/// [`run`]: FlashDriver::run
pub struct FlashDriver {
    backend: FlasherBackend,
    session: FlashSession,
    callback: ProgressCallback,
}

impl FlashDriver {
    pub fn new(
        backend: FlasherBackend,
        firmware: impl Into<PathBuf>,
        device: Device,
        baudrate: u32,
        callback: ProgressCallback,
    ) -> ProvisionResult<Self> {
        let session = FlashSession::flash(firmware, device, baudrate)?;
        Ok(Self {
            backend,
            session,
            callback,
        })
    }

    pub fn session(&self) -> &FlashSession {
        &self.session
    }

    /// Flash the firmware, blocking until the programmer finishes.
    pub fn run(mut self) -> ProvisionResult<CandidatePort> {
        if let Some(firmware) = &self.session.firmware {
            info!(
                target: "flasher",
                "Flashing {} onto {} ({})",
                firmware.display(),
                self.session.device,
                self.session.board
            );
        }

        let callback = &mut self.callback;
        let mut sink = |event: ProgressEvent| callback(event);
        self.backend.run_session("Flash", &mut self.session, &mut sink)
    }
}
