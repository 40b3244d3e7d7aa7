//! Full-chip erase.

use log::info;

use super::driver::FlasherBackend;
use super::port::CandidatePort;
use super::programmer::{ProgressCallback, ProgressEvent};
use super::session::FlashSession;
use crate::config::Device;
use crate::error::ProvisionResult;

/// Drives one wipe session at the fixed erase baudrate.
pub struct WipeDriver {
    backend: FlasherBackend,
    session: FlashSession,
    callback: ProgressCallback,
}

impl WipeDriver {
    pub fn new(backend: FlasherBackend, device: Device, callback: ProgressCallback) -> Self {
        Self {
            backend,
            session: FlashSession::wipe(device),
            callback,
        }
    }

    pub fn session(&self) -> &FlashSession {
        &self.session
    }

    /// Erase the device, blocking until the programmer finishes.
    pub fn run(mut self) -> ProvisionResult<CandidatePort> {
        info!(
            target: "wiper",
            "Wiping {} ({}) at {} baud",
            self.session.device,
            self.session.board,
            self.session.baudrate
        );

        let callback = &mut self.callback;
        let mut sink = |event: ProgressEvent| callback(event);
        self.backend.run_session("Wipe", &mut self.session, &mut sink)
    }
}
