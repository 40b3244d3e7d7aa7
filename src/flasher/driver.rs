//! Shared machinery behind the flash and wipe drivers.

use std::path::Path;

use log::{error, info};

use super::port::{CandidatePort, PortEnumerator, PortProbe, SerialPortEnumerator, SerialPortProbe};
use super::programmer::{KtoolProgrammer, Programmer, ProgressEvent};
use super::resolver::PortResolver;
use super::session::FlashSession;
use crate::error::{ProvisionError, ProvisionResult};

/// The collaborators a driver talks to: port discovery, liveness probe and
/// the programmer primitive.
pub struct FlasherBackend {
    enumerator: Box<dyn PortEnumerator>,
    probe: Box<dyn PortProbe>,
    programmer: Box<dyn Programmer>,
}

impl FlasherBackend {
    pub fn new(
        enumerator: Box<dyn PortEnumerator>,
        probe: Box<dyn PortProbe>,
        programmer: Box<dyn Programmer>,
    ) -> Self {
        Self {
            enumerator,
            probe,
            programmer,
        }
    }

    /// Real serial ports and the `ktool` at `ktool_path`.
    pub fn system(ktool_path: &Path) -> Self {
        Self::new(
            Box::new(SerialPortEnumerator),
            Box::new(SerialPortProbe::default()),
            Box::new(KtoolProgrammer::new(ktool_path)),
        )
    }

    /// Resolve a port for `session` and run the programmer on it.
    ///
    /// Output reaches `callback` with carriage returns stripped. The session
    /// is marked done whatever the outcome.
    pub(crate) fn run_session(
        &self,
        target: &str,
        session: &mut FlashSession,
        callback: &mut dyn FnMut(ProgressEvent),
    ) -> ProvisionResult<CandidatePort> {
        let resolver = PortResolver::new(self.enumerator.as_ref(), self.probe.as_ref());
        let programmer = self.programmer.as_ref();
        let mut forward = |event: ProgressEvent| callback(event.normalized());

        let result = {
            let session = &*session;
            resolver.resolve(session.usb_filter, &mut forward, |port, sink| {
                info!(
                    target: "flasher",
                    "{} {} on {} at {} baud",
                    target,
                    session.device,
                    port.device,
                    session.baudrate
                );
                programmer
                    .program(session.invocation(&port.device, sink))
                    .map_err(|e| ProvisionError::transport(&port.device, e.reason))
            })
        };

        session.done = true;
        match &result {
            Ok(port) => {
                session.port = Some(port.clone());
                info!(target: "flasher", "{} finished on {}", target, port.device);
            }
            Err(e) => {
                session.port = None;
                error!(target: "flasher", "{} failed: {}", target, e);
            }
        }

        result
    }
}
